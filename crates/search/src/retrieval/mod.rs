//! Passage retrieval over free-text reviews
//!
//! Provides:
//! - `VectorIndex` trait over similarity-search backends
//! - pgvector backend (Postgres + jsonb metadata)
//! - In-process backend (tests, local development)
//! - `SemanticRetriever` building metadata filters per sub-question

mod memory;
mod pgvector;
mod semantic;

pub use memory::InMemoryIndex;
pub use pgvector::PgVectorIndex;
pub use semantic::SemanticRetriever;

use coursewise_common::errors::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata field holding the course name of a passage
pub const COURSE_FIELD: &str = "course_name";

/// Metadata field holding the lecturer name of a passage
pub const LECTURER_FIELD: &str = "lecturer";

/// One indexed review passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,

    pub content: String,

    /// Free-form metadata (course_name, lecturer, rank, date, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Passage {
    /// Metadata value rendered as text, for predicate matching
    pub fn field(&self, name: &str) -> Option<String> {
        self.metadata.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Passage with similarity score (higher is closer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    #[serde(flatten)]
    pub passage: Passage,

    pub score: f32,
}

/// Single metadata predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { field: String, value: String },
    In { field: String, values: Vec<String> },
}

impl Predicate {
    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq { field, .. } | Predicate::In { field, .. } => field.as_str(),
        }
    }

    pub fn matches(&self, passage: &Passage) -> bool {
        let Some(actual) = passage.field(self.field()) else {
            return false;
        };
        match self {
            Predicate::Eq { value, .. } => actual == *value,
            Predicate::In { values, .. } => values.iter().any(|v| *v == actual),
        }
    }
}

/// Conjunction of predicates; empty means unfiltered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub predicates: Vec<Predicate>,
}

impl MetadataFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn matches(&self, passage: &Passage) -> bool {
        self.predicates.iter().all(|p| p.matches(passage))
    }
}

/// Similarity index over review passages
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-`k` passages closest to `text` among those matching `filter`
    async fn search(&self, text: &str, k: usize, filter: &MetadataFilter) -> Result<Vec<ScoredPassage>>;

    /// All passages matching `filter`, in index order
    async fn fetch_by_filter(&self, filter: &MetadataFilter) -> Result<Vec<Passage>>;

    /// Backend name
    fn backend(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn passage(course: &str, lecturer: &str) -> Passage {
        let mut metadata = Map::new();
        metadata.insert(COURSE_FIELD.into(), json!(course));
        metadata.insert(LECTURER_FIELD.into(), json!(lecturer));
        metadata.insert("rank".into(), json!(4));
        Passage {
            id: "1".into(),
            content: "great course".into(),
            metadata,
        }
    }

    #[test]
    fn test_conjunctive_filter() {
        let p = passage("Algorithms", "Dana");

        assert!(MetadataFilter::none().matches(&p));
        assert!(MetadataFilter::all(vec![
            Predicate::equals(COURSE_FIELD, "Algorithms"),
            Predicate::equals(LECTURER_FIELD, "Dana"),
        ])
        .matches(&p));
        assert!(!MetadataFilter::all(vec![
            Predicate::equals(COURSE_FIELD, "Algorithms"),
            Predicate::equals(LECTURER_FIELD, "Noga"),
        ])
        .matches(&p));
    }

    #[test]
    fn test_in_predicate_and_non_string_fields() {
        let p = passage("Algorithms", "Dana");
        let within = Predicate::In {
            field: LECTURER_FIELD.into(),
            values: vec!["Noga".into(), "Dana".into()],
        };
        assert!(within.matches(&p));
        assert!(Predicate::equals("rank", "4").matches(&p));
        assert!(!Predicate::equals("missing", "x").matches(&p));
    }
}
