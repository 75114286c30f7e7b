//! Static catalogs loaded once at startup
//!
//! - `SchemaCatalog`: table descriptors used to route and generate SQL
//! - `ExemplarCatalog`: labelled example questions for route classification
//!
//! Both embed their entries at load time and are immutable afterwards.
//! An empty catalog is valid; lookups against it return `None`.

use crate::embeddings::{cosine_similarity, Embedder};
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;

/// Retrieval route for a sub-question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    /// Generated read-only SQL against tabular grade data
    #[serde(rename = "sql", alias = "structured")]
    Structured,
    /// Similarity search over free-text reviews
    #[serde(rename = "semantic", alias = "unstructured")]
    Unstructured,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Structured => "structured",
            Route::Unstructured => "unstructured",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    #[serde(rename = "col", alias = "name")]
    pub name: String,

    pub description: String,

    /// The column already holds an aggregate (e.g. a per-exam average)
    #[serde(default)]
    pub pre_aggregated: bool,
}

/// Schema metadata for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    #[serde(rename = "table", alias = "table_name")]
    pub name: String,

    #[serde(rename = "type", alias = "table_type")]
    pub table_type: String,

    /// Natural-language purpose of the table
    #[serde(default)]
    pub description: String,

    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Render columns as `- name: description` lines for prompts
    pub fn columns_prompt(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("- {}: {}\n", c.name, c.description))
            .collect()
    }

    /// Text embedded for routing
    pub fn routing_text(&self) -> String {
        format!(
            "{} ({}): {}\nColumns:\n{}",
            self.name,
            self.table_type,
            self.description,
            self.columns_prompt()
        )
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A labelled example question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub text: String,
    pub route: Route,
}

/// Catalog entry with its embedding
#[derive(Debug, Clone)]
pub struct Embedded<T> {
    pub item: T,
    pub embedding: Vec<f32>,
}

/// Index and score of the closest embedding.
///
/// Ties keep the earliest entry, so the result is a pure function of the
/// catalog order and the query vector.
pub fn nearest<'a, I>(query: &[f32], candidates: I) -> Option<(usize, f32)>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut best: Option<(usize, f32)> = None;
    for (idx, candidate) in candidates.into_iter().enumerate() {
        let score = cosine_similarity(query, candidate);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((idx, score)),
        }
    }
    best
}

/// Table schema catalog
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: Vec<Embedded<TableDescriptor>>,
}

impl SchemaCatalog {
    /// Load descriptors from a JSON file and embed them
    pub async fn load(path: impl AsRef<Path>, embedder: &dyn Embedder) -> Result<Self> {
        let descriptors: Vec<TableDescriptor> = read_json(path.as_ref()).await?;
        let catalog = Self::from_descriptors(descriptors, embedder).await?;
        info!(tables = catalog.len(), "Schema catalog loaded");
        Ok(catalog)
    }

    pub async fn from_descriptors(
        descriptors: Vec<TableDescriptor>,
        embedder: &dyn Embedder,
    ) -> Result<Self> {
        let texts: Vec<String> = descriptors.iter().map(|d| d.routing_text()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts).await?
        };

        let tables = descriptors
            .into_iter()
            .zip(embeddings)
            .map(|(item, embedding)| Embedded { item, embedding })
            .collect();

        Ok(Self { tables })
    }

    pub fn entries(&self) -> &[Embedded<TableDescriptor>] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Labelled exemplar catalog
#[derive(Debug, Clone, Default)]
pub struct ExemplarCatalog {
    exemplars: Vec<Embedded<Exemplar>>,
}

impl ExemplarCatalog {
    /// Load exemplars from a JSON file and embed them
    pub async fn load(path: impl AsRef<Path>, embedder: &dyn Embedder) -> Result<Self> {
        let exemplars: Vec<Exemplar> = read_json(path.as_ref()).await?;
        let catalog = Self::from_exemplars(exemplars, embedder).await?;
        info!(exemplars = catalog.len(), "Exemplar catalog loaded");
        Ok(catalog)
    }

    pub async fn from_exemplars(exemplars: Vec<Exemplar>, embedder: &dyn Embedder) -> Result<Self> {
        let texts: Vec<String> = exemplars.iter().map(|e| e.text.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts).await?
        };

        let exemplars = exemplars
            .into_iter()
            .zip(embeddings)
            .map(|(item, embedding)| Embedded { item, embedding })
            .collect();

        Ok(Self { exemplars })
    }

    pub fn entries(&self) -> &[Embedded<Exemplar>] {
        &self.exemplars
    }

    pub fn len(&self) -> usize {
        self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| AppError::Configuration {
        message: format!("cannot read catalog {}: {}", path.display(), e),
    })?;
    serde_json::from_str(&raw).map_err(|e| AppError::Configuration {
        message: format!("invalid catalog {}: {}", path.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;

    const TABLES_JSON: &str = r#"[
        {
            "table": "grades",
            "type": "exam statistics",
            "description": "Average grade per course, lecturer, year and semester",
            "columns": [
                {"col": "course", "description": "official course name"},
                {"col": "lecture", "description": "lecturer name"},
                {"col": "year", "description": "academic year"},
                {"col": "avg", "description": "average exam grade", "pre_aggregated": true}
            ]
        }
    ]"#;

    #[test]
    fn test_descriptor_wire_format() {
        let tables: Vec<TableDescriptor> = serde_json::from_str(TABLES_JSON).unwrap();
        let grades = &tables[0];
        assert_eq!(grades.name, "grades");
        assert_eq!(grades.table_type, "exam statistics");
        assert!(grades.column("AVG").unwrap().pre_aggregated);
        assert!(!grades.column("year").unwrap().pre_aggregated);
        assert!(grades.columns_prompt().starts_with("- course: official course name\n"));
    }

    #[test]
    fn test_route_labels() {
        let exemplars: Vec<Exemplar> = serde_json::from_str(
            r#"[{"text": "average grade", "route": "sql"},
                {"text": "is the lecturer nice", "route": "semantic"}]"#,
        )
        .unwrap();
        assert_eq!(exemplars[0].route, Route::Structured);
        assert_eq!(exemplars[1].route, Route::Unstructured);
    }

    #[test]
    fn test_nearest_prefers_first_on_tie() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![0.0, 1.0];
        let found = nearest(&[1.0, 0.0], [a.as_slice(), b.as_slice(), c.as_slice()]);
        assert_eq!(found.map(|(i, _)| i), Some(0));
        assert_eq!(nearest(&[1.0, 0.0], std::iter::empty::<&[f32]>()), None);
    }

    #[tokio::test]
    async fn test_empty_catalog_is_valid() {
        let embedder = HashingEmbedder::new(64);
        let catalog = SchemaCatalog::from_descriptors(vec![], &embedder).await.unwrap();
        assert!(catalog.is_empty());
        let exemplars = ExemplarCatalog::from_exemplars(vec![], &embedder).await.unwrap();
        assert!(exemplars.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let embedder = HashingEmbedder::new(64);
        let err = SchemaCatalog::load("does/not/exist.json", &embedder).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }
}
