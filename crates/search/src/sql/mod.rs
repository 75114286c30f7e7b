//! Structured path: read-only SQL over tabular grade data
//!
//! - `SqlGenerator`: language model turns a sub-question into one SELECT
//! - `validator`: independent checks of the generated text
//! - `SqlExecutor`: mechanical SELECT gate, then execution

mod executor;
mod generator;
pub mod validator;

pub use executor::{MockStore, PgStore, RelationalStore, SqlExecutor};
pub use generator::SqlGenerator;

use coursewise_common::catalog::TableDescriptor;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

/// One result row as ordered field/value pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(f, _)| f == name).map(|(_, v)| v)
    }
}

// Serialised as a JSON object in column order
impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (field, value) in &self.fields {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

/// Result of the contract checks on generated SQL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum SafetyClass {
    Safe,
    Rejected { reason: String },
}

/// Generated query bound to its table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredQueryPlan {
    pub table: String,
    pub query: String,
    pub safety: SafetyClass,
}

impl StructuredQueryPlan {
    /// Validate `query` against `descriptor` and the sub-question it answers
    pub fn new(subquery: &str, descriptor: &TableDescriptor, query: String) -> Self {
        let safety = validator::check(&query, subquery, descriptor);
        Self {
            table: descriptor.name.clone(),
            query,
            safety,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_serialises_in_column_order() {
        let row = Row::new(vec![
            ("year".into(), json!(2024)),
            ("course_name".into(), json!("Algorithms")),
            ("avg".into(), json!(81.5)),
        ]);
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"year":2024,"course_name":"Algorithms","avg":81.5}"#
        );
        assert_eq!(row.get("avg"), Some(&json!(81.5)));
    }
}
