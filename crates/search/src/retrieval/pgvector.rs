//! Vector similarity search using pgvector
//!
//! Passages live in a table shaped like
//! `review_chunks(id, content, metadata jsonb, embedding vector)`.
//! Metadata predicates are rendered as bound `metadata->>'field'`
//! comparisons.

use super::{MetadataFilter, Passage, Predicate, ScoredPassage, VectorIndex};
use coursewise_common::db::DbPool;
use coursewise_common::embeddings::Embedder;
use coursewise_common::errors::{AppError, Result};
use sea_orm::{ConnectionTrait, DbBackend, QueryResult, Statement};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::debug;

/// Vector index backed by Postgres + pgvector
pub struct PgVectorIndex {
    db: Arc<DbPool>,
    embedder: Arc<dyn Embedder>,
    table: String,
}

impl PgVectorIndex {
    /// Create a new index over `table`
    pub fn new(db: Arc<DbPool>, embedder: Arc<dyn Embedder>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_plain_identifier(&table) {
            return Err(AppError::Configuration {
                message: format!("invalid passages table name '{}'", table),
            });
        }
        Ok(Self { db, embedder, table })
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// pgvector text literal for an embedding
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Render `filter` as a WHERE clause whose placeholders start at
/// `$first_param`. Returns an empty clause for an empty filter.
fn render_filter(filter: &MetadataFilter, first_param: usize) -> Result<(String, Vec<sea_orm::Value>)> {
    let mut clauses = Vec::with_capacity(filter.len());
    let mut values: Vec<sea_orm::Value> = Vec::new();

    for predicate in &filter.predicates {
        let field = predicate.field();
        if !is_plain_identifier(field) {
            return Err(AppError::Validation {
                message: format!("invalid metadata field '{}'", field),
                field: Some("filter".to_string()),
            });
        }

        match predicate {
            Predicate::Eq { value, .. } => {
                values.push(value.clone().into());
                clauses.push(format!("metadata->>'{}' = ${}", field, first_param + values.len() - 1));
            }
            Predicate::In { values: options, .. } if options.is_empty() => {
                clauses.push("FALSE".to_string());
            }
            Predicate::In { values: options, .. } => {
                let mut placeholders = Vec::with_capacity(options.len());
                for option in options {
                    values.push(option.clone().into());
                    placeholders.push(format!("${}", first_param + values.len() - 1));
                }
                clauses.push(format!("metadata->>'{}' IN ({})", field, placeholders.join(", ")));
            }
        }
    }

    if clauses.is_empty() {
        Ok((String::new(), values))
    } else {
        Ok((format!("WHERE {}", clauses.join(" AND ")), values))
    }
}

fn passage_from_row(row: &QueryResult) -> Result<Passage> {
    let metadata: JsonValue = row.try_get("", "metadata")?;
    let metadata = match metadata {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            return Err(AppError::Internal {
                message: format!("passage metadata is not an object: {}", other),
            })
        }
    };

    Ok(Passage {
        id: row.try_get("", "id")?,
        content: row.try_get("", "content")?,
        metadata,
    })
}

#[async_trait::async_trait]
impl VectorIndex for PgVectorIndex {
    async fn search(&self, text: &str, k: usize, filter: &MetadataFilter) -> Result<Vec<ScoredPassage>> {
        let embedding = self.embedder.embed(text).await?;

        // $1 = query vector, $2 = limit, filters from $3
        let (where_clause, filter_values) = render_filter(filter, 3)?;
        let sql = format!(
            r#"
            SELECT
                id::text AS id,
                content,
                metadata,
                1 - (embedding <=> $1::vector) AS score
            FROM {table}
            {where_clause}
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
            table = self.table,
            where_clause = where_clause,
        );

        let mut values: Vec<sea_orm::Value> = vec![vector_literal(&embedding).into(), (k as i64).into()];
        values.extend(filter_values);

        debug!(predicates = filter.len(), k = k, "pgvector search");
        let rows = self
            .db
            .read()
            .query_all(Statement::from_sql_and_values(DbBackend::Postgres, &sql, values))
            .await?;

        rows.iter()
            .map(|row| -> Result<ScoredPassage> {
                let score: f64 = row.try_get("", "score")?;
                Ok(ScoredPassage {
                    passage: passage_from_row(row)?,
                    score: score as f32,
                })
            })
            .collect()
    }

    async fn fetch_by_filter(&self, filter: &MetadataFilter) -> Result<Vec<Passage>> {
        let (where_clause, values) = render_filter(filter, 1)?;
        let sql = format!(
            "SELECT id::text AS id, content, metadata FROM {} {} ORDER BY id",
            self.table, where_clause
        );

        let rows = self
            .db
            .read()
            .query_all(Statement::from_sql_and_values(DbBackend::Postgres, &sql, values))
            .await?;

        rows.iter().map(passage_from_row).collect()
    }

    fn backend(&self) -> &'static str {
        "pgvector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{COURSE_FIELD, LECTURER_FIELD};

    #[test]
    fn test_vector_literal() {
        assert_eq!(vector_literal(&[0.1, 0.2, 0.3]), "[0.1,0.2,0.3]");
    }

    #[test]
    fn test_render_filter() {
        let (clause, values) = render_filter(&MetadataFilter::none(), 3).unwrap();
        assert!(clause.is_empty());
        assert!(values.is_empty());

        let filter = MetadataFilter::all(vec![
            Predicate::equals(COURSE_FIELD, "Algorithms"),
            Predicate::In {
                field: LECTURER_FIELD.into(),
                values: vec!["Dana".into(), "Noga".into()],
            },
        ]);
        let (clause, values) = render_filter(&filter, 3).unwrap();
        assert_eq!(
            clause,
            "WHERE metadata->>'course_name' = $3 AND metadata->>'lecturer' IN ($4, $5)"
        );
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_field_names_are_not_interpolated_raw() {
        let filter = MetadataFilter::all(vec![Predicate::equals("x' OR '1'='1", "y")]);
        assert!(render_filter(&filter, 1).is_err());
        assert!(!is_plain_identifier("review_chunks; DROP"));
        assert!(is_plain_identifier("review_chunks"));
    }
}
