//! Schema routing for structured sub-questions

use coursewise_common::catalog::{nearest, SchemaCatalog, TableDescriptor};
use coursewise_common::embeddings::Embedder;
use coursewise_common::errors::Result;
use coursewise_common::retry::RetryPolicy;
use std::sync::Arc;
use tracing::debug;

/// Outcome of table routing
#[derive(Debug, Clone, PartialEq)]
pub enum TableRoute {
    Table {
        descriptor: TableDescriptor,
        similarity: f32,
    },
    /// Empty catalog, or no table at or above the usability threshold
    NoMatch,
}

/// Similarity router over the schema catalog
pub struct TableRouter {
    catalog: Arc<SchemaCatalog>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    min_similarity: f32,
}

impl TableRouter {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
        min_similarity: f32,
    ) -> Self {
        Self {
            catalog,
            embedder,
            retry,
            min_similarity,
        }
    }

    /// Closest table to `subquery`, or `NoMatch`
    pub async fn route(&self, subquery: &str) -> Result<TableRoute> {
        if self.catalog.is_empty() {
            return Ok(TableRoute::NoMatch);
        }

        let embedding = self
            .retry
            .run("table_router", || self.embedder.embed(subquery))
            .await?;

        let entries = self.catalog.entries();
        match nearest(&embedding, entries.iter().map(|e| e.embedding.as_slice())) {
            Some((idx, similarity)) if similarity >= self.min_similarity => {
                debug!(table = %entries[idx].item.name, similarity = similarity, "Table routed");
                Ok(TableRoute::Table {
                    descriptor: entries[idx].item.clone(),
                    similarity,
                })
            }
            Some((idx, similarity)) => {
                debug!(
                    table = %entries[idx].item.name,
                    similarity = similarity,
                    threshold = self.min_similarity,
                    "Closest table below threshold"
                );
                Ok(TableRoute::NoMatch)
            }
            None => Ok(TableRoute::NoMatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursewise_common::catalog::ColumnDescriptor;
    use coursewise_common::embeddings::HashingEmbedder;

    fn grades_table() -> TableDescriptor {
        TableDescriptor {
            name: "grades".into(),
            table_type: "grades".into(),
            description: "average grade of each course per year and semester".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "course_name".into(),
                    description: "course name".into(),
                    pre_aggregated: false,
                },
                ColumnDescriptor {
                    name: "avg".into(),
                    description: "average grade".into(),
                    pre_aggregated: true,
                },
            ],
        }
    }

    async fn router(tables: Vec<TableDescriptor>, min_similarity: f32) -> TableRouter {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let catalog = SchemaCatalog::from_descriptors(tables, embedder.as_ref())
            .await
            .unwrap();
        TableRouter::new(Arc::new(catalog), embedder, RetryPolicy::none(), min_similarity)
    }

    #[tokio::test]
    async fn test_routes_to_closest_table() {
        let router = router(vec![grades_table()], 0.1).await;
        match router.route("what is the average grade of the course").await.unwrap() {
            TableRoute::Table { descriptor, .. } => assert_eq!(descriptor.name, "grades"),
            TableRoute::NoMatch => panic!("expected grades table"),
        }
    }

    #[tokio::test]
    async fn test_empty_catalog_and_threshold_give_no_match() {
        let empty = router(Vec::new(), 0.1).await;
        assert_eq!(empty.route("average grade").await.unwrap(), TableRoute::NoMatch);

        let strict = router(vec![grades_table()], 0.99).await;
        assert_eq!(strict.route("parking near campus").await.unwrap(), TableRoute::NoMatch);
    }
}
