//! Exemplar-based route classification

use coursewise_common::catalog::{nearest, ExemplarCatalog, Route};
use coursewise_common::embeddings::Embedder;
use coursewise_common::errors::Result;
use coursewise_common::retry::RetryPolicy;
use std::sync::Arc;
use tracing::debug;

/// Nearest-neighbour classifier over a labelled exemplar catalog
pub struct QueryClassifier {
    exemplars: Arc<ExemplarCatalog>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
}

impl QueryClassifier {
    pub fn new(exemplars: Arc<ExemplarCatalog>, embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> Self {
        Self {
            exemplars,
            embedder,
            retry,
        }
    }

    /// Route of the exemplar closest to `subquery`.
    ///
    /// An empty catalog routes everything to `Unstructured`.
    pub async fn classify(&self, subquery: &str) -> Result<Route> {
        if self.exemplars.is_empty() {
            return Ok(Route::Unstructured);
        }

        let embedding = self
            .retry
            .run("classifier", || self.embedder.embed(subquery))
            .await?;

        let entries = self.exemplars.entries();
        let route = nearest(&embedding, entries.iter().map(|e| e.embedding.as_slice()))
            .map(|(idx, score)| {
                debug!(exemplar = %entries[idx].item.text, score = score, "Nearest exemplar");
                entries[idx].item.route
            })
            .unwrap_or(Route::Unstructured);

        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursewise_common::catalog::Exemplar;
    use coursewise_common::embeddings::HashingEmbedder;

    async fn classifier(exemplars: Vec<Exemplar>) -> QueryClassifier {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let catalog = ExemplarCatalog::from_exemplars(exemplars, embedder.as_ref())
            .await
            .unwrap();
        QueryClassifier::new(Arc::new(catalog), embedder, RetryPolicy::none())
    }

    fn exemplar(text: &str, route: Route) -> Exemplar {
        Exemplar {
            text: text.to_string(),
            route,
        }
    }

    #[tokio::test]
    async fn test_empty_catalog_defaults_to_unstructured() {
        let classifier = classifier(Vec::new()).await;
        let route = classifier.classify("what is the average grade").await.unwrap();
        assert_eq!(route, Route::Unstructured);
    }

    #[tokio::test]
    async fn test_nearest_exemplar_label_is_deterministic() {
        let classifier = classifier(vec![
            exemplar("what is the average grade in the course", Route::Structured),
            exemplar("is the lecturer nice and are the lectures interesting", Route::Unstructured),
        ])
        .await;

        let query = "What is the average grade in Algorithms?";
        let first = classifier.classify(query).await.unwrap();
        let second = classifier.classify(query).await.unwrap();

        assert_eq!(first, Route::Structured);
        assert_eq!(first, second);
        assert_eq!(
            classifier.classify("is the lecturer nice").await.unwrap(),
            Route::Unstructured
        );
    }
}
