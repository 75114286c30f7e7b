//! Metadata-filtered semantic search for unstructured sub-questions

use super::{MetadataFilter, Predicate, ScoredPassage, VectorIndex, COURSE_FIELD, LECTURER_FIELD};
use coursewise_common::context::ExtractedEntities;
use coursewise_common::errors::Result;
use std::sync::Arc;
use tracing::debug;

/// Semantic retriever
pub struct SemanticRetriever {
    index: Arc<dyn VectorIndex>,
    over_fetch_k: usize,
}

impl SemanticRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, over_fetch_k: usize) -> Self {
        Self {
            index,
            over_fetch_k: over_fetch_k.max(1),
        }
    }

    /// Passages relevant to `subquery`, filtered by the entities it names.
    ///
    /// Always requests `over_fetch_k` results; narrowing to the final count
    /// happens downstream.
    pub async fn search(&self, subquery: &str, entities: &ExtractedEntities) -> Result<Vec<ScoredPassage>> {
        let filter = build_filter(subquery, entities);
        debug!(
            backend = self.index.backend(),
            predicates = filter.len(),
            k = self.over_fetch_k,
            "Semantic search"
        );
        self.index.search(subquery, self.over_fetch_k, &filter).await
    }

    /// Unfiltered top passages for `text`
    pub async fn search_unfiltered(&self, text: &str) -> Result<Vec<ScoredPassage>> {
        self.index.search(text, self.over_fetch_k, &MetadataFilter::none()).await
    }
}

/// Equality predicates for the course and lecturer names that occur
/// verbatim in `subquery`.
///
/// Names extracted for a sibling sub-question after splitting do not occur
/// in this one's text, so they never narrow its search.
pub fn build_filter(subquery: &str, entities: &ExtractedEntities) -> MetadataFilter {
    let courses = entities
        .courses
        .iter()
        .filter(|c| !c.is_empty() && subquery.contains(c.as_str()))
        .map(|c| Predicate::equals(COURSE_FIELD, c.as_str()));

    let lecturers = entities
        .lecturers
        .iter()
        .filter(|l| !l.is_empty() && subquery.contains(l.as_str()))
        .map(|l| Predicate::equals(LECTURER_FIELD, l.as_str()));

    MetadataFilter::all(courses.chain(lecturers).collect())
}
