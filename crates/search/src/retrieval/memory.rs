//! In-process vector index
//!
//! Embeds every passage once at construction and scores by cosine
//! similarity at query time. Suitable for tests and small review sets.

use super::{MetadataFilter, Passage, ScoredPassage, VectorIndex, COURSE_FIELD, LECTURER_FIELD};
use coursewise_common::embeddings::{cosine_similarity, Embedder};
use coursewise_common::errors::{AppError, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// In-memory index
pub struct InMemoryIndex {
    embedder: Arc<dyn Embedder>,
    entries: Vec<(Passage, Vec<f32>)>,
}

/// Course record in the cleaned reviews file
#[derive(Debug, Deserialize)]
struct CourseReviews {
    course_id: Value,
    course_name: String,
    lecturer: String,
    #[serde(default)]
    reviews: Vec<Review>,
}

#[derive(Debug, Deserialize)]
struct Review {
    content: String,
    #[serde(default)]
    rank: Value,
    #[serde(default)]
    time: Value,
}

impl InMemoryIndex {
    /// Build an index over `passages`
    pub async fn from_passages(passages: Vec<Passage>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let texts: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts).await?
        };

        Ok(Self {
            embedder,
            entries: passages.into_iter().zip(embeddings).collect(),
        })
    }

    /// Build an index from a cleaned reviews file, one passage per review
    pub async fn load_reviews(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| AppError::Configuration {
            message: format!("cannot read reviews {}: {}", path.display(), e),
        })?;
        let courses: Vec<CourseReviews> = serde_json::from_str(&raw).map_err(|e| AppError::Configuration {
            message: format!("invalid reviews {}: {}", path.display(), e),
        })?;

        let index = Self::from_passages(reviews_to_passages(courses), embedder).await?;
        info!(passages = index.len(), "In-memory review index built");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn reviews_to_passages(courses: Vec<CourseReviews>) -> Vec<Passage> {
    let mut passages = Vec::new();
    for course in courses {
        for (idx, review) in course.reviews.into_iter().enumerate() {
            let mut metadata = Map::new();
            metadata.insert("course_id".into(), course.course_id.clone());
            metadata.insert(COURSE_FIELD.into(), json!(course.course_name));
            metadata.insert(LECTURER_FIELD.into(), json!(course.lecturer));
            metadata.insert("rank".into(), review.rank);
            metadata.insert("date".into(), review.time);
            metadata.insert("review_idx".into(), json!(idx));

            passages.push(Passage {
                id: passages.len().to_string(),
                content: review.content,
                metadata,
            });
        }
    }
    passages
}

#[async_trait::async_trait]
impl VectorIndex for InMemoryIndex {
    async fn search(&self, text: &str, k: usize, filter: &MetadataFilter) -> Result<Vec<ScoredPassage>> {
        let query = self.embedder.embed(text).await?;

        let mut scored: Vec<ScoredPassage> = self
            .entries
            .iter()
            .filter(|(passage, _)| filter.matches(passage))
            .map(|(passage, embedding)| ScoredPassage {
                passage: passage.clone(),
                score: cosine_similarity(&query, embedding),
            })
            .collect();

        // stable: equal scores keep index order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn fetch_by_filter(&self, filter: &MetadataFilter) -> Result<Vec<Passage>> {
        Ok(self
            .entries
            .iter()
            .filter(|(passage, _)| filter.matches(passage))
            .map(|(passage, _)| passage.clone())
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
