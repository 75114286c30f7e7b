//! Query Splitter - decomposes multi-entity queries into sub-queries
//!
//! A query is only sent to the model when the enhancer extracted two or
//! more distinct values of one category; otherwise the rewritten query is
//! the single sub-query.
//!
//! A split is accepted only if every part keeps each single-valued entity
//! and names exactly one value of each repeated category. Otherwise the
//! rewritten query is kept whole.

use super::conversation_state::ExtractedEntities;
use super::normalize::{mentions, Language};
use crate::errors::{AppError, Result};
use crate::llm::LanguageModel;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One independently answerable question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuery {
    pub text: String,
    pub language: Language,
}

/// Query splitter
pub struct QuerySplitter {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl QuerySplitter {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    /// Split `rewritten` into sub-queries, each about at most one entity
    /// of a kind. Never returns an empty list.
    pub async fn split(
        &self,
        rewritten: &str,
        language: Language,
        entities: &ExtractedEntities,
    ) -> Result<Vec<SubQuery>> {
        let single = || {
            vec![SubQuery {
                text: rewritten.to_string(),
                language,
            }]
        };

        if !entities.has_multiple_of_a_kind() {
            return Ok(single());
        }

        let prompt = build_prompt(rewritten);
        let response = self
            .retry
            .run("splitter", || self.model.complete(&prompt))
            .await?;

        let parts: Vec<String> = serde_json::from_str(response.trim())
            .map_err(|e| AppError::parse("splitter", e.to_string()))?;

        let mut subqueries: Vec<SubQuery> = Vec::with_capacity(parts.len());
        for part in parts {
            let text = part.trim();
            if text.is_empty() || subqueries.iter().any(|s| s.text == text) {
                continue;
            }
            subqueries.push(SubQuery {
                text: text.to_string(),
                language,
            });
        }

        if subqueries.is_empty() {
            return Ok(single());
        }
        if let Some(rejected) = subqueries.iter().find(|s| !keeps_qualifiers(&s.text, entities)) {
            warn!(subquery = %rejected.text, "Split part lost or mixed entities, keeping query whole");
            return Ok(single());
        }

        debug!(count = subqueries.len(), "Query split");
        Ok(subqueries)
    }
}

/// Each category with one distinct value must be mentioned; each repeated
/// category must have exactly one of its values mentioned
fn keeps_qualifiers(part: &str, entities: &ExtractedEntities) -> bool {
    let years: Vec<String> = entities.years.iter().map(|y| y.to_string()).collect();
    let kept = [
        entities.courses.as_slice(),
        entities.lecturers.as_slice(),
        years.as_slice(),
        entities.semesters.as_slice(),
    ]
    .into_iter()
    .all(|values| category_kept(part, values));
    kept
}

fn category_kept(part: &str, values: &[String]) -> bool {
    let mut distinct: Vec<&str> = Vec::with_capacity(values.len());
    for value in values {
        if !distinct.contains(&value.as_str()) {
            distinct.push(value);
        }
    }

    distinct.is_empty() || distinct.iter().filter(|value| mentions(part, value)).count() == 1
}

fn build_prompt(query: &str) -> String {
    format!(
        r#"You are a query decomposition assistant.

Transform the user query into ONE OR MORE simpler sub-queries that can be answered
independently and later combined.

Split ONLY when the query explicitly compares or mentions TWO OR MORE distinct named
entities (two lecturers, two courses, two years).

Each sub-query must:
- Preserve the full original context (course name, year, metric).
- Focus on ONLY ONE entity.
- Be a standalone, grammatically correct question in the language of the query.
- Keep the original intent.

Do NOT answer the question. Do NOT add explanations.
If no split is required, return a list containing the query unchanged.

Example:
Input: Who is better for Algorithms, Yuri or Noga?
Output: ["How is Yuri as the lecturer of Algorithms?", "How is Noga as the lecturer of Algorithms?"]

Output ONLY a valid JSON list of strings.

Input: {query}
Output:"#
    )
}
