//! Query Enhancer - rewrites the user query and extracts named entities
//!
//! One language-model call returns a strict JSON payload; anything that
//! does not deserialise into it is a parse failure for the turn. Vague
//! references are resolved by the model only from the rendered
//! conversation context.

use super::conversation_state::ExtractedEntities;
use super::normalize::{clean_query, mentions, Language, NicknameMap};
use crate::errors::{AppError, Result};
use crate::llm::LanguageModel;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Output of the enhancement stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    /// Query after cleaning, before rewriting
    pub cleaned_query: String,

    /// Rewritten, self-contained query
    pub rewritten_query: String,

    /// Language of the original query
    pub language: Language,

    /// Entities explicitly mentioned this turn
    pub entities: ExtractedEntities,
}

/// Wire payload expected from the model
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnhancerPayload {
    #[serde(alias = "rewrittenQuery")]
    rewritten_query: String,

    #[serde(alias = "course")]
    courses: Vec<String>,

    #[serde(alias = "lecturer")]
    lecturers: Vec<String>,

    // Optional in the payload; the prompt asks for them
    #[serde(default)]
    years: Vec<i32>,

    #[serde(default)]
    semesters: Vec<String>,
}

/// Query enhancer
pub struct QueryEnhancer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    nicknames: NicknameMap,
}

impl QueryEnhancer {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, nicknames: NicknameMap) -> Self {
        Self {
            model,
            retry,
            nicknames,
        }
    }

    /// Rewrite `raw_query` and extract the entities it mentions.
    ///
    /// `conversation_context` is the rendered conversation state; it is
    /// the only source the model may use to resolve references such as
    /// "that lecturer".
    pub async fn rewrite_and_extract(
        &self,
        raw_query: &str,
        conversation_context: &str,
    ) -> Result<Enhancement> {
        let cleaned = clean_query(raw_query);
        if cleaned.is_empty() {
            return Err(AppError::Validation {
                message: "query is empty after cleaning".to_string(),
                field: Some("query".to_string()),
            });
        }
        let language = Language::detect(&cleaned);

        let prompt = build_prompt(&cleaned, conversation_context);
        debug!(prompt_chars = prompt.len(), "Enhancer prompt built");

        let response = self
            .retry
            .run("enhancer", || self.model.complete(&prompt))
            .await?;

        let payload = parse_payload(&response)?;

        let texts = [cleaned.as_str(), payload.rewritten_query.as_str()];
        let mut courses = retain_explicit(payload.courses, &texts, "course");
        let lecturers = retain_explicit(payload.lecturers, &texts, "lecturer");
        let semesters = retain_explicit(payload.semesters, &texts, "semester");
        let years = retain_explicit_years(payload.years, &texts);
        let rewritten = self.nicknames.apply(payload.rewritten_query.trim(), &mut courses);

        Ok(Enhancement {
            cleaned_query: cleaned,
            rewritten_query: rewritten,
            language,
            entities: ExtractedEntities {
                courses,
                lecturers,
                years,
                semesters,
            },
        })
    }
}

fn parse_payload(response: &str) -> Result<EnhancerPayload> {
    let payload: EnhancerPayload = serde_json::from_str(response.trim())
        .map_err(|e| AppError::parse("enhancer", e.to_string()))?;

    if payload.rewritten_query.trim().is_empty() {
        return Err(AppError::parse("enhancer", "rewritten_query is empty"));
    }
    if payload
        .courses
        .iter()
        .chain(payload.lecturers.iter())
        .any(|name| name.trim().is_empty())
    {
        return Err(AppError::parse("enhancer", "blank entity name"));
    }

    Ok(payload)
}

/// Keep only values that occur as whole words in one of `texts`
fn retain_explicit(values: Vec<String>, texts: &[&str], kind: &str) -> Vec<String> {
    let mut kept: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim().to_string();
        if value.is_empty() || kept.contains(&value) {
            continue;
        }
        if texts.iter().any(|text| mentions(text, &value)) {
            kept.push(value);
        } else {
            warn!(kind = kind, value = %value, "Dropping extracted entity absent from query text");
        }
    }
    kept
}

fn retain_explicit_years(years: Vec<i32>, texts: &[&str]) -> Vec<i32> {
    let mut kept: Vec<i32> = Vec::with_capacity(years.len());
    for year in years {
        if kept.contains(&year) {
            continue;
        }
        if texts.iter().any(|text| mentions(text, &year.to_string())) {
            kept.push(year);
        } else {
            warn!(kind = "year", value = year, "Dropping extracted entity absent from query text");
        }
    }
    kept
}

fn build_prompt(query: &str, conversation_context: &str) -> String {
    let context = if conversation_context.trim().is_empty() {
        "(no previous mentions)"
    } else {
        conversation_context
    };

    format!(
        r#"You rewrite user questions about university courses and lecturers for a retrieval system,
and extract the course and lecturer names they mention.

Rewriting rules:
- Keep the meaning exactly the same. Do not add new information or assumptions.
- Keep the rewritten query in the same language as the input.
- Fix spelling mistakes and expand abbreviations only when the meaning is obvious
  (e.g. algo -> algorithms, DS -> data structures).
- Some lecturer names come with surnames and some don't; keep them as they are.
- References such as "that lecturer" or "this course" may be resolved ONLY from the
  conversation context below, and only when exactly one prior mention fits.
  Otherwise leave the reference as it is.
- Do NOT answer the query. Do NOT explain.

Extraction rules:
- Extract only names explicitly present in the rewritten query. Do NOT infer or guess.
- Course names may include versions (e.g. "Algebra B"); extract them whole.
- Years are integers; semesters are strings. Use empty lists when nothing is mentioned.

Conversation context:
{context}

Example:
User query: What is the avg grade in algro b and who is the lecturer?
Output: {{"rewritten_query": "What is the average grade in the course Algebra B and who is the lecturer for that course?", "courses": ["Algebra B"], "lecturers": [], "years": [], "semesters": []}}

Return ONLY a JSON object with exactly these keys:
{{"rewritten_query": string, "courses": [string], "lecturers": [string], "years": [int], "semesters": [string]}}

User query:
{query}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConversationState;
    use crate::llm::MockLanguageModel;
    use std::collections::HashMap;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn enhancer(model: Arc<MockLanguageModel>) -> QueryEnhancer {
        QueryEnhancer::new(model, fast_retry(), NicknameMap::default())
    }

    #[tokio::test]
    async fn test_rewrite_and_extract() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response(
            r#"{"rewritten_query": "What is the average grade in the course Algorithms and who teaches it?",
                "courses": ["Algorithms"], "lecturers": []}"#,
        );

        let result = enhancer(model.clone())
            .rewrite_and_extract("What is the avg grade in Algorithms and who teaches it?", "")
            .await
            .unwrap();

        assert_eq!(result.language, Language::English);
        assert_eq!(result.entities.courses, ["Algorithms"]);
        assert!(result.entities.lecturers.is_empty());
        assert!(model.prompts()[0].contains("(no previous mentions)"));
    }

    #[tokio::test]
    async fn test_vague_reference_uses_context() {
        let mut state = ConversationState::new();
        state.update(&ExtractedEntities {
            lecturers: vec!["A".to_string()],
            ..Default::default()
        });

        let model = Arc::new(MockLanguageModel::new());
        model.push_response(
            r#"{"rewritten_query": "Is the lecturer A any good?", "courses": [], "lecturers": ["A"]}"#,
        );

        let result = enhancer(model.clone())
            .rewrite_and_extract("is that lecturer any good", &state.render_context())
            .await
            .unwrap();

        let prompt = &model.prompts()[0];
        assert!(prompt.contains("Most recent lecturer (used for vague references): A"));
        assert_eq!(result.rewritten_query, "Is the lecturer A any good?");
        assert_eq!(result.entities.lecturers, ["A"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_parse_error() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response("```json\n{\"rewritten_query\": \"x\"}\n```");

        let err = enhancer(model)
            .rewrite_and_extract("anything", "")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Parse { ref stage, .. } if stage == "enhancer"));
    }

    #[tokio::test]
    async fn test_missing_field_is_parse_error() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response(r#"{"rewritten_query": "who teaches Algorithms", "courses": ["Algorithms"]}"#);

        let err = enhancer(model).rewrite_and_extract("who teaches Algorithms", "").await;
        tokio_test::assert_err!(err);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_error(AppError::TransientService {
                service: "llm".into(),
                message: "429".into(),
            })
            .push_response(r#"{"rewritten_query": "Who teaches Calculus?", "courses": ["Calculus"], "lecturers": []}"#);

        let result = enhancer(model.clone()).rewrite_and_extract("who teaches calculus", "").await;
        tokio_test::assert_ok!(&result);
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_inferred_entities_are_dropped_and_nicknames_applied() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response(
            r#"{"rewritten_query": "Who teaches algo?", "courses": ["algo"], "lecturers": ["Guessed Person"]}"#,
        );
        let nicknames = NicknameMap::new(HashMap::from([
            ("algo".to_string(), "Algorithms".to_string()),
        ]));

        let result = QueryEnhancer::new(model, fast_retry(), nicknames)
            .rewrite_and_extract("who teaches algo", "")
            .await
            .unwrap();

        assert_eq!(result.rewritten_query, "Who teaches Algorithms?");
        assert_eq!(result.entities.courses, ["Algorithms"]);
        assert!(result.entities.lecturers.is_empty());
    }

    #[tokio::test]
    async fn test_entities_must_be_whole_word_mentions() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response(
            r#"{"rewritten_query": "How hard is Algorithms?", "courses": ["Algorithms"],
                "lecturers": ["A"], "years": [1999], "semesters": ["summer"]}"#,
        );

        let result = enhancer(model)
            .rewrite_and_extract("how hard is algorithms", "")
            .await
            .unwrap();

        assert_eq!(result.entities.courses, ["Algorithms"]);
        assert!(result.entities.lecturers.is_empty());
        assert!(result.entities.years.is_empty());
        assert!(result.entities.semesters.is_empty());
    }

    #[tokio::test]
    async fn test_mentioned_years_and_semesters_are_kept() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response(
            r#"{"rewritten_query": "Average grade of lecturer A in Algorithms in the summer semester of 2023",
                "courses": ["Algorithms"], "lecturers": ["A"], "years": [2023, 2023], "semesters": ["summer"]}"#,
        );

        let result = enhancer(model)
            .rewrite_and_extract("avg grade of lecturer A in algorithms summer 2023", "")
            .await
            .unwrap();

        assert_eq!(result.entities.lecturers, ["A"]);
        assert_eq!(result.entities.years, [2023]);
        assert_eq!(result.entities.semesters, ["summer"]);
    }

    #[tokio::test]
    async fn test_empty_query_rejected_without_model_call() {
        let model = Arc::new(MockLanguageModel::new());
        let err = enhancer(model.clone()).rewrite_and_extract(" ?! ", "").await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        assert!(model.prompts().is_empty());
    }
}
