//! Turn, enhancement and retrieval handlers

use crate::orchestrator::TurnOutcome;
use crate::retrieval::ScoredPassage;
use crate::AppState;
use axum::{extract::State, Json};
use coursewise_common::context::{ConversationState, ExtractedEntities, Language};
use coursewise_common::errors::{AppError, Result};
use coursewise_common::metrics::RequestMetrics;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;
use validator::Validate;

/// A user utterance with the caller-held conversation state
#[derive(Debug, Deserialize, Validate)]
pub struct TurnRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,

    /// Omitted on the first turn of a session
    #[serde(default)]
    pub state: ConversationState,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RetrieveRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,
}

#[derive(Serialize)]
pub struct EnhanceResponse {
    pub rewritten_query: String,
    pub language: Language,
    pub entities: ExtractedEntities,
    pub state: ConversationState,
}

#[derive(Serialize)]
pub struct RetrieveResponse {
    pub query: String,
    pub passages: Vec<ScoredPassage>,
    pub processing_time_ms: u64,
}

fn validate(request: &impl Validate) -> Result<()> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("query".to_string()),
    })
}

/// Run one conversation turn
pub async fn turn(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnOutcome>> {
    let metrics = RequestMetrics::start("POST", "/v1/turn");
    validate(&request)?;

    let turn_id = Uuid::now_v7();
    let result = state
        .orchestrator
        .run_turn(&request.query, request.state)
        .instrument(tracing::info_span!("turn", turn_id = %turn_id))
        .await;

    metrics.finish(match &result {
        Ok(_) => 200,
        Err(e) => e.status_code().as_u16(),
    });
    Ok(Json(result?))
}

/// Rewrite a query and extract entities without retrieval
pub async fn enhance(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<EnhanceResponse>> {
    validate(&request)?;

    let (enhancement, conversation) = state
        .orchestrator
        .enhance(&request.query, request.state)
        .await?;

    Ok(Json(EnhanceResponse {
        rewritten_query: enhancement.rewritten_query,
        language: enhancement.language,
        entities: enhancement.entities,
        state: conversation,
    }))
}

/// Unfiltered semantic search
pub async fn retrieve(
    State(state): State<AppState>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>> {
    let start = std::time::Instant::now();
    validate(&request)?;

    let passages = state.orchestrator.retrieve(&request.query).await?;

    Ok(Json(RetrieveResponse {
        query: request.query,
        passages,
        processing_time_ms: start.elapsed().as_millis() as u64,
    }))
}
