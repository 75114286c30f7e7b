//! Turn orchestration
//!
//! RECEIVED -> ENHANCED -> SPLIT -> per sub-question
//! (CLASSIFIED -> ROUTED -> GENERATED -> EXECUTED | RETRIEVED)
//! -> AGGREGATED -> DONE
//!
//! Enhancement and splitting abort the turn on failure. Every per
//! sub-question failure is caught and bucketed as unresolved, so siblings
//! always complete.

use crate::retrieval::{ScoredPassage, SemanticRetriever};
use crate::routing::{QueryClassifier, TableRoute, TableRouter};
use crate::sql::{Row, SafetyClass, SqlExecutor, SqlGenerator, StructuredQueryPlan};
use coursewise_common::catalog::Route;
use coursewise_common::context::{
    ConversationState, Enhancement, ExtractedEntities, QueryEnhancer, QuerySplitter, SubQuery,
};
use coursewise_common::errors::{AppError, Result};
use coursewise_common::metrics;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

/// Stage of a turn, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Received,
    Enhanced,
    Split,
    Aggregated,
    Done,
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnStage::Received => "received",
            TurnStage::Enhanced => "enhanced",
            TurnStage::Split => "split",
            TurnStage::Aggregated => "aggregated",
            TurnStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why a sub-question has no result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// No table schema usable for a structured sub-question
    NoMatchingTable,
    /// Zero passages or zero rows
    NoInformation,
    /// Generated SQL failed the contract checks or the SELECT gate
    Rejected { reason: String },
    /// A backend call failed
    Failed { stage: String, message: String },
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::NoMatchingTable => "no_matching_table",
            UnresolvedReason::NoInformation => "no_information",
            UnresolvedReason::Rejected { .. } => "rejected",
            UnresolvedReason::Failed { .. } => "failed",
        }
    }
}

/// Result of one sub-question
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetrievalOutcome {
    SemanticHit { passages: Vec<ScoredPassage> },
    StructuredHit { plan: StructuredQueryPlan, rows: Vec<Row> },
    Unresolved { reason: UnresolvedReason },
}

/// One sub-question with its route and outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubQueryOutcome {
    pub subquery: SubQuery,
    /// `None` when classification itself failed
    pub route: Option<Route>,
    pub outcome: RetrievalOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedSubQuery {
    pub subquery: String,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredResult {
    pub subquery: String,
    pub table: String,
    pub sql: String,
    pub rows: Vec<Row>,
}

/// Aggregated output of a turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub rewritten_query: String,
    pub entities: ExtractedEntities,
    /// One hit set per resolved unstructured sub-question
    pub semantic_hits: Vec<Vec<ScoredPassage>>,
    pub unresolved: Vec<UnresolvedSubQuery>,
    pub structured: Vec<StructuredResult>,
    /// Every sub-question in split order
    pub outcomes: Vec<SubQueryOutcome>,
    /// State after this turn's extraction; the caller persists it
    pub state: ConversationState,
}

impl TurnOutcome {
    fn aggregate(
        enhancement: Enhancement,
        outcomes: Vec<SubQueryOutcome>,
        state: ConversationState,
    ) -> Self {
        let mut semantic_hits = Vec::new();
        let mut unresolved = Vec::new();
        let mut structured = Vec::new();

        for item in &outcomes {
            match &item.outcome {
                RetrievalOutcome::SemanticHit { passages } => semantic_hits.push(passages.clone()),
                RetrievalOutcome::StructuredHit { plan, rows } => structured.push(StructuredResult {
                    subquery: item.subquery.text.clone(),
                    table: plan.table.clone(),
                    sql: plan.query.clone(),
                    rows: rows.clone(),
                }),
                RetrievalOutcome::Unresolved { reason } => unresolved.push(UnresolvedSubQuery {
                    subquery: item.subquery.text.clone(),
                    reason: reason.clone(),
                }),
            }
        }

        Self {
            rewritten_query: enhancement.rewritten_query,
            entities: enhancement.entities,
            semantic_hits,
            unresolved,
            structured,
            outcomes,
            state,
        }
    }
}

/// Pipeline components of the orchestrator
pub struct Orchestrator {
    enhancer: QueryEnhancer,
    splitter: QuerySplitter,
    classifier: QueryClassifier,
    router: TableRouter,
    generator: SqlGenerator,
    executor: SqlExecutor,
    retriever: SemanticRetriever,
}

impl Orchestrator {
    pub fn new(
        enhancer: QueryEnhancer,
        splitter: QuerySplitter,
        classifier: QueryClassifier,
        router: TableRouter,
        generator: SqlGenerator,
        executor: SqlExecutor,
        retriever: SemanticRetriever,
    ) -> Self {
        Self {
            enhancer,
            splitter,
            classifier,
            router,
            generator,
            executor,
            retriever,
        }
    }

    /// Enhance `raw_query` and merge its entities into `state`
    pub async fn enhance(
        &self,
        raw_query: &str,
        mut state: ConversationState,
    ) -> Result<(Enhancement, ConversationState)> {
        let enhancement = self
            .enhancer
            .rewrite_and_extract(raw_query, &state.render_context())
            .await
            .inspect_err(|e| {
                warn!(stage = "enhance", error = %e, "Turn aborted");
                metrics::record_turn_failure("enhance");
            })?;

        state.update(&enhancement.entities);
        Ok((enhancement, state))
    }

    /// Unfiltered top passages for `query`
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredPassage>> {
        self.retriever.search_unfiltered(query).await
    }

    /// Run one full turn
    pub async fn run_turn(&self, raw_query: &str, state: ConversationState) -> Result<TurnOutcome> {
        let start = Instant::now();
        info!(stage = %TurnStage::Received, query_chars = raw_query.chars().count(), "Turn started");

        // Single writer: the state is updated here, before fan-out
        let (enhancement, state) = self.enhance(raw_query, state).await?;
        info!(
            stage = %TurnStage::Enhanced,
            rewritten = %enhancement.rewritten_query,
            language = ?enhancement.language,
            "Query enhanced"
        );

        let subqueries = self
            .splitter
            .split(&enhancement.rewritten_query, enhancement.language, &enhancement.entities)
            .await
            .inspect_err(|e| {
                warn!(stage = "split", error = %e, "Turn aborted");
                metrics::record_turn_failure("split");
            })?;
        info!(stage = %TurnStage::Split, count = subqueries.len(), "Query split");

        let entities = &enhancement.entities;
        let outcomes = join_all(
            subqueries
                .into_iter()
                .map(|subquery| self.process(subquery, entities)),
        )
        .await;

        let count = outcomes.len();
        let outcome = TurnOutcome::aggregate(enhancement, outcomes, state);
        info!(
            stage = %TurnStage::Aggregated,
            semantic = outcome.semantic_hits.len(),
            structured = outcome.structured.len(),
            unresolved = outcome.unresolved.len(),
            "Sub-questions aggregated"
        );

        metrics::record_turn(start.elapsed().as_secs_f64(), count);
        info!(stage = %TurnStage::Done, elapsed_ms = start.elapsed().as_millis() as u64, "Turn complete");
        Ok(outcome)
    }

    async fn process(&self, subquery: SubQuery, entities: &ExtractedEntities) -> SubQueryOutcome {
        let route = match self.classifier.classify(&subquery.text).await {
            Ok(route) => route,
            Err(e) => {
                return SubQueryOutcome {
                    outcome: unresolved(&subquery, failed("classify", &e)),
                    subquery,
                    route: None,
                }
            }
        };
        metrics::record_subquery(route.as_str());

        let outcome = match route {
            Route::Structured => self.structured(&subquery).await,
            Route::Unstructured => self.semantic(&subquery, entities).await,
        };

        SubQueryOutcome {
            subquery,
            route: Some(route),
            outcome,
        }
    }

    async fn structured(&self, subquery: &SubQuery) -> RetrievalOutcome {
        let descriptor = match self.router.route(&subquery.text).await {
            Ok(TableRoute::Table { descriptor, .. }) => descriptor,
            Ok(TableRoute::NoMatch) => {
                let err = AppError::NoMatchingTable {
                    query: subquery.text.clone(),
                };
                warn!(error = %err, "Structured sub-question left unresolved");
                return unresolved(subquery, UnresolvedReason::NoMatchingTable);
            }
            Err(e) => return unresolved(subquery, failed("route", &e)),
        };

        let sql = match self.generator.generate(&subquery.text, &descriptor).await {
            Ok(sql) => sql,
            Err(e) => return unresolved(subquery, failed("generate", &e)),
        };

        let plan = StructuredQueryPlan::new(&subquery.text, &descriptor, sql);
        if let SafetyClass::Rejected { reason } = &plan.safety {
            return unresolved(
                subquery,
                UnresolvedReason::Rejected {
                    reason: reason.clone(),
                },
            );
        }

        match self.executor.execute(&plan.query).await {
            Ok(rows) if rows.is_empty() => unresolved(subquery, UnresolvedReason::NoInformation),
            Ok(rows) => RetrievalOutcome::StructuredHit { plan, rows },
            Err(AppError::SafetyViolation { message }) => {
                unresolved(subquery, UnresolvedReason::Rejected { reason: message })
            }
            Err(e) => unresolved(subquery, failed("execute", &e)),
        }
    }

    async fn semantic(&self, subquery: &SubQuery, entities: &ExtractedEntities) -> RetrievalOutcome {
        match self.retriever.search(&subquery.text, entities).await {
            Ok(passages) if passages.is_empty() => unresolved(subquery, UnresolvedReason::NoInformation),
            Ok(passages) => RetrievalOutcome::SemanticHit { passages },
            Err(e) => unresolved(subquery, failed("retrieve", &e)),
        }
    }
}

fn failed(stage: &str, error: &AppError) -> UnresolvedReason {
    UnresolvedReason::Failed {
        stage: stage.to_string(),
        message: error.to_string(),
    }
}

fn unresolved(subquery: &SubQuery, reason: UnresolvedReason) -> RetrievalOutcome {
    warn!(subquery = %subquery.text, reason = reason.as_str(), "Sub-question unresolved");
    metrics::record_unresolved(reason.as_str());
    RetrievalOutcome::Unresolved { reason }
}
