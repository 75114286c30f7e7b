//! Coursewise Search Service
//!
//! Answers course and lecturer questions over two sources:
//! - Structured grade tables via generated, checked SELECT queries
//! - Student review passages via metadata-filtered vector search
//!
//! Conversation state is held by the caller and sent with each turn.

mod handlers;
mod orchestrator;
mod retrieval;
mod routing;
mod sql;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use coursewise_common::{
    catalog::{ExemplarCatalog, SchemaCatalog},
    config::AppConfig,
    context::{NicknameMap, QueryEnhancer, QuerySplitter},
    db::DbPool,
    embeddings::create_embedder,
    errors::AppError,
    llm::{ChatCompletionsClient, LanguageModel},
    metrics, RetryPolicy, VERSION,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use orchestrator::Orchestrator;
use retrieval::{InMemoryIndex, PgVectorIndex, SemanticRetriever, VectorIndex};
use routing::{QueryClassifier, TableRouter};
use sql::{PgStore, SqlExecutor, SqlGenerator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub db: Arc<DbPool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(AppConfig::load()?);

    // Initialize tracing
    init_tracing(&config);
    info!("Starting Coursewise Search Service v{}", VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.observability.metrics_port))
            .install()?;
        info!(port = config.observability.metrics_port, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = Arc::new(DbPool::new(&config.database).await?);

    let orchestrator = Arc::new(build_orchestrator(&config, db.clone()).await?);

    let state = AppState {
        config: config.clone(),
        orchestrator,
        db,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let host: std::net::IpAddr = config.server.host.parse().map_err(|_| AppError::Configuration {
        message: format!("invalid server.host: {}", config.server.host),
    })?;
    let addr = SocketAddr::new(host, config.server.port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load catalogs, clients and the vector backend, then assemble the pipeline
async fn build_orchestrator(config: &AppConfig, db: Arc<DbPool>) -> Result<Orchestrator, AppError> {
    let embedder = create_embedder(&config.embedding)?;
    let retry = RetryPolicy::from_config(&config.retry);

    let model: Arc<dyn LanguageModel> = Arc::new(ChatCompletionsClient::new(config.llm.clone())?);
    let sql_model: Arc<dyn LanguageModel> = Arc::new(ChatCompletionsClient::new(config.llm.for_sql())?);

    let nicknames = NicknameMap::load(&config.catalog.nicknames_path).await?;
    let tables = Arc::new(SchemaCatalog::load(&config.catalog.tables_path, embedder.as_ref()).await?);
    let exemplars = Arc::new(ExemplarCatalog::load(&config.catalog.exemplars_path, embedder.as_ref()).await?);

    let index: Arc<dyn VectorIndex> = match config.retrieval.backend.as_str() {
        "pgvector" => Arc::new(PgVectorIndex::new(
            db.clone(),
            embedder.clone(),
            config.retrieval.passages_table.clone(),
        )?),
        "memory" => {
            let index = InMemoryIndex::load_reviews(&config.catalog.reviews_path, embedder.clone()).await?;
            if index.is_empty() {
                warn!(path = %config.catalog.reviews_path, "No review passages loaded");
            } else {
                info!(passages = index.len(), "Review passages indexed in memory");
            }
            Arc::new(index)
        }
        other => {
            return Err(AppError::Configuration {
                message: format!("unknown retrieval backend: {}", other),
            })
        }
    };
    info!(backend = index.backend(), "Vector backend ready");

    Ok(Orchestrator::new(
        QueryEnhancer::new(model.clone(), retry.clone(), nicknames),
        QuerySplitter::new(model, retry.clone()),
        QueryClassifier::new(exemplars, embedder.clone(), retry.clone()),
        TableRouter::new(tables, embedder, retry, config.retrieval.table_min_similarity),
        SqlGenerator::new(sql_model),
        SqlExecutor::new(Arc::new(PgStore::new(db))),
        SemanticRetriever::new(index, config.retrieval.over_fetch_k),
    ))
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let timeout = TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, state.config.request_timeout());

    let api_routes = Router::new()
        .route("/turn", post(handlers::turn::turn))
        .route("/enhance", post(handlers::turn::enhance))
        .route("/retrieve", post(handlers::turn::retrieve));

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(timeout)
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
