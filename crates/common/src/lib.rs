//! Coursewise Common Library
//!
//! Shared code for the Coursewise services including:
//! - Configuration management
//! - Error types and handling
//! - Language-model and embedding clients
//! - Bounded retry for model calls
//! - Schema and exemplar catalogs
//! - Query understanding (conversation state, enhancement, splitting)
//! - Database connection and metrics

pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::LanguageModel;
pub use retry::RetryPolicy;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
