//! Configuration management for Coursewise services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Relational store + vector index database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Language-model completion service
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Retry policy for language-model calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retrieval tuning
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Static catalogs loaded at startup
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    #[serde(default = "default_llm_base")]
    pub api_base: String,

    /// API key (empty disables the remote client)
    #[serde(default)]
    pub api_key: String,

    /// Model used for rewriting, extraction and splitting
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Model used for SQL generation (falls back to `model`)
    pub sql_model: Option<String>,

    /// Separate key for the SQL model endpoint (falls back to `api_key`)
    pub sql_api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, hashing
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Vector index backend: pgvector, memory
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Passages fetched per semantic sub-question
    #[serde(default = "default_over_fetch")]
    pub over_fetch_k: usize,

    /// Minimum cosine similarity for a table schema to be usable
    #[serde(default = "default_table_threshold")]
    pub table_min_similarity: f32,

    /// Table holding review passages for the pgvector backend
    #[serde(default = "default_passages_table")]
    pub passages_table: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Table schema catalog (JSON)
    #[serde(default = "default_tables_path")]
    pub tables_path: String,

    /// Labelled classifier exemplars (JSON)
    #[serde(default = "default_exemplars_path")]
    pub exemplars_path: String,

    /// Course nickname map (JSON object, optional file)
    #[serde(default = "default_nicknames_path")]
    pub nicknames_path: String,

    /// Review passages for the in-memory backend (JSON)
    #[serde(default = "default_reviews_path")]
    pub reviews_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 120 }
fn default_database_url() -> String { "postgres://localhost/coursewise".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_llm_base() -> String { "https://integrate.api.nvidia.com/v1".to_string() }
fn default_llm_model() -> String { "deepseek-ai/deepseek-v3.1".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_top_p() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 4096 }
fn default_llm_timeout() -> u64 { 60 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "intfloat/multilingual-e5-large".to_string() }
fn default_embedding_dimension() -> usize { 1024 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_max_attempts() -> u32 { 5 }
fn default_initial_backoff() -> u64 { 4_000 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_backend() -> String { "pgvector".to_string() }
fn default_over_fetch() -> usize { 10 }
fn default_table_threshold() -> f32 { 0.2 }
fn default_passages_table() -> String { "review_chunks".to_string() }
fn default_tables_path() -> String { "data/tables.json".to_string() }
fn default_exemplars_path() -> String { "data/exemplars.json".to_string() }
fn default_nicknames_path() -> String { "data/course_nicknames.json".to_string() }
fn default_reviews_path() -> String { "data/cleaned_reviews.json".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "coursewise".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_llm_base(),
            api_key: String::new(),
            model: default_llm_model(),
            sql_model: None,
            sql_api_key: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    /// Derive the configuration for the SQL generation model
    pub fn for_sql(&self) -> LlmConfig {
        LlmConfig {
            model: self.sql_model.clone().unwrap_or_else(|| self.model.clone()),
            api_key: self.sql_api_key.clone().unwrap_or_else(|| self.api_key.clone()),
            ..self.clone()
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            over_fetch_k: default_over_fetch(),
            table_min_similarity: default_table_threshold(),
            passages_table: default_passages_table(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            tables_path: default_tables_path(),
            exemplars_path: default_exemplars_path(),
            nicknames_path: default_nicknames_path(),
            reviews_path: default_reviews_path(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // e.g., APP__LLM__API_KEY=...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            retry: RetryConfig::default(),
            retrieval: RetrievalConfig::default(),
            catalog: CatalogConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retrieval.over_fetch_k, 10);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/coursewise");
    }

    #[test]
    fn test_sql_model_fallback() {
        let mut llm = LlmConfig::default();
        llm.api_key = "primary".into();
        assert_eq!(llm.for_sql().model, llm.model);
        assert_eq!(llm.for_sql().api_key, "primary");

        llm.sql_model = Some("microsoft/phi-4-mini-instruct".into());
        llm.sql_api_key = Some("converter".into());
        let sql = llm.for_sql();
        assert_eq!(sql.model, "microsoft/phi-4-mini-instruct");
        assert_eq!(sql.api_key, "converter");
        assert_eq!(sql.api_base, llm.api_base);
    }
}
