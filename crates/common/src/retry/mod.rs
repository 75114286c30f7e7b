//! Bounded retry policy for model-service calls
//!
//! A `RetryPolicy` is applied explicitly at each outbound language-model
//! or embedding call site. Database and vector-index calls never go through
//! it: their failures are structural, not transient.

use crate::config::RetryConfig;
use crate::errors::{AppError, Result};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached.
    ///
    /// Only errors for which [`AppError::is_transient`] holds are retried.
    /// Exhausting the ceiling on a transient error yields
    /// `AppError::ServiceUnavailable` naming `call_site`.
    pub async fn run<T, F, Fut>(&self, call_site: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.max_attempts;

        let schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let outcome = backoff::future::retry(schedule, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let call = op();
            async move {
                match call.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        warn!(
                            call_site = call_site,
                            attempt = attempt,
                            max_attempts = max_attempts,
                            error = %e,
                            "Model call failed, retrying"
                        );
                        crate::metrics::record_retry(call_site);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        outcome.map_err(|e| {
            if e.is_transient() {
                AppError::ServiceUnavailable {
                    message: format!(
                        "{} failed after {} attempts: {}",
                        call_site,
                        attempts.load(Ordering::SeqCst),
                        e
                    ),
                }
            } else {
                e
            }
        })
    }
}
