//! Failure classification and retry with backoff for chain submissions
//!
//! Only `BridgeError::Transient` failures are retried. A rejection is returned
//! to the caller on the first occurrence so the state machine can surface it.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Retry configuration for transient chain failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all; the first failure is returned
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies raw RPC error messages
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// Nonce too low / already known - the transaction already exists
    NonceConflict,
    /// The chain rejected the call (revert, insufficient funds)
    Permanent,
    /// Unrecognised message
    Unknown,
}

/// Classify a raw error message
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
        || error_lower.contains("replacement transaction")
    {
        return ErrorClass::NonceConflict;
    }

    if error_lower.contains("revert")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("insufficient balance")
        || error_lower.contains("insufficient allowance")
        || error_lower.contains("exceeds balance")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid signature")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("not supported")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// The closure receives the 0-indexed attempt number. Any non-transient error,
/// or a transient error once retries are exhausted, is returned as is.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(BridgeError::Transient(msg)) if config.should_retry(attempt) => {
                let backoff = config.backoff_for_attempt(attempt);
                attempt += 1;
                warn!(
                    operation = what,
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %msg,
                    "Transient failure, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                debug!(operation = what, attempt, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}
