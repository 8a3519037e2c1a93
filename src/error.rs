//! Bridge error taxonomy
//!
//! Every fallible operation in the crate returns [`BridgeError`]. The variant,
//! not the message, decides what a caller does next:
//!
//! - `Transient` - the same call may succeed if retried (RPC/network failure)
//! - `Rejected` - the chain refused the operation; retrying the identical call
//!   fails until the underlying condition changes
//! - `Timeout` - a bounded wait expired without the expected event
//! - `ReconciliationMismatch` - local pending state disagreed with the chain
//!   and was discarded in favour of chain state

use std::time::Duration;

use crate::retry::{classify_error, ErrorClass};

/// Errors surfaced by chain clients, caches, and the transfer state machines
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out after {waited:?}: {what}")]
    Timeout { what: String, waited: Duration },

    #[error("reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("config: {0}")]
    Config(String),
}

/// Crate-wide result alias
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

impl BridgeError {
    /// Build an error from a raw RPC/contract failure message.
    ///
    /// Explicit rejections (reverts, insufficient funds, nonce conflicts) map to
    /// `Rejected`; everything else is assumed retryable.
    pub fn from_rpc(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::Permanent | ErrorClass::NonceConflict => BridgeError::Rejected(message),
            ErrorClass::Transient | ErrorClass::Unknown => BridgeError::Transient(message),
        }
    }

    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        BridgeError::Timeout {
            what: what.into(),
            waited,
        }
    }

    /// Whether retrying the identical operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, BridgeError::Rejected(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Storage(e.to_string())
    }
}

#[cfg(feature = "evm")]
impl From<alloy::transports::TransportError> for BridgeError {
    fn from(e: alloy::transports::TransportError) -> Self {
        BridgeError::from_rpc(e.to_string())
    }
}

#[cfg(feature = "evm")]
impl From<alloy::contract::Error> for BridgeError {
    fn from(e: alloy::contract::Error) -> Self {
        BridgeError::from_rpc(e.to_string())
    }
}
