//! Gateway-Bridge-RS: Client Library for a Home/Side Chain Gateway Bridge
//!
//! This crate moves a user's assets between a home chain and a side chain
//! through a pair of gateway contracts and an oracle that signs withdrawals:
//!
//! - **Chain** - Uniform [`ChainClient`] over either network, gateway event decoding
//! - **Logs** - Incremental, deduplicated, persisted gateway log cache
//! - **Pending** - Registry of in-flight transfer steps that survives restarts
//! - **Deposit / Withdrawal** - State machines driving transfers to completion,
//!   with nonce-based withdrawal reconciliation
//! - **EVM Module** - alloy-backed client, contract bindings, signer loading
//! - **Testing Module** - In-memory two-chain network for tests
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! gateway-bridge-rs = { path = "../gateway-bridge-rs" }
//! ```
//!
//! ## Feature Flags
//!
//! - `evm` - Enable the EVM chain client (default)
//! - `testing` - Enable the in-memory network for downstream tests
//! - `full` - Enable all features

// Core modules (always available)
pub mod balances;
pub mod chain;
pub mod config;
pub mod deposit;
pub mod error;
pub mod history;
pub mod logs;
pub mod pending;
pub mod redact;
pub mod retry;
pub mod store;
pub mod swap;
pub mod types;
pub mod withdrawal;

mod steps;

// Chain-specific modules (feature-gated)
#[cfg(feature = "evm")]
pub mod evm;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod scenarios;

// Re-export commonly used items at the crate root
pub use balances::{Balance, BalanceStore};
pub use chain::{ChainClient, DecodedLogEntry, EventKind, GatewayEvent, TransactionHandle};
pub use config::{BridgeConfig, ChainConfig, TransferPolicy};
pub use deposit::{DepositReceipt, DepositState, DepositStateMachine};
pub use error::{BridgeError, Result};
pub use history::{HistoryKind, HistoryRecord, TransferHistory};
pub use logs::{LogLoader, LogLoaderConfig, LogType, LogWrapper};
pub use pending::{PendingChange, PendingTransferTracker};
pub use retry::RetryConfig;
pub use store::{EnvKeyStore, FileStore, KeyValueStore, MemoryStore, SecureKeyStore};
pub use swap::{RateQuote, SwapService};
pub use types::{
    Asset, AssetRegistry, ChainAddress, ChainRole, Direction, PendingTransfer, TokenKind,
    TransferStep, TxReceipt, WithdrawalReceipt,
};
pub use withdrawal::{
    CompletedWithdrawal, ReconciliationOutcome, WithdrawalState, WithdrawalStateMachine,
};
