//! Incremental gateway log retrieval with a persisted, versioned cache
//!
//! ## Usage
//!
//! ```ignore
//! let loader = LogLoader::new(home_client, store, config.log_loader(ChainRole::Home));
//! let deposits = loader.get_logs(&asset, LogType::Deposits).await?;
//! ```

pub mod cache;
pub mod loader;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chain::EventKind;
use crate::types::{Asset, ChainRole};

pub use cache::{LogWrapper, CURRENT_VERSION};
pub use loader::{LogLoader, LogLoaderConfig};

/// Event families cached per asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    /// Home gateway receipts of user deposits
    Deposits,
    /// Home gateway claims paid out to the user
    Withdrawals,
    /// Side gateway oracle signatures for the user's exits
    WithdrawalSigned,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Deposits => "deposits",
            LogType::Withdrawals => "withdrawals",
            LogType::WithdrawalSigned => "withdrawal_signed",
        }
    }

    /// The chain whose gateway emits this log type
    pub fn role(&self) -> ChainRole {
        match self {
            LogType::Deposits | LogType::Withdrawals => ChainRole::Home,
            LogType::WithdrawalSigned => ChainRole::Side,
        }
    }

    /// Concrete event queried for `asset`
    pub fn event_for(&self, asset: &Asset) -> EventKind {
        match self {
            LogType::Deposits if asset.is_native() => EventKind::EthReceived,
            LogType::Deposits => EventKind::Erc20Received,
            LogType::Withdrawals => EventKind::TokenWithdrawn,
            LogType::WithdrawalSigned => EventKind::WithdrawalSigned,
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence key for one cache record
pub fn cache_key(asset: &Asset, log_type: LogType) -> String {
    format!("logs:{}:{}", asset.symbol, log_type.as_str())
}
