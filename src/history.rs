//! Per-asset transfer history from the home gateway's logs

use alloy::primitives::U256;
use serde::Serialize;
use tracing::warn;

use crate::chain::{ChainClient, DecodedLogEntry};
use crate::logs::{LogLoader, LogType};
use crate::types::{Asset, TxHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Deposit,
    Withdrawal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub kind: HistoryKind,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferHistory {
    /// Newest first
    pub records: Vec<HistoryRecord>,
    /// Set when a chain read failed and cached logs were used instead
    pub stale: bool,
}

impl TransferHistory {
    /// Deposits and claims of `asset`, refreshed from the chain when
    /// possible. A failed refresh is not an error: whatever is cached is
    /// returned and the history is marked stale.
    pub async fn load<C: ChainClient + ?Sized>(loader: &LogLoader<C>, asset: &Asset) -> Self {
        let ((deposits, deposits_stale), (withdrawals, withdrawals_stale)) = futures::join!(
            fetch(loader, asset, LogType::Deposits),
            fetch(loader, asset, LogType::Withdrawals),
        );

        let mut records: Vec<HistoryRecord> = deposits
            .iter()
            .map(|entry| record(HistoryKind::Deposit, entry))
            .chain(
                withdrawals
                    .iter()
                    .map(|entry| record(HistoryKind::Withdrawal, entry)),
            )
            .collect();
        records.sort_by(|a, b| b.block_number.cmp(&a.block_number));

        TransferHistory {
            records,
            stale: deposits_stale || withdrawals_stale,
        }
    }

    pub fn total(&self, kind: HistoryKind) -> U256 {
        self.records
            .iter()
            .filter(|r| r.kind == kind)
            .fold(U256::ZERO, |acc, r| acc.saturating_add(r.amount))
    }
}

/// Fresh logs, or the cached ones flagged stale when the chain read fails
async fn fetch<C: ChainClient + ?Sized>(
    loader: &LogLoader<C>,
    asset: &Asset,
    log_type: LogType,
) -> (Vec<DecodedLogEntry>, bool) {
    match loader.get_logs(asset, log_type).await {
        Ok(entries) => (entries, false),
        Err(e) => {
            warn!(asset = %asset.symbol, %log_type, error = %e, "Log refresh failed, using cache");
            let cached = loader.cached_logs(asset, log_type).await.unwrap_or_else(|e| {
                warn!(asset = %asset.symbol, %log_type, error = %e, "Cached logs unreadable");
                Vec::new()
            });
            (cached, true)
        }
    }
}

fn record(kind: HistoryKind, entry: &DecodedLogEntry) -> HistoryRecord {
    HistoryRecord {
        kind,
        amount: entry.event.amount(),
        block_number: entry.block_number,
        tx_hash: entry.tx_hash,
    }
}
