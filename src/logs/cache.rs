//! Persisted log cache record and its schema migrations

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chain::DecodedLogEntry;

/// Schema version written by this build
pub const CURRENT_VERSION: u32 = 1;

/// Cached logs for one (asset symbol, log type) key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogWrapper {
    /// Logs up to and including this block have been fetched
    pub last_block_number: u64,
    /// Sorted descending by block; unique by transaction hash
    pub logs: Vec<DecodedLogEntry>,
    #[serde(default)]
    pub migration_version: u32,
}

impl LogWrapper {
    /// Merge fetched entries.
    ///
    /// An entry whose transaction hash is already present is dropped, so the
    /// first occurrence found always wins. The result is re-sorted.
    /// Returns the number of entries added.
    pub fn merge(&mut self, fetched: Vec<DecodedLogEntry>) -> usize {
        let mut seen: HashSet<_> = self.logs.iter().map(|e| e.tx_hash).collect();
        let before = self.logs.len();
        for entry in fetched {
            if seen.insert(entry.tx_hash) {
                self.logs.push(entry);
            }
        }
        self.sort();
        self.logs.len() - before
    }

    /// Advance the fetched watermark; never moves backwards
    pub fn advance_to(&mut self, block: u64) {
        self.last_block_number = self.last_block_number.max(block);
    }

    fn sort(&mut self) {
        self.logs.sort_by(|a, b| {
            b.block_number
                .cmp(&a.block_number)
                .then(b.log_index.cmp(&a.log_index))
        });
    }
}

/// Bring a record up to `CURRENT_VERSION`, one version step at a time
pub fn migrate(mut wrapper: LogWrapper, genesis_block: u64) -> LogWrapper {
    while wrapper.migration_version < CURRENT_VERSION {
        wrapper = match wrapper.migration_version {
            0 => migrate_v0_to_v1(wrapper, genesis_block),
            // No step defined: stamp the current version rather than loop
            _ => LogWrapper {
                migration_version: CURRENT_VERSION,
                ..wrapper
            },
        };
    }
    wrapper
}

/// v0 caches were scanned from block 0 with the wrong watermark semantics.
/// Drop them and restart from the genesis of interest.
fn migrate_v0_to_v1(wrapper: LogWrapper, genesis_block: u64) -> LogWrapper {
    info!(
        dropped = wrapper.logs.len(),
        previous_block = wrapper.last_block_number,
        genesis_block,
        "Resetting pre-v1 log cache"
    );
    LogWrapper {
        last_block_number: genesis_block,
        logs: Vec::new(),
        migration_version: 1,
    }
}
