//! Common Test Assertions

use std::collections::HashSet;

use crate::chain::DecodedLogEntry;
use crate::types::{PendingTransfer, TransferStep};

/// Assert no two entries share a transaction hash
pub fn assert_unique_hashes(entries: &[DecodedLogEntry]) {
    let mut seen = HashSet::new();
    for entry in entries {
        assert!(
            seen.insert(entry.tx_hash),
            "duplicate tx hash {} at block {}",
            entry.tx_hash,
            entry.block_number
        );
    }
}

/// Assert entries are ordered newest block first
pub fn assert_sorted_descending(entries: &[DecodedLogEntry]) {
    for pair in entries.windows(2) {
        assert!(
            pair[0].block_number >= pair[1].block_number,
            "entries out of order: block {} before block {}",
            pair[0].block_number,
            pair[1].block_number
        );
    }
}

/// Assert the pending entries record exactly `steps`, in order
pub fn assert_steps(entries: &[PendingTransfer], steps: &[TransferStep]) {
    let actual: Vec<TransferStep> = entries.iter().map(|e| e.step).collect();
    assert_eq!(actual, steps, "unexpected pending steps");
}
