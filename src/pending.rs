//! Registry of in-flight transfer steps
//!
//! Entries are keyed by `(direction, home-chain asset address)`. Every
//! mutation is a read-modify-write under one lock, and the key's new list is
//! persisted before the lock is released, so concurrent writers never lose an
//! entry and the store never lags behind memory.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::chain::TransactionHandle;
use crate::error::Result;
use crate::store::KeyValueStore;
use crate::types::{Direction, PendingTransfer, TransferStep, TxReceipt};

const KEY_PREFIX: &str = "pending:";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Snapshot of one key after a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub direction: Direction,
    pub asset_address: Address,
    pub entries: Vec<PendingTransfer>,
}

/// Persisted form of one key
#[derive(Debug, Serialize, Deserialize)]
struct PendingRecord {
    direction: Direction,
    asset_address: Address,
    entries: Vec<PendingTransfer>,
}

type Key = (Direction, Address);

fn store_key(direction: Direction, asset_address: Address) -> String {
    format!(
        "{KEY_PREFIX}{}:0x{}",
        direction.as_str(),
        hex::encode(asset_address.as_slice())
    )
}

pub struct PendingTransferTracker {
    entries: Mutex<HashMap<Key, Vec<PendingTransfer>>>,
    store: Option<Arc<dyn KeyValueStore>>,
    changes: broadcast::Sender<PendingChange>,
}

impl Default for PendingTransferTracker {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PendingTransferTracker {
    /// Tracker without persistence
    pub fn in_memory() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            store: None,
            changes,
        }
    }

    /// Tracker persisting to `store`, preloaded with whatever it holds
    pub async fn restore(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut entries = HashMap::new();
        for key in store.keys(KEY_PREFIX).await? {
            let Some(json) = store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<PendingRecord>(&json) {
                Ok(record) if !record.entries.is_empty() => {
                    entries.insert((record.direction, record.asset_address), record.entries);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping unreadable pending record");
                    store.delete(&key).await?;
                }
            }
        }
        info!(keys = entries.len(), "Restored pending transfers");

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            entries: Mutex::new(entries),
            store: Some(store),
            changes,
        })
    }

    /// Receive a snapshot after every mutation
    pub fn subscribe(&self) -> broadcast::Receiver<PendingChange> {
        self.changes.subscribe()
    }

    /// Entries for the key, oldest first; empty if none
    pub async fn list(&self, direction: Direction, asset_address: Address) -> Vec<PendingTransfer> {
        self.entries
            .lock()
            .await
            .get(&(direction, asset_address))
            .cloned()
            .unwrap_or_default()
    }

    /// Asset addresses with at least one entry in `direction`
    pub async fn assets(&self, direction: Direction) -> Vec<Address> {
        let mut assets: Vec<Address> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|((d, _), entries)| *d == direction && !entries.is_empty())
            .map(|((_, asset), _)| *asset)
            .collect();
        assets.sort();
        assets
    }

    /// Append an entry for a just-submitted step
    pub async fn add(
        &self,
        direction: Direction,
        asset_address: Address,
        step: TransferStep,
        handle: &TransactionHandle,
    ) -> Result<PendingTransfer> {
        let entry = PendingTransfer::new(asset_address, handle.hash(), step);
        let mut entries = self.entries.lock().await;
        let list = entries.entry((direction, asset_address)).or_default();
        list.push(entry.clone());
        let snapshot = list.clone();
        self.commit(direction, asset_address, snapshot).await?;
        debug!(%direction, asset = %asset_address, %step, tx = %entry.hash, "Recorded pending step");
        Ok(entry)
    }

    /// Fill in block data once mined.
    ///
    /// Targets the entry with the receipt's hash, falling back to the most
    /// recent unconfirmed entry. Returns false if nothing matched.
    pub async fn confirm(
        &self,
        direction: Direction,
        asset_address: Address,
        receipt: &TxReceipt,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(list) = entries.get_mut(&(direction, asset_address)) else {
            return Ok(false);
        };
        let index = list
            .iter()
            .rposition(|e| e.hash == receipt.hash)
            .or_else(|| list.iter().rposition(|e| !e.is_mined()));
        let Some(index) = index else {
            return Ok(false);
        };
        list[index].block_hash = Some(receipt.block_hash);
        list[index].block_number = Some(receipt.block_number);
        let snapshot = list.clone();
        self.commit(direction, asset_address, snapshot).await?;
        Ok(true)
    }

    /// Remove every entry for the key, returning what was removed
    pub async fn clear(
        &self,
        direction: Direction,
        asset_address: Address,
    ) -> Result<Vec<PendingTransfer>> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(&(direction, asset_address)).unwrap_or_default();
        if !removed.is_empty() {
            self.commit(direction, asset_address, Vec::new()).await?;
            debug!(%direction, asset = %asset_address, removed = removed.len(), "Cleared pending steps");
        }
        Ok(removed)
    }

    /// Remove only entries matching `predicate`, returning them
    pub async fn remove_where<F>(
        &self,
        direction: Direction,
        asset_address: Address,
        predicate: F,
    ) -> Result<Vec<PendingTransfer>>
    where
        F: Fn(&PendingTransfer) -> bool + Send,
    {
        let mut entries = self.entries.lock().await;
        let Some(list) = entries.get_mut(&(direction, asset_address)) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|e| predicate(e));
        if removed.is_empty() {
            *list = kept;
            return Ok(removed);
        }
        if kept.is_empty() {
            entries.remove(&(direction, asset_address));
        } else {
            *list = kept.clone();
        }
        self.commit(direction, asset_address, kept).await?;
        Ok(removed)
    }

    /// Persist and broadcast the key's new list. Called with the lock held.
    async fn commit(
        &self,
        direction: Direction,
        asset_address: Address,
        entries: Vec<PendingTransfer>,
    ) -> Result<()> {
        if let Some(store) = &self.store {
            let key = store_key(direction, asset_address);
            if entries.is_empty() {
                store.delete(&key).await?;
            } else {
                let record = PendingRecord {
                    direction,
                    asset_address,
                    entries: entries.clone(),
                };
                store.set(&key, &serde_json::to_string(&record)?).await?;
            }
        }
        // No receivers is fine
        let _ = self.changes.send(PendingChange {
            direction,
            asset_address,
            entries,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ReceiptSource;
    use crate::store::MemoryStore;
    use crate::types::TxHash;
    use alloy::primitives::{address, B256};
    use async_trait::async_trait;

    struct NeverMined;

    #[async_trait]
    impl ReceiptSource for NeverMined {
        async fn wait_for_receipt(&self, hash: TxHash) -> Result<TxReceipt> {
            Err(crate::error::BridgeError::Transient(format!("{hash} not mined")))
        }
    }

    fn handle(n: u8) -> TransactionHandle {
        TransactionHandle::new(B256::repeat_byte(n), Arc::new(NeverMined))
    }

    fn receipt(n: u8, block: u64) -> TxReceipt {
        TxReceipt {
            hash: B256::repeat_byte(n),
            block_hash: B256::repeat_byte(0xf0 | n),
            block_number: block,
            success: true,
        }
    }

    const A: Address = address!("0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a");
    const B: Address = address!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let tracker = PendingTransferTracker::in_memory();
        tracker
            .add(Direction::Deposit, A, TransferStep::Approve, &handle(1))
            .await
            .unwrap();

        assert_eq!(tracker.list(Direction::Deposit, A).await.len(), 1);
        assert!(tracker.list(Direction::Withdrawal, A).await.is_empty());
        assert!(tracker.list(Direction::Deposit, B).await.is_empty());
        assert_eq!(tracker.assets(Direction::Deposit).await, vec![A]);
        assert!(tracker.assets(Direction::Withdrawal).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_does_not_dedup_and_preserves_order() {
        let tracker = PendingTransferTracker::in_memory();
        tracker
            .add(Direction::Deposit, A, TransferStep::Approve, &handle(1))
            .await
            .unwrap();
        tracker
            .add(Direction::Deposit, A, TransferStep::Deposit, &handle(2))
            .await
            .unwrap();

        let entries = tracker.list(Direction::Deposit, A).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].step, TransferStep::Approve);
        assert_eq!(entries[1].step, TransferStep::Deposit);
    }

    #[tokio::test]
    async fn test_concurrent_adds_lose_nothing() {
        let tracker = Arc::new(PendingTransferTracker::in_memory());
        let mut tasks = Vec::new();
        for n in 0..32u8 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                tracker
                    .add(Direction::Withdrawal, A, TransferStep::Exit, &handle(n))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tracker.list(Direction::Withdrawal, A).await.len(), 32);
    }

    #[tokio::test]
    async fn test_confirm_fills_matching_entry() {
        let tracker = PendingTransferTracker::in_memory();
        tracker
            .add(Direction::Deposit, A, TransferStep::Approve, &handle(1))
            .await
            .unwrap();
        tracker
            .add(Direction::Deposit, A, TransferStep::Deposit, &handle(2))
            .await
            .unwrap();

        assert!(tracker
            .confirm(Direction::Deposit, A, &receipt(1, 10))
            .await
            .unwrap());
        let entries = tracker.list(Direction::Deposit, A).await;
        assert_eq!(entries[0].block_number, Some(10));
        assert!(!entries[1].is_mined());

        // Unknown hash falls back to the latest unconfirmed entry
        assert!(tracker
            .confirm(Direction::Deposit, A, &receipt(9, 11))
            .await
            .unwrap());
        let entries = tracker.list(Direction::Deposit, A).await;
        assert_eq!(entries[1].block_number, Some(11));

        assert!(!tracker
            .confirm(Direction::Withdrawal, A, &receipt(1, 12))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_clear_and_remove_where() {
        let tracker = PendingTransferTracker::in_memory();
        tracker
            .add(Direction::Withdrawal, A, TransferStep::Exit, &handle(1))
            .await
            .unwrap();
        tracker
            .add(Direction::Withdrawal, A, TransferStep::Claim, &handle(2))
            .await
            .unwrap();

        let removed = tracker
            .remove_where(Direction::Withdrawal, A, |e| e.step == TransferStep::Claim)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(tracker.list(Direction::Withdrawal, A).await.len(), 1);

        let removed = tracker.clear(Direction::Withdrawal, A).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(tracker.list(Direction::Withdrawal, A).await.is_empty());
        assert!(tracker.assets(Direction::Withdrawal).await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let tracker = PendingTransferTracker::restore(store.clone()).await.unwrap();
            tracker
                .add(Direction::Deposit, A, TransferStep::Approve, &handle(1))
                .await
                .unwrap();
            tracker
                .confirm(Direction::Deposit, A, &receipt(1, 7))
                .await
                .unwrap();
            tracker
                .add(Direction::Withdrawal, B, TransferStep::Exit, &handle(2))
                .await
                .unwrap();
            tracker
                .add(Direction::Deposit, B, TransferStep::Deposit, &handle(3))
                .await
                .unwrap();
            tracker.clear(Direction::Deposit, B).await.unwrap();
        }

        let restored = PendingTransferTracker::restore(store.clone()).await.unwrap();
        let deposits = restored.list(Direction::Deposit, A).await;
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].block_number, Some(7));
        assert_eq!(restored.list(Direction::Withdrawal, B).await.len(), 1);
        assert!(restored.list(Direction::Deposit, B).await.is_empty());
        assert_eq!(store.keys(KEY_PREFIX).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_snapshots() {
        let tracker = PendingTransferTracker::in_memory();
        let mut rx = tracker.subscribe();

        tracker
            .add(Direction::Deposit, A, TransferStep::Deposit, &handle(1))
            .await
            .unwrap();
        tracker.clear(Direction::Deposit, A).await.unwrap();

        let added = rx.recv().await.unwrap();
        assert_eq!(added.entries.len(), 1);
        let cleared = rx.recv().await.unwrap();
        assert!(cleared.entries.is_empty());
        assert_eq!(cleared.asset_address, A);
    }
}
