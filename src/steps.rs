//! Step execution shared by the deposit and withdrawal state machines
//!
//! A step is one on-chain transaction: submitted (with retry on transient
//! failures), recorded in the tracker, then awaited until mined and confirmed
//! in place.

use std::future::Future;
use std::sync::Arc;

use alloy::primitives::Address;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, TransactionHandle};
use crate::config::TransferPolicy;
use crate::error::{BridgeError, Result};
use crate::pending::PendingTransferTracker;
use crate::retry::with_retry;
use crate::types::{Direction, PendingTransfer, TransferStep, TxHash, TxReceipt};

pub(crate) struct StepRunner {
    pub tracker: Arc<PendingTransferTracker>,
    pub policy: TransferPolicy,
    pub direction: Direction,
}

impl StepRunner {
    /// Submit and record one step without waiting for it
    pub async fn submit<F, Fut>(
        &self,
        asset_address: Address,
        step: TransferStep,
        submit: F,
    ) -> Result<TransactionHandle>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<TransactionHandle>>,
    {
        let handle = with_retry(&self.policy.retry, &step.to_string(), submit).await?;
        info!(
            direction = %self.direction,
            asset = %asset_address,
            %step,
            tx = %handle.hash(),
            "Submitted step"
        );
        self.tracker
            .add(self.direction, asset_address, step, &handle)
            .await?;
        Ok(handle)
    }

    /// Submit, record, and wait for one step
    pub async fn run<F, Fut>(
        &self,
        asset_address: Address,
        step: TransferStep,
        submit: F,
    ) -> Result<TxReceipt>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<TransactionHandle>>,
    {
        let handle = self.submit(asset_address, step, submit).await?;
        self.mined(asset_address, &handle).await
    }

    /// Wait for a handle and fill in its pending entry
    pub async fn mined(&self, asset_address: Address, handle: &TransactionHandle) -> Result<TxReceipt> {
        let receipt = with_retry(&self.policy.retry, "receipt", |_| handle.wait()).await?;
        self.tracker
            .confirm(self.direction, asset_address, &receipt)
            .await?;
        debug!(tx = %receipt.hash, block = receipt.block_number, "Step mined");
        Ok(receipt)
    }

    /// Wait for a transaction known only by hash, e.g. one recorded before a
    /// restart. Bounded by the receipt timeout.
    pub async fn mined_by_hash<C: ChainClient + ?Sized>(
        &self,
        client: &C,
        asset_address: Address,
        hash: TxHash,
    ) -> Result<TxReceipt> {
        let poll = async {
            loop {
                match client.transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => debug!(tx = %hash, "Waiting for transaction to be mined"),
                    Err(e) if e.is_transient() => {
                        debug!(tx = %hash, error = %e, "Receipt poll failed, retrying")
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.policy.poll_interval).await;
            }
        };

        let receipt = match tokio::time::timeout(self.policy.receipt_timeout, poll).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BridgeError::timeout(
                    format!("receipt for {hash}"),
                    self.policy.receipt_timeout,
                ))
            }
        };

        if !receipt.success {
            return Err(BridgeError::Rejected(format!(
                "transaction {hash} reverted in block {}",
                receipt.block_number
            )));
        }
        self.tracker
            .confirm(self.direction, asset_address, &receipt)
            .await?;
        Ok(receipt)
    }

    /// Discard local bookkeeping after a failed step
    pub async fn abort(&self, asset_address: Address, err: &BridgeError) -> Vec<PendingTransfer> {
        warn!(
            direction = %self.direction,
            asset = %asset_address,
            error = %err,
            "Transfer failed, clearing pending steps"
        );
        match self.tracker.clear(self.direction, asset_address).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(asset = %asset_address, error = %e, "Failed to clear pending steps");
                Vec::new()
            }
        }
    }

    /// Drop the entry for `hash`, e.g. a transaction the node no longer knows
    pub async fn forget(&self, asset_address: Address, hash: TxHash) -> Result<Vec<PendingTransfer>> {
        let removed = self
            .tracker
            .remove_where(self.direction, asset_address, |e| e.hash == hash)
            .await?;
        if !removed.is_empty() {
            warn!(direction = %self.direction, asset = %asset_address, tx = %hash, "Dropped pending step");
        }
        Ok(removed)
    }

    pub async fn entries(&self, asset_address: Address) -> Vec<PendingTransfer> {
        self.tracker.list(self.direction, asset_address).await
    }

    pub async fn clear(&self, asset_address: Address) -> Result<Vec<PendingTransfer>> {
        self.tracker.clear(self.direction, asset_address).await
    }
}
