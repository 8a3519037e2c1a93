//! Chain abstraction
//!
//! [`ChainClient`] is the uniform surface the state machines and the log
//! loader use against either network. Submissions return a
//! [`TransactionHandle`] immediately; `wait()` suspends until the transaction
//! is mined.

pub mod events;

use std::fmt;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::error::{BridgeError, Result};
use crate::types::{Asset, ChainAddress, ChainRole, TxHash, TxReceipt, WithdrawalReceipt};

pub use events::{DecodedLogEntry, EventKind, GatewayEvent};

/// A chain log as returned by the node, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub tx_hash: Option<TxHash>,
    pub log_index: Option<u64>,
}

/// Log query over an inclusive block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// Emitting contract
    pub address: Address,
    pub event: EventKind,
    /// Restrict to events whose first indexed topic is this address
    pub owner: Option<Address>,
    pub from_block: u64,
    pub to_block: u64,
}

/// Resolves a submitted transaction to its mined receipt
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn wait_for_receipt(&self, hash: TxHash) -> Result<TxReceipt>;
}

/// A broadcast transaction that may not be mined yet
#[derive(Clone)]
pub struct TransactionHandle {
    hash: TxHash,
    source: Arc<dyn ReceiptSource>,
}

impl TransactionHandle {
    pub fn new(hash: TxHash, source: Arc<dyn ReceiptSource>) -> Self {
        Self { hash, source }
    }

    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Suspend until the transaction is mined.
    ///
    /// A mined transaction whose receipt reports failure is `Rejected`.
    pub async fn wait(&self) -> Result<TxReceipt> {
        let receipt = self.source.wait_for_receipt(self.hash).await?;
        if !receipt.success {
            return Err(BridgeError::Rejected(format!(
                "transaction {} reverted in block {}",
                self.hash, receipt.block_number
            )));
        }
        Ok(receipt)
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("hash", &self.hash)
            .finish()
    }
}

/// Uniform operations against one chain on behalf of one user
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn role(&self) -> ChainRole;

    /// The user's address on this chain, stable for the client's lifetime
    fn address(&self) -> ChainAddress;

    /// This chain's gateway contract
    fn gateway(&self) -> Address;

    async fn block_number(&self) -> Result<u64>;

    async fn balance_of_native(&self) -> Result<U256>;

    async fn balance_of_token(&self, asset: &Asset) -> Result<U256>;

    async fn allowance(&self, asset: &Asset, spender: Address) -> Result<U256>;

    async fn transfer_native(&self, to: Address, amount: U256) -> Result<TransactionHandle>;

    async fn transfer_token(
        &self,
        asset: &Asset,
        to: Address,
        amount: U256,
    ) -> Result<TransactionHandle>;

    async fn approve_token(
        &self,
        asset: &Asset,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionHandle>;

    async fn deposit_native(&self, amount: U256) -> Result<TransactionHandle>;

    async fn deposit_token(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle>;

    /// Claim on this chain's gateway with a signature attested on the other chain
    async fn withdraw_native(&self, amount: U256, signature: &Bytes) -> Result<TransactionHandle>;

    async fn withdraw_token(
        &self,
        asset: &Asset,
        amount: U256,
        signature: &Bytes,
    ) -> Result<TransactionHandle>;

    /// Side-chain exit request
    async fn request_withdrawal(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle>;

    /// Home gateway's per-owner claim counter
    async fn withdrawal_nonce(&self, owner: Address) -> Result<U256>;

    /// Side gateway's outstanding receipt for `owner`
    async fn withdrawal_receipt(&self, owner: Address) -> Result<Option<WithdrawalReceipt>>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>>;

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>>;

    /// Raw log query decoded with the filter's event decoder. Logs that do not
    /// decode are skipped.
    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<DecodedLogEntry>> {
        let raw = self.get_logs(filter).await?;
        Ok(raw.iter().filter_map(|log| filter.event.decode(log)).collect())
    }

    /// Native or token balance depending on the asset
    async fn balance_of(&self, asset: &Asset) -> Result<U256> {
        if asset.is_native() {
            self.balance_of_native().await
        } else {
            self.balance_of_token(asset).await
        }
    }
}

/// Error for an operation the gateway on `role` does not offer
pub(crate) fn unsupported(role: ChainRole, operation: &str) -> BridgeError {
    BridgeError::Rejected(format!(
        "{operation} is not supported by the {role} gateway"
    ))
}
