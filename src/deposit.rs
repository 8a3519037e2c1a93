//! Home-to-side deposits
//!
//! A token deposit runs `Approve` (only when the gateway allowance is short)
//! then `Deposit`, and is confirmed once the home chain has built enough blocks
//! on top of it. The conversion variant first swaps through a DEX and deposits
//! whatever the swap produced.
//!
//! The current state is never stored: [`DepositState::derive`] computes it from
//! the tracker entries and the chain head, so a restarted process sees the same
//! state the interrupted one left behind.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tracing::{debug, info, warn};

use crate::balances::BalanceStore;
use crate::chain::{ChainClient, TransactionHandle};
use crate::config::TransferPolicy;
use crate::error::{BridgeError, Result};
use crate::pending::PendingTransferTracker;
use crate::retry::with_retry;
use crate::steps::StepRunner;
use crate::swap::SwapService;
use crate::types::{Asset, Direction, PendingTransfer, TransferStep, TxReceipt};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositState {
    Idle,
    Approving,
    Converting,
    Depositing,
    AwaitingConfirmation { confirmations: u64, required: u64 },
    Confirmed,
}

impl DepositState {
    /// Derive the state from the tracker entries of one asset.
    ///
    /// Only the latest entry matters: steps run strictly in sequence, so
    /// every earlier entry is already mined.
    pub fn derive(entries: &[PendingTransfer], head: u64, required: u64) -> Self {
        let Some(last) = entries.last() else {
            return DepositState::Idle;
        };
        match (last.step, last.block_number) {
            (TransferStep::Approve, None) => DepositState::Approving,
            (TransferStep::Convert, None) => DepositState::Converting,
            (TransferStep::Approve | TransferStep::Convert, Some(_)) => DepositState::Depositing,
            (TransferStep::Deposit, None) => DepositState::Depositing,
            (TransferStep::Deposit, Some(block)) => {
                let confirmations = head.saturating_sub(block);
                if confirmations >= required {
                    DepositState::Confirmed
                } else {
                    DepositState::AwaitingConfirmation {
                        confirmations,
                        required,
                    }
                }
            }
            (TransferStep::Exit | TransferStep::Claim, _) => DepositState::Idle,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        !matches!(self, DepositState::Idle | DepositState::Confirmed)
    }
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepositState::Idle => f.write_str("idle"),
            DepositState::Approving => f.write_str("approving"),
            DepositState::Converting => f.write_str("converting"),
            DepositState::Depositing => f.write_str("depositing"),
            DepositState::AwaitingConfirmation {
                confirmations,
                required,
            } => write!(f, "awaiting confirmation ({confirmations}/{required})"),
            DepositState::Confirmed => f.write_str("confirmed"),
        }
    }
}

/// A confirmed deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    /// Amount that reached the gateway, after conversion if any
    pub amount: U256,
    pub receipt: TxReceipt,
    pub confirmations: u64,
}

// ============================================================================
// State machine
// ============================================================================

pub struct DepositStateMachine<H: ChainClient + ?Sized, S: ChainClient + ?Sized> {
    home: Arc<H>,
    side: Arc<S>,
    steps: StepRunner,
    balances: Arc<BalanceStore>,
    swap: Option<Arc<dyn SwapService>>,
}

impl<H: ChainClient + ?Sized, S: ChainClient + ?Sized> DepositStateMachine<H, S> {
    pub fn new(
        home: Arc<H>,
        side: Arc<S>,
        tracker: Arc<PendingTransferTracker>,
        balances: Arc<BalanceStore>,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            home,
            side,
            steps: StepRunner {
                tracker,
                policy,
                direction: Direction::Deposit,
            },
            balances,
            swap: None,
        }
    }

    /// Enable [`Self::deposit_with_conversion`]
    pub fn with_swap(mut self, swap: Arc<dyn SwapService>) -> Self {
        self.swap = Some(swap);
        self
    }

    fn policy(&self) -> &TransferPolicy {
        &self.steps.policy
    }

    /// Deposit `amount` of `asset` into the home gateway and wait until the
    /// deposit is confirmed.
    ///
    /// On failure the asset's pending entries are cleared, except after a
    /// `Timeout` or once the deposit is mined. Those are left for
    /// [`Self::resume`] to pick up.
    pub async fn deposit(&self, asset: &Asset, amount: U256) -> Result<DepositReceipt> {
        let key = asset.home_address;
        self.begin(key, amount).await?;

        info!(asset = %asset.symbol, %amount, "Starting deposit");
        let result = self.deposit_steps(asset, key, amount).await;
        self.finish(key, result, &[asset]).await
    }

    /// Swap `amount` of `from` into `to` on the home chain, then deposit the
    /// converted amount of `to`. Entries are recorded under `from`.
    pub async fn deposit_with_conversion(
        &self,
        from: &Asset,
        to: &Asset,
        amount: U256,
    ) -> Result<DepositReceipt> {
        let Some(swap) = self.swap.clone() else {
            return Err(BridgeError::Config(
                "no swap service configured for conversion deposits".into(),
            ));
        };
        if to.is_native() {
            return Err(BridgeError::Rejected(format!(
                "conversion target {} must be a token",
                to.symbol
            )));
        }
        let key = from.home_address;
        self.begin(key, amount).await?;

        info!(from = %from.symbol, to = %to.symbol, %amount, "Starting conversion deposit");
        let result = async {
            let converted = self.convert(swap.as_ref(), from, to, key, amount).await?;
            self.deposit_steps(to, key, converted).await
        }
        .await;
        self.finish(key, result, &[from, to]).await
    }

    /// Current state of `asset`'s deposit
    pub async fn state(&self, asset: &Asset) -> Result<DepositState> {
        let entries = self.steps.entries(asset.home_address).await;
        if entries.is_empty() {
            return Ok(DepositState::Idle);
        }
        let head = self.home.block_number().await?;
        Ok(DepositState::derive(
            &entries,
            head,
            self.policy().deposit_confirmations,
        ))
    }

    /// Continue a deposit found in the tracker, e.g. after a restart.
    ///
    /// An unmined step is awaited by hash. A mined deposit is awaited until
    /// confirmed and then completed. Anything else cannot be continued
    /// without the original request and is reported as is.
    pub async fn resume(&self, asset: &Asset) -> Result<DepositState> {
        let key = asset.home_address;
        let entries = self.steps.entries(key).await;
        let Some(last) = entries.last().cloned() else {
            return Ok(DepositState::Idle);
        };
        info!(asset = %asset.symbol, step = %last.step, tx = %last.hash, "Resuming deposit");

        let block = match last.block_number {
            Some(block) => block,
            None => {
                let mined = self
                    .steps
                    .mined_by_hash(self.home.as_ref(), key, last.hash)
                    .await;
                match mined {
                    Ok(receipt) => receipt.block_number,
                    Err(e) => {
                        if !matches!(e, BridgeError::Timeout { .. }) {
                            self.steps.abort(key, &e).await;
                        }
                        return Err(e);
                    }
                }
            }
        };

        if last.step != TransferStep::Deposit {
            return self.state(asset).await;
        }
        let confirmations = self.wait_for_confirmations(block).await?;
        self.complete(key, &[asset]).await;
        info!(asset = %asset.symbol, confirmations, "Resumed deposit confirmed");
        Ok(DepositState::Confirmed)
    }

    /// Stop tracking `asset`'s deposit. Broadcast transactions still land.
    pub async fn cancel(&self, asset: &Asset) -> Result<Vec<PendingTransfer>> {
        let removed = self.steps.clear(asset.home_address).await?;
        info!(asset = %asset.symbol, removed = removed.len(), "Deposit cancelled");
        Ok(removed)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Refuse to start over a deposit that may still land; drop leftovers of
    /// one that cannot
    async fn begin(&self, key: Address, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Err(BridgeError::Rejected(
                "deposit amount must be positive".into(),
            ));
        }
        let entries = self.steps.entries(key).await;
        let broadcast_deposit = entries
            .iter()
            .any(|e| !e.is_mined() || e.step == TransferStep::Deposit);
        if broadcast_deposit {
            return Err(BridgeError::Rejected(format!(
                "a deposit for {key} is already in flight; resume or cancel it first"
            )));
        }
        if !entries.is_empty() {
            debug!(asset = %key, stale = entries.len(), "Dropping completed steps of an earlier attempt");
            self.steps.clear(key).await?;
        }
        Ok(())
    }

    async fn deposit_steps(&self, asset: &Asset, key: Address, amount: U256) -> Result<DepositReceipt> {
        if !asset.is_native() {
            self.ensure_allowance(asset, key, amount).await?;
        }

        let handle = self
            .steps
            .submit(key, TransferStep::Deposit, |_| self.submit_deposit(asset, amount))
            .await?;
        self.balances
            .provisional_debit(&BalanceStore::key_for(self.home.as_ref(), asset), amount)
            .await;

        let receipt = self.steps.mined(key, &handle).await?;
        let confirmations = self.wait_for_confirmations(receipt.block_number).await?;
        info!(
            asset = %asset.symbol,
            %amount,
            tx = %receipt.hash,
            block = receipt.block_number,
            confirmations,
            "Deposit confirmed"
        );
        Ok(DepositReceipt {
            amount,
            receipt,
            confirmations,
        })
    }

    async fn submit_deposit(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle> {
        if asset.is_native() {
            self.home.deposit_native(amount).await
        } else {
            self.home.deposit_token(asset, amount).await
        }
    }

    /// Approve the gateway unless the on-chain allowance already covers
    /// `amount`, e.g. from an attempt that failed after approving
    async fn ensure_allowance(&self, asset: &Asset, key: Address, amount: U256) -> Result<()> {
        let gateway = self.home.gateway();
        let allowance = with_retry(&self.policy().retry, "allowance", |_| {
            self.home.allowance(asset, gateway)
        })
        .await?;
        if allowance >= amount {
            debug!(asset = %asset.symbol, %allowance, "Allowance sufficient, skipping approval");
            return Ok(());
        }
        self.steps
            .run(key, TransferStep::Approve, |_| {
                self.home.approve_token(asset, gateway, amount)
            })
            .await?;
        Ok(())
    }

    /// Swap and return the amount of `to` the swap produced
    async fn convert(
        &self,
        swap: &dyn SwapService,
        from: &Asset,
        to: &Asset,
        key: Address,
        amount: U256,
    ) -> Result<U256> {
        let retry = &self.policy().retry;
        let quote = with_retry(retry, "rate quote", |_| swap.get_expected_rate(from, to, amount)).await?;
        debug!(
            expected = %quote.expected_output(amount),
            minimum = %quote.minimum_output(amount),
            "Quoted conversion"
        );
        let before = with_retry(retry, "balance", |_| self.home.balance_of(to)).await?;

        let handle = self
            .steps
            .submit(key, TransferStep::Convert, |_| {
                swap.swap(from, to, amount, quote.slippage_rate)
            })
            .await?;
        self.balances
            .provisional_debit(&BalanceStore::key_for(self.home.as_ref(), from), amount)
            .await;
        self.steps.mined(key, &handle).await?;

        let after = with_retry(retry, "balance", |_| self.home.balance_of(to)).await?;
        let converted = after.saturating_sub(before);
        if converted.is_zero() {
            return Err(BridgeError::Rejected(format!(
                "conversion of {amount} {} produced no {}",
                from.symbol, to.symbol
            )));
        }
        info!(from = %from.symbol, to = %to.symbol, %amount, %converted, "Conversion mined");
        Ok(converted)
    }

    /// Poll the home head until `block` has the required confirmations
    async fn wait_for_confirmations(&self, block: u64) -> Result<u64> {
        let required = self.policy().deposit_confirmations;
        loop {
            let head = with_retry(&self.policy().retry, "block number", |_| {
                self.home.block_number()
            })
            .await?;
            let confirmations = head.saturating_sub(block);
            if confirmations >= required {
                return Ok(confirmations);
            }
            debug!(block, confirmations, required, "Waiting for deposit confirmations");
            tokio::time::sleep(self.policy().poll_interval).await;
        }
    }

    async fn finish(
        &self,
        key: Address,
        result: Result<DepositReceipt>,
        assets: &[&Asset],
    ) -> Result<DepositReceipt> {
        match result {
            Ok(receipt) => {
                self.complete(key, assets).await;
                Ok(receipt)
            }
            Err(e @ BridgeError::Timeout { .. }) => {
                warn!(asset = %key, error = %e, "Deposit wait timed out, keeping pending steps");
                Err(e)
            }
            Err(e) => {
                if self.deposit_mined(key).await {
                    warn!(asset = %key, error = %e, "Deposit landed but is unconfirmed, keeping pending steps");
                    self.refresh_balances(assets).await;
                    return Err(e);
                }
                self.steps.abort(key, &e).await;
                // Provisional debits are dropped by a fresh read
                self.refresh_balances(assets).await;
                Err(e)
            }
        }
    }

    /// A mined deposit cannot be undone; only `resume` or `cancel` drops it
    async fn deposit_mined(&self, key: Address) -> bool {
        self.steps
            .entries(key)
            .await
            .iter()
            .any(|e| e.step == TransferStep::Deposit && e.is_mined())
    }

    async fn complete(&self, key: Address, assets: &[&Asset]) {
        if let Err(e) = self.steps.clear(key).await {
            warn!(asset = %key, error = %e, "Failed to clear completed deposit");
        }
        self.refresh_balances(assets).await;
    }

    /// Read failures are logged by the store and keep the old values
    async fn refresh_balances(&self, assets: &[&Asset]) {
        for asset in assets {
            let _ = self.balances.refresh(self.home.as_ref(), asset).await;
            let _ = self.balances.refresh(self.side.as_ref(), asset).await;
        }
    }
}
