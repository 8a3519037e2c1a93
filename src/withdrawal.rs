//! Side-to-home withdrawals
//!
//! A withdrawal burns or locks funds on the side chain (`Exit`), waits for the
//! oracle to sign the resulting receipt, then claims on the home chain with
//! that signature (`Claim`). The side chain holds at most one unclaimed
//! receipt per owner; the home gateway counts claims per owner. Comparing the
//! two nonces is how [`WithdrawalStateMachine::reconcile`] tells whether a
//! claim is still owed, independent of any local state.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tracing::{debug, info, warn};

use crate::balances::BalanceStore;
use crate::chain::{ChainClient, EventKind, GatewayEvent, LogFilter, TransactionHandle};
use crate::config::TransferPolicy;
use crate::error::{BridgeError, Result};
use crate::pending::PendingTransferTracker;
use crate::retry::with_retry;
use crate::steps::StepRunner;
use crate::types::{
    Asset, AssetRegistry, Direction, PendingTransfer, TransferStep, TxReceipt, WithdrawalReceipt,
};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalState {
    Idle,
    RequestingExit,
    AwaitingSignature,
    ClaimingOnHomeChain,
    Completed,
}

impl WithdrawalState {
    /// Derive the state from the tracker entries of one asset
    pub fn derive(entries: &[PendingTransfer]) -> Self {
        let Some(last) = entries.last() else {
            return WithdrawalState::Idle;
        };
        match (last.step, last.is_mined()) {
            (TransferStep::Approve, _) => WithdrawalState::RequestingExit,
            (TransferStep::Exit, false) => WithdrawalState::RequestingExit,
            (TransferStep::Exit, true) => WithdrawalState::AwaitingSignature,
            (TransferStep::Claim, false) => WithdrawalState::ClaimingOnHomeChain,
            (TransferStep::Claim, true) => WithdrawalState::Completed,
            (TransferStep::Convert | TransferStep::Deposit, _) => WithdrawalState::Idle,
        }
    }
}

impl fmt::Display for WithdrawalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WithdrawalState::Idle => "idle",
            WithdrawalState::RequestingExit => "requesting exit",
            WithdrawalState::AwaitingSignature => "awaiting signature",
            WithdrawalState::ClaimingOnHomeChain => "claiming on home chain",
            WithdrawalState::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A withdrawal claimed on the home chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedWithdrawal {
    pub amount: U256,
    pub withdrawal_nonce: U256,
    pub claim: TxReceipt,
}

/// Result of comparing the side-chain receipt against the home-chain nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Nothing owed; `discarded` stale entries were dropped
    NoOutstandingClaim { discarded: usize },
    /// A receipt is outstanding but the oracle has not signed it yet
    AwaitingSignature { asset: Address },
    /// The outstanding receipt was claimed
    Claimed { asset: Address, receipt: TxReceipt },
}

// ============================================================================
// State machine
// ============================================================================

pub struct WithdrawalStateMachine<H: ChainClient + ?Sized, S: ChainClient + ?Sized> {
    home: Arc<H>,
    side: Arc<S>,
    steps: StepRunner,
    balances: Arc<BalanceStore>,
    registry: Arc<AssetRegistry>,
}

impl<H: ChainClient + ?Sized, S: ChainClient + ?Sized> WithdrawalStateMachine<H, S> {
    pub fn new(
        home: Arc<H>,
        side: Arc<S>,
        tracker: Arc<PendingTransferTracker>,
        balances: Arc<BalanceStore>,
        registry: Arc<AssetRegistry>,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            home,
            side,
            steps: StepRunner {
                tracker,
                policy,
                direction: Direction::Withdrawal,
            },
            balances,
            registry,
        }
    }

    fn policy(&self) -> &TransferPolicy {
        &self.steps.policy
    }

    /// Withdraw `amount` of `asset` from the side chain to the home chain.
    ///
    /// If an unclaimed receipt for the same asset is already outstanding, it
    /// is claimed instead of requesting a second exit. On `Timeout` the
    /// pending entries are kept so reconciliation can finish the claim.
    pub async fn withdraw(&self, asset: &Asset, amount: U256) -> Result<CompletedWithdrawal> {
        if amount.is_zero() {
            return Err(BridgeError::Rejected(
                "withdrawal amount must be positive".into(),
            ));
        }
        let key = asset.home_address;

        let entries = self.steps.entries(key).await;
        if entries.iter().any(|e| !e.is_mined()) {
            return Err(BridgeError::Rejected(format!(
                "a withdrawal of {} is already in flight; reconcile or cancel it first",
                asset.symbol
            )));
        }

        if let Some(outstanding) = self.outstanding_receipt().await? {
            if outstanding.token_contract != key {
                return Err(BridgeError::Rejected(format!(
                    "an unclaimed withdrawal of {} (nonce {}) must be claimed first",
                    outstanding.token_contract, outstanding.withdrawal_nonce
                )));
            }
            info!(
                asset = %asset.symbol,
                nonce = %outstanding.withdrawal_nonce,
                amount = %outstanding.token_amount,
                "Claiming outstanding receipt instead of requesting a new exit"
            );
            let result = async {
                let signed = self.ensure_signed(asset, outstanding).await?;
                self.claim(asset, key, &signed).await
            }
            .await;
            return self.finish(key, result, asset).await;
        }

        if !entries.is_empty() {
            debug!(asset = %asset.symbol, stale = entries.len(), "Dropping completed steps of an earlier attempt");
            self.steps.clear(key).await?;
        }

        info!(asset = %asset.symbol, %amount, "Starting withdrawal");
        let result = self.withdrawal_steps(asset, key, amount).await;
        self.finish(key, result, asset).await
    }

    /// Recover from an interrupted withdrawal using chain state only.
    ///
    /// Never requests an exit. Submits at most one claim. A tracked claim is
    /// awaited first and only replaced if it never gets mined while the home
    /// nonce still shows the receipt as outstanding.
    pub async fn reconcile(&self) -> Result<ReconciliationOutcome> {
        let Some(receipt) = self.outstanding_receipt().await? else {
            let discarded = self.discard_stale().await?;
            return Ok(ReconciliationOutcome::NoOutstandingClaim { discarded });
        };

        let asset = self.registry.require_home(receipt.token_contract)?.clone();
        if asset.kind() != receipt.token_kind {
            return Err(BridgeError::ReconciliationMismatch(format!(
                "receipt for {} reports kind {:?}, registry says {:?}",
                asset.symbol,
                receipt.token_kind,
                asset.kind()
            )));
        }
        let key = asset.home_address;
        if receipt.oracle_signature.is_empty() {
            info!(asset = %asset.symbol, nonce = %receipt.withdrawal_nonce, "Outstanding receipt not signed yet");
            return Ok(ReconciliationOutcome::AwaitingSignature { asset: key });
        }

        let in_flight = self
            .steps
            .entries(key)
            .await
            .into_iter()
            .rev()
            .find(|e| e.step == TransferStep::Claim && !e.is_mined());
        let result = match in_flight {
            Some(claim) => {
                info!(asset = %asset.symbol, tx = %claim.hash, "Waiting for tracked claim");
                let mined = self
                    .steps
                    .mined_by_hash(self.home.as_ref(), key, claim.hash)
                    .await;
                match mined {
                    Ok(mined) => Ok(CompletedWithdrawal {
                        amount: receipt.token_amount,
                        withdrawal_nonce: receipt.withdrawal_nonce,
                        claim: mined,
                    }),
                    Err(BridgeError::Timeout { .. }) => {
                        // The node may have dropped it; the home nonce decides
                        warn!(asset = %asset.symbol, tx = %claim.hash, "Tracked claim not mined, rechecking home nonce");
                        match self.outstanding_receipt().await? {
                            Some(current) if current.withdrawal_nonce == receipt.withdrawal_nonce => {
                                self.steps.forget(key, claim.hash).await?;
                                info!(
                                    asset = %asset.symbol,
                                    nonce = %current.withdrawal_nonce,
                                    "Resubmitting claim for outstanding receipt"
                                );
                                self.claim(&asset, key, &current).await
                            }
                            _ => {
                                let discarded = self.steps.clear(key).await?.len();
                                info!(asset = %asset.symbol, discarded, "Receipt already claimed on chain");
                                self.refresh_balances(&asset).await;
                                return Ok(ReconciliationOutcome::NoOutstandingClaim { discarded });
                            }
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                info!(
                    asset = %asset.symbol,
                    nonce = %receipt.withdrawal_nonce,
                    amount = %receipt.token_amount,
                    "Claiming outstanding receipt"
                );
                self.claim(&asset, key, &receipt).await
            }
        };
        let completed = self.finish(key, result, &asset).await?;
        Ok(ReconciliationOutcome::Claimed {
            asset: key,
            receipt: completed.claim,
        })
    }

    pub async fn state(&self, asset: &Asset) -> WithdrawalState {
        WithdrawalState::derive(&self.steps.entries(asset.home_address).await)
    }

    /// Stop tracking `asset`'s withdrawal. An exit already broadcast still
    /// produces a receipt that [`Self::reconcile`] will claim.
    pub async fn cancel(&self, asset: &Asset) -> Result<Vec<PendingTransfer>> {
        let removed = self.steps.clear(asset.home_address).await?;
        info!(asset = %asset.symbol, removed = removed.len(), "Withdrawal cancelled");
        Ok(removed)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    async fn withdrawal_steps(
        &self,
        asset: &Asset,
        key: Address,
        amount: U256,
    ) -> Result<CompletedWithdrawal> {
        if !asset.is_native() {
            self.ensure_allowance(asset, key, amount).await?;
        }

        // The exit's receipt takes the nonce after the last claimed one
        let expected_nonce = self.home_nonce().await? + U256::from(1u64);
        let handle = self
            .steps
            .submit(key, TransferStep::Exit, |_| {
                self.side.request_withdrawal(asset, amount)
            })
            .await?;
        self.balances
            .provisional_debit(&BalanceStore::key_for(self.side.as_ref(), asset), amount)
            .await;
        let exit = self.steps.mined(key, &handle).await?;
        info!(asset = %asset.symbol, tx = %exit.hash, block = exit.block_number, "Exit mined, awaiting signature");

        let signed = self
            .await_signature(asset, expected_nonce, exit.block_number)
            .await?;
        self.claim(asset, key, &signed).await
    }

    async fn ensure_allowance(&self, asset: &Asset, key: Address, amount: U256) -> Result<()> {
        let gateway = self.side.gateway();
        let allowance = with_retry(&self.policy().retry, "allowance", |_| {
            self.side.allowance(asset, gateway)
        })
        .await?;
        if allowance >= amount {
            debug!(asset = %asset.symbol, %allowance, "Allowance sufficient, skipping approval");
            return Ok(());
        }
        self.steps
            .run(key, TransferStep::Approve, |_| {
                self.side.approve_token(asset, gateway, amount)
            })
            .await?;
        Ok(())
    }

    /// The side chain's unclaimed receipt, if its nonce is ahead of the home
    /// chain's claim counter
    async fn outstanding_receipt(&self) -> Result<Option<WithdrawalReceipt>> {
        let retry = &self.policy().retry;
        let owner = self.side.address().local;
        let receipt = with_retry(retry, "withdrawal receipt", |_| {
            self.side.withdrawal_receipt(owner)
        })
        .await?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };

        let home_nonce = self.home_nonce().await?;
        debug!(
            side_nonce = %receipt.withdrawal_nonce,
            %home_nonce,
            "Compared withdrawal nonces"
        );
        Ok((receipt.withdrawal_nonce > home_nonce).then_some(receipt))
    }

    async fn home_nonce(&self) -> Result<U256> {
        let owner = self.home.address().local;
        with_retry(&self.policy().retry, "withdrawal nonce", |_| {
            self.home.withdrawal_nonce(owner)
        })
        .await
    }

    /// Wait for the oracle's `WithdrawalSigned` event for `asset` carrying
    /// `nonce`, starting at the exit's block
    async fn await_signature(
        &self,
        asset: &Asset,
        nonce: U256,
        from_block: u64,
    ) -> Result<WithdrawalReceipt> {
        let timeout = self.policy().signature_timeout;
        match tokio::time::timeout(timeout, self.watch_signature(asset, nonce, from_block)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(asset = %asset.symbol, ?timeout, "No oracle signature before timeout");
                Err(BridgeError::timeout(
                    format!("oracle signature for {}", asset.symbol),
                    timeout,
                ))
            }
        }
    }

    async fn watch_signature(
        &self,
        asset: &Asset,
        nonce: U256,
        from_block: u64,
    ) -> Result<WithdrawalReceipt> {
        let owner = self.side.address().local;
        let mut next = from_block;
        loop {
            match self.poll_signature(asset, owner, nonce, next).await {
                Ok((Some(receipt), _)) => return Ok(receipt),
                Ok((None, scanned_to)) => next = scanned_to,
                Err(e) if e.is_transient() => {
                    debug!(asset = %asset.symbol, error = %e, "Signature poll failed, retrying")
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.policy().poll_interval).await;
        }
    }

    /// One scan from `from_block` to the head. Returns the matching receipt,
    /// or the block to resume from.
    async fn poll_signature(
        &self,
        asset: &Asset,
        owner: Address,
        expected_nonce: U256,
        from_block: u64,
    ) -> Result<(Option<WithdrawalReceipt>, u64)> {
        let head = self.side.block_number().await?;
        if head < from_block {
            return Ok((None, from_block));
        }
        let filter = LogFilter {
            address: self.side.gateway(),
            event: EventKind::WithdrawalSigned,
            owner: Some(owner),
            from_block,
            to_block: head,
        };
        let signed = self
            .side
            .query_logs(&filter)
            .await?
            .into_iter()
            .find_map(|entry| match entry.event {
                GatewayEvent::WithdrawalSigned {
                    owner,
                    kind,
                    token,
                    amount,
                    nonce,
                    signature,
                } if token == asset.home_address && nonce == expected_nonce => {
                    Some(WithdrawalReceipt {
                        owner,
                        token_kind: kind,
                        token_contract: token,
                        token_amount: amount,
                        withdrawal_nonce: nonce,
                        oracle_signature: signature,
                    })
                }
                _ => None,
            });
        Ok((signed, head + 1))
    }

    /// Poll the side-chain receipt until the oracle has signed it
    async fn ensure_signed(
        &self,
        asset: &Asset,
        receipt: WithdrawalReceipt,
    ) -> Result<WithdrawalReceipt> {
        if !receipt.oracle_signature.is_empty() {
            return Ok(receipt);
        }
        let timeout = self.policy().signature_timeout;
        let owner = self.side.address().local;
        let poll = async {
            loop {
                match self.side.withdrawal_receipt(owner).await {
                    Ok(Some(r))
                        if r.withdrawal_nonce == receipt.withdrawal_nonce
                            && !r.oracle_signature.is_empty() =>
                    {
                        return Ok(r)
                    }
                    Ok(_) => debug!(asset = %asset.symbol, "Receipt not signed yet"),
                    Err(e) if e.is_transient() => {
                        debug!(asset = %asset.symbol, error = %e, "Receipt poll failed, retrying")
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.policy().poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::timeout(
                format!("oracle signature for {}", asset.symbol),
                timeout,
            )),
        }
    }

    async fn claim(
        &self,
        asset: &Asset,
        key: Address,
        receipt: &WithdrawalReceipt,
    ) -> Result<CompletedWithdrawal> {
        if asset.kind() != receipt.token_kind || asset.home_address != receipt.token_contract {
            return Err(BridgeError::ReconciliationMismatch(format!(
                "receipt for {} does not match asset {}",
                receipt.token_contract, asset.symbol
            )));
        }
        let claim = self
            .steps
            .run(key, TransferStep::Claim, |_| self.submit_claim(asset, receipt))
            .await?;
        info!(
            asset = %asset.symbol,
            amount = %receipt.token_amount,
            nonce = %receipt.withdrawal_nonce,
            tx = %claim.hash,
            "Withdrawal claimed"
        );
        Ok(CompletedWithdrawal {
            amount: receipt.token_amount,
            withdrawal_nonce: receipt.withdrawal_nonce,
            claim,
        })
    }

    async fn submit_claim(
        &self,
        asset: &Asset,
        receipt: &WithdrawalReceipt,
    ) -> Result<TransactionHandle> {
        if asset.is_native() {
            self.home
                .withdraw_native(receipt.token_amount, &receipt.oracle_signature)
                .await
        } else {
            self.home
                .withdraw_token(asset, receipt.token_amount, &receipt.oracle_signature)
                .await
        }
    }

    /// Drop tracked withdrawals that chain state shows are finished or never
    /// happened. Keys with an unmined exit or approval are kept: those
    /// transactions may still land.
    async fn discard_stale(&self) -> Result<usize> {
        let mut discarded = 0;
        for key in self.steps.tracker.assets(Direction::Withdrawal).await {
            let entries = self.steps.entries(key).await;
            let may_land = entries.iter().any(|e| {
                !e.is_mined() && matches!(e.step, TransferStep::Exit | TransferStep::Approve)
            });
            if may_land {
                debug!(asset = %key, "Keeping withdrawal with an unmined exit");
                continue;
            }
            let removed = self.steps.clear(key).await?;
            let mismatch = BridgeError::ReconciliationMismatch(format!(
                "{} pending withdrawal steps for {key} but no outstanding claim on chain",
                removed.len()
            ));
            warn!(asset = %key, error = %mismatch, "Discarding stale withdrawal steps");
            discarded += removed.len();
        }
        Ok(discarded)
    }

    async fn finish(
        &self,
        key: Address,
        result: Result<CompletedWithdrawal>,
        asset: &Asset,
    ) -> Result<CompletedWithdrawal> {
        match result {
            Ok(completed) => {
                if let Err(e) = self.steps.clear(key).await {
                    warn!(asset = %key, error = %e, "Failed to clear completed withdrawal");
                }
                self.refresh_balances(asset).await;
                Ok(completed)
            }
            Err(e @ BridgeError::Timeout { .. }) => {
                warn!(asset = %key, error = %e, "Withdrawal wait timed out, keeping pending steps");
                Err(e)
            }
            Err(e) => {
                self.steps.abort(key, &e).await;
                self.refresh_balances(asset).await;
                Err(e)
            }
        }
    }

    /// Read failures are logged by the store and keep the old values
    async fn refresh_balances(&self, asset: &Asset) {
        let _ = self.balances.refresh(self.home.as_ref(), asset).await;
        let _ = self.balances.refresh(self.side.as_ref(), asset).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::testing::{
        assert_steps, signed_receipt, MockChain, MockNetwork, MockOp, SIDE_GATEWAY,
    };
    use crate::types::ChainRole;
    use alloy::primitives::{address, B256};
    use std::time::Duration;

    const TOKEN_HOME: Address = address!("1111111111111111111111111111111111111111");
    const TOKEN_SIDE: Address = address!("2222222222222222222222222222222222222222");

    fn token() -> Asset {
        Asset::token("X", 18, TOKEN_HOME, TOKEN_SIDE)
    }

    fn eth() -> Asset {
        Asset::native("ETH", 18)
    }

    fn policy() -> TransferPolicy {
        TransferPolicy {
            deposit_confirmations: 1,
            signature_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
            receipt_timeout: Duration::from_millis(50),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
        }
    }

    fn entry(step: TransferStep, mined: bool) -> PendingTransfer {
        let mut entry = PendingTransfer::new(TOKEN_HOME, B256::repeat_byte(1), step);
        if mined {
            entry.block_hash = Some(B256::repeat_byte(2));
            entry.block_number = Some(7);
        }
        entry
    }

    struct Fixture {
        net: MockNetwork,
        tracker: Arc<PendingTransferTracker>,
        machine: WithdrawalStateMachine<MockChain, MockChain>,
    }

    fn fixture() -> Fixture {
        let net = MockNetwork::new();
        net.register_asset(&token());
        let tracker = Arc::new(PendingTransferTracker::in_memory());
        let registry = Arc::new(AssetRegistry::new(vec![eth(), token()]).unwrap());
        let machine = WithdrawalStateMachine::new(
            net.home(),
            net.side(),
            tracker.clone(),
            Arc::new(BalanceStore::new()),
            registry,
            policy(),
        );
        Fixture {
            net,
            tracker,
            machine,
        }
    }

    #[test]
    fn test_derive_states() {
        assert_eq!(WithdrawalState::derive(&[]), WithdrawalState::Idle);
        assert_eq!(
            WithdrawalState::derive(&[entry(TransferStep::Approve, true)]),
            WithdrawalState::RequestingExit
        );
        assert_eq!(
            WithdrawalState::derive(&[entry(TransferStep::Exit, false)]),
            WithdrawalState::RequestingExit
        );
        assert_eq!(
            WithdrawalState::derive(&[entry(TransferStep::Exit, true)]),
            WithdrawalState::AwaitingSignature
        );
        assert_eq!(
            WithdrawalState::derive(&[
                entry(TransferStep::Exit, true),
                entry(TransferStep::Claim, false)
            ]),
            WithdrawalState::ClaimingOnHomeChain
        );
        assert_eq!(
            WithdrawalState::derive(&[
                entry(TransferStep::Exit, true),
                entry(TransferStep::Claim, true)
            ]),
            WithdrawalState::Completed
        );
    }

    #[tokio::test]
    async fn test_native_withdrawal_end_to_end() {
        let f = fixture();
        f.net
            .set_balance(ChainRole::Side, Address::ZERO, U256::from(30u64));

        let done = f.machine.withdraw(&eth(), U256::from(12u64)).await.unwrap();
        assert_eq!(done.amount, U256::from(12u64));
        assert_eq!(done.withdrawal_nonce, U256::from(1u64));
        assert_eq!(f.net.balance(ChainRole::Home, Address::ZERO), U256::from(12u64));
        assert_eq!(f.net.balance(ChainRole::Side, Address::ZERO), U256::from(18u64));
        assert_eq!(f.net.calls(ChainRole::Side, MockOp::Approve), 0);
        assert_eq!(f.machine.state(&eth()).await, WithdrawalState::Idle);
    }

    #[tokio::test]
    async fn test_token_withdrawal_approves_side_gateway() {
        let f = fixture();
        f.net
            .set_balance(ChainRole::Side, TOKEN_SIDE, U256::from(40u64));

        f.machine.withdraw(&token(), U256::from(40u64)).await.unwrap();
        assert_eq!(f.net.calls(ChainRole::Side, MockOp::Approve), 1);
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
        assert_eq!(f.net.balance(ChainRole::Home, TOKEN_HOME), U256::from(40u64));
        assert_eq!(
            f.net.allowance(ChainRole::Side, TOKEN_SIDE, SIDE_GATEWAY),
            U256::ZERO
        );
    }

    #[tokio::test]
    async fn test_signature_timeout_keeps_exit_entry() {
        let f = fixture();
        f.net
            .set_balance(ChainRole::Side, Address::ZERO, U256::from(30u64));
        f.net.set_oracle_offline(true);

        let err = f.machine.withdraw(&eth(), U256::from(10u64)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        let entries = f.tracker.list(Direction::Withdrawal, Address::ZERO).await;
        assert_steps(&entries, &[TransferStep::Exit]);
        assert!(entries[0].is_mined());
        assert_eq!(
            f.machine.state(&eth()).await,
            WithdrawalState::AwaitingSignature
        );

        // Unsigned receipt: reconciliation must not claim yet
        assert_eq!(
            f.machine.reconcile().await.unwrap(),
            ReconciliationOutcome::AwaitingSignature {
                asset: Address::ZERO
            }
        );
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawNative), 0);
    }

    #[tokio::test]
    async fn test_retry_claims_outstanding_receipt_without_new_exit() {
        let f = fixture();
        f.net
            .set_balance(ChainRole::Side, Address::ZERO, U256::from(30u64));
        f.net.set_oracle_offline(true);
        f.machine.withdraw(&eth(), U256::from(10u64)).await.unwrap_err();

        // The oracle comes back and signs the existing receipt
        let mut receipt = f.net.withdrawal_receipt().unwrap();
        receipt.oracle_signature =
            crate::testing::oracle_signature(receipt.withdrawal_nonce);
        f.net.set_withdrawal_receipt(Some(receipt));

        let done = f.machine.withdraw(&eth(), U256::from(10u64)).await.unwrap();
        assert_eq!(done.amount, U256::from(10u64));
        assert_eq!(f.net.calls(ChainRole::Side, MockOp::RequestWithdrawal), 1);
        assert!(f.tracker.list(Direction::Withdrawal, Address::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_outstanding_receipt_for_other_asset_blocks_withdrawal() {
        let f = fixture();
        f.net.set_home_nonce(U256::from(2u64));
        f.net
            .set_withdrawal_receipt(Some(signed_receipt(&token(), U256::from(5u64), 3)));

        let err = f.machine.withdraw(&eth(), U256::from(1u64)).await.unwrap_err();
        assert!(err.is_rejected());
        assert_eq!(f.net.calls(ChainRole::Side, MockOp::RequestWithdrawal), 0);
    }

    #[tokio::test]
    async fn test_reconcile_with_equal_nonces_discards_mined_steps() {
        let f = fixture();
        f.net.set_home_nonce(U256::from(4u64));
        f.net
            .set_withdrawal_receipt(Some(signed_receipt(&token(), U256::from(5u64), 4)));

        // A finished exit for X and an unmined exit for ETH
        let exit = f
            .net
            .side()
            .request_withdrawal(&token(), U256::from(1u64))
            .await
            .unwrap();
        f.tracker
            .add(Direction::Withdrawal, TOKEN_HOME, TransferStep::Exit, &exit)
            .await
            .unwrap();
        let mined = TxReceipt {
            hash: exit.hash(),
            block_hash: B256::repeat_byte(9),
            block_number: 3,
            success: true,
        };
        f.tracker
            .confirm(Direction::Withdrawal, TOKEN_HOME, &mined)
            .await
            .unwrap();
        let unmined = f
            .net
            .side()
            .request_withdrawal(&eth(), U256::from(1u64))
            .await
            .unwrap();
        f.tracker
            .add(Direction::Withdrawal, Address::ZERO, TransferStep::Exit, &unmined)
            .await
            .unwrap();

        let outcome = f.machine.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            ReconciliationOutcome::NoOutstandingClaim { discarded: 1 }
        );
        assert!(f.tracker.list(Direction::Withdrawal, TOKEN_HOME).await.is_empty());
        assert_eq!(
            f.tracker.list(Direction::Withdrawal, Address::ZERO).await.len(),
            1
        );
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawToken), 0);
    }

    #[tokio::test]
    async fn test_reconcile_waits_for_tracked_claim() {
        let f = fixture();
        f.net.set_home_nonce(U256::from(6u64));
        let receipt = signed_receipt(&token(), U256::from(9u64), 7);
        f.net.set_withdrawal_receipt(Some(receipt.clone()));

        let claim = f
            .net
            .home()
            .withdraw_token(&token(), receipt.token_amount, &receipt.oracle_signature)
            .await
            .unwrap();
        f.tracker
            .add(Direction::Withdrawal, TOKEN_HOME, TransferStep::Claim, &claim)
            .await
            .unwrap();
        // Mined only once reconciliation is already waiting on it
        let net = f.net.clone();
        let miner = tokio::spawn(async move { net.mine_pending(ChainRole::Home) });

        let outcome = f.machine.reconcile().await.unwrap();
        miner.await.unwrap();
        assert!(matches!(outcome, ReconciliationOutcome::Claimed { asset, .. } if asset == TOKEN_HOME));
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
        assert_eq!(f.net.home_nonce(), U256::from(7u64));
    }

    #[tokio::test]
    async fn test_reconcile_replaces_dropped_claim() {
        let f = fixture();
        f.net.set_home_nonce(U256::from(6u64));
        f.net
            .set_withdrawal_receipt(Some(signed_receipt(&token(), U256::from(9u64), 7)));

        // A claim the node never saw mined
        let dropped = TransactionHandle::new(B256::repeat_byte(0xee), f.net.home());
        f.tracker
            .add(Direction::Withdrawal, TOKEN_HOME, TransferStep::Claim, &dropped)
            .await
            .unwrap();

        let outcome = f.machine.reconcile().await.unwrap();
        assert!(matches!(outcome, ReconciliationOutcome::Claimed { asset, .. } if asset == TOKEN_HOME));
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
        assert_eq!(f.net.home_nonce(), U256::from(7u64));
        assert!(f.tracker.list(Direction::Withdrawal, TOKEN_HOME).await.is_empty());

        // Nothing left to claim on the next pass
        assert_eq!(
            f.machine.reconcile().await.unwrap(),
            ReconciliationOutcome::NoOutstandingClaim { discarded: 0 }
        );
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
    }

    #[tokio::test]
    async fn test_withdraw_waits_for_tracked_claim() {
        let f = fixture();
        f.net.set_home_nonce(U256::from(6u64));
        let receipt = signed_receipt(&token(), U256::from(9u64), 7);
        f.net.set_withdrawal_receipt(Some(receipt.clone()));

        let claim = f
            .net
            .home()
            .withdraw_token(&token(), receipt.token_amount, &receipt.oracle_signature)
            .await
            .unwrap();
        f.tracker
            .add(Direction::Withdrawal, TOKEN_HOME, TransferStep::Claim, &claim)
            .await
            .unwrap();

        let err = f.machine.withdraw(&token(), U256::from(9u64)).await.unwrap_err();
        assert!(err.is_rejected());
        assert_eq!(f.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
        assert_steps(
            &f.tracker.list(Direction::Withdrawal, TOKEN_HOME).await,
            &[TransferStep::Claim],
        );
    }

    #[tokio::test]
    async fn test_signature_watch_ignores_other_nonces() {
        let f = fixture();
        f.net
            .set_balance(ChainRole::Side, Address::ZERO, U256::from(30u64));
        // An earlier exit's signature lands in the block the new exit is mined in
        f.net.emit(
            ChainRole::Side,
            1,
            GatewayEvent::WithdrawalSigned {
                owner: crate::testing::USER,
                kind: eth().kind(),
                token: Address::ZERO,
                amount: U256::from(99u64),
                nonce: U256::from(3u64),
                signature: crate::testing::oracle_signature(U256::from(3u64)),
            },
        );

        let done = f.machine.withdraw(&eth(), U256::from(12u64)).await.unwrap();
        assert_eq!(done.amount, U256::from(12u64));
        assert_eq!(done.withdrawal_nonce, U256::from(1u64));
        assert_eq!(f.net.balance(ChainRole::Home, Address::ZERO), U256::from(12u64));
    }

    #[tokio::test]
    async fn test_reconcile_rejects_unknown_token() {
        let f = fixture();
        let stranger = Asset::token(
            "Q",
            18,
            address!("3333333333333333333333333333333333333333"),
            address!("4444444444444444444444444444444444444444"),
        );
        f.net
            .set_withdrawal_receipt(Some(signed_receipt(&stranger, U256::from(1u64), 1)));

        let err = f.machine.reconcile().await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownAsset(_)));
    }

    #[tokio::test]
    async fn test_rejected_claim_clears_entries_and_keeps_receipt() {
        let f = fixture();
        f.net.set_home_nonce(U256::from(1u64));
        f.net
            .set_withdrawal_receipt(Some(signed_receipt(&eth(), U256::from(3u64), 2)));
        f.net.revert_next(ChainRole::Home, MockOp::WithdrawNative);

        let err = f.machine.reconcile().await.unwrap_err();
        assert!(err.is_rejected());
        assert!(f.tracker.list(Direction::Withdrawal, Address::ZERO).await.is_empty());
        assert!(f.net.withdrawal_receipt().is_some());
        assert_eq!(f.net.home_nonce(), U256::from(1u64));
    }
}
