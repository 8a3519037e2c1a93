//! End-to-end transfer scenarios over the in-memory network

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{address, Address, U256};
use tokio::sync::broadcast;

use crate::balances::BalanceStore;
use crate::chain::ChainClient;
use crate::config::TransferPolicy;
use crate::deposit::{DepositState, DepositStateMachine};
use crate::error::BridgeError;
use crate::pending::{PendingChange, PendingTransferTracker};
use crate::retry::RetryConfig;
use crate::store::{FileStore, KeyValueStore};
use crate::swap::RATE_PRECISION;
use crate::testing::{
    assert_steps, signed_receipt, MockChain, MockNetwork, MockOp, MockSwap, HOME_GATEWAY,
};
use crate::types::{Asset, AssetRegistry, ChainRole, Direction, TransferStep};
use crate::withdrawal::{ReconciliationOutcome, WithdrawalStateMachine};

const X_HOME: Address = address!("1111111111111111111111111111111111111111");
const X_SIDE: Address = address!("2222222222222222222222222222222222222222");

fn asset_x() -> Asset {
    Asset::token("X", 18, X_HOME, X_SIDE)
}

fn eth() -> Asset {
    Asset::native("ETH", 18)
}

fn policy() -> TransferPolicy {
    TransferPolicy {
        deposit_confirmations: 10,
        signature_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
        receipt_timeout: Duration::from_millis(200),
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        },
    }
}

struct Bridge {
    net: MockNetwork,
    tracker: Arc<PendingTransferTracker>,
    balances: Arc<BalanceStore>,
    deposits: DepositStateMachine<MockChain, MockChain>,
    withdrawals: WithdrawalStateMachine<MockChain, MockChain>,
}

impl Bridge {
    fn new(net: MockNetwork, tracker: Arc<PendingTransferTracker>) -> Self {
        net.register_asset(&asset_x());
        net.set_auto_advance(ChainRole::Home, true);
        let balances = Arc::new(BalanceStore::new());
        let registry = Arc::new(AssetRegistry::new(vec![eth(), asset_x()]).unwrap());
        let deposits = DepositStateMachine::new(
            net.home(),
            net.side(),
            tracker.clone(),
            balances.clone(),
            policy(),
        );
        let withdrawals = WithdrawalStateMachine::new(
            net.home(),
            net.side(),
            tracker.clone(),
            balances.clone(),
            registry,
            policy(),
        );
        Self {
            net,
            tracker,
            balances,
            deposits,
            withdrawals,
        }
    }

    fn in_memory() -> Self {
        Self::new(
            MockNetwork::new(),
            Arc::new(PendingTransferTracker::in_memory()),
        )
    }
}

/// Step lists seen by a tracker subscriber, with mined flags
fn drain(changes: &mut broadcast::Receiver<PendingChange>) -> Vec<Vec<(TransferStep, bool)>> {
    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(
            change
                .entries
                .iter()
                .map(|e| (e.step, e.is_mined()))
                .collect(),
        );
    }
    seen
}

// ============================================================================
// Deposits
// ============================================================================

#[tokio::test]
async fn test_erc20_deposit_happy_path() {
    let bridge = Bridge::in_memory();
    bridge
        .net
        .set_balance(ChainRole::Home, X_HOME, U256::from(100u64));
    let mut changes = bridge.tracker.subscribe();

    let done = bridge
        .deposits
        .deposit(&asset_x(), U256::from(40u64))
        .await
        .unwrap();
    assert_eq!(done.amount, U256::from(40u64));
    assert!(done.confirmations >= 10);

    use TransferStep::{Approve, Deposit};
    assert_eq!(
        drain(&mut changes),
        vec![
            vec![(Approve, false)],
            vec![(Approve, true)],
            vec![(Approve, true), (Deposit, false)],
            vec![(Approve, true), (Deposit, true)],
            vec![],
        ]
    );
    assert_eq!(bridge.net.balance(ChainRole::Home, X_HOME), U256::from(60u64));
    assert_eq!(bridge.net.balance(ChainRole::Side, X_SIDE), U256::from(40u64));

    let side_key = BalanceStore::key_for(bridge.net.side().as_ref(), &asset_x());
    let side = bridge.balances.get(&side_key).await.unwrap();
    assert_eq!(side.amount, U256::from(40u64));
    assert!(!side.provisional);
    assert_eq!(
        bridge.deposits.state(&asset_x()).await.unwrap(),
        DepositState::Idle
    );
}

#[tokio::test]
async fn test_deposit_retry_skips_completed_approval() {
    let bridge = Bridge::in_memory();
    bridge
        .net
        .set_balance(ChainRole::Home, X_HOME, U256::from(100u64));
    bridge.net.fail_next(
        ChainRole::Home,
        MockOp::DepositToken,
        BridgeError::Rejected("execution reverted: paused".into()),
    );

    let err = bridge
        .deposits
        .deposit(&asset_x(), U256::from(40u64))
        .await
        .unwrap_err();
    assert!(err.is_rejected());
    assert!(bridge.tracker.list(Direction::Deposit, X_HOME).await.is_empty());
    assert_eq!(
        bridge.net.allowance(ChainRole::Home, X_HOME, HOME_GATEWAY),
        U256::from(40u64)
    );

    let mut changes = bridge.tracker.subscribe();
    bridge
        .deposits
        .deposit(&asset_x(), U256::from(40u64))
        .await
        .unwrap();
    assert_eq!(bridge.net.calls(ChainRole::Home, MockOp::Approve), 1);
    assert_eq!(
        drain(&mut changes).first(),
        Some(&vec![(TransferStep::Deposit, false)])
    );
    assert_eq!(bridge.net.balance(ChainRole::Side, X_SIDE), U256::from(40u64));
}

#[tokio::test]
async fn test_conversion_deposit() {
    let bridge = Bridge::in_memory();
    bridge
        .net
        .set_balance(ChainRole::Home, Address::ZERO, U256::from(10u64));
    let swap = MockSwap::new(bridge.net.clone(), RATE_PRECISION * U256::from(2u64), 100);
    let deposits = DepositStateMachine::new(
        bridge.net.home(),
        bridge.net.side(),
        bridge.tracker.clone(),
        bridge.balances.clone(),
        policy(),
    )
    .with_swap(Arc::new(swap));
    let mut changes = bridge.tracker.subscribe();

    let done = deposits
        .deposit_with_conversion(&eth(), &asset_x(), U256::from(5u64))
        .await
        .unwrap();
    assert_eq!(done.amount, U256::from(10u64));
    assert_eq!(bridge.net.balance(ChainRole::Home, Address::ZERO), U256::from(5u64));
    assert_eq!(bridge.net.balance(ChainRole::Side, X_SIDE), U256::from(10u64));

    // Every step was recorded under the source asset
    let seen = drain(&mut changes);
    let last_full = &seen[seen.len() - 2];
    assert_eq!(
        last_full
            .iter()
            .map(|(step, _)| *step)
            .collect::<Vec<_>>(),
        vec![
            TransferStep::Convert,
            TransferStep::Approve,
            TransferStep::Deposit
        ]
    );
    assert!(bridge.tracker.list(Direction::Deposit, Address::ZERO).await.is_empty());
    assert!(bridge.tracker.list(Direction::Deposit, X_HOME).await.is_empty());
}

#[tokio::test]
async fn test_interrupted_deposit_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let net = MockNetwork::new();
    net.set_balance(ChainRole::Home, Address::ZERO, U256::from(10u64));

    // First run: the deposit is broadcast, then the process dies
    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let tracker = PendingTransferTracker::restore(store).await.unwrap();
        let handle = net.home().deposit_native(U256::from(4u64)).await.unwrap();
        tracker
            .add(Direction::Deposit, Address::ZERO, TransferStep::Deposit, &handle)
            .await
            .unwrap();
    }
    net.mine_pending(ChainRole::Home);

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let tracker = Arc::new(PendingTransferTracker::restore(store.clone()).await.unwrap());
    assert_steps(
        &tracker.list(Direction::Deposit, Address::ZERO).await,
        &[TransferStep::Deposit],
    );

    let bridge = Bridge::new(net, tracker);
    assert_eq!(
        bridge.deposits.resume(&eth()).await.unwrap(),
        DepositState::Confirmed
    );
    assert!(bridge.tracker.list(Direction::Deposit, Address::ZERO).await.is_empty());
    assert!(store.keys("pending:").await.unwrap().is_empty());
    assert_eq!(bridge.net.balance(ChainRole::Side, Address::ZERO), U256::from(4u64));
}

// ============================================================================
// Withdrawals
// ============================================================================

#[tokio::test]
async fn test_withdrawal_resumed_after_restart() {
    let bridge = Bridge::in_memory();
    let amount = U256::from(25u64);
    bridge.net.set_home_nonce(U256::from(6u64));
    bridge
        .net
        .set_withdrawal_receipt(Some(signed_receipt(&asset_x(), amount, 7)));

    let outcome = bridge.withdrawals.reconcile().await.unwrap();
    assert!(matches!(outcome, ReconciliationOutcome::Claimed { asset, .. } if asset == X_HOME));
    assert_eq!(bridge.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
    assert_eq!(bridge.net.calls(ChainRole::Side, MockOp::RequestWithdrawal), 0);
    assert_eq!(bridge.net.home_nonce(), U256::from(7u64));
    assert_eq!(bridge.net.balance(ChainRole::Home, X_HOME), amount);

    // Caught up: a second pass claims nothing
    assert_eq!(
        bridge.withdrawals.reconcile().await.unwrap(),
        ReconciliationOutcome::NoOutstandingClaim { discarded: 0 }
    );
    assert_eq!(bridge.net.calls(ChainRole::Home, MockOp::WithdrawToken), 1);
}

#[tokio::test]
async fn test_equal_nonces_mean_no_outstanding_claim() {
    let bridge = Bridge::in_memory();
    bridge.net.set_home_nonce(U256::from(7u64));
    bridge
        .net
        .set_withdrawal_receipt(Some(signed_receipt(&asset_x(), U256::from(25u64), 7)));

    assert_eq!(
        bridge.withdrawals.reconcile().await.unwrap(),
        ReconciliationOutcome::NoOutstandingClaim { discarded: 0 }
    );
    assert_eq!(bridge.net.calls(ChainRole::Home, MockOp::WithdrawToken), 0);
    assert_eq!(bridge.net.calls(ChainRole::Home, MockOp::WithdrawNative), 0);
}

#[tokio::test]
async fn test_signature_timeout_then_reconcile() {
    let bridge = Bridge::in_memory();
    bridge
        .net
        .set_balance(ChainRole::Side, X_SIDE, U256::from(50u64));
    bridge.net.set_oracle_offline(true);

    let err = bridge
        .withdrawals
        .withdraw(&asset_x(), U256::from(30u64))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));
    assert_steps(
        &bridge.tracker.list(Direction::Withdrawal, X_HOME).await,
        &[TransferStep::Approve, TransferStep::Exit],
    );

    // The oracle catches up and signs the receipt left on the side chain
    let mut receipt = bridge.net.withdrawal_receipt().unwrap();
    receipt.oracle_signature = crate::testing::oracle_signature(receipt.withdrawal_nonce);
    bridge.net.set_withdrawal_receipt(Some(receipt));

    let outcome = bridge.withdrawals.reconcile().await.unwrap();
    assert!(matches!(outcome, ReconciliationOutcome::Claimed { .. }));
    assert_eq!(bridge.net.calls(ChainRole::Side, MockOp::RequestWithdrawal), 1);
    assert_eq!(bridge.net.balance(ChainRole::Home, X_HOME), U256::from(30u64));
    assert_eq!(bridge.net.balance(ChainRole::Side, X_SIDE), U256::from(20u64));
    assert!(bridge.tracker.list(Direction::Withdrawal, X_HOME).await.is_empty());
}

#[tokio::test]
async fn test_tracker_isolation_across_directions() {
    let bridge = Bridge::in_memory();
    bridge
        .net
        .set_balance(ChainRole::Home, Address::ZERO, U256::from(10u64));
    bridge
        .net
        .set_balance(ChainRole::Side, X_SIDE, U256::from(10u64));
    bridge.net.set_oracle_offline(true);

    bridge
        .withdrawals
        .withdraw(&asset_x(), U256::from(5u64))
        .await
        .unwrap_err();
    bridge
        .deposits
        .deposit(&eth(), U256::from(5u64))
        .await
        .unwrap();

    assert!(bridge.tracker.list(Direction::Deposit, X_HOME).await.is_empty());
    assert!(bridge.tracker.list(Direction::Withdrawal, Address::ZERO).await.is_empty());
    assert_eq!(bridge.tracker.list(Direction::Withdrawal, X_HOME).await.len(), 2);
}
