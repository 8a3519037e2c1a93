//! In-memory home/side network
//!
//! One [`MockNetwork`] holds the state of both chains and the oracle that
//! links them. [`MockChain`] handles implement [`ChainClient`] for either side.
//! Submissions go to a mempool and are mined, one block per transaction, when
//! their handle is awaited. Effects (balances, logs, receipts) apply at mining
//! time, so a broadcast-but-unmined transaction changes nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy::primitives::{address, keccak256, Address, Bytes, U256};
use async_trait::async_trait;

use crate::chain::{
    unsupported, ChainClient, GatewayEvent, LogFilter, RawLog, ReceiptSource, TransactionHandle,
};
use crate::error::{BridgeError, Result};
use crate::types::{
    Asset, ChainAddress, ChainRole, TokenKind, TxHash, TxReceipt, WithdrawalReceipt,
};

/// The simulated user, identical on both chains
pub const USER: Address = address!("00000000000000000000000000000000000000e5");
pub const HOME_GATEWAY: Address = address!("00000000000000000000000000000000000000a1");
pub const SIDE_GATEWAY: Address = address!("00000000000000000000000000000000000000b2");
pub const HOME_CHAIN_ID: &str = "1";
pub const SIDE_CHAIN_ID: &str = "default";

/// Chain operations that can be counted or scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    BlockNumber,
    Balance,
    Allowance,
    TransferNative,
    TransferToken,
    Approve,
    DepositNative,
    DepositToken,
    WithdrawNative,
    WithdrawToken,
    RequestWithdrawal,
    WithdrawalNonce,
    WithdrawalReceipt,
    GetLogs,
    Swap,
}

#[derive(Debug, Clone)]
enum Action {
    TransferNative {
        amount: U256,
    },
    TransferToken {
        token: Address,
        amount: U256,
    },
    Approve {
        token: Address,
        spender: Address,
        amount: U256,
    },
    DepositNative {
        amount: U256,
    },
    DepositToken {
        token: Address,
        amount: U256,
    },
    Claim {
        token: Address,
        amount: U256,
        signature: Bytes,
    },
    Exit {
        side_token: Address,
        amount: U256,
    },
    Swap {
        from: Address,
        to: Address,
        amount: U256,
        output: U256,
    },
}

#[derive(Debug)]
struct Queued {
    action: Action,
    revert: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    head: u64,
    auto_advance: bool,
    native: U256,
    tokens: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    logs: Vec<RawLog>,
    mempool: HashMap<TxHash, Queued>,
    receipts: HashMap<TxHash, TxReceipt>,
    /// Scripted outcomes per call; `None` lets the call through
    failures: HashMap<MockOp, VecDeque<Option<BridgeError>>>,
    reverts: HashMap<MockOp, usize>,
    calls: HashMap<MockOp, usize>,
    log_queries: Vec<(u64, u64)>,
}

impl ChainState {
    fn record(&mut self, op: MockOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn balance(&self, token: Address) -> U256 {
        if token == Address::ZERO {
            self.native
        } else {
            self.tokens.get(&token).copied().unwrap_or_default()
        }
    }

    fn debit(&mut self, token: Address, amount: U256) -> bool {
        let current = self.balance(token);
        if current < amount {
            return false;
        }
        self.set_balance(token, current - amount);
        true
    }

    fn credit(&mut self, token: Address, amount: U256) {
        let current = self.balance(token);
        self.set_balance(token, current + amount);
    }

    fn set_balance(&mut self, token: Address, amount: U256) {
        if token == Address::ZERO {
            self.native = amount;
        } else {
            self.tokens.insert(token, amount);
        }
    }

    fn push_event(&mut self, gateway: Address, block: u64, tx_hash: TxHash, event: &GatewayEvent) {
        let (topics, data) = event.encode();
        let log_index = self.logs.len() as u64;
        self.logs.push(RawLog {
            address: gateway,
            topics,
            data,
            block_number: Some(block),
            tx_hash: Some(tx_hash),
            log_index: Some(log_index),
        });
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    home: ChainState,
    side: ChainState,
    assets: Vec<Asset>,
    /// Home gateway claim counter for `USER`
    home_nonce: U256,
    receipt: Option<WithdrawalReceipt>,
    oracle_offline: bool,
    next_tx: u64,
}

impl NetworkState {
    fn chain(&mut self, role: ChainRole) -> &mut ChainState {
        match role {
            ChainRole::Home => &mut self.home,
            ChainRole::Side => &mut self.side,
        }
    }

    fn asset_by_home(&self, token: Address) -> Option<Asset> {
        if token == Address::ZERO {
            return Some(Asset::native("ETH", 18));
        }
        self.assets.iter().find(|a| a.home_address == token).cloned()
    }

    fn asset_by_side(&self, token: Address) -> Option<Asset> {
        if token == Address::ZERO {
            return Some(Asset::native("ETH", 18));
        }
        self.assets.iter().find(|a| a.side_address == token).cloned()
    }

    fn fresh_hash(&mut self) -> TxHash {
        self.next_tx += 1;
        keccak256(self.next_tx.to_be_bytes())
    }

    /// Apply a mined action; false means the transaction reverted
    fn apply(&mut self, role: ChainRole, action: &Action, block: u64, hash: TxHash) -> bool {
        match action {
            Action::TransferNative { amount } => self.chain(role).debit(Address::ZERO, *amount),
            Action::TransferToken { token, amount } => self.chain(role).debit(*token, *amount),
            Action::Approve {
                token,
                spender,
                amount,
            } => {
                self.chain(role)
                    .allowances
                    .insert((*token, *spender), *amount);
                true
            }
            Action::DepositNative { amount } => {
                if !self.home.debit(Address::ZERO, *amount) {
                    return false;
                }
                self.side.credit(Address::ZERO, *amount);
                let event = GatewayEvent::EthReceived {
                    from: USER,
                    amount: *amount,
                };
                self.home.push_event(HOME_GATEWAY, block, hash, &event);
                true
            }
            Action::DepositToken { token, amount } => {
                let Some(asset) = self.asset_by_home(*token) else {
                    return false;
                };
                let allowance = self
                    .home
                    .allowances
                    .get(&(*token, HOME_GATEWAY))
                    .copied()
                    .unwrap_or_default();
                if allowance < *amount || !self.home.debit(*token, *amount) {
                    return false;
                }
                self.home
                    .allowances
                    .insert((*token, HOME_GATEWAY), allowance - *amount);
                self.side.credit(asset.side_address, *amount);
                let event = GatewayEvent::Erc20Received {
                    from: USER,
                    amount: *amount,
                    token: *token,
                };
                self.home.push_event(HOME_GATEWAY, block, hash, &event);
                true
            }
            Action::Claim {
                token,
                amount,
                signature,
            } => {
                let Some(receipt) = self.receipt.clone() else {
                    return false;
                };
                if receipt.withdrawal_nonce != self.home_nonce + U256::from(1u64)
                    || receipt.token_contract != *token
                    || receipt.token_amount != *amount
                    || receipt.oracle_signature != *signature
                    || signature.is_empty()
                {
                    return false;
                }
                self.home_nonce = receipt.withdrawal_nonce;
                self.home.credit(*token, *amount);
                let event = GatewayEvent::TokenWithdrawn {
                    owner: USER,
                    kind: receipt.token_kind,
                    token: *token,
                    amount: *amount,
                };
                self.home.push_event(HOME_GATEWAY, block, hash, &event);
                true
            }
            Action::Exit { side_token, amount } => {
                let Some(asset) = self.asset_by_side(*side_token) else {
                    return false;
                };
                if let Some(outstanding) = &self.receipt {
                    if outstanding.withdrawal_nonce > self.home_nonce {
                        return false;
                    }
                }
                if !asset.is_native() {
                    let allowance = self
                        .side
                        .allowances
                        .get(&(*side_token, SIDE_GATEWAY))
                        .copied()
                        .unwrap_or_default();
                    if allowance < *amount {
                        return false;
                    }
                    self.side
                        .allowances
                        .insert((*side_token, SIDE_GATEWAY), allowance - *amount);
                }
                if !self.side.debit(*side_token, *amount) {
                    return false;
                }
                let nonce = self.home_nonce + U256::from(1u64);
                let signature = if self.oracle_offline {
                    Bytes::new()
                } else {
                    oracle_signature(nonce)
                };
                self.receipt = Some(WithdrawalReceipt {
                    owner: USER,
                    token_kind: asset.kind(),
                    token_contract: asset.home_address,
                    token_amount: *amount,
                    withdrawal_nonce: nonce,
                    oracle_signature: signature.clone(),
                });
                if !self.oracle_offline {
                    let event = GatewayEvent::WithdrawalSigned {
                        owner: USER,
                        kind: asset.kind(),
                        token: asset.home_address,
                        amount: *amount,
                        nonce,
                        signature,
                    };
                    self.side.push_event(SIDE_GATEWAY, block, hash, &event);
                }
                true
            }
            Action::Swap {
                from,
                to,
                amount,
                output,
            } => {
                if !self.home.debit(*from, *amount) {
                    return false;
                }
                self.home.credit(*to, *output);
                true
            }
        }
    }
}

/// Deterministic stand-in for the oracle's 65-byte signature
pub fn oracle_signature(nonce: U256) -> Bytes {
    let digest = keccak256(nonce.to_be_bytes::<32>());
    let mut sig = Vec::with_capacity(65);
    sig.extend_from_slice(digest.as_slice());
    sig.extend_from_slice(digest.as_slice());
    sig.push(27);
    Bytes::from(sig)
}

/// Shared two-chain simulation
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn home(&self) -> Arc<MockChain> {
        Arc::new(MockChain {
            role: ChainRole::Home,
            network: self.clone(),
        })
    }

    pub fn side(&self) -> Arc<MockChain> {
        Arc::new(MockChain {
            role: ChainRole::Side,
            network: self.clone(),
        })
    }

    /// Make a token known to the gateways (home/side address mapping)
    pub fn register_asset(&self, asset: &Asset) {
        self.lock().assets.push(asset.clone());
    }

    // ------------------------------------------------------------------
    // Chain state
    // ------------------------------------------------------------------

    pub fn head(&self, role: ChainRole) -> u64 {
        self.lock().chain(role).head
    }

    pub fn set_head(&self, role: ChainRole, head: u64) {
        self.lock().chain(role).head = head;
    }

    pub fn mine_blocks(&self, role: ChainRole, blocks: u64) {
        self.lock().chain(role).head += blocks;
    }

    /// Advance the head by one block after every `block_number` call
    pub fn set_auto_advance(&self, role: ChainRole, enabled: bool) {
        self.lock().chain(role).auto_advance = enabled;
    }

    /// Balance of `token` (null address for native) on `role`
    pub fn balance(&self, role: ChainRole, token: Address) -> U256 {
        self.lock().chain(role).balance(token)
    }

    pub fn set_balance(&self, role: ChainRole, token: Address, amount: U256) {
        self.lock().chain(role).set_balance(token, amount);
    }

    pub fn allowance(&self, role: ChainRole, token: Address, spender: Address) -> U256 {
        self.lock()
            .chain(role)
            .allowances
            .get(&(token, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_allowance(&self, role: ChainRole, token: Address, spender: Address, amount: U256) {
        self.lock()
            .chain(role)
            .allowances
            .insert((token, spender), amount);
    }

    /// Add a gateway event to `role`'s log at `block` with a fresh tx hash
    pub fn emit(&self, role: ChainRole, block: u64, event: GatewayEvent) -> TxHash {
        let mut state = self.lock();
        let hash = state.fresh_hash();
        let gateway = gateway_for(role);
        state.chain(role).push_event(gateway, block, hash, &event);
        hash
    }

    /// Add a gateway event with an explicit tx hash
    pub fn emit_with_hash(&self, role: ChainRole, block: u64, hash: TxHash, event: GatewayEvent) {
        let gateway = gateway_for(role);
        self.lock().chain(role).push_event(gateway, block, hash, &event);
    }

    // ------------------------------------------------------------------
    // Gateway/oracle state
    // ------------------------------------------------------------------

    pub fn home_nonce(&self) -> U256 {
        self.lock().home_nonce
    }

    pub fn set_home_nonce(&self, nonce: U256) {
        self.lock().home_nonce = nonce;
    }

    pub fn withdrawal_receipt(&self) -> Option<WithdrawalReceipt> {
        self.lock().receipt.clone()
    }

    pub fn set_withdrawal_receipt(&self, receipt: Option<WithdrawalReceipt>) {
        self.lock().receipt = receipt;
    }

    /// While offline, exits produce unsigned receipts and no signed event
    pub fn set_oracle_offline(&self, offline: bool) {
        self.lock().oracle_offline = offline;
    }

    // ------------------------------------------------------------------
    // Scripting and inspection
    // ------------------------------------------------------------------

    /// Fail the next `op` call on `role` with `err` (queued, one per call)
    pub fn fail_next(&self, role: ChainRole, op: MockOp, err: BridgeError) {
        self.fail_after(role, op, 0, err);
    }

    /// Let `successes` more `op` calls through, then fail one with `err`
    pub fn fail_after(&self, role: ChainRole, op: MockOp, successes: usize, err: BridgeError) {
        let mut state = self.lock();
        let queue = state.chain(role).failures.entry(op).or_default();
        queue.extend(std::iter::repeat_with(|| None).take(successes));
        queue.push_back(Some(err));
    }

    /// Let the next `op` submission on `role` be mined as reverted
    pub fn revert_next(&self, role: ChainRole, op: MockOp) {
        *self.lock().chain(role).reverts.entry(op).or_default() += 1;
    }

    pub fn calls(&self, role: ChainRole, op: MockOp) -> usize {
        self.lock()
            .chain(role)
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    /// Block ranges of every `get_logs` call on `role`
    pub fn log_queries(&self, role: ChainRole) -> Vec<(u64, u64)> {
        self.lock().chain(role).log_queries.clone()
    }

    pub fn pending_transactions(&self, role: ChainRole) -> usize {
        self.lock().chain(role).mempool.len()
    }

    /// Mine everything queued on `role`, as if the node included it while
    /// nobody was waiting on the handles
    pub fn mine_pending(&self, role: ChainRole) -> Vec<TxReceipt> {
        let mut hashes: Vec<TxHash> = self.lock().chain(role).mempool.keys().copied().collect();
        hashes.sort();
        hashes
            .into_iter()
            .filter_map(|hash| self.mine(role, hash).ok())
            .collect()
    }

    fn submit(&self, role: ChainRole, op: MockOp, action: Action) -> Result<TransactionHandle> {
        let hash = {
            let mut state = self.lock();
            state.chain(role).record(op)?;
            let hash = state.fresh_hash();
            let chain = state.chain(role);
            let revert = match chain.reverts.get_mut(&op) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            chain.mempool.insert(hash, Queued { action, revert });
            hash
        };
        let source = Arc::new(MockChain {
            role,
            network: self.clone(),
        });
        Ok(TransactionHandle::new(hash, source))
    }

    /// Mine `hash` if still queued and return its receipt
    fn mine(&self, role: ChainRole, hash: TxHash) -> Result<TxReceipt> {
        let mut state = self.lock();
        if let Some(receipt) = state.chain(role).receipts.get(&hash) {
            return Ok(receipt.clone());
        }
        let Some(queued) = state.chain(role).mempool.remove(&hash) else {
            return Err(BridgeError::Transient(format!(
                "transaction {hash} not found"
            )));
        };
        let block = {
            let chain = state.chain(role);
            chain.head += 1;
            chain.head
        };
        let success = !queued.revert && state.apply(role, &queued.action, block, hash);
        let receipt = TxReceipt {
            hash,
            block_hash: keccak256(block.to_be_bytes()),
            block_number: block,
            success,
        };
        state.chain(role).receipts.insert(hash, receipt.clone());
        Ok(receipt)
    }
}

fn gateway_for(role: ChainRole) -> Address {
    match role {
        ChainRole::Home => HOME_GATEWAY,
        ChainRole::Side => SIDE_GATEWAY,
    }
}

/// One chain of a [`MockNetwork`]
#[derive(Debug, Clone)]
pub struct MockChain {
    role: ChainRole,
    network: MockNetwork,
}

impl MockChain {
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    fn record(&self, op: MockOp) -> Result<()> {
        self.network.lock().chain(self.role).record(op)
    }

    fn home_only(&self, operation: &str) -> Result<()> {
        match self.role {
            ChainRole::Home => Ok(()),
            ChainRole::Side => Err(unsupported(self.role, operation)),
        }
    }

    fn side_only(&self, operation: &str) -> Result<()> {
        match self.role {
            ChainRole::Side => Ok(()),
            ChainRole::Home => Err(unsupported(self.role, operation)),
        }
    }
}

#[async_trait]
impl ReceiptSource for MockChain {
    async fn wait_for_receipt(&self, hash: TxHash) -> Result<TxReceipt> {
        self.network.mine(self.role, hash)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn role(&self) -> ChainRole {
        self.role
    }

    fn address(&self) -> ChainAddress {
        let chain_id = match self.role {
            ChainRole::Home => HOME_CHAIN_ID,
            ChainRole::Side => SIDE_CHAIN_ID,
        };
        ChainAddress::new(chain_id, USER)
    }

    fn gateway(&self) -> Address {
        gateway_for(self.role)
    }

    async fn block_number(&self) -> Result<u64> {
        let mut state = self.network.lock();
        let chain = state.chain(self.role);
        chain.record(MockOp::BlockNumber)?;
        let head = chain.head;
        if chain.auto_advance {
            chain.head += 1;
        }
        Ok(head)
    }

    async fn balance_of_native(&self) -> Result<U256> {
        let mut state = self.network.lock();
        let chain = state.chain(self.role);
        chain.record(MockOp::Balance)?;
        Ok(chain.native)
    }

    async fn balance_of_token(&self, asset: &Asset) -> Result<U256> {
        let mut state = self.network.lock();
        let chain = state.chain(self.role);
        chain.record(MockOp::Balance)?;
        Ok(chain.balance(asset.address_on(self.role)))
    }

    async fn allowance(&self, asset: &Asset, spender: Address) -> Result<U256> {
        let mut state = self.network.lock();
        let chain = state.chain(self.role);
        chain.record(MockOp::Allowance)?;
        Ok(chain
            .allowances
            .get(&(asset.address_on(self.role), spender))
            .copied()
            .unwrap_or_default())
    }

    async fn transfer_native(&self, _to: Address, amount: U256) -> Result<TransactionHandle> {
        self.network.submit(
            self.role,
            MockOp::TransferNative,
            Action::TransferNative { amount },
        )
    }

    async fn transfer_token(
        &self,
        asset: &Asset,
        _to: Address,
        amount: U256,
    ) -> Result<TransactionHandle> {
        self.network.submit(
            self.role,
            MockOp::TransferToken,
            Action::TransferToken {
                token: asset.address_on(self.role),
                amount,
            },
        )
    }

    async fn approve_token(
        &self,
        asset: &Asset,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionHandle> {
        self.network.submit(
            self.role,
            MockOp::Approve,
            Action::Approve {
                token: asset.address_on(self.role),
                spender,
                amount,
            },
        )
    }

    async fn deposit_native(&self, amount: U256) -> Result<TransactionHandle> {
        self.home_only("deposit_native")?;
        self.network.submit(
            self.role,
            MockOp::DepositNative,
            Action::DepositNative { amount },
        )
    }

    async fn deposit_token(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle> {
        self.home_only("deposit_token")?;
        self.network.submit(
            self.role,
            MockOp::DepositToken,
            Action::DepositToken {
                token: asset.home_address,
                amount,
            },
        )
    }

    async fn withdraw_native(&self, amount: U256, signature: &Bytes) -> Result<TransactionHandle> {
        self.home_only("withdraw_native")?;
        self.network.submit(
            self.role,
            MockOp::WithdrawNative,
            Action::Claim {
                token: Address::ZERO,
                amount,
                signature: signature.clone(),
            },
        )
    }

    async fn withdraw_token(
        &self,
        asset: &Asset,
        amount: U256,
        signature: &Bytes,
    ) -> Result<TransactionHandle> {
        self.home_only("withdraw_token")?;
        self.network.submit(
            self.role,
            MockOp::WithdrawToken,
            Action::Claim {
                token: asset.home_address,
                amount,
                signature: signature.clone(),
            },
        )
    }

    async fn request_withdrawal(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle> {
        self.side_only("request_withdrawal")?;
        self.network.submit(
            self.role,
            MockOp::RequestWithdrawal,
            Action::Exit {
                side_token: asset.side_address,
                amount,
            },
        )
    }

    async fn withdrawal_nonce(&self, owner: Address) -> Result<U256> {
        self.home_only("withdrawal_nonce")?;
        self.record(MockOp::WithdrawalNonce)?;
        if owner == USER {
            Ok(self.network.home_nonce())
        } else {
            Ok(U256::ZERO)
        }
    }

    async fn withdrawal_receipt(&self, owner: Address) -> Result<Option<WithdrawalReceipt>> {
        self.side_only("withdrawal_receipt")?;
        self.record(MockOp::WithdrawalReceipt)?;
        Ok(self
            .network
            .withdrawal_receipt()
            .filter(|r| r.owner == owner))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        let mut state = self.network.lock();
        let chain = state.chain(self.role);
        chain.record(MockOp::GetLogs)?;
        chain.log_queries.push((filter.from_block, filter.to_block));

        let topic0 = filter.event.topic();
        let owner_topic = filter.owner.map(|o| o.into_word());
        Ok(chain
            .logs
            .iter()
            .filter(|log| log.address == filter.address)
            .filter(|log| log.topics.first() == Some(&topic0))
            .filter(|log| match owner_topic {
                Some(topic) => log.topics.get(1) == Some(&topic),
                None => true,
            })
            .filter(|log| {
                log.block_number
                    .is_some_and(|b| b >= filter.from_block && b <= filter.to_block)
            })
            .cloned()
            .collect())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>> {
        let mut state = self.network.lock();
        Ok(state.chain(self.role).receipts.get(&hash).cloned())
    }
}

/// Swap submission used by [`super::MockSwap`]
pub(crate) fn submit_swap(
    network: &MockNetwork,
    from: Address,
    to: Address,
    amount: U256,
    output: U256,
) -> Result<TransactionHandle> {
    network.submit(
        ChainRole::Home,
        MockOp::Swap,
        Action::Swap {
            from,
            to,
            amount,
            output,
        },
    )
}

/// Receipt for a token withdrawal signed by the mock oracle
pub fn signed_receipt(asset: &Asset, amount: U256, nonce: u64) -> WithdrawalReceipt {
    let nonce = U256::from(nonce);
    WithdrawalReceipt {
        owner: USER,
        token_kind: if asset.is_native() {
            TokenKind::Eth
        } else {
            TokenKind::Erc20
        },
        token_contract: asset.home_address,
        token_amount: amount,
        withdrawal_nonce: nonce,
        oracle_signature: oracle_signature(nonce),
    }
}
