//! EVM gateway client
//!
//! Implements [`ChainClient`] over one or more HTTP JSON-RPC endpoints with a
//! wallet-filled alloy provider. Endpoints are tried in order; a transient
//! failure moves later calls to the next endpoint.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, U256},
    providers::{Provider, ProviderBuilder},
    rpc::types::Filter,
    signers::local::PrivateKeySigner,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::contracts::{HomeGateway, SideGateway, ERC20};
use crate::chain::{unsupported, ChainClient, LogFilter, RawLog, ReceiptSource, TransactionHandle};
use crate::config::{ChainConfig, TransferPolicy};
use crate::error::{BridgeError, Result};
use crate::redact::redact_url;
use crate::store::SecureKeyStore;
use crate::types::{
    Asset, ChainAddress, ChainRole, TokenKind, TxHash, TxReceipt, WithdrawalReceipt,
};

/// Parse the private key stored under `key` into a signer
pub async fn load_signer(keys: &dyn SecureKeyStore, key: &str) -> Result<PrivateKeySigner> {
    let raw = keys
        .get(key)
        .await?
        .ok_or_else(|| BridgeError::Config(format!("no private key stored under {key}")))?;
    raw.trim()
        .parse()
        .map_err(|e| BridgeError::Config(format!("invalid private key under {key}: {e}")))
}

/// Connect to `config`'s chain as `signer`
pub fn connect(
    config: &ChainConfig,
    signer: PrivateKeySigner,
    policy: &TransferPolicy,
) -> Result<Arc<dyn ChainClient>> {
    let user = signer.address();
    let wallet = EthereumWallet::from(signer);

    let mut providers = Vec::with_capacity(config.rpc_urls.len());
    for url in &config.rpc_urls {
        let parsed = url
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid RPC URL {}: {e}", redact_url(url))))?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet.clone())
            .on_http(parsed);
        providers.push(Arc::new(provider));
    }
    if providers.is_empty() {
        return Err(BridgeError::Config(format!(
            "no RPC URL configured for the {} chain",
            config.role
        )));
    }

    info!(
        role = %config.role,
        chain_id = %config.chain_id,
        endpoints = providers.len(),
        primary = %redact_url(&config.rpc_urls[0]),
        gateway = %config.gateway_address,
        address = %user,
        "Created EVM gateway client"
    );

    Ok(Arc::new(EvmChainClient {
        role: config.role,
        chain_id: config.chain_id.clone(),
        user,
        gateway: config.gateway_address,
        endpoints: Arc::new(Endpoints {
            providers,
            active: AtomicUsize::new(0),
        }),
        receipt_poll: policy.poll_interval,
        receipt_timeout: policy.receipt_timeout,
    }))
}

// ============================================================================
// Endpoints
// ============================================================================

struct Endpoints<P> {
    providers: Vec<Arc<P>>,
    active: AtomicUsize,
}

impl<P> Endpoints<P> {
    fn current(&self) -> Arc<P> {
        let index = self.active.load(Ordering::Relaxed) % self.providers.len();
        self.providers[index].clone()
    }

    fn rotate(&self, what: &str, error: &BridgeError) {
        if self.providers.len() < 2 {
            return;
        }
        let next = (self.active.fetch_add(1, Ordering::Relaxed) + 1) % self.providers.len();
        warn!(operation = what, error = %error, endpoint = next, "RPC failure, switching endpoint");
    }

    /// Run `call` against the active endpoint, rotating on transient failure
    async fn call<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: FnOnce(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = call(self.current()).await;
        if let Err(e) = &result {
            if e.is_transient() {
                self.rotate(what, e);
            }
        }
        result
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct EvmChainClient<P> {
    role: ChainRole,
    chain_id: String,
    user: Address,
    gateway: Address,
    endpoints: Arc<Endpoints<P>>,
    receipt_poll: Duration,
    receipt_timeout: Duration,
}

impl<P> EvmChainClient<P>
where
    P: Provider<Http<Client>> + 'static,
{
    fn handle(&self, hash: TxHash) -> TransactionHandle {
        debug!(role = %self.role, tx = %hash, "Transaction broadcast");
        TransactionHandle::new(
            hash,
            Arc::new(EvmReceiptSource {
                endpoints: self.endpoints.clone(),
                poll_interval: self.receipt_poll,
                timeout: self.receipt_timeout,
            }),
        )
    }

    fn require(&self, role: ChainRole, operation: &str) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(unsupported(self.role, operation))
        }
    }
}

#[async_trait]
impl<P> ChainClient for EvmChainClient<P>
where
    P: Provider<Http<Client>> + 'static,
{
    fn role(&self) -> ChainRole {
        self.role
    }

    fn address(&self) -> ChainAddress {
        ChainAddress::new(self.chain_id.clone(), self.user)
    }

    fn gateway(&self) -> Address {
        self.gateway
    }

    async fn block_number(&self) -> Result<u64> {
        self.endpoints
            .call("block_number", |p| async move { Ok(p.get_block_number().await?) })
            .await
    }

    async fn balance_of_native(&self) -> Result<U256> {
        let user = self.user;
        self.endpoints
            .call("balance", |p| async move { Ok(p.get_balance(user).await?) })
            .await
    }

    async fn balance_of_token(&self, asset: &Asset) -> Result<U256> {
        let (token, user) = (asset.address_on(self.role), self.user);
        self.endpoints
            .call("token_balance", |p| async move {
                Ok(ERC20::new(token, p).balanceOf(user).call().await?._0)
            })
            .await
    }

    async fn allowance(&self, asset: &Asset, spender: Address) -> Result<U256> {
        let (token, user) = (asset.address_on(self.role), self.user);
        self.endpoints
            .call("allowance", |p| async move {
                Ok(ERC20::new(token, p).allowance(user, spender).call().await?._0)
            })
            .await
    }

    async fn transfer_native(&self, to: Address, amount: U256) -> Result<TransactionHandle> {
        let request = alloy::rpc::types::TransactionRequest::default()
            .to(to)
            .value(amount);
        let hash = self
            .endpoints
            .call("transfer_native", |p| async move {
                Ok(*p.send_transaction(request).await?.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn transfer_token(
        &self,
        asset: &Asset,
        to: Address,
        amount: U256,
    ) -> Result<TransactionHandle> {
        let token = asset.address_on(self.role);
        let hash = self
            .endpoints
            .call("transfer_token", |p| async move {
                let pending = ERC20::new(token, p).transfer(to, amount).send().await?;
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn approve_token(
        &self,
        asset: &Asset,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionHandle> {
        let token = asset.address_on(self.role);
        let hash = self
            .endpoints
            .call("approve", |p| async move {
                let pending = ERC20::new(token, p).approve(spender, amount).send().await?;
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn deposit_native(&self, amount: U256) -> Result<TransactionHandle> {
        self.require(ChainRole::Home, "deposit_native")?;
        let gateway = self.gateway;
        let hash = self
            .endpoints
            .call("deposit_native", |p| async move {
                let pending = HomeGateway::new(gateway, p)
                    .depositETH()
                    .value(amount)
                    .send()
                    .await?;
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn deposit_token(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle> {
        self.require(ChainRole::Home, "deposit_token")?;
        let (gateway, token) = (self.gateway, asset.home_address);
        let hash = self
            .endpoints
            .call("deposit_token", |p| async move {
                let pending = HomeGateway::new(gateway, p)
                    .depositERC20(amount, token)
                    .send()
                    .await?;
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn withdraw_native(&self, amount: U256, signature: &Bytes) -> Result<TransactionHandle> {
        self.require(ChainRole::Home, "withdraw_native")?;
        let (gateway, signature) = (self.gateway, signature.clone());
        let hash = self
            .endpoints
            .call("withdraw_native", |p| async move {
                let pending = HomeGateway::new(gateway, p)
                    .withdrawETH(amount, signature)
                    .send()
                    .await?;
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn withdraw_token(
        &self,
        asset: &Asset,
        amount: U256,
        signature: &Bytes,
    ) -> Result<TransactionHandle> {
        self.require(ChainRole::Home, "withdraw_token")?;
        let (gateway, token, signature) = (self.gateway, asset.home_address, signature.clone());
        let hash = self
            .endpoints
            .call("withdraw_token", |p| async move {
                let pending = HomeGateway::new(gateway, p)
                    .withdrawERC20(amount, signature, token)
                    .send()
                    .await?;
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn request_withdrawal(&self, asset: &Asset, amount: U256) -> Result<TransactionHandle> {
        self.require(ChainRole::Side, "request_withdrawal")?;
        let (gateway, token, native) = (self.gateway, asset.side_address, asset.is_native());
        let hash = self
            .endpoints
            .call("request_withdrawal", |p| async move {
                let side = SideGateway::new(gateway, p);
                let pending = if native {
                    side.withdrawETH(amount).value(amount).send().await?
                } else {
                    side.withdrawERC20(amount, token).send().await?
                };
                Ok(*pending.tx_hash())
            })
            .await?;
        Ok(self.handle(hash))
    }

    async fn withdrawal_nonce(&self, owner: Address) -> Result<U256> {
        self.require(ChainRole::Home, "withdrawal_nonce")?;
        let gateway = self.gateway;
        self.endpoints
            .call("withdrawal_nonce", |p| async move {
                Ok(HomeGateway::new(gateway, p).nonces(owner).call().await?._0)
            })
            .await
    }

    async fn withdrawal_receipt(&self, owner: Address) -> Result<Option<WithdrawalReceipt>> {
        self.require(ChainRole::Side, "withdrawal_receipt")?;
        let gateway = self.gateway;
        let raw = self
            .endpoints
            .call("withdrawal_receipt", |p| async move {
                Ok(SideGateway::new(gateway, p)
                    .unclaimedReceipt(owner)
                    .call()
                    .await?)
            })
            .await?;
        if raw.nonce.is_zero() {
            return Ok(None);
        }
        Ok(Some(WithdrawalReceipt {
            owner: raw.receiptOwner,
            token_kind: TokenKind::try_from(raw.kind)?,
            token_contract: raw.token,
            token_amount: raw.amount,
            withdrawal_nonce: raw.nonce,
            oracle_signature: raw.signature,
        }))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        let mut query = Filter::new()
            .address(filter.address)
            .event_signature(filter.event.topic())
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        if let Some(owner) = filter.owner {
            query = query.topic1(owner.into_word());
        }

        let logs = self
            .endpoints
            .call("get_logs", |p| async move { Ok(p.get_logs(&query).await?) })
            .await?;
        debug!(
            event = ?filter.event,
            from_block = filter.from_block,
            to_block = filter.to_block,
            count = logs.len(),
            "Fetched gateway logs"
        );
        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number: log.block_number,
                tx_hash: log.transaction_hash,
                log_index: log.log_index,
            })
            .collect())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>> {
        fetch_receipt(&self.endpoints, hash).await
    }
}

// ============================================================================
// Receipts
// ============================================================================

async fn fetch_receipt<P>(endpoints: &Endpoints<P>, hash: TxHash) -> Result<Option<TxReceipt>>
where
    P: Provider<Http<Client>> + 'static,
{
    let receipt = endpoints
        .call("transaction_receipt", |p| async move {
            Ok(p.get_transaction_receipt(hash).await?)
        })
        .await?;
    // Pending receipts carry no block yet
    Ok(receipt.and_then(|r| {
        Some(TxReceipt {
            hash: r.transaction_hash,
            block_hash: r.block_hash?,
            block_number: r.block_number?,
            success: r.status(),
        })
    }))
}

/// Polls the chain for a broadcast transaction's receipt
struct EvmReceiptSource<P> {
    endpoints: Arc<Endpoints<P>>,
    poll_interval: Duration,
    timeout: Duration,
}

#[async_trait]
impl<P> ReceiptSource for EvmReceiptSource<P>
where
    P: Provider<Http<Client>> + 'static,
{
    async fn wait_for_receipt(&self, hash: TxHash) -> Result<TxReceipt> {
        let poll = async {
            loop {
                match fetch_receipt(&self.endpoints, hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => debug!(tx = %hash, "Transaction not mined yet"),
                    Err(e) if e.is_transient() => {
                        debug!(tx = %hash, error = %e, "Receipt poll failed, retrying")
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.timeout, poll)
            .await
            .map_err(|_| BridgeError::timeout(format!("receipt for {hash}"), self.timeout))?
    }
}
