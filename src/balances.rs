//! Authoritative balances keyed by chain address
//!
//! Written only from chain reads. A provisional debit may be shown between a
//! submission and the next read; the next authoritative write replaces it.

use std::collections::HashMap;

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::chain::ChainClient;
use crate::error::Result;
use crate::types::{Asset, ChainAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub amount: U256,
    /// Optimistic value awaiting the next chain read
    pub provisional: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct BalanceStore {
    balances: RwLock<HashMap<ChainAddress, Balance>>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for `asset` on the chain `client` talks to
    pub fn key_for<C: ChainClient + ?Sized>(client: &C, asset: &Asset) -> ChainAddress {
        ChainAddress::new(
            client.address().chain_id,
            asset.address_on(client.role()),
        )
    }

    pub async fn get(&self, address: &ChainAddress) -> Option<Balance> {
        self.balances.read().await.get(address).cloned()
    }

    pub async fn amount(&self, address: &ChainAddress) -> Option<U256> {
        self.get(address).await.map(|b| b.amount)
    }

    /// Record a value read from the chain
    pub async fn update_balance(&self, address: ChainAddress, amount: U256) {
        debug!(address = %address, %amount, "Balance updated");
        self.balances.write().await.insert(
            address,
            Balance {
                amount,
                provisional: false,
                updated_at: Utc::now(),
            },
        );
    }

    /// Show `amount` as already spent until the next chain read.
    /// No-op when the balance was never read.
    pub async fn provisional_debit(&self, address: &ChainAddress, amount: U256) {
        let mut balances = self.balances.write().await;
        if let Some(balance) = balances.get_mut(address) {
            balance.amount = balance.amount.saturating_sub(amount);
            balance.provisional = true;
            balance.updated_at = Utc::now();
        }
    }

    pub async fn clear(&self, address: &ChainAddress) {
        self.balances.write().await.remove(address);
    }

    pub async fn snapshot(&self) -> HashMap<ChainAddress, Balance> {
        self.balances.read().await.clone()
    }

    /// Read `asset`'s balance from `client` and store it.
    ///
    /// A failed read leaves the stored value untouched: unknown is not zero.
    pub async fn refresh<C: ChainClient + ?Sized>(&self, client: &C, asset: &Asset) -> Result<U256> {
        let key = Self::key_for(client, asset);
        match client.balance_of(asset).await {
            Ok(amount) => {
                self.update_balance(key, amount).await;
                Ok(amount)
            }
            Err(e) => {
                warn!(address = %key, asset = %asset.symbol, error = %e, "Balance read failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::testing::{MockNetwork, MockOp};
    use crate::types::ChainRole;
    use alloy::primitives::Address;

    #[tokio::test]
    async fn test_provisional_debit_is_overwritten_by_read() {
        let net = MockNetwork::new();
        net.set_balance(ChainRole::Home, Address::ZERO, U256::from(100u64));
        let home = net.home();
        let eth = Asset::native("ETH", 18);
        let balances = BalanceStore::new();
        let key = BalanceStore::key_for(home.as_ref(), &eth);

        balances.refresh(home.as_ref(), &eth).await.unwrap();
        balances.provisional_debit(&key, U256::from(30u64)).await;
        let shown = balances.get(&key).await.unwrap();
        assert_eq!(shown.amount, U256::from(70u64));
        assert!(shown.provisional);

        net.set_balance(ChainRole::Home, Address::ZERO, U256::from(75u64));
        balances.refresh(home.as_ref(), &eth).await.unwrap();
        let read = balances.get(&key).await.unwrap();
        assert_eq!(read.amount, U256::from(75u64));
        assert!(!read.provisional);
    }

    #[tokio::test]
    async fn test_failed_read_keeps_last_known() {
        let net = MockNetwork::new();
        net.set_balance(ChainRole::Side, Address::ZERO, U256::from(5u64));
        let side = net.side();
        let eth = Asset::native("ETH", 18);
        let balances = BalanceStore::new();
        balances.refresh(side.as_ref(), &eth).await.unwrap();

        net.fail_next(
            ChainRole::Side,
            MockOp::Balance,
            BridgeError::Transient("timeout".into()),
        );
        assert!(balances.refresh(side.as_ref(), &eth).await.is_err());
        let key = BalanceStore::key_for(side.as_ref(), &eth);
        assert_eq!(balances.amount(&key).await, Some(U256::from(5u64)));
    }

    #[tokio::test]
    async fn test_provisional_debit_without_read_is_noop() {
        let balances = BalanceStore::new();
        let key = ChainAddress::new("1", Address::ZERO);
        balances.provisional_debit(&key, U256::from(1u64)).await;
        assert!(balances.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_keys_are_chain_scoped() {
        let net = MockNetwork::new();
        let eth = Asset::native("ETH", 18);
        let home_key = BalanceStore::key_for(net.home().as_ref(), &eth);
        let side_key = BalanceStore::key_for(net.side().as_ref(), &eth);
        assert_ne!(home_key, side_key);
    }
}
