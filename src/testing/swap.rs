//! Fixed-rate swap service

use alloy::primitives::U256;
use async_trait::async_trait;

use super::network::{submit_swap, MockNetwork};
use crate::chain::TransactionHandle;
use crate::error::{BridgeError, Result};
use crate::swap::{apply_rate, RateQuote, SwapService};
use crate::types::Asset;

/// Swaps on the mock home chain at a constant rate
#[derive(Debug, Clone)]
pub struct MockSwap {
    network: MockNetwork,
    /// Output per input, scaled by 1e18
    rate: U256,
    /// Quoted slippage tolerance in basis points
    slippage_bps: u64,
    /// Rate actually executed, to simulate a price move between quote and swap
    executed_rate: Option<U256>,
}

impl MockSwap {
    pub fn new(network: MockNetwork, rate: U256, slippage_bps: u64) -> Self {
        Self {
            network,
            rate,
            slippage_bps,
            executed_rate: None,
        }
    }

    /// Execute at `rate` regardless of the quote
    pub fn with_executed_rate(mut self, rate: U256) -> Self {
        self.executed_rate = Some(rate);
        self
    }
}

#[async_trait]
impl SwapService for MockSwap {
    async fn get_expected_rate(&self, _from: &Asset, _to: &Asset, _amount: U256) -> Result<RateQuote> {
        let slippage_rate =
            self.rate * U256::from(10_000 - self.slippage_bps.min(10_000)) / U256::from(10_000u64);
        Ok(RateQuote {
            expected_rate: self.rate,
            slippage_rate,
        })
    }

    async fn swap(
        &self,
        from: &Asset,
        to: &Asset,
        amount: U256,
        min_rate: U256,
    ) -> Result<TransactionHandle> {
        let rate = self.executed_rate.unwrap_or(self.rate);
        if rate < min_rate {
            return Err(BridgeError::Rejected(format!(
                "swap reverted: rate {rate} below minimum {min_rate}"
            )));
        }
        submit_swap(
            &self.network,
            from.home_address,
            to.home_address,
            amount,
            apply_rate(amount, rate),
        )
    }
}
