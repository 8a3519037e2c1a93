//! DEX quote and swap collaborator for the deposit-conversion path

use alloy::primitives::U256;
use async_trait::async_trait;

use crate::chain::TransactionHandle;
use crate::error::Result;
use crate::types::Asset;

/// Fixed-point scale of quoted rates (1.0 == 1e18)
pub const RATE_PRECISION: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Quote for converting one asset into another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuote {
    /// Output units per input unit, scaled by `RATE_PRECISION`
    pub expected_rate: U256,
    /// Worst acceptable rate after slippage, same scale
    pub slippage_rate: U256,
}

impl RateQuote {
    pub fn expected_output(&self, amount: U256) -> U256 {
        apply_rate(amount, self.expected_rate)
    }

    pub fn minimum_output(&self, amount: U256) -> U256 {
        apply_rate(amount, self.slippage_rate)
    }
}

/// `amount * rate / 1e18`, saturating on overflow
pub fn apply_rate(amount: U256, rate: U256) -> U256 {
    amount.saturating_mul(rate) / RATE_PRECISION
}

/// Quote-and-swap interface of a DEX on the home chain
#[async_trait]
pub trait SwapService: Send + Sync {
    async fn get_expected_rate(&self, from: &Asset, to: &Asset, amount: U256) -> Result<RateQuote>;

    /// Swap `amount` of `from` into `to`; the swap reverts below `min_rate`
    async fn swap(
        &self,
        from: &Asset,
        to: &Asset,
        amount: U256,
        min_rate: U256,
    ) -> Result<TransactionHandle>;
}
