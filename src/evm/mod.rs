//! EVM Chain Support Module
//!
//! [`ChainClient`](crate::chain::ChainClient) for EVM-compatible home and side
//! chains, built on alloy.
//!
//! ## Submodules
//!
//! - `client` - Gateway client with endpoint failover and receipt polling
//! - `contracts` - Gateway and ERC20 bindings using alloy sol! macro

pub mod client;
pub mod contracts;

// Re-export commonly used items
pub use client::{connect, load_signer, EvmChainClient};
pub use contracts::{HomeGateway, SideGateway, ERC20};
