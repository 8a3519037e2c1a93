//! Testing Utilities Module
//!
//! In-memory doubles for driving the state machines without a node.
//!
//! ## Submodules
//!
//! - `network` - Two-chain simulation with scripted failures and call counters
//! - `swap` - Fixed-rate swap service on the simulated home chain
//! - `assertions` - Common assertions over log caches and pending entries

pub mod assertions;
pub mod network;
pub mod swap;

// Re-export commonly used items
pub use assertions::*;
pub use network::*;
pub use swap::*;
