//! Common types shared by the chain clients, the tracker, and the state machines

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Transaction hash
pub type TxHash = B256;

// ============================================================================
// Chains
// ============================================================================

/// Which of the two bridged networks a client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    Home,
    Side,
}

impl ChainRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainRole::Home => "home",
            ChainRole::Side => "side",
        }
    }

    pub fn other(&self) -> ChainRole {
        match self {
            ChainRole::Home => ChainRole::Side,
            ChainRole::Side => ChainRole::Home,
        }
    }
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chain-scoped address
///
/// Canonical form is `"<chainId>:<0xlowercase>"`, used as a map and cache key.
/// The local part is a 20-byte address, so two addresses that differ only in
/// hex casing are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainAddress {
    pub chain_id: String,
    pub local: Address,
}

impl ChainAddress {
    pub fn new(chain_id: impl Into<String>, local: Address) -> Self {
        Self {
            chain_id: chain_id.into(),
            local,
        }
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x{}", self.chain_id, hex::encode(self.local.as_slice()))
    }
}

impl FromStr for ChainAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let (chain_id, local) = s
            .rsplit_once(':')
            .ok_or_else(|| BridgeError::Config(format!("invalid chain address: {s}")))?;
        if chain_id.is_empty() {
            return Err(BridgeError::Config(format!(
                "chain address has an empty chain id: {s}"
            )));
        }
        let local = Address::from_str(local)
            .map_err(|e| BridgeError::Config(format!("invalid address in {s}: {e}")))?;
        Ok(ChainAddress::new(chain_id, local))
    }
}

impl Serialize for ChainAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChainAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Assets
// ============================================================================

/// Gateway token-kind codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenKind {
    Eth = 0,
    Erc20 = 1,
}

impl TryFrom<u8> for TokenKind {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TokenKind::Eth),
            1 => Ok(TokenKind::Erc20),
            other => Err(BridgeError::Serialization(format!(
                "unknown token kind: {other}"
            ))),
        }
    }
}

/// A bridgeable fungible token
///
/// The native coin is the null address on both chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub decimals: u8,
    pub home_address: Address,
    pub side_address: Address,
}

impl Asset {
    pub fn native(symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
            home_address: Address::ZERO,
            side_address: Address::ZERO,
        }
    }

    pub fn token(
        symbol: impl Into<String>,
        decimals: u8,
        home_address: Address,
        side_address: Address,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
            home_address,
            side_address,
        }
    }

    pub fn is_native(&self) -> bool {
        self.home_address == Address::ZERO
    }

    pub fn kind(&self) -> TokenKind {
        if self.is_native() {
            TokenKind::Eth
        } else {
            TokenKind::Erc20
        }
    }

    pub fn address_on(&self, role: ChainRole) -> Address {
        match role {
            ChainRole::Home => self.home_address,
            ChainRole::Side => self.side_address,
        }
    }
}

/// Immutable list of bridgeable assets
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    assets: Vec<Asset>,
    by_home: HashMap<Address, usize>,
    by_side: HashMap<Address, usize>,
}

impl AssetRegistry {
    pub fn new(assets: Vec<Asset>) -> Result<Self> {
        let mut by_home = HashMap::new();
        let mut by_side = HashMap::new();
        for (i, asset) in assets.iter().enumerate() {
            if by_home.insert(asset.home_address, i).is_some() {
                return Err(BridgeError::Config(format!(
                    "duplicate home address in asset registry: {}",
                    asset.home_address
                )));
            }
            if by_side.insert(asset.side_address, i).is_some() {
                return Err(BridgeError::Config(format!(
                    "duplicate side address in asset registry: {}",
                    asset.side_address
                )));
            }
        }
        Ok(Self {
            assets,
            by_home,
            by_side,
        })
    }

    /// Parse a registry fetch: a JSON array of assets
    pub fn from_json(json: &str) -> Result<Self> {
        let assets: Vec<Asset> = serde_json::from_str(json)?;
        Self::new(assets)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("failed to read asset registry {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn by_home_address(&self, address: Address) -> Option<&Asset> {
        self.by_home.get(&address).map(|&i| &self.assets[i])
    }

    pub fn by_side_address(&self, address: Address) -> Option<&Asset> {
        self.by_side.get(&address).map(|&i| &self.assets[i])
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    /// Look up by home address, failing with `UnknownAsset`
    pub fn require_home(&self, address: Address) -> Result<&Asset> {
        self.by_home_address(address)
            .ok_or_else(|| BridgeError::UnknownAsset(address.to_string()))
    }

    pub fn native(&self) -> Option<&Asset> {
        self.by_home_address(Address::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.assets.iter()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

// ============================================================================
// Transfers
// ============================================================================

/// Direction of a bridged transfer, from the home chain's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Deposit,
    Withdrawal,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deposit => "deposit",
            Direction::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol step a pending entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStep {
    Approve,
    Convert,
    Deposit,
    Exit,
    Claim,
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStep::Approve => "approve",
            TransferStep::Convert => "convert",
            TransferStep::Deposit => "deposit",
            TransferStep::Exit => "exit",
            TransferStep::Claim => "claim",
        };
        f.write_str(s)
    }
}

/// One submitted step of an in-flight transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    /// Home-chain address of the asset
    pub asset_address: Address,
    pub hash: TxHash,
    pub submitted_at: DateTime<Utc>,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub step: TransferStep,
}

impl PendingTransfer {
    pub fn new(asset_address: Address, hash: TxHash, step: TransferStep) -> Self {
        Self {
            asset_address,
            hash,
            submitted_at: Utc::now(),
            block_hash: None,
            block_number: None,
            step,
        }
    }

    pub fn is_mined(&self) -> bool {
        self.block_hash.is_some()
    }
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub block_hash: B256,
    pub block_number: u64,
    pub success: bool,
}

/// Side-chain attestation of a requested withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub owner: Address,
    pub token_kind: TokenKind,
    /// Home-chain token address
    pub token_contract: Address,
    pub token_amount: U256,
    pub withdrawal_nonce: U256,
    pub oracle_signature: Bytes,
}
