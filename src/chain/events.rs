//! Gateway event topics and decoding
//!
//! Home gateway:
//! - `ETHReceived(address indexed from, uint256 amount)`
//! - `ERC20Received(address indexed from, uint256 amount, address indexed contractAddress)`
//! - `TokenWithdrawn(address indexed owner, uint8 kind, address indexed contractAddress, uint256 value)`
//!
//! Side gateway:
//! - `TokenWithdrawalSigned(address indexed tokenOwner, address indexed tokenContract,
//!   uint8 tokenKind, uint256 amount, uint256 nonce, bytes sig)`
//!
//! Token addresses in every event are home-chain addresses.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::RawLog;
use crate::types::{TokenKind, TxHash};

/// Gateway event types the loader and watchers query for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    EthReceived,
    Erc20Received,
    TokenWithdrawn,
    WithdrawalSigned,
}

impl EventKind {
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::EthReceived => "ETHReceived(address,uint256)",
            EventKind::Erc20Received => "ERC20Received(address,uint256,address)",
            EventKind::TokenWithdrawn => "TokenWithdrawn(address,uint8,address,uint256)",
            EventKind::WithdrawalSigned => {
                "TokenWithdrawalSigned(address,address,uint8,uint256,uint256,bytes)"
            }
        }
    }

    /// topic0 of the event
    pub fn topic(&self) -> B256 {
        keccak256(self.signature().as_bytes())
    }

    /// Decode a raw log of this kind.
    ///
    /// Returns `None` for logs of another kind, logs still pending (no block
    /// number or hash), and malformed payloads.
    pub fn decode(&self, log: &RawLog) -> Option<DecodedLogEntry> {
        let topics = &log.topics;
        if topics.first() != Some(&self.topic()) {
            return None;
        }

        let block_number = log.block_number?;
        let tx_hash = log.tx_hash?;
        let log_index = log.log_index.unwrap_or_default();
        let data = log.data.as_ref();

        let event = match self {
            EventKind::EthReceived => {
                // topic[1] = from; data: [0..32] amount
                if topics.len() < 2 || data.len() < 32 {
                    return None;
                }
                GatewayEvent::EthReceived {
                    from: Address::from_word(topics[1]),
                    amount: U256::from_be_slice(&data[0..32]),
                }
            }
            EventKind::Erc20Received => {
                // topic[1] = from, topic[2] = contractAddress; data: [0..32] amount
                if topics.len() < 3 || data.len() < 32 {
                    return None;
                }
                GatewayEvent::Erc20Received {
                    from: Address::from_word(topics[1]),
                    amount: U256::from_be_slice(&data[0..32]),
                    token: Address::from_word(topics[2]),
                }
            }
            EventKind::TokenWithdrawn => {
                // topic[1] = owner, topic[2] = contractAddress
                // data: [0..32] kind (uint8), [32..64] value
                if topics.len() < 3 || data.len() < 64 {
                    return None;
                }
                GatewayEvent::TokenWithdrawn {
                    owner: Address::from_word(topics[1]),
                    kind: decode_kind(&data[0..32])?,
                    token: Address::from_word(topics[2]),
                    amount: U256::from_be_slice(&data[32..64]),
                }
            }
            EventKind::WithdrawalSigned => {
                // topic[1] = tokenOwner, topic[2] = tokenContract
                // data: [0..32] kind, [32..64] amount, [64..96] nonce,
                //       [96..128] offset of sig, then length-prefixed sig
                if topics.len() < 3 || data.len() < 128 {
                    return None;
                }
                GatewayEvent::WithdrawalSigned {
                    owner: Address::from_word(topics[1]),
                    token: Address::from_word(topics[2]),
                    kind: decode_kind(&data[0..32])?,
                    amount: U256::from_be_slice(&data[32..64]),
                    nonce: U256::from_be_slice(&data[64..96]),
                    signature: decode_dynamic_bytes(data, &data[96..128])?,
                }
            }
        };

        Some(DecodedLogEntry {
            block_number,
            tx_hash,
            log_index,
            event,
        })
    }
}

fn decode_kind(word: &[u8]) -> Option<TokenKind> {
    let value = U256::from_be_slice(word);
    let code: u8 = value.try_into().ok()?;
    match TokenKind::try_from(code) {
        Ok(kind) => Some(kind),
        Err(e) => {
            warn!(error = %e, "Skipping gateway log with unknown token kind");
            None
        }
    }
}

fn decode_dynamic_bytes(data: &[u8], offset_word: &[u8]) -> Option<Bytes> {
    let offset: usize = U256::from_be_slice(offset_word).try_into().ok()?;
    let len_end = offset.checked_add(32)?;
    if data.len() < len_end {
        return None;
    }
    let len: usize = U256::from_be_slice(&data[offset..len_end]).try_into().ok()?;
    let end = len_end.checked_add(len)?;
    if data.len() < end {
        return None;
    }
    Some(Bytes::copy_from_slice(&data[len_end..end]))
}

/// Decoded gateway event fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    EthReceived {
        from: Address,
        amount: U256,
    },
    Erc20Received {
        from: Address,
        amount: U256,
        token: Address,
    },
    TokenWithdrawn {
        owner: Address,
        kind: TokenKind,
        token: Address,
        amount: U256,
    },
    WithdrawalSigned {
        owner: Address,
        kind: TokenKind,
        token: Address,
        amount: U256,
        nonce: U256,
        signature: Bytes,
    },
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GatewayEvent::EthReceived { .. } => EventKind::EthReceived,
            GatewayEvent::Erc20Received { .. } => EventKind::Erc20Received,
            GatewayEvent::TokenWithdrawn { .. } => EventKind::TokenWithdrawn,
            GatewayEvent::WithdrawalSigned { .. } => EventKind::WithdrawalSigned,
        }
    }

    /// The account the event is about
    pub fn owner(&self) -> Address {
        match self {
            GatewayEvent::EthReceived { from, .. } | GatewayEvent::Erc20Received { from, .. } => {
                *from
            }
            GatewayEvent::TokenWithdrawn { owner, .. }
            | GatewayEvent::WithdrawalSigned { owner, .. } => *owner,
        }
    }

    /// Home-chain token address; the null address for the native coin
    pub fn token(&self) -> Address {
        match self {
            GatewayEvent::EthReceived { .. } => Address::ZERO,
            GatewayEvent::Erc20Received { token, .. }
            | GatewayEvent::TokenWithdrawn { token, .. }
            | GatewayEvent::WithdrawalSigned { token, .. } => *token,
        }
    }

    pub fn amount(&self) -> U256 {
        match self {
            GatewayEvent::EthReceived { amount, .. }
            | GatewayEvent::Erc20Received { amount, .. }
            | GatewayEvent::TokenWithdrawn { amount, .. }
            | GatewayEvent::WithdrawalSigned { amount, .. } => *amount,
        }
    }

    /// ABI-encode into `(topics, data)` as the gateway would emit it
    pub fn encode(&self) -> (Vec<B256>, Bytes) {
        let topic0 = self.kind().topic();
        match self {
            GatewayEvent::EthReceived { from, amount } => (
                vec![topic0, from.into_word()],
                Bytes::from(amount.to_be_bytes::<32>().to_vec()),
            ),
            GatewayEvent::Erc20Received {
                from,
                amount,
                token,
            } => (
                vec![topic0, from.into_word(), token.into_word()],
                Bytes::from(amount.to_be_bytes::<32>().to_vec()),
            ),
            GatewayEvent::TokenWithdrawn {
                owner,
                kind,
                token,
                amount,
            } => {
                let mut data = Vec::with_capacity(64);
                data.extend_from_slice(&U256::from(*kind as u8).to_be_bytes::<32>());
                data.extend_from_slice(&amount.to_be_bytes::<32>());
                (
                    vec![topic0, owner.into_word(), token.into_word()],
                    Bytes::from(data),
                )
            }
            GatewayEvent::WithdrawalSigned {
                owner,
                kind,
                token,
                amount,
                nonce,
                signature,
            } => {
                let padded = signature.len().div_ceil(32) * 32;
                let mut data = Vec::with_capacity(160 + padded);
                data.extend_from_slice(&U256::from(*kind as u8).to_be_bytes::<32>());
                data.extend_from_slice(&amount.to_be_bytes::<32>());
                data.extend_from_slice(&nonce.to_be_bytes::<32>());
                data.extend_from_slice(&U256::from(128u64).to_be_bytes::<32>());
                data.extend_from_slice(&U256::from(signature.len()).to_be_bytes::<32>());
                data.extend_from_slice(signature);
                data.resize(160 + padded, 0);
                (
                    vec![topic0, owner.into_word(), token.into_word()],
                    Bytes::from(data),
                )
            }
        }
    }
}

/// A chain log with its decoded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedLogEntry {
    pub block_number: u64,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub event: GatewayEvent,
}
