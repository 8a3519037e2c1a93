//! Bridge configuration
//!
//! Loaded from a `.env` file if present, then from environment variables.
//! RPC URLs accept a comma-separated list; the first is the primary and the
//! rest are fallbacks tried in order.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::logs::LogLoaderConfig;
use crate::redact::redact_url;
use crate::retry::RetryConfig;
use crate::types::ChainRole;

/// Connection settings for one chain
#[derive(Clone, PartialEq)]
pub struct ChainConfig {
    pub role: ChainRole,
    /// Chain id string used in ChainAddress keys
    pub chain_id: String,
    /// Primary first, then fallbacks
    pub rpc_urls: Vec<String>,
    pub gateway_address: Address,
    /// First block worth scanning for gateway logs
    pub genesis_block: u64,
}

/// Custom Debug that hides RPC paths and query strings, which often carry API keys.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let urls: Vec<String> = self.rpc_urls.iter().map(|u| redact_url(u)).collect();
        f.debug_struct("ChainConfig")
            .field("role", &self.role)
            .field("chain_id", &self.chain_id)
            .field("rpc_urls", &urls)
            .field("gateway_address", &self.gateway_address)
            .field("genesis_block", &self.genesis_block)
            .finish()
    }
}

/// Timing and threshold policy for the state machines
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPolicy {
    /// Home-chain confirmations before a deposit counts as confirmed
    pub deposit_confirmations: u64,
    /// Bound on the wait for the oracle's withdrawal signature
    pub signature_timeout: Duration,
    /// Interval for head, receipt, and signature polling
    pub poll_interval: Duration,
    /// Bound on waiting for a broadcast transaction to be mined
    pub receipt_timeout: Duration,
    /// Backoff for transient submission failures
    pub retry: RetryConfig,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            deposit_confirmations: default_deposit_confirmations(),
            signature_timeout: Duration::from_secs(default_signature_timeout_secs()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            receipt_timeout: Duration::from_secs(default_receipt_timeout_secs()),
            retry: RetryConfig::default(),
        }
    }
}

/// Main configuration for the bridge client
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub home: ChainConfig,
    pub side: ChainConfig,
    pub policy: TransferPolicy,
    /// Block range per log query
    pub log_chunk_size: u64,
    pub cache_dir: PathBuf,
    pub asset_registry_path: PathBuf,
}

/// Default functions
fn default_deposit_confirmations() -> u64 {
    10
}

fn default_signature_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_receipt_timeout_secs() -> u64 {
    600
}

fn default_log_chunk_size() -> u64 {
    10_000
}

fn default_cache_dir() -> String {
    ".bridge-cache".to_string()
}

fn default_asset_registry_path() -> String {
    "assets.json".to_string()
}

impl BridgeConfig {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = chain_from_lookup(&lookup, ChainRole::Home, "HOME")?;
        let side = chain_from_lookup(&lookup, ChainRole::Side, "SIDE")?;

        let policy = TransferPolicy {
            deposit_confirmations: parse_or(
                &lookup,
                "DEPOSIT_CONFIRMATIONS",
                default_deposit_confirmations(),
            )?,
            signature_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SIGNATURE_TIMEOUT_SECS",
                default_signature_timeout_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "POLL_INTERVAL_MS",
                default_poll_interval_ms(),
            )?),
            receipt_timeout: Duration::from_secs(parse_or(
                &lookup,
                "RECEIPT_TIMEOUT_SECS",
                default_receipt_timeout_secs(),
            )?),
            retry: RetryConfig::default(),
        };

        let log_chunk_size = parse_or(&lookup, "LOG_CHUNK_SIZE", default_log_chunk_size())?;

        let config = Self {
            home,
            side,
            policy,
            log_chunk_size,
            cache_dir: PathBuf::from(lookup("CACHE_DIR").unwrap_or_else(default_cache_dir)),
            asset_registry_path: PathBuf::from(
                lookup("ASSET_REGISTRY_PATH").unwrap_or_else(default_asset_registry_path),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn chain(&self, role: ChainRole) -> &ChainConfig {
        match role {
            ChainRole::Home => &self.home,
            ChainRole::Side => &self.side,
        }
    }

    /// Log loader settings for the chain with `role`
    pub fn log_loader(&self, role: ChainRole) -> LogLoaderConfig {
        LogLoaderConfig {
            chunk_size: self.log_chunk_size,
            genesis_block: self.chain(role).genesis_block,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for chain in [&self.home, &self.side] {
            if chain.rpc_urls.is_empty() {
                return Err(eyre!("{} chain needs at least one RPC URL", chain.role));
            }
            for url in &chain.rpc_urls {
                validate_rpc_url(url)
                    .wrap_err_with(|| format!("{} chain RPC URL is invalid", chain.role))?;
            }
            if chain.gateway_address == Address::ZERO {
                return Err(eyre!("{} gateway address cannot be zero", chain.role));
            }
        }
        if self.home.chain_id == self.side.chain_id {
            return Err(eyre!(
                "home and side chains must have distinct chain ids, both are {}",
                self.home.chain_id
            ));
        }
        if self.policy.deposit_confirmations == 0 {
            return Err(eyre!("DEPOSIT_CONFIRMATIONS must be at least 1"));
        }
        if self.log_chunk_size == 0 {
            return Err(eyre!("LOG_CHUNK_SIZE must be at least 1"));
        }
        Ok(())
    }
}

fn chain_from_lookup<F>(lookup: &F, role: ChainRole, prefix: &str) -> Result<ChainConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let rpc_raw = require(lookup, &format!("{prefix}_RPC_URL"))?;
    let rpc_urls = parse_rpc_urls(&rpc_raw);
    if rpc_urls.is_empty() {
        return Err(eyre!("{prefix}_RPC_URL cannot be empty"));
    }

    let gateway_raw = require(lookup, &format!("{prefix}_GATEWAY_ADDRESS"))?;
    let gateway_address = gateway_raw
        .parse()
        .map_err(|e| eyre!("{prefix}_GATEWAY_ADDRESS is not a valid address: {e}"))?;

    Ok(ChainConfig {
        role,
        chain_id: require(lookup, &format!("{prefix}_CHAIN_ID"))?,
        rpc_urls,
        gateway_address,
        genesis_block: parse_or(lookup, &format!("{prefix}_GENESIS_BLOCK"), 0)?,
    })
}

fn require<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| eyre!("{name} environment variable is required"))
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .wrap_err_with(|| format!("{name} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Validate an RPC URL: http or https with a host
pub fn validate_rpc_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| eyre!("invalid URL {}: {e}", redact_url(raw)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(eyre!("unsupported RPC URL scheme: {other}")),
    }
    if parsed.host_str().is_none() {
        return Err(eyre!("RPC URL has no host"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("HOME_RPC_URL", "https://home.example.com/v3/key, https://backup.example.com"),
            ("HOME_CHAIN_ID", "1"),
            ("HOME_GATEWAY_ADDRESS", "0x1111111111111111111111111111111111111111"),
            ("SIDE_RPC_URL", "http://localhost:46658"),
            ("SIDE_CHAIN_ID", "default"),
            ("SIDE_GATEWAY_ADDRESS", "0x2222222222222222222222222222222222222222"),
            ("SIDE_GENESIS_BLOCK", "500"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<BridgeConfig> {
        BridgeConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&base_vars()).unwrap();

        assert_eq!(config.policy.deposit_confirmations, 10);
        assert_eq!(config.policy.signature_timeout, Duration::from_secs(120));
        assert_eq!(config.policy.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.policy.receipt_timeout, Duration::from_secs(600));
        assert_eq!(config.log_chunk_size, 10_000);
        assert_eq!(config.cache_dir, PathBuf::from(".bridge-cache"));
        assert_eq!(config.asset_registry_path, PathBuf::from("assets.json"));
        assert_eq!(config.home.genesis_block, 0);
        assert_eq!(config.side.genesis_block, 500);
    }

    #[test]
    fn test_rpc_fallback_list() {
        let config = load(&base_vars()).unwrap();
        assert_eq!(
            config.home.rpc_urls,
            vec![
                "https://home.example.com/v3/key".to_string(),
                "https://backup.example.com".to_string()
            ]
        );
    }

    #[test]
    fn test_overrides() {
        let mut vars = base_vars();
        vars.insert("DEPOSIT_CONFIRMATIONS", "3");
        vars.insert("SIGNATURE_TIMEOUT_SECS", "30");
        vars.insert("LOG_CHUNK_SIZE", "500");
        let config = load(&vars).unwrap();

        assert_eq!(config.policy.deposit_confirmations, 3);
        assert_eq!(config.policy.signature_timeout, Duration::from_secs(30));
        let loader = config.log_loader(ChainRole::Side);
        assert_eq!(loader.chunk_size, 500);
        assert_eq!(loader.genesis_block, 500);
    }

    #[test]
    fn test_missing_required() {
        let mut vars = base_vars();
        vars.remove("SIDE_GATEWAY_ADDRESS");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("SIDE_GATEWAY_ADDRESS"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut vars = base_vars();
        vars.insert("DEPOSIT_CONFIRMATIONS", "ten");
        assert!(load(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("HOME_RPC_URL", "ftp://home.example.com");
        assert!(load(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("SIDE_CHAIN_ID", "1");
        assert!(load(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("DEPOSIT_CONFIRMATIONS", "0");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_debug_redacts_rpc_paths() {
        let config = load(&base_vars()).unwrap();
        let debug = format!("{:?}", config.home);
        assert!(debug.contains("https://home.example.com"));
        assert!(!debug.contains("/v3/key"));
    }

    #[test]
    #[serial_test::serial]
    fn test_load_from_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let contents: String = base_vars()
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\"\n"))
            .collect();
        std::fs::write(&path, contents).unwrap();

        let config = tokio_test::assert_ok!(BridgeConfig::load_from_file(
            path.to_str().unwrap()
        ));
        assert_eq!(config.home.chain_id, "1");
        assert_eq!(config.side.chain_id, "default");
        assert_eq!(config.side.genesis_block, 500);

        for name in base_vars().keys() {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_parse_rpc_urls_ignores_empty() {
        let urls = parse_rpc_urls("https://a.com,,https://b.com,");
        assert_eq!(urls, vec!["https://a.com", "https://b.com"]);
        assert!(parse_rpc_urls("").is_empty());
    }
}
