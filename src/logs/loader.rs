//! Chunked, deduplicating log loader over a persisted cache

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache::{migrate, LogWrapper};
use super::{cache_key, LogType};
use crate::chain::{ChainClient, DecodedLogEntry, LogFilter};
use crate::error::{BridgeError, Result};
use crate::store::KeyValueStore;
use crate::types::Asset;

/// Loader configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLoaderConfig {
    /// Maximum block range per query (to avoid RPC limits)
    pub chunk_size: u64,
    /// Where a fresh or reset cache starts scanning from
    pub genesis_block: u64,
}

impl Default for LogLoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            genesis_block: 0,
        }
    }
}

/// Loads gateway logs for one chain, resuming from the cached watermark
pub struct LogLoader<C: ChainClient + ?Sized> {
    client: Arc<C>,
    store: Arc<dyn KeyValueStore>,
    config: LogLoaderConfig,
    /// Per cache key; held across a whole refresh
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: ChainClient + ?Sized> LogLoader<C> {
    pub fn new(client: Arc<C>, store: Arc<dyn KeyValueStore>, config: LogLoaderConfig) -> Self {
        Self {
            client,
            store,
            config,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Complete, deduplicated history of `log_type` for `asset`, newest first.
    ///
    /// Only blocks after the cached watermark are queried. On a failed chunk,
    /// progress through the last good chunk is persisted before the error is
    /// returned.
    pub async fn get_logs(&self, asset: &Asset, log_type: LogType) -> Result<Vec<DecodedLogEntry>> {
        self.check_role(log_type)?;
        let key = cache_key(asset, log_type);
        let lock = self.refresh_lock(&key).await;
        let _guard = lock.lock().await;

        let mut wrapper = self.load(&key, true).await?;
        let to_block = self.client.block_number().await?;

        if wrapper.last_block_number < to_block {
            self.fetch_into(asset, log_type, &key, &mut wrapper, to_block)
                .await?;
        } else {
            debug!(key = %key, last_block = wrapper.last_block_number, "Log cache is current");
        }

        Ok(wrapper.logs)
    }

    /// Persisted logs without touching the network
    pub async fn cached_logs(&self, asset: &Asset, log_type: LogType) -> Result<Vec<DecodedLogEntry>> {
        Ok(self.cached_record(asset, log_type).await?.logs)
    }

    /// Persisted record, migrated in memory
    pub async fn cached_record(&self, asset: &Asset, log_type: LogType) -> Result<LogWrapper> {
        self.load(&cache_key(asset, log_type), false).await
    }

    /// Drop the persisted record; the next `get_logs` rescans from genesis
    pub async fn invalidate(&self, asset: &Asset, log_type: LogType) -> Result<()> {
        let key = cache_key(asset, log_type);
        let lock = self.refresh_lock(&key).await;
        let _guard = lock.lock().await;
        self.store.delete(&key).await?;
        info!(key = %key, "Invalidated log cache");
        Ok(())
    }

    fn check_role(&self, log_type: LogType) -> Result<()> {
        if log_type.role() != self.client.role() {
            return Err(BridgeError::Config(format!(
                "{} logs live on the {} chain, loader is connected to {}",
                log_type,
                log_type.role(),
                self.client.role()
            )));
        }
        Ok(())
    }

    async fn refresh_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, key: &str, persist_migration: bool) -> Result<LogWrapper> {
        let stored = match self.store.get(key).await? {
            Some(json) => serde_json::from_str::<LogWrapper>(&json).map_err(|e| {
                BridgeError::Serialization(format!("corrupt log cache {key}: {e}"))
            })?,
            None => LogWrapper::default(),
        };

        let version = stored.migration_version;
        let migrated = migrate(stored, self.config.genesis_block);
        if persist_migration && migrated.migration_version != version {
            self.save(key, &migrated).await?;
        }
        Ok(migrated)
    }

    async fn save(&self, key: &str, wrapper: &LogWrapper) -> Result<()> {
        let json = serde_json::to_string(wrapper)?;
        self.store.set(key, &json).await
    }

    /// Query `(wrapper.last_block_number, to_block]` in chunks and merge
    async fn fetch_into(
        &self,
        asset: &Asset,
        log_type: LogType,
        key: &str,
        wrapper: &mut LogWrapper,
        to_block: u64,
    ) -> Result<()> {
        let event = log_type.event_for(asset);
        let token = asset.home_address;
        let owner = self.client.address().local;
        let gateway = self.client.gateway();
        let chunk_size = self.config.chunk_size.max(1);

        let from_block = wrapper.last_block_number + 1;
        let mut start = from_block;
        let mut added = 0;

        while start <= to_block {
            let end = start.saturating_add(chunk_size - 1).min(to_block);
            let filter = LogFilter {
                address: gateway,
                event,
                owner: Some(owner),
                from_block: start,
                to_block: end,
            };

            match self.client.query_logs(&filter).await {
                Ok(entries) => {
                    let relevant = entries
                        .into_iter()
                        .filter(|e| e.event.token() == token)
                        .collect();
                    added += wrapper.merge(relevant);
                    wrapper.advance_to(end);
                    debug!(key = %key, from = start, to = end, "Fetched log chunk");
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        from = start,
                        to = end,
                        error = %e,
                        "Log chunk query failed"
                    );
                    if start > from_block {
                        self.save(key, wrapper).await?;
                    }
                    return Err(e);
                }
            }

            start = end + 1;
        }

        self.save(key, wrapper).await?;
        info!(
            key = %key,
            from = from_block,
            to = to_block,
            added,
            total = wrapper.logs.len(),
            "Refreshed log cache"
        );
        Ok(())
    }
}
