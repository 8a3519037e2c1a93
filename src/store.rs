//! Persistence collaborators
//!
//! The core serializes its own records (log caches, pending transfers) as JSON
//! and hands them to a [`KeyValueStore`]. Private keys live behind the separate
//! [`SecureKeyStore`] seam and are never written through the key-value store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::redact::Redacted;

/// String key-value persistence
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`, in ascending order
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage for chain private keys and the recovery mnemonic
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store, used in tests and as a throwaway cache
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SecureKeyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        KeyValueStore::get(self, key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        KeyValueStore::set(self, key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        KeyValueStore::delete(self, key).await
    }
}

// ============================================================================
// File-backed
// ============================================================================

/// One JSON file per key inside a directory
///
/// File names are the hex encoding of the key, so any key is a valid file name
/// and `keys()` can recover the original key.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BridgeError::Storage(format!("failed to create {}: {e}", dir.display()))
        })?;
        debug!(dir = %dir.display(), "Opened file store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(".json")?;
        let bytes = hex::decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Storage(format!("failed to read {key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        // Write-then-rename so a crash never leaves a truncated record behind
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to write {key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to commit {key}: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::Storage(format!("failed to delete {key}: {e}"))),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(Self::key_for) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// Environment-backed key store
// ============================================================================

/// Read-only key store over environment variables
///
/// Key names are upper-cased, e.g. `home_private_key` reads `HOME_PRIVATE_KEY`.
#[derive(Debug, Default, Clone)]
pub struct EnvKeyStore {
    prefix: String,
}

impl EnvKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every variable name, e.g. `BRIDGE_`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase())
    }
}

#[async_trait]
impl SecureKeyStore for EnvKeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let name = self.var_name(key);
        match std::env::var(&name) {
            Ok(value) if !value.trim().is_empty() => {
                debug!(var = %name, value = %Redacted(&value), "Read key from environment");
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, _value: &str) -> Result<()> {
        Err(BridgeError::Storage(format!(
            "environment key store is read-only (set {})",
            self.var_name(key)
        )))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Err(BridgeError::Storage(format!(
            "environment key store is read-only (delete {})",
            self.var_name(key)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_prefix() {
        let store = MemoryStore::new();
        KeyValueStore::set(&store, "logs:ETH:deposits", "a").await.unwrap();
        KeyValueStore::set(&store, "logs:X:deposits", "b").await.unwrap();
        KeyValueStore::set(&store, "pending:deposit:0x00", "c").await.unwrap();

        assert_eq!(
            KeyValueStore::get(&store, "logs:X:deposits").await.unwrap(),
            Some("b".to_string())
        );
        assert_eq!(
            store.keys("logs:").await.unwrap(),
            vec!["logs:ETH:deposits".to_string(), "logs:X:deposits".to_string()]
        );

        KeyValueStore::delete(&store, "logs:X:deposits").await.unwrap();
        assert_eq!(KeyValueStore::get(&store, "logs:X:deposits").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.set("pending:deposit:0xab", "[1,2,3]").await.unwrap();
            store.set("logs:ETH:deposits", "{}").await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("pending:deposit:0xab").await.unwrap(),
            Some("[1,2,3]".to_string())
        );
        assert_eq!(
            reopened.keys("pending:").await.unwrap(),
            vec!["pending:deposit:0xab".to_string()]
        );
    }

    #[tokio::test]
    async fn test_file_store_missing_key_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        assert_eq!(store.get("absent").await.unwrap(), None);
        store.delete("absent").await.unwrap();

        store.set("k", "v").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_env_key_store_is_read_only() {
        let store = EnvKeyStore::with_prefix("GATEWAY_BRIDGE_TEST_");
        std::env::set_var("GATEWAY_BRIDGE_TEST_SIGNER", "0x01");

        assert_eq!(
            store.get("signer").await.unwrap(),
            Some("0x01".to_string())
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert!(store.set("signer", "0x02").await.is_err());
        assert!(store.delete("signer").await.is_err());
    }
}
