//! Key-value storage with per-key TTL.
//!
//! PKCE records and sessions are the only shared mutable state in the
//! service. Each key is written by exactly one flow, so plain put/get/delete
//! is all the backend has to provide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{eyre, WrapErr};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::encryption::{self, EncryptionConfig};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> color_eyre::Result<()>;
    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>>;
    async fn delete(&self, key: &str) -> color_eyre::Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local [`KvStore`]. Expired entries are invisible to `get` and are
/// reclaimed by [`MemoryKvStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn expires_at(&self, key: &str) -> Option<Instant> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.expires_at)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> color_eyre::Result<()> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| eyre!("TTL of {ttl:?} for {} is out of range", key_prefix(key)))?;
        let entry = Entry { value, expires_at };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: remove it now rather than waiting for the sweeper
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> color_eyre::Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Typed JSON records on top of a [`KvStore`], encrypted when an age key is
/// configured.
#[derive(Clone)]
pub struct Storage {
    kv: Arc<dyn KvStore>,
    encryption: Option<EncryptionConfig>,
}

impl Storage {
    pub fn new(kv: Arc<dyn KvStore>, encryption: Option<EncryptionConfig>) -> Self {
        Self { kv, encryption }
    }

    pub async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> color_eyre::Result<()> {
        let json = serde_json::to_string(value)
            .wrap_err_with(|| format!("Failed to serialize record for {}", key_prefix(key)))?;

        let stored = match &self.encryption {
            Some(config) => encryption::encrypt(&json, &config.key).await?,
            None => json,
        };

        self.kv.put(key, stored, ttl).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> color_eyre::Result<Option<T>> {
        let Some(stored) = self.kv.get(key).await? else {
            return Ok(None);
        };

        let json = match &self.encryption {
            Some(config) => encryption::decrypt(&stored, &config.key).await?,
            None => stored,
        };

        let value = serde_json::from_str(&json)
            .wrap_err_with(|| format!("Failed to deserialize record for {}", key_prefix(key)))?;
        Ok(Some(value))
    }

    pub async fn delete(&self, key: &str) -> color_eyre::Result<()> {
        self.kv.delete(key).await
    }
}

/// Keys embed bearer identifiers, only the namespace is safe to log.
fn key_prefix(key: &str) -> &str {
    key.split_once(':').map(|(prefix, _)| prefix).unwrap_or("record")
}

/// Periodically purge expired entries from a memory store.
pub async fn run_sweeper(store: Arc<MemoryKvStore>, every: Duration) -> color_eyre::Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let removed = store.purge_expired().await;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired store entries");
        }
    }
}
