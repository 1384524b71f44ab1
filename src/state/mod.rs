pub mod memory;
pub mod redis;

use crate::config::StateManagerConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;


/// Key/value store with per-key TTL holding JSON encoded values.
///
/// A `ttl_secs` of zero means the key never expires. Reading a missing key is
/// not an error.
#[async_trait]
pub trait StateStore: Send + Sync {
    fn name(&self) -> &str;
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn set_raw(&self, key: &str, value: String, ttl_secs: u64) -> Result<()>;
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Typed access on top of [`StateStore`]; both backends share this JSON
/// round-trip so switching backends does not change what callers read back.
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn set<T>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let data = serde_json::to_string(value)?;
        self.set_raw(key, data, ttl_secs).await
    }

    /// Missing keys yield `T::default()`.
    async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default + Send,
    {
        match self.get_raw(key).await? {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(T::default()),
        }
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

pub fn create_store(config: &StateManagerConfig) -> Result<Arc<dyn StateStore>> {
    match config {
        StateManagerConfig::Memory {
            sweep_interval_secs,
        } => {
            let interval = Duration::from_secs(sweep_interval_secs.unwrap_or(30).max(1));
            Ok(Arc::new(memory::MemoryStore::new(interval)))
        }
        StateManagerConfig::Redis {
            address,
            password,
            db,
        } => Ok(Arc::new(redis::RedisStore::new(
            address,
            password.as_deref(),
            db.unwrap_or(0),
        ))),
    }
}
