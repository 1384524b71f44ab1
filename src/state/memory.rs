use super::StateStore;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-process store. Expired keys are hidden on read and purged by a
/// background sweep that runs between `connect` and `close`.
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    sweep_interval: Duration,
    cancel_token: std::sync::Mutex<Option<CancellationToken>>,
}

impl MemoryStore {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            sweep_interval,
            cancel_token: std::sync::Mutex::new(None),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn purge_expired(&self) -> usize {
        purge(&self.entries).await
    }

    fn stop_sweeper(&self) {
        if let Ok(mut token) = self.cancel_token.lock() {
            if let Some(token) = token.take() {
                token.cancel();
            }
        }
    }
}

async fn purge(entries: &Mutex<HashMap<String, Entry>>) -> usize {
    let now = Instant::now();
    let mut entries = entries.lock().await;
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

#[async_trait]
impl StateStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut slot = self
                .cancel_token
                .lock()
                .map_err(|e| anyhow::anyhow!("memory store lock poisoned: {}", e))?;
            if slot.is_some() {
                return Ok(());
            }
            slot.replace(token.clone());
        }

        let entries = self.entries.clone();
        let sweep_interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = purge(&entries).await;
                        if purged > 0 {
                            debug!(purged, "memory store: expired keys purged");
                        }
                    }
                }
            }
        });
        info!(
            sweep_interval = ?self.sweep_interval,
            "memory store: started"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_sweeper();
        Ok(())
    }

    async fn set_raw(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let expires_at = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
