use super::StateStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis backed store using native key expiry.
pub struct RedisStore {
    url: String,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    pub fn new(address: &str, password: Option<&str>, db: i64) -> Self {
        Self {
            url: redis_url(address, password, db),
            conn: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("redis connection lock poisoned: {}", e))?
            .clone()
            .ok_or_else(|| anyhow!("not connected"))
    }
}

pub(crate) fn redis_url(address: &str, password: Option<&str>, db: i64) -> String {
    if address.starts_with("redis://") || address.starts_with("rediss://") {
        return address.to_string();
    }
    let auth = match password.filter(|p| !p.is_empty()) {
        Some(password) => format!(":{}@", urlencoding::encode(password)),
        None => String::new(),
    };
    format!("redis://{}{}/{}", auth, address, db)
}

async fn open(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let mut conn = ConnectionManager::new(client).await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(conn)
}

#[async_trait]
impl StateStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let conn = tokio::select! {
            _ = tokio::time::sleep(CONNECT_TIMEOUT) => {
                Err(anyhow!("connection timeout"))
            }
            result = open(&self.url) => result,
        }
        .map_err(|e| anyhow!("unable to connect to redis: {}", e))?;

        self.conn
            .lock()
            .map_err(|e| anyhow!("redis connection lock poisoned: {}", e))?
            .replace(conn);
        info!("redis store: connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("redis connection lock poisoned: {}", e))?
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("not connected"))
    }

    async fn set_raw(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
