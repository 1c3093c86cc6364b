use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{CounterCache, CounterError};

impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        CounterError::Unavailable(err.to_string())
    }
}

/// Counters stored as Redis integers.
///
/// The connection manager reconnects on its own; each call clones the handle
/// rather than holding a lock.
#[derive(Clone)]
pub struct RedisCounters {
    conn: ConnectionManager,
    url: String,
}

impl std::fmt::Debug for RedisCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounters")
            .field("url", &self.url)
            .finish()
    }
}

impl RedisCounters {
    /// Connect to the Redis server at `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self, CounterError> {
        let url = format!("redis://{host}:{port}/");
        tracing::info!(%url, "connecting to redis");
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, url })
    }
}

#[async_trait]
impl CounterCache for RedisCounters {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        tracing::trace!(%key, ?value, "read counter");
        Ok(value.unwrap_or(0))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }
}
