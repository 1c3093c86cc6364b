use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{CounterCache, CounterError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires.map(|e| e >= now).unwrap_or(true)
    }
}

/// Process-local counters with an optional time-to-live.
///
/// Every write refreshes the entry's expiry. An expired entry reads as 0 and
/// an increment of it starts again from 0.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Option<Duration>,
}

impl MemoryCounters {
    /// Counters that live for `ttl` after their last write, or forever.
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Default::default(),
            ttl,
        }
    }
}

#[async_trait]
impl CounterCache for MemoryCounters {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<i64, CounterError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(entry.value),
            Some(_) => {
                tracing::trace!(%key, "counter expired");
                entries.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
        let now = Instant::now();
        let expires = self.ttl.map(|ttl| now + ttl);
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires,
        });
        if !entry.live(now) {
            entry.value = 0;
        }
        entry.value += delta;
        entry.expires = expires;
        Ok(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_counter_reads_zero() {
        let counters = MemoryCounters::new(None);
        assert_eq!(counters.get("registry:image_count").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increments_accumulate() {
        let counters = MemoryCounters::new(None);
        counters.increment("tags", 3).await.unwrap();
        assert_eq!(counters.increment("tags", -1).await.unwrap(), 2);
        assert_eq!(counters.get("tags").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_counter_reads_zero() {
        let counters = MemoryCounters::new(Some(Duration::from_millis(20)));
        counters.increment("images", 5).await.unwrap();
        assert_eq!(counters.get("images").await.unwrap(), 5);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.get("images").await.unwrap(), 0);
        assert_eq!(counters.increment("images", 1).await.unwrap(), 1);
    }
}
