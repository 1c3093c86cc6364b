//! # Registry counters
//!
//! Approximate usage counters (image and tag counts) kept in a fast key-value
//! cache rather than computed from the metadata store. A counter that was
//! never written, or has expired, reads as 0.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

mod coalesce;
mod memory;
#[cfg(feature = "redis")]
mod redis_counters;

#[doc(inline)]
pub use coalesce::{BoxFut, Coalesced, Handle, SingleFlight};
#[doc(inline)]
pub use memory::MemoryCounters;
#[cfg(feature = "redis")]
#[doc(inline)]
pub use redis_counters::RedisCounters;

/// Number of live images.
pub const IMAGE_COUNT: &str = "registry:image_count";

/// Number of live tags across all images.
pub const TAG_COUNT: &str = "registry:tag_count";

/// Counter backend errors.
#[derive(Debug, Clone, Error)]
pub enum CounterError {
    /// The cache could not be reached or rejected the command.
    #[error("counter cache unavailable: {0}")]
    Unavailable(String),

    /// A coalesced read was abandoned before it produced a value.
    #[error("counter read for {0} was abandoned")]
    Abandoned(String),
}

/// Integer counters addressed by name.
#[async_trait]
pub trait CounterCache: fmt::Debug + Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Current value, 0 when absent or expired.
    async fn get(&self, key: &str) -> Result<i64, CounterError>;

    /// Add `delta` (which may be negative) and return the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CounterError>;
}

/// Shared handle to a counter backend.
pub type ArcCounters = Arc<dyn CounterCache>;

/// Selects and configures a counter backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CounterConfig {
    /// Process-local counters, lost on restart.
    Memory {
        /// Seconds a written counter stays readable.
        #[serde(default)]
        ttl_secs: Option<u64>,
    },

    /// A Redis server shared by every replica.
    #[cfg(feature = "redis")]
    Redis {
        /// Server hostname.
        host: String,
        /// Server port, usually 6379.
        port: u16,
    },
}

impl CounterConfig {
    /// Connect the configured backend. Reads through the returned handle are
    /// coalesced per key.
    #[tracing::instrument]
    pub async fn build(self) -> Result<ArcCounters, CounterError> {
        let counters: ArcCounters = match self {
            CounterConfig::Memory { ttl_secs } => Arc::new(Coalesced::new(MemoryCounters::new(
                ttl_secs.map(Duration::from_secs),
            ))),
            #[cfg(feature = "redis")]
            CounterConfig::Redis { host, port } => {
                Arc::new(Coalesced::new(RedisCounters::connect(&host, port).await?))
            }
        };
        Ok(counters)
    }
}
