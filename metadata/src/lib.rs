//! # Registry metadata
//!
//! Durable records of users, images and tags for the registry API, behind the
//! [MetadataStore] trait. Records are never physically removed: deletes set
//! `deleted_at`, and every read only sees live rows.
//!
//! Three backends are provided: an in-memory store for tests and development,
//! SQLite for single-node deployments, and PostgreSQL.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secret::Secret;
use serde::Deserialize;

mod error;
mod memory;
pub mod models;
mod postgres;
mod rows;
mod sqlite;
mod store;

#[doc(inline)]
pub use error::{MetadataError, MetadataResult};
#[doc(inline)]
pub use memory::MemoryMetadataStore;
#[doc(inline)]
pub use models::{
    Image, NewImage, NewUser, Published, SoftDelete, Tag, TagReport, User, UserUpdate,
};
#[doc(inline)]
pub use postgres::{PostgresMetadataStore, PostgresOptions};
#[doc(inline)]
pub use sqlite::SqliteMetadataStore;
#[doc(inline)]
pub use store::MetadataStore;

/// Shared handle to a metadata backend.
pub type ArcStore = Arc<dyn MetadataStore>;

/// Selects and configures a metadata backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataConfig {
    /// Process-local tables, lost on restart.
    Memory,

    /// A SQLite database file, created if missing.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },

    /// A PostgreSQL server.
    Postgres {
        /// Server hostname.
        host: String,
        /// Server port.
        port: u16,
        /// Database name.
        database: String,
        /// Login role.
        username: String,
        /// Login password.
        password: Secret,
    },
}

impl MetadataConfig {
    /// Open the configured backend, applying its schema.
    #[tracing::instrument]
    pub async fn build(self) -> MetadataResult<ArcStore> {
        let store: ArcStore = match self {
            MetadataConfig::Memory => Arc::new(MemoryMetadataStore::new()),
            MetadataConfig::Sqlite { path } => Arc::new(SqliteMetadataStore::new(path).await?),
            MetadataConfig::Postgres {
                host,
                port,
                database,
                username,
                password,
            } => {
                let options = PostgresOptions {
                    host,
                    port,
                    database,
                    username,
                    password,
                    max_connections: 10,
                    acquire_timeout: Duration::from_secs(5),
                };
                Arc::new(PostgresMetadataStore::connect(&options).await?)
            }
        };
        tracing::debug!(backend = store.name(), "metadata store ready");
        Ok(store)
    }
}
