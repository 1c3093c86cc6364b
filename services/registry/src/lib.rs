//! # Registry access service
//!
//! Metadata and access control for a container image registry: who may log
//! in, which images and tags exist, and approximate usage counters. Blob
//! transfer itself happens elsewhere; this service records what it reports.
//!
//! ## Features
//!
//! - Salted argon2id password storage and uniform login failures
//! - Stateless HS256 bearer tokens with expiry and role-refreshing renewal
//! - Image deletes that remove every tag in the same transaction
//! - A pluggable [AccessPolicy] consulted for every authenticated operation
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use counters::MemoryCounters;
//! use metadata::MemoryMetadataStore;
//! use registry::{AccessService, CredentialManager, RegistryBuilder};
//! use secret::Secret;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = AccessService::builder(
//!     Arc::new(MemoryMetadataStore::new()),
//!     Arc::new(MemoryCounters::new(None)),
//!     CredentialManager::new(Secret::from("change me")),
//! )
//! .build();
//!
//! let app = RegistryBuilder::new(service).build();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod auth;
pub mod config;
pub mod credentials;
mod error;
mod images;
pub mod policy;
pub mod service;
mod users;

pub use api::{API_PREFIX, Authenticated, Bearer, RegistryBuilder};
pub use config::RegistryConfig;
pub use credentials::{Claims, CredentialError, CredentialManager};
pub use error::{RegistryError, RegistryResult};
pub use policy::{AccessPolicy, AllowAuthenticated, Operation, RolePolicy};
pub use service::AccessService;
