//! In-memory registry access service with a bootstrapped administrator
//!
//! Run with: cargo run -p registry --example basic_server

use std::sync::Arc;

use counters::MemoryCounters;
use metadata::MemoryMetadataStore;
use registry::{AccessService, CredentialManager, RegistryBuilder};
use secret::Secret;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let service = AccessService::builder(
        Arc::new(MemoryMetadataStore::new()),
        Arc::new(MemoryCounters::new(None)),
        CredentialManager::new(Secret::from("example-signing-key")),
    )
    .build();
    service
        .ensure_admin("admin", Secret::from("admin"), "admin@localhost")
        .await?;

    let app = RegistryBuilder::new(service).build();

    let addr = "127.0.0.1:8080";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Registry API listening on http://{}", addr);
    tracing::info!(
        "Try: curl -X POST http://{}/api/v1/auth/login -d '{{\"username\":\"admin\",\"password\":\"admin\"}}' -H 'content-type: application/json'",
        addr
    );

    axum::serve(listener, app).await?;

    Ok(())
}
