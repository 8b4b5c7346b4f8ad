//! # meridian-db
//!
//! Storage layer for Meridian. Two interchangeable backends implement the
//! contracts in [`store`]:
//! - **PostgreSQL**: the production backend, conditional updates in SQL
//! - **Memory**: process-local maps for lite mode and tests

pub mod memory;
pub mod postgres;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use meridian_common::config::DatabaseConfig;

pub use store::{
    BridgeStore, KeyAuditStore, PeerStore, ReceiptStore, RelayDirection, SigningKeyStore,
    StoreError, StoreResult, StoredSigningKey,
};

/// PostgreSQL connection pool.
#[derive(Clone)]
pub struct Database {
    pub pg: PgPool,
}

impl Database {
    /// Connect to PostgreSQL.
    pub async fn connect(config: &DatabaseConfig, url: &str) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL...");
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;
        tracing::info!("Connected to PostgreSQL");

        Ok(Self { pg })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pg).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}

/// Every store the services need, behind trait objects so the backend is a
/// startup decision.
#[derive(Clone)]
pub struct Stores {
    pub peers: Arc<dyn PeerStore>,
    pub receipts: Arc<dyn ReceiptStore>,
    pub key_audits: Arc<dyn KeyAuditStore>,
    pub bridges: Arc<dyn BridgeStore>,
    pub signing_keys: Arc<dyn SigningKeyStore>,
}

impl Stores {
    pub fn postgres(db: &Database) -> Self {
        Self::from_backend(Arc::new(postgres::PgStore::new(db.pg.clone())))
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(memory::MemoryStore::new()))
    }

    fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PeerStore + ReceiptStore + KeyAuditStore + BridgeStore + SigningKeyStore + 'static,
    {
        Self {
            peers: backend.clone(),
            receipts: backend.clone(),
            key_audits: backend.clone(),
            bridges: backend.clone(),
            signing_keys: backend,
        }
    }
}
