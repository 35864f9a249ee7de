//! Storage helpers for Postgres access.

use std::{str::FromStr, sync::Arc};

use anyhow::Result;
use sqlx::{
    migrate::Migrator,
    postgres::{PgConnectOptions, PgPoolOptions},
};

pub mod messages;
pub mod profiles;

pub use sqlx::PgPool;

pub use messages::{ImageUpdateError, MessageRepository};
pub use profiles::ProfileRepository;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Apply the bundled migrations.
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    MIGRATOR.run(pool.pool()).await?;
    Ok(())
}

/// Parse the URL without building a pool, so it is safe outside a runtime.
pub fn validate_database_url(database_url: &str) -> Result<()> {
    PgConnectOptions::from_str(database_url)?;
    Ok(())
}
