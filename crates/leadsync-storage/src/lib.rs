//! Persistence adapters: the external entity-mapping ledger and the local
//! lead request log, each with a Postgres and an in-memory implementation.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use thiserror::Error;

pub mod ledger;
pub mod requests;

pub use sqlx::PgPool;

pub use ledger::{LeadLedger, MemoryLeadLedger, PgLeadLedger};
pub use requests::{
    ClaimOutcome, FailedLeadFilter, LeadRequestStore, MemoryLeadRequestStore,
    PgLeadRequestStore, RequestCounts,
};

pub const CRATE_NAME: &str = "leadsync-storage";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lead request {0} not found")]
    NotFound(i64),
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Postgres reports unique constraint violations as SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

pub async fn connect(config: &PoolConfig) -> StoreResult<PgPool> {
    let options = PgConnectOptions::from_str(&config.url)?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Applies the `lead_requests` schema.
///
/// Local and ledger migrations use disjoint version numbers and ignore each
/// other's history, so both sets can target the same database.
pub async fn migrate_local(pool: &PgPool) -> StoreResult<()> {
    let mut migrator = sqlx::migrate!("./migrations/local");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}

/// Applies the `entity_mapping` schema. The ledger is normally owned by the
/// shared integration database; this is for standalone and test setups.
pub async fn migrate_ledger(pool: &PgPool) -> StoreResult<()> {
    let mut migrator = sqlx::migrate!("./migrations/ledger");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}
