#[cfg(test)]
pub mod memory;
pub mod sqlite;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AlertKind, MonitoredFileState, NetworkAddress, NewAlert, NewFileVersion, RunLease, ScanLog,
};

pub use sqlite::SqliteGateway;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Errors raised by the store. Any of these aborts the current monitor run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("invalid stored value in {column}: {value}")]
    Decode { column: &'static str, value: String },

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) => StoreError::Query(db_err.message().to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err.to_string())
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn list_active_monitored_files_with_latest_version(
        &self,
    ) -> Result<Vec<MonitoredFileState>, StoreError>;

    async fn resolve_device_addresses(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<NetworkAddress>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, StoreError>;

    /// Claims the named lease. Returns `false` while another holder's lease
    /// has not yet expired.
    async fn try_acquire_run_lease(&self, lease: &RunLease) -> Result<bool, StoreError>;

    async fn release_run_lease(&self, name: &str, holder: &str) -> Result<(), StoreError>;

    async fn record_scan_log(&self, log: &ScanLog) -> Result<(), StoreError>;

    async fn list_all_addresses(&self) -> Result<Vec<NetworkAddress>, StoreError>;

    async fn record_address_status(
        &self,
        address_id: Uuid,
        up: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Writes for a single monitored file. Dropping without [`commit`] rolls back.
///
/// [`commit`]: FileTransaction::commit
#[async_trait]
pub trait FileTransaction: Send {
    async fn has_uncleared_alert(
        &mut self,
        file_id: Uuid,
        kind: AlertKind,
    ) -> Result<bool, StoreError>;

    async fn insert_alert(&mut self, alert: &NewAlert) -> Result<Uuid, StoreError>;

    async fn insert_version(&mut self, version: &NewFileVersion) -> Result<Uuid, StoreError>;

    async fn update_last_scan(
        &mut self,
        file_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

pub async fn create_pool(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    Ok(SqlitePoolOptions::new().connect_with(options).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

pub(crate) fn parse_uuid(column: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Decode {
        column,
        value: raw.to_string(),
    })
}
