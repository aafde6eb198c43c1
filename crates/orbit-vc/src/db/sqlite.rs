use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{parse_uuid, FileTransaction, PersistenceGateway, StoreError};
use crate::models::{
    AlertKind, FileVersion, MonitoredFile, MonitoredFileState, NetworkAddress, NewAlert,
    NewFileVersion, RunLease, ScanLog, VersionMetadata,
};

/// SQLite implementation of [`PersistenceGateway`].
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct FileStateRow {
    id: String,
    device_id: String,
    path: String,
    last_scan: Option<DateTime<Utc>>,
    version_id: Option<String>,
    version_no: Option<i64>,
    absolute_directory: Option<String>,
    file_name: Option<String>,
    parent_directory: Option<String>,
    content_hash: Option<String>,
    size_bytes: Option<i64>,
    modified_at: Option<DateTime<Utc>>,
    detected_at: Option<DateTime<Utc>>,
    stored_archive_path: Option<String>,
}

impl TryFrom<FileStateRow> for MonitoredFileState {
    type Error = StoreError;

    fn try_from(row: FileStateRow) -> Result<Self, Self::Error> {
        let file = MonitoredFile {
            id: parse_uuid("monitored_files.id", &row.id)?,
            device_id: parse_uuid("monitored_files.device_id", &row.device_id)?,
            path: row.path,
            last_scan: row.last_scan,
        };

        let latest = match (row.version_id, row.version_no) {
            (Some(version_id), Some(version_no)) => Some(FileVersion {
                id: parse_uuid("file_versions.id", &version_id)?,
                monitored_file_id: file.id,
                version_no,
                metadata: VersionMetadata {
                    absolute_directory: row.absolute_directory.unwrap_or_default(),
                    file_name: row.file_name.unwrap_or_default(),
                    parent_directory: row.parent_directory.unwrap_or_default(),
                    content_hash: row.content_hash.unwrap_or_default(),
                    size_bytes: row.size_bytes.unwrap_or_default(),
                    modified_at: row.modified_at.ok_or(StoreError::Decode {
                        column: "file_versions.modified_at",
                        value: "NULL".to_string(),
                    })?,
                },
                detected_at: row.detected_at.ok_or(StoreError::Decode {
                    column: "file_versions.detected_at",
                    value: "NULL".to_string(),
                })?,
                stored_archive_path: row.stored_archive_path.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(MonitoredFileState { file, latest })
    }
}

#[derive(sqlx::FromRow)]
struct AddressRow {
    id: String,
    device_id: String,
    address: String,
    category: Option<String>,
}

impl TryFrom<AddressRow> for NetworkAddress {
    type Error = StoreError;

    fn try_from(row: AddressRow) -> Result<Self, Self::Error> {
        Ok(NetworkAddress {
            id: parse_uuid("device_addresses.id", &row.id)?,
            device_id: parse_uuid("device_addresses.device_id", &row.device_id)?,
            value: row.address,
            category: row.category,
        })
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn list_active_monitored_files_with_latest_version(
        &self,
    ) -> Result<Vec<MonitoredFileState>, StoreError> {
        let rows = sqlx::query_as::<_, FileStateRow>(
            r#"
            SELECT mf.id, mf.device_id, mf.path, mf.last_scan,
                   v.id AS version_id, v.version_no, v.absolute_directory, v.file_name,
                   v.parent_directory, v.content_hash, v.size_bytes, v.modified_at,
                   v.detected_at, v.stored_archive_path
            FROM monitored_files mf
            LEFT JOIN file_versions v
              ON v.monitored_file_id = mf.id
             AND v.version_no = (
                 SELECT MAX(version_no) FROM file_versions WHERE monitored_file_id = mf.id
             )
            WHERE mf.is_active = 1
            ORDER BY mf.created_at, mf.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn resolve_device_addresses(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<NetworkAddress>, StoreError> {
        let rows = sqlx::query_as::<_, AddressRow>(
            "SELECT id, device_id, address, category FROM device_addresses WHERE device_id = ? ORDER BY position, rowid",
        )
        .bind(device_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteFileTransaction { tx }))
    }

    async fn try_acquire_run_lease(&self, lease: &RunLease) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO run_leases(name, holder, acquired_at, expires_at) VALUES(?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE run_leases.expires_at <= excluded.acquired_at
               OR run_leases.holder = excluded.holder
            "#,
        )
        .bind(&lease.name)
        .bind(&lease.holder)
        .bind(lease.acquired_at.timestamp())
        .bind(lease.expires_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_run_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM run_leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_scan_log(&self, log: &ScanLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scan_logs(id, run_id, started_at, finished_at, files_scanned, changes_detected, failures, status) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.id.to_string())
        .bind(log.run_id.to_string())
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.files_scanned)
        .bind(log.changes_detected)
        .bind(log.failures)
        .bind(log.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all_addresses(&self) -> Result<Vec<NetworkAddress>, StoreError> {
        let rows = sqlx::query_as::<_, AddressRow>(
            "SELECT id, device_id, address, category FROM device_addresses ORDER BY device_id, position, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn record_address_status(
        &self,
        address_id: Uuid,
        up: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO address_status(address_id, is_up, last_checked) VALUES(?, ?, ?)
            ON CONFLICT(address_id) DO UPDATE SET
                is_up = excluded.is_up,
                last_checked = excluded.last_checked
            "#,
        )
        .bind(address_id.to_string())
        .bind(up)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

struct SqliteFileTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl FileTransaction for SqliteFileTransaction {
    async fn has_uncleared_alert(
        &mut self,
        file_id: Uuid,
        kind: AlertKind,
    ) -> Result<bool, StoreError> {
        let found: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM alerts WHERE monitored_file_id = ? AND kind = ? AND cleared = 0 LIMIT 1",
        )
        .bind(file_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(found.is_some())
    }

    async fn insert_alert(&mut self, alert: &NewAlert) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO alerts(id, monitored_file_id, kind, message, created_at, acknowledged, cleared) VALUES(?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(id.to_string())
        .bind(alert.monitored_file_id.to_string())
        .bind(alert.kind.as_str())
        .bind(&alert.message)
        .bind(alert.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_version(&mut self, version: &NewFileVersion) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let meta = &version.metadata;
        sqlx::query(
            r#"
            INSERT INTO file_versions(
                id, monitored_file_id, version_no, absolute_directory, file_name,
                parent_directory, content_hash, size_bytes, modified_at, detected_at,
                stored_archive_path
            ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(version.monitored_file_id.to_string())
        .bind(version.version_no)
        .bind(&meta.absolute_directory)
        .bind(&meta.file_name)
        .bind(&meta.parent_directory)
        .bind(&meta.content_hash)
        .bind(meta.size_bytes)
        .bind(meta.modified_at)
        .bind(version.detected_at)
        .bind(&version.stored_archive_path)
        .execute(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn update_last_scan(
        &mut self,
        file_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE monitored_files SET last_scan = ? WHERE id = ?")
            .bind(at)
            .bind(file_id.to_string())
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Query(format!("monitored file {file_id} not found")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
