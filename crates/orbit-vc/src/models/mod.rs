use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub id: Uuid,
    pub device_id: Uuid,
    pub value: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredFile {
    pub id: Uuid,
    pub device_id: Uuid,
    /// Device-local absolute path, e.g. `C:\data\f.txt`, or a network path.
    pub path: String,
    pub last_scan: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub absolute_directory: String,
    pub file_name: String,
    pub parent_directory: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: Uuid,
    pub monitored_file_id: Uuid,
    pub version_no: i64,
    pub metadata: VersionMetadata,
    pub detected_at: DateTime<Utc>,
    pub stored_archive_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileVersion {
    pub monitored_file_id: Uuid,
    pub version_no: i64,
    pub metadata: VersionMetadata,
    pub detected_at: DateTime<Utc>,
    pub stored_archive_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredFileState {
    pub file: MonitoredFile,
    pub latest: Option<FileVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    Created,
    Modified,
    Deleted,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Created => "CREATED",
            AlertKind::Modified => "MODIFIED",
            AlertKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub monitored_file_id: Uuid,
    pub kind: AlertKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Exclusive claim on a named run, valid until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_scanned: i64,
    pub changes_detected: i64,
    pub failures: i64,
    pub status: RunStatus,
}
