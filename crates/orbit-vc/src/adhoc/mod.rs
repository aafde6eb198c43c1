use std::{fs, io, path::Path};

use chrono::{DateTime, SecondsFormat, Utc};
use filetime::FileTime;
use serde::Serialize;
use tracing::info;

use crate::{
    detector::probe_file,
    resolver::{check_accessible, join_attempts, AccessFailure, ResolveError, Resolver},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_size: String,
    pub file_hash: String,
    pub file_date_modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreInfo {
    pub destination_path: String,
    pub file_size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdhocResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses_tried: Vec<String>,
}

impl<T> AdhocResult<T> {
    fn ok(address: Option<String>, message: Option<String>, data: T) -> Self {
        Self {
            success: true,
            message,
            address_used: address,
            data: Some(data),
            addresses_tried: Vec::new(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            address_used: None,
            data: None,
            addresses_tried: Vec::new(),
        }
    }

    fn from_resolve_error(action: &str, addresses: &[String], err: ResolveError) -> Self {
        match err {
            ResolveError::Unreachable(attempts) => Self {
                addresses_tried: addresses.to_vec(),
                ..Self::failed(format!(
                    "Failed to {action} using all available addresses. Errors: {}",
                    join_attempts(&attempts)
                ))
            },
            other => Self::failed(other.to_string()),
        }
    }
}

/// Splits `10.0.0.1, 192.168.1.1` into trimmed, non-empty entries.
pub fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn copy_preserving_mtime(from: &Path, to: &Path) -> io::Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(from, to)?;
    let mtime = FileTime::from_last_modification_time(&fs::metadata(from)?);
    filetime::set_file_mtime(to, mtime)?;
    Ok(bytes)
}

/// Size, hash and modification time of `device_path` on the first address
/// where it is readable. With `dest`, the file is copied there first and the
/// copy is measured.
pub fn file_info(
    resolver: &Resolver,
    addresses: &[String],
    device_path: &str,
    dest: Option<&Path>,
) -> AdhocResult<FileInfo> {
    let outcome = resolver.resolve_ordered(addresses, device_path, |resolved| {
        check_accessible(resolved)?;
        let target = match dest {
            Some(dest) => {
                copy_preserving_mtime(&resolved.local, dest)
                    .map_err(|e| AccessFailure::Io(format!("Failed to copy file: {e}")))?;
                dest.to_path_buf()
            }
            None => resolved.local.clone(),
        };
        let probe = probe_file(&target).map_err(|e| AccessFailure::from_io(&resolved.share_path, &e))?;
        Ok(FileInfo {
            file_size: probe.size_bytes.to_string(),
            file_hash: probe.content_hash,
            file_date_modified: rfc3339(probe.modified_at),
        })
    });

    match outcome {
        Ok(resolved) => {
            info!(address = ?resolved.path.address, path = %resolved.path.share_path, "file info collected");
            AdhocResult::ok(resolved.path.address, None, resolved.value)
        }
        Err(e) => AdhocResult::from_resolve_error("access file", addresses, e),
    }
}

/// Copies local `source` to `device_path` on the first address that accepts it.
pub fn restore(
    resolver: &Resolver,
    addresses: &[String],
    device_path: &str,
    source: &Path,
) -> AdhocResult<RestoreInfo> {
    if !source.is_file() {
        return AdhocResult::failed(format!("Source file not found: {}", source.display()));
    }

    let outcome = resolver.resolve_ordered(addresses, device_path, |resolved| {
        let failure = |e: io::Error| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                AccessFailure::PermissionDenied(format!("{}: {e}", resolved.share_path))
            }
            _ => AccessFailure::Io(format!("Failed to restore file: {e}")),
        };
        copy_preserving_mtime(source, &resolved.local).map_err(failure)?;
        let size = fs::metadata(&resolved.local)
            .map_err(|_| AccessFailure::Io("File copy completed but verification failed".to_string()))?
            .len();
        Ok(RestoreInfo {
            destination_path: resolved.share_path.clone(),
            file_size: size.to_string(),
        })
    });

    match outcome {
        Ok(resolved) => {
            info!(address = ?resolved.path.address, path = %resolved.path.share_path, "file restored");
            let message = format!("File restored successfully to {}", resolved.path.share_path);
            AdhocResult::ok(resolved.path.address, Some(message), resolved.value)
        }
        Err(e) => AdhocResult::from_resolve_error("restore file", addresses, e),
    }
}
