use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::models::FileVersion;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProbe {
    pub content_hash: String,
    pub size_bytes: i64,
    pub modified_at: DateTime<Utc>,
}

pub fn probe_file(path: &Path) -> io::Result<FileProbe> {
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a regular file", path.display()),
        ));
    }

    Ok(FileProbe {
        content_hash: hash_reader(&mut file)?,
        size_bytes: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        modified_at: DateTime::<Utc>::from(meta.modified()?),
    })
}

/// Lowercase hex SHA-256 of everything `reader` yields.
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionSignals {
    pub mtime_drift: bool,
    pub mtime_tolerance: Duration,
}

impl Default for DetectionSignals {
    fn default() -> Self {
        Self {
            mtime_drift: true,
            mtime_tolerance: Duration::seconds(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifiedBy {
    pub content: bool,
    pub modified_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Modified(ModifiedBy),
    Deleted,
    Unchanged,
    /// Never recorded and not present now.
    Missing,
}

impl Change {
    pub fn records_version(&self) -> bool {
        matches!(self, Change::Created | Change::Modified(_))
    }
}

pub fn classify(
    prior: Option<&FileVersion>,
    current: Option<&FileProbe>,
    signals: DetectionSignals,
) -> Change {
    match (prior, current) {
        (None, Some(_)) => Change::Created,
        (None, None) => Change::Missing,
        (Some(_), None) => Change::Deleted,
        (Some(prior), Some(probe)) => {
            let content = !prior
                .metadata
                .content_hash
                .eq_ignore_ascii_case(&probe.content_hash);
            let drift = (probe.modified_at - prior.metadata.modified_at).abs();
            let modified_time = signals.mtime_drift && drift > signals.mtime_tolerance;

            if content || modified_time {
                Change::Modified(ModifiedBy {
                    content,
                    modified_time,
                })
            } else {
                Change::Unchanged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;
    use crate::models::VersionMetadata;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn version(hash: &str, modified_at: DateTime<Utc>) -> FileVersion {
        FileVersion {
            id: Uuid::new_v4(),
            monitored_file_id: Uuid::new_v4(),
            version_no: 1,
            metadata: VersionMetadata {
                absolute_directory: r"C:\data\f.txt".to_string(),
                file_name: "f.txt".to_string(),
                parent_directory: r"C:\data".to_string(),
                content_hash: hash.to_string(),
                size_bytes: 5,
                modified_at,
            },
            detected_at: at(0),
            stored_archive_path: String::new(),
        }
    }

    fn probe(hash: &str, modified_at: DateTime<Utc>) -> FileProbe {
        FileProbe {
            content_hash: hash.to_string(),
            size_bytes: 5,
            modified_at,
        }
    }

    #[test]
    fn hashes_stream_across_chunks() {
        assert_eq!(hash_reader(&mut Cursor::new(Vec::new())).unwrap(), EMPTY_SHA256);

        let big = vec![b'a'; CHUNK_SIZE * 2 + 17];
        let expected = hex::encode(Sha256::digest(&big));
        assert_eq!(hash_reader(&mut Cursor::new(big)).unwrap(), expected);
    }

    #[test]
    fn probe_reads_hash_size_and_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_700_000_000, 0))
            .unwrap();

        let probe = probe_file(&path).unwrap();
        assert_eq!(
            probe.content_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(probe.size_bytes, 5);
        assert_eq!(probe.modified_at, at(0));
    }

    #[test]
    fn probe_of_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = probe_file(&tmp.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn classification_table() {
        let signals = DetectionSignals::default();
        let prior = version("aa", at(0));

        assert_eq!(classify(None, Some(&probe("aa", at(0))), signals), Change::Created);
        assert_eq!(classify(None, None, signals), Change::Missing);
        assert_eq!(classify(Some(&prior), None, signals), Change::Deleted);
        assert_eq!(
            classify(Some(&prior), Some(&probe("aa", at(0))), signals),
            Change::Unchanged
        );
        assert_eq!(
            classify(Some(&prior), Some(&probe("bb", at(0))), signals),
            Change::Modified(ModifiedBy {
                content: true,
                modified_time: false
            })
        );
        assert_eq!(
            classify(Some(&prior), Some(&probe("bb", at(30))), signals),
            Change::Modified(ModifiedBy {
                content: true,
                modified_time: true
            })
        );
    }

    #[test]
    fn mtime_drift_needs_more_than_tolerance() {
        let signals = DetectionSignals::default();
        let prior = version("aa", at(0));

        assert_eq!(
            classify(Some(&prior), Some(&probe("aa", at(1))), signals),
            Change::Unchanged
        );
        assert_eq!(
            classify(Some(&prior), Some(&probe("aa", at(-2))), signals),
            Change::Modified(ModifiedBy {
                content: false,
                modified_time: true
            })
        );
    }

    #[test]
    fn mtime_drift_can_be_disabled() {
        let signals = DetectionSignals {
            mtime_drift: false,
            ..DetectionSignals::default()
        };
        let prior = version("aa", at(0));
        assert_eq!(
            classify(Some(&prior), Some(&probe("AA", at(3600))), signals),
            Change::Unchanged
        );
    }
}
