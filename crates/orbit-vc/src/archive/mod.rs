use std::{
    fs, io,
    path::{Path, PathBuf},
};

use filetime::FileTime;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive write failed for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn slot(&self, file_id: Uuid, version_no: i64) -> PathBuf {
        self.root.join(file_id.to_string()).join(format!("v{version_no}"))
    }

    pub fn location(&self, file_id: Uuid, version_no: i64, file_name: &str) -> PathBuf {
        self.slot(file_id, version_no).join(sanitize(file_name))
    }

    /// Removes whatever an uncommitted attempt left in the slot. Only valid for
    /// a version number no stored version refers to.
    pub fn reclaim(&self, file_id: Uuid, version_no: i64) -> io::Result<bool> {
        let slot = self.slot(file_id, version_no);
        match fs::remove_dir_all(&slot) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copies `source` into the archive slot for `(file_id, version_no)`,
    /// keeping its modification time. The copy lands under a temporary name
    /// and is published only once complete.
    pub fn archive(
        &self,
        source: &Path,
        file_id: Uuid,
        version_no: i64,
        file_name: &str,
    ) -> Result<PathBuf, ArchiveError> {
        let dest = self.location(file_id, version_no, file_name);
        let write_err = |source| ArchiveError::Write {
            path: dest.clone(),
            source,
        };

        if dest.exists() {
            return Err(write_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "archive slot already used",
            )));
        }
        let slot = self.slot(file_id, version_no);
        fs::create_dir_all(&slot).map_err(write_err)?;
        let partial = slot.join(format!(".{}.partial", Uuid::new_v4()));

        let staged = copy_with_mtime(source, &partial).and_then(|()| publish(&partial, &dest));
        if let Err(e) = staged {
            let _ = fs::remove_file(&partial);
            return Err(write_err(e));
        }

        info!(file_id = %file_id, version = version_no, path = %dest.display(), "archived version");
        Ok(dest)
    }

    /// Like [`Archiver::archive`] but never fails: errors are logged and an
    /// empty path is returned.
    pub fn archive_best_effort(
        &self,
        source: &Path,
        file_id: Uuid,
        version_no: i64,
        file_name: &str,
    ) -> String {
        match self.archive(source, file_id, version_no, file_name) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(file_id = %file_id, version = version_no, error = %e, "archive failed, recording version without copy");
                String::new()
            }
        }
    }
}

fn copy_with_mtime(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest)?;
    if let Ok(meta) = fs::metadata(source) {
        filetime::set_file_mtime(dest, FileTime::from_last_modification_time(&meta))?;
    }
    Ok(())
}

fn publish(partial: &Path, dest: &Path) -> io::Result<()> {
    match fs::hard_link(partial, dest) {
        Ok(()) => fs::remove_file(partial),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(_) if !dest.exists() => fs::rename(partial, dest),
        Err(e) => Err(e),
    }
}

fn sanitize(file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_bytes_and_mtime_under_version_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("app.ini");
        fs::write(&source, b"key=value").unwrap();
        let mtime = FileTime::from_unix_time(1_650_000_000, 0);
        filetime::set_file_mtime(&source, mtime).unwrap();

        let archiver = Archiver::new(tmp.path().join("archive"));
        let file_id = Uuid::new_v4();
        let dest = archiver.archive(&source, file_id, 3, "app.ini").unwrap();

        assert_eq!(
            dest,
            tmp.path()
                .join("archive")
                .join(file_id.to_string())
                .join("v3")
                .join("app.ini")
        );
        assert_eq!(fs::read(&dest).unwrap(), b"key=value");
        let copied = FileTime::from_last_modification_time(&fs::metadata(&dest).unwrap());
        assert_eq!(copied.unix_seconds(), mtime.unix_seconds());
    }

    #[test]
    fn existing_slot_is_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("f.txt");
        fs::write(&source, b"one").unwrap();
        let archiver = Archiver::new(tmp.path().join("archive"));
        let file_id = Uuid::new_v4();

        archiver.archive(&source, file_id, 1, "f.txt").unwrap();
        fs::write(&source, b"two").unwrap();
        assert!(archiver.archive(&source, file_id, 1, "f.txt").is_err());
        let kept = archiver.location(file_id, 1, "f.txt");
        assert_eq!(fs::read(kept).unwrap(), b"one");
    }

    #[test]
    fn reclaimed_slot_takes_the_new_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("f.txt");
        fs::write(&source, b"one").unwrap();
        let archiver = Archiver::new(tmp.path().join("archive"));
        let file_id = Uuid::new_v4();

        archiver.archive(&source, file_id, 1, "f.txt").unwrap();
        fs::write(&source, b"two").unwrap();
        assert!(archiver.reclaim(file_id, 1).unwrap());
        assert!(!archiver.reclaim(file_id, 1).unwrap());

        let dest = archiver.archive(&source, file_id, 1, "f.txt").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"two");
        let entries: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("f.txt")]);
    }

    #[test]
    fn failed_copy_leaves_no_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(tmp.path().join("archive"));
        let file_id = Uuid::new_v4();

        assert!(archiver
            .archive(&tmp.path().join("missing.txt"), file_id, 1, "f.txt")
            .is_err());
        let slot = archiver.location(file_id, 1, "f.txt");
        assert_eq!(fs::read_dir(slot.parent().unwrap()).unwrap().count(), 0);
    }

    #[test]
    fn best_effort_returns_empty_path_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("f.txt");
        fs::write(&source, b"x").unwrap();
        // A regular file where the archive root should be.
        let blocked = tmp.path().join("archive");
        fs::write(&blocked, b"").unwrap();

        let archiver = Archiver::new(&blocked);
        assert_eq!(
            archiver.archive_best_effort(&source, Uuid::new_v4(), 1, "f.txt"),
            ""
        );
    }

    #[test]
    fn file_names_cannot_escape_the_slot() {
        let archiver = Archiver::new("/archive");
        let id = Uuid::nil();
        assert_eq!(
            archiver.location(id, 1, ".."),
            PathBuf::from(format!("/archive/{id}/v1/unnamed"))
        );
        assert_eq!(
            archiver.location(id, 2, r"a\b:c"),
            PathBuf::from(format!("/archive/{id}/v2/a_b_c"))
        );
    }
}
