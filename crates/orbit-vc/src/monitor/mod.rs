use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    alerts,
    archive::Archiver,
    config::MonitorConfig,
    db::{PersistenceGateway, StoreError},
    detector::{classify, probe_file, Change, DetectionSignals, FileProbe},
    models::{MonitoredFileState, NetworkAddress, NewFileVersion, RunLease, RunStatus, ScanLog, VersionMetadata},
    resolver::{AddressPreference, DevicePath, ResolveError, ResolvedPath, Resolver},
};

pub const LEASE_NAME: &str = "version_control";

/// Blocking filesystem jobs started by any monitor that have not returned yet,
/// including ones abandoned after a timeout.
static BLOCKING_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

type ProbeFn = fn(&Path) -> io::Result<FileProbe>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub preference: AddressPreference,
    pub signals: DetectionSignals,
    pub per_file_timeout: Duration,
    pub lease_ttl: chrono::Duration,
}

impl MonitorSettings {
    pub fn from_config(cfg: &MonitorConfig) -> anyhow::Result<Self> {
        let preference = AddressPreference::new(&cfg.preferred_categories, &cfg.preferred_subnets)
            .map_err(|e| anyhow::anyhow!("invalid preferred subnet: {e}"))?;
        Ok(Self {
            preference,
            signals: DetectionSignals {
                mtime_drift: cfg.detect_mtime_drift,
                mtime_tolerance: chrono::Duration::seconds(cfg.mtime_tolerance_secs as i64),
            },
            per_file_timeout: Duration::from_secs(cfg.per_file_timeout_secs),
            lease_ttl: chrono::Duration::seconds(cfg.lease_ttl_secs as i64),
        })
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("persistence failure, run aborted: {0}")]
    Store(#[from] StoreError),

    #[error("run lease was taken over by another holder, run aborted")]
    LeaseLost,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to read file: {0}")]
    Io(#[from] io::Error),

    #[error("scan task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_scanned: i64,
    pub changes_detected: i64,
    pub failures: i64,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Completed,
            started_at,
            finished_at: started_at,
            files_scanned: 0,
            changes_detected: 0,
            failures: 0,
        }
    }

    fn to_scan_log(&self) -> ScanLog {
        ScanLog {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            files_scanned: self.files_scanned,
            changes_detected: self.changes_detected,
            failures: self.failures,
            status: self.status,
        }
    }
}

pub struct Monitor {
    gateway: Arc<dyn PersistenceGateway>,
    resolver: Resolver,
    archiver: Archiver,
    settings: MonitorSettings,
    clock: Arc<dyn Clock>,
    holder: String,
    probe: ProbeFn,
    in_flight: &'static AtomicUsize,
}

impl Monitor {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        resolver: Resolver,
        archiver: Archiver,
        settings: MonitorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            resolver,
            archiver,
            settings,
            clock,
            holder: format!("pid-{}-{}", std::process::id(), Uuid::new_v4()),
            probe: probe_file,
            in_flight: &BLOCKING_IN_FLIGHT,
        }
    }

    #[cfg(test)]
    fn with_probe(mut self, probe: ProbeFn) -> Self {
        self.probe = probe;
        self
    }

    fn lease_at(&self, now: DateTime<Utc>) -> RunLease {
        RunLease {
            name: LEASE_NAME.to_string(),
            holder: self.holder.clone(),
            acquired_at: now,
            expires_at: now + self.settings.lease_ttl,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, MonitorError> {
        let run_id = Uuid::new_v4();
        self.run_leased(run_id)
            .instrument(info_span!("monitor_run", run_id = %run_id))
            .await
    }

    async fn run_leased(&self, run_id: Uuid) -> Result<RunSummary, MonitorError> {
        let started_at = self.clock.now();
        let mut summary = RunSummary::new(run_id, started_at);

        if !self.gateway.try_acquire_run_lease(&self.lease_at(started_at)).await? {
            warn!("another monitor run holds the lease, skipping");
            summary.status = RunStatus::Skipped;
            summary.finished_at = self.clock.now();
            self.gateway.record_scan_log(&summary.to_scan_log()).await?;
            return Ok(summary);
        }

        let result = self.scan_all(&mut summary).await;
        summary.finished_at = self.clock.now();
        summary.status = match result {
            Ok(()) => RunStatus::Completed,
            Err(_) => RunStatus::Aborted,
        };

        if let Err(e) = self.gateway.record_scan_log(&summary.to_scan_log()).await {
            warn!(error = %e, "failed to record scan log");
        }
        if let Err(e) = self.gateway.release_run_lease(LEASE_NAME, &self.holder).await {
            warn!(error = %e, "failed to release run lease");
        }

        match result {
            Ok(()) => {
                info!(
                    files = summary.files_scanned,
                    changes = summary.changes_detected,
                    failures = summary.failures,
                    "monitor run completed"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, files = summary.files_scanned, "monitor run aborted");
                Err(e)
            }
        }
    }

    async fn scan_all(&self, summary: &mut RunSummary) -> Result<(), MonitorError> {
        let files = self
            .gateway
            .list_active_monitored_files_with_latest_version()
            .await?;
        let stalled = self.in_flight.load(Ordering::SeqCst);
        if stalled > 0 {
            warn!(stalled, "blocking probes from earlier timeouts are still running");
        }
        info!(files = files.len(), "monitor run started");

        for state in &files {
            if !self
                .gateway
                .try_acquire_run_lease(&self.lease_at(self.clock.now()))
                .await?
            {
                error!(file_id = %state.file.id, "run lease lost, stopping");
                return Err(MonitorError::LeaseLost);
            }

            let span = info_span!(
                "monitor_file",
                file_id = %state.file.id,
                device_id = %state.file.device_id
            );
            summary.files_scanned += 1;
            match self.scan_file(state).instrument(span.clone()).await {
                Ok(true) => summary.changes_detected += 1,
                Ok(false) => {}
                Err(ScanError::Store(e)) => {
                    span.in_scope(|| error!(error = %e, "store failure while scanning file"));
                    return Err(e.into());
                }
                Err(e) => {
                    summary.failures += 1;
                    span.in_scope(|| warn!(path = %state.file.path, error = %e, "file scan failed"));
                }
            }
        }
        Ok(())
    }

    /// Returns whether the file produced a version or a new alert.
    async fn scan_file(&self, state: &MonitoredFileState) -> Result<bool, ScanError> {
        let file = &state.file;
        let device_path = DevicePath::parse(&file.path)?;
        let addresses = self.gateway.resolve_device_addresses(file.device_id).await?;

        let current = self.locate_and_probe(addresses, &file.path).await?;
        let change = classify(
            state.latest.as_ref(),
            current.as_ref().map(|(_, probe)| probe),
            self.settings.signals,
        );
        let now = self.clock.now();
        let (absolute_directory, parent_directory, file_name) = device_path.components();

        let version_no = change
            .records_version()
            .then(|| state.latest.as_ref().map_or(0, |v| v.version_no) + 1);
        let new_version = match (version_no, current) {
            (Some(version_no), Some((resolved, probe))) => {
                let stored_archive_path = self
                    .archive(resolved.local.clone(), file.id, version_no, file_name.clone())
                    .await;
                Some(NewFileVersion {
                    monitored_file_id: file.id,
                    version_no,
                    metadata: VersionMetadata {
                        absolute_directory,
                        file_name: file_name.clone(),
                        parent_directory,
                        content_hash: probe.content_hash,
                        size_bytes: probe.size_bytes,
                        modified_at: probe.modified_at,
                    },
                    detected_at: now,
                    stored_archive_path,
                })
            }
            _ => None,
        };

        let mut tx = self.gateway.begin().await?;
        if let Some(version) = &new_version {
            tx.insert_version(version).await?;
        }
        let alerted = alerts::emit(tx.as_mut(), file.id, &change, &file_name, version_no, now).await?;
        tx.update_last_scan(file.id, now).await?;
        tx.commit().await?;

        match change {
            Change::Created | Change::Modified(_) => {
                info!(version = version_no, change = ?change, "new version recorded")
            }
            Change::Deleted if alerted => warn!("file missing, DELETED alert raised"),
            Change::Deleted => debug!("file still missing, alert already open"),
            Change::Unchanged | Change::Missing => debug!(change = ?change, "no change"),
        }
        Ok(new_version.is_some() || alerted)
    }

    /// Resolves on one address and probes the file, bounded by the per-file
    /// timeout. `None` means the file is absent, unreachable or timed out.
    async fn locate_and_probe(
        &self,
        addresses: Vec<NetworkAddress>,
        device_path: &str,
    ) -> Result<Option<(ResolvedPath, FileProbe)>, ScanError> {
        let resolver = self.resolver.clone();
        let preference = self.settings.preference.clone();
        let device_path = device_path.to_string();
        let probe = self.probe;

        let outcome = blocking_with_timeout(self.settings.per_file_timeout, self.in_flight, move || {
            let resolved = match resolver.resolve_preferred(&addresses, &preference, &device_path) {
                Ok(resolved) => resolved,
                Err(e @ ResolveError::InvalidPath(_)) => return Err(ScanError::Resolve(e)),
                Err(e) => {
                    debug!(error = %e, "file not reachable");
                    return Ok(None);
                }
            };
            match probe(&resolved.local) {
                Ok(probe) => Ok(Some((resolved, probe))),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(ScanError::Io(e)),
            }
        })
        .await?;

        match outcome {
            Some(result) => result,
            None => {
                warn!(
                    timeout_ms = self.settings.per_file_timeout.as_millis() as u64,
                    still_running = self.in_flight.load(Ordering::SeqCst),
                    "file probe timed out, treating as absent"
                );
                Ok(None)
            }
        }
    }

    async fn archive(&self, source: PathBuf, file_id: Uuid, version_no: i64, file_name: String) -> String {
        let archiver = self.archiver.clone();
        let copy = move || {
            // No stored version refers to this number yet, so anything in the
            // slot is left over from an attempt that never committed.
            match archiver.reclaim(file_id, version_no) {
                Ok(true) => warn!(file_id = %file_id, version = version_no, "discarded uncommitted archive slot"),
                Ok(false) => {}
                Err(e) => warn!(file_id = %file_id, version = version_no, error = %e, "failed to clear archive slot"),
            }
            archiver.archive_best_effort(&source, file_id, version_no, &file_name)
        };
        match blocking_with_timeout(self.settings.per_file_timeout, self.in_flight, copy).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                warn!(
                    version = version_no,
                    still_running = self.in_flight.load(Ordering::SeqCst),
                    "archive copy timed out"
                );
                String::new()
            }
            Err(e) => {
                warn!(version = version_no, error = %e, "archive copy failed");
                String::new()
            }
        }
    }
}

struct InFlight(&'static AtomicUsize);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs blocking filesystem work off the runtime. `Ok(None)` on timeout; the
/// work itself is left to finish in the background and stays counted in
/// `in_flight` until it does.
async fn blocking_with_timeout<T, F>(
    limit: Duration,
    in_flight: &'static AtomicUsize,
    work: F,
) -> Result<Option<T>, ScanError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    in_flight.fetch_add(1, Ordering::SeqCst);
    let guard = InFlight(in_flight);
    let handle = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        work()
    });
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(join)) => Err(ScanError::Task(join.to_string())),
        Err(_) => Ok(None),
    }
}
