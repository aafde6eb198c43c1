use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{FileTransaction, PersistenceGateway, StoreError};
use crate::models::{
    AlertKind, FileVersion, MonitoredFile, MonitoredFileState, NetworkAddress, NewAlert,
    NewFileVersion, RunLease, ScanLog,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: Uuid,
    pub monitored_file_id: Uuid,
    pub kind: AlertKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub cleared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStatus {
    pub address_id: Uuid,
    pub up: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    files: Vec<MonitoredFile>,
    inactive: Vec<Uuid>,
    addresses: Vec<NetworkAddress>,
    versions: Vec<FileVersion>,
    alerts: Vec<Alert>,
    leases: HashMap<String, RunLease>,
    scan_logs: Vec<ScanLog>,
    address_status: HashMap<Uuid, AddressStatus>,
}

impl State {
    fn claim_lease(&mut self, lease: &RunLease) -> bool {
        let free = match self.leases.get(&lease.name) {
            Some(current) => {
                current.expires_at <= lease.acquired_at || current.holder == lease.holder
            }
            None => true,
        };
        if free {
            self.leases.insert(lease.name.clone(), lease.clone());
        }
        free
    }
}

/// A competing lease claim made right after the given number of commits.
type Contender = Arc<StdMutex<Option<(usize, RunLease)>>>;

/// Mock gateway. `fail_begin_after(n)` makes every `begin` after the first `n`
/// fail as if the shared connection dropped.
#[derive(Clone)]
pub struct MemoryGateway {
    state: Arc<Mutex<State>>,
    begins: Arc<AtomicUsize>,
    fail_after: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    contender: Contender,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            begins: Arc::new(AtomicUsize::new(0)),
            fail_after: Arc::new(AtomicUsize::new(usize::MAX)),
            commits: Arc::new(AtomicUsize::new(0)),
            contender: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn fail_begin_after(&self, successful: usize) {
        self.fail_after.store(successful, Ordering::SeqCst);
    }

    /// Another process tries to take `lease` once `commits` file transactions
    /// have committed, with the usual expiry rules.
    pub fn contend_for_lease_after_commits(&self, commits: usize, lease: RunLease) {
        *self.contender.lock().unwrap() = Some((commits, lease));
    }

    pub async fn add_device(&self, addresses: &[(&str, Option<&str>)]) -> Uuid {
        let device_id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        for (value, category) in addresses {
            state.addresses.push(NetworkAddress {
                id: Uuid::new_v4(),
                device_id,
                value: value.to_string(),
                category: category.map(str::to_string),
            });
        }
        device_id
    }

    pub async fn add_file(&self, device_id: Uuid, path: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.files.push(MonitoredFile {
            id,
            device_id,
            path: path.to_string(),
            last_scan: None,
        });
        id
    }

    pub async fn deactivate(&self, file_id: Uuid) {
        self.state.lock().await.inactive.push(file_id);
    }

    pub async fn clear_alerts(&self, file_id: Uuid) {
        let mut state = self.state.lock().await;
        for alert in state.alerts.iter_mut().filter(|a| a.monitored_file_id == file_id) {
            alert.cleared = true;
        }
    }

    pub async fn file(&self, file_id: Uuid) -> Option<MonitoredFile> {
        let state = self.state.lock().await;
        state.files.iter().find(|f| f.id == file_id).cloned()
    }

    pub async fn versions(&self, file_id: Uuid) -> Vec<FileVersion> {
        let state = self.state.lock().await;
        let mut versions: Vec<_> = state
            .versions
            .iter()
            .filter(|v| v.monitored_file_id == file_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_no);
        versions
    }

    pub async fn alerts(&self, file_id: Uuid) -> Vec<Alert> {
        let state = self.state.lock().await;
        state
            .alerts
            .iter()
            .filter(|a| a.monitored_file_id == file_id)
            .cloned()
            .collect()
    }

    pub async fn scan_logs(&self) -> Vec<ScanLog> {
        self.state.lock().await.scan_logs.clone()
    }

    pub async fn address_status(&self, address_id: Uuid) -> Option<AddressStatus> {
        self.state.lock().await.address_status.get(&address_id).cloned()
    }

    pub async fn lease(&self, name: &str) -> Option<RunLease> {
        self.state.lock().await.leases.get(name).cloned()
    }

    pub async fn put_lease(&self, lease: RunLease) {
        self.state
            .lock()
            .await
            .leases
            .insert(lease.name.clone(), lease);
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn list_active_monitored_files_with_latest_version(
        &self,
    ) -> Result<Vec<MonitoredFileState>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .iter()
            .filter(|f| !state.inactive.contains(&f.id))
            .map(|file| MonitoredFileState {
                file: file.clone(),
                latest: state
                    .versions
                    .iter()
                    .filter(|v| v.monitored_file_id == file.id)
                    .max_by_key(|v| v.version_no)
                    .cloned(),
            })
            .collect())
    }

    async fn resolve_device_addresses(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<NetworkAddress>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .addresses
            .iter()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, StoreError> {
        let begun = self.begins.fetch_add(1, Ordering::SeqCst);
        if begun >= self.fail_after.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            commits: Arc::clone(&self.commits),
            contender: Arc::clone(&self.contender),
            versions: Vec::new(),
            alerts: Vec::new(),
            last_scans: Vec::new(),
        }))
    }

    async fn try_acquire_run_lease(&self, lease: &RunLease) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.claim_lease(lease))
    }

    async fn release_run_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.get(name).is_some_and(|l| l.holder == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }

    async fn record_scan_log(&self, log: &ScanLog) -> Result<(), StoreError> {
        self.state.lock().await.scan_logs.push(log.clone());
        Ok(())
    }

    async fn list_all_addresses(&self) -> Result<Vec<NetworkAddress>, StoreError> {
        Ok(self.state.lock().await.addresses.clone())
    }

    async fn record_address_status(
        &self,
        address_id: Uuid,
        up: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state.lock().await.address_status.insert(
            address_id,
            AddressStatus {
                address_id,
                up,
                checked_at,
            },
        );
        Ok(())
    }
}

/// Buffers writes and applies them to the shared state on commit.
struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    commits: Arc<AtomicUsize>,
    contender: Contender,
    versions: Vec<FileVersion>,
    alerts: Vec<Alert>,
    last_scans: Vec<(Uuid, DateTime<Utc>)>,
}

#[async_trait]
impl FileTransaction for MemoryTransaction {
    async fn has_uncleared_alert(
        &mut self,
        file_id: Uuid,
        kind: AlertKind,
    ) -> Result<bool, StoreError> {
        let open = |a: &Alert| a.monitored_file_id == file_id && a.kind == kind && !a.cleared;
        let state = self.state.lock().await;
        Ok(state.alerts.iter().any(open) || self.alerts.iter().any(open))
    }

    async fn insert_alert(&mut self, alert: &NewAlert) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.alerts.push(Alert {
            id,
            monitored_file_id: alert.monitored_file_id,
            kind: alert.kind,
            message: alert.message.clone(),
            created_at: alert.created_at,
            acknowledged: false,
            cleared: false,
        });
        Ok(id)
    }

    async fn insert_version(&mut self, version: &NewFileVersion) -> Result<Uuid, StoreError> {
        let state = self.state.lock().await;
        let taken = state
            .versions
            .iter()
            .chain(self.versions.iter())
            .any(|v| {
                v.monitored_file_id == version.monitored_file_id
                    && v.version_no == version.version_no
            });
        if taken {
            return Err(StoreError::Query(format!(
                "UNIQUE constraint failed: version {} of {}",
                version.version_no, version.monitored_file_id
            )));
        }
        drop(state);

        let id = Uuid::new_v4();
        self.versions.push(FileVersion {
            id,
            monitored_file_id: version.monitored_file_id,
            version_no: version.version_no,
            metadata: version.metadata.clone(),
            detected_at: version.detected_at,
            stored_archive_path: version.stored_archive_path.clone(),
        });
        Ok(id)
    }

    async fn update_last_scan(
        &mut self,
        file_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.last_scans.push((file_id, at));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.state.lock().await;
        state.versions.extend(this.versions);
        state.alerts.extend(this.alerts);
        for (file_id, at) in this.last_scans {
            if let Some(file) = state.files.iter_mut().find(|f| f.id == file_id) {
                file.last_scan = Some(at);
            }
        }

        let committed = this.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let mut contender = this.contender.lock().unwrap();
        if contender.as_ref().is_some_and(|(after, _)| *after == committed) {
            if let Some((_, lease)) = contender.take() {
                state.claim_lease(&lease);
            }
        }
        Ok(())
    }
}
