use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    archive::Archiver,
    config::AppConfig,
    db::PersistenceGateway,
    monitor::{Clock, Monitor, MonitorSettings},
    probe::Pinger,
    resolver::{Resolver, ShareMounts},
};

/// Everything a task needs, handed in by the scheduler or the CLI.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub pinger: Arc<dyn Pinger>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub summary: String,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<TaskReport>;
}

static REGISTRY: &[&dyn Task] = &[&PingCheckTask, &VersionControlTask];

pub fn registry() -> &'static [&'static dyn Task] {
    REGISTRY
}

pub fn find(name: &str) -> Option<&'static dyn Task> {
    REGISTRY.iter().copied().find(|t| t.name() == name)
}

/// Pings every known device address and records UP/DOWN.
pub struct PingCheckTask;

#[derive(Debug, Default, Serialize)]
struct PingCheckDetails {
    checked: usize,
    up: usize,
    down: usize,
}

#[async_trait]
impl Task for PingCheckTask {
    fn name(&self) -> &'static str {
        "ping_check"
    }

    fn description(&self) -> &'static str {
        "Check reachability of every device address"
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<TaskReport> {
        let addresses = ctx
            .gateway
            .list_all_addresses()
            .await
            .context("failed to list device addresses")?;

        let mut details = PingCheckDetails::default();
        for address in &addresses {
            let up = match ctx.pinger.ping(&address.value).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(address = %address.value, device_id = %address.device_id, error = %e, "address down");
                    false
                }
            };
            ctx.gateway
                .record_address_status(address.id, up, ctx.clock.now())
                .await
                .context("failed to record address status")?;
            details.checked += 1;
            if up {
                details.up += 1;
            } else {
                details.down += 1;
            }
        }

        info!(checked = details.checked, up = details.up, down = details.down, "ping check finished");
        Ok(TaskReport {
            task: self.name().to_string(),
            summary: format!("{} up, {} down", details.up, details.down),
            details: serde_json::to_value(&details)?,
        })
    }
}

/// One monitor run over all active files.
pub struct VersionControlTask;

#[async_trait]
impl Task for VersionControlTask {
    fn name(&self) -> &'static str {
        "version_control"
    }

    fn description(&self) -> &'static str {
        "Detect, archive and alert on changes to monitored files"
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<TaskReport> {
        let cfg = &ctx.config;
        let monitor = Monitor::new(
            Arc::clone(&ctx.gateway),
            Resolver::new(ShareMounts::new(cfg.share_mount_root.clone())),
            Archiver::new(cfg.archive_root.clone()),
            MonitorSettings::from_config(&cfg.monitor)?,
            Arc::clone(&ctx.clock),
        );
        let summary = monitor.run().await?;
        Ok(TaskReport {
            task: self.name().to_string(),
            summary: format!(
                "{}: {} files, {} changes, {} failures",
                summary.status.as_str(),
                summary.files_scanned,
                summary.changes_detected,
                summary.failures
            ),
            details: serde_json::to_value(&summary)?,
        })
    }
}
