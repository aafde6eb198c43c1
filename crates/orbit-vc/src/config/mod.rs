use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub archive_root: PathBuf,
    /// Local directory under which administrative shares are mounted as
    /// `<root>/<address>/<share>/...`. When unset, share paths are opened as-is.
    pub share_mount_root: Option<PathBuf>,
    pub api_token: Option<String>,
    pub monitor: MonitorConfig,
    pub probe: ProbeConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub preferred_categories: Vec<String>,
    pub preferred_subnets: Vec<String>,
    pub per_file_timeout_secs: u64,
    pub detect_mtime_drift: bool,
    pub mtime_tolerance_secs: u64,
    pub lease_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_secs: u64,
    pub tasks: Vec<TaskSchedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSchedule {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub level: String,
}

fn enabled_by_default() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    60
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("ORBIT_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let raw = fs::read_to_string(&path).ok();
        let mut cfg = Self::from_json(raw.as_deref())
            .with_context(|| format!("failed to parse {path}"))?;
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn from_json(raw: Option<&str>) -> anyhow::Result<Self> {
        Ok(raw
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_else(Self::default))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ORBIT_HOST") {
            self.host = v;
        }
        if let Some(v) = var("ORBIT_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("ORBIT_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("ORBIT_ARCHIVE_ROOT") {
            self.archive_root = PathBuf::from(v);
        }
        if let Some(v) = var("ORBIT_SHARE_MOUNT_ROOT") {
            self.share_mount_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ORBIT_API_TOKEN") {
            self.api_token = Some(v);
        }
        if let Some(v) = var("ORBIT_PREFERRED_SUBNETS") {
            self.monitor.preferred_subnets = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://orbit-vc.db?mode=rwc".to_string(),
            archive_root: PathBuf::from("./Archive"),
            share_mount_root: None,
            api_token: None,
            monitor: MonitorConfig::default(),
            probe: ProbeConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            preferred_categories: vec!["Network-01".to_string()],
            preferred_subnets: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
            per_file_timeout_secs: 120,
            detect_mtime_drift: true,
            mtime_tolerance_secs: 1,
            lease_ttl_secs: 3600,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1,
            command_timeout_secs: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            tasks: vec![
                TaskSchedule {
                    name: "ping_check".to_string(),
                    enabled: true,
                    interval_minutes: 5,
                },
                TaskSchedule {
                    name: "version_control".to_string(),
                    enabled: true,
                    interval_minutes: 60,
                },
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./Logs"),
            level: "info".to_string(),
        }
    }
}
