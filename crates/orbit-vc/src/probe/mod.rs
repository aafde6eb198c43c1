use std::{collections::HashSet, process::Stdio, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info};

use crate::{config::ProbeConfig, resolver::is_plain_host};

const ALLOWED_COMMANDS: &[&str] = &["ping"];

pub async fn run_command_allowlisted(
    cmd: &str,
    args: &[String],
    allowed: &[&str],
    timeout_secs: u64,
) -> anyhow::Result<String> {
    let allowed_set: HashSet<&str> = allowed.iter().copied().collect();
    if !allowed_set.contains(cmd) {
        anyhow::bail!("command not allowed: {cmd}");
    }

    info!(command = cmd, ?args, "audit: launching external tool");
    let child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn command")?;

    let out = timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
        .await
        .context("command timed out")??;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let detail = if stderr.trim().is_empty() {
            format!("exit status {}", out.status)
        } else {
            stderr.trim().to_string()
        };
        anyhow::bail!("command failed: {detail}");
    }

    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

#[async_trait]
pub trait Pinger: Send + Sync {
    /// One echo request. `Err` carries the reason the address did not answer.
    async fn ping(&self, address: &str) -> anyhow::Result<()>;
}

/// Uses the operating system's `ping` binary.
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    timeout_secs: u64,
    command_timeout_secs: u64,
}

impl IcmpPinger {
    pub fn new(cfg: &ProbeConfig) -> Self {
        Self {
            timeout_secs: cfg.timeout_secs.max(1),
            command_timeout_secs: cfg.command_timeout_secs.max(1),
        }
    }

    fn args(&self, address: &str) -> Vec<String> {
        if cfg!(windows) {
            vec![
                "-n".into(),
                "1".into(),
                "-w".into(),
                (self.timeout_secs * 1000).to_string(),
                address.into(),
            ]
        } else {
            vec![
                "-c".into(),
                "1".into(),
                "-W".into(),
                self.timeout_secs.to_string(),
                address.into(),
            ]
        }
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, address: &str) -> anyhow::Result<()> {
        validate_address(address)?;
        run_command_allowlisted(
            "ping",
            &self.args(address),
            ALLOWED_COMMANDS,
            self.command_timeout_secs,
        )
        .await
        .map(|_| ())
    }
}

fn validate_address(address: &str) -> anyhow::Result<()> {
    if !is_plain_host(address) {
        anyhow::bail!("invalid address: {address:?}");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub message: String,
}

/// Pings each address in order and stops at the first that answers.
pub async fn probe_first_reachable(pinger: &dyn Pinger, addresses: &[String]) -> ProbeResult {
    if addresses.is_empty() {
        return ProbeResult {
            success: false,
            address: None,
            message: "No addresses provided".to_string(),
        };
    }

    let mut errors = Vec::new();
    for address in addresses {
        match pinger.ping(address).await {
            Ok(()) => {
                info!(address = %address, "address reachable");
                return ProbeResult {
                    success: true,
                    address: Some(address.clone()),
                    message: format!("Address {address} is reachable"),
                };
            }
            Err(e) => {
                debug!(address = %address, error = %e, "address unreachable");
                errors.push(format!("{address}: {e}"));
            }
        }
    }

    ProbeResult {
        success: false,
        address: None,
        message: format!("All addresses unreachable. Errors: {}", errors.join("; ")),
    }
}
