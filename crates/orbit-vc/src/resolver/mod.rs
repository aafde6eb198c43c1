use std::{
    fs, io,
    net::IpAddr,
    path::PathBuf,
    str::FromStr,
};

use ipnet::IpNet;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::NetworkAddress;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessFailure {
    #[error("File not found or access denied: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Io(String),
}

impl AccessFailure {
    pub fn from_io(share_path: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AccessFailure::NotFound(share_path.to_string()),
            io::ErrorKind::PermissionDenied => {
                AccessFailure::PermissionDenied(format!("{share_path}: {err}"))
            }
            _ => AccessFailure::Io(format!("{share_path}: {err}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAttempt {
    pub address: String,
    pub failure: AccessFailure,
}

/// Host names and IP literals only. Anything that could act as a path
/// component (`.`, `..`, separators) is refused.
pub fn is_plain_host(address: &str) -> bool {
    !address.is_empty()
        && !address.starts_with(['-', '.'])
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_' | '%'))
}

/// Joins attempts as `addr: reason; addr: reason` in trial order.
pub fn join_attempts(attempts: &[AddressAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.address, a.failure))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("File path must be absolute with drive letter or a network path: {0}")]
    InvalidPath(String),

    #[error("No addresses provided")]
    NoAddresses,

    #[error("No candidate address yielded an accessible path. Errors: {}", join_attempts(.0))]
    Unreachable(Vec<AddressAttempt>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePath {
    Drive { letter: char, tail: String },
    Network(String),
}

impl DevicePath {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let raw = raw.trim();
        let invalid = || ResolveError::InvalidPath(raw.to_string());

        if raw.split(['\\', '/']).any(|part| part == "..") {
            return Err(invalid());
        }

        if raw.starts_with(r"\\") || raw.starts_with("//") {
            let host = raw[2..].split(['\\', '/']).next().unwrap_or_default();
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(DevicePath::Network(raw.to_string()));
        }

        let mut chars = raw.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(letter), Some(':'), Some('\\' | '/')) if letter.is_ascii_alphabetic() => {
                Ok(DevicePath::Drive {
                    letter,
                    tail: raw[2..].replace('/', "\\"),
                })
            }
            _ => Err(invalid()),
        }
    }

    pub fn share_path(&self, address: &str) -> String {
        match self {
            DevicePath::Drive { letter, tail } => format!(r"\\{address}\{letter}${tail}"),
            DevicePath::Network(path) => path.clone(),
        }
    }

    /// Splits into (full path, parent directory, file name) as they read on the device.
    pub fn components(&self) -> (String, String, String) {
        let full = match self {
            DevicePath::Drive { letter, tail } => format!("{letter}:{tail}"),
            DevicePath::Network(path) => path.clone(),
        };
        let trimmed = full.trim_end_matches(['\\', '/']);
        match trimmed.rfind(['\\', '/']) {
            Some(idx) => (
                full.clone(),
                trimmed[..idx].to_string(),
                trimmed[idx + 1..].to_string(),
            ),
            None => (full.clone(), String::new(), trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShareMounts {
    root: Option<PathBuf>,
}

impl ShareMounts {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn local_path(&self, share_path: &str) -> PathBuf {
        match &self.root {
            None => PathBuf::from(share_path),
            Some(root) => share_path
                .split(['\\', '/'])
                .filter(|part| !matches!(*part, "" | "." | ".."))
                .fold(root.clone(), |mut path, part| {
                    path.push(part);
                    path
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub address: Option<String>,
    pub share_path: String,
    pub local: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub path: ResolvedPath,
    pub value: T,
}

#[derive(Debug, Clone, Default)]
pub struct AddressPreference {
    categories: Vec<String>,
    subnets: Vec<IpNet>,
}

impl AddressPreference {
    pub fn new(categories: &[String], subnets: &[String]) -> Result<Self, ipnet::AddrParseError> {
        Ok(Self {
            categories: categories.to_vec(),
            subnets: subnets
                .iter()
                .map(|s| IpNet::from_str(s.trim()))
                .collect::<Result<_, _>>()?,
        })
    }

    /// First address in a preferred category, else first inside a preferred
    /// subnet, else the first address at all.
    pub fn select<'a>(&self, addresses: &'a [NetworkAddress]) -> Option<&'a NetworkAddress> {
        addresses
            .iter()
            .find(|a| self.is_preferred_category(a.category.as_deref()))
            .or_else(|| addresses.iter().find(|a| self.in_preferred_subnet(&a.value)))
            .or_else(|| addresses.first())
    }

    fn is_preferred_category(&self, category: Option<&str>) -> bool {
        category.is_some_and(|c| self.categories.iter().any(|p| p.eq_ignore_ascii_case(c)))
    }

    fn in_preferred_subnet(&self, value: &str) -> bool {
        IpAddr::from_str(value.trim())
            .map(|ip| self.subnets.iter().any(|net| net.contains(&ip)))
            .unwrap_or(false)
    }
}

pub fn check_accessible(resolved: &ResolvedPath) -> Result<(), AccessFailure> {
    match fs::metadata(&resolved.local) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(AccessFailure::Io(format!(
            "{}: not a regular file",
            resolved.share_path
        ))),
        Err(e) => Err(AccessFailure::from_io(&resolved.share_path, &e)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    mounts: ShareMounts,
}

impl Resolver {
    pub fn new(mounts: ShareMounts) -> Self {
        Self { mounts }
    }

    pub fn locate(&self, path: &DevicePath, address: Option<&str>) -> ResolvedPath {
        let share_path = match address {
            Some(address) => path.share_path(address.trim()),
            None => path.share_path(""),
        };
        ResolvedPath {
            address: address.map(|a| a.trim().to_string()),
            local: self.mounts.local_path(&share_path),
            share_path,
        }
    }

    /// Runs `op` against each address in order and returns the first success.
    /// Addresses after the first success are never touched.
    pub fn resolve_ordered<T, F>(
        &self,
        addresses: &[String],
        device_path: &str,
        mut op: F,
    ) -> Result<Resolved<T>, ResolveError>
    where
        F: FnMut(&ResolvedPath) -> Result<T, AccessFailure>,
    {
        let parsed = DevicePath::parse(device_path)?;
        if addresses.is_empty() {
            return Err(ResolveError::NoAddresses);
        }

        let mut attempts = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !is_plain_host(address.trim()) {
                warn!(address = %address, "refusing address that is not a host name or IP");
                attempts.push(AddressAttempt {
                    address: address.clone(),
                    failure: AccessFailure::Io(format!("invalid address: {address:?}")),
                });
                continue;
            }
            let resolved = self.locate(&parsed, Some(address));
            match op(&resolved) {
                Ok(value) => {
                    debug!(address = %address, path = %resolved.share_path, "resolved path");
                    return Ok(Resolved {
                        path: resolved,
                        value,
                    });
                }
                Err(failure) => {
                    warn!(address = %address, path = %resolved.share_path, error = %failure, "address attempt failed");
                    attempts.push(AddressAttempt {
                        address: address.clone(),
                        failure,
                    });
                }
            }
        }

        Err(ResolveError::Unreachable(attempts))
    }

    pub fn resolve_preferred(
        &self,
        addresses: &[NetworkAddress],
        preference: &AddressPreference,
        device_path: &str,
    ) -> Result<ResolvedPath, ResolveError> {
        let parsed = DevicePath::parse(device_path)?;
        let resolved = match (preference.select(addresses), &parsed) {
            (Some(address), _) if !is_plain_host(address.value.trim()) => {
                return Err(ResolveError::Unreachable(vec![AddressAttempt {
                    address: address.value.clone(),
                    failure: AccessFailure::Io(format!("invalid address: {:?}", address.value)),
                }]));
            }
            (Some(address), _) => self.locate(&parsed, Some(&address.value)),
            (None, DevicePath::Network(_)) => self.locate(&parsed, None),
            (None, DevicePath::Drive { .. }) => return Err(ResolveError::NoAddresses),
        };

        check_accessible(&resolved).map_err(|failure| {
            ResolveError::Unreachable(vec![AddressAttempt {
                address: resolved.address.clone().unwrap_or_default(),
                failure,
            }])
        })?;
        Ok(resolved)
    }
}
