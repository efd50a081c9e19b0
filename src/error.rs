//! Error taxonomy for the sweep driver.
//!
//! Configuration-time errors are fatal preconditions: they abort the sweep before
//! anything is launched. `LaunchFailure` is recorded per run and never aborts the
//! sweep, and `ProbeFailure` is purely diagnostic.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("invalid size format '{token}': expected <number>[K|M|G]")]
    InvalidSizeFormat { token: String },

    #[error("invalid configuration for '{field}': {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },

    #[error("no available port in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("could not resolve node role: none of the local addresses match master {master} or worker {worker}")]
    UnresolvedNodeRole { master: String, worker: String },

    #[error("missing external dependency '{name}'")]
    MissingExternalDependency { name: String, hint: String },

    #[error("peer {peer} is unreachable")]
    PeerUnreachable { peer: String },

    #[error("launch of '{label}' failed: {reason}")]
    LaunchFailure { label: String, reason: String },

    #[error("probe check '{check}' failed: {detail}")]
    ProbeFailure { check: String, detail: String },

    #[error("interrupted while running '{label}'")]
    Cancelled { label: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BenchError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        BenchError::InvalidConfiguration {
            field,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BenchError::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the whole sweep; the rest are recorded and reported.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BenchError::LaunchFailure { .. } | BenchError::ProbeFailure { .. }
        )
    }

    /// Advice printed next to a fatal precondition.
    pub fn remediation(&self) -> Option<String> {
        match self {
            BenchError::InvalidSizeFormat { .. } => {
                Some("use a positive integer with an optional K, M or G suffix, e.g. 2K, 1M, 8G".into())
            }
            BenchError::InvalidConfiguration { field, .. } => Some(match *field {
                "size_range" => "make sure --min-size is not larger than --max-size".into(),
                "master_port" => "pick a port between 1 and 65535, e.g. --port 29500".into(),
                "gpus_per_node" => {
                    "check `nvidia-smi --list-gpus` and request at most that many GPUs per node".into()
                }
                "master_ip" => "pass --master-ip or set \"master_ip\" in the config file".into(),
                other => format!("check the value given for {}", other),
            }),
            BenchError::NoAvailablePort { end, .. } => Some(format!(
                "free the rendezvous port (`ss -tlnp | grep <port>`) or retry with --port {}",
                end.saturating_add(1)
            )),
            BenchError::UnresolvedNodeRole { .. } => Some(
                "pass --master or --worker explicitly, or fix --master-ip / --worker-ip".into(),
            ),
            BenchError::MissingExternalDependency { hint, .. } => Some(hint.clone()),
            BenchError::PeerUnreachable { peer } => Some(format!(
                "run `collective-bench probe --peer {}` and check the firewall; \
                 setting NCCL_SOCKET_IFNAME (--socket-ifname) to the cluster interface often helps",
                peer
            )),
            BenchError::Cancelled { .. } => None,
            BenchError::LaunchFailure { .. } | BenchError::ProbeFailure { .. } => None,
            BenchError::Io { .. } => {
                Some("check that the results directory is writable (--results-dir)".into())
            }
        }
    }
}
