//! # Run Configuration
//!
//! Builds the immutable [`RunConfiguration`] record every other component works
//! from. Values are layered in three steps:
//!
//! 1. **Built-in defaults** ([`Settings::default`], backed by [`crate::defaults`])
//! 2. **Configuration file** (`--config run.json`, deserialized into [`ConfigOverrides`])
//! 3. **Command-line flags** (also expressed as [`ConfigOverrides`])
//!
//! Later layers win field by field. Validation is all-or-nothing: either a complete,
//! consistent configuration is returned or an `InvalidConfiguration` error naming the
//! offending field. Environment variables for the collective runtime are modelled as
//! plain data ([`NcclEnv`]) and only become real environment variables at the
//! process-launch boundary.

use crate::{
    cli::parse_duration,
    error::{BenchError, Result},
    node::NodeRole,
    size::{SizeRange, SizeSpec},
};
use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Collective operation exercised by the external benchmark
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// AllReduce across every rank
    #[clap(name = "allreduce")]
    AllReduce,

    /// Point-to-point ping-pong between exactly two ranks
    #[clap(name = "sendrecv")]
    SendRecv,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::AllReduce => "allreduce",
            Operation::SendRecv => "sendrecv",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning knobs passed through to NCCL / PyTorch as environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NcclEnv {
    /// `NCCL_DEBUG`
    pub debug: Option<String>,
    /// `NCCL_DEBUG_SUBSYS`
    pub debug_subsys: Option<String>,
    /// `NCCL_SOCKET_TIMEOUT`, milliseconds
    pub socket_timeout_ms: Option<u64>,
    /// `NCCL_SOCKET_RETRY_CNT`
    pub socket_retry_count: Option<u32>,
    /// `NCCL_IB_DISABLE`
    pub ib_disable: Option<bool>,
    /// `NCCL_NET_GDR_LEVEL`
    pub gdr_level: Option<String>,
    /// `NCCL_SOCKET_IFNAME`
    pub socket_ifname: Option<String>,
    /// `PYTORCH_CUDA_ALLOC_CONF`
    pub alloc_conf: Option<String>,
    /// Anything else, passed verbatim.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl NcclEnv {
    /// Field-by-field merge where `higher` wins.
    pub fn merged(self, higher: NcclEnv) -> NcclEnv {
        let mut extra_env = self.extra_env;
        extra_env.extend(higher.extra_env);
        NcclEnv {
            debug: higher.debug.or(self.debug),
            debug_subsys: higher.debug_subsys.or(self.debug_subsys),
            socket_timeout_ms: higher.socket_timeout_ms.or(self.socket_timeout_ms),
            socket_retry_count: higher.socket_retry_count.or(self.socket_retry_count),
            ib_disable: higher.ib_disable.or(self.ib_disable),
            gdr_level: higher.gdr_level.or(self.gdr_level),
            socket_ifname: higher.socket_ifname.or(self.socket_ifname),
            alloc_conf: higher.alloc_conf.or(self.alloc_conf),
            extra_env,
        }
    }

    /// Environment variable pairs, in a stable order.
    pub fn to_env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                pairs.push((key.to_string(), value));
            }
        };
        push("NCCL_DEBUG", self.debug.clone());
        push("NCCL_DEBUG_SUBSYS", self.debug_subsys.clone());
        push(
            "NCCL_SOCKET_TIMEOUT",
            self.socket_timeout_ms.map(|v| v.to_string()),
        );
        push(
            "NCCL_SOCKET_RETRY_CNT",
            self.socket_retry_count.map(|v| v.to_string()),
        );
        push(
            "NCCL_IB_DISABLE",
            self.ib_disable.map(|v| if v { "1" } else { "0" }.to_string()),
        );
        push("NCCL_NET_GDR_LEVEL", self.gdr_level.clone());
        push("NCCL_SOCKET_IFNAME", self.socket_ifname.clone());
        push("PYTORCH_CUDA_ALLOC_CONF", self.alloc_conf.clone());
        for (key, value) in &self.extra_env {
            pairs.push((key.clone(), value.clone()));
        }
        pairs
    }
}

/// Fully populated defaults for one invocation.
#[derive(Clone, Debug)]
pub struct Settings {
    pub role: NodeRole,
    pub node_count: u32,
    pub gpus_per_node: u32,
    pub master_ip: Option<IpAddr>,
    pub worker_ip: Option<IpAddr>,
    pub port: u32,
    pub port_range: u16,
    pub operation: Operation,
    pub min_size: String,
    pub max_size: String,
    pub step_factor: u32,
    pub iterations: u32,
    pub warmup_iterations: u32,
    pub results_dir: PathBuf,
    pub script: PathBuf,
    pub launcher: Vec<String>,
    pub rdzv_timeout_secs: u64,
    pub cooldown: Duration,
    pub timeout: Option<Duration>,
    pub nccl: NcclEnv,
    pub timestamp: String,
}

impl Default for Settings {
    fn default() -> Self {
        use crate::defaults;
        Self {
            role: NodeRole::Master,
            node_count: 1,
            gpus_per_node: 2,
            master_ip: None,
            worker_ip: None,
            port: u32::from(defaults::MASTER_PORT),
            port_range: defaults::PORT_RANGE,
            operation: Operation::AllReduce,
            min_size: defaults::MIN_SIZE.to_string(),
            max_size: defaults::MAX_SIZE.to_string(),
            step_factor: defaults::STEP_FACTOR,
            iterations: defaults::ITERATIONS,
            warmup_iterations: defaults::WARMUP_ITERATIONS,
            results_dir: PathBuf::from(defaults::RESULTS_DIR),
            script: PathBuf::from(defaults::TEST_SCRIPT),
            launcher: vec![defaults::LAUNCHER.to_string()],
            rdzv_timeout_secs: defaults::RDZV_TIMEOUT_SECS,
            cooldown: defaults::COOLDOWN,
            timeout: None,
            nccl: NcclEnv {
                debug: Some("INFO".to_string()),
                debug_subsys: Some("INIT,NET".to_string()),
                ..NcclEnv::default()
            },
            timestamp: run_timestamp(),
        }
    }
}

/// Optional values from a configuration file or the command line.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub role: Option<NodeRole>,
    pub node_count: Option<u32>,
    pub gpus_per_node: Option<u32>,
    pub master_ip: Option<IpAddr>,
    pub worker_ip: Option<IpAddr>,
    pub port: Option<u32>,
    pub port_range: Option<u16>,
    pub operation: Option<Operation>,
    pub min_size: Option<String>,
    pub max_size: Option<String>,
    pub step_factor: Option<u32>,
    pub iterations: Option<u32>,
    pub warmup_iterations: Option<u32>,
    pub results_dir: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub launcher: Option<Vec<String>>,
    pub rdzv_timeout_secs: Option<u64>,
    /// Human-readable duration, e.g. "5s"
    pub cooldown: Option<String>,
    /// Watchdog per launch, e.g. "10m"
    pub timeout: Option<String>,
    #[serde(default)]
    pub nccl: NcclEnv,
}

impl ConfigOverrides {
    /// Load overrides from a JSON configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let overrides = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(overrides)
    }

    /// Layer `higher` on top of `self`; values present in `higher` win.
    pub fn merged(self, higher: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            role: higher.role.or(self.role),
            node_count: higher.node_count.or(self.node_count),
            gpus_per_node: higher.gpus_per_node.or(self.gpus_per_node),
            master_ip: higher.master_ip.or(self.master_ip),
            worker_ip: higher.worker_ip.or(self.worker_ip),
            port: higher.port.or(self.port),
            port_range: higher.port_range.or(self.port_range),
            operation: higher.operation.or(self.operation),
            min_size: higher.min_size.or(self.min_size),
            max_size: higher.max_size.or(self.max_size),
            step_factor: higher.step_factor.or(self.step_factor),
            iterations: higher.iterations.or(self.iterations),
            warmup_iterations: higher.warmup_iterations.or(self.warmup_iterations),
            results_dir: higher.results_dir.or(self.results_dir),
            script: higher.script.or(self.script),
            launcher: higher.launcher.or(self.launcher),
            rdzv_timeout_secs: higher.rdzv_timeout_secs.or(self.rdzv_timeout_secs),
            cooldown: higher.cooldown.or(self.cooldown),
            timeout: higher.timeout.or(self.timeout),
            nccl: self.nccl.merged(higher.nccl),
        }
    }
}

/// Files produced by one configuration of a sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub log: PathBuf,
    pub csv: PathBuf,
    pub console: PathBuf,
}

impl OutputPaths {
    pub fn derive(results_dir: &Path, label: &str, timestamp: &str) -> Self {
        let stem = format!("{}_{}", label, timestamp);
        Self {
            log: results_dir.join(format!("{}.txt", stem)),
            csv: results_dir.join(format!("{}.csv", stem)),
            console: results_dir.join(format!("{}.txt.console", stem)),
        }
    }
}

/// How the external job is started.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchSettings {
    pub launcher: Vec<String>,
    pub script: PathBuf,
    pub results_dir: PathBuf,
    pub rdzv_timeout_secs: u64,
    pub cooldown: Duration,
    pub timeout: Option<Duration>,
    pub nccl: NcclEnv,
}

/// Immutable description of a single benchmark launch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub label: String,
    pub role: NodeRole,
    pub gpus_per_node: u32,
    pub node_count: u32,
    pub node_rank: u32,
    pub master_address: String,
    pub master_port: u16,
    pub port_range: u16,
    pub worker_address: Option<String>,
    pub size_range: SizeRange,
    pub iterations: u32,
    pub warmup_iterations: u32,
    pub operation: Operation,
    pub timestamp: String,
    pub output_paths: OutputPaths,
    pub launch: LaunchSettings,
}

impl RunConfiguration {
    /// Apply `overrides` on top of `defaults` and validate the result.
    pub fn build(defaults: &Settings, overrides: &ConfigOverrides) -> Result<Self> {
        let o = overrides;
        let role = o.role.unwrap_or(defaults.role);
        let node_count = o.node_count.unwrap_or(defaults.node_count);
        let gpus_per_node = o.gpus_per_node.unwrap_or(defaults.gpus_per_node);
        let master_ip = o.master_ip.or(defaults.master_ip);
        let worker_ip = o.worker_ip.or(defaults.worker_ip);
        let port = o.port.unwrap_or(defaults.port);
        let port_range = o.port_range.unwrap_or(defaults.port_range);
        let operation = o.operation.unwrap_or(defaults.operation);
        let step_factor = o.step_factor.unwrap_or(defaults.step_factor);
        let iterations = o.iterations.unwrap_or(defaults.iterations);
        let warmup_iterations = o.warmup_iterations.unwrap_or(defaults.warmup_iterations);
        let launcher = o.launcher.clone().unwrap_or_else(|| defaults.launcher.clone());
        let results_dir = o
            .results_dir
            .clone()
            .unwrap_or_else(|| defaults.results_dir.clone());

        let min = SizeSpec::parse(o.min_size.as_deref().unwrap_or(&defaults.min_size))?;
        let max = SizeSpec::parse(o.max_size.as_deref().unwrap_or(&defaults.max_size))?;
        if min > max {
            return Err(BenchError::invalid(
                "size_range",
                format!("minimum size {} is larger than maximum size {}", min, max),
            ));
        }
        if step_factor < 2 {
            return Err(BenchError::invalid(
                "step_factor",
                format!("step factor must be greater than 1, got {}", step_factor),
            ));
        }
        if node_count == 0 {
            return Err(BenchError::invalid("node_count", "node count must be positive"));
        }
        if port == 0 || port > u32::from(u16::MAX) {
            return Err(BenchError::invalid(
                "master_port",
                format!("port {} is outside 1-65535", port),
            ));
        }
        if port_range == 0 {
            return Err(BenchError::invalid("port_range", "port range must be positive"));
        }
        if iterations == 0 {
            return Err(BenchError::invalid("iterations", "iterations must be positive"));
        }
        if launcher.is_empty() || launcher[0].trim().is_empty() {
            return Err(BenchError::invalid("launcher", "launcher command is empty"));
        }

        let cooldown = match &o.cooldown {
            Some(raw) => parse_duration(raw).map_err(|e| BenchError::invalid("cooldown", e))?,
            None => defaults.cooldown,
        };
        let timeout = match &o.timeout {
            Some(raw) => Some(parse_duration(raw).map_err(|e| BenchError::invalid("timeout", e))?),
            None => defaults.timeout,
        };

        let multi_node = node_count > 1;
        let (node_rank, master_address) = if multi_node {
            let master_ip = master_ip.ok_or_else(|| {
                BenchError::invalid("master_ip", "multi-node runs need the master address")
            })?;
            let node_rank = role.node_rank().ok_or_else(|| BenchError::UnresolvedNodeRole {
                master: master_ip.to_string(),
                worker: worker_ip.map_or_else(|| "<unset>".to_string(), |ip| ip.to_string()),
            })?;
            (node_rank, master_ip.to_string())
        } else {
            (0, crate::defaults::LOCAL_MASTER_ADDRESS.to_string())
        };

        let timestamp = defaults.timestamp.clone();
        let launch = LaunchSettings {
            launcher,
            script: o.script.clone().unwrap_or_else(|| defaults.script.clone()),
            results_dir,
            rdzv_timeout_secs: o.rdzv_timeout_secs.unwrap_or(defaults.rdzv_timeout_secs),
            cooldown,
            timeout,
            nccl: defaults.nccl.clone().merged(o.nccl.clone()),
        };

        let mut config = RunConfiguration {
            label: String::new(),
            role: if multi_node { role } else { NodeRole::Master },
            gpus_per_node,
            node_count,
            node_rank,
            master_address,
            master_port: port as u16,
            port_range,
            worker_address: worker_ip.map(|ip| ip.to_string()),
            size_range: SizeRange {
                min,
                max,
                step_factor,
            },
            iterations,
            warmup_iterations,
            operation,
            timestamp,
            output_paths: OutputPaths::derive(Path::new(""), "", ""),
            launch,
        };
        config.validate_world_size()?;
        config.relabel();
        Ok(config)
    }

    /// The same configuration for a different GPU count.
    pub fn with_gpus(&self, gpus_per_node: u32) -> Result<Self> {
        let mut config = self.clone();
        config.gpus_per_node = gpus_per_node;
        config.validate_world_size()?;
        config.relabel();
        Ok(config)
    }

    /// The same configuration rendezvousing on `port`.
    pub fn with_port(&self, port: u16) -> Self {
        let mut config = self.clone();
        config.master_port = port;
        config
    }

    /// World size. Construction rejects products that overflow.
    pub fn total_gpus(&self) -> u32 {
        self.gpus_per_node.saturating_mul(self.node_count)
    }

    pub fn is_multi_node(&self) -> bool {
        self.node_count > 1
    }

    pub fn test_mode(&self) -> &'static str {
        if self.is_multi_node() {
            "multi_node"
        } else {
            "single_node"
        }
    }

    /// Contiguous device list `0..gpus_per_node`, as `CUDA_VISIBLE_DEVICES` expects.
    pub fn visible_devices(&self) -> String {
        (0..self.gpus_per_node)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn validate_world_size(&self) -> Result<()> {
        if self.gpus_per_node == 0 {
            return Err(BenchError::invalid(
                "gpus_per_node",
                "GPUs per node must be positive",
            ));
        }
        let world = self
            .gpus_per_node
            .checked_mul(self.node_count)
            .ok_or_else(|| {
                BenchError::invalid(
                    "gpus_per_node",
                    format!(
                        "{} GPUs on each of {} nodes is too many ranks",
                        self.gpus_per_node, self.node_count
                    ),
                )
            })?;
        match self.operation {
            Operation::AllReduce if world < 2 => Err(BenchError::invalid(
                "gpus_per_node",
                format!("allreduce needs at least 2 ranks, got {}", world),
            )),
            Operation::SendRecv if world != 2 => Err(BenchError::invalid(
                "gpus_per_node",
                format!("sendrecv needs exactly 2 ranks, got {}", world),
            )),
            _ => Ok(()),
        }
    }

    fn relabel(&mut self) {
        self.label = if self.is_multi_node() {
            format!("{}_{}x{}gpu", self.role, self.node_count, self.gpus_per_node)
        } else {
            format!("single_node_{}gpu", self.gpus_per_node)
        };
        self.output_paths =
            OutputPaths::derive(&self.launch.results_dir, &self.label, &self.timestamp);
    }
}

/// Creation-time stamp shared by every file of a sweep.
pub fn run_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_defaults() -> Settings {
        Settings {
            timestamp: "20240101_120000".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_build_with_defaults() {
        let config = RunConfiguration::build(&fixed_defaults(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.label, "single_node_2gpu");
        assert_eq!(config.master_port, 29500);
        assert_eq!(config.node_rank, 0);
        assert_eq!(config.total_gpus(), 2);
        assert_eq!(config.test_mode(), "single_node");
        assert_eq!(config.size_range.min.bytes(), 2048);
        assert_eq!(
            config.output_paths.console,
            PathBuf::from("results/single_node_2gpu_20240101_120000.txt.console")
        );
    }

    #[test]
    fn test_inverted_size_range_names_field() {
        let overrides = ConfigOverrides {
            min_size: Some("8G".into()),
            max_size: Some("2K".into()),
            ..Default::default()
        };
        match RunConfiguration::build(&fixed_defaults(), &overrides) {
            Err(BenchError::InvalidConfiguration { field, .. }) => assert_eq!(field, "size_range"),
            other => panic!("expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_fields_rejected() {
        let cases: Vec<(ConfigOverrides, &str)> = vec![
            (
                ConfigOverrides {
                    port: Some(70000),
                    ..Default::default()
                },
                "master_port",
            ),
            (
                ConfigOverrides {
                    port: Some(0),
                    ..Default::default()
                },
                "master_port",
            ),
            (
                ConfigOverrides {
                    gpus_per_node: Some(0),
                    ..Default::default()
                },
                "gpus_per_node",
            ),
            (
                ConfigOverrides {
                    step_factor: Some(1),
                    ..Default::default()
                },
                "step_factor",
            ),
            (
                ConfigOverrides {
                    iterations: Some(0),
                    ..Default::default()
                },
                "iterations",
            ),
            (
                ConfigOverrides {
                    node_count: Some(2),
                    ..Default::default()
                },
                "master_ip",
            ),
        ];
        for (overrides, expected) in cases {
            match RunConfiguration::build(&fixed_defaults(), &overrides) {
                Err(BenchError::InvalidConfiguration { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected {} error, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let cases: Vec<(ConfigOverrides, &str)> = vec![
            (
                ConfigOverrides {
                    cooldown: Some("1e20s".into()),
                    ..Default::default()
                },
                "cooldown",
            ),
            (
                ConfigOverrides {
                    timeout: Some("1e20h".into()),
                    ..Default::default()
                },
                "timeout",
            ),
            (
                ConfigOverrides {
                    node_count: Some(2),
                    gpus_per_node: Some(u32::MAX),
                    role: Some(NodeRole::Master),
                    master_ip: Some("10.0.0.5".parse().unwrap()),
                    ..Default::default()
                },
                "gpus_per_node",
            ),
        ];
        for (overrides, expected) in cases {
            match RunConfiguration::build(&fixed_defaults(), &overrides) {
                Err(BenchError::InvalidConfiguration { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected {} error, got {:?}", expected, other),
            }
        }

        let base = RunConfiguration::build(&fixed_defaults(), &ConfigOverrides::default()).unwrap();
        let multi = RunConfiguration {
            node_count: 2,
            ..base
        };
        assert!(multi.with_gpus(u32::MAX).is_err());
    }

    #[test]
    fn test_bad_size_token_propagates() {
        let overrides = ConfigOverrides {
            max_size: Some("lots".into()),
            ..Default::default()
        };
        assert!(matches!(
            RunConfiguration::build(&fixed_defaults(), &overrides),
            Err(BenchError::InvalidSizeFormat { .. })
        ));
    }

    #[test]
    fn test_multi_node_worker() {
        let overrides = ConfigOverrides {
            role: Some(NodeRole::Worker),
            node_count: Some(2),
            gpus_per_node: Some(4),
            master_ip: Some("10.0.0.5".parse().unwrap()),
            worker_ip: Some("10.0.0.9".parse().unwrap()),
            ..Default::default()
        };
        let config = RunConfiguration::build(&fixed_defaults(), &overrides).unwrap();
        assert_eq!(config.label, "worker_2x4gpu");
        assert_eq!(config.node_rank, 1);
        assert_eq!(config.master_address, "10.0.0.5");
        assert_eq!(config.total_gpus(), 8);
        assert_eq!(config.visible_devices(), "0,1,2,3");
        assert_eq!(config.test_mode(), "multi_node");
    }

    #[test]
    fn test_unknown_role_fails_for_multi_node() {
        let overrides = ConfigOverrides {
            role: Some(NodeRole::Unknown),
            node_count: Some(2),
            master_ip: Some("10.0.0.5".parse().unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            RunConfiguration::build(&fixed_defaults(), &overrides),
            Err(BenchError::UnresolvedNodeRole { .. })
        ));
    }

    #[test]
    fn test_sendrecv_requires_two_ranks() {
        let overrides = ConfigOverrides {
            operation: Some(Operation::SendRecv),
            gpus_per_node: Some(4),
            ..Default::default()
        };
        assert!(RunConfiguration::build(&fixed_defaults(), &overrides).is_err());

        let base = RunConfiguration::build(&fixed_defaults(), &ConfigOverrides::default()).unwrap();
        assert!(base.with_gpus(1).is_err());
        let eight = base.with_gpus(8).unwrap();
        assert_eq!(eight.label, "single_node_8gpu");
        assert_ne!(eight.output_paths.csv, base.output_paths.csv);
    }

    #[test]
    fn test_overrides_layering() {
        let file = ConfigOverrides {
            iterations: Some(50),
            port: Some(30000),
            nccl: NcclEnv {
                socket_ifname: Some("eth0".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let cli = ConfigOverrides {
            port: Some(31000),
            ..Default::default()
        };
        let merged = file.merged(cli);
        assert_eq!(merged.iterations, Some(50));
        assert_eq!(merged.port, Some(31000));

        let config = RunConfiguration::build(&fixed_defaults(), &merged).unwrap();
        let env = config.launch.nccl.to_env_pairs();
        assert!(env.contains(&("NCCL_SOCKET_IFNAME".to_string(), "eth0".to_string())));
        assert!(env.contains(&("NCCL_DEBUG".to_string(), "INFO".to_string())));
    }

    #[test]
    fn test_config_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{
                "master_ip": "192.168.1.10",
                "worker_ip": "192.168.1.11",
                "cooldown": "2s",
                "nccl": { "ib_disable": true, "extra_env": { "NCCL_P2P_DISABLE": "1" } }
            }"#,
        )
        .unwrap();
        let overrides = ConfigOverrides::from_file(&path).unwrap();
        let config = RunConfiguration::build(&fixed_defaults(), &overrides).unwrap();
        assert_eq!(config.launch.cooldown, Duration::from_secs(2));
        let env = config.launch.nccl.to_env_pairs();
        assert!(env.contains(&("NCCL_IB_DISABLE".to_string(), "1".to_string())));
        assert!(env.contains(&("NCCL_P2P_DISABLE".to_string(), "1".to_string())));

        std::fs::write(&path, r#"{ "bogus": 1 }"#).unwrap();
        assert!(ConfigOverrides::from_file(&path).is_err());
    }
}
