use crate::{
    config::{ConfigOverrides, NcclEnv, Operation},
    node::NodeRole,
    sweep::SweepSelector,
};
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Collective Bench - sweep driver for multi-node NCCL collective benchmarks
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[clap(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print warnings and errors
    #[clap(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sweep GPU counts on this node only
    SingleNode(SingleNodeArgs),

    /// Sweep GPUs-per-node across the two-node cluster
    MultiNode(MultiNodeArgs),

    /// Check reachability of the peer node (ICMP, TCP, firewall, InfiniBand)
    Probe(ProbeArgs),
}

#[derive(clap::Args, Debug, Clone)]
#[clap(group(ArgGroup::new("selector").multiple(false)))]
pub struct SingleNodeArgs {
    /// Run with 2 GPUs
    #[clap(long = "2gpu", group = "selector", help_heading = "Sweep")]
    pub two_gpu: bool,

    /// Run with 4 GPUs
    #[clap(long = "4gpu", group = "selector", help_heading = "Sweep")]
    pub four_gpu: bool,

    /// Run with 8 GPUs
    #[clap(long = "8gpu", group = "selector", help_heading = "Sweep")]
    pub eight_gpu: bool,

    /// Run 2, 4 and 8 GPUs in sequence (default)
    #[clap(long, group = "selector", help_heading = "Sweep")]
    pub all: bool,

    #[clap(flatten)]
    pub common: CommonArgs,
}

impl SingleNodeArgs {
    pub fn selector(&self) -> SweepSelector {
        if self.two_gpu {
            SweepSelector::Only(2)
        } else if self.four_gpu {
            SweepSelector::Only(4)
        } else if self.eight_gpu {
            SweepSelector::Only(8)
        } else {
            SweepSelector::All
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
#[clap(group(ArgGroup::new("selector").multiple(false)))]
#[clap(group(ArgGroup::new("role").multiple(false)))]
pub struct MultiNodeArgs {
    /// 2 nodes x 1 GPU
    #[clap(long = "2x1gpu", group = "selector", help_heading = "Sweep")]
    pub x1: bool,
    /// 2 nodes x 2 GPUs
    #[clap(long = "2x2gpu", group = "selector", help_heading = "Sweep")]
    pub x2: bool,
    /// 2 nodes x 3 GPUs
    #[clap(long = "2x3gpu", group = "selector", help_heading = "Sweep")]
    pub x3: bool,
    /// 2 nodes x 4 GPUs
    #[clap(long = "2x4gpu", group = "selector", help_heading = "Sweep")]
    pub x4: bool,
    /// 2 nodes x 5 GPUs
    #[clap(long = "2x5gpu", group = "selector", help_heading = "Sweep")]
    pub x5: bool,
    /// 2 nodes x 6 GPUs
    #[clap(long = "2x6gpu", group = "selector", help_heading = "Sweep")]
    pub x6: bool,
    /// 2 nodes x 7 GPUs
    #[clap(long = "2x7gpu", group = "selector", help_heading = "Sweep")]
    pub x7: bool,
    /// 2 nodes x 8 GPUs
    #[clap(long = "2x8gpu", group = "selector", help_heading = "Sweep")]
    pub x8: bool,

    /// Sweep 1 through 8 GPUs per node (default)
    #[clap(long, group = "selector", help_heading = "Sweep")]
    pub all: bool,

    /// Explicit GPUs per node
    #[clap(long, group = "selector", help_heading = "Sweep")]
    pub gpus: Option<u32>,

    /// Act as the master node regardless of local addresses
    #[clap(long, group = "role", help_heading = "Cluster")]
    pub master: bool,

    /// Act as the worker node regardless of local addresses
    #[clap(long, group = "role", help_heading = "Cluster")]
    pub worker: bool,

    #[clap(flatten)]
    pub common: CommonArgs,
}

impl MultiNodeArgs {
    pub fn selector(&self) -> SweepSelector {
        if let Some(gpus) = self.gpus {
            return SweepSelector::Only(gpus);
        }
        let flags = [
            self.x1, self.x2, self.x3, self.x4, self.x5, self.x6, self.x7, self.x8,
        ];
        match flags.iter().position(|&set| set) {
            Some(index) => SweepSelector::Only(index as u32 + 1),
            None => SweepSelector::All,
        }
    }

    pub fn role_override(&self) -> Option<NodeRole> {
        if self.master {
            Some(NodeRole::Master)
        } else if self.worker {
            Some(NodeRole::Worker)
        } else {
            None
        }
    }
}

/// Options shared by the sweep subcommands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// JSON configuration file (CLI flags take precedence)
    #[clap(long, help_heading = "Core Options")]
    pub config: Option<PathBuf>,

    /// Directory for transcripts, CSV files and the sweep summary
    #[clap(long, help_heading = "Core Options")]
    pub results_dir: Option<PathBuf>,

    /// External benchmark script run by the launcher
    #[clap(long, help_heading = "Core Options")]
    pub script: Option<PathBuf>,

    /// Launcher command, e.g. "torchrun" or "python -m torch.distributed.run"
    #[clap(long, help_heading = "Core Options")]
    pub launcher: Option<String>,

    /// Collective operation to benchmark
    #[clap(long, value_enum, help_heading = "Core Options")]
    pub operation: Option<Operation>,

    /// Print the launch commands without running them
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub dry_run: bool,

    /// Smallest message size (e.g. 2K)
    #[clap(long, help_heading = "Sizes")]
    pub min_size: Option<String>,

    /// Largest message size (e.g. 8G)
    #[clap(long, help_heading = "Sizes")]
    pub max_size: Option<String>,

    /// Multiplier between successive sizes
    #[clap(long, help_heading = "Sizes")]
    pub step_factor: Option<u32>,

    /// Measured iterations per size
    #[clap(short = 'i', long, help_heading = "Sizes")]
    pub iterations: Option<u32>,

    /// Warmup iterations per size
    #[clap(short = 'w', long = "warmup-iters", help_heading = "Sizes")]
    pub warmup_iterations: Option<u32>,

    /// Pause between configurations (e.g. "5s")
    #[clap(long, help_heading = "Timing")]
    pub cooldown: Option<String>,

    /// Kill a launch that runs longer than this (e.g. "10m")
    #[clap(long, help_heading = "Timing")]
    pub timeout: Option<String>,

    /// Rendezvous timeout handed to the launcher, in seconds
    #[clap(long, help_heading = "Timing")]
    pub rdzv_timeout: Option<u64>,

    /// Rendezvous port (the master scans upward from here if it is busy)
    #[clap(short = 'p', long, help_heading = "Cluster")]
    pub port: Option<u32>,

    /// How many ports to scan starting at --port
    #[clap(long, help_heading = "Cluster")]
    pub port_range: Option<u16>,

    /// Address of the master node
    #[clap(long, help_heading = "Cluster")]
    pub master_ip: Option<IpAddr>,

    /// Address of the worker node
    #[clap(long, help_heading = "Cluster")]
    pub worker_ip: Option<IpAddr>,

    /// NCCL_DEBUG level (e.g. WARN, INFO, TRACE)
    #[clap(long, help_heading = "NCCL Environment")]
    pub nccl_debug: Option<String>,

    /// NCCL_DEBUG_SUBSYS filter (e.g. INIT,NET)
    #[clap(long, help_heading = "NCCL Environment")]
    pub nccl_debug_subsys: Option<String>,

    /// NCCL_SOCKET_IFNAME, the interface used for bootstrap and socket transport
    #[clap(long, help_heading = "NCCL Environment")]
    pub socket_ifname: Option<String>,

    /// Set NCCL_IB_DISABLE=1 to force the socket transport
    #[clap(long, default_value_t = false, help_heading = "NCCL Environment")]
    pub ib_disable: bool,
}

impl CommonArgs {
    /// Command-line values as the highest-priority configuration layer.
    pub fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            master_ip: self.master_ip,
            worker_ip: self.worker_ip,
            port: self.port,
            port_range: self.port_range,
            operation: self.operation,
            min_size: self.min_size.clone(),
            max_size: self.max_size.clone(),
            step_factor: self.step_factor,
            iterations: self.iterations,
            warmup_iterations: self.warmup_iterations,
            results_dir: self.results_dir.clone(),
            script: self.script.clone(),
            launcher: self
                .launcher
                .as_ref()
                .map(|l| l.split_whitespace().map(str::to_string).collect()),
            rdzv_timeout_secs: self.rdzv_timeout,
            cooldown: self.cooldown.clone(),
            timeout: self.timeout.clone(),
            nccl: NcclEnv {
                debug: self.nccl_debug.clone(),
                debug_subsys: self.nccl_debug_subsys.clone(),
                socket_ifname: self.socket_ifname.clone(),
                ib_disable: self.ib_disable.then_some(true),
                ..NcclEnv::default()
            },
            ..ConfigOverrides::default()
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Peer address; defaults to the other node from --config
    #[clap(long)]
    pub peer: Option<IpAddr>,

    /// TCP port to test (the rendezvous port)
    #[clap(short = 'p', long, default_value_t = crate::defaults::MASTER_PORT)]
    pub port: u16,

    /// IPoIB address of the peer for the fabric reachability check
    #[clap(long)]
    pub fabric_peer: Option<IpAddr>,

    /// ICMP attempts before the reachability check fails
    #[clap(long, default_value_t = crate::defaults::PROBE_RETRIES)]
    pub retries: u32,

    /// Per-attempt ICMP timeout
    #[clap(long, value_parser = parse_duration, default_value = "2s")]
    pub ping_timeout: Duration,

    /// TCP connect timeout
    #[clap(long, value_parser = parse_duration, default_value = "3s")]
    pub connect_timeout: Duration,

    /// Configuration file providing master_ip / worker_ip
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Persist the report under the results directory
    #[clap(long, default_value_t = false)]
    pub save: bool,

    /// Directory for saved reports
    #[clap(long, default_value = crate::defaults::RESULTS_DIR)]
    pub results_dir: PathBuf,
}

/// Parse duration from string (e.g., "10s", "5m", "1h", "500ms")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be non-negative: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|_| format!("Duration is too large: {}", s))
}
