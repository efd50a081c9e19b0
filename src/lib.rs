//! # Collective Bench Library
//!
//! Sweep driver and network diagnostics for NCCL collective benchmarks on one node
//! or across a two-node GPU cluster.
//!
//! The library does not move any data itself. It prepares one launch per GPU count,
//! starts the external benchmark under the distributed launcher (`torchrun` by
//! default), captures its output and collects the per-size results it writes.
//!
//! ## Architecture Overview
//!
//! - `size`: byte-size tokens (`2K`, `8G`) and size progressions
//! - `node`: master/worker role resolution from local interface addresses
//! - `port`: rendezvous port selection
//! - `config`: layered run configuration (defaults, config file, CLI)
//! - `launch`: process launch, watchdog and cancellation
//! - `sweep`: sweep planning and sequential execution
//! - `probe`: pre-launch connectivity diagnostics
//! - `preflight`: fail-fast checks before any launch
//! - `results`: per-run files, CSV records and the sweep summary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use collective_bench::{
//!     config::{ConfigOverrides, RunConfiguration, Settings},
//!     launch::DryRunLauncher,
//!     sweep::{SweepDriver, SweepPlan, SweepSelector},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let template = RunConfiguration::build(&Settings::default(), &ConfigOverrides::default())?;
//!     let plan = SweepPlan::build(&template, SweepSelector::All)?;
//!
//!     let mut driver = SweepDriver::new(DryRunLauncher::default(), template.launch.cooldown);
//!     let results = driver.run(&plan).await?;
//!     println!("{} configurations planned", results.len());
//!     Ok(())
//! }
//! ```

/// Command-line interface
///
/// Subcommands for single-node and multi-node sweeps and for the connectivity
/// probe, plus the human-readable duration parser shared with the config file.
pub mod cli;

/// Layered run configuration
pub mod config;

pub mod error;

/// Process launch under the distributed launcher
///
/// Each configuration runs as its own process group with its output teed into a
/// console transcript. A watchdog and Ctrl-C both terminate the whole group.
pub mod launch;

pub mod logging;

pub mod node;

pub mod port;

pub mod preflight;

/// Connectivity diagnostics between the two nodes
pub mod probe;

/// Per-run output files and the sweep summary
pub mod results;

pub mod size;

/// Sweep planning and sequential execution
pub mod sweep;

/// External OS tools used by the diagnostics
pub mod tools;

pub mod utils;

pub use cli::Args;
pub use config::{Operation, RunConfiguration};
pub use error::{BenchError, Result};
pub use launch::{Launcher, ProcessResult};
pub use node::NodeRole;
pub use results::{ReportWriter, SweepSummary};
pub use size::{SizeRange, SizeSpec};
pub use sweep::{SweepDriver, SweepPlan, SweepSelector};

/// The current version of the sweep driver
///
/// Recorded in every sweep summary for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Every value can be overridden from the configuration file or the command line.
pub mod defaults {
    use std::time::Duration;

    /// Default rendezvous port, the same one `torchrun` uses
    pub const MASTER_PORT: u16 = 29500;

    /// Number of ports scanned upwards from the rendezvous port
    pub const PORT_RANGE: u16 = 10;

    /// Smallest message size of a sweep
    pub const MIN_SIZE: &str = "2K";

    /// Largest message size of a sweep
    pub const MAX_SIZE: &str = "8G";

    /// Multiplier between consecutive message sizes
    pub const STEP_FACTOR: u32 = 2;

    /// Timed iterations per message size
    pub const ITERATIONS: u32 = 20;

    /// Untimed iterations per message size
    ///
    /// The first collectives pay for communicator setup and buffer registration,
    /// so they are excluded from the measurement.
    pub const WARMUP_ITERATIONS: u32 = 5;

    /// Directory receiving logs, CSV files and summaries
    pub const RESULTS_DIR: &str = "results";

    /// Benchmark script started on every rank
    pub const TEST_SCRIPT: &str = "pytorch_comm_test.py";

    /// Distributed launcher executable
    pub const LAUNCHER: &str = "torchrun";

    /// Seconds a node waits for its peer at the rendezvous
    pub const RDZV_TIMEOUT_SECS: u64 = 300;

    /// Pause between consecutive configurations
    ///
    /// Gives the driver time to release GPU memory and the rendezvous socket to
    /// leave `TIME_WAIT` before the next launch.
    pub const COOLDOWN: Duration = Duration::from_secs(5);

    /// Rendezvous address of single-node runs
    pub const LOCAL_MASTER_ADDRESS: &str = "127.0.0.1";

    /// ICMP attempts before a peer counts as unreachable
    pub const PROBE_RETRIES: u32 = 3;
}
