//! # Process Launch
//!
//! Starts one configuration of the external benchmark under the distributed
//! launcher and waits for it.
//!
//! The child runs in its own process group so that the launcher and every rank it
//! forks can be terminated together. Output from both pipes is echoed to the
//! console and appended to the run's console transcript while the child runs.
//!
//! ## Termination
//!
//! - **Normal exit**: the exit status becomes the [`ProcessResult`] exit code.
//! - **Watchdog**: when `timeout` elapses the group gets `SIGTERM`, then `SIGKILL`
//!   after a grace period, and the run is recorded with exit code 124.
//! - **Ctrl-C**: the sweep's cancellation token fires, the group is terminated the
//!   same way and [`BenchError::Cancelled`] is returned so the sweep stops.

use crate::{
    config::RunConfiguration,
    error::{BenchError, Result},
    node::NodeRole,
    results::{PerformanceRecord, ReportWriter, RunReport},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit code recorded when the watchdog kills a run, matching coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait after `SIGTERM` before sending `SIGKILL`.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Outcome of launching one configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub label: String,
    pub gpus_per_node: u32,
    pub world_size: u32,
    /// `None` when the process never started or was killed by a signal
    pub exit_code: Option<i32>,
    pub output_captured: bool,
    pub timed_out: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub records: usize,
    pub peak_bus_bandwidth_gbps: Option<f64>,
}

impl ProcessResult {
    pub fn completed(
        config: &RunConfiguration,
        exit_code: Option<i32>,
        output_captured: bool,
        timed_out: bool,
        duration: Duration,
    ) -> Self {
        Self {
            label: config.label.clone(),
            gpus_per_node: config.gpus_per_node,
            world_size: config.total_gpus(),
            exit_code,
            output_captured,
            timed_out,
            duration,
            error: None,
            records: 0,
            peak_bus_bandwidth_gbps: None,
        }
    }

    /// A run that could not be carried out at all.
    pub fn failed(config: &RunConfiguration, err: &BenchError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::completed(config, None, false, false, Duration::ZERO)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && self.error.is_none()
    }

    pub fn with_records(mut self, records: &[PerformanceRecord]) -> Self {
        self.records = records.len();
        self.peak_bus_bandwidth_gbps = records
            .iter()
            .map(|r| r.bus_bandwidth_gbps)
            .fold(None, |peak, bw| match peak {
                Some(p) if p >= bw => Some(p),
                _ => Some(bw),
            });
        self
    }
}

/// Fully resolved command line and environment of one launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    /// Command this host runs for `config`.
    pub fn for_config(config: &RunConfiguration) -> Self {
        Self::with_node_rank(config, config.node_rank)
    }

    /// Command the other node must run to join the same rendezvous.
    pub fn for_peer(config: &RunConfiguration) -> Option<Self> {
        if !config.is_multi_node() {
            return None;
        }
        let rank = config.role.peer().node_rank()?;
        Some(Self::with_node_rank(config, rank))
    }

    fn with_node_rank(config: &RunConfiguration, node_rank: u32) -> Self {
        let launch = &config.launch;
        let mut args: Vec<String> = launch.launcher.iter().skip(1).cloned().collect();
        push_flag(&mut args, "--nproc_per_node", config.gpus_per_node.to_string());
        push_flag(&mut args, "--nnodes", config.node_count.to_string());
        push_flag(&mut args, "--node_rank", node_rank.to_string());
        push_flag(&mut args, "--master_addr", config.master_address.clone());
        push_flag(&mut args, "--master_port", config.master_port.to_string());
        push_flag(&mut args, "--rdzv_timeout", launch.rdzv_timeout_secs.to_string());

        args.push(launch.script.display().to_string());
        let script_flags = [
            ("--operation", config.operation.to_string()),
            ("--min_size", config.size_range.min.to_string()),
            ("--max_size", config.size_range.max.to_string()),
            ("--step_factor", config.size_range.step_factor.to_string()),
            ("--iterations", config.iterations.to_string()),
            ("--warmup_iters", config.warmup_iterations.to_string()),
            ("--log_file", config.output_paths.log.display().to_string()),
            ("--csv_file", config.output_paths.csv.display().to_string()),
            ("--test_mode", config.test_mode().to_string()),
        ];
        for (flag, value) in script_flags {
            push_flag(&mut args, flag, value);
        }

        let mut env = vec![("CUDA_VISIBLE_DEVICES".to_string(), config.visible_devices())];
        env.extend(launch.nccl.to_env_pairs());

        Self {
            program: launch.launcher[0].clone(),
            args,
            env,
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{}={} ", key, shell_quote(value))?;
        }
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./,:=@%+".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Starts one configuration and reports how it ended.
///
/// Implementations return `Err` only for failures that prevented a meaningful
/// run; a non-zero exit is a successful launch with a failed result.
#[async_trait]
pub trait Launcher: Send {
    async fn launch(&mut self, config: &RunConfiguration) -> Result<ProcessResult>;
}

/// Print the command the other node has to run, if there is one.
fn announce_peer(config: &RunConfiguration) {
    if let Some(peer) = LaunchCommand::for_peer(config) {
        let peer_role = config.role.peer();
        println!(
            "On the {} node run (node_rank {}):",
            peer_role,
            peer_role.node_rank().unwrap_or_default()
        );
        println!("  {}", peer);
        if config.role == NodeRole::Worker {
            println!(
                "  Waiting up to {}s for the master at {}:{}",
                config.launch.rdzv_timeout_secs, config.master_address, config.master_port
            );
        }
    }
}

/// Prints every launch command instead of executing it.
#[derive(Debug, Default)]
pub struct DryRunLauncher {
    pub commands: Vec<LaunchCommand>,
}

#[async_trait]
impl Launcher for DryRunLauncher {
    async fn launch(&mut self, config: &RunConfiguration) -> Result<ProcessResult> {
        let command = LaunchCommand::for_config(config);
        println!("[dry-run] {}", config.label);
        println!("  {}", command);
        announce_peer(config);
        self.commands.push(command);
        Ok(ProcessResult::completed(
            config,
            Some(0),
            false,
            false,
            Duration::ZERO,
        ))
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Interrupted,
}

/// Runs the external benchmark as a child process group.
pub struct TorchrunLauncher {
    writer: ReportWriter,
    grace_period: Duration,
    echo: bool,
    cancel: CancellationToken,
}

impl TorchrunLauncher {
    pub fn new(writer: ReportWriter) -> Self {
        Self {
            writer,
            grace_period: DEFAULT_GRACE_PERIOD,
            echo: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort launches when `cancel` fires. Share the sweep's token here.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Stop echoing child output to stdout; the transcript is still written.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn record_line(&self, report: &mut RunReport, line: &str) {
        if self.echo {
            println!("{}", line);
        }
        if let Err(e) = report.console_line(line) {
            warn!("Failed to write console transcript: {}", e);
        }
    }
}

#[async_trait]
impl Launcher for TorchrunLauncher {
    async fn launch(&mut self, config: &RunConfiguration) -> Result<ProcessResult> {
        if self.cancel.is_cancelled() {
            return Err(BenchError::Cancelled {
                label: config.label.clone(),
            });
        }
        let command = LaunchCommand::for_config(config);
        let mut report = self.writer.open_run(config)?;

        info!(
            "Launching {} ({} ranks, port {})",
            config.label,
            config.total_gpus(),
            config.master_port
        );
        debug!("Command: {}", command);
        announce_peer(config);

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| BenchError::LaunchFailure {
            label: config.label.clone(),
            reason: format!("failed to start {}: {}", command.program, e),
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let watchdog = config.launch.timeout;
        let deadline = async move {
            match watchdog {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let cancel = self.cancel.clone();

        let mut output_captured = false;
        let mut pipes_open = true;
        let outcome = loop {
            tokio::select! {
                line = rx.recv(), if pipes_open => match line {
                    Some(line) => {
                        output_captured = true;
                        self.record_line(&mut report, &line);
                    }
                    None => pipes_open = false,
                },
                status = child.wait() => break Outcome::Exited(status),
                _ = &mut deadline => break Outcome::TimedOut,
                _ = cancel.cancelled() => break Outcome::Interrupted,
            }
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            terminate(&mut child, self.grace_period).await;
        }

        // Ranks may still be flushing after the launcher exits.
        let drain = async {
            while let Some(line) = rx.recv().await {
                output_captured = true;
                self.record_line(&mut report, &line);
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
            debug!("Output pipes of {} still open after exit", config.label);
        }

        let duration = start.elapsed();
        let (exit_code, timed_out) = match outcome {
            Outcome::Exited(Ok(status)) => (status.code(), false),
            Outcome::Exited(Err(e)) => {
                error!("Failed to wait for {}: {}", config.label, e);
                (None, false)
            }
            Outcome::TimedOut => {
                warn!(
                    "{} exceeded the {:?} timeout, process group killed",
                    config.label, watchdog
                );
                (Some(TIMEOUT_EXIT_CODE), true)
            }
            Outcome::Interrupted => {
                warn!("Interrupted during {}, process group terminated", config.label);
                let trailer = vec![
                    format!("label={}", config.label),
                    "status=cancelled".to_string(),
                    format!("duration_secs={:.3}", duration.as_secs_f64()),
                ];
                if let Err(e) = report.finish(&trailer) {
                    warn!("Failed to finalize report for {}: {}", config.label, e);
                }
                return Err(BenchError::Cancelled {
                    label: config.label.clone(),
                });
            }
        };

        let trailer = vec![
            format!("label={}", config.label),
            format!("command={}", command),
            format!(
                "exit_code={}",
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            ),
            format!("timed_out={}", timed_out),
            format!("duration_secs={:.3}", duration.as_secs_f64()),
        ];
        let records = report.finish(&trailer)?;

        let result = ProcessResult::completed(config, exit_code, output_captured, timed_out, duration)
            .with_records(&records);
        if result.succeeded() {
            info!(
                "{} completed in {:.1}s ({} sizes)",
                config.label,
                duration.as_secs_f64(),
                result.records
            );
        } else {
            error!("{} failed with exit code {:?}", config.label, exit_code);
        }
        Ok(result)
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// SIGTERM the whole process group, then SIGKILL whatever is left after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("SIGTERM to process group {} failed: {}", pid, e);
        }
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        // Ranks can outlive the launcher; make sure the group is gone.
        let _ = killpg(group, Signal::SIGKILL);
        if exited {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to kill child: {}", e);
    }
}
