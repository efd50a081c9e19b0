//! # Collective Bench - Main Entry Point
//!
//! Drives NCCL collective benchmark sweeps on one node or across two nodes, and
//! diagnoses connectivity between the nodes.
//!
//! ## Sweep Flow
//!
//! 1. **Initialize logging**: console and optional file output via tracing
//! 2. **Build configuration**: built-in defaults, then `--config`, then CLI flags
//! 3. **Resolve the node role** (multi-node only) from local interface addresses
//! 4. **Preflight**: script, launcher, GPU count and peer reachability
//! 5. **Allocate the rendezvous port** on the master
//! 6. **Run the sweep** one configuration at a time with a cooldown in between
//! 7. **Summarize**: console table plus `sweep_<timestamp>.json`
//!
//! ## Exit Codes
//!
//! `0` when every configuration succeeded, `1` for usage errors and fatal
//! preconditions, otherwise the exit code of the first failed launch.

use anyhow::{Context, Result};
use clap::Parser;
use collective_bench::{
    cli::{Args, Command, CommonArgs, ProbeArgs},
    config::{run_timestamp, ConfigOverrides, RunConfiguration, Settings},
    error::BenchError,
    launch::{DryRunLauncher, Launcher, ProcessResult, TorchrunLauncher},
    logging, node, port, preflight,
    probe::{ConnectivityProbe, ProbeSettings},
    results::{ReportWriter, SweepSummary},
    sweep::{self, SweepDriver, SweepPlan, SweepSelector},
    tools::SystemTools,
    utils, NodeRole, VERSION,
};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Conventional exit status after SIGINT.
const CANCELLED_EXIT_CODE: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let _log_guard = match logging::init_logging(args.verbose, args.quiet, args.log_file.as_deref())
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    info!("Starting Collective Bench v{}", VERSION);
    debug!("Arguments: {:?}", args);

    let outcome = match args.command {
        Command::SingleNode(cmd) => {
            let selector = cmd.selector();
            run_sweep(&cmd.common, selector, None, false).await
        }
        Command::MultiNode(cmd) => {
            let selector = cmd.selector();
            run_sweep(&cmd.common, selector, cmd.role_override(), true).await
        }
        Command::Probe(cmd) => run_probe(&cmd).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => report_error(&e),
    }
}

/// Print a fatal error with its remediation hint and pick the exit code.
fn report_error(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<BenchError>() {
        Some(BenchError::Cancelled { label }) => {
            warn!("Sweep cancelled during {}", label);
            ExitCode::from(CANCELLED_EXIT_CODE)
        }
        Some(bench_error) => {
            error!("{:#}", e);
            if let Some(hint) = bench_error.remediation() {
                error!("Hint: {}", hint);
            }
            ExitCode::from(1)
        }
        None => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Configuration file (if any) overlaid by the command line.
fn load_overrides(common: &CommonArgs) -> Result<ConfigOverrides> {
    let file = match &common.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ConfigOverrides::from_file(path)?
        }
        None => ConfigOverrides::default(),
    };
    Ok(file.merged(common.to_overrides()))
}

/// Role of this host from its interface addresses.
fn detect_role(overrides: &ConfigOverrides) -> Result<NodeRole> {
    let Some(master_ip) = overrides.master_ip else {
        return Ok(NodeRole::Unknown);
    };
    let local = node::local_addresses()?;
    debug!("Local addresses: {:?}", local);
    let role = match overrides.worker_ip {
        Some(worker_ip) => node::resolve(&local, master_ip, worker_ip),
        None if local.contains(&master_ip) => NodeRole::Master,
        None => NodeRole::Unknown,
    };
    Ok(role)
}

async fn run_sweep(
    common: &CommonArgs,
    selector: SweepSelector,
    role_override: Option<NodeRole>,
    multi_node: bool,
) -> Result<ExitCode> {
    let mut overrides = load_overrides(common)?;
    let gpu_counts = selector.gpu_counts(multi_node);
    overrides.gpus_per_node = gpu_counts.first().copied();
    if multi_node {
        overrides.node_count = Some(2);
        let role = match role_override {
            Some(role) => role,
            None => detect_role(&overrides)?,
        };
        info!("Node role: {}", role);
        overrides.role = Some(role);
    }

    let template = RunConfiguration::build(&Settings::default(), &overrides)?;
    let plan = SweepPlan::build(&template, selector)?;
    let dry_run = common.dry_run;

    info!(
        "Planned {} configuration(s): {}",
        plan.len(),
        plan.configurations
            .iter()
            .map(|c| c.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "Operation {} over sizes {}",
        template.operation,
        utils::describe_sizes(&template.size_range.sizes())
    );

    preflight::check(&SystemTools, &template, selector.max_gpus(multi_node), dry_run).await?;

    let plan = if template.role == NodeRole::Master && !dry_run {
        let chosen = port::find_available(
            template.master_port,
            template.port_range,
            port::port_in_use,
        )?;
        if chosen != template.master_port {
            warn!(
                "Port {} is in use, rendezvous moved to port {}",
                template.master_port, chosen
            );
        }
        plan.with_port(chosen)
    } else {
        plan
    };

    let cooldown = template.launch.cooldown;
    let cancel = sweep::cancel_on_ctrl_c();
    let results = if dry_run {
        execute(DryRunLauncher::default(), cooldown, cancel, &plan).await?
    } else {
        let writer = ReportWriter::new(&template.launch.results_dir)?;
        let launcher = TorchrunLauncher::new(writer).with_cancellation(cancel.clone());
        execute(launcher, cooldown, cancel, &plan).await?
    };

    let summary = SweepSummary::new(&template, results, dry_run);
    utils::print_summary(&summary);
    if !dry_run {
        let writer = ReportWriter::new(&template.launch.results_dir)?;
        writer
            .write_summary(&summary)
            .context("Failed to write sweep summary")?;
    }

    Ok(match summary.first_failure_code() {
        None => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    })
}

async fn execute<L: Launcher>(
    launcher: L,
    cooldown: std::time::Duration,
    cancel: CancellationToken,
    plan: &SweepPlan,
) -> Result<Vec<ProcessResult>> {
    let mut driver = SweepDriver::new(launcher, cooldown).with_cancellation(cancel);
    Ok(driver.run(plan).await?)
}

async fn run_probe(cmd: &ProbeArgs) -> Result<ExitCode> {
    let peer = match cmd.peer {
        Some(peer) => peer,
        None => {
            let path = cmd.config.as_ref().ok_or_else(|| {
                BenchError::invalid("peer", "pass --peer or a --config naming both nodes")
            })?;
            let overrides = ConfigOverrides::from_file(path)?;
            let role = detect_role(&overrides)?;
            let peer = match role {
                NodeRole::Master => overrides.worker_ip,
                NodeRole::Worker => overrides.master_ip,
                NodeRole::Unknown => None,
            };
            peer.ok_or_else(|| {
                BenchError::invalid("peer", "could not determine the peer from the configuration")
            })?
        }
    };

    let settings = ProbeSettings {
        fabric_peer: cmd.fabric_peer,
        retries: cmd.retries,
        ping_timeout: cmd.ping_timeout,
        connect_timeout: cmd.connect_timeout,
        ..ProbeSettings::new(peer, cmd.port)
    };
    let report = ConnectivityProbe::new(SystemTools, settings).run().await;
    report.print();

    if cmd.save {
        let writer = ReportWriter::new(&cmd.results_dir)?;
        writer.write_probe_report(&report, &run_timestamp())?;
    }

    if report.all_passed() {
        info!("All connectivity checks passed");
        Ok(ExitCode::SUCCESS)
    } else {
        for failure in report.failures() {
            let failure = BenchError::ProbeFailure {
                check: failure.name.clone(),
                detail: failure.detail.clone().unwrap_or_default(),
            };
            warn!("{}", failure);
        }
        Ok(ExitCode::from(1))
    }
}
