//! # Results Management
//!
//! Per-run output files, CSV records and the sweep summary.
//!
//! Each configuration owns three files under the results directory: the
//! benchmark log, the per-size CSV and the console transcript. The external
//! benchmark writes the log and CSV itself; [`RunReport`] appends the
//! orchestration trailer and reads the rows back as [`PerformanceRecord`]s.
//!
//! ## Bandwidth
//!
//! AllReduce rows are normalized with the `2(n-1)/n` bus factor. Send/Recv is
//! point to point, so its bus bandwidth equals its algorithm bandwidth.

use crate::{
    config::{Operation, OutputPaths, RunConfiguration},
    error::{BenchError, Result},
    launch::ProcessResult,
    probe::ConnectivityReport,
    size::SizeSpec,
};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Column order of every per-run CSV file
pub const CSV_COLUMNS: [&str; 10] = [
    "size_bytes",
    "size_label",
    "element_count",
    "dtype",
    "reduction_op",
    "root_rank",
    "time_microseconds",
    "algorithm_bandwidth_gbps",
    "bus_bandwidth_gbps",
    "error_count",
];

/// Effective bandwidth seen by the application, in GB/s
pub fn algorithm_bandwidth_gbps(size_bytes: u64, time_microseconds: f64) -> f64 {
    (size_bytes as f64 * 8.0) / (time_microseconds * 1000.0)
}

/// Algorithm bandwidth normalized by the AllReduce data-movement factor `2(n-1)/n`
pub fn bus_bandwidth_gbps(algorithm_bandwidth_gbps: f64, world_size: u32) -> f64 {
    let n = f64::from(world_size);
    algorithm_bandwidth_gbps * 2.0 * (n - 1.0) / n
}

/// Bandwidth of one Send/Recv round trip in GiB/s, counting both directions.
pub fn point_to_point_bandwidth_gbps(size_bytes: u64, time_microseconds: f64) -> f64 {
    (size_bytes as f64 * 2.0) / (time_microseconds * 1e-6) / f64::from(1u32 << 30)
}

/// One row of a results CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub size_bytes: u64,
    pub size_label: String,
    pub element_count: u64,
    pub dtype: String,
    pub reduction_op: String,
    pub root_rank: String,
    pub time_microseconds: f64,
    pub algorithm_bandwidth_gbps: f64,
    pub bus_bandwidth_gbps: f64,
    pub error_count: u64,
}

impl PerformanceRecord {
    /// Parse a data row written by the external benchmark.
    ///
    /// Bandwidth is recomputed from size and time with the formulas of
    /// `operation`, so every record follows them regardless of what the producer
    /// printed. Header and malformed lines yield `None`.
    pub fn from_csv_row(line: &str, operation: Operation, world_size: u32) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() != CSV_COLUMNS.len() {
            return None;
        }
        let size_bytes: u64 = fields[0].parse().ok()?;
        let time_microseconds: f64 = fields[6].parse().ok()?;
        if time_microseconds <= 0.0 {
            return None;
        }

        let (algbw, busbw) = match operation {
            Operation::AllReduce => {
                let algbw = algorithm_bandwidth_gbps(size_bytes, time_microseconds);
                (algbw, bus_bandwidth_gbps(algbw, world_size))
            }
            Operation::SendRecv => {
                let algbw = point_to_point_bandwidth_gbps(size_bytes, time_microseconds);
                (algbw, algbw)
            }
        };
        if let Ok(reported) = fields[8].parse::<f64>() {
            if busbw > 0.0 && ((reported - busbw) / busbw).abs() > 0.01 {
                debug!(
                    "Reported bus bandwidth {:.3} GB/s differs from recomputed {:.3} GB/s for {} bytes",
                    reported, busbw, size_bytes
                );
            }
        }

        Some(Self {
            size_bytes,
            size_label: if fields[1].is_empty() {
                SizeSpec::format(size_bytes)
            } else {
                fields[1].to_string()
            },
            element_count: fields[2].parse().unwrap_or(size_bytes / 4),
            dtype: fields[3].to_string(),
            reduction_op: fields[4].to_string(),
            root_rank: fields[5].to_string(),
            time_microseconds,
            algorithm_bandwidth_gbps: algbw,
            bus_bandwidth_gbps: busbw,
            error_count: fields[9].parse().unwrap_or(0),
        })
    }
}

/// Creates the per-run files under the results directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    results_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(results_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(results_dir).map_err(|e| BenchError::io(results_dir, e))?;
        Ok(Self {
            results_dir: results_dir.to_path_buf(),
        })
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Open the log, CSV and console transcript of one configuration.
    ///
    /// The transcript is created fresh and must not exist yet; the log and CSV are
    /// opened for append because the external benchmark writes into them too.
    pub fn open_run(&self, config: &RunConfiguration) -> Result<RunReport> {
        let paths = config.output_paths.clone();
        if let Some(parent) = paths.console.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BenchError::io(parent, e))?;
        }

        let console = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.console)
            .map_err(|e| BenchError::io(&paths.console, e))?;
        let log = open_append(&paths.log)?;
        let csv = open_append(&paths.csv)?;

        debug!("Opened run files for {}: {:?}", config.label, paths);
        Ok(RunReport {
            label: config.label.clone(),
            operation: config.operation,
            world_size: config.total_gpus(),
            paths,
            log: BufWriter::new(log),
            csv,
            console: BufWriter::new(console),
        })
    }

    /// Write the sweep summary as `sweep_<timestamp>.json`.
    pub fn write_summary(&self, summary: &SweepSummary) -> anyhow::Result<PathBuf> {
        let path = self
            .results_dir
            .join(format!("sweep_{}.json", summary.metadata.timestamp));
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json)?;
        info!("Sweep summary written to: {:?}", path);
        Ok(path)
    }

    /// Persist a connectivity report as `probe_<timestamp>.txt`.
    pub fn write_probe_report(
        &self,
        report: &ConnectivityReport,
        timestamp: &str,
    ) -> anyhow::Result<PathBuf> {
        let path = self.results_dir.join(format!("probe_{}.txt", timestamp));
        let mut file = BufWriter::new(File::create(&path)?);
        for result in &report.results {
            writeln!(
                file,
                "{:<20} {:<6} {}",
                result.name,
                result.status_label(),
                result.detail.as_deref().unwrap_or("")
            )?;
        }
        file.flush()?;
        info!("Probe report written to: {:?}", path);
        Ok(path)
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BenchError::io(path, e))
}

/// Open files of one run. Flushed on `finish` and again on drop, so every exit
/// path leaves complete files behind.
pub struct RunReport {
    label: String,
    operation: Operation,
    world_size: u32,
    paths: OutputPaths,
    log: BufWriter<File>,
    csv: File,
    console: BufWriter<File>,
}

impl RunReport {
    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }

    /// Append one line of child output to the console transcript.
    pub fn console_line(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.console, "{}", line)
    }

    /// Append the orchestration trailer, make sure the CSV has a header, and read
    /// back the records the external benchmark produced.
    pub fn finish(mut self, trailer: &[String]) -> Result<Vec<PerformanceRecord>> {
        self.console
            .flush()
            .map_err(|e| BenchError::io(&self.paths.console, e))?;

        for line in trailer {
            writeln!(self.log, "# {}", line).map_err(|e| BenchError::io(&self.paths.log, e))?;
        }
        self.log
            .flush()
            .map_err(|e| BenchError::io(&self.paths.log, e))?;

        let csv_len = self
            .csv
            .metadata()
            .map_err(|e| BenchError::io(&self.paths.csv, e))?
            .len();
        if csv_len == 0 {
            writeln!(self.csv, "{}", CSV_COLUMNS.join(","))
                .map_err(|e| BenchError::io(&self.paths.csv, e))?;
            warn!("No CSV rows produced for {}", self.label);
        }
        self.csv
            .flush()
            .map_err(|e| BenchError::io(&self.paths.csv, e))?;

        let raw = std::fs::read_to_string(&self.paths.csv)
            .map_err(|e| BenchError::io(&self.paths.csv, e))?;
        let records: Vec<PerformanceRecord> = raw
            .lines()
            .filter_map(|line| PerformanceRecord::from_csv_row(line, self.operation, self.world_size))
            .collect();
        debug!("{} CSV records for {}", records.len(), self.label);
        Ok(records)
    }
}

impl Drop for RunReport {
    fn drop(&mut self) {
        let _ = self.console.flush();
        let _ = self.log.flush();
        let _ = self.csv.flush();
    }
}

/// Complete record of one sweep, written as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub metadata: SweepMetadata,
    pub results: Vec<ProcessResult>,
    pub failed: Vec<String>,
}

/// Sweep metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepMetadata {
    pub version: String,
    pub timestamp: String,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub hostname: String,
    pub cpu_cores: usize,
    pub test_mode: String,
    pub role: String,
    pub operation: String,
    pub dry_run: bool,
}

impl SweepSummary {
    pub fn new(template: &RunConfiguration, results: Vec<ProcessResult>, dry_run: bool) -> Self {
        let failed = results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.label.clone())
            .collect();
        Self {
            metadata: SweepMetadata {
                version: crate::VERSION.to_string(),
                timestamp: template.timestamp.clone(),
                finished_at: chrono::Utc::now(),
                hostname: hostname(),
                cpu_cores: num_cpus::get(),
                test_mode: template.test_mode().to_string(),
                role: template.role.to_string(),
                operation: template.operation.to_string(),
                dry_run,
            },
            results,
            failed,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Exit code of the first failed run, or `None` when everything passed.
    pub fn first_failure_code(&self) -> Option<i32> {
        self.results
            .iter()
            .find(|r| !r.succeeded())
            .map(|r| match r.exit_code {
                Some(code) if code != 0 => code,
                _ => 1,
            })
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}
