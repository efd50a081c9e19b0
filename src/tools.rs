//! External tool capability layer.
//!
//! Diagnostic and precondition checks declare the OS tool they need (`ping`,
//! `ss`, `ibstat`, `nvidia-smi`, ...) and go through [`ToolRunner`]. A missing tool
//! is reported as unavailable instead of failing, and tests can substitute a
//! scripted runner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ToolOutput {
    /// First non-empty line of stdout, falling back to stderr.
    pub fn summary(&self) -> String {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .to_string()
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Whether `tool` can be invoked on this host.
    fn is_available(&self, tool: &str) -> bool;

    /// Run `tool` with `args`, killing it after `timeout`.
    async fn run(&self, tool: &str, args: &[&str], timeout: Duration) -> Result<ToolOutput>;
}

#[async_trait]
impl<T: ToolRunner + ?Sized> ToolRunner for &T {
    fn is_available(&self, tool: &str) -> bool {
        (**self).is_available(tool)
    }

    async fn run(&self, tool: &str, args: &[&str], timeout: Duration) -> Result<ToolOutput> {
        (**self).run(tool, args, timeout).await
    }
}

/// Runs tools found on `PATH`.
#[derive(Debug, Default, Clone)]
pub struct SystemTools;

#[async_trait]
impl ToolRunner for SystemTools {
    fn is_available(&self, tool: &str) -> bool {
        find_in_path(tool).is_some()
    }

    async fn run(&self, tool: &str, args: &[&str], timeout: Duration) -> Result<ToolOutput> {
        debug!("Running {} {}", tool, args.join(" "));
        let child = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", tool))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.with_context(|| format!("Failed to wait for {}", tool))?;
                Ok(ToolOutput {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            }
            // Dropping the future drops the child, which kills it.
            Err(_) => Ok(ToolOutput {
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{} timed out after {:?}", tool, timeout),
                timed_out: true,
            }),
        }
    }
}

/// Locate an executable the way a shell would.
///
/// Names containing a path separator are checked directly.
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
