//! Sweep planning and execution.
//!
//! A sweep is an ordered list of configurations that differ only in the GPU count.
//! The driver runs them strictly one after another: a launch holds every GPU of the
//! node, so nothing here is concurrent.
//!
//! Ctrl-C is observed through a single [`CancellationToken`] per sweep. The token
//! latches, so an interrupt that lands between phases (output drain, report
//! finalization, the gap before a cooldown) still stops the next launch.

use crate::{
    config::RunConfiguration,
    error::{BenchError, Result},
    launch::{Launcher, ProcessResult},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Token cancelled by the first SIGINT for the rest of the process lifetime.
///
/// Must be called from inside the runtime. Once the listener is registered Ctrl-C
/// no longer terminates the process, so every consumer has to watch the token.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping the sweep");
                trigger.cancel();
            }
            Err(e) => debug!("Ctrl-C listener unavailable: {}", e),
        }
    });
    token
}

/// Which GPU counts a sweep covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSelector {
    Only(u32),
    All,
}

impl SweepSelector {
    /// GPU-per-node counts, in execution order.
    ///
    /// A full single-node sweep covers 2, 4 and 8 GPUs; a full multi-node sweep
    /// covers 1 through 8 GPUs on each node.
    pub fn gpu_counts(&self, multi_node: bool) -> Vec<u32> {
        match (self, multi_node) {
            (SweepSelector::Only(n), _) => vec![*n],
            (SweepSelector::All, false) => vec![2, 4, 8],
            (SweepSelector::All, true) => (1..=8).collect(),
        }
    }

    /// Largest GPU count any configuration needs.
    pub fn max_gpus(&self, multi_node: bool) -> u32 {
        self.gpu_counts(multi_node).into_iter().max().unwrap_or(0)
    }
}

/// Ordered configurations of one sweep
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub configurations: Vec<RunConfiguration>,
}

impl SweepPlan {
    /// Expand `template` into one configuration per selected GPU count.
    ///
    /// Every configuration is validated up front so an invalid count fails the
    /// whole plan before anything is launched.
    pub fn build(template: &RunConfiguration, selector: SweepSelector) -> Result<Self> {
        let configurations = selector
            .gpu_counts(template.is_multi_node())
            .into_iter()
            .map(|gpus| template.with_gpus(gpus))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { configurations })
    }

    /// Same plan with every configuration rendezvousing on `port`.
    pub fn with_port(self, port: u16) -> Self {
        Self {
            configurations: self
                .configurations
                .into_iter()
                .map(|c| c.with_port(port))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }
}

pub struct SweepDriver<L: Launcher> {
    launcher: L,
    cooldown: Duration,
    cancel: CancellationToken,
}

impl<L: Launcher> SweepDriver<L> {
    pub fn new(launcher: L, cooldown: Duration) -> Self {
        Self {
            launcher,
            cooldown,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the sweep when `cancel` fires; pass the launcher the same token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run every configuration of `plan` in order.
    ///
    /// Failures are recorded and the sweep moves on; there are no retries.
    /// The cooldown separates consecutive launches and is not applied after the
    /// last one. Cancellation stops the sweep immediately and is returned as an
    /// error.
    pub async fn run(&mut self, plan: &SweepPlan) -> Result<Vec<ProcessResult>> {
        let total = plan.len();
        let mut results = Vec::with_capacity(total);

        for (index, config) in plan.configurations.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Sweep cancelled after {} of {} configurations", index, total);
                return Err(BenchError::Cancelled {
                    label: config.label.clone(),
                });
            }
            info!("Configuration {}/{}: {}", index + 1, total, config.label);

            let result = match self.launcher.launch(config).await {
                Ok(result) => result,
                Err(e @ BenchError::Cancelled { .. }) => {
                    warn!("Sweep cancelled after {} of {} configurations", index, total);
                    return Err(e);
                }
                Err(e) => {
                    error!("Launch of {} failed: {}", config.label, e);
                    ProcessResult::failed(config, &e)
                }
            };
            results.push(result);

            if index + 1 < total && !self.cooldown.is_zero() {
                info!("Waiting {:?} for resource cleanup...", self.cooldown);
                tokio::select! {
                    _ = tokio::time::sleep(self.cooldown) => {}
                    _ = self.cancel.cancelled() => {
                        warn!("Interrupted during cooldown after {}", config.label);
                        return Err(BenchError::Cancelled {
                            label: config.label.clone(),
                        });
                    }
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, Settings};
    use async_trait::async_trait;

    /// Launcher that fails at chosen positions and records what it saw.
    struct ScriptedLauncher {
        fail_at: Vec<usize>,
        cancel_at: Option<usize>,
        error_at: Vec<usize>,
        seen: Vec<String>,
    }

    impl ScriptedLauncher {
        fn new() -> Self {
            Self {
                fail_at: Vec::new(),
                cancel_at: None,
                error_at: Vec::new(),
                seen: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Launcher for ScriptedLauncher {
        async fn launch(&mut self, config: &RunConfiguration) -> Result<ProcessResult> {
            let index = self.seen.len();
            self.seen.push(config.label.clone());
            if self.cancel_at == Some(index) {
                return Err(BenchError::Cancelled {
                    label: config.label.clone(),
                });
            }
            if self.error_at.contains(&index) {
                return Err(BenchError::LaunchFailure {
                    label: config.label.clone(),
                    reason: "spawn failed".into(),
                });
            }
            let code = if self.fail_at.contains(&index) { 1 } else { 0 };
            Ok(ProcessResult::completed(
                config,
                Some(code),
                true,
                false,
                Duration::ZERO,
            ))
        }
    }

    fn multi_node_template() -> RunConfiguration {
        let defaults = Settings {
            timestamp: "20240101_120000".into(),
            ..Settings::default()
        };
        let overrides = ConfigOverrides {
            node_count: Some(2),
            master_ip: Some("10.0.0.5".parse().unwrap()),
            ..Default::default()
        };
        RunConfiguration::build(&defaults, &overrides).unwrap()
    }

    fn single_node_template() -> RunConfiguration {
        let defaults = Settings {
            timestamp: "20240101_120000".into(),
            ..Settings::default()
        };
        RunConfiguration::build(&defaults, &ConfigOverrides::default()).unwrap()
    }

    #[test]
    fn test_selector_gpu_counts() {
        assert_eq!(SweepSelector::All.gpu_counts(false), vec![2, 4, 8]);
        assert_eq!(SweepSelector::All.gpu_counts(true), (1..=8).collect::<Vec<_>>());
        assert_eq!(SweepSelector::Only(4).gpu_counts(true), vec![4]);
        assert_eq!(SweepSelector::All.max_gpus(false), 8);
    }

    #[test]
    fn test_plan_labels_in_order() {
        let plan = SweepPlan::build(&single_node_template(), SweepSelector::All).unwrap();
        let labels: Vec<_> = plan.configurations.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["single_node_2gpu", "single_node_4gpu", "single_node_8gpu"]);

        let plan = SweepPlan::build(&multi_node_template(), SweepSelector::All)
            .unwrap()
            .with_port(29503);
        assert_eq!(plan.len(), 8);
        assert_eq!(plan.configurations[0].label, "master_2x1gpu");
        assert!(plan.configurations.iter().all(|c| c.master_port == 29503));
    }

    #[test]
    fn test_plan_rejects_invalid_count() {
        assert!(SweepPlan::build(&single_node_template(), SweepSelector::Only(1)).is_err());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_sweep() {
        let plan = SweepPlan::build(&multi_node_template(), SweepSelector::All).unwrap();
        let mut launcher = ScriptedLauncher::new();
        launcher.fail_at = vec![2];
        launcher.error_at = vec![5];
        let mut driver = SweepDriver::new(launcher, Duration::ZERO);

        let results = driver.run(&plan).await.unwrap();
        assert_eq!(results.len(), 8);
        assert!(!results[2].succeeded());
        assert!(results[3].succeeded());
        assert!(results[5].error.is_some());
        assert_eq!(driver.launcher().seen.len(), 8);
    }

    #[tokio::test]
    async fn test_second_of_three_fails() {
        let template = multi_node_template();
        let plan = SweepPlan {
            configurations: (1..=3).map(|g| template.with_gpus(g).unwrap()).collect(),
        };
        let mut launcher = ScriptedLauncher::new();
        launcher.fail_at = vec![1];
        let mut driver = SweepDriver::new(launcher, Duration::ZERO);

        let results = driver.run(&plan).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].succeeded());
        assert!(!results[1].succeeded());
        assert!(results[2].succeeded());
        assert_eq!(
            driver.launcher().seen,
            vec!["master_2x1gpu", "master_2x2gpu", "master_2x3gpu"]
        );
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let plan = SweepPlan::build(&single_node_template(), SweepSelector::All).unwrap();
        let mut launcher = ScriptedLauncher::new();
        launcher.cancel_at = Some(1);
        let mut driver = SweepDriver::new(launcher, Duration::ZERO);

        assert!(matches!(
            driver.run(&plan).await,
            Err(BenchError::Cancelled { .. })
        ));
        assert_eq!(driver.launcher().seen.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_next_launch() {
        let plan = SweepPlan::build(&single_node_template(), SweepSelector::All).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut driver =
            SweepDriver::new(ScriptedLauncher::new(), Duration::ZERO).with_cancellation(cancel);

        assert!(matches!(
            driver.run(&plan).await,
            Err(BenchError::Cancelled { label }) if label == "single_node_2gpu"
        ));
        assert!(driver.launcher().seen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_cooldown() {
        let plan = SweepPlan::build(&single_node_template(), SweepSelector::All).unwrap();
        let cancel = CancellationToken::new();
        let mut driver = SweepDriver::new(ScriptedLauncher::new(), Duration::from_secs(60))
            .with_cancellation(cancel.clone());

        let trigger = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(driver.run(&plan), trigger);
        assert!(matches!(outcome, Err(BenchError::Cancelled { .. })));
        assert_eq!(driver.launcher().seen.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_between_launches_only() {
        let plan = SweepPlan::build(&single_node_template(), SweepSelector::All).unwrap();
        let mut driver = SweepDriver::new(ScriptedLauncher::new(), Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        driver.run(&plan).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
