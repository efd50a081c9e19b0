//! Fail-fast checks run once before a sweep launches anything.

use crate::{
    config::RunConfiguration,
    error::{BenchError, Result},
    node::NodeRole,
    probe::{ConnectivityProbe, ProbeSettings, ICMP_REACHABILITY},
    tools::ToolRunner,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Verify the host can run every configuration of a sweep.
///
/// `max_gpus` is the largest GPU-per-node count the sweep asks for. With
/// `dry_run` set only the benchmark script is checked, since nothing will be
/// executed.
pub async fn check<T: ToolRunner>(
    tools: &T,
    template: &RunConfiguration,
    max_gpus: u32,
    dry_run: bool,
) -> Result<()> {
    let script = &template.launch.script;
    if !script.is_file() {
        return Err(BenchError::MissingExternalDependency {
            name: script.display().to_string(),
            hint: "pass --script with the path to the benchmark script".into(),
        });
    }
    if dry_run {
        debug!("Dry run: skipping launcher, GPU and peer checks");
        return Ok(());
    }

    let launcher = &template.launch.launcher[0];
    if !tools.is_available(launcher) {
        return Err(BenchError::MissingExternalDependency {
            name: launcher.clone(),
            hint: "install PyTorch (`pip install torch`) or point --launcher at the distributed launcher"
                .into(),
        });
    }

    let visible = visible_gpu_count(tools).await?;
    if visible < max_gpus {
        return Err(BenchError::invalid(
            "gpus_per_node",
            format!(
                "{} GPUs per node requested but only {} visible",
                max_gpus, visible
            ),
        ));
    }
    info!("{} GPUs visible, {} required", visible, max_gpus);

    if template.is_multi_node() {
        check_peer(tools, template).await?;
    }
    Ok(())
}

async fn visible_gpu_count<T: ToolRunner>(tools: &T) -> Result<u32> {
    if !tools.is_available("nvidia-smi") {
        return Err(BenchError::MissingExternalDependency {
            name: "nvidia-smi".into(),
            hint: "install the NVIDIA driver utilities so GPUs can be enumerated".into(),
        });
    }
    let output = tools
        .run("nvidia-smi", &["--list-gpus"], Duration::from_secs(30))
        .await
        .map_err(|e| BenchError::invalid("gpus_per_node", format!("nvidia-smi failed: {:#}", e)))?;
    if !output.success {
        return Err(BenchError::invalid(
            "gpus_per_node",
            format!("nvidia-smi failed: {}", output.summary()),
        ));
    }
    Ok(count_gpus(&output.stdout))
}

/// Count `GPU <n>: ...` lines of `nvidia-smi --list-gpus`.
fn count_gpus(list: &str) -> u32 {
    list.lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count() as u32
}

async fn check_peer<T: ToolRunner>(tools: &T, template: &RunConfiguration) -> Result<()> {
    let peer = match template.role {
        NodeRole::Worker => Some(template.master_address.clone()),
        _ => template.worker_address.clone(),
    };
    let Some(peer) = peer else {
        warn!("Worker address not configured, skipping peer reachability check");
        return Ok(());
    };
    let Ok(peer_ip) = peer.parse() else {
        return Err(BenchError::PeerUnreachable { peer });
    };

    let probe = ConnectivityProbe::new(tools, ProbeSettings::new(peer_ip, template.master_port));
    let result = probe.icmp_reachability(ICMP_REACHABILITY, peer_ip).await;
    if result.informational {
        warn!("ping not available, skipping peer reachability check");
        Ok(())
    } else if result.success {
        info!("Peer {} is reachable", peer);
        Ok(())
    } else {
        Err(BenchError::PeerUnreachable { peer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, Settings};
    use crate::tools::ToolOutput;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;

    struct Canned(HashMap<&'static str, ToolOutput>);

    #[async_trait]
    impl ToolRunner for Canned {
        fn is_available(&self, tool: &str) -> bool {
            self.0.contains_key(tool)
        }

        async fn run(&self, tool: &str, _: &[&str], _: Duration) -> anyhow::Result<ToolOutput> {
            self.0
                .get(tool)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{} missing", tool))
        }
    }

    fn ok(stdout: &str) -> ToolOutput {
        ToolOutput {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    fn gpus(n: usize) -> String {
        (0..n)
            .map(|i| format!("GPU {}: NVIDIA H100 80GB HBM3 (UUID: GPU-{})\n", i, i))
            .collect()
    }

    fn template(script: &Path, overrides: ConfigOverrides) -> RunConfiguration {
        let defaults = Settings {
            timestamp: "20240101_120000".into(),
            ..Settings::default()
        };
        let overrides = ConfigOverrides {
            script: Some(script.to_path_buf()),
            ..overrides
        };
        RunConfiguration::build(&defaults, &overrides).unwrap()
    }

    #[tokio::test]
    async fn test_missing_script_is_fatal_even_in_dry_run() {
        let config = template(Path::new("/nonexistent/bench.py"), ConfigOverrides::default());
        let tools = Canned(HashMap::new());
        let err = check(&tools, &config, 2, true).await.unwrap_err();
        assert!(matches!(err, BenchError::MissingExternalDependency { .. }));
    }

    #[tokio::test]
    async fn test_tool_and_gpu_checks() {
        let script = tempfile::NamedTempFile::new().unwrap();
        let config = template(script.path(), ConfigOverrides::default());

        let none = Canned(HashMap::new());
        assert!(check(&none, &config, 2, true).await.is_ok());
        match check(&none, &config, 2, false).await {
            Err(BenchError::MissingExternalDependency { name, .. }) => assert_eq!(name, "torchrun"),
            other => panic!("expected missing launcher, got {:?}", other),
        }

        let four = Canned(HashMap::from([
            ("torchrun", ok("")),
            ("nvidia-smi", ok(&gpus(4))),
        ]));
        assert!(check(&four, &config, 4, false).await.is_ok());
        match check(&four, &config, 8, false).await {
            Err(BenchError::InvalidConfiguration { field, reason }) => {
                assert_eq!(field, "gpus_per_node");
                assert!(reason.contains("only 4 visible"));
            }
            other => panic!("expected too few GPUs, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_fatal() {
        let script = tempfile::NamedTempFile::new().unwrap();
        let config = template(
            script.path(),
            ConfigOverrides {
                role: Some(NodeRole::Worker),
                node_count: Some(2),
                master_ip: Some("10.0.0.5".parse().unwrap()),
                ..Default::default()
            },
        );
        let mut failed_ping = ok("");
        failed_ping.success = false;
        let tools = Canned(HashMap::from([
            ("torchrun", ok("")),
            ("nvidia-smi", ok(&gpus(8))),
            ("ping", failed_ping),
        ]));
        match check(&tools, &config, 8, false).await {
            Err(BenchError::PeerUnreachable { peer }) => assert_eq!(peer, "10.0.0.5"),
            other => panic!("expected unreachable peer, got {:?}", other),
        }
    }

    #[test]
    fn test_count_gpus() {
        assert_eq!(count_gpus(&gpus(3)), 3);
        assert_eq!(count_gpus("No devices found.\n"), 0);
    }
}
