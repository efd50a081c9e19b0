//! Pre-launch connectivity diagnostics.
//!
//! Every check runs regardless of the others and records its own outcome, so a
//! failing ICMP probe still leaves the TCP, firewall and fabric results in the
//! report. Checks that need an OS tool which is not installed are reported as
//! informational rather than failed.

use crate::tools::{ToolOutput, ToolRunner};
use colored::*;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const ICMP_REACHABILITY: &str = "icmp-reachability";
pub const TCP_CONNECT: &str = "tcp-connect";
pub const FIREWALL_STATE: &str = "firewall-state";
pub const LISTENING_PORTS: &str = "listening-ports";
pub const INFINIBAND_DEVICES: &str = "infiniband-devices";
pub const INFINIBAND_PEER: &str = "infiniband-peer";

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub success: bool,
    pub detail: Option<String>,
    /// Informational results never count as failures.
    pub informational: bool,
}

impl ProbeResult {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            detail: Some(detail.into()),
            informational: false,
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            detail: Some(detail.into()),
            informational: false,
        }
    }

    fn info(name: &str, success: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success,
            detail: Some(detail.into()),
            informational: true,
        }
    }

    pub fn is_failure(&self) -> bool {
        !self.success && !self.informational
    }

    pub fn status_label(&self) -> &'static str {
        if self.informational {
            "INFO"
        } else if self.success {
            "PASS"
        } else {
            "FAIL"
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub results: Vec<ProbeResult>,
}

impl ConnectivityReport {
    pub fn all_passed(&self) -> bool {
        !self.results.iter().any(ProbeResult::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    pub fn get(&self, name: &str) -> Option<&ProbeResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn print(&self) {
        println!();
        println!("{}", "Connectivity Report".bold());
        for result in &self.results {
            let status = match result.status_label() {
                "PASS" => "PASS".green(),
                "FAIL" => "FAIL".red(),
                other => other.yellow(),
            };
            println!(
                "  [{}] {:<20} {}",
                status,
                result.name,
                result.detail.as_deref().unwrap_or("")
            );
        }
        println!();
    }
}

/// What to probe and how patiently
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub peer: IpAddr,
    pub port: u16,
    pub fabric_peer: Option<IpAddr>,
    pub retries: u32,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProbeSettings {
    pub fn new(peer: IpAddr, port: u16) -> Self {
        Self {
            peer,
            port,
            fabric_peer: None,
            retries: crate::defaults::PROBE_RETRIES,
            ping_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

pub struct ConnectivityProbe<T: ToolRunner> {
    tools: T,
    settings: ProbeSettings,
}

impl<T: ToolRunner> ConnectivityProbe<T> {
    pub fn new(tools: T, settings: ProbeSettings) -> Self {
        Self { tools, settings }
    }

    /// Run every check in a fixed order.
    pub async fn run(&self) -> ConnectivityReport {
        info!(
            "Probing {} (port {}, fabric peer {:?})",
            self.settings.peer, self.settings.port, self.settings.fabric_peer
        );
        let results = vec![
            self.icmp_reachability(ICMP_REACHABILITY, self.settings.peer)
                .await,
            self.tcp_connect().await,
            self.firewall_state().await,
            self.listening_ports().await,
            self.infiniband_devices().await,
            self.infiniband_peer().await,
        ];
        ConnectivityReport { results }
    }

    async fn run_tool(&self, tool: &str, args: &[&str], timeout: Duration) -> Option<ToolOutput> {
        match self.tools.run(tool, args, timeout).await {
            Ok(output) => Some(output),
            Err(e) => {
                debug!("{} could not be run: {:#}", tool, e);
                None
            }
        }
    }

    /// Ping `target` up to `retries` times, recording the result under `name`.
    pub async fn icmp_reachability(&self, name: &str, target: IpAddr) -> ProbeResult {
        if !self.tools.is_available("ping") {
            return ProbeResult::info(name, false, "ping not available");
        }
        let wait = self.settings.ping_timeout.as_secs().max(1).to_string();
        let target_str = target.to_string();
        let attempts = self.settings.retries.max(1);
        let limit = self.settings.ping_timeout + Duration::from_secs(1);

        for attempt in 1..=attempts {
            let args = ["-c", "1", "-W", wait.as_str(), target_str.as_str()];
            if let Some(output) = self.run_tool("ping", &args, limit).await {
                if output.success {
                    return ProbeResult::pass(
                        name,
                        format!("{} reachable (attempt {}/{})", target, attempt, attempts),
                    );
                }
            }
            debug!("ping {} attempt {}/{} failed", target, attempt, attempts);
        }
        ProbeResult::fail(
            name,
            format!("no reply from {} after {} attempts", target, attempts),
        )
    }

    async fn tcp_connect(&self) -> ProbeResult {
        let addr = SocketAddr::new(self.settings.peer, self.settings.port);
        match tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => ProbeResult::pass(TCP_CONNECT, format!("connected to {}", addr)),
            Ok(Err(e)) => ProbeResult::fail(TCP_CONNECT, format!("{}: {}", addr, e)),
            Err(_) => ProbeResult::fail(
                TCP_CONNECT,
                format!(
                    "{}: timed out after {:?}",
                    addr, self.settings.connect_timeout
                ),
            ),
        }
    }

    async fn firewall_state(&self) -> ProbeResult {
        let candidates: [(&str, &[&str]); 3] = [
            ("ufw", &["status"]),
            ("firewall-cmd", &["--state"]),
            ("iptables", &["-L", "-n"]),
        ];
        let Some((tool, args)) = candidates
            .iter()
            .find(|(tool, _)| self.tools.is_available(tool))
        else {
            return ProbeResult::info(FIREWALL_STATE, false, "no firewall tool available");
        };

        match self.run_tool(tool, args, Duration::from_secs(5)).await {
            Some(output) if output.success => {
                ProbeResult::pass(FIREWALL_STATE, format!("{}: {}", tool, output.summary()))
            }
            Some(output) => {
                ProbeResult::fail(FIREWALL_STATE, format!("{}: {}", tool, output.summary()))
            }
            None => ProbeResult::fail(FIREWALL_STATE, format!("{} could not be run", tool)),
        }
    }

    async fn listening_ports(&self) -> ProbeResult {
        if !self.tools.is_available("ss") {
            return ProbeResult::info(LISTENING_PORTS, false, "ss not available");
        }
        let port = self.settings.port;
        match self.run_tool("ss", &["-tln"], Duration::from_secs(5)).await {
            Some(output) if output.success => {
                let listening = is_port_listening(&output.stdout, port);
                let detail = if listening {
                    format!("port {} is listening", port)
                } else {
                    format!("port {} is not listening on this host", port)
                };
                ProbeResult::info(LISTENING_PORTS, listening, detail)
            }
            _ => ProbeResult::info(LISTENING_PORTS, false, "ss failed"),
        }
    }

    async fn infiniband_devices(&self) -> ProbeResult {
        if !self.tools.is_available("ibstat") {
            return ProbeResult::info(INFINIBAND_DEVICES, false, "ibstat not available");
        }
        match self.run_tool("ibstat", &[], Duration::from_secs(5)).await {
            Some(output) if output.success => {
                let active = output
                    .stdout
                    .lines()
                    .filter(|l| l.trim() == "State: Active")
                    .count();
                if active > 0 {
                    ProbeResult::pass(INFINIBAND_DEVICES, format!("{} active port(s)", active))
                } else {
                    ProbeResult::fail(INFINIBAND_DEVICES, "no active InfiniBand port")
                }
            }
            Some(output) => ProbeResult::fail(INFINIBAND_DEVICES, output.summary()),
            None => ProbeResult::fail(INFINIBAND_DEVICES, "ibstat could not be run"),
        }
    }

    async fn infiniband_peer(&self) -> ProbeResult {
        match self.settings.fabric_peer {
            Some(fabric_peer) if self.tools.is_available("ibstat") => {
                self.icmp_reachability(INFINIBAND_PEER, fabric_peer).await
            }
            Some(_) => ProbeResult::info(INFINIBAND_PEER, false, "ibstat not available"),
            None => ProbeResult::info(INFINIBAND_PEER, false, "no fabric peer configured"),
        }
    }
}

/// Whether `ss -tln` output shows a listener on `port`.
fn is_port_listening(ss_output: &str, port: u16) -> bool {
    let suffix = format!(":{}", port);
    ss_output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(3))
        .any(|local| local.ends_with(&suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTools {
        outputs: HashMap<String, Vec<ToolOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTools {
        fn with(mut self, tool: &str, outputs: Vec<ToolOutput>) -> Self {
            self.outputs.insert(tool.to_string(), outputs);
            self
        }

        fn calls(&self, tool: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == tool)
                .count()
        }
    }

    #[async_trait]
    impl ToolRunner for FakeTools {
        fn is_available(&self, tool: &str) -> bool {
            self.outputs.contains_key(tool)
        }

        async fn run(
            &self,
            tool: &str,
            _args: &[&str],
            _timeout: Duration,
        ) -> anyhow::Result<ToolOutput> {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.iter().filter(|c| c.as_str() == tool).count();
            calls.push(tool.to_string());
            let outputs = &self.outputs[tool];
            Ok(outputs[index.min(outputs.len() - 1)].clone())
        }
    }

    fn output(success: bool, stdout: &str) -> ToolOutput {
        ToolOutput {
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    fn settings(port: u16) -> ProbeSettings {
        ProbeSettings {
            connect_timeout: Duration::from_millis(500),
            ..ProbeSettings::new("127.0.0.1".parse().unwrap(), port)
        }
    }

    #[tokio::test]
    async fn test_checks_run_in_fixed_order_without_tools() {
        let probe = ConnectivityProbe::new(FakeTools::default(), settings(1));
        let report = probe.run().await;
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                ICMP_REACHABILITY,
                TCP_CONNECT,
                FIREWALL_STATE,
                LISTENING_PORTS,
                INFINIBAND_DEVICES,
                INFINIBAND_PEER
            ]
        );
        // Without tools only the in-process TCP check can fail.
        assert!(report.get(ICMP_REACHABILITY).unwrap().informational);
        assert!(report.get(FIREWALL_STATE).unwrap().informational);
        assert!(report.get(INFINIBAND_DEVICES).unwrap().informational);
        assert!(report.get(TCP_CONNECT).unwrap().is_failure());
    }

    #[tokio::test]
    async fn test_icmp_retries_then_succeeds() {
        let tools = FakeTools::default().with("ping", vec![output(false, ""), output(true, "")]);
        let probe = ConnectivityProbe::new(tools, settings(1));
        let result = probe
            .icmp_reachability(ICMP_REACHABILITY, "10.0.0.9".parse().unwrap())
            .await;
        assert!(result.success);
        assert!(result.detail.unwrap().contains("attempt 2/3"));
        assert_eq!(probe.tools.calls("ping"), 2);
    }

    #[tokio::test]
    async fn test_icmp_fails_after_retries_but_others_still_run() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tools = FakeTools::default()
            .with("ping", vec![output(false, "")])
            .with("ufw", vec![output(true, "Status: inactive\n")])
            .with("iptables", vec![output(true, "Chain INPUT")]);
        let probe = ConnectivityProbe::new(tools, settings(port));

        let report = probe.run().await;
        assert!(report.get(ICMP_REACHABILITY).unwrap().is_failure());
        assert_eq!(probe.tools.calls("ping"), 3);
        assert!(report.get(TCP_CONNECT).unwrap().success);
        let firewall = report.get(FIREWALL_STATE).unwrap();
        assert_eq!(firewall.detail.as_deref(), Some("ufw: Status: inactive"));
        assert_eq!(probe.tools.calls("iptables"), 0);
        assert!(!report.all_passed());
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn test_infiniband_checks() {
        let ibstat = "CA 'mlx5_0'\n\tPort 1:\n\t\tState: Active\n\t\tPhysical state: LinkUp\n";
        let tools = FakeTools::default()
            .with("ibstat", vec![output(true, ibstat)])
            .with("ping", vec![output(true, "")]);
        let probe = ConnectivityProbe::new(
            tools,
            ProbeSettings {
                fabric_peer: Some("192.168.100.2".parse().unwrap()),
                ..settings(1)
            },
        );
        let devices = probe.infiniband_devices().await;
        assert!(devices.success);
        assert_eq!(devices.detail.as_deref(), Some("1 active port(s)"));
        let peer = probe.infiniband_peer().await;
        assert!(peer.success);
        assert!(!peer.informational);

        let down = FakeTools::default().with("ibstat", vec![output(true, "State: Down\n")]);
        let probe = ConnectivityProbe::new(down, settings(1));
        assert!(probe.infiniband_devices().await.is_failure());
        assert!(probe.infiniband_peer().await.informational);
    }

    #[test]
    fn test_listening_port_parsing() {
        let ss = "State  Recv-Q Send-Q Local Address:Port Peer Address:Port\n\
                  LISTEN 0      128    0.0.0.0:29500      0.0.0.0:*\n\
                  LISTEN 0      128    [::]:22            [::]:*\n";
        assert!(is_port_listening(ss, 29500));
        assert!(is_port_listening(ss, 22));
        assert!(!is_port_listening(ss, 2950));
    }
}
