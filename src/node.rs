//! Node role resolution for the two-node cluster.
//!
//! The role is derived once per invocation by matching the host's interface
//! addresses against the configured master and worker endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Role of this host in a multi-node run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Hosts the rendezvous and runs node rank 0
    Master,
    /// Joins the master's rendezvous as node rank 1
    Worker,
    /// Neither endpoint matched; any operation needing a role fails
    Unknown,
}

impl NodeRole {
    pub fn node_rank(&self) -> Option<u32> {
        match self {
            NodeRole::Master => Some(0),
            NodeRole::Worker => Some(1),
            NodeRole::Unknown => None,
        }
    }

    /// The other side of the rendezvous.
    pub fn peer(&self) -> NodeRole {
        match self {
            NodeRole::Master => NodeRole::Worker,
            NodeRole::Worker => NodeRole::Master,
            NodeRole::Unknown => NodeRole::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
            NodeRole::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the role of this host.
///
/// The master endpoint is checked first, so a host configured as both endpoints
/// resolves to `Master`.
pub fn resolve(local_addresses: &[IpAddr], master_ip: IpAddr, worker_ip: IpAddr) -> NodeRole {
    if local_addresses.contains(&master_ip) {
        NodeRole::Master
    } else if local_addresses.contains(&worker_ip) {
        NodeRole::Worker
    } else {
        NodeRole::Unknown
    }
}

/// Enumerate the addresses bound to local interfaces.
#[cfg(unix)]
pub fn local_addresses() -> anyhow::Result<Vec<IpAddr>> {
    use nix::ifaddrs::getifaddrs;
    use std::net::{SocketAddrV4, SocketAddrV6};

    let mut addresses = Vec::new();
    for interface in getifaddrs()? {
        let Some(address) = interface.address else {
            continue;
        };
        if let Some(v4) = address.as_sockaddr_in() {
            addresses.push(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
        } else if let Some(v6) = address.as_sockaddr_in6() {
            addresses.push(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
        }
    }
    debug!("Local interface addresses: {:?}", addresses);
    Ok(addresses)
}

#[cfg(not(unix))]
pub fn local_addresses() -> anyhow::Result<Vec<IpAddr>> {
    debug!("Interface enumeration is not supported on this platform");
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_resolve_roles() {
        let master = ip("10.0.0.5");
        let worker = ip("10.0.0.9");
        assert_eq!(resolve(&[ip("10.0.0.5")], master, worker), NodeRole::Master);
        assert_eq!(resolve(&[ip("10.0.0.9")], master, worker), NodeRole::Worker);
        assert_eq!(resolve(&[ip("10.0.0.1")], master, worker), NodeRole::Unknown);
        assert_eq!(resolve(&[], master, worker), NodeRole::Unknown);
    }

    #[test]
    fn test_master_wins_when_host_matches_both() {
        let addrs = [ip("127.0.0.1"), ip("10.0.0.9"), ip("10.0.0.5")];
        assert_eq!(
            resolve(&addrs, ip("10.0.0.5"), ip("10.0.0.9")),
            NodeRole::Master
        );
    }

    #[test]
    fn test_node_rank_and_peer() {
        assert_eq!(NodeRole::Master.node_rank(), Some(0));
        assert_eq!(NodeRole::Worker.node_rank(), Some(1));
        assert_eq!(NodeRole::Unknown.node_rank(), None);
        assert_eq!(NodeRole::Master.peer(), NodeRole::Worker);
        assert_eq!(NodeRole::Worker.to_string(), "worker");
    }

    #[test]
    fn test_local_addresses_include_loopback() {
        let addrs = local_addresses().unwrap();
        if cfg!(unix) {
            assert!(addrs.iter().any(|a| a.is_loopback()));
        }
    }
}
