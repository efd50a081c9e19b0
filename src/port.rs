//! Rendezvous port selection.
//!
//! The scan itself is deterministic: whether a port is taken is answered by an
//! injected predicate. `port_in_use` is the real predicate used by the CLI. It is a
//! best-effort check-then-use, not a reservation.

use crate::error::{BenchError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::debug;

/// Return the first port in `start..start + range_size` for which `is_in_use` is false.
///
/// The range is clamped at 65535.
///
/// ```rust
/// # use collective_bench::port::find_available;
/// let port = find_available(29500, 10, |p| p == 29500 || p == 29501).unwrap();
/// assert_eq!(port, 29502);
/// ```
pub fn find_available<F>(start: u16, range_size: u16, mut is_in_use: F) -> Result<u16>
where
    F: FnMut(u16) -> bool,
{
    let end = start.saturating_add(range_size.saturating_sub(1));
    if range_size == 0 {
        return Err(BenchError::NoAvailablePort { start, end: start });
    }

    for port in start..=end {
        if !is_in_use(port) {
            return Ok(port);
        }
        debug!("Port {} is in use, trying next", port);
    }

    Err(BenchError::NoAvailablePort { start, end })
}

/// Whether binding `0.0.0.0:port` fails.
///
/// `SO_REUSEADDR` is set the same way the rendezvous store sets it, so sockets
/// lingering in `TIME_WAIT` from a previous launch are not reported as busy.
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let bind = || -> std::io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        Ok(())
    };
    bind().is_err()
}
