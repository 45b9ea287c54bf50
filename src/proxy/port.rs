//! Local port allocation for proxy-core instances

use crate::error::{Error, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// How many times the OS is asked again when it offers a port still held here
const MAX_COLLISION_ATTEMPTS: usize = 16;

/// Hands out free loopback TCP ports
///
/// A port is free at the instant it is allocated; the proxy core must bind it
/// soon after. Ports handed out by the same allocator are remembered until
/// their [`PortLease`] is dropped, so two live instances never share one.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a port that is free now and not leased to another instance
    pub fn allocate(&self) -> Result<PortLease> {
        for _ in 0..MAX_COLLISION_ATTEMPTS {
            let port = ephemeral_port().map_err(Error::PortAllocation)?;
            if self.reserved.lock().insert(port) {
                debug!(port, "allocated local port");
                return Ok(PortLease {
                    port,
                    reserved: Arc::clone(&self.reserved),
                });
            }
            debug!(port, "OS offered a port still leased, asking again");
        }

        Err(Error::PortAllocation(io::Error::new(
            io::ErrorKind::AddrInUse,
            "OS kept offering ports that are already leased",
        )))
    }

    /// Number of ports currently leased
    pub fn leased(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// A port reserved for one instance, returned to the allocator on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.port);
    }
}

/// Bind an ephemeral loopback listener, read back its port and close it
fn ephemeral_port() -> io::Result<u16> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1)?;

    socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bound socket has no inet address"))
}
