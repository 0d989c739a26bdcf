//! Ephemeral local port allocation for tunnels.
//!
//! A port is chosen by binding a listener to port 0 on the loopback address,
//! reading back the kernel's choice, and closing the listener straight away.
//! The port is therefore free when returned but nothing reserves it; another
//! process may still claim it before the tunnel binds it. The tunnel's own
//! retry loop absorbs that race.
//!
//! Kernels pick bind-to-zero ports at random, so two calls can return the
//! same number. The allocator remembers the ports it recently handed out and
//! re-draws on a repeat, which keeps live tunnels in this process apart.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, TcpListener};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

const RECENT_CAPACITY: usize = 1024;
const MAX_DRAWS: usize = 64;

/// Hands out OS-assigned free TCP ports, avoiding recent repeats.
#[derive(Debug)]
pub struct PortAllocator {
    recent: Mutex<VecDeque<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    /// Creates an allocator with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Process-wide allocator shared by every tunnel.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: PortAllocator = PortAllocator::new();
        &GLOBAL
    }

    /// Returns a port on `ip` that was free at the instant of the call.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when no listener can be bound on `ip`.
    pub fn allocate(&self, ip: IpAddr) -> io::Result<u16> {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut port = pick_free_port(ip)?;
        for _ in 1..MAX_DRAWS {
            if !recent.contains(&port) {
                break;
            }
            port = pick_free_port(ip)?;
        }
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(port);
        debug!(%ip, port, "allocated local port");
        Ok(port)
    }
}

/// Allocates a port from the process-wide [`PortAllocator`].
///
/// # Errors
///
/// Returns an I/O error when no listener can be bound on `ip`.
pub fn allocate_port(ip: IpAddr) -> io::Result<u16> {
    PortAllocator::global().allocate(ip)
}

fn pick_free_port(ip: IpAddr) -> io::Result<u16> {
    let listener = TcpListener::bind((ip, 0))?;
    Ok(listener.local_addr()?.port())
}
