//! Readiness checks against the local end of a tunnel.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::process::ProcessFuture;

/// Future returned by [`ReadinessCheck::check`].
pub type CheckFuture<'a> = ProcessFuture<'a, io::Result<()>>;

/// Checks whether a tunnel's local endpoint accepts connections.
pub trait ReadinessCheck: Send + Sync {
    /// Resolves to `Ok(())` once `addr` accepts a connection.
    ///
    /// An error of kind [`io::ErrorKind::ConnectionRefused`] means the tunnel
    /// is not listening yet. Any other error is fatal to the connect attempt.
    fn check(&self, addr: SocketAddr) -> CheckFuture<'_>;
}

/// Check that opens and immediately drops a TCP connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpReadinessCheck;

impl ReadinessCheck for TcpReadinessCheck {
    fn check(&self, addr: SocketAddr) -> CheckFuture<'_> {
        Box::pin(async move { TcpStream::connect(addr).await.map(drop) })
    }
}
