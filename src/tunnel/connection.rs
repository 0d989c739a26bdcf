//! Connection state machine and the tunnel retry loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use camino::Utf8Path;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::BladeError;
use crate::logs::LogPaths;
use crate::port::allocate_port;
use crate::process::ProcessHandle;

use super::{ReadinessCheck, TcpReadinessCheck, TunnelBroker, TunnelRequest};

/// Local address every tunnel listens on.
pub const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Lifecycle of a [`BladeConnection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// A tunnel is being started or checked.
    Connecting,
    /// The tunnel accepted a TCP connection and is usable.
    Connected,
    /// Terminal: the tunnel process is gone and the local port released.
    Disconnected,
}

/// Read-only view of a tunnelled connection to one blade port.
pub trait Connection {
    /// Blade type the target belongs to.
    fn blade_type(&self) -> &str;

    /// Zero-based instance number within the blade type.
    fn instance(&self) -> usize;

    /// Blade hostname.
    fn hostname(&self) -> &str;

    /// Port on the blade.
    fn remote_port(&self) -> u16;

    /// Local address the tunnel listens on.
    fn local_ip(&self) -> IpAddr;

    /// Local port the tunnel listens on, or `None` once disconnected.
    fn local_port(&self) -> Option<u16>;

    /// Local endpoint to connect to, or `None` once disconnected.
    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_port()
            .map(|port| SocketAddr::new(self.local_ip(), port))
    }

    /// Tears the tunnel down. Calling it again is a no-op.
    fn disconnect(&mut self);
}

/// Identifies the blade port a connection targets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BladeTarget {
    /// Blade type name.
    pub blade_type: String,
    /// Zero-based instance number.
    pub instance: usize,
    /// Blade hostname.
    pub hostname: String,
    /// Port on the blade.
    pub remote_port: u16,
}

/// Retry and polling limits for establishing a tunnel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectPolicy {
    /// Number of tunnel launches attempted before giving up.
    pub reconnects: u32,
    /// Readiness checks per launch.
    pub readiness_polls: u32,
    /// Pause after a refused check.
    pub poll_interval: Duration,
    /// Pause before relaunching after the broker exited early.
    pub reconnect_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            reconnects: 10,
            readiness_polls: 60,
            poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Tunnel {
    process: Box<dyn ProcessHandle>,
    local_port: u16,
}

enum Readiness {
    Ready,
    Exited(i32),
    Exhausted,
}

/// A live tunnel to one port on one blade.
///
/// The tunnel process handle and the local port are held together: both are
/// present while connected and both are cleared on disconnect. Dropping the
/// connection disconnects it.
#[derive(Debug)]
pub struct BladeConnection {
    target: BladeTarget,
    local_ip: IpAddr,
    tunnel: Option<Tunnel>,
    state: ConnectionState,
    logs: LogPaths,
}

impl BladeConnection {
    /// Opens a tunnel to `target`, retrying per `policy`.
    ///
    /// Each attempt allocates a fresh local port, launches the broker, and
    /// checks the port until it accepts a TCP connection. A broker that exits
    /// early costs one reconnect and a `reconnect_delay` pause; a broker that
    /// never becomes reachable within `readiness_polls` checks costs one
    /// reconnect with no pause.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::ConnectionTimeout`] once the reconnect budget is
    /// spent, [`BladeError::ConnectionFault`] on any other local failure, and
    /// whatever the broker reports when it cannot be launched.
    pub async fn connect(
        target: BladeTarget,
        broker: &dyn TunnelBroker,
        build_dir: &Utf8Path,
        policy: ConnectPolicy,
    ) -> Result<Self, BladeError> {
        Self::connect_with_check(target, broker, build_dir, policy, &TcpReadinessCheck).await
    }

    /// Same as [`BladeConnection::connect`], checking readiness with `check`.
    ///
    /// # Errors
    ///
    /// As for [`BladeConnection::connect`]. A check error other than a
    /// refused connection is a [`BladeError::ConnectionFault`].
    pub async fn connect_with_check(
        target: BladeTarget,
        broker: &dyn TunnelBroker,
        build_dir: &Utf8Path,
        policy: ConnectPolicy,
        check: &dyn ReadinessCheck,
    ) -> Result<Self, BladeError> {
        let logs = LogPaths::new(
            build_dir,
            &format!("connection-{}-port-{}", target.hostname, target.remote_port),
        );
        let mut connection = Self {
            target,
            local_ip: LOCAL_IP,
            tunnel: None,
            state: ConnectionState::Connecting,
            logs,
        };
        connection.establish(broker, policy, check).await?;
        Ok(connection)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the tunnel is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }

    /// Log files of the tunnel broker.
    #[must_use]
    pub const fn logs(&self) -> &LogPaths {
        &self.logs
    }

    /// The blade port this connection targets.
    #[must_use]
    pub const fn target(&self) -> &BladeTarget {
        &self.target
    }

    async fn establish(
        &mut self,
        broker: &dyn TunnelBroker,
        policy: ConnectPolicy,
        check: &dyn ReadinessCheck,
    ) -> Result<(), BladeError> {
        let mut reconnects = policy.reconnects;
        let mut last_port = 0;
        let mut last_command = String::new();

        while reconnects > 0 {
            let local_port = allocate_port(self.local_ip)
                .map_err(|err| self.fault(format!("failed to allocate a local port - {err}")))?;
            let request = TunnelRequest {
                hostname: self.target.hostname.clone(),
                remote_port: self.target.remote_port,
                local_ip: self.local_ip,
                local_port,
                logs: self.logs.clone(),
            };
            let launched = broker.launch(&request).inspect_err(|_| {
                self.state = ConnectionState::Disconnected;
            })?;
            info!(
                hostname = %self.target.hostname,
                remote_port = self.target.remote_port,
                local_port,
                reconnects_left = reconnects,
                "launched tunnel"
            );
            last_port = local_port;
            last_command = launched.command;
            self.tunnel = Some(Tunnel {
                process: launched.process,
                local_port,
            });

            match self.await_ready(policy, check, &last_command).await? {
                Readiness::Ready => {
                    self.state = ConnectionState::Connected;
                    info!(
                        hostname = %self.target.hostname,
                        remote_port = self.target.remote_port,
                        local_port,
                        "tunnel ready"
                    );
                    return Ok(());
                }
                Readiness::Exited(code) => {
                    reconnects -= 1;
                    self.release_tunnel();
                    self.report_early_exit(local_port, code, reconnects);
                    if reconnects > 0 {
                        sleep(policy.reconnect_delay).await;
                    }
                }
                Readiness::Exhausted => {
                    reconnects -= 1;
                    self.release_tunnel();
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        warn!(
            hostname = %self.target.hostname,
            remote_port = self.target.remote_port,
            "gave up waiting for tunnel"
        );
        Err(BladeError::ConnectionTimeout {
            hostname: self.target.hostname.clone(),
            remote_port: self.target.remote_port,
            local_ip: self.local_ip,
            local_port: last_port,
            command: last_command,
            logs: self.logs.clone(),
        })
    }

    async fn await_ready(
        &mut self,
        policy: ConnectPolicy,
        check: &dyn ReadinessCheck,
        command: &str,
    ) -> Result<Readiness, BladeError> {
        for _ in 0..policy.readiness_polls {
            let Some(tunnel) = self.tunnel.as_mut() else {
                return Ok(Readiness::Exhausted);
            };
            let local_port = tunnel.local_port;
            match tunnel.process.try_wait() {
                Ok(Some(code)) => return Ok(Readiness::Exited(code)),
                Ok(None) => {}
                Err(err) => {
                    self.disconnect();
                    return Err(self.fault(format!(
                        "cannot query tunnel command {command} (local port {local_port}) - {err}"
                    )));
                }
            }

            match check.check(SocketAddr::new(self.local_ip, local_port)).await {
                Ok(()) => return Ok(Readiness::Ready),
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!(hostname = %self.target.hostname, local_port, "tunnel not ready");
                    sleep(policy.poll_interval).await;
                }
                Err(err) => {
                    self.disconnect();
                    return Err(self.fault(format!(
                        "checking local port {local_port} of tunnel command {command} failed - {err}"
                    )));
                }
            }
        }
        Ok(Readiness::Exhausted)
    }

    fn report_early_exit(&self, local_port: u16, code: i32, reconnects_left: u32) {
        if reconnects_left > 0 {
            warn!(
                hostname = %self.target.hostname,
                local_port,
                code,
                reconnects_left,
                "tunnel command exited early, retrying"
            );
        } else {
            warn!(
                hostname = %self.target.hostname,
                local_port,
                code,
                stderr_log = %self.logs.err,
                "tunnel command exited early, failing"
            );
        }
    }

    fn release_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            if let Err(err) = tunnel.process.kill() {
                warn!(
                    hostname = %self.target.hostname,
                    local_port = tunnel.local_port,
                    error = %err,
                    "failed to kill tunnel command"
                );
            }
        }
    }

    fn fault(&self, message: String) -> BladeError {
        BladeError::ConnectionFault {
            hostname: self.target.hostname.clone(),
            remote_port: self.target.remote_port,
            local_ip: self.local_ip,
            message,
            logs: self.logs.clone(),
        }
    }
}

impl Connection for BladeConnection {
    fn blade_type(&self) -> &str {
        &self.target.blade_type
    }

    fn instance(&self) -> usize {
        self.target.instance
    }

    fn hostname(&self) -> &str {
        &self.target.hostname
    }

    fn remote_port(&self) -> u16 {
        self.target.remote_port
    }

    fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    fn local_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(|tunnel| tunnel.local_port)
    }

    fn disconnect(&mut self) {
        if self.tunnel.is_some() {
            debug!(
                hostname = %self.target.hostname,
                remote_port = self.target.remote_port,
                "disconnecting tunnel"
            );
        }
        self.release_tunnel();
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for BladeConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
