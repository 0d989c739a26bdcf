//! Tunnelled connections from the local host to blade ports.
//!
//! A tunnel is an external broker process (by default `gcloud compute
//! start-iap-tunnel`) that listens on a local port and forwards to a port on
//! a blade. [`TunnelBroker`] starts that process; [`BladeConnection`] drives
//! the connect and retry loop around it.

use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::DEFAULT_BUILD_DIR;
use crate::error::BladeError;
use crate::logs::LogPaths;
use crate::process::{ProcessHandle, ProcessLauncher, TokioProcessLauncher};
use crate::project::{ProjectIdCache, lookup_logs};

mod connection;
mod readiness;

pub use connection::{
    BladeConnection, BladeTarget, ConnectPolicy, Connection, ConnectionState, LOCAL_IP,
};
pub use readiness::{CheckFuture, ReadinessCheck, TcpReadinessCheck};

/// Everything a broker needs to open one tunnel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TunnelRequest {
    /// Blade hostname to forward to.
    pub hostname: String,
    /// Port on the blade.
    pub remote_port: u16,
    /// Local address the tunnel listens on.
    pub local_ip: IpAddr,
    /// Local port the tunnel listens on.
    pub local_port: u16,
    /// Where the broker's output goes.
    pub logs: LogPaths,
}

/// A started broker process and the command line that started it.
#[derive(Debug)]
pub struct LaunchedTunnel {
    /// The running broker.
    pub process: Box<dyn ProcessHandle>,
    /// Human readable command line, used in error messages.
    pub command: String,
}

/// Starts tunnel broker processes.
pub trait TunnelBroker: Send + Sync {
    /// Launches a broker for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError`] when the broker cannot be configured or
    /// started. Such failures are not retried by the caller.
    fn launch(&self, request: &TunnelRequest) -> Result<LaunchedTunnel, BladeError>;
}

/// Broker backed by Identity-Aware Proxy tunnels through `gcloud`.
pub struct IapTunnelBroker {
    gcloud_bin: String,
    project_name: String,
    zone: String,
    build_dir: Utf8PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    runner: Arc<dyn CommandRunner>,
    cache: &'static ProjectIdCache,
}

impl std::fmt::Debug for IapTunnelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IapTunnelBroker")
            .field("gcloud_bin", &self.gcloud_bin)
            .field("project_name", &self.project_name)
            .field("zone", &self.zone)
            .field("build_dir", &self.build_dir)
            .finish_non_exhaustive()
    }
}

impl IapTunnelBroker {
    /// Creates a broker for blades in `zone` of the project named
    /// `project_name`, using real processes and the global project id cache.
    #[must_use]
    pub fn new(
        gcloud_bin: impl Into<String>,
        project_name: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            gcloud_bin: gcloud_bin.into(),
            project_name: project_name.into(),
            zone: zone.into(),
            build_dir: Utf8PathBuf::from(DEFAULT_BUILD_DIR),
            launcher: Arc::new(TokioProcessLauncher),
            runner: Arc::new(ProcessCommandRunner),
            cache: ProjectIdCache::global(),
        }
    }

    /// Sets the build directory receiving the project id lookup logs.
    #[must_use]
    pub fn with_build_dir(mut self, build_dir: impl Into<Utf8PathBuf>) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    /// Replaces the launcher used for tunnel processes.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replaces the runner used for the project id lookup.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replaces the project id cache.
    #[must_use]
    pub const fn with_cache(mut self, cache: &'static ProjectIdCache) -> Self {
        self.cache = cache;
        self
    }

    fn tunnel_args(&self, project_id: &str, request: &TunnelRequest) -> Vec<OsString> {
        vec![
            OsString::from("compute"),
            OsString::from(format!("--project={project_id}")),
            OsString::from("start-iap-tunnel"),
            OsString::from(format!("--zone={}", self.zone)),
            OsString::from(format!(
                "--local-host-port={}:{}",
                request.local_ip, request.local_port
            )),
            OsString::from(&request.hostname),
            OsString::from(request.remote_port.to_string()),
        ]
    }
}

impl TunnelBroker for IapTunnelBroker {
    fn launch(&self, request: &TunnelRequest) -> Result<LaunchedTunnel, BladeError> {
        let logs = lookup_logs(&self.build_dir);
        let project_id = self
            .cache
            .resolve(self.runner.as_ref(), &self.gcloud_bin, &self.project_name, &logs)
            .map_err(|err| BladeError::ConnectionFault {
                hostname: request.hostname.clone(),
                remote_port: request.remote_port,
                local_ip: request.local_ip,
                message: format!(
                    "failed to resolve the id of project '{}' - {err}",
                    self.project_name
                ),
                logs,
            })?;
        let args = self.tunnel_args(&project_id, request);
        let command = render_command_line(&self.gcloud_bin, &args);
        debug!(command = %command, "launching tunnel");
        let process = self
            .launcher
            .spawn(&self.gcloud_bin, &args, &request.logs)
            .map_err(|err| BladeError::ConnectionFault {
                hostname: request.hostname.clone(),
                remote_port: request.remote_port,
                local_ip: request.local_ip,
                message: format!("failed to start tunnel command {command} - {err}"),
                logs: request.logs.clone(),
            })?;
        Ok(LaunchedTunnel { process, command })
    }
}

/// Joins a program and its arguments into a single display string.
pub(crate) fn render_command_line(program: &str, args: &[OsString]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

#[cfg(test)]
mod tests;
