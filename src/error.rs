//! Error kinds surfaced by blade connections and remote operations.

use std::net::IpAddr;

use thiserror::Error;

use crate::command::CommandError;
use crate::logs::LogPaths;

/// Errors raised while connecting to blades or operating on them.
///
/// Every variant that stems from a subprocess names the remote target and
/// the log files holding that subprocess's output.
#[derive(Debug, Error)]
pub enum BladeError {
    /// A referenced blade type, interconnect, secret, or field is absent or
    /// malformed in the provider configuration.
    #[error("provider config error: {message}")]
    Configuration {
        /// Description naming the missing or malformed key.
        message: String,
    },
    /// The tunnel never became reachable within the reconnect budget.
    #[error(
        "timeout waiting for tunnel to '{hostname}' port {remote_port} to be ready \
         (local port = {local_port}, local IP = {local_ip}) - connect command was \
         {command}; {logs}"
    )]
    ConnectionTimeout {
        /// Blade hostname the tunnel targets.
        hostname: String,
        /// Port on the blade.
        remote_port: u16,
        /// Local address the tunnel binds.
        local_ip: IpAddr,
        /// Last local port tried.
        local_port: u16,
        /// Last tunnel command line.
        command: String,
        /// Tunnel log files.
        logs: LogPaths,
    },
    /// An unexpected local failure occurred while establishing or verifying
    /// a tunnel; never retried.
    #[error(
        "failed to connect to service on tunnel to '{hostname}' port {remote_port} \
         (local IP = {local_ip}) - {message}; {logs}"
    )]
    ConnectionFault {
        /// Blade hostname the tunnel targets.
        hostname: String,
        /// Port on the blade.
        remote_port: u16,
        /// Local address the tunnel binds.
        local_ip: IpAddr,
        /// Description of the underlying failure.
        message: String,
        /// Tunnel log files.
        logs: LogPaths,
    },
    /// A command template could not be rendered.
    #[error("failed to render command line '{command}' - {message}")]
    Template {
        /// The literal command template.
        command: String,
        /// Why rendering failed.
        message: String,
    },
    /// A single copy or command failed, exited non-zero, or timed out.
    #[error("{message}; {logs}")]
    RemoteOperation {
        /// Description naming the command and target.
        message: String,
        /// Log files of the operation.
        logs: LogPaths,
    },
    /// One or more members of a parallel operation failed.
    #[error("{summary}\n    {}", .failures.join("\n\n    "))]
    Aggregate {
        /// Description of the parallel operation.
        summary: String,
        /// One message per failed member, each naming its log files.
        failures: Vec<String>,
    },
    /// A captured helper command such as a `gcloud` query could not run or
    /// failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl BladeError {
    /// Shorthand for a [`BladeError::Configuration`] error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns the log files attached to this error, if any.
    #[must_use]
    pub const fn logs(&self) -> Option<&LogPaths> {
        match self {
            Self::ConnectionTimeout { logs, .. }
            | Self::ConnectionFault { logs, .. }
            | Self::RemoteOperation { logs, .. } => Some(logs),
            Self::Configuration { .. }
            | Self::Template { .. }
            | Self::Aggregate { .. }
            | Self::Command(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use std::net::Ipv4Addr;

    #[test]
    fn timeout_message_names_target_and_logs() {
        let err = BladeError::ConnectionTimeout {
            hostname: String::from("blade-001"),
            remote_port: 22,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 40_000,
            command: String::from("gcloud compute start-iap-tunnel"),
            logs: LogPaths::new(Utf8Path::new("/b"), "connection-blade-001-port-22"),
        };
        let rendered = err.to_string();

        for fragment in [
            "'blade-001' port 22",
            "local port = 40000",
            "/b/logs/connection-blade-001-port-22-err.txt",
        ] {
            assert!(rendered.contains(fragment), "missing {fragment}: {rendered}");
        }
    }

    #[test]
    fn aggregate_lists_every_failure() {
        let err = BladeError::Aggregate {
            summary: String::from("errors reported running command 'true' on all Virtual Blades"),
            failures: vec![String::from("first"), String::from("second")],
        };
        assert_eq!(
            err.to_string(),
            "errors reported running command 'true' on all Virtual Blades\n    first\n\n    second"
        );
        assert!(err.logs().is_none());
    }
}
