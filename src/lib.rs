//! Tunnelled SSH access to the virtual blades of a cloud provider.
//!
//! Blades are reached through per-connection IAP tunnels bound to loopback
//! ports. On top of a tunnel the crate layers SSH/SCP operations with
//! per-blade command templating, connection sets keyed by blade type, and
//! parallel execution across a set with aggregated failure reporting.
//!
//! [`VirtualBlades`] is the usual entry point: build it from
//! [`ConnectConfig`], then open a single [`BladeConnection`] or
//! [`SshConnection`], or a whole [`ConnectionSet`].

pub mod blades;
pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod logs;
pub mod parallel;
pub mod port;
pub mod process;
pub mod project;
pub mod secrets;
pub mod set;
pub mod ssh;
pub mod test_support;
pub mod tunnel;

pub use blades::{BladeInterconnects, SSH_PORT, VirtualBlades};
pub use catalog::ProviderConfig;
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, ConnectConfig};
pub use error::BladeError;
pub use logs::LogPaths;
pub use port::{PortAllocator, allocate_port};
pub use process::{ProcessHandle, ProcessLauncher, TokioProcessLauncher, WaitOptions};
pub use project::ProjectIdCache;
pub use secrets::{GcloudSecretManager, SecretStore};
pub use set::ConnectionSet;
pub use ssh::{
    CommandOptions, CopyOptions, PendingOperation, ShellConnection, SshConnection, SshSettings,
};
pub use tunnel::{
    BladeConnection, BladeTarget, ConnectPolicy, Connection, ConnectionState, IapTunnelBroker,
    ReadinessCheck, TcpReadinessCheck, TunnelBroker, TunnelRequest,
};
