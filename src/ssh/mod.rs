//! SSH and SCP operations over a blade tunnel.
//!
//! [`SshConnection`] wraps a [`BladeConnection`] to port 22 of a blade and
//! adds file copies and remote commands. Every operation is available in two
//! forms: a `start_*` method that launches the subprocess and returns a
//! [`PendingOperation`], and an async method that launches and then waits
//! for it, failing on non-zero exit.

use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::error::BladeError;
use crate::logs::LogPaths;
use crate::process::{ProcessHandle, ProcessLauncher, WaitOptions, wait_for_process};
use crate::tunnel::{BladeConnection, Connection, render_command_line};

mod template;

pub use template::{TemplateValues, render_command};

/// Options passed to every `ssh` and `scp` invocation unless overridden.
pub const DEFAULT_SSH_OPTIONS: [&str; 6] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "NoHostAuthenticationForLocalhost=yes",
    "-o",
    "StrictHostKeyChecking=no",
];

/// Binaries and login settings for SSH operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// `ssh` executable.
    pub ssh_bin: String,
    /// `scp` executable.
    pub scp_bin: String,
    /// Remote login user.
    pub user: String,
    /// Replacement for [`DEFAULT_SSH_OPTIONS`]; the tunnel port option is
    /// always appended.
    pub options: Option<Vec<String>>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            user: String::from("root"),
            options: None,
        }
    }
}

/// Options for a single copy.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CopyOptions {
    /// Copy directories recursively.
    pub recurse: bool,
    /// Log name prefix; derived from the paths when absent.
    pub logname: Option<String>,
    /// Wait budget for the blocking form.
    pub timeout: Option<Duration>,
}

impl CopyOptions {
    /// Sets recursive copying.
    #[must_use]
    pub const fn with_recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    /// Sets the log name prefix.
    #[must_use]
    pub fn with_logname(mut self, logname: impl Into<String>) -> Self {
        self.logname = Some(logname.into());
        self
    }

    /// Sets the wait budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for a single remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOptions {
    /// Log name prefix; derived from the command when absent.
    pub logname: Option<String>,
    /// Wait budget for the blocking form.
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    /// Sets the log name prefix.
    #[must_use]
    pub fn with_logname(mut self, logname: impl Into<String>) -> Self {
        self.logname = Some(logname.into());
        self
    }

    /// Sets the wait budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A launched copy or command that has not been waited for yet.
#[derive(Debug)]
pub struct PendingOperation {
    hostname: String,
    description: String,
    logs: LogPaths,
    process: Box<dyn ProcessHandle>,
}

impl PendingOperation {
    /// Hostname of the blade the operation targets.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Description used in error messages.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Log files of the operation.
    #[must_use]
    pub const fn logs(&self) -> &LogPaths {
        &self.logs
    }

    /// Waits for the operation to finish.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::RemoteOperation`] on timeout, or on a non-zero
    /// exit when `options.check` is set.
    pub async fn wait(mut self, options: WaitOptions) -> Result<i32, BladeError> {
        wait_for_process(self.process.as_mut(), &self.description, &self.logs, options).await
    }
}

/// A connection that can copy files and run commands on its blade.
pub trait ShellConnection: Connection {
    /// Starts copying local `source` to remote `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError`] when the connection is closed or the copy
    /// cannot be launched.
    fn start_copy_to(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<PendingOperation, BladeError>;

    /// Starts copying remote `source` to local `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError`] when the connection is closed or the copy
    /// cannot be launched.
    fn start_copy_from(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<PendingOperation, BladeError>;

    /// Renders `command` for this connection and starts it remotely.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Template`] when the command does not render and
    /// [`BladeError`] when the connection is closed or the command cannot be
    /// launched.
    fn start_command(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<PendingOperation, BladeError>;
}

/// An SSH-capable tunnel to port 22 (or another SSH port) of a blade.
pub struct SshConnection {
    base: BladeConnection,
    private_key: Utf8PathBuf,
    settings: SshSettings,
    build_dir: Utf8PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("base", &self.base)
            .field("private_key", &self.private_key)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    /// Wraps an established tunnel.
    #[must_use]
    pub fn new(
        base: BladeConnection,
        private_key: impl Into<Utf8PathBuf>,
        settings: SshSettings,
        build_dir: impl Into<Utf8PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            base,
            private_key: private_key.into(),
            settings,
            build_dir: build_dir.into(),
            launcher,
        }
    }

    /// The underlying tunnel.
    #[must_use]
    pub const fn tunnel(&self) -> &BladeConnection {
        &self.base
    }

    /// Private key used for authentication.
    #[must_use]
    pub fn private_key(&self) -> &Utf8Path {
        &self.private_key
    }

    /// Copies local `source` to remote `destination` and waits.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::RemoteOperation`] when the copy fails or times
    /// out.
    pub async fn copy_to(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<(), BladeError> {
        self.start_copy_to(source, destination, options)?
            .wait(WaitOptions::default().with_timeout(options.timeout))
            .await
            .map(drop)
    }

    /// Copies remote `source` to local `destination` and waits.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::RemoteOperation`] when the copy fails or times
    /// out.
    pub async fn copy_from(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<(), BladeError> {
        self.start_copy_from(source, destination, options)?
            .wait(WaitOptions::default().with_timeout(options.timeout))
            .await
            .map(drop)
    }

    /// Runs `command` remotely and waits.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Template`] when the command does not render and
    /// [`BladeError::RemoteOperation`] when it fails or times out.
    pub async fn run_command(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<(), BladeError> {
        self.start_command(command, options)?
            .wait(WaitOptions::default().with_timeout(options.timeout))
            .await
            .map(drop)
    }

    fn template_values(&self) -> TemplateValues<'_> {
        TemplateValues {
            blade_type: self.base.blade_type(),
            instance: self.base.instance(),
            blade_hostname: self.base.hostname(),
            remote_port: self.base.remote_port(),
            local_ip: self.base.local_ip(),
            local_port: self.base.local_port(),
        }
    }

    fn transport_options(&self) -> Result<Vec<OsString>, BladeError> {
        let port = self.base.local_port().ok_or_else(|| BladeError::ConnectionFault {
            hostname: self.base.hostname().to_owned(),
            remote_port: self.base.remote_port(),
            local_ip: self.base.local_ip(),
            message: String::from("the connection is closed"),
            logs: self.base.logs().clone(),
        })?;
        let mut options: Vec<OsString> = self.settings.options.as_ref().map_or_else(
            || DEFAULT_SSH_OPTIONS.iter().map(OsString::from).collect(),
            |custom| custom.iter().map(OsString::from).collect(),
        );
        options.push(OsString::from("-o"));
        options.push(OsString::from(format!("Port={port}")));
        Ok(options)
    }

    fn identity_args(&self) -> Vec<OsString> {
        vec![OsString::from("-i"), OsString::from(self.private_key.as_str())]
    }

    fn remote_login(&self) -> String {
        format!("{}@{}", self.settings.user, self.base.local_ip())
    }

    fn scp_args(
        &self,
        recurse: bool,
        source: String,
        destination: String,
    ) -> Result<Vec<OsString>, BladeError> {
        let mut args = self.identity_args();
        if recurse {
            args.push(OsString::from("-r"));
        }
        args.extend(self.transport_options()?);
        args.push(OsString::from(source));
        args.push(OsString::from(destination));
        Ok(args)
    }

    fn launch(
        &self,
        program: &str,
        args: &[OsString],
        logs: LogPaths,
        description: String,
    ) -> Result<PendingOperation, BladeError> {
        let command_line = render_command_line(program, args);
        debug!(hostname = self.base.hostname(), command = %command_line, "launching");
        let process = self
            .launcher
            .spawn(program, args, &logs)
            .map_err(|err| BladeError::RemoteOperation {
                message: format!("failed to start {description} using command: {command_line} - {err}"),
                logs: logs.clone(),
            })?;
        Ok(PendingOperation {
            hostname: self.base.hostname().to_owned(),
            description,
            logs,
            process,
        })
    }

    fn operation_logs(&self, logname: &str) -> LogPaths {
        LogPaths::new(
            &self.build_dir,
            &format!("{logname}-{}", self.base.hostname()),
        )
    }
}

impl Connection for SshConnection {
    fn blade_type(&self) -> &str {
        self.base.blade_type()
    }

    fn instance(&self) -> usize {
        self.base.instance()
    }

    fn hostname(&self) -> &str {
        self.base.hostname()
    }

    fn remote_port(&self) -> u16 {
        self.base.remote_port()
    }

    fn local_ip(&self) -> IpAddr {
        self.base.local_ip()
    }

    fn local_port(&self) -> Option<u16> {
        self.base.local_port()
    }

    fn disconnect(&mut self) {
        self.base.disconnect();
    }
}

impl ShellConnection for SshConnection {
    fn start_copy_to(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<PendingOperation, BladeError> {
        let logname = options
            .logname
            .clone()
            .unwrap_or_else(|| format!("copy-to-{source}-{destination}"));
        let remote = format!("{}:{destination}", self.remote_login());
        let args = self.scp_args(options.recurse, source.to_owned(), remote)?;
        let description = format!(
            "copy '{source}' to '{}@{}:{destination}'",
            self.settings.user,
            self.base.hostname()
        );
        info!(hostname = self.base.hostname(), source, destination, "copying to blade");
        self.launch(&self.settings.scp_bin, &args, self.operation_logs(&logname), description)
    }

    fn start_copy_from(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<PendingOperation, BladeError> {
        let logname = options
            .logname
            .clone()
            .unwrap_or_else(|| format!("copy-from-{source}-{destination}"));
        let remote = format!("{}:{source}", self.remote_login());
        let args = self.scp_args(options.recurse, remote, destination.to_owned())?;
        let description = format!(
            "copy '{}@{}:{source}' to '{destination}'",
            self.settings.user,
            self.base.hostname()
        );
        info!(hostname = self.base.hostname(), source, destination, "copying from blade");
        self.launch(&self.settings.scp_bin, &args, self.operation_logs(&logname), description)
    }

    fn start_command(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<PendingOperation, BladeError> {
        let rendered = render_command(command, &self.template_values())?;
        let logname = options
            .logname
            .clone()
            .unwrap_or_else(|| default_run_logname(&rendered));
        let mut args = self.identity_args();
        args.extend(self.transport_options()?);
        args.push(OsString::from(self.remote_login()));
        args.push(OsString::from(&rendered));
        let description = format!("command '{rendered}' on '{}'", self.base.hostname());
        info!(hostname = self.base.hostname(), command = %rendered, "running remote command");
        self.launch(&self.settings.ssh_bin, &args, self.operation_logs(&logname), description)
    }
}

/// Default log name prefix for a remote command: `run-<first word>`.
pub(crate) fn default_run_logname(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or("command");
    format!("run-{first}")
}
