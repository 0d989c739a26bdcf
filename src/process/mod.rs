//! Subprocess launching and supervision.
//!
//! Tunnels, copies, and remote commands all run as OS subprocesses whose
//! output goes to a [`LogPaths`] pair. [`ProcessLauncher`] starts them and
//! hands back a [`ProcessHandle`]; [`wait_for_process`] supervises one handle
//! until it exits or its timeout elapses.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt as _;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::logs::LogPaths;

mod wait;

pub use wait::{WAIT_GRANULARITY, WaitOptions, wait_for_process};

/// Future returned by [`ProcessHandle::wait`].
pub type ProcessFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A running (or finished) subprocess.
pub trait ProcessHandle: Send + fmt::Debug {
    /// Operating system process id while the process has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Returns the exit code if the process has already exited.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the process status cannot be queried.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Waits for the process to exit and returns its exit code. Dropping the
    /// future before it resolves leaves the process running.
    fn wait(&mut self) -> ProcessFuture<'_, io::Result<i32>>;

    /// Asks the process to stop (SIGTERM).
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the signal cannot be delivered.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcibly stops the process (SIGKILL). A process that has already
    /// exited is left alone.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the signal cannot be delivered.
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts subprocesses with their output redirected to log files.
pub trait ProcessLauncher: Send + Sync {
    /// Spawns `program` with `args`, writing stdout and stderr to `logs`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the log files cannot be created or the
    /// program cannot be started.
    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        logs: &LogPaths,
    ) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Launcher backed by `tokio::process`.
///
/// Children are spawned with `kill_on_drop`, so dropping a handle never
/// leaves an orphaned subprocess behind.
#[derive(Clone, Debug, Default)]
pub struct TokioProcessLauncher;

impl ProcessLauncher for TokioProcessLauncher {
    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        logs: &LogPaths,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let (out, err) = logs.create()?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .kill_on_drop(true)
            .spawn()?;
        debug!(program, pid = child.id(), "spawned subprocess");
        Ok(Box::new(TokioProcess { child }))
    }
}

#[derive(Debug)]
struct TokioProcess {
    child: Child,
}

impl ProcessHandle for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn wait(&mut self) -> ProcessFuture<'_, io::Result<i32>> {
        Box::pin(async move { self.child.wait().await.map(exit_code) })
    }

    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let raw = i32::try_from(pid)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        signal::kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(io::Error::from)
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()
    }
}

/// Maps an exit status to a shell-style exit code; signalled processes
/// report `128 + signal`.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |sig| 128 + sig))
}

#[cfg(test)]
mod tests;
