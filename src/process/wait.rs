//! Timeout-aware waiting on a single subprocess.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::BladeError;
use crate::logs::LogPaths;

use super::ProcessHandle;

/// Interval between liveness checks while waiting; also the grace period
/// between the terminate and kill signals.
pub const WAIT_GRANULARITY: Duration = Duration::from_secs(5);

/// Controls how [`wait_for_process`] treats slow or failing processes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitOptions {
    /// Wall-clock budget before the process is terminated; `None` waits
    /// forever.
    pub timeout: Option<Duration>,
    /// Whether a non-zero exit code is an error.
    pub check: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            check: true,
        }
    }
}

impl WaitOptions {
    /// Sets the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets whether non-zero exit codes are errors.
    #[must_use]
    pub const fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }
}

/// Waits for `process` to exit and returns its exit code.
///
/// The process is polled every [`WAIT_GRANULARITY`]. Once a configured
/// timeout is used up the process receives SIGTERM and one more wait cycle;
/// if it is still running after that it receives SIGKILL. Either way a
/// timed-out process yields a timeout error, even when `check` is off.
/// `description` names the operation in error text, for example
/// `command 'uname -a' on 'compute-001'`.
///
/// # Errors
///
/// Returns [`BladeError::RemoteOperation`] when the process times out, when
/// its status cannot be read, or when it exits non-zero with `check` set.
pub async fn wait_for_process(
    process: &mut dyn ProcessHandle,
    description: &str,
    logs: &LogPaths,
    options: WaitOptions,
) -> Result<i32, BladeError> {
    debug!(
        command = description,
        pid = process.id(),
        timeout = ?options.timeout,
        check = options.check,
        "waiting for process"
    );
    let mut remaining = options.timeout;
    let mut terminated = false;

    let code = loop {
        match timeout(WAIT_GRANULARITY, process.wait()).await {
            Ok(Ok(code)) => break code,
            Ok(Err(err)) => {
                return Err(BladeError::RemoteOperation {
                    message: format!("failed waiting for {description} - {err}"),
                    logs: logs.clone(),
                });
            }
            Err(_elapsed) => {}
        }

        let Some(budget) = remaining else {
            continue;
        };
        let left = budget.saturating_sub(WAIT_GRANULARITY);
        remaining = Some(left);
        if !left.is_zero() {
            continue;
        }
        if !terminated {
            warn!(command = description, "timed out, sending terminate signal");
            if let Err(err) = process.terminate() {
                warn!(command = description, error = %err, "terminate signal failed");
            }
            terminated = true;
            continue;
        }
        warn!(command = description, "still running after terminate, killing");
        if let Err(err) = process.kill() {
            warn!(command = description, error = %err, "kill signal failed");
        }
        return Err(timed_out(description, logs, options.timeout, "did not terminate"));
    };

    if terminated {
        return Err(timed_out(description, logs, options.timeout, "was terminated"));
    }
    if options.check && code != 0 {
        return Err(BladeError::RemoteOperation {
            message: format!(
                "{description} terminated with a non-zero exit status '{code}'"
            ),
            logs: logs.clone(),
        });
    }
    Ok(code)
}

fn timed_out(
    description: &str,
    logs: &LogPaths,
    limit: Option<Duration>,
    outcome: &str,
) -> BladeError {
    let seconds = limit.map_or(0, |value| value.as_secs());
    BladeError::RemoteOperation {
        message: format!("{description} timed out after {seconds} seconds and {outcome}"),
        logs: logs.clone(),
    }
}
