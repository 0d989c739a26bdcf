//! Fan-out of copies and commands across a [`ConnectionSet`].
//!
//! Every selected member is launched before any is waited for, so the
//! operations run concurrently. The executor then waits on each member in
//! turn and collects failures instead of stopping at the first one. When any
//! member failed, a single [`BladeError::Aggregate`] lists them all.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::BladeError;
use crate::process::WaitOptions;
use crate::set::ConnectionSet;
use crate::ssh::{CommandOptions, CopyOptions, PendingOperation, ShellConnection, default_run_logname};
use crate::tunnel::Connection;

impl<C: ShellConnection> ConnectionSet<C> {
    /// Copies local `source` to `destination` on every selected blade.
    ///
    /// `blade_type` restricts the operation to one type; `None` selects all
    /// members.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Aggregate`] naming every member that failed to
    /// launch, exited non-zero, or timed out.
    pub async fn copy_to(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
        blade_type: Option<&str>,
    ) -> Result<(), BladeError> {
        let member_options = CopyOptions {
            logname: Some(
                options
                    .logname
                    .clone()
                    .unwrap_or_else(|| format!("parallel-copy-to-{source}-{destination}")),
            ),
            ..options.clone()
        };
        let launches = self
            .list_connections(blade_type)
            .into_iter()
            .map(|connection| {
                let launch = connection.start_copy_to(source, destination, &member_options);
                (connection.hostname().to_owned(), launch)
            })
            .collect();
        let summary = format!(
            "errors reported copying '{source}' to '{destination}' on {}",
            scope(blade_type)
        );
        finish(launches, options.timeout, summary).await
    }

    /// Runs `command` on every selected blade, rendering it per connection.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Aggregate`] naming every member whose command
    /// failed to render or launch, exited non-zero, or timed out.
    pub async fn run_command(
        &self,
        command: &str,
        options: &CommandOptions,
        blade_type: Option<&str>,
    ) -> Result<(), BladeError> {
        let member_options = CommandOptions {
            logname: Some(
                options
                    .logname
                    .clone()
                    .unwrap_or_else(|| format!("parallel-{}", default_run_logname(command))),
            ),
            ..options.clone()
        };
        let launches = self
            .list_connections(blade_type)
            .into_iter()
            .map(|connection| {
                let launch = connection.start_command(command, &member_options);
                (connection.hostname().to_owned(), launch)
            })
            .collect();
        let summary = format!(
            "errors reported running command '{command}' on {}",
            scope(blade_type)
        );
        finish(launches, options.timeout, summary).await
    }
}

fn scope(blade_type: Option<&str>) -> String {
    blade_type.map_or_else(
        || String::from("all Virtual Blades"),
        |name| format!("Virtual Blades of type {name}"),
    )
}

/// Waits on every launched member. Failures without log files are prefixed
/// with the member's hostname.
async fn finish(
    launches: Vec<(String, Result<PendingOperation, BladeError>)>,
    timeout: Option<Duration>,
    summary: String,
) -> Result<(), BladeError> {
    let members = launches.len();
    info!(members, operation = %summary, "waiting for parallel operation");
    let wait = WaitOptions::default().with_timeout(timeout);
    let mut failures = Vec::new();
    for (hostname, launch) in launches {
        let outcome = match launch {
            Ok(pending) => pending.wait(wait).await.map(drop),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(hostname = %hostname, error = %err, "parallel member failed");
            failures.push(member_failure(&hostname, &err));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BladeError::Aggregate { summary, failures })
    }
}

fn member_failure(hostname: &str, err: &BladeError) -> String {
    if err.logs().is_some() {
        err.to_string()
    } else {
        format!("{hostname}: {err}")
    }
}
