//! Process-wide cache of the resolved cloud project identifier.
//!
//! Tunnels and secret operations need the project id, which is only
//! available by asking `gcloud` to look the project up by name. The lookup
//! runs at most a handful of times per process: the first successful answer
//! is stored in a [`OnceLock`] and read by every later caller.
//!
//! Each lookup that actually runs `gcloud` records its output in the
//! [`LOOKUP_LOG_NAME`] log pair under the build directory.
//!
//! Resolution is not serialised. Two callers that miss the cache at the same
//! time both run the lookup and race to store the result; the loser's value
//! is discarded.

use std::ffi::OsString;
use std::io::{self, Write};
use std::sync::OnceLock;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::error::BladeError;
use crate::logs::LogPaths;

/// Log name of the project id lookup.
pub const LOOKUP_LOG_NAME: &str = "common-get-project-id";

/// Log pair the project id lookup writes under `build_dir`.
#[must_use]
pub fn lookup_logs(build_dir: &Utf8Path) -> LogPaths {
    LogPaths::new(build_dir, LOOKUP_LOG_NAME)
}

/// Lazily resolved project id shared by every tunnel and secret operation.
#[derive(Debug, Default)]
pub struct ProjectIdCache {
    cell: OnceLock<String>,
}

impl ProjectIdCache {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// The cache used by default for the whole process.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: ProjectIdCache = ProjectIdCache::new();
        &GLOBAL
    }

    /// Returns the id if it has already been resolved.
    #[must_use]
    pub fn cached(&self) -> Option<&str> {
        self.cell.get().map(String::as_str)
    }

    /// Returns the cached id, resolving it with `gcloud projects list` on a
    /// miss. The lookup's output is written to `logs`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Command`] when `gcloud` cannot be run or fails,
    /// and [`BladeError::Configuration`] when no project named
    /// `project_name` exists. Failed lookups are not cached.
    pub fn resolve(
        &self,
        runner: &dyn CommandRunner,
        gcloud_bin: &str,
        project_name: &str,
        logs: &LogPaths,
    ) -> Result<String, BladeError> {
        if let Some(id) = self.cell.get() {
            return Ok(id.clone());
        }

        debug!(project_name, "resolving project id");
        let args = [
            OsString::from("projects"),
            OsString::from("list"),
            OsString::from(format!("--filter=name={project_name}")),
            OsString::from("--format=value(PROJECT_ID)"),
        ];
        let output = runner.run(gcloud_bin, &args)?;
        if let Err(err) = record(&output, logs) {
            warn!(logs = %logs, error = %err, "failed to record project id lookup output");
        }
        if !output.is_success() {
            return Err(CommandError::failure(gcloud_bin, output).into());
        }
        let id = output.stdout.trim().to_owned();
        if id.is_empty() {
            return Err(BladeError::config(format!(
                "no project named '{project_name}' was found"
            )));
        }

        if self.cell.set(id.clone()).is_err() {
            debug!(project_name, "project id was resolved concurrently");
        } else {
            info!(project_name, project_id = %id, "resolved project id");
        }
        Ok(self.cached().map_or(id, str::to_owned))
    }
}

fn record(output: &CommandOutput, logs: &LogPaths) -> io::Result<()> {
    let (mut out, mut err) = logs.create()?;
    out.write_all(output.stdout.as_bytes())?;
    err.write_all(output.stderr.as_bytes())
}
