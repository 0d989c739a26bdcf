//! Secret storage backed by the cloud secret manager.
//!
//! Only secrets declared in the provider configuration may be stored or read.
//! Values written through [`GcloudSecretManager`] are cached in memory, so a
//! read after a write does not go back to the service.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::catalog::{ProviderConfig, SecretConfig};
use crate::command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::config::DEFAULT_BUILD_DIR;
use crate::error::BladeError;
use crate::project::{ProjectIdCache, lookup_logs};

/// Reads and writes named secrets.
pub trait SecretStore: Send + Sync {
    /// Stores `value` as the latest version of secret `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for undeclared secrets and
    /// [`BladeError::Command`] when the store rejects the write.
    fn store(&self, name: &str, value: &str) -> Result<(), BladeError>;

    /// Reads the latest version of secret `name`, or `None` when the secret
    /// has no versions yet.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for undeclared secrets and
    /// [`BladeError::Command`] when the read fails.
    fn read(&self, name: &str) -> Result<Option<String>, BladeError>;
}

/// [`SecretStore`] driving `gcloud secrets`.
pub struct GcloudSecretManager {
    secrets: BTreeMap<String, SecretConfig>,
    gcloud_bin: String,
    project_name: String,
    build_dir: Utf8PathBuf,
    runner: Arc<dyn CommandRunner>,
    project_cache: &'static ProjectIdCache,
    cache: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for GcloudSecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcloudSecretManager")
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("gcloud_bin", &self.gcloud_bin)
            .field("project_name", &self.project_name)
            .finish_non_exhaustive()
    }
}

impl GcloudSecretManager {
    /// Creates a manager for the secrets declared in `catalog`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the project name cannot be
    /// derived or a label or annotation contains whitespace.
    pub fn new(catalog: &ProviderConfig, gcloud_bin: impl Into<String>) -> Result<Self, BladeError> {
        let secrets = catalog.secrets();
        for (name, secret) in &secrets {
            check_metadata(name, "labels", &secret.labels)?;
            check_metadata(name, "annotations", &secret.annotations)?;
        }
        Ok(Self {
            secrets,
            gcloud_bin: gcloud_bin.into(),
            project_name: catalog.project_name()?,
            build_dir: Utf8PathBuf::from(DEFAULT_BUILD_DIR),
            runner: Arc::new(ProcessCommandRunner),
            project_cache: ProjectIdCache::global(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Sets the build directory receiving the project id lookup logs.
    #[must_use]
    pub fn with_build_dir(mut self, build_dir: impl Into<Utf8PathBuf>) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    /// Replaces the project id cache.
    #[must_use]
    pub const fn with_project_cache(mut self, cache: &'static ProjectIdCache) -> Self {
        self.project_cache = cache;
        self
    }

    /// Names of the declared secrets.
    #[must_use]
    pub fn secret_names(&self) -> Vec<&str> {
        self.secrets.keys().map(String::as_str).collect()
    }

    /// Creates every declared secret with its labels and annotations.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Command`] when a creation fails.
    pub fn deploy(&self) -> Result<(), BladeError> {
        let project = self.project_arg()?;
        for (name, secret) in &self.secrets {
            let mut args = vec![
                OsString::from("secrets"),
                OsString::from("create"),
                project.clone(),
            ];
            if !secret.labels.is_empty() {
                args.push(OsString::from(format!("--labels={}", join_pairs(&secret.labels))));
            }
            if !secret.annotations.is_empty() {
                args.push(OsString::from(format!(
                    "--set-annotations={}",
                    join_pairs(&secret.annotations)
                )));
            }
            args.push(OsString::from(name));
            self.checked(&args)?;
            info!(secret = %name, "created secret");
        }
        Ok(())
    }

    /// Deletes every declared secret.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Command`] when a deletion fails.
    pub fn remove(&self) -> Result<(), BladeError> {
        let project = self.project_arg()?;
        for name in self.secrets.keys() {
            let args = [
                OsString::from("--quiet"),
                OsString::from("secrets"),
                OsString::from("delete"),
                project.clone(),
                OsString::from(name),
            ];
            self.checked(&args)?;
            self.cached().remove(name);
            info!(secret = %name, "deleted secret");
        }
        Ok(())
    }

    fn declared(&self, name: &str) -> Result<(), BladeError> {
        if self.secrets.contains_key(name) {
            Ok(())
        } else {
            Err(BladeError::config(format!(
                "secret '{name}' is not declared in 'secrets'"
            )))
        }
    }

    fn project_arg(&self) -> Result<OsString, BladeError> {
        let id = self.project_cache.resolve(
            self.runner.as_ref(),
            &self.gcloud_bin,
            &self.project_name,
            &lookup_logs(&self.build_dir),
        )?;
        Ok(OsString::from(format!("--project={id}")))
    }

    fn checked(&self, args: &[OsString]) -> Result<CommandOutput, BladeError> {
        let output = self.runner.run(&self.gcloud_bin, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError::failure(&self.gcloud_bin, output).into())
        }
    }

    fn cached(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecretStore for GcloudSecretManager {
    fn store(&self, name: &str, value: &str) -> Result<(), BladeError> {
        self.declared(name)?;
        let args = [
            OsString::from("secrets"),
            OsString::from("versions"),
            OsString::from("add"),
            self.project_arg()?,
            OsString::from("--data-file=-"),
            OsString::from(name),
        ];
        let output = self.runner.run_with_input(&self.gcloud_bin, &args, value)?;
        if !output.is_success() {
            return Err(CommandError::failure(&self.gcloud_bin, output).into());
        }
        self.cached().insert(name.to_owned(), value.to_owned());
        debug!(secret = name, "stored secret version");
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<String>, BladeError> {
        self.declared(name)?;
        if let Some(value) = self.cached().get(name) {
            return Ok(Some(value.clone()));
        }
        let args = [
            OsString::from("secrets"),
            OsString::from("versions"),
            OsString::from("access"),
            OsString::from("latest"),
            self.project_arg()?,
            OsString::from(format!("--secret={name}")),
        ];
        let output = self.runner.run(&self.gcloud_bin, &args)?;
        if !output.is_success() {
            if output.stderr.contains("NOT_FOUND") {
                debug!(secret = name, "secret has no versions");
                return Ok(None);
            }
            return Err(CommandError::failure(&self.gcloud_bin, output).into());
        }
        self.cached().insert(name.to_owned(), output.stdout.clone());
        Ok(Some(output.stdout))
    }
}

fn check_metadata(
    secret: &str,
    kind: &str,
    pairs: &BTreeMap<String, String>,
) -> Result<(), BladeError> {
    let bad = pairs
        .iter()
        .find(|(key, value)| key.contains(char::is_whitespace) || value.contains(char::is_whitespace));
    bad.map_or(Ok(()), |(key, value)| {
        Err(BladeError::config(format!(
            "{kind} of secret '{secret}' must not contain whitespace: '{key}={value}'"
        )))
    })
}

fn join_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
