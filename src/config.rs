//! Configuration loading via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::ssh::SshSettings;

/// Default build directory receiving logs and SSH key material.
pub const DEFAULT_BUILD_DIR: &str = "/tmp/bladelink_build";

/// Connection settings derived from configuration files and environment
/// variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BLADELINK",
    discovery(
        app_name = "bladelink",
        env_var = "BLADELINK_CONFIG_PATH",
        config_file_name = "bladelink.toml",
        dotfile_name = ".bladelink.toml",
        project_file_name = "bladelink.toml"
    )
)]
pub struct ConnectConfig {
    /// Path to the provider configuration JSON document. Required.
    pub provider_config: Option<String>,
    /// Directory receiving subprocess logs; also holds
    /// `blade_ssh_keys/<secret>/id_rsa`.
    #[ortho_config(default = DEFAULT_BUILD_DIR.to_owned())]
    pub build_dir: String,
    /// Path to the `gcloud` executable.
    #[ortho_config(default = "gcloud".to_owned())]
    pub gcloud_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to log in as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ConnectConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to bladelink.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("bladelink")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            self.provider_config.as_deref().unwrap_or_default(),
            &FieldMetadata::new(
                "provider configuration path",
                "BLADELINK_PROVIDER_CONFIG",
                "provider_config",
            ),
        )?;
        Self::require_field(
            &self.build_dir,
            &FieldMetadata::new("build directory", "BLADELINK_BUILD_DIR", "build_dir"),
        )?;
        Self::require_field(
            &self.gcloud_bin,
            &FieldMetadata::new("gcloud executable", "BLADELINK_GCLOUD_BIN", "gcloud_bin"),
        )?;
        Self::require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "BLADELINK_SSH_BIN", "ssh_bin"),
        )?;
        Self::require_field(
            &self.scp_bin,
            &FieldMetadata::new("scp executable", "BLADELINK_SCP_BIN", "scp_bin"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "BLADELINK_SSH_USER", "ssh_user"),
        )?;
        Ok(())
    }

    /// Validated path of the provider configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the path is unset.
    pub fn provider_config_path(&self) -> Result<Utf8PathBuf, ConfigError> {
        self.validate()?;
        Ok(Utf8PathBuf::from(
            self.provider_config.clone().unwrap_or_default(),
        ))
    }

    /// Build directory as a path.
    #[must_use]
    pub fn build_dir_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.build_dir)
    }

    /// SSH settings derived from this configuration.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            user: self.ssh_user.clone(),
            options: None,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
