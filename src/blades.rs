//! Entry point for connecting to the virtual blades of a provider.
//!
//! [`VirtualBlades`] binds the blade catalog to the machinery that reaches
//! the blades: the tunnel broker, the subprocess launcher, SSH settings, and
//! the connect retry policy. Callers normally build it once from
//! [`ConnectConfig`] and then open single connections or whole sets.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::catalog::ProviderConfig;
use crate::config::ConnectConfig;
use crate::error::BladeError;
use crate::process::{ProcessLauncher, TokioProcessLauncher};
use crate::set::ConnectionSet;
use crate::ssh::{SshConnection, SshSettings};
use crate::tunnel::{BladeConnection, BladeTarget, ConnectPolicy, IapTunnelBroker, TunnelBroker};

/// Remote port used by [`VirtualBlades::ssh_connect_blade`].
pub const SSH_PORT: u16 = 22;

/// Connection factory for the blades described by a provider configuration.
pub struct VirtualBlades {
    catalog: ProviderConfig,
    build_dir: Utf8PathBuf,
    broker: Arc<dyn TunnelBroker>,
    launcher: Arc<dyn ProcessLauncher>,
    ssh: SshSettings,
    policy: ConnectPolicy,
}

impl std::fmt::Debug for VirtualBlades {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBlades")
            .field("build_dir", &self.build_dir)
            .field("ssh", &self.ssh)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl VirtualBlades {
    /// Creates a factory from explicit parts.
    #[must_use]
    pub fn new(
        catalog: ProviderConfig,
        build_dir: impl Into<Utf8PathBuf>,
        broker: Arc<dyn TunnelBroker>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            catalog,
            build_dir: build_dir.into(),
            broker,
            launcher,
            ssh: SshSettings::default(),
            policy: ConnectPolicy::default(),
        }
    }

    /// Builds a factory that tunnels through `gcloud` and runs real
    /// subprocesses.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the settings are
    /// incomplete or the provider configuration cannot be loaded.
    pub fn from_config(config: &ConnectConfig) -> Result<Self, BladeError> {
        let path = config
            .provider_config_path()
            .map_err(|err| BladeError::config(err.to_string()))?;
        let catalog = ProviderConfig::load(&path)?;
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(TokioProcessLauncher);
        let broker = IapTunnelBroker::new(
            config.gcloud_bin.clone(),
            catalog.project_name()?,
            catalog.zone()?,
        )
        .with_launcher(Arc::clone(&launcher))
        .with_build_dir(config.build_dir_path());
        Ok(Self::new(catalog, config.build_dir_path(), Arc::new(broker), launcher)
            .with_ssh_settings(config.ssh_settings()))
    }

    /// Replaces the SSH settings.
    #[must_use]
    pub fn with_ssh_settings(mut self, settings: SshSettings) -> Self {
        self.ssh = settings;
        self
    }

    /// Replaces the connect retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The underlying catalog.
    #[must_use]
    pub const fn catalog(&self) -> &ProviderConfig {
        &self.catalog
    }

    /// Build directory receiving logs and keys.
    #[must_use]
    pub fn build_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    /// Deployable blade type names in sorted order.
    #[must_use]
    pub fn blade_types(&self) -> Vec<String> {
        self.catalog.blade_types()
    }

    /// Instance count of a blade type.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown types.
    pub fn blade_count(&self, blade_type: &str) -> Result<usize, BladeError> {
        self.catalog.blade_count(blade_type)
    }

    /// Interconnect names a blade type is attached to.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown or unattached types.
    pub fn blade_interconnects(&self, blade_type: &str) -> Result<Vec<String>, BladeError> {
        self.catalog.blade_interconnects(blade_type)
    }

    /// Hostname of one blade instance.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown types and
    /// out-of-range instances.
    pub fn blade_hostname(&self, blade_type: &str, instance: usize) -> Result<String, BladeError> {
        self.catalog.blade_hostname(blade_type, instance)
    }

    /// IP address of one blade instance on an interconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when no address is configured.
    pub fn blade_ip(
        &self,
        blade_type: &str,
        instance: usize,
        interconnect: &str,
    ) -> Result<String, BladeError> {
        self.catalog.blade_ip(blade_type, instance, interconnect)
    }

    /// Name of the secret holding a blade type's SSH key pair.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when none is configured.
    pub fn blade_ssh_key_secret(&self, blade_type: &str) -> Result<String, BladeError> {
        self.catalog.blade_ssh_key_secret(blade_type)
    }

    /// Public and private SSH key paths of a blade type, checked for
    /// readability.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the secret is not
    /// configured or the key files cannot be read.
    pub fn blade_ssh_key_paths(
        &self,
        blade_type: &str,
    ) -> Result<(Utf8PathBuf, Utf8PathBuf), BladeError> {
        let secret = self.blade_ssh_key_secret(blade_type)?;
        ProviderConfig::ssh_key_paths(&self.build_dir, &secret, true)
    }

    /// Interconnect networks of the catalog.
    #[must_use]
    pub const fn interconnects(&self) -> BladeInterconnects<'_> {
        BladeInterconnects {
            catalog: &self.catalog,
        }
    }

    /// Opens a tunnel to `remote_port` on one blade instance.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown blades, and the
    /// tunnel errors of [`BladeConnection::connect`].
    pub async fn connect_blade(
        &self,
        blade_type: &str,
        instance: usize,
        remote_port: u16,
    ) -> Result<BladeConnection, BladeError> {
        let target = BladeTarget {
            blade_type: blade_type.to_owned(),
            instance,
            hostname: self.blade_hostname(blade_type, instance)?,
            remote_port,
        };
        BladeConnection::connect(target, self.broker.as_ref(), &self.build_dir, self.policy).await
    }

    /// Opens tunnels to `remote_port` on every instance of the selected
    /// blade types, or of all types for `None`.
    ///
    /// Tunnels open one at a time, types in catalog order and instances
    /// ascending. If any fails, those already open are torn down.
    ///
    /// # Errors
    ///
    /// Returns the first connection error.
    pub async fn connect_blades(
        &self,
        remote_port: u16,
        blade_types: Option<&[String]>,
    ) -> Result<ConnectionSet<BladeConnection>, BladeError> {
        let mut connections = Vec::new();
        for (blade_type, instance) in self.selected_instances(blade_types)? {
            connections.push(self.connect_blade(&blade_type, instance, remote_port).await?);
        }
        info!(members = connections.len(), remote_port, "opened connection set");
        Ok(ConnectionSet::new(connections))
    }

    /// Opens an SSH connection to one blade instance.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the blade type has no
    /// readable SSH key, and the tunnel errors of
    /// [`BladeConnection::connect`].
    pub async fn ssh_connect_blade(
        &self,
        blade_type: &str,
        instance: usize,
        remote_port: Option<u16>,
    ) -> Result<SshConnection, BladeError> {
        let (_, private_key) = self.blade_ssh_key_paths(blade_type)?;
        let base = self
            .connect_blade(blade_type, instance, remote_port.unwrap_or(SSH_PORT))
            .await?;
        Ok(SshConnection::new(
            base,
            private_key,
            self.ssh.clone(),
            self.build_dir.clone(),
            Arc::clone(&self.launcher),
        ))
    }

    /// Opens SSH connections to every instance of the selected blade types.
    ///
    /// # Errors
    ///
    /// Returns the first connection error; connections already open are
    /// torn down.
    pub async fn ssh_connect_blades(
        &self,
        blade_types: Option<&[String]>,
        remote_port: Option<u16>,
    ) -> Result<ConnectionSet<SshConnection>, BladeError> {
        let mut connections = Vec::new();
        for (blade_type, instance) in self.selected_instances(blade_types)? {
            connections.push(
                self.ssh_connect_blade(&blade_type, instance, remote_port)
                    .await?,
            );
        }
        info!(members = connections.len(), "opened SSH connection set");
        Ok(ConnectionSet::new(connections))
    }

    fn selected_instances(
        &self,
        blade_types: Option<&[String]>,
    ) -> Result<Vec<(String, usize)>, BladeError> {
        let types = blade_types.map_or_else(|| self.blade_types(), <[String]>::to_vec);
        let mut selected = Vec::new();
        for blade_type in types {
            let count = self.blade_count(&blade_type)?;
            selected.extend((0..count).map(|instance| (blade_type.clone(), instance)));
        }
        Ok(selected)
    }
}

/// Read-only view of the blade interconnect networks.
#[derive(Clone, Copy, Debug)]
pub struct BladeInterconnects<'a> {
    catalog: &'a ProviderConfig,
}

impl BladeInterconnects<'_> {
    /// Deployable interconnect network names.
    #[must_use]
    pub fn interconnect_names(&self) -> Vec<String> {
        self.catalog.interconnect_names()
    }

    /// IPv4 CIDR of a named interconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown interconnects.
    pub fn ipv4_cidr(&self, name: &str) -> Result<String, BladeError> {
        self.catalog.ipv4_cidr(name)
    }
}
