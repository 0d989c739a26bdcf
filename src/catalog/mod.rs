//! Provider configuration: the blade catalog.
//!
//! The provider configuration is a JSON document describing the cloud
//! project, the virtual blade types and their instance counts, blade
//! interconnects, and declared secrets. [`ProviderConfig`] parses the parts
//! this crate needs into typed records and keeps the raw document for
//! [`ProviderConfig::get`]. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use serde_json::Value;

use crate::error::BladeError;

/// Directory under the build directory holding per-secret SSH key pairs.
pub const SSH_KEY_DIR_NAME: &str = "blade_ssh_keys";

/// One blade type entry under `virtual_blades`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BladeTypeConfig {
    /// Number of instances.
    pub count: usize,
    /// Hostname stem.
    pub hostname: Option<String>,
    /// Whether instance suffixes are appended; defaults to `count > 1`.
    pub add_hostname_suffix: Option<bool>,
    /// Separator between the hostname stem and the suffix.
    pub hostname_suffix_separator: String,
    /// Base classes exist only to be inherited from and are never deployed.
    pub pure_base_class: bool,
    /// Secret holding the SSH key pair for this type.
    pub ssh_key_secret: Option<String>,
    /// Interconnect the blades sit on.
    pub blade_interconnect: Option<BladeInterconnectConfig>,
}

/// The `blade_interconnect` block of a blade type.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BladeInterconnectConfig {
    /// Interconnect name.
    pub subnetwork: Option<String>,
    /// Per-instance IP addresses, indexed by instance.
    pub ip_addrs: Vec<String>,
}

/// One entry under `blade_interconnects`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InterconnectConfig {
    /// Network name that blade types refer to.
    pub network_name: Option<String>,
    /// IPv4 CIDR of the network.
    pub ipv4_cidr: Option<String>,
    /// Base classes are skipped.
    pub pure_base_class: bool,
}

/// One entry under `secrets`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SecretConfig {
    /// Secret name in the secret manager.
    pub name: Option<String>,
    /// Labels applied on creation.
    pub labels: BTreeMap<String, String>,
    /// Annotations applied on creation.
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct Organization {
    name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct Project {
    base_name: Option<String>,
    zone: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct Document {
    organization: Organization,
    project: Project,
    virtual_blades: BTreeMap<String, BladeTypeConfig>,
    blade_interconnects: BTreeMap<String, InterconnectConfig>,
    secrets: BTreeMap<String, SecretConfig>,
}

/// Parsed provider configuration.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    raw: Value,
    doc: Document,
}

impl ProviderConfig {
    /// Parses a configuration from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when a known section has the
    /// wrong shape.
    pub fn from_value(raw: Value) -> Result<Self, BladeError> {
        let doc = Document::deserialize(&raw)
            .map_err(|err| BladeError::config(format!("malformed provider config: {err}")))?;
        Ok(Self { raw, doc })
    }

    /// Parses a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the text is not valid JSON
    /// or a known section has the wrong shape.
    pub fn from_json_str(text: &str) -> Result<Self, BladeError> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|err| BladeError::config(format!("provider config is not JSON: {err}")))?;
        Self::from_value(raw)
    }

    /// Reads and parses the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, BladeError> {
        let text = read_file(path).map_err(|err| {
            BladeError::config(format!("cannot read provider config '{path}': {err}"))
        })?;
        Self::from_json_str(&text)
    }

    /// Raw value at a dotted `key` path such as `project.zone`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.raw, |value, segment| value.get(segment))
    }

    /// Raw value at `key`, or `default` when absent.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.get(key).unwrap_or(default)
    }

    /// Deployable blade type names in sorted order.
    #[must_use]
    pub fn blade_types(&self) -> Vec<String> {
        self.doc
            .virtual_blades
            .iter()
            .filter(|(_, blade)| !blade.pure_base_class)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Configuration of one deployable blade type.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown types and pure base
    /// classes.
    pub fn blade_type(&self, blade_type: &str) -> Result<&BladeTypeConfig, BladeError> {
        let blade = self.doc.virtual_blades.get(blade_type).ok_or_else(|| {
            BladeError::config(format!(
                "cannot find blade type '{blade_type}' in 'virtual_blades'"
            ))
        })?;
        if blade.pure_base_class {
            return Err(BladeError::config(format!(
                "blade type '{blade_type}' is a pure base class and has no instances"
            )));
        }
        Ok(blade)
    }

    /// Instance count of a blade type.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown types.
    pub fn blade_count(&self, blade_type: &str) -> Result<usize, BladeError> {
        Ok(self.blade_type(blade_type)?.count)
    }

    /// Hostname of one blade instance.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown types, missing
    /// hostnames, and out-of-range instances.
    pub fn blade_hostname(&self, blade_type: &str, instance: usize) -> Result<String, BladeError> {
        let blade = self.checked_instance(blade_type, instance)?;
        let stem = blade.hostname.as_deref().ok_or_else(|| {
            BladeError::config(format!(
                "blade type '{blade_type}' has no 'hostname' configured"
            ))
        })?;
        let add_suffix = blade.add_hostname_suffix.unwrap_or(blade.count > 1);
        if !add_suffix {
            return Ok(stem.to_owned());
        }
        Ok(format!(
            "{stem}{}{:03}",
            blade.hostname_suffix_separator,
            instance + 1
        ))
    }

    /// Interconnect names a blade type is attached to.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] for unknown types or a missing
    /// `blade_interconnect.subnetwork`.
    pub fn blade_interconnects(&self, blade_type: &str) -> Result<Vec<String>, BladeError> {
        let subnetwork = self
            .blade_type(blade_type)?
            .blade_interconnect
            .as_ref()
            .and_then(|interconnect| interconnect.subnetwork.clone())
            .ok_or_else(|| {
                BladeError::config(format!(
                    "blade type '{blade_type}' has no 'blade_interconnect.subnetwork'"
                ))
            })?;
        Ok(vec![subnetwork])
    }

    /// IP address of one blade instance on `interconnect`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the type is not on that
    /// interconnect or has no address for the instance.
    pub fn blade_ip(
        &self,
        blade_type: &str,
        instance: usize,
        interconnect: &str,
    ) -> Result<String, BladeError> {
        let blade = self.checked_instance(blade_type, instance)?;
        let attached = blade
            .blade_interconnect
            .as_ref()
            .filter(|config| config.subnetwork.as_deref() == Some(interconnect))
            .ok_or_else(|| {
                BladeError::config(format!(
                    "blade type '{blade_type}' is not attached to interconnect '{interconnect}'"
                ))
            })?;
        attached.ip_addrs.get(instance).cloned().ok_or_else(|| {
            BladeError::config(format!(
                "blade type '{blade_type}' lists {} IP addresses on '{interconnect}', \
                 none for instance {instance}",
                attached.ip_addrs.len()
            ))
        })
    }

    /// Name of the secret holding a blade type's SSH key pair.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when the type has no
    /// `ssh_key_secret`.
    pub fn blade_ssh_key_secret(&self, blade_type: &str) -> Result<String, BladeError> {
        self.blade_type(blade_type)?
            .ssh_key_secret
            .clone()
            .ok_or_else(|| {
                BladeError::config(format!(
                    "blade type '{blade_type}' has no 'ssh_key_secret'"
                ))
            })
    }

    /// Public and private key paths for `secret` under `build_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when `verify` is set and either
    /// file cannot be read.
    pub fn ssh_key_paths(
        build_dir: &Utf8Path,
        secret: &str,
        verify: bool,
    ) -> Result<(Utf8PathBuf, Utf8PathBuf), BladeError> {
        let dir = build_dir.join(SSH_KEY_DIR_NAME).join(secret);
        let public = dir.join("id_rsa.pub");
        let private = dir.join("id_rsa");
        if verify {
            for path in [&public, &private] {
                read_file(path).map_err(|err| {
                    BladeError::config(format!("cannot read SSH key file '{path}': {err}"))
                })?;
            }
        }
        Ok((public, private))
    }

    /// Names of deployable interconnect networks in sorted key order.
    #[must_use]
    pub fn interconnect_names(&self) -> Vec<String> {
        self.doc
            .blade_interconnects
            .values()
            .filter(|interconnect| !interconnect.pure_base_class)
            .filter_map(|interconnect| interconnect.network_name.clone())
            .collect()
    }

    /// IPv4 CIDR of the interconnect whose network name is `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when no interconnect has that
    /// name or it has no `ipv4_cidr`.
    pub fn ipv4_cidr(&self, name: &str) -> Result<String, BladeError> {
        let interconnect = self
            .doc
            .blade_interconnects
            .values()
            .find(|interconnect| interconnect.network_name.as_deref() == Some(name))
            .ok_or_else(|| {
                BladeError::config(format!("cannot find blade interconnect named '{name}'"))
            })?;
        interconnect.ipv4_cidr.clone().ok_or_else(|| {
            BladeError::config(format!("blade interconnect '{name}' has no 'ipv4_cidr'"))
        })
    }

    /// Compute zone of the project.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when `project.zone` is absent.
    pub fn zone(&self) -> Result<String, BladeError> {
        self.doc
            .project
            .zone
            .clone()
            .ok_or_else(|| BladeError::config("missing 'project.zone'"))
    }

    /// Project name, `<organization.name>-<project.base_name>`.
    ///
    /// # Errors
    ///
    /// Returns [`BladeError::Configuration`] when either part is absent.
    pub fn project_name(&self) -> Result<String, BladeError> {
        let organization = self
            .doc
            .organization
            .name
            .as_deref()
            .ok_or_else(|| BladeError::config("missing 'organization.name'"))?;
        let base = self
            .doc
            .project
            .base_name
            .as_deref()
            .ok_or_else(|| BladeError::config("missing 'project.base_name'"))?;
        Ok(format!("{organization}-{base}"))
    }

    /// Declared secrets keyed by secret name.
    #[must_use]
    pub fn secrets(&self) -> BTreeMap<String, SecretConfig> {
        self.doc
            .secrets
            .values()
            .filter_map(|secret| secret.name.clone().map(|name| (name, secret.clone())))
            .collect()
    }

    fn checked_instance(
        &self,
        blade_type: &str,
        instance: usize,
    ) -> Result<&BladeTypeConfig, BladeError> {
        let blade = self.blade_type(blade_type)?;
        if instance >= blade.count {
            return Err(BladeError::config(format!(
                "instance {instance} of blade type '{blade_type}' is out of range \
                 (count = {})",
                blade.count
            )));
        }
        Ok(blade)
    }
}

fn read_file(path: &Utf8Path) -> io::Result<String> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{path} has no file name"))
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read_to_string(file_name)
}
