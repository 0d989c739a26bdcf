//! Shared blade fixture for integration tests.
//!
//! Builds a [`VirtualBlades`] over scripted tunnel and process doubles with a
//! temporary build directory that already holds SSH key material. Reuse via:
//!
//! ```rust
//! #[path = "common/blade_fixture.rs"]
//! mod blade_fixture;
//! ```

use std::fs;
use std::sync::Arc;

use bladelink::VirtualBlades;
use bladelink::catalog::{ProviderConfig, SSH_KEY_DIR_NAME};
use bladelink::test_support::{ScriptedBroker, ScriptedLauncher};
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

/// A factory wired to scripted doubles, plus handles to inspect them.
pub struct BladeFixture {
    pub blades: VirtualBlades,
    pub broker: ScriptedBroker,
    pub launcher: ScriptedLauncher,
    pub build_dir: Utf8PathBuf,
    _temp: TempDir,
}

impl BladeFixture {
    /// Builds a fixture from provider JSON, writing keys for `secrets`.
    pub fn new(provider_json: &str, secrets: &[&str]) -> Self {
        Self::with_doubles(
            provider_json,
            secrets,
            ScriptedBroker::default(),
            ScriptedLauncher::default(),
        )
    }

    /// Builds a fixture around caller-supplied doubles.
    pub fn with_doubles(
        provider_json: &str,
        secrets: &[&str],
        broker: ScriptedBroker,
        launcher: ScriptedLauncher,
    ) -> Self {
        let temp = TempDir::new().expect("temp dir should be created");
        let build_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp dir path should be UTF-8");
        for secret in secrets {
            write_keys(&build_dir, secret);
        }
        let catalog =
            ProviderConfig::from_json_str(provider_json).expect("provider JSON should parse");
        let blades = VirtualBlades::new(
            catalog,
            build_dir.clone(),
            Arc::new(broker.clone()),
            Arc::new(launcher.clone()),
        );
        Self {
            blades,
            broker,
            launcher,
            build_dir,
            _temp: temp,
        }
    }
}

/// Writes a placeholder key pair for `secret` under `build_dir`.
pub fn write_keys(build_dir: &Utf8Path, secret: &str) {
    let dir = build_dir.join(SSH_KEY_DIR_NAME).join(secret);
    fs::create_dir_all(&dir).expect("key directory should be created");
    fs::write(dir.join("id_rsa"), "private").expect("private key should be written");
    fs::write(dir.join("id_rsa.pub"), "public").expect("public key should be written");
}
