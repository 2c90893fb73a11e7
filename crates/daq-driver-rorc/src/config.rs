//! Driver configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `RORC_` (e.g. `RORC_ROOT_DIR`)
//!
//! # Example
//! ```toml
//! root_dir = "/dev/shm/rorc"
//! backend = "auto"
//! sysfs_root = "/sys"
//! ```

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::backend::BackendSelection;
use crate::error::{Result, RorcError};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "RORC_";

/// Channel factory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RorcConfig {
    /// Root directory of the per-channel state, FIFO, buffer and lock files
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Backend selection policy
    #[serde(default)]
    pub backend: BackendSelection,

    /// Where PCI discovery looks for `bus/pci/devices`
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/dev/shm/rorc")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

impl Default for RorcConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            backend: BackendSelection::default(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

impl RorcConfig {
    /// Defaults overridden by `RORC_` environment variables.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the TOML file at `path` (skipped if absent), then the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(RorcError::invalid_argument("root_dir must not be empty"));
        }
        if self.sysfs_root.as_os_str().is_empty() {
            return Err(RorcError::invalid_argument("sysfs_root must not be empty"));
        }
        Ok(())
    }

    /// Use a different artifact root.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    /// Use a different backend selection.
    pub fn with_backend(mut self, backend: BackendSelection) -> Self {
        self.backend = backend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for key in ["RORC_ROOT_DIR", "RORC_BACKEND", "RORC_SYSFS_ROOT"] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = RorcConfig::load().unwrap();
        assert_eq!(config, RorcConfig::default());
        assert_eq!(config.root_dir, PathBuf::from("/dev/shm/rorc"));
        assert_eq!(config.backend, BackendSelection::Auto);
    }

    #[test]
    #[serial]
    fn test_toml_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rorc.toml");
        std::fs::write(&path, "root_dir = \"/tmp/rorc-test\"\nbackend = \"dummy\"\n").unwrap();

        let config = RorcConfig::load_from(&path).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/tmp/rorc-test"));
        assert_eq!(config.backend, BackendSelection::Dummy);
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rorc.toml");
        std::fs::write(&path, "backend = \"dummy\"\n").unwrap();

        env::set_var("RORC_BACKEND", "hardware");
        env::set_var("RORC_ROOT_DIR", "/tmp/from-env");
        let config = RorcConfig::load_from(&path);
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.backend, BackendSelection::Hardware);
        assert_eq!(config.root_dir, PathBuf::from("/tmp/from-env"));
    }

    #[test]
    #[serial]
    fn test_invalid_values() {
        clear_env();
        env::set_var("RORC_BACKEND", "fpga");
        let result = RorcConfig::load();
        clear_env();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);

        let empty = RorcConfig::default().with_root_dir("");
        assert!(empty.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_serialized_config_loads_back() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rorc.toml");
        let config = RorcConfig::default()
            .with_root_dir(dir.path().join("state"))
            .with_backend(BackendSelection::Hardware);
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        assert_eq!(RorcConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        clear_env();
        let config = RorcConfig::load_from("/nonexistent/rorc.toml").unwrap();
        assert_eq!(config, RorcConfig::default());
    }
}
