mod kubernetes;
mod volumes;

pub use kubernetes::{
    BackoffConfig, DnsConfig, DnsConfigOption, HostAlias, KubernetesConfig, PodSecurityContext,
    ResourceLimits, ResourcePair, ResourceSettings,
};
pub use volumes::{
    ConfigMapVolume, CsiVolume, EmptyDirVolume, HostPathVolume, PvcVolume, SecretVolume, Volumes,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
/// Loaded from ~/.config/kube-job/config.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Where executor state snapshots are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StateConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("kube-job")
                .join("state")
        })
    }
}

impl Config {
    /// Load config from the default path, or return defaults when it does not exist.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("kube-job")
            .join("config.yaml")
    }
}
