use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// User-declared volumes mounted into the build, helper and service containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volumes {
    #[serde(default)]
    pub host_paths: Vec<HostPathVolume>,
    #[serde(default)]
    pub pvcs: Vec<PvcVolume>,
    #[serde(default)]
    pub config_maps: Vec<ConfigMapVolume>,
    #[serde(default)]
    pub secrets: Vec<SecretVolume>,
    #[serde(default)]
    pub empty_dirs: Vec<EmptyDirVolume>,
    #[serde(default)]
    pub csis: Vec<CsiVolume>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostPathVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    /// Path on the node; defaults to `mount_path`.
    #[serde(default)]
    pub host_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PvcVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMapVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    /// Key to path projections.
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmptyDirVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub size_limit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsiVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    pub driver: String,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub volume_attributes: BTreeMap<String, String>,
}

impl HostPathVolume {
    pub fn host_path(&self) -> &str {
        if self.host_path.is_empty() {
            &self.mount_path
        } else {
            &self.host_path
        }
    }
}

impl Volumes {
    pub fn is_empty(&self) -> bool {
        self.host_paths.is_empty()
            && self.pvcs.is_empty()
            && self.config_maps.is_empty()
            && self.secrets.is_empty()
            && self.empty_dirs.is_empty()
            && self.csis.is_empty()
    }
}
