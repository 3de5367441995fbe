use std::collections::BTreeMap;

use executor_core::config::Volumes;
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource, KeyToPath,
    PersistentVolumeClaimVolumeSource, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub const SCRIPTS_VOLUME: &str = "scripts";
pub const BUILDS_VOLUME: &str = "repo";

/// Scripts must be executable by whichever user the image runs as.
const SCRIPTS_MODE: i32 = 0o777;

fn mount(name: &str, mount_path: &str, sub_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        sub_path: Some(sub_path.to_string()).filter(|s| !s.is_empty()),
        read_only: Some(true).filter(|_| read_only),
        ..Default::default()
    }
}

fn key_to_path(items: &BTreeMap<String, String>) -> Option<Vec<KeyToPath>> {
    let items: Vec<KeyToPath> = items
        .iter()
        .map(|(key, path)| KeyToPath {
            key: key.clone(),
            path: path.clone(),
            ..Default::default()
        })
        .collect();
    Some(items).filter(|i| !i.is_empty())
}

/// Volumes and mounts shared by the build and helper containers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodVolumes {
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
}

impl PodVolumes {
    /// The scripts configmap and the builds directory, then the configured volumes.
    pub fn new(
        config_map: &str,
        scripts_dir: &str,
        builds_dir: &str,
        configured: &Volumes,
    ) -> Self {
        let mut out = Self::default();

        out.push(
            Volume {
                name: SCRIPTS_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.to_string(),
                    default_mode: Some(SCRIPTS_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            },
            mount(SCRIPTS_VOLUME, scripts_dir, "", false),
        );

        // a configured volume mounted on the builds dir replaces the default one
        let builds_configured = configured
            .host_paths
            .iter()
            .map(|v| v.mount_path.as_str())
            .chain(configured.pvcs.iter().map(|v| v.mount_path.as_str()))
            .chain(configured.empty_dirs.iter().map(|v| v.mount_path.as_str()))
            .chain(configured.csis.iter().map(|v| v.mount_path.as_str()))
            .any(|path| path == builds_dir);
        if !builds_configured {
            out.push(
                Volume {
                    name: BUILDS_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                mount(BUILDS_VOLUME, builds_dir, "", false),
            );
        }

        out.add_configured(configured);
        out
    }

    fn push(&mut self, volume: Volume, mount: VolumeMount) {
        self.volumes.push(volume);
        self.mounts.push(mount);
    }

    fn add_configured(&mut self, configured: &Volumes) {
        for v in &configured.host_paths {
            self.push(
                Volume {
                    name: v.name.clone(),
                    host_path: Some(HostPathVolumeSource {
                        path: v.host_path().to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                mount(&v.name, &v.mount_path, &v.sub_path, v.read_only),
            );
        }

        for v in &configured.pvcs {
            self.push(
                Volume {
                    name: v.name.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: v.name.clone(),
                        read_only: Some(v.read_only),
                    }),
                    ..Default::default()
                },
                mount(&v.name, &v.mount_path, &v.sub_path, v.read_only),
            );
        }

        for v in &configured.config_maps {
            self.push(
                Volume {
                    name: v.name.clone(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: v.name.clone(),
                        items: key_to_path(&v.items),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                mount(&v.name, &v.mount_path, &v.sub_path, v.read_only),
            );
        }

        for v in &configured.secrets {
            self.push(
                Volume {
                    name: v.name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(v.name.clone()),
                        items: key_to_path(&v.items),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                mount(&v.name, &v.mount_path, &v.sub_path, v.read_only),
            );
        }

        for v in &configured.empty_dirs {
            self.push(
                Volume {
                    name: v.name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some(v.medium.clone()).filter(|m| !m.is_empty()),
                        size_limit: Some(v.size_limit.clone())
                            .filter(|s| !s.is_empty())
                            .map(Quantity),
                    }),
                    ..Default::default()
                },
                mount(&v.name, &v.mount_path, &v.sub_path, false),
            );
        }

        for v in &configured.csis {
            self.push(
                Volume {
                    name: v.name.clone(),
                    csi: Some(CSIVolumeSource {
                        driver: v.driver.clone(),
                        fs_type: Some(v.fs_type.clone()).filter(|f| !f.is_empty()),
                        read_only: Some(v.read_only),
                        volume_attributes: Some(v.volume_attributes.clone())
                            .filter(|a| !a.is_empty()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                mount(&v.name, &v.mount_path, &v.sub_path, v.read_only),
            );
        }
    }
}
