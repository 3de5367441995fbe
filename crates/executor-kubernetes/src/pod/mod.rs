//! Translation of the job and executor settings into a pod and its companion objects.

pub mod host_aliases;
pub mod objects;
pub mod security;
pub mod volumes;

use std::collections::{BTreeMap, HashMap};

use executor_core::{Image, JobSpec, KubernetesConfig, Port, PullPolicy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostAlias as K8sHostAlias, LocalObjectReference, Pod,
    PodDNSConfig, PodDNSConfigOption, PodSpec, ResourceRequirements, Toleration, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tracing::warn;

use crate::dns::sanitize_label_value;
use crate::overwrites::{ContainerKind, Overwrites};
use crate::pull::{PullError, PullManager};
use crate::shell::{container_args, ScriptLayout};

pub use host_aliases::InvalidHostAliasError;

pub const BUILD_CONTAINER: &str = "build";
pub const HELPER_CONTAINER: &str = "helper";

pub const POD_LABEL: &str = "kube-job/pod";
pub const JOB_ID_LABEL: &str = "kube-job/job-id";
pub const PROJECT_ID_LABEL: &str = "kube-job/project-id";

pub fn service_container_name(index: usize) -> String {
    format!("svc-{}", index)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PodBuildError {
    #[error("no image specified and no default image configured")]
    MissingImage,

    #[error("dns_policy \"none\" requires dns_config to be set")]
    DnsConfigRequired,

    #[error(transparent)]
    HostAlias(#[from] InvalidHostAliasError),

    #[error(transparent)]
    Pull(#[from] PullError),
}

/// Labels that identify the job's pod across retries. Used by the watcher and the proxy services.
pub fn identifying_labels(job: &JobSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        POD_LABEL.to_string(),
        sanitize_label_value(&job.project_unique_name()),
    );
    labels.insert(JOB_ID_LABEL.to_string(), job.id.to_string());
    labels.insert(PROJECT_ID_LABEL.to_string(), job.project_id.to_string());
    labels
}

/// Map the configured DNS policy to the API value.
///
/// Empty means `ClusterFirst`; an unrecognised value leaves the field unset.
pub fn dns_policy(config: &KubernetesConfig) -> Result<Option<String>, PodBuildError> {
    let normalized = config.dns_policy.to_ascii_lowercase().replace(['-', '_'], "");
    let policy = match normalized.as_str() {
        "" | "clusterfirst" => "ClusterFirst",
        "clusterfirstwithhostnet" => "ClusterFirstWithHostNet",
        "default" => "Default",
        "none" => {
            if config.dns_config.is_none() {
                return Err(PodBuildError::DnsConfigRequired);
            }
            "None"
        }
        _ => {
            warn!("Unsupported DNS policy {:?}, leaving it unset", config.dns_policy);
            return Ok(None);
        }
    };
    Ok(Some(policy.to_string()))
}

fn dns_config(config: &KubernetesConfig) -> Option<PodDNSConfig> {
    let dns = config.dns_config.as_ref()?;
    Some(PodDNSConfig {
        nameservers: Some(dns.nameservers.clone()).filter(|n| !n.is_empty()),
        searches: Some(dns.searches.clone()).filter(|s| !s.is_empty()),
        options: Some(
            dns.options
                .iter()
                .map(|o| PodDNSConfigOption {
                    name: Some(o.name.clone()),
                    value: o.value.clone(),
                })
                .collect::<Vec<_>>(),
        )
        .filter(|o| !o.is_empty()),
    })
}

/// `key=value` tolerates a matching taint, a bare `key` any taint with that key.
fn tolerations(config: &KubernetesConfig) -> Option<Vec<Toleration>> {
    let tolerations: Vec<Toleration> = config
        .node_tolerations
        .iter()
        .map(|(key, effect)| {
            let (key, value) = match key.split_once('=') {
                Some((k, v)) => (k, Some(v.to_string())),
                None => (key.as_str(), None),
            };
            Toleration {
                key: Some(key.to_string()),
                operator: Some(if value.is_some() { "Equal" } else { "Exists" }.to_string()),
                value,
                effect: Some(effect.clone()).filter(|e| !e.is_empty()),
                ..Default::default()
            }
        })
        .collect();
    Some(tolerations).filter(|t| !t.is_empty())
}

/// Image entrypoint becomes the container command; the image command, or
/// the default when there is none, becomes its arguments.
fn command_and_args(
    image: &Image,
    default_args: Vec<String>,
) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let command = Some(image.entrypoint.clone()).filter(|c| !c.is_empty());
    let args = if image.command.is_empty() {
        default_args
    } else {
        image.command.clone()
    };
    (command, Some(args).filter(|a| !a.is_empty()))
}

fn container_ports(ports: &[Port]) -> Option<Vec<ContainerPort>> {
    let ports: Vec<ContainerPort> = ports
        .iter()
        .map(|p| ContainerPort {
            container_port: p.number,
            ..Default::default()
        })
        .collect();
    Some(ports).filter(|p| !p.is_empty())
}

fn resources(requirements: &ResourceRequirements) -> Option<ResourceRequirements> {
    Some(requirements.clone()).filter(|r| r.limits.is_some() || r.requests.is_some())
}

/// A container that exposes ports through a proxy service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedContainer {
    pub name: String,
    pub ports: Vec<Port>,
}

/// Builds the job's pod. Everything that can be checked without the cluster is checked in [`PodBuilder::new`].
#[derive(Debug, Clone)]
pub struct PodBuilder {
    config: KubernetesConfig,
    overwrites: Overwrites,
    job: JobSpec,
    build_image: Image,
    layout: ScriptLayout,
    dns_policy: Option<String>,
    host_aliases: Option<Vec<K8sHostAlias>>,
}

impl PodBuilder {
    pub fn new(
        config: &KubernetesConfig,
        overwrites: &Overwrites,
        job: &JobSpec,
        host_aliases_supported: bool,
    ) -> Result<Self, PodBuildError> {
        let mut build_image = job.image.clone();
        if build_image.name.is_empty() {
            build_image.name = config.image.clone();
        }
        if build_image.name.is_empty() {
            return Err(PodBuildError::MissingImage);
        }

        let host_aliases = if host_aliases_supported {
            host_aliases::host_aliases(&job.services, &config.host_aliases)?
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            overwrites: overwrites.clone(),
            job: job.clone(),
            build_image,
            layout: ScriptLayout::new(&config.scripts_base_dir, job.project_id, job.id),
            dns_policy: dns_policy(config)?,
            host_aliases,
        })
    }

    pub fn layout(&self) -> &ScriptLayout {
        &self.layout
    }

    pub fn namespace(&self) -> &str {
        &self.overwrites.namespace
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        identifying_labels(&self.job)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.overwrites.pod_labels.clone();
        labels.extend(self.selector_labels());
        labels
    }

    /// Pull policies per container, the job's own list winning over the configured one.
    pub fn pull_policies(&self) -> HashMap<String, Vec<PullPolicy>> {
        let pick = |image: &Image| {
            if image.pull_policies.is_empty() {
                self.config.pull_policy.clone()
            } else {
                image.pull_policies.clone()
            }
        };

        let mut policies = HashMap::new();
        policies.insert(BUILD_CONTAINER.to_string(), pick(&self.build_image));
        policies.insert(HELPER_CONTAINER.to_string(), self.config.pull_policy.clone());
        for (i, service) in self.job.services.iter().enumerate() {
            policies.insert(service_container_name(i), pick(service));
        }
        policies
    }

    /// Containers with ports, named by their first alias. Without one the build
    /// container is `build` and a service is `proxy-<container>`.
    pub fn proxied_containers(&self) -> Vec<ProxiedContainer> {
        let build = (BUILD_CONTAINER.to_string(), &self.build_image);
        let services = self
            .job
            .services
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("proxy-{}", service_container_name(i)), s));

        std::iter::once(build)
            .chain(services)
            .filter(|(_, image)| !image.ports.is_empty())
            .map(|(container, image)| ProxiedContainer {
                name: image
                    .aliases()
                    .first()
                    .map(|a| a.to_string())
                    .unwrap_or(container),
                ports: image.ports.clone(),
            })
            .collect()
    }

    pub fn build(
        &self,
        name: &str,
        config_map: &str,
        credentials: Option<&str>,
        pull: &PullManager,
    ) -> Result<Pod, PodBuildError> {
        let volumes = volumes::PodVolumes::new(
            config_map,
            self.layout.dir(),
            &self.config.builds_dir,
            &self.config.volumes,
        );

        let mut containers = vec![
            self.container(
                BUILD_CONTAINER,
                &self.build_image,
                ContainerKind::Build,
                container_args(),
                Some(&volumes.mounts),
                pull,
            )?,
            self.container(
                HELPER_CONTAINER,
                &Image::new(self.config.helper_image.clone()),
                ContainerKind::Helper,
                container_args(),
                Some(&volumes.mounts),
                pull,
            )?,
        ];

        for (i, service) in self.job.services.iter().enumerate() {
            containers.push(self.container(
                &service_container_name(i),
                service,
                ContainerKind::Service,
                Vec::new(),
                None,
                pull,
            )?);
        }

        let mut pull_secrets: Vec<LocalObjectReference> = self
            .config
            .image_pull_secrets
            .iter()
            .map(|s| LocalObjectReference { name: s.clone() })
            .collect();
        if let Some(secret) = credentials {
            pull_secrets.push(LocalObjectReference {
                name: secret.to_string(),
            });
        }

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.overwrites.namespace.clone()),
                labels: Some(self.labels()),
                annotations: Some(self.overwrites.pod_annotations.clone())
                    .filter(|a| !a.is_empty()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers,
                volumes: Some(volumes.volumes),
                service_account_name: Some(self.overwrites.service_account.clone())
                    .filter(|s| !s.is_empty()),
                node_selector: Some(self.overwrites.node_selector.clone())
                    .filter(|n| !n.is_empty()),
                tolerations: tolerations(&self.config),
                image_pull_secrets: Some(pull_secrets).filter(|s| !s.is_empty()),
                security_context: security::pod_security_context(&self.config),
                host_aliases: self.host_aliases.clone(),
                dns_policy: self.dns_policy.clone(),
                dns_config: dns_config(&self.config),
                active_deadline_seconds: self
                    .job
                    .timeout
                    .map(|t| i64::try_from(t).unwrap_or(i64::MAX).saturating_add(1)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn container(
        &self,
        name: &str,
        image: &Image,
        kind: ContainerKind,
        default_args: Vec<String>,
        mounts: Option<&[VolumeMount]>,
        pull: &PullManager,
    ) -> Result<Container, PodBuildError> {
        let (command, args) = command_and_args(image, default_args);
        let env: Vec<EnvVar> = self
            .job
            .variables
            .public_or_internal()
            .iter()
            .map(|v| EnvVar {
                name: v.key.clone(),
                value: Some(v.value.clone()),
                ..Default::default()
            })
            .collect();
        let interactive = kind != ContainerKind::Service;

        Ok(Container {
            name: name.to_string(),
            image: Some(image.name.clone()),
            image_pull_policy: pull.policy_for(name)?.map(|p| p.as_k8s().to_string()),
            command,
            args,
            env: Some(env).filter(|e| !e.is_empty()),
            resources: resources(self.overwrites.resources(kind)),
            volume_mounts: mounts.map(|m| m.to_vec()),
            ports: container_ports(&image.ports),
            security_context: Some(security::container_security_context(&self.config)),
            stdin: Some(interactive),
            ..Default::default()
        })
    }
}
