use super::volumes::Volumes;
use crate::job::PullPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings for the Kubernetes executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// API server URL. Empty means the provider chain (in-cluster, then kubeconfig).
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default)]
    pub bearer_token_overwrite_allowed: bool,

    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub namespace_overwrite_allowed: String,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub service_account_overwrite_allowed: String,

    /// Image used when the job does not name one.
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default)]
    pub pull_policy: Vec<PullPolicy>,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_labels_overwrite_allowed: String,
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_annotations_overwrite_allowed: String,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector_overwrite_allowed: String,
    /// `key=value` (or bare `key`) mapped to a taint effect.
    #[serde(default)]
    pub node_tolerations: BTreeMap<String, String>,

    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub allow_privilege_escalation: Option<bool>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub pod_security_context: PodSecurityContext,

    #[serde(default)]
    pub dns_policy: String,
    #[serde(default)]
    pub dns_config: Option<DnsConfig>,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,

    #[serde(default)]
    pub volumes: Volumes,

    #[serde(default = "default_builds_dir")]
    pub builds_dir: String,
    #[serde(default)]
    pub scripts_base_dir: String,
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Seconds between pod status checks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default)]
    pub cleanup_grace_period_seconds: Option<i64>,
    /// Seconds allowed for deleting job resources.
    #[serde(default = "default_cleanup_resources_timeout")]
    pub cleanup_resources_timeout: u64,
    #[serde(default)]
    pub log_backoff: BackoffConfig,
    #[serde(default = "default_watcher_emit_timeout_ms")]
    pub watcher_emit_timeout_ms: u64,
    #[serde(default = "default_attach_retries")]
    pub attach_retries: u32,
}

/// Per container kind resource settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    #[serde(default)]
    pub build: ResourceSettings,
    #[serde(default)]
    pub helper: ResourceSettings,
    #[serde(default)]
    pub service: ResourceSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSettings {
    #[serde(default)]
    pub cpu: ResourcePair,
    #[serde(default)]
    pub memory: ResourcePair,
    #[serde(default)]
    pub ephemeral_storage: ResourcePair,
}

/// Default limit and request for one resource, plus the caps on job overwrites.
/// Quantities use Kubernetes notation (`500m`, `2Gi`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcePair {
    #[serde(default)]
    pub limit: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub limit_overwrite_max_allowed: String,
    #[serde(default)]
    pub request_overwrite_max_allowed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodSecurityContext {
    #[serde(default)]
    pub fs_group: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub run_as_non_root: Option<bool>,
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub supplemental_groups: Vec<i64>,
}

impl PodSecurityContext {
    pub fn is_empty(&self) -> bool {
        self.fs_group.is_none()
            && self.run_as_group.is_none()
            && self.run_as_non_root.is_none()
            && self.run_as_user.is_none()
            && self.supplemental_groups.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub options: Vec<DnsConfigOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsConfigOption {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

/// Exponential reconnect delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: default_backoff_min_ms(),
            max_ms: default_backoff_max_ms(),
            factor: default_backoff_factor(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_helper_image() -> String {
    "registry.gitlab.com/gitlab-org/gitlab-runner/gitlab-runner-helper:x86_64-latest".to_string()
}

fn default_builds_dir() -> String {
    "/builds".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_poll_interval() -> u64 {
    3
}

fn default_poll_attempts() -> u32 {
    180
}

fn default_cleanup_resources_timeout() -> u64 {
    300
}

fn default_watcher_emit_timeout_ms() -> u64 {
    1
}

fn default_attach_retries() -> u32 {
    5
}

fn default_backoff_min_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            ca_file: None,
            bearer_token: String::new(),
            bearer_token_overwrite_allowed: false,
            namespace: default_namespace(),
            namespace_overwrite_allowed: String::new(),
            service_account: String::new(),
            service_account_overwrite_allowed: String::new(),
            image: String::new(),
            helper_image: default_helper_image(),
            pull_policy: Vec::new(),
            image_pull_secrets: Vec::new(),
            resources: ResourceLimits::default(),
            pod_labels: BTreeMap::new(),
            pod_labels_overwrite_allowed: String::new(),
            pod_annotations: BTreeMap::new(),
            pod_annotations_overwrite_allowed: String::new(),
            node_selector: BTreeMap::new(),
            node_selector_overwrite_allowed: String::new(),
            node_tolerations: BTreeMap::new(),
            privileged: None,
            allow_privilege_escalation: None,
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            pod_security_context: PodSecurityContext::default(),
            dns_policy: String::new(),
            dns_config: None,
            host_aliases: Vec::new(),
            volumes: Volumes::default(),
            builds_dir: default_builds_dir(),
            scripts_base_dir: String::new(),
            shell: default_shell(),
            poll_interval: default_poll_interval(),
            poll_attempts: default_poll_attempts(),
            cleanup_grace_period_seconds: None,
            cleanup_resources_timeout: default_cleanup_resources_timeout(),
            log_backoff: BackoffConfig::default(),
            watcher_emit_timeout_ms: default_watcher_emit_timeout_ms(),
            attach_retries: default_attach_retries(),
        }
    }
}

impl KubernetesConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_resources_timeout)
    }

    pub fn watcher_emit_timeout(&self) -> Duration {
        Duration::from_millis(self.watcher_emit_timeout_ms)
    }
}
