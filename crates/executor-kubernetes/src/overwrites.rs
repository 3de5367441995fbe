//! Per-job overrides of executor settings, taken from job variables.
//!
//! A setting can only be overridden when the operator configured an allow-list
//! for it; the value must then match that regex. Resource overrides must stay
//! under the configured maximum.

use std::collections::BTreeMap;
use std::fmt;

use executor_core::config::{ResourcePair, ResourceSettings};
use executor_core::{JobTrace, JobVariables, KubernetesConfig};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::dns::sanitize_label_value;
use crate::quantity::{Quantity, QuantityError};

pub const NAMESPACE_OVERWRITE_VARIABLE: &str = "KUBERNETES_NAMESPACE_OVERWRITE";
pub const SERVICE_ACCOUNT_OVERWRITE_VARIABLE: &str = "KUBERNETES_SERVICE_ACCOUNT_OVERWRITE";
pub const BEARER_TOKEN_OVERWRITE_VARIABLE: &str = "KUBERNETES_BEARER_TOKEN";
pub const POD_ANNOTATIONS_OVERWRITE_PREFIX: &str = "KUBERNETES_POD_ANNOTATIONS_";
pub const POD_LABELS_OVERWRITE_PREFIX: &str = "KUBERNETES_POD_LABELS_";
pub const NODE_SELECTOR_OVERWRITE_PREFIX: &str = "KUBERNETES_NODE_SELECTOR_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverwriteError {
    #[error("Provided value {value:?} does not match regex {regex:?}")]
    NoMatch { value: String, regex: String },

    #[error("invalid overwrite regex {regex:?}: {message}")]
    InvalidRegex { regex: String, message: String },

    #[error("Provided value {0:?} is malformed, does not match k=v")]
    Malformed(String),

    #[error("{variable} value {value:?} is above the allowed maximum {max:?}")]
    AboveMax {
        variable: String,
        value: String,
        max: String,
    },

    #[error(transparent)]
    Quantity(#[from] QuantityError),
}

/// Which container a resource setting applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Build,
    Helper,
    Service,
}

impl ContainerKind {
    fn variable_prefix(&self) -> &'static str {
        match self {
            ContainerKind::Build => "KUBERNETES_",
            ContainerKind::Helper => "KUBERNETES_HELPER_",
            ContainerKind::Service => "KUBERNETES_SERVICE_",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Build => write!(f, "build"),
            ContainerKind::Helper => write!(f, "helper"),
            ContainerKind::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Cpu,
    Memory,
    EphemeralStorage,
}

impl Resource {
    const ALL: [Resource; 3] = [Resource::Cpu, Resource::Memory, Resource::EphemeralStorage];

    fn key(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::EphemeralStorage => "ephemeral-storage",
        }
    }

    fn variable_part(&self) -> &'static str {
        match self {
            Resource::Cpu => "CPU",
            Resource::Memory => "MEMORY",
            Resource::EphemeralStorage => "EPHEMERAL_STORAGE",
        }
    }

    fn pair<'a>(&self, settings: &'a ResourceSettings) -> &'a ResourcePair {
        match self {
            Resource::Cpu => &settings.cpu,
            Resource::Memory => &settings.memory,
            Resource::EphemeralStorage => &settings.ephemeral_storage,
        }
    }
}

/// Settings after applying the job's overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overwrites {
    pub namespace: String,
    pub service_account: String,
    pub bearer_token: String,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub build_resources: ResourceRequirements,
    pub helper_resources: ResourceRequirements,
    pub service_resources: ResourceRequirements,
}

impl Overwrites {
    pub fn resolve(
        config: &KubernetesConfig,
        variables: &JobVariables,
        trace: &dyn JobTrace,
    ) -> Result<Self, OverwriteError> {
        let expanded = variables.expand();
        let resolver = Resolver { trace };

        let namespace = resolver.scalar(
            "Namespace",
            &config.namespace,
            &config.namespace_overwrite_allowed,
            expanded.value(NAMESPACE_OVERWRITE_VARIABLE),
        )?;

        let service_account = resolver.scalar(
            "ServiceAccount",
            &config.service_account,
            &config.service_account_overwrite_allowed,
            expanded.value(SERVICE_ACCOUNT_OVERWRITE_VARIABLE),
        )?;

        let bearer_regex = if config.bearer_token_overwrite_allowed {
            ".+"
        } else {
            ""
        };
        let bearer_token = resolver.scalar(
            "BearerToken",
            &config.bearer_token,
            bearer_regex,
            expanded.value(BEARER_TOKEN_OVERWRITE_VARIABLE),
        )?;

        let pod_labels = resolver
            .map(
                "PodLabels",
                &config.pod_labels,
                &config.pod_labels_overwrite_allowed,
                variables,
                POD_LABELS_OVERWRITE_PREFIX,
            )?
            .into_iter()
            .map(|(k, v)| (k, sanitize_label_value(&v)))
            .collect();

        let pod_annotations = resolver.map(
            "PodAnnotations",
            &config.pod_annotations,
            &config.pod_annotations_overwrite_allowed,
            variables,
            POD_ANNOTATIONS_OVERWRITE_PREFIX,
        )?;

        let node_selector = resolver.map(
            "NodeSelector",
            &config.node_selector,
            &config.node_selector_overwrite_allowed,
            variables,
            NODE_SELECTOR_OVERWRITE_PREFIX,
        )?;

        let resources = &config.resources;
        Ok(Self {
            namespace,
            service_account,
            bearer_token,
            pod_labels,
            pod_annotations,
            node_selector,
            build_resources: resolver.resources(ContainerKind::Build, &resources.build, &expanded)?,
            helper_resources: resolver.resources(
                ContainerKind::Helper,
                &resources.helper,
                &expanded,
            )?,
            service_resources: resolver.resources(
                ContainerKind::Service,
                &resources.service,
                &expanded,
            )?,
        })
    }

    pub fn resources(&self, kind: ContainerKind) -> &ResourceRequirements {
        match kind {
            ContainerKind::Build => &self.build_resources,
            ContainerKind::Helper => &self.helper_resources,
            ContainerKind::Service => &self.service_resources,
        }
    }
}

struct Resolver<'a> {
    trace: &'a dyn JobTrace,
}

impl Resolver<'_> {
    fn scalar(
        &self,
        field: &str,
        default: &str,
        regex: &str,
        value: &str,
    ) -> Result<String, OverwriteError> {
        if regex.is_empty() {
            debug!("Regex allowing overrides for {} is empty, disabling override.", field);
            return Ok(default.to_string());
        }

        if value.is_empty() {
            return Ok(default.to_string());
        }

        check_regex(regex, value)?;

        let shown = if field == "BearerToken" {
            "XXXXXXXX..."
        } else {
            value
        };
        self.announce(&format!("{:?} overwritten with {:?}", field, shown));

        Ok(value.to_string())
    }

    fn map(
        &self,
        field: &str,
        defaults: &BTreeMap<String, String>,
        regex: &str,
        variables: &JobVariables,
        prefix: &str,
    ) -> Result<BTreeMap<String, String>, OverwriteError> {
        if regex.is_empty() {
            debug!("Regex allowing overrides for {} is empty, disabling override.", field);
            return Ok(defaults.clone());
        }

        let mut values = defaults.clone();
        for variable in variables.with_prefix(prefix) {
            check_regex(regex, &variable.value)?;
            let (key, value) = split_key_value(&variable.value)?;
            self.announce(&format!("{:?} {:?} overwritten with {:?}", field, key, value));
            values.insert(key.to_string(), value.to_string());
        }
        Ok(values)
    }

    fn resources(
        &self,
        kind: ContainerKind,
        settings: &ResourceSettings,
        variables: &JobVariables,
    ) -> Result<ResourceRequirements, OverwriteError> {
        let mut limits = BTreeMap::new();
        let mut requests = BTreeMap::new();

        for resource in Resource::ALL {
            let pair = resource.pair(settings);
            let base = format!("{}{}", kind.variable_prefix(), resource.variable_part());

            let limit = self.quantity(
                &format!("{}_LIMIT", base),
                &pair.limit,
                &pair.limit_overwrite_max_allowed,
                variables,
            )?;
            if let Some(limit) = limit {
                limits.insert(resource.key().to_string(), K8sQuantity::from(&limit));
            }

            let request = self.quantity(
                &format!("{}_REQUEST", base),
                &pair.request,
                &pair.request_overwrite_max_allowed,
                variables,
            )?;
            if let Some(request) = request {
                requests.insert(resource.key().to_string(), K8sQuantity::from(&request));
            }
        }

        Ok(ResourceRequirements {
            limits: Some(limits).filter(|m| !m.is_empty()),
            requests: Some(requests).filter(|m| !m.is_empty()),
            ..Default::default()
        })
    }

    fn quantity(
        &self,
        variable: &str,
        default: &str,
        max: &str,
        variables: &JobVariables,
    ) -> Result<Option<Quantity>, OverwriteError> {
        let default = if default.is_empty() {
            None
        } else {
            Some(Quantity::parse(default)?)
        };

        let value = variables.value(variable);
        if max.is_empty() || value.is_empty() {
            return Ok(default);
        }

        let max_quantity = Quantity::parse(max)?;
        let requested = Quantity::parse(value)?;
        if requested > max_quantity {
            return Err(OverwriteError::AboveMax {
                variable: variable.to_string(),
                value: value.to_string(),
                max: max.to_string(),
            });
        }

        self.announce(&format!("{:?} overwritten with {:?}", variable, value));
        Ok(Some(requested))
    }

    fn announce(&self, message: &str) {
        info!("{}", message);
        self.trace.notice(message);
    }
}

fn check_regex(regex: &str, value: &str) -> Result<(), OverwriteError> {
    let re = Regex::new(regex).map_err(|e| OverwriteError::InvalidRegex {
        regex: regex.to_string(),
        message: e.to_string(),
    })?;

    if re.is_match(value) {
        Ok(())
    } else {
        Err(OverwriteError::NoMatch {
            value: value.to_string(),
            regex: regex.to_string(),
        })
    }
}

/// Split on the first `=`.
fn split_key_value(value: &str) -> Result<(&str, &str), OverwriteError> {
    value
        .split_once('=')
        .ok_or_else(|| OverwriteError::Malformed(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_core::{BufferTrace, JobVariable};

    fn vars(pairs: &[(&str, &str)]) -> JobVariables {
        pairs.iter().map(|(k, v)| JobVariable::new(*k, *v)).collect()
    }

    fn resolve(config: &KubernetesConfig, variables: &JobVariables) -> Result<Overwrites, OverwriteError> {
        Overwrites::resolve(config, variables, &BufferTrace::new())
    }

    fn quantity(req: &ResourceRequirements, bound: &str, key: &str) -> Option<String> {
        let map = if bound == "limits" { &req.limits } else { &req.requests };
        map.as_ref()
            .and_then(|m| m.get(key))
            .map(|q| q.0.clone())
    }

    #[test]
    fn empty_allow_lists_ignore_every_variable() {
        let config = KubernetesConfig {
            namespace: "ci".into(),
            service_account: "runner".into(),
            bearer_token: "configured".into(),
            ..KubernetesConfig::default()
        };
        let variables = vars(&[
            (NAMESPACE_OVERWRITE_VARIABLE, "other"),
            (SERVICE_ACCOUNT_OVERWRITE_VARIABLE, "admin"),
            (BEARER_TOKEN_OVERWRITE_VARIABLE, "stolen"),
            ("KUBERNETES_POD_ANNOTATIONS_1", "a=b"),
            ("KUBERNETES_CPU_LIMIT", "64"),
        ]);

        let o = resolve(&config, &variables).unwrap();
        assert_eq!(o.namespace, "ci");
        assert_eq!(o.service_account, "runner");
        assert_eq!(o.bearer_token, "configured");
        assert!(o.pod_annotations.is_empty());
        assert_eq!(o.build_resources, ResourceRequirements::default());
    }

    #[test]
    fn matching_values_are_applied() {
        let config = KubernetesConfig {
            namespace_overwrite_allowed: "^ci-.*$".into(),
            service_account_overwrite_allowed: ".*".into(),
            bearer_token_overwrite_allowed: true,
            ..KubernetesConfig::default()
        };
        let variables = vars(&[
            ("BRANCH", "feature"),
            (NAMESPACE_OVERWRITE_VARIABLE, "ci-$BRANCH"),
            (SERVICE_ACCOUNT_OVERWRITE_VARIABLE, "deployer"),
            (BEARER_TOKEN_OVERWRITE_VARIABLE, "token-123"),
        ]);

        let trace = BufferTrace::new();
        let o = Overwrites::resolve(&config, &variables, &trace).unwrap();
        assert_eq!(o.namespace, "ci-feature");
        assert_eq!(o.service_account, "deployer");
        assert_eq!(o.bearer_token, "token-123");

        let notices = trace.notices().join("\n");
        assert!(notices.contains("\"BearerToken\" overwritten with \"XXXXXXXX...\""));
        assert!(!notices.contains("token-123"));
    }

    #[test]
    fn non_matching_value_is_rejected() {
        let config = KubernetesConfig {
            namespace_overwrite_allowed: "^not_a_match$".into(),
            ..KubernetesConfig::default()
        };
        let err = resolve(&config, &vars(&[(NAMESPACE_OVERWRITE_VARIABLE, "namespace")]))
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
        assert_eq!(
            err.to_string(),
            "Provided value \"namespace\" does not match regex \"^not_a_match$\""
        );
    }

    #[test]
    fn annotations_fan_out_and_merge() {
        let mut config = KubernetesConfig {
            pod_annotations_overwrite_allowed: ".*".into(),
            ..KubernetesConfig::default()
        };
        config.pod_annotations.insert("team".into(), "infra".into());

        let o = resolve(
            &config,
            &vars(&[
                ("KUBERNETES_POD_ANNOTATIONS_1", "owner=ci"),
                ("KUBERNETES_POD_ANNOTATIONS_2", "team=platform"),
                ("KUBERNETES_POD_ANNOTATIONS_3", "expr=a=b"),
            ]),
        )
        .unwrap();

        assert_eq!(o.pod_annotations.get("owner").unwrap(), "ci");
        assert_eq!(o.pod_annotations.get("team").unwrap(), "platform");
        assert_eq!(o.pod_annotations.get("expr").unwrap(), "a=b");
    }

    #[test]
    fn malformed_annotation_fails() {
        let config = KubernetesConfig {
            pod_annotations_overwrite_allowed: ".*".into(),
            ..KubernetesConfig::default()
        };
        let err = resolve(&config, &vars(&[("KUBERNETES_POD_ANNOTATIONS_1", "novalue")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Provided value \"novalue\" is malformed, does not match k=v"
        );
    }

    #[test]
    fn labels_are_sanitised() {
        let config = KubernetesConfig {
            pod_labels_overwrite_allowed: ".*".into(),
            ..KubernetesConfig::default()
        };
        let o = resolve(&config, &vars(&[("KUBERNETES_POD_LABELS_1", "branch=feature/x")]))
            .unwrap();
        assert_eq!(o.pod_labels.get("branch").unwrap(), "feature_x");
    }

    #[test]
    fn resources_respect_the_cap() {
        let mut config = KubernetesConfig::default();
        config.resources.build.cpu = ResourcePair {
            limit: "1".into(),
            request: "500m".into(),
            limit_overwrite_max_allowed: "2".into(),
            request_overwrite_max_allowed: String::new(),
        };
        config.resources.helper.memory.limit = "256Mi".into();

        let o = resolve(
            &config,
            &vars(&[("KUBERNETES_CPU_LIMIT", "1500m"), ("KUBERNETES_CPU_REQUEST", "4")]),
        )
        .unwrap();
        assert_eq!(quantity(&o.build_resources, "limits", "cpu").as_deref(), Some("1500m"));
        // no cap configured for requests, so the default stays
        assert_eq!(quantity(&o.build_resources, "requests", "cpu").as_deref(), Some("500m"));
        assert_eq!(
            quantity(&o.helper_resources, "limits", "memory").as_deref(),
            Some("256Mi")
        );

        let err = resolve(&config, &vars(&[("KUBERNETES_CPU_LIMIT", "3")])).unwrap_err();
        assert!(matches!(err, OverwriteError::AboveMax { .. }));
    }

    #[test]
    fn helper_and_service_variables_are_separate() {
        let mut config = KubernetesConfig::default();
        config.resources.helper.memory.limit_overwrite_max_allowed = "1Gi".into();
        config.resources.service.memory.limit_overwrite_max_allowed = "1Gi".into();

        let o = resolve(
            &config,
            &vars(&[
                ("KUBERNETES_HELPER_MEMORY_LIMIT", "512Mi"),
                ("KUBERNETES_SERVICE_MEMORY_LIMIT", "768Mi"),
            ]),
        )
        .unwrap();
        assert_eq!(quantity(&o.helper_resources, "limits", "memory").as_deref(), Some("512Mi"));
        assert_eq!(quantity(&o.service_resources, "limits", "memory").as_deref(), Some("768Mi"));
        assert!(o.build_resources.limits.is_none());
    }
}
