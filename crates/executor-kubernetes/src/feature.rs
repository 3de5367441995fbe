use std::sync::Arc;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use thiserror::Error;

use crate::client::KubeApi;
use crate::error::KubeError;

/// Host aliases are honoured from this server version on.
const HOST_ALIASES_MIN_VERSION: (u64, u64) = (1, 7);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeatureError {
    /// The server reported a version we cannot read.
    #[error("parsing Kubernetes version {major}.{minor} - {inner}")]
    BadVersion {
        major: String,
        minor: String,
        inner: String,
    },

    #[error("SelfSubjectAccessReview creation: {0}")]
    AccessReview(KubeError),

    #[error(transparent)]
    Kube(#[from] KubeError),
}

/// Resource addressed by an access review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn core(resource: &str) -> Self {
        Self {
            group: String::new(),
            version: "v1".to_string(),
            resource: resource.to_string(),
        }
    }
}

/// Checks what the cluster and the current credentials allow.
#[derive(Clone)]
pub struct FeatureChecker {
    api: Arc<dyn KubeApi>,
}

impl FeatureChecker {
    pub fn new(api: Arc<dyn KubeApi>) -> Self {
        Self { api }
    }

    pub async fn is_host_alias_supported(&self) -> Result<bool, FeatureError> {
        let info = self.api.server_version().await?;
        let version = parse_version(&info.major, &info.minor)?;
        Ok(version >= HOST_ALIASES_MIN_VERSION)
    }

    /// Whether every verb is allowed on the resource. Stops at the first denial or error.
    ///
    /// The returned reason is empty when everything is allowed.
    pub async fn are_resource_verbs_allowed(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        verbs: &[&str],
    ) -> Result<(bool, String), FeatureError> {
        for verb in verbs {
            let (allowed, reason) = self.is_resource_verb_allowed(gvr, namespace, verb).await?;
            if !allowed {
                return Ok((false, reason));
            }
        }
        Ok((true, String::new()))
    }

    pub async fn is_resource_verb_allowed(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        verb: &str,
    ) -> Result<(bool, String), FeatureError> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(gvr.group.clone()),
                    version: Some(gvr.version.clone()),
                    resource: Some(gvr.resource.clone()),
                    namespace: Some(namespace.to_string()),
                    verb: Some(verb.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = self
            .api
            .create_access_review(&review)
            .await
            .map_err(FeatureError::AccessReview)?;
        let status = result.status.unwrap_or_default();

        // an evaluation error may not mean denied, but we cannot tell
        if let Some(err) = status.evaluation_error.filter(|e| !e.is_empty()) {
            return Ok((false, format!("evaluation error: {}", err)));
        }

        if status.allowed && !status.denied.unwrap_or(false) {
            return Ok((true, String::new()));
        }

        let mut reason = format!("not allowed: {} on {}", verb, gvr.resource);
        if let Some(r) = status.reason.filter(|r| !r.is_empty()) {
            reason.push_str(&format!(" (reason: {})", r));
        }
        Ok((false, reason))
    }
}

/// Keep the leading digits; managed clusters report things like "14+".
fn clean_version(part: &str) -> &str {
    let end = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    &part[..end]
}

fn parse_version(major: &str, minor: &str) -> Result<(u64, u64), FeatureError> {
    let bad = |inner: String| FeatureError::BadVersion {
        major: major.to_string(),
        minor: minor.to_string(),
        inner,
    };

    let parse = |part: &str| {
        clean_version(part)
            .parse::<u64>()
            .map_err(|e| bad(format!("{:?}: {}", part, e)))
    };

    Ok((parse(major)?, parse(minor)?))
}
