use std::collections::BTreeSet;

use executor_core::KubernetesConfig;
use k8s_openapi::api::core::v1::{Capabilities, PodSecurityContext, SecurityContext};

/// Capabilities dropped unless the operator adds them back.
pub const DEFAULT_CAP_DROP: &[&str] = &["NET_RAW"];

fn normalize(cap: &str) -> String {
    let cap = cap.trim().to_ascii_uppercase();
    cap.strip_prefix("CAP_").map(str::to_string).unwrap_or(cap)
}

/// Resolve the add and drop lists.
///
/// An explicit drop always wins over an add of the same capability. Default
/// drops only apply when the capability was not added.
pub fn capabilities(add: &[String], drop: &[String]) -> Option<Capabilities> {
    let adds: BTreeSet<String> = add.iter().map(|c| normalize(c)).filter(|c| !c.is_empty()).collect();
    let drops: BTreeSet<String> = drop.iter().map(|c| normalize(c)).filter(|c| !c.is_empty()).collect();

    let mut final_drop: Vec<String> = drops.iter().cloned().collect();
    for cap in DEFAULT_CAP_DROP {
        let cap = cap.to_string();
        if !adds.contains(&cap) && !drops.contains(&cap) {
            final_drop.push(cap);
        }
    }

    let final_add: Vec<String> = adds.difference(&drops).cloned().collect();

    if final_add.is_empty() && final_drop.is_empty() {
        return None;
    }

    Some(Capabilities {
        add: Some(final_add).filter(|a| !a.is_empty()),
        drop: Some(final_drop).filter(|d| !d.is_empty()),
    })
}

/// Container security context. Privilege flags stay unset unless configured.
pub fn container_security_context(config: &KubernetesConfig) -> SecurityContext {
    SecurityContext {
        privileged: config.privileged,
        allow_privilege_escalation: config.allow_privilege_escalation,
        capabilities: capabilities(&config.cap_add, &config.cap_drop),
        ..Default::default()
    }
}

pub fn pod_security_context(config: &KubernetesConfig) -> Option<PodSecurityContext> {
    let ctx = &config.pod_security_context;
    if ctx.is_empty() {
        return None;
    }

    Some(PodSecurityContext {
        fs_group: ctx.fs_group,
        run_as_group: ctx.run_as_group,
        run_as_non_root: ctx.run_as_non_root,
        run_as_user: ctx.run_as_user,
        supplemental_groups: Some(ctx.supplemental_groups.clone()).filter(|g| !g.is_empty()),
        ..Default::default()
    })
}
