use executor_core::config::Config;
use executor_kubernetes::{FeatureChecker, GroupVersionResource};

use crate::dispatch;

/// Resources the executor creates, with the verbs it needs on them.
const REQUIRED: &[(&str, &[&str])] = &[
    ("pods", &["create", "get", "delete", "watch"]),
    ("secrets", &["create", "get", "delete"]),
    ("configmaps", &["create", "delete"]),
    ("services", &["create", "get", "delete"]),
];

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let api = dispatch::client(config).await?;
    let namespace = &config.kubernetes.namespace;

    let info = api.server_version().await?;
    println!("Server:      {}", api.cluster_url());
    println!("Version:     {}.{} ({})", info.major, info.minor, info.git_version);

    let checker = FeatureChecker::new(api);
    match checker.is_host_alias_supported().await {
        Ok(true) => println!("Host aliases: supported"),
        Ok(false) => println!("Host aliases: unsupported"),
        Err(e) => println!("Host aliases: unknown ({})", e),
    }

    println!("Permissions in namespace {}:", namespace);
    let mut denied = 0;
    for (resource, verbs) in REQUIRED {
        let gvr = GroupVersionResource::core(resource);
        let (allowed, reason) = checker
            .are_resource_verbs_allowed(&gvr, namespace, verbs)
            .await?;
        if allowed {
            println!("  ✅ {} ({})", resource, verbs.join(", "));
        } else {
            denied += 1;
            println!("  ❌ {} ({}): {}", resource, verbs.join(", "), reason);
        }
    }

    if denied > 0 {
        anyhow::bail!("{} resource(s) lack required permissions", denied);
    }
    Ok(())
}
