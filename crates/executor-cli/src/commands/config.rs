use std::path::Path;

use executor_core::Config;

const SAMPLE_CONFIG: &str = r#"# kube-job configuration

kubernetes:
  # Leave host empty to use in-cluster config or ~/.kube/config
  host: ""
  namespace: ci
  # Jobs may pick a namespace matching this pattern via KUBERNETES_NAMESPACE_OVERWRITE
  namespace_overwrite_allowed: "ci-.*"
  image: alpine:3.19
  pull_policy: [if_not_present]
  shell: bash
  poll_interval: 3
  poll_attempts: 180
  cleanup_resources_timeout: 300
  resources:
    build:
      cpu:
        limit: "2"
        request: 500m
        limit_overwrite_max_allowed: "4"
      memory:
        limit: 2Gi
        request: 512Mi
  node_selector:
    kubernetes.io/os: linux

# State directory defaults to the user's data directory
state: {}
"#;

pub async fn run(explicit: Option<&Path>, path: bool, init: bool) -> anyhow::Result<()> {
    let config_path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);

    if path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config already exists at: {}", config_path.display());
            println!("Remove it first if you want to reinitialize.");
            return Ok(());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, SAMPLE_CONFIG)?;
        println!("Sample config written to: {}", config_path.display());
        return Ok(());
    }

    println!("Config path: {}", config_path.display());
    if config_path.exists() {
        let config = Config::load_from(&config_path)?;
        println!("Namespace:   {}", config.kubernetes.namespace);
        println!(
            "Cluster:     {}",
            if config.kubernetes.host.is_empty() {
                "in-cluster or kubeconfig"
            } else {
                config.kubernetes.host.as_str()
            }
        );
        println!("State dir:   {}", config.state.dir().display());
    } else {
        println!("Status:      not found");
        println!("Run `kube-job config --init` to create one.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses() {
        let config: Config = serde_yaml::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.kubernetes.namespace, "ci");
        assert_eq!(config.kubernetes.resources.build.cpu.limit, "2");
        assert_eq!(config.kubernetes.node_selector["kubernetes.io/os"], "linux");
    }
}
