use std::path::Path;
use std::sync::Arc;

use executor_core::{Config, FileStateStore};
use executor_kubernetes::{ClientProvider, DefaultClientProvider, KubeApi, KubernetesExecutor};

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load_default(),
    }
}

pub fn state_store(config: &Config) -> Arc<FileStateStore> {
    Arc::new(FileStateStore::new(config.state.dir()))
}

/// Executor wired to the configured state directory.
pub fn create_executor(config: &Config) -> KubernetesExecutor {
    KubernetesExecutor::new(config.kubernetes.clone()).with_state_store(state_store(config))
}

/// API client for commands that talk to the cluster outside a job.
pub async fn client(config: &Config) -> anyhow::Result<Arc<dyn KubeApi>> {
    let client = DefaultClientProvider
        .client(&config.kubernetes, None)
        .await?;
    Ok(client)
}
