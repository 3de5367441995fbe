use executor_core::config::Config;
use executor_core::StateStore;
use executor_kubernetes::{delete_resources, state_key, StateSnapshot};

use crate::dispatch;

pub async fn run(config: &Config, job_id: i64) -> anyhow::Result<()> {
    let store = dispatch::state_store(config);
    let key = state_key(job_id);

    let Some(state) = store.load(&key)? else {
        println!("No saved state for job {} in {}", job_id, store.dir().display());
        return Ok(());
    };
    let snapshot: StateSnapshot = serde_json::from_value(state)?;

    let api = dispatch::client(config).await?;
    let grace = config.kubernetes.cleanup_grace_period_seconds;
    let failures = delete_resources(api.as_ref(), &snapshot, grace).await;
    if failures > 0 {
        anyhow::bail!(
            "{} object(s) of job {} could not be deleted from namespace {}",
            failures,
            job_id,
            snapshot.namespace
        );
    }

    store.remove(&key)?;
    println!("Cleaned up job {} in namespace {}", job_id, snapshot.namespace);
    if let Some(pod) = &snapshot.pod {
        println!("  Pod:      {}", pod);
    }
    for service in &snapshot.services {
        println!("  Service:  {} ({})", service.name, service.alias);
    }
    Ok(())
}
