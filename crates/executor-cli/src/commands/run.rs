use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use executor_core::config::Config;
use executor_core::error::ExecutorError;
use executor_core::{Executor, ExecutorCommand, JobSpec, PrepareOptions, StdoutTrace};
use executor_kubernetes::router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch;

pub async fn run(
    config: &Config,
    job_path: &Path,
    proxy_listen: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let job = JobSpec::load_from(job_path)
        .with_context(|| format!("loading job from {}", job_path.display()))?;
    let mut executor = dispatch::create_executor(config);

    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());
    if let Some(timeout) = job.timeout {
        watch_timeout(cancel.clone(), Duration::from_secs(timeout));
    }

    if let Some(addr) = proxy_listen {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding proxy listener on {}", addr))?;
        let app = router(executor.proxy_pool());
        let shutdown = cancel.clone();
        info!("Serving service proxy on {}", addr);
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!("Service proxy stopped: {}", e);
            }
        });
    }

    let options = PrepareOptions {
        job: job.clone(),
        trace: Arc::new(StdoutTrace),
        cancel: cancel.clone(),
    };

    let result = run_stages(&mut executor, options, &job).await;
    executor.cleanup().await;
    cancel.cancel();

    match result {
        Ok(()) => {
            info!("Job {} succeeded", job.id);
            Ok(())
        }
        Err(err) => {
            if let Some(build) = err.as_build_error() {
                eprintln!(
                    "Job {} failed: {} (reason: {}, exit code: {})",
                    job.id,
                    build,
                    build
                        .failure_reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unknown".into()),
                    build
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "N/A".into()),
                );
            }
            Err(err.into())
        }
    }
}

/// Run stages in order. `after_script` still runs when an earlier stage failed.
async fn run_stages(
    executor: &mut dyn Executor,
    options: PrepareOptions,
    job: &JobSpec,
) -> Result<(), ExecutorError> {
    executor.prepare(options).await?;

    let mut failure = None;
    for stage in &job.stages {
        if failure.is_some() && stage.name != "after_script" {
            continue;
        }
        info!("Running stage {}", stage.name);
        let command = ExecutorCommand::new(stage.name.clone(), stage.predefined);
        match executor.run(command).await {
            Ok(()) => {}
            Err(ExecutorError::Aborted) => return Err(ExecutorError::Aborted),
            Err(err) if failure.is_none() => failure = Some(err),
            Err(err) => warn!("Stage {} failed: {}", stage.name, err),
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn watch_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    warn!("Interrupted, aborting job");
                    cancel.cancel();
                }
            }
        }
    });
}

fn watch_timeout(cancel: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                warn!("Job timed out after {:?}", timeout);
                cancel.cancel();
            }
        }
    });
}
