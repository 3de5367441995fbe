use std::sync::Arc;
use std::time::Duration;

use executor_core::{
    BuildError, Executor, ExecutorCommand, ExecutorError, FailureReason, JobSpec, JobTrace,
    KubernetesConfig, PrepareOptions, StateStore,
};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attach::{AttachError, AttachSession};
use crate::client::{ClientProvider, KubeApi};
use crate::dns::{generate_name, make_dns1123_compatible};
use crate::error::KubeError;
use crate::feature::{FeatureChecker, FeatureError};
use crate::kube_client::DefaultClientProvider;
use crate::logs::{ExitStatus, LogProcessor, LogProcessorHandle};
use crate::overwrites::Overwrites;
use crate::pod::{objects, PodBuilder, BUILD_CONTAINER, HELPER_CONTAINER};
use crate::proxy::ProxyPool;
use crate::pull::{ImagePullError, PullManager};
use crate::shell::Shell;
use crate::state::{ExecutorState, ServiceRef, StateSnapshot};
use crate::status::{self, WaitError};
use crate::watcher::PodWatcher;

/// Key the executor state of a job is persisted under.
pub fn state_key(job_id: i64) -> String {
    format!("kubernetes-{}", job_id)
}

/// Kubernetes executor: runs every stage of a job in one pod.
///
/// `prepare` only talks to the cluster to build a client and check it; the
/// pod and its companions are created by the first `run`. `cleanup` deletes
/// whatever was created, whether or not the stages succeeded.
pub struct KubernetesExecutor {
    config: KubernetesConfig,
    provider: Arc<dyn ClientProvider>,
    pool: Arc<ProxyPool>,
    store: Option<Arc<dyn StateStore>>,
    poll_interval: Option<Duration>,
    session: Option<Session>,
}

impl KubernetesExecutor {
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            config,
            provider: Arc::new(DefaultClientProvider),
            pool: Arc::new(ProxyPool::new()),
            store: None,
            poll_interval: None,
            session: None,
        }
    }

    pub fn with_client_provider(mut self, provider: Arc<dyn ClientProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the configured pod status poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn proxy_pool(&self) -> Arc<ProxyPool> {
        self.pool.clone()
    }

    /// Current state, encoded for [`KubernetesExecutor::resume`]. `None` before `prepare`.
    pub fn encoded_state(&self) -> Result<Option<String>, ExecutorError> {
        self.session
            .as_ref()
            .map(|s| s.state.to_encoded())
            .transpose()
            .map_err(ExecutorError::from)
    }

    /// Prepare, then pick up the objects named in `encoded` instead of creating new ones.
    pub async fn resume(
        &mut self,
        options: PrepareOptions,
        encoded: &str,
    ) -> Result<(), ExecutorError> {
        let restored =
            ExecutorState::from_encoded(encoded).map_err(|e| ExecutorError::State(e.to_string()))?;
        self.prepare(options).await?;

        let session = self.session.as_mut().ok_or(ExecutorError::NotPrepared)?;
        session.restore(restored).await
    }

    async fn open_session(&self, options: PrepareOptions) -> Result<Session, ExecutorError> {
        let PrepareOptions { job, trace, cancel } = options;

        let shell = Shell::from_name(&self.config.shell).map_err(config_error)?;
        let overwrites =
            Overwrites::resolve(&self.config, &job.variables, trace.as_ref()).map_err(config_error)?;

        let bearer_token = Some(overwrites.bearer_token.as_str())
            .filter(|t| !t.is_empty() && *t != self.config.bearer_token);
        let api = self.provider.client(&self.config, bearer_token).await?;

        let host_aliases_supported =
            match FeatureChecker::new(api.clone()).is_host_alias_supported().await {
                Ok(supported) => supported,
                Err(err @ FeatureError::BadVersion { .. }) => {
                    warn!("Checking for host alias support, host aliases disabled: {}", err);
                    false
                }
                Err(err) => return Err(ExecutorError::Kubernetes(err.to_string())),
            };

        let builder = PodBuilder::new(&self.config, &overwrites, &job, host_aliases_supported)
            .map_err(config_error)?;
        let pull = PullManager::new(builder.pull_policies()).with_trace(trace.clone());

        for proxied in builder.proxied_containers() {
            self.pool.register(&proxied.name, proxied.ports);
        }

        let namespace = builder.namespace().to_string();
        let (watcher, watcher_errors) = PodWatcher::start(
            api.clone(),
            &namespace,
            &builder.selector_labels(),
            self.config.watcher_emit_timeout(),
            &cancel,
        );

        info!(
            "Prepared job {} for namespace {} with shell {:?}",
            job.id, namespace, shell
        );
        trace.notice(&format!("Using Kubernetes namespace: {}", namespace));

        Ok(Session {
            config: self.config.clone(),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| self.config.poll_interval()),
            state: Arc::new(ExecutorState::new(&namespace)),
            job,
            trace,
            cancel,
            api,
            builder,
            shell,
            pull,
            pool: self.pool.clone(),
            store: self.store.clone(),
            watcher,
            watcher_errors,
            pull_attempts: 1,
            pod: None,
            logs: None,
            exits: None,
        })
    }
}

#[async_trait::async_trait]
impl Executor for KubernetesExecutor {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn prepare(&mut self, options: PrepareOptions) -> Result<(), ExecutorError> {
        if self.session.is_some() {
            self.cleanup().await;
        }
        let session = self.open_session(options).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn run(&mut self, command: ExecutorCommand) -> Result<(), ExecutorError> {
        let session = self.session.as_mut().ok_or(ExecutorError::NotPrepared)?;
        let result = session.run(&command).await;
        session.persist();
        result
    }

    async fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Everything that lives between `prepare` and `cleanup`.
struct Session {
    config: KubernetesConfig,
    poll_interval: Duration,
    job: JobSpec,
    trace: Arc<dyn JobTrace>,
    cancel: CancellationToken,
    api: Arc<dyn KubeApi>,
    builder: PodBuilder,
    shell: Shell,
    state: Arc<ExecutorState>,
    pull: PullManager,
    pool: Arc<ProxyPool>,
    store: Option<Arc<dyn StateStore>>,
    watcher: PodWatcher,
    watcher_errors: mpsc::Receiver<BuildError>,
    /// Numbering for pull retry notices, kept across stages.
    pull_attempts: u32,
    /// Set once the pod runs and its logs are followed.
    pod: Option<String>,
    logs: Option<LogProcessorHandle>,
    exits: Option<mpsc::Receiver<ExitStatus>>,
}

/// Why setting up the pod or running a stage in it failed.
enum AttemptError {
    /// Worth another try with the next pull policy.
    ImagePull(ImagePullError),
    Executor(ExecutorError),
}

impl From<ExecutorError> for AttemptError {
    fn from(err: ExecutorError) -> Self {
        AttemptError::Executor(err)
    }
}

impl From<KubeError> for AttemptError {
    fn from(err: KubeError) -> Self {
        AttemptError::Executor(err.into())
    }
}

impl From<serde_json::Error> for AttemptError {
    fn from(err: serde_json::Error) -> Self {
        AttemptError::Executor(err.into())
    }
}

impl From<BuildError> for AttemptError {
    fn from(err: BuildError) -> Self {
        match err.inner_as::<ImagePullError>() {
            Some(pull) => AttemptError::ImagePull(pull.clone()),
            None => AttemptError::Executor(err.into()),
        }
    }
}

impl Session {
    async fn run(&mut self, command: &ExecutorCommand) -> Result<(), ExecutorError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutorError::Aborted);
        }
        if self.job.stage(&command.stage).is_none() {
            return Err(ExecutorError::Config(format!(
                "job has no stage {:?}",
                command.stage
            )));
        }

        loop {
            let setup = if self.pod.is_none() {
                self.setup_build_pod().await
            } else {
                Ok(())
            };
            let attempt = match setup {
                Ok(()) => self.run_stage(command).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(AttemptError::Executor(err)) => return Err(err),
                Err(AttemptError::ImagePull(err)) => self.retry_pull(err).await?,
            }
        }
    }

    /// Record a failed pull and tear the pod down so the next setup uses the next policy.
    async fn retry_pull(&mut self, err: ImagePullError) -> Result<(), ExecutorError> {
        if !self.pull.record_failure(self.pull_attempts, &err) {
            return Err(BuildError::new(err)
                .with_reason(FailureReason::ImagePullFailure)
                .into());
        }
        self.pull_attempts += 1;
        self.teardown().await;
        while self.watcher_errors.try_recv().is_ok() {}
        Ok(())
    }

    async fn run_stage(&mut self, command: &ExecutorCommand) -> Result<(), AttemptError> {
        let pod = self.pod.clone().ok_or(ExecutorError::NotPrepared)?;
        let namespace = self.builder.namespace().to_string();

        let container = if command.predefined {
            HELPER_CONTAINER
        } else {
            BUILD_CONTAINER
        };
        let script = self.builder.layout().stage_path(&command.stage);
        let attach_command = self.builder.layout().attach_command(&command.stage);

        // Anything queued before this stage belongs to an earlier one.
        while self.watcher_errors.try_recv().is_ok() {}
        let _listening = self.watcher.listen();

        debug!(
            "Starting stage {} in {}/{} container {}",
            command.stage, namespace, pod, container
        );
        let attach = AttachSession::new(
            self.api.as_ref(),
            &namespace,
            &pod,
            self.config.attach_retries,
        );
        let attached = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ExecutorError::Aborted.into()),
            result = attach.send(container, &attach_command) => result,
        };
        attached.map_err(attach_error)?;

        let exits = self.exits.as_mut().ok_or(ExecutorError::NotPrepared)?;
        let watcher_errors = &mut self.watcher_errors;
        let poller =
            status::watch_pod_status(self.api.as_ref(), &namespace, &pod, self.poll_interval);
        tokio::pin!(poller);

        loop {
            tokio::select! {
                exit = exits.recv() => match exit {
                    Some(exit) if !exit.script.is_empty() && exit.script != script => {
                        debug!("Ignoring exit marker of {}", exit.script);
                    }
                    Some(exit) => return Ok(exit_result(&command.stage, exit)?),
                    None => {
                        return Err(ExecutorError::Kubernetes(
                            "log processing stopped before the stage finished".to_string(),
                        )
                        .into())
                    }
                },
                Some(err) = watcher_errors.recv() => return Err(err.into()),
                err = &mut poller => return Err(err.into()),
                _ = self.cancel.cancelled() => return Err(ExecutorError::Aborted.into()),
            }
        }
    }

    async fn setup_build_pod(&mut self) -> Result<(), AttemptError> {
        let namespace = self.builder.namespace().to_string();
        let prefix = make_dns1123_compatible(&self.job.project_unique_name());

        let secret =
            objects::credentials_secret(&prefix, &namespace, self.job.registry_credentials())?;
        if let Some(secret) = secret {
            let created = self.api.create_secret(&namespace, &secret).await?;
            self.state.set_credentials(created.metadata.name);
        }

        let stages = self
            .job
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.script.as_str()));
        let config_map = objects::scripts_config_map(
            &prefix,
            &namespace,
            self.shell,
            self.builder.layout(),
            stages,
        );
        let created = self.api.create_config_map(&namespace, &config_map).await?;
        let config_map_name = created.metadata.name.unwrap_or_default();
        self.state.set_config_map(Some(config_map_name.clone()));

        let pod_name = generate_name(&prefix);
        let credentials = self.state.snapshot().credentials;
        let pod = self
            .builder
            .build(&pod_name, &config_map_name, credentials.as_deref(), &self.pull)
            .map_err(config_error)?;
        self.api.create_pod(&namespace, &pod).await?;
        self.state.set_pod(Some(pod_name.clone()));
        self.watcher.update_pod_name(&pod_name);
        info!("Created pod {}/{}", namespace, pod_name);

        let selector = self.builder.selector_labels();
        for proxied in self.builder.proxied_containers() {
            let service =
                objects::proxy_service(&proxied.name, &namespace, &proxied.ports, &selector);
            let created = self.api.create_service(&namespace, &service).await?;
            let name = created.metadata.name.unwrap_or_default();
            self.pool.set_service_name(&proxied.name, &name);
            self.state.add_service(ServiceRef {
                alias: proxied.name,
                name,
            });
        }
        self.persist();

        self.trace.notice(&format!(
            "Waiting for pod {}/{} to be running",
            namespace, pod_name
        ));
        let waited = status::wait_for_running(
            self.api.as_ref(),
            &namespace,
            &pod_name,
            self.poll_interval,
            self.config.poll_attempts,
            self.trace.as_ref(),
            &self.cancel,
        )
        .await;
        match waited {
            Ok(_) => {}
            Err(WaitError::ImagePull(err)) => return Err(AttemptError::ImagePull(err)),
            Err(WaitError::Kube(err)) => return Err(err.into()),
            Err(WaitError::Aborted) => return Err(ExecutorError::Aborted.into()),
            Err(err) => {
                return Err(ExecutorError::from(
                    BuildError::new(err).with_reason(FailureReason::RunnerSystemFailure),
                )
                .into())
            }
        }

        self.pool.bind(self.api.clone(), &namespace, &pod_name);
        self.start_logs(&namespace, &pod_name);
        self.trace
            .notice(&format!("Pod {}/{} is running", namespace, pod_name));
        self.pod = Some(pod_name);
        Ok(())
    }

    fn start_logs(&mut self, namespace: &str, pod: &str) {
        let (handle, exits) = LogProcessor::new(
            self.api.clone(),
            namespace,
            pod,
            &[HELPER_CONTAINER, BUILD_CONTAINER],
            self.state.clone(),
            self.trace.clone(),
        )
        .with_backoff(self.config.log_backoff.clone())
        .start(&self.cancel);

        self.logs = Some(handle);
        self.exits = Some(exits);
    }

    /// Pick up existing objects after a restart of the calling process.
    async fn restore(&mut self, restored: ExecutorState) -> Result<(), ExecutorError> {
        let snapshot = restored.snapshot();
        let namespace = self.builder.namespace().to_string();
        if snapshot.namespace != namespace {
            return Err(ExecutorError::State(format!(
                "state belongs to namespace {:?}, the job resolves to {:?}",
                snapshot.namespace, namespace
            )));
        }
        let pod_name = snapshot
            .pod
            .clone()
            .ok_or_else(|| ExecutorError::State("state names no pod".to_string()))?;

        let pod = self.api.get_pod(&namespace, &pod_name).await?;
        if let Some(secret) = &snapshot.credentials {
            self.api.get_secret(&namespace, secret).await?;
        }
        for service in &snapshot.services {
            self.api.get_service(&namespace, &service.name).await?;
            self.pool.set_service_name(&service.alias, &service.name);
        }

        self.state = Arc::new(restored);
        self.watcher.update_pod_name(&pod_name);
        self.pool.bind(self.api.clone(), &namespace, &pod_name);
        self.start_logs(&namespace, &pod_name);
        self.trace
            .notice(&format!("Resumed job in pod {}", status::pod_key(&pod)));
        self.pod = Some(pod_name);
        Ok(())
    }

    /// Stop following logs and delete what exists, keeping the session usable.
    async fn teardown(&mut self) {
        self.watcher.update_pod_name("");
        self.exits = None;
        if let Some(mut logs) = self.logs.take() {
            logs.stop().await;
        }

        let snapshot = self.state.snapshot();
        self.delete_with_timeout(&snapshot).await;
        self.state.clear_objects();
        self.pod = None;
    }

    async fn close(mut self) {
        self.teardown().await;
        self.watcher.stop().await;
        self.pool.clear();

        if let Some(store) = &self.store {
            if let Err(err) = store.remove(&state_key(self.job.id)) {
                warn!("Removing persisted state of job {}: {}", self.job.id, err);
            }
        }
    }

    async fn delete_with_timeout(&self, snapshot: &StateSnapshot) {
        let deletions = delete_resources(
            self.api.as_ref(),
            snapshot,
            self.config.cleanup_grace_period_seconds,
        );
        match tokio::time::timeout(self.config.cleanup_timeout(), deletions).await {
            Ok(0) => {}
            Ok(failed) => warn!("{} resources of job {} were not deleted", failed, self.job.id),
            Err(_) => warn!(
                "Cleanup of job {} timed out after {:?}",
                self.job.id,
                self.config.cleanup_timeout()
            ),
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let saved = serde_json::to_value(self.state.snapshot())
            .map_err(ExecutorError::from)
            .and_then(|value| store.save(&state_key(self.job.id), &value));
        if let Err(err) = saved {
            warn!("Persisting state of job {}: {}", self.job.id, err);
        }
    }
}

/// Delete every object named in `snapshot`. Deletions run concurrently and
/// independently; objects that are already gone count as deleted.
///
/// Returns how many deletions failed.
pub async fn delete_resources(
    api: &dyn KubeApi,
    snapshot: &StateSnapshot,
    grace_period_seconds: Option<i64>,
) -> usize {
    let namespace = snapshot.namespace.as_str();
    let mut deletions: Vec<BoxFuture<'_, (String, Result<(), KubeError>)>> = Vec::new();

    if let Some(pod) = &snapshot.pod {
        deletions.push(
            async move {
                let result = api.delete_pod(namespace, pod, grace_period_seconds).await;
                (format!("pod {}", pod), result)
            }
            .boxed(),
        );
    }
    if let Some(secret) = &snapshot.credentials {
        deletions.push(
            async move {
                let result = api.delete_secret(namespace, secret).await;
                (format!("secret {}", secret), result)
            }
            .boxed(),
        );
    }
    if let Some(config_map) = &snapshot.config_map {
        deletions.push(
            async move {
                let result = api.delete_config_map(namespace, config_map).await;
                (format!("configmap {}", config_map), result)
            }
            .boxed(),
        );
    }
    for service in &snapshot.services {
        deletions.push(
            async move {
                let result = api.delete_service(namespace, &service.name).await;
                (format!("service {}", service.name), result)
            }
            .boxed(),
        );
    }

    let mut failed = 0;
    for (object, result) in join_all(deletions).await {
        match result {
            Ok(()) => debug!("Deleted {} in {}", object, namespace),
            Err(err) if err.is_not_found() => debug!("{} in {} already gone", object, namespace),
            Err(err) => {
                failed += 1;
                warn!("Error cleaning up {} in {}: {}", object, namespace, err);
            }
        }
    }
    failed
}

fn exit_result(stage: &str, exit: ExitStatus) -> Result<(), ExecutorError> {
    if exit.command_exit_code == 0 {
        debug!("Stage {} finished", stage);
        Ok(())
    } else {
        debug!(
            "Stage {} exited with code {}",
            stage, exit.command_exit_code
        );
        Err(BuildError::exit_code(exit.command_exit_code).into())
    }
}

fn attach_error(err: AttachError) -> ExecutorError {
    match err {
        AttachError::NotRunning { .. } => {
            BuildError::new(err).with_reason(FailureReason::RunnerSystemFailure).into()
        }
        AttachError::Kube(err) => err.into(),
        other => ExecutorError::Kubernetes(other.to_string()),
    }
}

fn config_error(err: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_key_names_the_job() {
        assert_eq!(state_key(42), "kubernetes-42");
    }

    #[test]
    fn exit_codes_map_to_build_errors() {
        assert!(exit_result(
            "build_script",
            ExitStatus {
                command_exit_code: 0,
                script: String::new()
            }
        )
        .is_ok());

        let err = exit_result(
            "build_script",
            ExitStatus {
                command_exit_code: 3,
                script: String::new(),
            },
        )
        .unwrap_err();
        let build = err.as_build_error().unwrap();
        assert_eq!(build.exit_code, Some(3));
        assert_eq!(build.failure_reason, Some(FailureReason::ScriptFailure));
    }

    #[test]
    fn attach_errors() {
        let not_running = attach_error(AttachError::NotRunning {
            pod: "ci/p".into(),
            phase: "Pending".into(),
        });
        assert_eq!(
            not_running.as_build_error().unwrap().failure_reason,
            Some(FailureReason::RunnerSystemFailure)
        );

        let kube = attach_error(AttachError::Kube(KubeError::Transport("eof".into())));
        assert!(matches!(kube, ExecutorError::Kubernetes(_)));
    }
}
