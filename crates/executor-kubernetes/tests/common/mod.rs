//! In-memory cluster used by the integration tests.
//!
//! Pods start immediately: every container is ready unless its image was
//! marked as unpullable. Attaching runs the stage the command names, which
//! appends its output and the exit marker to the container's log.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{Response, StatusCode};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use executor_core::config::BackoffConfig;
use executor_core::{BufferTrace, JobSpec, JobTrace, KubernetesConfig, PrepareOptions};
use executor_core::{Image, StageScript};
use executor_kubernetes::client::{
    decode_line, log_lines, ByteStream, ClientProvider, KubeApi, LogLines, LogOptions, PodEvent,
    PodEvents, ProxyRequest,
};
use executor_kubernetes::KubeError;
use futures::StreamExt;
use k8s_openapi::api::authorization::v1::{SelfSubjectAccessReview, SubjectAccessReviewStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateWaiting, ContainerStatus, Pod, PodStatus, Secret,
    Service,
};
use k8s_openapi::apimachinery::pkg::version::Info;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// What a stage does once attached.
#[derive(Debug, Clone, Default)]
pub struct StageBehavior {
    pub output: Vec<String>,
    pub exit_code: i32,
    /// Delete the pod instead of finishing.
    pub delete_pod: bool,
    /// Print the output but never exit.
    pub hang: bool,
    /// On the first run only, report this container's image as unpullable instead of running.
    pub pull_error_once: Option<String>,
}

impl StageBehavior {
    pub fn output(lines: &[&str]) -> Self {
        Self {
            output: lines.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn deleting_pod() -> Self {
        Self {
            delete_pod: true,
            ..Default::default()
        }
    }

    pub fn pull_error_once(mut self, container: &str) -> Self {
        self.pull_error_once = Some(container.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct LogLine {
    container: String,
    at: DateTime<Utc>,
    payload: Vec<u8>,
}

impl LogLine {
    /// The line as the server sends it, newline included.
    fn render(&self) -> Vec<u8> {
        let mut raw = self
            .at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .into_bytes();
        raw.push(b' ');
        raw.extend_from_slice(&self.payload);
        raw.push(b'\n');
        raw
    }
}

#[derive(Default)]
struct Inner {
    pods: BTreeMap<String, Pod>,
    secrets: BTreeMap<String, Secret>,
    config_maps: BTreeMap<String, ConfigMap>,
    services: BTreeMap<String, Service>,
    created: Vec<String>,
    deleted: Vec<String>,
    logs: Vec<LogLine>,
    log_requests: Vec<LogOptions>,
    attaches: Vec<(String, String)>,
    stages: HashMap<String, StageBehavior>,
    bad_images: HashSet<String>,
    build_pull_policies: Vec<Option<String>>,
    breaks: HashMap<String, usize>,
    dial_failures: u32,
    failing_deletes: HashSet<String>,
    proxy_response: Option<(u16, String)>,
    proxy_requests: Vec<String>,
    lines_written: u32,
    pull_errors_reported: HashSet<String>,
}

pub struct FakeCluster {
    inner: Mutex<Inner>,
    lines: broadcast::Sender<LogLine>,
    events: broadcast::Sender<PodEvent>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let (lines, _) = broadcast::channel(1024);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            lines,
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn on_stage(&self, stage: &str, behavior: StageBehavior) {
        self.lock().stages.insert(stage.to_string(), behavior);
    }

    pub fn fail_pulls_of(&self, image: &str) {
        self.lock().bad_images.insert(image.to_string());
    }

    /// End the first log stream of `container` after `lines` lines.
    pub fn break_log_stream(&self, container: &str, lines: usize) {
        self.lock().breaks.insert(container.to_string(), lines);
    }

    pub fn fail_attach_dials(&self, times: u32) {
        self.lock().dial_failures = times;
    }

    pub fn fail_delete_of(&self, kind: &str) {
        self.lock().failing_deletes.insert(kind.to_string());
    }

    pub fn respond_to_proxy(&self, status: u16, body: &str) {
        self.lock().proxy_response = Some((status, body.to_string()));
    }

    /// Mark a pod ready or not.
    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut inner = self.lock();
        if let Some(status) = inner
            .pods
            .get_mut(name)
            .and_then(|p| p.status.as_mut())
            .and_then(|s| s.container_statuses.as_mut())
        {
            for container in status {
                container.ready = ready;
            }
        }
    }

    /// Append a line to a container's log.
    pub fn write_log(&self, container: &str, payload: &str) {
        self.write_raw_log(container, payload.as_bytes());
    }

    /// Append a line that need not be valid UTF-8.
    pub fn write_raw_log(&self, container: &str, payload: &[u8]) {
        let mut inner = self.lock();
        self.push_line(&mut inner, container, payload);
    }

    /// Report `container` of a running pod as failing to pull its image.
    pub fn report_pull_error(&self, name: &str, container: &str) {
        let mut inner = self.lock();
        Self::pull_error(&mut inner, &self.events, name, container);
    }

    /// Delete a pod the way something outside the executor would.
    pub fn evict(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(pod) = inner.pods.remove(name) {
            let _ = self.events.send(PodEvent::Deleted(pod));
        }
    }

    /// Objects created so far, as `kind/name`, in creation order.
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.keys().cloned().collect()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.lock().pods.get(name).cloned()
    }

    pub fn only_pod(&self) -> Pod {
        let inner = self.lock();
        assert_eq!(inner.pods.len(), 1, "expected exactly one pod");
        inner.pods.values().next().cloned().unwrap()
    }

    pub fn config_map(&self) -> Option<ConfigMap> {
        self.lock().config_maps.values().next().cloned()
    }

    pub fn secret(&self) -> Option<Secret> {
        self.lock().secrets.values().next().cloned()
    }

    pub fn services(&self) -> Vec<Service> {
        self.lock().services.values().cloned().collect()
    }

    /// True when nothing the executor created is left.
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.pods.is_empty()
            && inner.secrets.is_empty()
            && inner.config_maps.is_empty()
            && inner.services.is_empty()
    }

    pub fn log_requests(&self) -> Vec<LogOptions> {
        self.lock().log_requests.clone()
    }

    /// `(container, command)` per successful attach.
    pub fn attaches(&self) -> Vec<(String, String)> {
        self.lock().attaches.clone()
    }

    /// Pull policy of the build container of every pod created.
    pub fn build_pull_policies(&self) -> Vec<Option<String>> {
        self.lock().build_pull_policies.clone()
    }

    pub fn proxy_requests(&self) -> Vec<String> {
        self.lock().proxy_requests.clone()
    }

    /// Lines are 250ms apart so that several share a second.
    fn push_line(&self, inner: &mut Inner, container: &str, payload: &[u8]) {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let at = base + chrono::Duration::milliseconds(250 * i64::from(inner.lines_written));
        inner.lines_written += 1;

        let line = LogLine {
            container: container.to_string(),
            at,
            payload: payload.to_vec(),
        };
        inner.logs.push(line.clone());
        let _ = self.lines.send(line);
    }

    fn record_create(inner: &mut Inner, kind: &str, name: &str) {
        inner.created.push(format!("{}/{}", kind, name));
    }

    fn record_delete(&self, inner: &mut Inner, kind: &str, name: &str) -> Result<(), KubeError> {
        if inner.failing_deletes.contains(kind) {
            return Err(KubeError::Api {
                code: 500,
                reason: "InternalError".into(),
                message: format!("cannot delete {}", name),
            });
        }
        inner.deleted.push(format!("{}/{}", kind, name));
        Ok(())
    }

    fn start_pod(inner: &Inner, mut pod: Pod) -> Pod {
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.clone())
            .unwrap_or_default();

        let mut pulling = false;
        let mut statuses = Vec::new();
        for container in containers {
            let image = container.image.clone().unwrap_or_default();
            if inner.bad_images.contains(&image) {
                pulling = true;
                statuses.push(ContainerStatus {
                    name: container.name.clone(),
                    image: image.clone(),
                    ready: false,
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("ErrImagePull".into()),
                            message: Some(format!("pull access denied for {}", image)),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            } else {
                statuses.push(ContainerStatus {
                    name: container.name.clone(),
                    image,
                    ready: true,
                    ..Default::default()
                });
            }
        }

        pod.status = Some(PodStatus {
            phase: Some(if pulling { "Pending" } else { "Running" }.into()),
            container_statuses: Some(statuses),
            ..Default::default()
        });
        pod
    }

    fn run_stage(&self, inner: &mut Inner, pod: &str, container: &str, command: &str) {
        // sh -c '(<dir>/detect_shell_script <dir>/<stage>) 2>&1 &'
        let script = command
            .split_whitespace()
            .nth(3)
            .unwrap_or_default()
            .trim_end_matches(')')
            .to_string();
        let stage = script.rsplit('/').next().unwrap_or_default().to_string();
        let behavior = inner.stages.get(&stage).cloned().unwrap_or_default();

        if let Some(failing) = &behavior.pull_error_once {
            if inner.pull_errors_reported.insert(stage.clone()) {
                Self::pull_error(inner, &self.events, pod, failing);
                return;
            }
        }

        if behavior.delete_pod {
            if let Some(pod) = inner.pods.remove(pod) {
                let _ = self.events.send(PodEvent::Deleted(pod));
            }
            return;
        }

        for line in &behavior.output {
            self.push_line(inner, container, line.as_bytes());
        }
        if behavior.hang {
            return;
        }
        let marker = format!(
            "{{\"command_exit_code\": {}, \"script\": \"{}\"}}",
            behavior.exit_code, script
        );
        self.push_line(inner, container, marker.as_bytes());
    }

    /// Put `container` into ErrImagePull and broadcast the change. The phase stays as it was.
    fn pull_error(
        inner: &mut Inner,
        events: &broadcast::Sender<PodEvent>,
        pod: &str,
        container: &str,
    ) {
        let Some(pod) = inner.pods.get_mut(pod) else {
            return;
        };
        if let Some(statuses) = pod
            .status
            .as_mut()
            .and_then(|s| s.container_statuses.as_mut())
        {
            for status in statuses.iter_mut().filter(|s| s.name == container) {
                status.ready = false;
                status.state = Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ErrImagePull".into()),
                        message: Some(format!("pull access denied for {}", status.image)),
                    }),
                    ..Default::default()
                });
            }
        }
        let _ = events.send(PodEvent::Applied(pod.clone()));
    }
}

fn floor_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).unwrap()
}

#[async_trait]
impl KubeApi for FakeCluster {
    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod, KubeError> {
        let mut inner = self.lock();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let policy = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.iter().find(|c| c.name == "build"))
            .and_then(|c| c.image_pull_policy.clone());
        inner.build_pull_policies.push(policy);

        let started = Self::start_pod(&inner, pod.clone());
        Self::record_create(&mut inner, "pod", &name);
        inner.pods.insert(name, started.clone());
        let _ = self.events.send(PodEvent::Applied(started.clone()));
        Ok(started)
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, KubeError> {
        self.lock()
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("pods", name))
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        _grace_period_seconds: Option<i64>,
    ) -> Result<(), KubeError> {
        let mut inner = self.lock();
        self.record_delete(&mut inner, "pod", name)?;
        let pod = inner
            .pods
            .remove(name)
            .ok_or_else(|| KubeError::not_found("pods", name))?;
        let _ = self.events.send(PodEvent::Deleted(pod));
        Ok(())
    }

    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> Result<Secret, KubeError> {
        let mut inner = self.lock();
        let name = secret.metadata.name.clone().unwrap_or_default();
        Self::record_create(&mut inner, "secret", &name);
        inner.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Secret, KubeError> {
        self.lock()
            .secrets
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("secrets", name))
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), KubeError> {
        let mut inner = self.lock();
        self.record_delete(&mut inner, "secret", name)?;
        inner
            .secrets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("secrets", name))
    }

    async fn create_config_map(
        &self,
        _namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, KubeError> {
        let mut inner = self.lock();
        let name = config_map.metadata.name.clone().unwrap_or_default();
        Self::record_create(&mut inner, "configmap", &name);
        inner.config_maps.insert(name, config_map.clone());
        Ok(config_map.clone())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> Result<(), KubeError> {
        let mut inner = self.lock();
        self.record_delete(&mut inner, "configmap", name)?;
        inner
            .config_maps
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("configmaps", name))
    }

    async fn create_service(
        &self,
        _namespace: &str,
        service: &Service,
    ) -> Result<Service, KubeError> {
        let mut inner = self.lock();
        let name = service.metadata.name.clone().unwrap_or_default();
        Self::record_create(&mut inner, "service", &name);
        inner.services.insert(name, service.clone());
        Ok(service.clone())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Service, KubeError> {
        self.lock()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("services", name))
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), KubeError> {
        let mut inner = self.lock();
        self.record_delete(&mut inner, "service", name)?;
        inner
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("services", name))
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        name: &str,
        options: &LogOptions,
    ) -> Result<LogLines, KubeError> {
        let mut inner = self.lock();
        if !inner.pods.contains_key(name) {
            return Err(KubeError::not_found("pods", name));
        }
        inner.log_requests.push(options.clone());

        // the server only honours whole seconds
        let since = options.since_time.map(floor_to_second);
        let container = options.container.clone();
        let keep = move |line: &LogLine| {
            line.container == container && since.map_or(true, |s| line.at >= s)
        };

        let body: Vec<u8> = inner
            .logs
            .iter()
            .filter(|l| keep(l))
            .flat_map(|l| l.render())
            .collect();
        let existing = log_lines(futures::io::Cursor::new(body));

        let rx = self.lines.subscribe();
        let following = futures::stream::unfold(rx, move |mut rx| {
            let keep = keep.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(line) if keep(&line) => {
                            return Some((Ok(decode_line(&line.render())), rx))
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        let stream = existing.chain(following);
        let lines: LogLines = match inner.breaks.remove(&options.container) {
            Some(limit) => Box::pin(stream.take(limit)),
            None => Box::pin(stream),
        };
        Ok(lines)
    }

    async fn attach(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        input: &[u8],
    ) -> Result<(), KubeError> {
        let mut inner = self.lock();
        if inner.dial_failures > 0 {
            inner.dial_failures -= 1;
            return Err(KubeError::Api {
                code: 500,
                reason: "InternalError".into(),
                message: "error dialing backend: EOF".into(),
            });
        }
        if !inner.pods.contains_key(pod) {
            return Err(KubeError::not_found("pods", pod));
        }

        let command = String::from_utf8_lossy(input).to_string();
        inner
            .attaches
            .push((container.to_string(), command.clone()));
        self.run_stage(&mut inner, pod, container, &command);
        Ok(())
    }

    fn watch_pods(&self, _namespace: &str, _label_selector: &str) -> PodEvents {
        let rx = self.events.subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    async fn server_version(&self) -> Result<Info, KubeError> {
        Ok(Info {
            major: "1".into(),
            minor: "30".into(),
            ..Default::default()
        })
    }

    async fn create_access_review(
        &self,
        review: &SelfSubjectAccessReview,
    ) -> Result<SelfSubjectAccessReview, KubeError> {
        let mut review = review.clone();
        review.status = Some(SubjectAccessReviewStatus {
            allowed: true,
            ..Default::default()
        });
        Ok(review)
    }

    async fn proxy(&self, request: ProxyRequest) -> Result<Response<ByteStream>, KubeError> {
        let mut inner = self.lock();
        inner.proxy_requests.push(request.api_path());
        let (status, body) = inner
            .proxy_response
            .clone()
            .unwrap_or((200, "ok".to_string()));

        let chunks: ByteStream = Box::pin(futures::stream::iter(vec![Ok::<_, io::Error>(
            Bytes::from(body),
        )]));
        let mut response = Response::new(chunks);
        *response.status_mut() = StatusCode::from_u16(status).unwrap();
        Ok(response)
    }

    fn cluster_url(&self) -> String {
        "https://cluster.example:6443".to_string()
    }
}

/// Hands out the fake cluster and remembers the bearer tokens asked for.
pub struct FakeProvider {
    cluster: Arc<FakeCluster>,
    tokens: Mutex<Vec<Option<String>>>,
}

impl FakeProvider {
    pub fn new(cluster: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientProvider for FakeProvider {
    async fn client(
        &self,
        _config: &KubernetesConfig,
        bearer_token: Option<&str>,
    ) -> Result<Arc<dyn KubeApi>, KubeError> {
        self.tokens
            .lock()
            .unwrap()
            .push(bearer_token.map(str::to_string));
        Ok(self.cluster.clone())
    }
}

pub fn config() -> KubernetesConfig {
    KubernetesConfig {
        namespace: "ci".into(),
        helper_image: "registry.example.com/helper:latest".into(),
        poll_attempts: 5,
        log_backoff: BackoffConfig {
            min_ms: 10,
            max_ms: 50,
            factor: 2.0,
        },
        ..KubernetesConfig::default()
    }
}

pub fn job() -> JobSpec {
    JobSpec {
        id: 42,
        project_id: 7,
        runner: "abc123".into(),
        image: Image::new("alpine:3.19"),
        stages: vec![
            StageScript {
                name: "build_script".into(),
                script: "echo hello".into(),
                predefined: false,
            },
            StageScript {
                name: "after_script".into(),
                script: "echo bye".into(),
                predefined: false,
            },
            StageScript {
                name: "upload_artifacts".into(),
                script: "echo upload".into(),
                predefined: true,
            },
        ],
        ..Default::default()
    }
}

pub fn options(job: JobSpec, trace: Arc<BufferTrace>, cancel: CancellationToken) -> PrepareOptions {
    PrepareOptions {
        job,
        trace: trace as Arc<dyn JobTrace>,
        cancel,
    }
}

pub const FAST_POLL: Duration = Duration::from_millis(20);
