use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, Request, Response};
use executor_core::KubernetesConfig;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::api::{AttachParams, DeleteParams, LogParams, PostParams};
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::client::{
    log_lines, ByteStream, ClientProvider, KubeApi, LogLines, LogOptions, PodEvent, PodEvents,
    ProxyRequest,
};
use crate::error::KubeError;

/// How long an attach stays open after the command was written.
const ATTACH_SETTLE: Duration = Duration::from_secs(2);

/// [`KubeApi`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    cluster_url: String,
}

impl KubeClient {
    pub fn new(client: Client, cluster_url: impl Into<String>) -> Self {
        Self {
            client,
            cluster_url: cluster_url.into(),
        }
    }

    /// Build a client from the executor settings.
    ///
    /// With `host` set the client talks to that server with the configured CA and
    /// bearer token. Otherwise the usual chain applies: in-cluster service account,
    /// then the local kubeconfig. `bearer_token` replaces whatever credentials the
    /// chain found.
    pub async fn from_config(
        config: &KubernetesConfig,
        bearer_token: Option<&str>,
    ) -> Result<Self, KubeError> {
        let token = bearer_token
            .filter(|t| !t.is_empty())
            .or(Some(config.bearer_token.as_str()).filter(|t| !t.is_empty()));

        let mut kube_config = if config.host.is_empty() {
            kube::Config::infer()
                .await
                .map_err(|e| KubeError::Config(e.to_string()))?
        } else {
            let kubeconfig = explicit_kubeconfig(config, token)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| KubeError::Config(e.to_string()))?
        };

        if let Some(token) = bearer_token.filter(|t| !t.is_empty()) {
            kube_config.auth_info = serde_json::from_value::<AuthInfo>(json!({ "token": token }))
                .map_err(|e| KubeError::Config(e.to_string()))?;
        }

        let cluster_url = kube_config.cluster_url.to_string();
        let client = Client::try_from(kube_config)?;
        debug!("Kubernetes client created for {}", cluster_url);

        Ok(Self::new(client, cluster_url))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn explicit_kubeconfig(
    config: &KubernetesConfig,
    token: Option<&str>,
) -> Result<Kubeconfig, KubeError> {
    let mut cluster = json!({ "server": config.host });
    if let Some(ca) = config.ca_file.as_deref().filter(|c| !c.is_empty()) {
        cluster["certificate-authority"] = json!(ca);
    }

    let user = match token {
        Some(token) => json!({ "token": token }),
        None => json!({}),
    };

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "executor", "cluster": cluster }],
        "users": [{ "name": "executor", "user": user }],
        "contexts": [{
            "name": "executor",
            "context": {
                "cluster": "executor",
                "user": "executor",
                "namespace": config.namespace,
            },
        }],
        "current-context": "executor",
    }))
    .map_err(|e| KubeError::Config(e.to_string()))
}

fn delete_params(grace_period_seconds: Option<i64>) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: grace_period_seconds.map(|g| g.max(0) as u32),
        ..DeleteParams::default()
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, KubeError> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubeError> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<(), KubeError> {
        self.pods(namespace)
            .delete(name, &delete_params(grace_period_seconds))
            .await?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, KubeError> {
        Ok(self
            .secrets(namespace)
            .create(&PostParams::default(), secret)
            .await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, KubeError> {
        Ok(self.secrets(namespace).get(name).await?)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, KubeError> {
        Ok(self
            .config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, KubeError> {
        Ok(self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, KubeError> {
        Ok(self.services(namespace).get(name).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        options: &LogOptions,
    ) -> Result<LogLines, KubeError> {
        let params = LogParams {
            container: Some(options.container.clone()).filter(|c| !c.is_empty()),
            follow: options.follow,
            timestamps: options.timestamps,
            since_time: options.since_time,
            ..LogParams::default()
        };
        let reader = self.pods(namespace).log_stream(name, &params).await?;
        Ok(log_lines(reader))
    }

    async fn attach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        input: &[u8],
    ) -> Result<(), KubeError> {
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(false)
            .stderr(false);

        let mut attached = self.pods(namespace).attach(pod, &params).await?;
        let mut stdin = attached
            .stdin()
            .ok_or_else(|| KubeError::Stream("attach did not provide stdin".to_string()))?;

        stdin
            .write_all(input)
            .await
            .map_err(|e| KubeError::Stream(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| KubeError::Stream(e.to_string()))?;
        drop(stdin);

        // the remote side keeps the stream open; give the write time to land
        let _ = tokio::time::timeout(ATTACH_SETTLE, attached.join()).await;
        Ok(())
    }

    fn watch_pods(&self, namespace: &str, label_selector: &str) -> PodEvents {
        let config = watcher::Config::default().labels(label_selector);
        let stream = watcher(self.pods(namespace), config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                        Some(Ok(PodEvent::Applied(pod)))
                    }
                    Ok(watcher::Event::Delete(pod)) => Some(Ok(PodEvent::Deleted(pod))),
                    Ok(_) => None,
                    Err(err) => Some(Err(KubeError::Stream(err.to_string()))),
                }
            });
        Box::pin(stream)
    }

    async fn server_version(&self) -> Result<Info, KubeError> {
        Ok(self.client.apiserver_version().await?)
    }

    async fn create_access_review(
        &self,
        review: &SelfSubjectAccessReview,
    ) -> Result<SelfSubjectAccessReview, KubeError> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), review).await?)
    }

    async fn proxy(&self, request: ProxyRequest) -> Result<Response<ByteStream>, KubeError> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.api_path());
        for (name, value) in request.headers.iter() {
            if name != header::HOST && name != header::AUTHORIZATION {
                builder = builder.header(name, value);
            }
        }
        let http_request = builder
            .body(kube::client::Body::from(request.body.clone()))
            .map_err(|e| KubeError::Transport(e.to_string()))?;

        let response = self.client.send(http_request).await?;
        let (parts, body) = response.into_parts();
        let stream = axum::body::Body::new(body)
            .into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        Ok(Response::from_parts(parts, Box::pin(stream) as ByteStream))
    }

    fn cluster_url(&self) -> String {
        self.cluster_url.clone()
    }
}

/// Provider chain used outside tests.
#[derive(Debug, Default, Clone)]
pub struct DefaultClientProvider;

#[async_trait]
impl ClientProvider for DefaultClientProvider {
    async fn client(
        &self,
        config: &KubernetesConfig,
        bearer_token: Option<&str>,
    ) -> Result<Arc<dyn KubeApi>, KubeError> {
        let client = KubeClient::from_config(config, bearer_token).await?;
        Ok(Arc::new(client))
    }
}
