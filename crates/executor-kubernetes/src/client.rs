use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Response};
use chrono::{DateTime, Utc};
use executor_core::KubernetesConfig;
use futures::{AsyncBufRead, AsyncBufReadExt, Stream};
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::version::Info;

use crate::error::KubeError;

/// Log lines as the server sends them, one item per line without the newline.
pub type LogLines = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// Split a raw log body into lines. Bytes that are not UTF-8 are replaced
/// rather than ending the stream.
pub fn log_lines<R>(reader: R) -> LogLines
where
    R: AsyncBufRead + Send + 'static,
{
    Box::pin(futures::stream::unfold(
        Box::pin(reader),
        |mut reader| async move {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => None,
                Ok(_) => Some((Ok(decode_line(&buf)), reader)),
                Err(e) => Some((Err(e), reader)),
            }
        },
    ))
}

/// One log line without its line ending.
pub fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Watch events for pods.
pub type PodEvents = Pin<Box<dyn Stream<Item = Result<PodEvent, KubeError>> + Send>>;

/// Response body chunks from a proxied request.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub container: String,
    pub since_time: Option<DateTime<Utc>>,
    pub follow: bool,
    pub timestamps: bool,
}

#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(Pod),
    Deleted(Pod),
}

/// A request forwarded to a service port through the `services/proxy` subresource.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub namespace: String,
    pub service: String,
    /// `http` or `https`, the scheme the service port speaks.
    pub scheme: String,
    pub port: i32,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    /// Path of the request on the API server.
    pub fn api_path(&self) -> String {
        let mut path = format!(
            "/api/v1/namespaces/{}/services/{}:{}:{}/proxy/{}",
            self.namespace,
            self.scheme,
            self.service,
            self.port,
            self.path.trim_start_matches('/')
        );
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            path.push('?');
            path.push_str(query);
        }
        path
    }
}

/// Kubernetes operations the executor relies on.
///
/// The production implementation is [`crate::kube_client::KubeClient`]; tests
/// substitute an in-memory cluster.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, KubeError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubeError>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<(), KubeError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, KubeError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, KubeError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), KubeError>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, KubeError>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), KubeError>;

    async fn create_service(&self, namespace: &str, service: &Service)
        -> Result<Service, KubeError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, KubeError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), KubeError>;

    /// Open the log stream of one container.
    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        options: &LogOptions,
    ) -> Result<LogLines, KubeError>;

    /// Attach to the container's stdin and write `input` to it.
    async fn attach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        input: &[u8],
    ) -> Result<(), KubeError>;

    /// Watch pods matching a label selector. The stream ends only when dropped.
    fn watch_pods(&self, namespace: &str, label_selector: &str) -> PodEvents;

    async fn server_version(&self) -> Result<Info, KubeError>;

    async fn create_access_review(
        &self,
        review: &SelfSubjectAccessReview,
    ) -> Result<SelfSubjectAccessReview, KubeError>;

    /// Send a request through the service proxy and return the raw response.
    async fn proxy(&self, request: ProxyRequest) -> Result<Response<ByteStream>, KubeError>;

    /// Base URL of the API server.
    fn cluster_url(&self) -> String;
}

/// Builds API clients. Called once per job, with the bearer token overwrite when allowed.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(
        &self,
        config: &KubernetesConfig,
        bearer_token: Option<&str>,
    ) -> Result<Arc<dyn KubeApi>, KubeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, query: Option<&str>) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            namespace: "ci".into(),
            service: "db".into(),
            scheme: "http".into(),
            port: 5432,
            path: path.into(),
            query: query.map(String::from),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_log() {
        use futures::StreamExt;

        let body: &[u8] = b"2024-03-01T10:00:00.1Z bad \xff byte\r\n\
2024-03-01T10:00:00.2Z {\"command_exit_code\": 0}\n\
2024-03-01T10:00:00.3Z no newline";
        let lines: Vec<String> = log_lines(futures::io::Cursor::new(body.to_vec()))
            .map(|l| l.unwrap())
            .collect()
            .await;

        assert_eq!(
            lines,
            vec![
                "2024-03-01T10:00:00.1Z bad \u{fffd} byte",
                "2024-03-01T10:00:00.2Z {\"command_exit_code\": 0}",
                "2024-03-01T10:00:00.3Z no newline",
            ]
        );
    }

    #[test]
    fn proxy_path_targets_service_subresource() {
        assert_eq!(
            request("/status", Some("verbose=1")).api_path(),
            "/api/v1/namespaces/ci/services/http:db:5432/proxy/status?verbose=1"
        );
        assert_eq!(
            request("", None).api_path(),
            "/api/v1/namespaces/ci/services/http:db:5432/proxy/"
        );
    }
}
