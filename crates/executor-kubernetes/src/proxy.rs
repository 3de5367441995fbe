//! Reverse proxy from the job session to ports exposed by the build and service containers.
//!
//! Requests go through the API server's `services/proxy` subresource, so the
//! session never needs direct network access to the pod.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use executor_core::Port;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::{KubeApi, ProxyRequest};
use crate::error::KubeError;
use crate::status;

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy {0:?} not found")]
    UnknownProxy(String),

    #[error("port {port:?} not found for proxy {proxy:?}")]
    UnknownPort { proxy: String, port: String },

    #[error("proxy {0:?} is not available yet")]
    NotBound(String),

    #[error("pod {pod:?} is not ready: {reason}")]
    NotReady { pod: String, reason: String },

    #[error("websocket proxying is not available")]
    NoTerminalProxy,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Upstream(KubeError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownProxy(_) | ProxyError::UnknownPort { .. } => StatusCode::NOT_FOUND,
            ProxyError::NotBound(_) | ProxyError::NotReady { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::NoTerminalProxy => StatusCode::NOT_IMPLEMENTED,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(err) => err
                .code()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            // do not leak cluster details to the session
            debug!("Proxy request unavailable: {}", self);
            return (status, "Service Unavailable").into_response();
        }
        warn!("Proxy request failed: {}", self);
        (status, self.to_string()).into_response()
    }
}

/// Hands an upgraded connection to something that can speak to the upstream websocket.
#[async_trait]
pub trait TerminalProxy: Send + Sync {
    async fn proxy(&self, socket: WebSocket, upstream_url: String, api: Arc<dyn KubeApi>);
}

/// Ports of one proxied container and the service that fronts them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub service_name: Option<String>,
    pub ports: Vec<Port>,
}

impl ProxySettings {
    /// Find a port by number or by name.
    pub fn port(&self, port: &str) -> Option<&Port> {
        match port.parse::<i32>() {
            Ok(number) => self.ports.iter().find(|p| p.number == number),
            Err(_) => self.ports.iter().find(|p| !p.name.is_empty() && p.name == port),
        }
    }
}

#[derive(Clone)]
struct Binding {
    api: Arc<dyn KubeApi>,
    namespace: String,
    pod: String,
}

/// A resolved proxy destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub namespace: String,
    pub service: String,
    pub port: Port,
}

impl ProxyTarget {
    fn scheme(&self) -> &str {
        if self.port.protocol == "https" {
            "https"
        } else {
            "http"
        }
    }

    /// Websocket URL of the target under the API server.
    pub fn websocket_url(&self, cluster_url: &str, path: &str) -> String {
        let base = cluster_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!(
            "{}/api/v1/namespaces/{}/services/{}:{}:{}/proxy/{}",
            base,
            self.namespace,
            self.scheme(),
            self.service,
            self.port.number,
            path.trim_start_matches('/')
        )
    }
}

/// Proxies registered for the running job, keyed by alias.
#[derive(Default)]
pub struct ProxyPool {
    proxies: RwLock<HashMap<String, ProxySettings>>,
    binding: RwLock<Option<Binding>>,
    terminal: Option<Arc<dyn TerminalProxy>>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terminal_proxy(mut self, terminal: Arc<dyn TerminalProxy>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn register(&self, name: &str, ports: Vec<Port>) {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        proxies.insert(
            name.to_string(),
            ProxySettings {
                service_name: None,
                ports,
            },
        );
    }

    /// Activate a proxy once its service exists.
    pub fn set_service_name(&self, name: &str, service: &str) {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        if let Some(settings) = proxies.get_mut(name) {
            settings.service_name = Some(service.to_string());
        }
    }

    pub fn settings(&self, name: &str) -> Option<ProxySettings> {
        let proxies = self.proxies.read().unwrap_or_else(|e| e.into_inner());
        proxies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let proxies = self.proxies.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = proxies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Point the pool at the job's pod once it has been created.
    pub fn bind(&self, api: Arc<dyn KubeApi>, namespace: &str, pod: &str) {
        let mut binding = self.binding.write().unwrap_or_else(|e| e.into_inner());
        *binding = Some(Binding {
            api,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        });
    }

    /// Forget the pod and every proxy.
    pub fn clear(&self) {
        self.binding
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.proxies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn binding(&self) -> Option<Binding> {
        self.binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve a proxy and port, checking that the pod can serve it.
    pub async fn resolve(&self, name: &str, port: &str) -> Result<ProxyTarget, ProxyError> {
        let (target, binding) = self.lookup(name, port)?;

        let pod = binding
            .api
            .get_pod(&binding.namespace, &binding.pod)
            .await
            .map_err(|e| ProxyError::NotReady {
                pod: binding.pod.clone(),
                reason: e.to_string(),
            })?;
        if !status::is_ready(&pod) {
            return Err(ProxyError::NotReady {
                pod: binding.pod.clone(),
                reason: format!("status is {}", status::phase(&pod)),
            });
        }

        Ok(target)
    }

    fn lookup(&self, name: &str, port: &str) -> Result<(ProxyTarget, Binding), ProxyError> {
        let settings = self
            .settings(name)
            .ok_or_else(|| ProxyError::UnknownProxy(name.to_string()))?;
        let found = settings
            .port(port)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownPort {
                proxy: name.to_string(),
                port: port.to_string(),
            })?;
        let service = settings
            .service_name
            .clone()
            .ok_or_else(|| ProxyError::NotBound(name.to_string()))?;
        let binding = self
            .binding()
            .ok_or_else(|| ProxyError::NotBound(name.to_string()))?;

        let target = ProxyTarget {
            namespace: binding.namespace.clone(),
            service,
            port: found,
        };
        Ok((target, binding))
    }

    async fn forward(
        self: Arc<Self>,
        name: String,
        port: String,
        path: String,
        ws: Option<WebSocketUpgrade>,
        request: Request,
    ) -> Result<Response, ProxyError> {
        let target = self.resolve(&name, &port).await?;
        let binding = self
            .binding()
            .ok_or_else(|| ProxyError::NotBound(name.clone()))?;

        if let Some(ws) = ws {
            let terminal = self.terminal.clone().ok_or(ProxyError::NoTerminalProxy)?;
            let url = target.websocket_url(&binding.api.cluster_url(), &path);
            let api = binding.api.clone();
            debug!("Proxying websocket to {}", url);
            return Ok(ws.on_upgrade(move |socket| async move {
                terminal.proxy(socket, url, api).await;
            }));
        }

        let (parts, body) = request.into_parts();
        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

        let mut headers = parts.headers;
        for hop in [header::HOST, header::CONNECTION, header::TRANSFER_ENCODING] {
            headers.remove(hop);
        }

        let upstream = ProxyRequest {
            method: parts.method,
            namespace: target.namespace.clone(),
            service: target.service.clone(),
            scheme: target.scheme().to_string(),
            port: target.port.number,
            path,
            query: parts.uri.query().map(str::to_string),
            headers,
            body,
        };

        let response = binding
            .api
            .proxy(upstream)
            .await
            .map_err(ProxyError::Upstream)?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok((StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response());
        }

        let (parts, stream) = response.into_parts();
        Ok(Response::from_parts(parts, Body::from_stream(stream)))
    }
}

async fn handle_path(
    State(pool): State<Arc<ProxyPool>>,
    Path((name, port, path)): Path<(String, String, String)>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    pool.forward(name, port, path, ws, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_root(
    State(pool): State<Arc<ProxyPool>>,
    Path((name, port)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    pool.forward(name, port, String::new(), ws, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// Routes `/proxy/{name}/{port}/{path}` to the pool.
pub fn router(pool: Arc<ProxyPool>) -> Router {
    Router::new()
        .route("/proxy/:name/:port", any(handle_root))
        .route("/proxy/:name/:port/*path", any(handle_path))
        .with_state(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(number: i32, name: &str, protocol: &str) -> Port {
        Port {
            number,
            protocol: protocol.into(),
            name: name.into(),
        }
    }

    #[test]
    fn port_by_number_or_name() {
        let settings = ProxySettings {
            service_name: None,
            ports: vec![port(80, "web", "http"), port(443, "", "https")],
        };
        assert_eq!(settings.port("80").unwrap().number, 80);
        assert_eq!(settings.port("web").unwrap().number, 80);
        assert_eq!(settings.port("443").unwrap().number, 443);
        assert!(settings.port("8080").is_none());
        assert!(settings.port("").is_none());
    }

    #[test]
    fn websocket_url_rewrites_scheme() {
        let target = ProxyTarget {
            namespace: "ci".into(),
            service: "web-1234".into(),
            port: port(443, "", "https"),
        };
        assert_eq!(
            target.websocket_url("https://10.0.0.1:6443/", "/term"),
            "wss://10.0.0.1:6443/api/v1/namespaces/ci/services/https:web-1234:443/proxy/term"
        );

        let plain = ProxyTarget {
            port: port(80, "", "http"),
            ..target
        };
        assert!(plain
            .websocket_url("http://localhost:8001", "")
            .starts_with("ws://localhost:8001/api/v1/namespaces/ci/services/http:web-1234:80/proxy/"));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            ProxyError::UnknownProxy("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::NotReady {
                pod: "p".into(),
                reason: "r".into()
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let upstream = KubeError::Api {
            code: 403,
            reason: "Forbidden".into(),
            message: "services \"web\" is forbidden".into(),
        };
        assert_eq!(ProxyError::Upstream(upstream).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn registry_lifecycle() {
        let pool = ProxyPool::new();
        pool.register("web", vec![port(80, "", "http")]);
        assert!(matches!(pool.lookup("web", "80"), Err(ProxyError::NotBound(_))));

        pool.set_service_name("web", "web-1234");
        assert_eq!(
            pool.settings("web").unwrap().service_name.as_deref(),
            Some("web-1234")
        );
        assert!(matches!(
            pool.lookup("db", "5432"),
            Err(ProxyError::UnknownProxy(_))
        ));
        assert!(matches!(
            pool.lookup("web", "81"),
            Err(ProxyError::UnknownPort { .. })
        ));

        pool.clear();
        assert!(pool.names().is_empty());
    }
}
