use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::client::KubeApi;
use crate::error::KubeError;
use crate::status;

/// Pause between attach attempts after a dial failure.
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("pod {pod:?} is not running, status is {phase:?}")]
    NotRunning { pod: String, phase: String },

    #[error("pod {0:?} has no containers")]
    NoContainers(String),

    #[error(transparent)]
    Kube(#[from] KubeError),
}

/// Starts stages by writing a command to a container's stdin.
///
/// Output is not read here; it arrives through the pod log stream.
pub struct AttachSession<'a> {
    api: &'a dyn KubeApi,
    namespace: &'a str,
    pod: &'a str,
    retries: u32,
}

impl<'a> AttachSession<'a> {
    pub fn new(api: &'a dyn KubeApi, namespace: &'a str, pod: &'a str, retries: u32) -> Self {
        Self {
            api,
            namespace,
            pod,
            retries: retries.max(1),
        }
    }

    /// Send `command` to `container`, or to the first container when the name is empty.
    pub async fn send(&self, container: &str, command: &str) -> Result<(), AttachError> {
        let mut attempt = 1;
        loop {
            match self.try_send(container, command).await {
                Err(AttachError::Kube(err)) if err.is_dial_backend() && attempt < self.retries => {
                    warn!(
                        "Attaching to {}/{} failed (attempt {}/{}): {}",
                        self.namespace, self.pod, attempt, self.retries, err
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    async fn try_send(&self, container: &str, command: &str) -> Result<(), AttachError> {
        let pod = self.api.get_pod(self.namespace, self.pod).await?;
        if !status::is_running(&pod) {
            return Err(AttachError::NotRunning {
                pod: status::pod_key(&pod),
                phase: status::phase(&pod).to_string(),
            });
        }

        let container = if container.is_empty() {
            pod.spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .map(|c| c.name.clone())
                .ok_or_else(|| AttachError::NoContainers(status::pod_key(&pod)))?
        } else {
            container.to_string()
        };

        debug!(
            "Attaching to {}/{} container {}",
            self.namespace, self.pod, container
        );
        self.api
            .attach(self.namespace, self.pod, &container, command.as_bytes())
            .await?;
        Ok(())
    }
}
