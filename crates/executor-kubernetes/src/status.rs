//! Reading pod state: phase, readiness and terminal conditions.

use std::time::Duration;

use executor_core::{BuildError, FailureReason, JobTrace};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::KubeApi;
use crate::error::KubeError;
use crate::pull::ImagePullError;

/// Terminal pod conditions reported by the watcher and the status poller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PodError {
    #[error("pod {pod:?} is disrupted: reason {reason:?}, message {message:?}")]
    Disrupted {
        pod: String,
        reason: String,
        message: String,
    },

    #[error("pod {0:?} is being deleted")]
    BeingDeleted(String),

    #[error("pod {0:?} is deleted")]
    Deleted(String),

    #[error("image pull failed: {0}")]
    InvalidImage(String),

    #[error("pod {pod:?} status is {phase:?}")]
    Finished { pod: String, phase: String },
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

/// `namespace/name`, as used in messages.
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or(""),
        pod_name(pod)
    )
}

pub fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

pub fn is_running(pod: &Pod) -> bool {
    phase(pod) == "Running"
}

/// Running with every container reporting ready.
pub fn is_ready(pod: &Pod) -> bool {
    is_running(pod)
        && pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.iter().all(|c| c.ready))
            .unwrap_or(false)
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status
        .iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        })
        .filter(|c| !c.ready)
}

fn waiting(status: &ContainerStatus) -> Option<(&str, &str)> {
    let waiting = status.state.as_ref()?.waiting.as_ref()?;
    Some((
        waiting.reason.as_deref().unwrap_or(""),
        waiting.message.as_deref().unwrap_or(""),
    ))
}

fn spec_image<'a>(pod: &'a Pod, container: &str) -> Option<&'a str> {
    let spec = pod.spec.as_ref()?;
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .find(|c| c.name == container)
        .and_then(|c| c.image.as_deref())
}

/// First container stuck pulling its image.
pub fn image_pull_error(pod: &Pod) -> Option<ImagePullError> {
    container_statuses(pod).find_map(|status| {
        let (reason, message) = waiting(status)?;
        if reason != "ErrImagePull" && reason != "ImagePullBackOff" {
            return None;
        }
        Some(ImagePullError {
            container: status.name.clone(),
            image: spec_image(pod, &status.name)
                .unwrap_or(status.image.as_str())
                .to_string(),
            message: if message.is_empty() {
                reason.to_string()
            } else {
                message.to_string()
            },
        })
    })
}

/// A condition after which the job cannot continue in this pod.
pub fn terminal_error(pod: &Pod) -> Option<BuildError> {
    let key = pod_key(pod);

    let disruption = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.type_ == "DisruptionTarget" && c.status == "True")
        });
    if let Some(cond) = disruption {
        return Some(
            BuildError::new(PodError::Disrupted {
                pod: key,
                reason: cond.reason.clone().unwrap_or_default(),
                message: cond.message.clone().unwrap_or_default(),
            })
            .with_reason(FailureReason::RunnerSystemFailure),
        );
    }

    if pod.metadata.deletion_timestamp.is_some() {
        return Some(
            BuildError::new(PodError::BeingDeleted(key))
                .with_reason(FailureReason::RunnerSystemFailure),
        );
    }

    for status in container_statuses(pod) {
        if let Some(("InvalidImageName", message)) = waiting(status) {
            return Some(
                BuildError::new(PodError::InvalidImage(message.to_string()))
                    .with_reason(FailureReason::ImagePullFailure),
            );
        }
    }

    image_pull_error(pod)
        .map(|err| BuildError::new(err).with_reason(FailureReason::ImagePullFailure))
}

/// Why waiting for the pod stopped.
#[derive(Error, Debug)]
pub enum WaitError {
    #[error(transparent)]
    ImagePull(#[from] ImagePullError),

    #[error(transparent)]
    Kube(#[from] KubeError),

    #[error("pod {pod:?} did not reach Running after {attempts} checks, status is {phase:?}")]
    Timeout {
        pod: String,
        attempts: u32,
        phase: String,
    },

    #[error("pod {0:?} failed to start")]
    Failed(String),

    #[error("build aborted")]
    Aborted,
}

/// Poll the pod until it runs, fails, or the attempts run out.
pub async fn wait_for_running(
    api: &dyn KubeApi,
    namespace: &str,
    name: &str,
    interval: Duration,
    attempts: u32,
    trace: &dyn JobTrace,
    cancel: &CancellationToken,
) -> Result<Pod, WaitError> {
    let mut last_phase = String::from("Unknown");

    for attempt in 0..attempts.max(1) {
        let pod = api.get_pod(namespace, name).await?;

        if let Some(err) = image_pull_error(&pod) {
            return Err(err.into());
        }

        match phase(&pod) {
            "Running" => return Ok(pod),
            "Failed" | "Succeeded" => {
                return Err(WaitError::Failed(format!("{}/{}", namespace, name)))
            }
            other => last_phase = other.to_string(),
        }

        trace.notice(&format!(
            "Waiting for pod {}/{} to be running, status is {}",
            namespace, name, last_phase
        ));

        if attempt + 1 < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Aborted),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    Err(WaitError::Timeout {
        pod: format!("{}/{}", namespace, name),
        attempts,
        phase: last_phase,
    })
}

/// Poll the pod while a stage runs. Returns once the pod is gone or has stopped.
pub async fn watch_pod_status(
    api: &dyn KubeApi,
    namespace: &str,
    name: &str,
    interval: Duration,
) -> BuildError {
    loop {
        tokio::time::sleep(interval).await;

        match api.get_pod(namespace, name).await {
            Ok(pod) => match phase(&pod) {
                "Failed" | "Succeeded" => {
                    return BuildError::new(PodError::Finished {
                        pod: pod_key(&pod),
                        phase: phase(&pod).to_string(),
                    })
                    .with_reason(FailureReason::RunnerSystemFailure)
                }
                _ => continue,
            },
            Err(err) if err.is_not_found() => {
                return BuildError::new(err).with_reason(FailureReason::RunnerSystemFailure)
            }
            Err(err) => tracing::debug!("checking pod {}/{}: {}", namespace, name, err),
        }
    }
}
