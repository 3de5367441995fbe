use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use executor_core::{BuildError, FailureReason};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{KubeApi, PodEvent};
use crate::status::{self, PodError};

/// Watches the job's pods and reports conditions that end the job.
///
/// Only events for the pod currently named by [`PodWatcher::update_pod_name`]
/// are considered, so the executor can recreate the pod under a new name
/// without restarting the watch. Errors are only delivered while a
/// [`Listening`] guard is held; anything raised between stages is dropped.
pub struct PodWatcher {
    current: Arc<Mutex<String>>,
    listening: Arc<AtomicBool>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PodWatcher {
    /// Start watching. Errors are delivered on the returned channel, which has a single consumer.
    pub fn start(
        api: Arc<dyn KubeApi>,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        emit_timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<BuildError>) {
        let (tx, rx) = mpsc::channel(1);
        let current = Arc::new(Mutex::new(String::new()));
        let listening = Arc::new(AtomicBool::new(false));
        let stop = cancel.child_token();

        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let handle = tokio::spawn(watch_loop(
            api,
            namespace.to_string(),
            selector,
            current.clone(),
            listening.clone(),
            tx,
            emit_timeout,
            stop.clone(),
        ));

        let watcher = Self {
            current,
            listening,
            stop,
            handle: Some(handle),
        };
        (watcher, rx)
    }

    /// Switch the watched pod.
    pub fn update_pod_name(&self, name: &str) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = name.to_string();
    }

    pub fn pod_name(&self) -> String {
        self.current
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Deliver errors until the guard is dropped.
    pub fn listen(&self) -> Listening<'_> {
        self.listening.store(true, Ordering::SeqCst);
        Listening {
            flag: &self.listening,
        }
    }

    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

pub struct Listening<'a> {
    flag: &'a AtomicBool,
}

impl Drop for Listening<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Drop for PodWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn watch_loop(
    api: Arc<dyn KubeApi>,
    namespace: String,
    selector: String,
    current: Arc<Mutex<String>>,
    listening: Arc<AtomicBool>,
    tx: mpsc::Sender<BuildError>,
    emit_timeout: Duration,
    stop: CancellationToken,
) {
    let mut events = api.watch_pods(&namespace, &selector);
    debug!("Watching pods in {} with selector {:?}", namespace, selector);

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(err)) => {
                debug!("Pod watch error: {}", err);
                continue;
            }
            None => break,
        };

        let watched = current.lock().map(|c| c.clone()).unwrap_or_default();
        let Some(err) = check_event(&event, &watched) else {
            continue;
        };
        if listening.load(Ordering::SeqCst) {
            emit(&tx, err, emit_timeout).await;
        } else {
            debug!("No stage is running, dropping pod watcher error: {}", err);
        }
    }
}

fn check_event(event: &PodEvent, watched: &str) -> Option<BuildError> {
    match event {
        PodEvent::Applied(pod) if status::pod_name(pod) == watched => status::terminal_error(pod),
        PodEvent::Deleted(pod) if status::pod_name(pod) == watched => Some(
            BuildError::new(PodError::Deleted(status::pod_key(pod)))
                .with_reason(FailureReason::RunnerSystemFailure),
        ),
        _ => None,
    }
}

async fn emit(tx: &mpsc::Sender<BuildError>, err: BuildError, timeout: Duration) {
    if let Err(e) = tx.send_timeout(err, timeout).await {
        let dropped = match e {
            mpsc::error::SendTimeoutError::Timeout(err) => err,
            mpsc::error::SendTimeoutError::Closed(err) => err,
        };
        debug!("No consumer for pod watcher error, dropping: {}", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ci".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn ignores_other_pods() {
        assert!(check_event(&PodEvent::Deleted(pod("old")), "new").is_none());
        assert!(check_event(&PodEvent::Deleted(pod("new")), "new").is_some());
    }

    #[test]
    fn delete_event_message() {
        let err = check_event(&PodEvent::Deleted(pod("runner-1")), "runner-1").unwrap();
        assert_eq!(err.to_string(), "pod \"ci/runner-1\" is deleted");
        assert_eq!(err.failure_reason, Some(FailureReason::RunnerSystemFailure));
    }

    #[test]
    fn applied_pod_with_deletion_timestamp() {
        let mut p = pod("runner-1");
        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let err = check_event(&PodEvent::Applied(p), "runner-1").unwrap();
        assert_eq!(err.to_string(), "pod \"ci/runner-1\" is being deleted");
    }

    #[tokio::test]
    async fn emit_drops_when_nobody_receives() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, BuildError::new("first"), Duration::from_millis(1)).await;
        emit(&tx, BuildError::new("second"), Duration::from_millis(1)).await;

        assert_eq!(rx.recv().await.unwrap().to_string(), "first");
        assert!(rx.try_recv().is_err());
    }
}
