use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use executor_core::{JobTrace, PullPolicy};
use thiserror::Error;
use tracing::{info, warn};

/// The kubelet could not pull an image for one of the job's containers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("image pull failed for {image:?} in container {container:?}: {message}")]
pub struct ImagePullError {
    pub container: String,
    pub image: String,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("no more pull policies to try for container {0:?}")]
    NoMorePolicies(String),
}

#[derive(Default)]
struct PullState {
    policies: HashMap<String, Vec<Option<PullPolicy>>>,
    failures: HashMap<String, usize>,
}

/// Tracks which pull policy each container should use next.
///
/// Each container walks its own ordered list of policies; every recorded pull
/// failure moves it one step further. An empty list means the cluster default
/// is tried once.
pub struct PullManager {
    state: Mutex<PullState>,
    trace: Option<Arc<dyn JobTrace>>,
}

fn policy_name(policy: Option<PullPolicy>) -> &'static str {
    policy.map(|p| p.as_k8s()).unwrap_or("")
}

impl PullManager {
    pub fn new(policies: HashMap<String, Vec<PullPolicy>>) -> Self {
        let policies = policies
            .into_iter()
            .map(|(container, list)| {
                let list = if list.is_empty() {
                    vec![None]
                } else {
                    list.into_iter().map(Some).collect()
                };
                (container, list)
            })
            .collect();

        Self {
            state: Mutex::new(PullState {
                policies,
                failures: HashMap::new(),
            }),
            trace: None,
        }
    }

    /// Mirror pull messages into the job trace.
    pub fn with_trace(mut self, trace: Arc<dyn JobTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Policy to use for the next pull of `container`'s image. `None` leaves the choice to the cluster.
    pub fn policy_for(&self, container: &str) -> Result<Option<PullPolicy>, PullError> {
        let state = self.lock();
        let Some(policies) = state.policies.get(container) else {
            return Ok(None);
        };
        let failures = state.failures.get(container).copied().unwrap_or(0);

        policies
            .get(failures)
            .copied()
            .ok_or_else(|| PullError::NoMorePolicies(container.to_string()))
    }

    /// Record a failed pull. Returns true when another policy is left to try.
    pub fn record_failure(&self, attempt: u32, err: &ImagePullError) -> bool {
        let mut state = self.lock();
        let Some(policies) = state.policies.get(&err.container).cloned() else {
            return false;
        };

        let failures = state.failures.entry(err.container.clone()).or_insert(0);
        let failed = policies.get(*failures).copied().flatten();
        *failures += 1;
        let next = policies.get(*failures).copied();
        drop(state);

        let message = format!(
            "Failed to pull image {:?} for container {:?} with policy {:?}: {}",
            err.image,
            err.container,
            policy_name(failed),
            err.message
        );
        warn!("{}", message);
        self.notice(&message);

        match next {
            Some(policy) => {
                let message = format!(
                    "Attempt #{}: Trying {:?} pull policy for {:?} image for container {:?}",
                    attempt + 1,
                    policy_name(policy),
                    err.image,
                    err.container
                );
                info!("{}", message);
                self.notice(&message);
                true
            }
            None => false,
        }
    }

    fn notice(&self, message: &str) {
        if let Some(trace) = &self.trace {
            trace.notice(message);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PullState> {
        // a poisoned lock still holds consistent counters
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
