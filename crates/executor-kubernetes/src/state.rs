use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A proxy service created for the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Proxy name the service is reachable under.
    pub alias: String,
    pub name: String,
}

/// What is needed to find the job's objects again. Objects themselves are re-fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub config_map: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    /// Timestamp of the last forwarded log line, per container.
    #[serde(default)]
    pub offsets: BTreeMap<String, DateTime<Utc>>,
}

/// Executor state shared between the driver and its background tasks.
#[derive(Debug, Default)]
pub struct ExecutorState {
    inner: Mutex<StateSnapshot>,
}

impl ExecutorState {
    pub fn new(namespace: &str) -> Self {
        Self {
            inner: Mutex::new(StateSnapshot {
                namespace: namespace.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn from_encoded(encoded: &str) -> Result<Self, serde_json::Error> {
        let snapshot: StateSnapshot = serde_json::from_str(encoded)?;
        Ok(Self {
            inner: Mutex::new(snapshot),
        })
    }

    pub fn to_encoded(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.lock())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.lock().clone()
    }

    pub fn namespace(&self) -> String {
        self.lock().namespace.clone()
    }

    pub fn set_pod(&self, name: Option<String>) {
        self.lock().pod = name;
    }

    pub fn set_credentials(&self, name: Option<String>) {
        self.lock().credentials = name;
    }

    pub fn set_config_map(&self, name: Option<String>) {
        self.lock().config_map = name;
    }

    pub fn add_service(&self, service: ServiceRef) {
        self.lock().services.push(service);
    }

    /// Forget every object, keeping the namespace. Log offsets go too since the next pod starts fresh.
    pub fn clear_objects(&self) {
        let mut state = self.lock();
        state.pod = None;
        state.credentials = None;
        state.config_map = None;
        state.services.clear();
        state.offsets.clear();
    }

    pub fn offset(&self, container: &str) -> Option<DateTime<Utc>> {
        self.lock().offsets.get(container).copied()
    }

    /// Record a forwarded line. Offsets never move backwards.
    pub fn advance_offset(&self, container: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        let entry = state.offsets.entry(container.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoding_keeps_keys_and_offsets() {
        let state = ExecutorState::new("ci");
        state.set_pod(Some("runner-abc".into()));
        state.set_config_map(Some("scripts-abc".into()));
        state.add_service(ServiceRef {
            alias: "web".into(),
            name: "web-1234abcd".into(),
        });
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        state.advance_offset("build", at);

        let encoded = state.to_encoded().unwrap();
        let restored = ExecutorState::from_encoded(&encoded).unwrap();
        assert_eq!(restored.snapshot(), state.snapshot());
        assert_eq!(restored.offset("build"), Some(at));
    }

    #[test]
    fn offsets_are_monotonic() {
        let state = ExecutorState::new("ci");
        let later = Utc.timestamp_opt(200, 0).unwrap();
        let earlier = Utc.timestamp_opt(100, 0).unwrap();
        state.advance_offset("helper", later);
        state.advance_offset("helper", earlier);
        assert_eq!(state.offset("helper"), Some(later));
        assert_eq!(state.offset("build"), None);
    }

    #[test]
    fn clear_keeps_namespace() {
        let state = ExecutorState::new("ci");
        state.set_pod(Some("p".into()));
        state.advance_offset("build", Utc::now());
        state.clear_objects();
        let snap = state.snapshot();
        assert_eq!(snap.namespace, "ci");
        assert_eq!(snap.pod, None);
        assert!(snap.offsets.is_empty());
    }

    #[test]
    fn old_snapshots_without_optional_fields_load() {
        let state = ExecutorState::from_encoded(r#"{"namespace":"ci","pod":"p"}"#).unwrap();
        assert_eq!(state.snapshot().pod.as_deref(), Some("p"));
        assert!(state.snapshot().services.is_empty());
    }
}
