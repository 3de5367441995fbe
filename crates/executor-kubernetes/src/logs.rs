//! Follows container logs, forwards script output to the job trace and picks out exit markers.
//!
//! Each watched container gets its own task. A broken stream is reopened with
//! `sinceTime` set to the last forwarded line; the server only honours whole
//! seconds there, so lines from the resume second come back and are dropped
//! by timestamp. Anything at or before the resume offset is dropped as well,
//! which covers a follower started from a persisted offset.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use executor_core::config::BackoffConfig;
use executor_core::JobTrace;
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{KubeApi, LogOptions};
use crate::error::KubeError;
use crate::state::ExecutorState;

/// Above this many remembered timestamps, the ones before the current second are forgotten.
const MAX_PROCESSED: usize = 1024;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Exit marker printed by the stage script wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExitStatus {
    pub command_exit_code: i32,
    #[serde(default)]
    pub script: String,
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log line {0:?} has no timestamp")]
    MissingTimestamp(String),

    #[error("log line timestamp {timestamp:?} is invalid: {message}")]
    InvalidTimestamp { timestamp: String, message: String },

    #[error("log stream ended")]
    Eof,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Kube(#[from] KubeError),
}

/// Split `RFC3339Nano SPACE payload`.
pub fn parse_line(line: &str) -> Result<(DateTime<Utc>, &str), LogError> {
    let (timestamp, payload) = line
        .split_once(' ')
        .ok_or_else(|| LogError::MissingTimestamp(line.to_string()))?;

    let at = DateTime::parse_from_rfc3339(timestamp).map_err(|e| LogError::InvalidTimestamp {
        timestamp: timestamp.to_string(),
        message: e.to_string(),
    })?;
    Ok((at.with_timezone(&Utc), payload))
}

pub fn parse_exit_status(payload: &str) -> Option<ExitStatus> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') || !trimmed.contains("command_exit_code") {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Timestamps already forwarded on one stream.
#[derive(Debug, Default)]
pub struct ProcessedTimestamps {
    seen: HashSet<i64>,
}

impl ProcessedTimestamps {
    /// True the first time a timestamp is offered.
    pub fn first_time(&mut self, at: DateTime<Utc>) -> bool {
        let key = at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        if !self.seen.insert(key) {
            return false;
        }

        if self.seen.len() > MAX_PROCESSED {
            let second_start = key - key.rem_euclid(NANOS_PER_SECOND);
            self.seen.retain(|k| *k >= second_start);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Reconnect delays: `min`, growing by `factor` up to `max`, without jitter.
pub fn reconnect_backoff(config: &BackoffConfig) -> ExponentialBuilder {
    let min = Duration::from_millis(config.min_ms);
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(Duration::from_millis(config.max_ms).max(min))
        .with_factor(config.factor.max(1.0) as f32)
        .with_max_times(usize::MAX)
}

/// Starts one follower per container.
pub struct LogProcessor {
    api: Arc<dyn KubeApi>,
    namespace: String,
    pod: String,
    containers: Vec<String>,
    state: Arc<ExecutorState>,
    trace: Arc<dyn JobTrace>,
    backoff: BackoffConfig,
}

impl LogProcessor {
    pub fn new(
        api: Arc<dyn KubeApi>,
        namespace: &str,
        pod: &str,
        containers: &[&str],
        state: Arc<ExecutorState>,
        trace: Arc<dyn JobTrace>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            containers: containers.iter().map(|c| c.to_string()).collect(),
            state,
            trace,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start following. Exit markers from every container arrive on the returned channel.
    pub fn start(self, cancel: &CancellationToken) -> (LogProcessorHandle, mpsc::Receiver<ExitStatus>) {
        let (tx, rx) = mpsc::channel(16);
        let stop = cancel.child_token();

        let tasks = self
            .containers
            .iter()
            .map(|container| {
                let follower = Follower {
                    api: self.api.clone(),
                    namespace: self.namespace.clone(),
                    pod: self.pod.clone(),
                    container: container.clone(),
                    state: self.state.clone(),
                    trace: self.trace.clone(),
                    exits: tx.clone(),
                };
                tokio::spawn(follower.run(self.backoff.clone(), stop.clone()))
            })
            .collect();

        (LogProcessorHandle { stop, tasks }, rx)
    }
}

/// Stops the followers when dropped.
pub struct LogProcessorHandle {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LogProcessorHandle {
    pub async fn stop(&mut self) {
        self.stop.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for LogProcessorHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Follower {
    api: Arc<dyn KubeApi>,
    namespace: String,
    pod: String,
    container: String,
    state: Arc<ExecutorState>,
    trace: Arc<dyn JobTrace>,
    exits: mpsc::Sender<ExitStatus>,
}

impl Follower {
    async fn run(self, backoff: BackoffConfig, stop: CancellationToken) {
        let builder = reconnect_backoff(&backoff);
        let cap = Duration::from_millis(backoff.max_ms);
        let mut delays = builder.build();
        let mut processed = ProcessedTimestamps::default();

        loop {
            let mut connected = false;
            let result = tokio::select! {
                _ = stop.cancelled() => return,
                result = self.stream(&mut processed, &mut connected) => result,
            };
            if connected {
                delays = builder.build();
            }

            let err = match result {
                Ok(()) => LogError::Eof,
                Err(err) => err,
            };
            let delay = delays.next().unwrap_or(cap);
            debug!(
                "Log stream of {}/{} container {} broke ({}), reconnecting in {:?}",
                self.namespace, self.pod, self.container, err, delay
            );

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Read one connection until it ends.
    async fn stream(
        &self,
        processed: &mut ProcessedTimestamps,
        connected: &mut bool,
    ) -> Result<(), LogError> {
        let options = LogOptions {
            container: self.container.clone(),
            since_time: self.state.offset(&self.container),
            follow: true,
            timestamps: true,
        };
        let mut lines = self
            .api
            .pod_logs(&self.namespace, &self.pod, &options)
            .await?;
        *connected = true;

        while let Some(line) = lines.next().await {
            let line = line?;
            let (at, payload) = parse_line(&line)?;
            if options.since_time.is_some_and(|since| at <= since) || !processed.first_time(at) {
                continue;
            }

            match parse_exit_status(payload) {
                Some(status) => {
                    self.state.advance_offset(&self.container, at);
                    if self.exits.send(status).await.is_err() {
                        debug!("Exit marker dropped, nobody is waiting");
                    }
                }
                None => {
                    self.trace.write_line(payload);
                    self.state.advance_offset(&self.container, at);
                }
            }
        }

        Ok(())
    }
}
