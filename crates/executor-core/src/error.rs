use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a job ended in a build error. Reported back to the caller alongside the exit code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ScriptFailure,
    RunnerSystemFailure,
    JobExecutionTimeout,
    ImagePullFailure,
    UnknownFailure,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ScriptFailure => write!(f, "script_failure"),
            FailureReason::RunnerSystemFailure => write!(f, "runner_system_failure"),
            FailureReason::JobExecutionTimeout => write!(f, "job_execution_timeout"),
            FailureReason::ImagePullFailure => write!(f, "image_pull_failure"),
            FailureReason::UnknownFailure => write!(f, "unknown_failure"),
        }
    }
}

/// A failure attributable to the job itself rather than to the executor.
///
/// The inner error is kept as a trait object so callers can downcast to the
/// concrete cause (for instance an image pull error).
#[derive(Error, Debug)]
#[error("{inner}")]
pub struct BuildError {
    pub inner: Box<dyn std::error::Error + Send + Sync + 'static>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<FailureReason>,
}

impl BuildError {
    pub fn new<E>(inner: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            inner: inner.into(),
            exit_code: None,
            failure_reason: None,
        }
    }

    /// Non-zero exit of the remote script.
    pub fn exit_code(code: i32) -> Self {
        Self {
            inner: format!("command terminated with exit code {}", code).into(),
            exit_code: Some(code),
            failure_reason: Some(FailureReason::ScriptFailure),
        }
    }

    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.failure_reason = Some(reason);
        self
    }

    /// Downcast the wrapped cause.
    pub fn inner_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("build aborted")]
    Aborted,

    #[error("Executor not prepared")]
    NotPrepared,

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ExecutorError {
    /// The build error carried by this error, if any.
    pub fn as_build_error(&self) -> Option<&BuildError> {
        match self {
            ExecutorError::Build(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug, PartialEq)]
    #[error("pull failed for {0}")]
    struct PullFailed(String);

    #[test]
    fn build_error_displays_inner() {
        let err = BuildError::new("pod \"a\" is deleted");
        assert_eq!(err.to_string(), "pod \"a\" is deleted");
        assert!(err.exit_code.is_none());
    }

    #[test]
    fn build_error_downcasts_to_cause() {
        let err = BuildError::new(PullFailed("alpine".into()))
            .with_reason(FailureReason::ImagePullFailure);
        assert_eq!(
            err.inner_as::<PullFailed>(),
            Some(&PullFailed("alpine".into()))
        );
        assert_eq!(err.failure_reason, Some(FailureReason::ImagePullFailure));
    }

    #[test]
    fn exit_code_error_is_script_failure() {
        let err = ExecutorError::from(BuildError::exit_code(2));
        let build = err.as_build_error().unwrap();
        assert_eq!(build.exit_code, Some(2));
        assert_eq!(build.failure_reason, Some(FailureReason::ScriptFailure));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn aborted_message() {
        assert_eq!(ExecutorError::Aborted.to_string(), "build aborted");
    }
}
