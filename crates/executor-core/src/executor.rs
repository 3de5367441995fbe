use crate::error::ExecutorError;
use crate::job::JobSpec;
use crate::trace::JobTrace;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an executor needs to get ready for one job.
#[derive(Clone)]
pub struct PrepareOptions {
    pub job: JobSpec,
    pub trace: Arc<dyn JobTrace>,
    /// Cancelled when the caller aborts the job.
    pub cancel: CancellationToken,
}

/// One build stage to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCommand {
    pub stage: String,
    pub predefined: bool,
}

impl ExecutorCommand {
    pub fn new(stage: impl Into<String>, predefined: bool) -> Self {
        Self {
            stage: stage.into(),
            predefined,
        }
    }
}

/// Core executor trait.
///
/// The caller drives `prepare`, then `run` once per stage, then `cleanup`.
/// `cleanup` must be called even when `prepare` or a stage failed.
#[async_trait::async_trait]
pub trait Executor: Send {
    /// Executor type string ("kubernetes").
    fn name(&self) -> &str;

    /// Validate the job and acquire what the stages will need. Nothing is created yet.
    async fn prepare(&mut self, options: PrepareOptions) -> Result<(), ExecutorError>;

    /// Run one stage to completion.
    async fn run(&mut self, command: ExecutorCommand) -> Result<(), ExecutorError>;

    /// Release every resource created for the job. Never fails; problems are logged.
    async fn cleanup(&mut self);
}
