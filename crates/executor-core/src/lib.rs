pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod state;
pub mod trace;
pub mod variables;

pub use config::{Config, KubernetesConfig};
pub use error::{BuildError, ExecutorError, FailureReason};
pub use executor::{Executor, ExecutorCommand, PrepareOptions};
pub use job::{Credentials, Image, JobSpec, Port, PullPolicy, StageScript};
pub use state::{FileStateStore, StateStore};
pub use trace::{BufferTrace, JobTrace, StdoutTrace};
pub use variables::{JobVariable, JobVariables};
