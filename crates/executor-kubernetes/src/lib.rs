pub mod attach;
pub mod client;
pub mod dns;
pub mod error;
pub mod executor;
pub mod feature;
pub mod kube_client;
pub mod logs;
pub mod overwrites;
pub mod pod;
pub mod proxy;
pub mod pull;
pub mod quantity;
pub mod shell;
pub mod state;
pub mod status;
pub mod watcher;

pub use client::{ClientProvider, KubeApi};
pub use error::KubeError;
pub use executor::{delete_resources, state_key, KubernetesExecutor};
pub use feature::{FeatureChecker, GroupVersionResource};
pub use kube_client::{DefaultClientProvider, KubeClient};
pub use proxy::{router, ProxyPool, TerminalProxy};
pub use pull::ImagePullError;
pub use state::{ExecutorState, StateSnapshot};
