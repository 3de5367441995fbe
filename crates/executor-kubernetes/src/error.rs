use executor_core::ExecutorError;
use kube::client::UpgradeConnectionError;
use thiserror::Error;

/// Failure talking to the API server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KubeError {
    /// The server answered with a Status object.
    #[error("{message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("client configuration: {0}")]
    Config(String),

    /// The server refused to switch an attach or exec connection to a stream.
    #[error("failed to upgrade connection: server answered {code}")]
    Upgrade { code: u16 },

    #[error("{0}")]
    Transport(String),
}

impl KubeError {
    /// NotFound in the wording the API server uses.
    pub fn not_found(resource: &str, name: &str) -> Self {
        KubeError::Api {
            code: 404,
            reason: "NotFound".to_string(),
            message: format!("{} \"{}\" not found", resource, name),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            KubeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// The kubelet connection behind an attach or exec failed to come up.
    ///
    /// A refused upgrade carries no Status body, so any 500 there counts.
    pub fn is_dial_backend(&self) -> bool {
        match self {
            KubeError::Api { code: 500, message, .. } => message.contains("error dialing backend"),
            KubeError::Upgrade { code: 500 } => true,
            _ => false,
        }
    }
}

impl From<kube::Error> for KubeError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => KubeError::Api {
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            },
            kube::Error::InferConfig(e) => KubeError::Config(e.to_string()),
            kube::Error::UpgradeConnection(UpgradeConnectionError::ProtocolSwitch(status)) => {
                KubeError::Upgrade {
                    code: status.as_u16(),
                }
            }
            other => KubeError::Transport(other.to_string()),
        }
    }
}

impl From<KubeError> for ExecutorError {
    fn from(err: KubeError) -> Self {
        ExecutorError::Kubernetes(err.to_string())
    }
}
