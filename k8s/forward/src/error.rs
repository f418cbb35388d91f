use snafu::Snafu;

/// All errors that can be returned while resolving or running a connect session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// Bad option combination or malformed local input.
    #[snafu(display("{message}"))]
    Validation {
        /// What is wrong with the input.
        message: String,
    },
    /// No matching or attachable instance.
    #[snafu(display("{message}"))]
    NotFound {
        /// What could not be found.
        message: String,
    },
    /// The cluster could not be reached or refused the request.
    #[snafu(display("Failed to {action}. Error {}", source))]
    Transport {
        /// The failed request.
        action: String,
        /// The client error.
        source: kube::Error,
    },
    /// The kubeconfig file could not be loaded.
    #[snafu(display("Failed to load kubeconfig from {path}. Error {}", source))]
    KubeConfig {
        /// The kubeconfig path.
        path: String,
        /// The loading error.
        source: kube::config::KubeconfigError,
    },
    /// No kubeconfig and no in-cluster configuration.
    #[snafu(display("Failed to infer the cluster configuration. Error {}", source))]
    InferConfig {
        /// The inference error.
        source: kube::config::InferConfigError,
    },
    /// Local socket failure once the session is up.
    #[snafu(display("Failed to {action}. Error {}", source))]
    Stream {
        /// The failed operation.
        action: String,
        /// The socket error.
        source: std::io::Error,
    },
    /// Port-forward or log stream failure reported by the cluster.
    #[snafu(display("Failed to {action}. Error {}", source))]
    RemoteStream {
        /// The failed operation.
        action: String,
        /// The stream error.
        source: kube::Error,
    },
    /// The administrative server failed.
    #[snafu(display("Admin server failure. Error {}", source))]
    Admin {
        /// The server error.
        source: hyper::Error,
    },
    /// A session task panicked or was cancelled by the runtime.
    #[snafu(display("A session task did not complete. Error {}", source))]
    Task {
        /// Why the task did not complete.
        source: tokio::task::JoinError,
    },
}

/// The class of an `Error`, which drives how it propagates.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// Surfaced before any task is launched.
    Validation,
    /// Surfaced before any task is launched.
    NotFound,
    /// Surfaced before any task is launched.
    Transport,
    /// Raised by a running session.
    Stream,
}

impl Error {
    /// Get the class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Transport { .. } | Self::KubeConfig { .. } | Self::InferConfig { .. } => {
                ErrorKind::Transport
            }
            Self::Stream { .. }
            | Self::RemoteStream { .. }
            | Self::Admin { .. }
            | Self::Task { .. } => ErrorKind::Stream,
        }
    }
    /// Returns a validation error with the given message.
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
    /// Returns a not found error with the given message.
    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}
