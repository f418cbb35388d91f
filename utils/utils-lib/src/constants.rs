//! Various common constants used by the connect tooling.

/// The namespace used when none is specified.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The port the application container listens on when none is specified.
pub const DEFAULT_REMOTE_PORT: u16 = 80;

/// How long to wait for a workload to have an attachable (running) pod.
pub const DEFAULT_POD_RUNNING_TIMEOUT: &str = "30s";

/// How long in-flight activity may continue after the first interrupt.
pub const DEFAULT_GRACE_PERIOD: &str = "2s";

/// The period at which the adaptive proxy re-evaluates its backend.
pub const DEFAULT_REFRESH_INTERVAL: &str = "5s";

/// The pod annotation naming the container kubectl attaches to by default.
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

/// Loopback address every local listener binds to.
pub const LOCALHOST: [u8; 4] = [127, 0, 0, 1];
