#![deny(missing_docs)]
//! This library provides interactive connect sessions to kubernetes workloads.
//!
//! A session resolves one attachable pod out of the workloads matching a selection query,
//! forwards a local port to it and follows its logs, until interrupted.
//! The adaptive proxy variant keeps re-resolving its backend instead of pinning one pod.

mod access;
mod client;
mod error;
mod lifecycle;
mod logs;
mod pod_selection;
mod port_forward;
mod proxy;
mod resolver;
mod session;
mod workload;

pub use access::{BoxUpstream, InstanceAccess, KubeAccess, LogStream, Upstream};
pub use client::client_from_kubeconfig;
pub use error::{Error, ErrorKind};
pub use lifecycle::{Lifecycle, State, Stopped};
pub use logs::{LogFollower, LogOptions};
pub use port_forward::{LocalPort, PortForward};
pub use proxy::{AdaptiveProxy, ProxyConfig, ProxyHandle};
pub use resolver::{AmbiguityPolicy, Resolver};
pub use session::{connect, follow_logs, AdaptiveOptions, ConnectOptions, SessionContext};
pub use workload::{Candidate, Instance, KubeWorkloads, PodSelector, WorkloadKind, WorkloadSource};

/// The kubernetes api version used throughout the crate.
pub(crate) use k8s_openapi::api::core::v1 as vx;

/// A resolved target: one currently reachable pod and the port to reach within it.
/// Once resolved it is never modified; re-resolution produces a new `Endpoint`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct Endpoint {
    namespace: String,
    pod: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<String>,
}
impl Endpoint {
    /// Returns a new `Self` for the given instance and remote port.
    pub fn new(instance: Instance, port: u16) -> Self {
        let (namespace, pod, container) = instance.into_parts();
        Self {
            namespace,
            pod,
            port,
            container,
        }
    }
    /// The namespace of the pod.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
    /// The pod name.
    pub fn pod(&self) -> &str {
        &self.pod
    }
    /// The remote port within the pod.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// The container whose output is followed, if known.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }
    /// Whether this endpoint points at the given instance.
    pub fn is_instance(&self, instance: &Instance) -> bool {
        self.namespace == instance.namespace() && self.pod == instance.name()
    }
    /// Source prefix used when prefixing log lines, as kubectl does.
    pub(crate) fn log_prefix(&self) -> String {
        match &self.container {
            Some(container) => format!("[pod/{}/{}] ", self.pod, container),
            None => format!("[pod/{}] ", self.pod),
        }
    }
}
impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.port)
    }
}

/// A query selecting the workloads to connect to.
/// At least one of name, label selector or field selector is always set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SelectionQuery {
    name: Option<String>,
    label_selector: Option<String>,
    field_selector: Option<String>,
}
impl SelectionQuery {
    /// Returns a new `Self` from the given parameters, empty strings being treated as unset.
    /// # Arguments
    /// * `name` - the exact workload name
    /// * `label_selector` - label query, eg: `app=demo,tier!=db`
    /// * `field_selector` - field query, eg: `metadata.name=demo`
    pub fn new<N, L, F>(name: N, label_selector: L, field_selector: F) -> Result<Self, Error>
    where
        N: Into<Option<String>>,
        L: Into<Option<String>>,
        F: Into<Option<String>>,
    {
        let non_empty = |value: Option<String>| value.filter(|value| !value.trim().is_empty());
        let query = Self {
            name: non_empty(name.into()),
            label_selector: non_empty(label_selector.into()),
            field_selector: non_empty(field_selector.into()),
        };
        if query.name.is_none() && query.label_selector.is_none() && query.field_selector.is_none()
        {
            return Err(Error::validation(
                "either one of <name>, --field-selector, or --selector is required",
            ));
        }
        Ok(query)
    }
    /// New `Self` selecting the workload with the given name.
    pub fn by_name(name: &str) -> Result<Self, Error> {
        Self::new(name.to_string(), None, None)
    }
    /// New `Self` selecting workloads by the given label key value.
    pub fn by_label(key: &str, val: &str) -> Result<Self, Error> {
        Self::new(None, format!("{key}={val}"), None)
    }
    /// The exact workload name, if set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    /// The label selector, if set.
    pub fn label_selector(&self) -> Option<&str> {
        self.label_selector.as_deref()
    }
    /// The field selector, if set.
    pub fn field_selector(&self) -> Option<&str> {
        self.field_selector.as_deref()
    }
}
