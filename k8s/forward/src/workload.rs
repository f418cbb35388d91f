use crate::{
    error::{Error, Transport},
    pod_selection::{Attachable, PodSelection},
    vx::Pod,
    SelectionQuery,
};
use async_trait::async_trait;
use k8s_openapi::{
    api::apps::v1::{DaemonSet, Deployment, StatefulSet},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    NamespaceResourceScope,
};
use kube::{
    api::{Api, ListParams},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use std::fmt::Debug;

/// Page size used when listing.
const LIST_LIMIT: u32 = 100;

/// How the pods of a candidate workload are found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PodSelector {
    /// Pods matching a label selector.
    Labels(String),
    /// The pod with this exact name, when the candidate is a pod itself.
    Name(String),
    /// The workload selects no pods.
    Nothing,
}

/// A workload listed by a selection query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
    name: String,
    pods: PodSelector,
}
impl Candidate {
    /// Returns a new `Self` from the given workload name and pod selector.
    pub fn new(name: impl Into<String>, pods: PodSelector) -> Self {
        Self {
            name: name.into(),
            pods,
        }
    }
    /// The workload name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// How its pods are found.
    pub fn pods(&self) -> &PodSelector {
        &self.pods
    }
}

/// One attachable process instance, ie: a running pod.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    namespace: String,
    name: String,
    container: Option<String>,
}
impl Instance {
    /// Returns a new `Self` from the given parameters.
    /// # Arguments
    /// * `namespace` - namespace of the pod
    /// * `name` - pod name
    /// * `container` - default container of the pod, if any
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        container: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            container,
        }
    }
    /// The namespace of the pod.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
    /// The pod name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Convert `Self` into a tuple of `namespace`, `name` and `container`.
    pub(crate) fn into_parts(self) -> (String, String, Option<String>) {
        (self.namespace, self.name, self.container)
    }
}

/// Capability to list candidate workloads and their attachable instances.
/// There is one implementation per backing resource kind.
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Lists the workloads matching the query's selectors, in server order.
    /// The exact name of the query is not applied here.
    async fn list_candidates(&self, query: &SelectionQuery) -> Result<Vec<Candidate>, Error>;
    /// Lists the currently attachable instances of the candidate, best first.
    async fn attachable_instances(&self, candidate: &Candidate) -> Result<Vec<Instance>, Error>;
}

/// The kind of kubernetes resource a selection query lists.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, strum_macros::EnumString, strum_macros::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum WorkloadKind {
    /// apps/v1 Deployment.
    #[default]
    Deployment,
    /// apps/v1 StatefulSet.
    StatefulSet,
    /// apps/v1 DaemonSet.
    DaemonSet,
    /// v1 Pod, each pod being its own workload.
    Pod,
}

/// A workload resource which owns pods through a label selector.
trait PodOwner {
    fn pod_selector(&self) -> Option<&LabelSelector>;
}
impl PodOwner for Deployment {
    fn pod_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}
impl PodOwner for StatefulSet {
    fn pod_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}
impl PodOwner for DaemonSet {
    fn pod_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

/// Renders a `LabelSelector` into its query string form.
/// None is returned for an empty selector, which we treat as selecting nothing.
pub(crate) fn label_query(selector: &LabelSelector) -> Option<String> {
    let labels = selector.match_labels.iter().flatten().map(|(k, v)| format!("{k}={v}"));
    let expressions = selector.match_expressions.iter().flatten().filter_map(|expr| {
        let values = expr.values.clone().unwrap_or_default().join(",");
        match expr.operator.as_str() {
            "In" => Some(format!("{} in ({values})", expr.key)),
            "NotIn" => Some(format!("{} notin ({values})", expr.key)),
            "Exists" => Some(expr.key.clone()),
            "DoesNotExist" => Some(format!("!{}", expr.key)),
            operator => {
                tracing::warn!(operator, key = %expr.key, "unknown label selector operator");
                None
            }
        }
    });
    let query = labels.chain(expressions).collect::<Vec<_>>().join(",");
    (!query.is_empty()).then_some(query)
}

/// Kubernetes implementation of the `WorkloadSource`, for a given kind and namespace.
#[derive(Clone)]
pub struct KubeWorkloads {
    kind: WorkloadKind,
    client: kube::Client,
    namespace: String,
}

impl KubeWorkloads {
    /// Return a new `Self`.
    /// # Arguments
    /// * `client` - the kubernetes client
    /// * `kind` - the kind of resource selection queries list
    /// * `namespace` - the namespace to list from
    pub fn new(client: kube::Client, kind: WorkloadKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            client,
            namespace: namespace.into(),
        }
    }

    fn list_params(query: &SelectionQuery) -> ListParams {
        let mut params = ListParams::default().limit(LIST_LIMIT);
        if let Some(labels) = query.label_selector() {
            params = params.labels(labels);
        }
        if let Some(fields) = query.field_selector() {
            params = params.fields(fields);
        }
        params
    }

    /// List all resources of `K`, following the continue tokens to preserve server order.
    async fn list_all<K>(&self, mut params: ListParams) -> Result<Vec<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut items = Vec::new();
        loop {
            let mut result = api.list(&params).await.context(Transport {
                action: format!(
                    "list {} in namespace '{}'",
                    K::plural(&Default::default()),
                    self.namespace
                ),
            })?;
            items.append(&mut result.items);
            match result.metadata.continue_ {
                Some(token) if !token.is_empty() => params = params.continue_token(&token),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn list_owners<K>(&self, query: &SelectionQuery) -> Result<Vec<Candidate>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + PodOwner,
        <K as Resource>::DynamicType: Default,
    {
        let owners = self.list_all::<K>(Self::list_params(query)).await?;
        Ok(owners
            .iter()
            .map(|owner| {
                let pods = match owner.pod_selector().and_then(label_query) {
                    Some(labels) => PodSelector::Labels(labels),
                    None => PodSelector::Nothing,
                };
                Candidate::new(owner.name_any(), pods)
            })
            .collect())
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloads {
    async fn list_candidates(&self, query: &SelectionQuery) -> Result<Vec<Candidate>, Error> {
        let candidates = match self.kind {
            WorkloadKind::Deployment => self.list_owners::<Deployment>(query).await?,
            WorkloadKind::StatefulSet => self.list_owners::<StatefulSet>(query).await?,
            WorkloadKind::DaemonSet => self.list_owners::<DaemonSet>(query).await?,
            WorkloadKind::Pod => self
                .list_all::<Pod>(Self::list_params(query))
                .await?
                .iter()
                .map(|pod| Candidate::new(pod.name_any(), PodSelector::Name(pod.name_any())))
                .collect(),
        };
        tracing::debug!(
            kind = self.kind.as_ref(),
            namespace = %self.namespace,
            candidates = candidates.len(),
            "listed candidates"
        );
        Ok(candidates)
    }

    async fn attachable_instances(&self, candidate: &Candidate) -> Result<Vec<Instance>, Error> {
        let params = match candidate.pods() {
            PodSelector::Labels(labels) => ListParams::default().labels(labels),
            PodSelector::Name(name) => {
                ListParams::default().fields(&format!("metadata.name={name}"))
            }
            PodSelector::Nothing => return Ok(vec![]),
        };
        let pods = self.list_all::<Pod>(params.limit(LIST_LIMIT)).await?;
        Ok(Attachable {}.select(&pods, &self.namespace))
    }
}
