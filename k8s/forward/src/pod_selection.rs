use crate::{vx::Pod, Instance};
use kube::ResourceExt;

/// Selects and orders the pods a session may attach to.
pub(crate) trait PodSelection {
    /// Returns the instances for the selected pods, best first.
    /// # Arguments
    /// * `pods` - the pods to select from
    /// * `namespace` - namespace used for pods which don't carry one
    fn select(&self, pods: &[Pod], namespace: &str) -> Vec<Instance>;
}

/// Any running pod which is not terminating.
/// Ready pods come first, then those with the fewest restarts, then the oldest.
pub(crate) struct Attachable {}

impl Attachable {
    fn is_attachable(pod: &Pod) -> bool {
        let running = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running");
        running && pod.metadata.deletion_timestamp.is_none()
    }
    fn is_ready(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .into_iter()
            .flatten()
            .any(|condition| condition.type_ == "Ready" && condition.status == "True")
    }
    fn restarts(pod: &Pod) -> i32 {
        pod.status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .into_iter()
            .flatten()
            .map(|status| status.restart_count)
            .sum()
    }
    /// The container kubectl would pick by default.
    fn default_container(pod: &Pod) -> Option<String> {
        if let Some(container) = pod.annotations().get(utils::DEFAULT_CONTAINER_ANNOTATION) {
            return Some(container.clone());
        }
        pod.spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .map(|container| container.name.clone())
    }
}

impl PodSelection for Attachable {
    fn select(&self, pods: &[Pod], namespace: &str) -> Vec<Instance> {
        let mut pods = pods
            .iter()
            .filter(|pod| Self::is_attachable(pod))
            .collect::<Vec<_>>();

        pods.sort_by_key(|pod| {
            let created = pod.metadata.creation_timestamp.as_ref().map(|time| time.0);
            (
                !Self::is_ready(pod),
                Self::restarts(pod),
                created.is_none(),
                created,
            )
        });

        pods.into_iter()
            .map(|pod| {
                Instance::new(
                    pod.namespace().unwrap_or_else(|| namespace.to_string()),
                    pod.name_any(),
                    Self::default_container(pod),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, phase: &str, ready: bool, restarts: i32, created: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": "apps", "creationTimestamp": created },
            "spec": { "containers": [ { "name": "app" }, { "name": "sidecar" } ] },
            "status": {
                "phase": phase,
                "conditions": [ { "type": "Ready", "status": if ready { "True" } else { "False" } } ],
                "containerStatuses": [ {
                    "name": "app", "ready": ready, "restartCount": restarts, "image": "app",
                    "imageID": ""
                } ]
            }
        }))
        .unwrap()
    }

    fn names(instances: &[Instance]) -> Vec<&str> {
        instances.iter().map(Instance::name).collect()
    }

    #[test]
    fn only_running_pods() {
        let pods = vec![
            pod("pending", "Pending", false, 0, "2023-01-01T00:00:00Z"),
            pod("running", "Running", false, 0, "2023-01-01T00:00:00Z"),
            pod("done", "Succeeded", false, 0, "2023-01-01T00:00:00Z"),
        ];
        let selected = Attachable {}.select(&pods, "default");
        assert_eq!(names(&selected), vec!["running"]);
        assert_eq!(selected[0].namespace(), "apps");
        assert_eq!(selected[0].clone().into_parts().2.as_deref(), Some("app"));
    }

    #[test]
    fn ordering() {
        let pods = vec![
            pod("not-ready", "Running", false, 0, "2023-01-01T00:00:00Z"),
            pod("restarted", "Running", true, 3, "2023-01-01T00:00:00Z"),
            pod("young", "Running", true, 0, "2023-01-03T00:00:00Z"),
            pod("old", "Running", true, 0, "2023-01-02T00:00:00Z"),
        ];
        let selected = Attachable {}.select(&pods, "default");
        assert_eq!(names(&selected), vec!["old", "young", "restarted", "not-ready"]);
    }

    #[test]
    fn default_container_annotation() {
        let mut pod = pod("annotated", "Running", true, 0, "2023-01-01T00:00:00Z");
        pod.annotations_mut().insert(
            utils::DEFAULT_CONTAINER_ANNOTATION.to_string(),
            "sidecar".to_string(),
        );
        let selected = Attachable {}.select(&[pod], "default");
        assert_eq!(selected[0].clone().into_parts().2.as_deref(), Some("sidecar"));
    }
}
