use crate::core::netns::{ListWorkloads, Workload};
use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::ListParams, Api, ResourceExt};
use tracing::{debug, trace};

/// Lists the pods scheduled to a node through the Kubernetes API.
#[derive(Clone)]
pub struct NodePods {
    client: kube::Client,
}

// === impl NodePods ===

impl NodePods {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ListWorkloads for NodePods {
    async fn list_workloads(&self, node: &str) -> Result<Vec<Workload>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let pods = Api::<Pod>::all(self.client.clone()).list(&params).await?;
        Ok(pods.items.iter().filter_map(workload_for_pod).collect())
    }
}

/// Identifies the container a pod's network namespace is resolved through.
///
/// Pods in the host's network namespace and pods without a started container are skipped.
fn workload_for_pod(pod: &Pod) -> Option<Workload> {
    let namespace = pod.namespace()?;
    let name = pod.name_unchecked();

    if pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
    {
        trace!(pod.ns = %namespace, pod.name = %name, "Skipping host network pod");
        return None;
    }

    let statuses = pod.status.as_ref()?.container_statuses.as_deref()?;
    let started = statuses.iter().filter(|s| s.container_id.is_some());
    let status = started
        .clone()
        .find(|s| s.state.as_ref().is_some_and(|state| state.running.is_some()))
        .or_else(|| started.clone().next())?;
    let container_id = status.container_id.as_deref()?;

    match container_id.parse() {
        Ok(container) => Some(Workload {
            namespace,
            name,
            container,
        }),
        Err(error) => {
            debug!(pod.ns = %namespace, pod.name = %name, %error, "Skipping pod");
            None
        }
    }
}
