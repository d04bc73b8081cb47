use crate::{
    config::{EndpointsHandler, ServiceHandler},
    core::{
        netns::{ListWorkloads, Netns, NetnsMap, ResolveNetns},
        scheduler::Trigger,
        Error, ErrorSink,
    },
};
use anyhow::Context;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;
use prometheus_client::{metrics::gauge::Gauge, registry::Registry};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};


/// Maintains the node's network namespace mapping.
///
/// Service and Endpoints changes request a reconciliation from the scheduler; each reconciliation
/// rebuilds the mapping from the workloads currently scheduled to the node and publishes it whole.
pub struct Controller {
    node: String,
    workloads: Arc<dyn ListWorkloads>,
    resolver: Arc<dyn ResolveNetns>,
    errors: Arc<dyn ErrorSink>,
    trigger: Trigger,
    netns: watch::Sender<Arc<NetnsMap>>,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    containers: Gauge,
    unresolved: Gauge,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        node: impl Into<String>,
        workloads: Arc<dyn ListWorkloads>,
        resolver: Arc<dyn ResolveNetns>,
        errors: Arc<dyn ErrorSink>,
        trigger: Trigger,
        metrics: ControllerMetrics,
    ) -> Self {
        let (netns, _) = watch::channel(Arc::new(NetnsMap::new()));
        Self {
            node: node.into(),
            workloads,
            resolver,
            errors,
            trigger,
            netns,
            metrics,
        }
    }

    /// Observes the most recently published mapping.
    pub fn netns(&self) -> watch::Receiver<Arc<NetnsMap>> {
        self.netns.subscribe()
    }

    /// Rebuilds and publishes the mapping.
    ///
    /// Workloads whose namespace cannot be resolved are reported and left out of the mapping. If
    /// the node's workloads cannot be listed, the previous mapping stays in place.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let workloads = self
            .workloads
            .list_workloads(&self.node)
            .await
            .with_context(|| format!("failed to list workloads on node {}", self.node))?;

        let mut netns = NetnsMap::new();
        let mut unresolved = 0;
        for workload in workloads {
            match self.resolver.resolve_netns(&workload.container).await {
                Ok(path) => {
                    debug!(
                        pod.ns = %workload.namespace,
                        pod.name = %workload.name,
                        path = %path.display(),
                        "Resolved"
                    );
                    netns.insert(
                        workload.container,
                        Netns {
                            namespace: workload.namespace,
                            name: workload.name,
                            path,
                        },
                    );
                }
                Err(source) => {
                    unresolved += 1;
                    self.errors.report(Error::NamespaceResolution {
                        namespace: workload.namespace,
                        name: workload.name,
                        source,
                    });
                }
            }
        }

        debug!(containers = netns.len(), unresolved, "Reconciled");
        self.metrics.containers.set(netns.len() as i64);
        self.metrics.unresolved.set(unresolved);
        self.netns.send_replace(Arc::new(netns));
        Ok(())
    }
}

impl ServiceHandler for Controller {
    fn on_service_add(&self, _: &Service) {
        self.trigger.request_run();
    }

    fn on_service_update(&self, old: &Service, service: &Service) {
        if old.labels() != service.labels() || old.spec != service.spec {
            self.trigger.request_run();
        }
    }

    fn on_service_delete(&self, _: &Service) {
        self.trigger.request_run();
    }

    fn on_service_synced(&self) {
        info!("Services synced");
    }
}

impl EndpointsHandler for Controller {
    fn on_endpoints_add(&self, _: &Endpoints) {
        self.trigger.request_run();
    }

    fn on_endpoints_update(&self, old: &Endpoints, endpoints: &Endpoints) {
        if old.labels() != endpoints.labels() || old.subsets != endpoints.subsets {
            self.trigger.request_run();
        }
    }

    fn on_endpoints_delete(&self, _: &Endpoints) {
        self.trigger.request_run();
    }

    fn on_endpoints_synced(&self) {
        info!("Endpoints synced");
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let containers = Gauge::default();
        reg.register(
            "containers",
            "Number of containers in the published network namespace mapping",
            containers.clone(),
        );

        let unresolved = Gauge::default();
        reg.register(
            "unresolved_containers",
            "Number of containers left out of the last mapping",
            unresolved.clone(),
        );

        Self {
            containers,
            unresolved,
        }
    }

    pub fn containers(&self) -> i64 {
        self.containers.get()
    }

    pub fn unresolved(&self) -> i64 {
        self.unresolved.get()
    }
}
