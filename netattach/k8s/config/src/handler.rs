use crate::ResourceEvent;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use serde::de::DeserializeOwned;

/// Receives notifications about Service changes.
pub trait ServiceHandler: Send + Sync {
    /// Called whenever the creation of a new Service is observed.
    fn on_service_add(&self, service: &Service);

    /// Called whenever the modification of an existing Service is observed.
    fn on_service_update(&self, old: &Service, service: &Service);

    /// Called whenever the deletion of an existing Service is observed.
    fn on_service_delete(&self, service: &Service);

    /// Called once the initial listing has been delivered to all handlers.
    fn on_service_synced(&self);
}

/// Receives notifications about Endpoints changes.
pub trait EndpointsHandler: Send + Sync {
    /// Called whenever the creation of new Endpoints is observed.
    fn on_endpoints_add(&self, endpoints: &Endpoints);

    /// Called whenever the modification of existing Endpoints is observed.
    fn on_endpoints_update(&self, old: &Endpoints, endpoints: &Endpoints);

    /// Called whenever the deletion of existing Endpoints is observed.
    fn on_endpoints_delete(&self, endpoints: &Endpoints);

    /// Called once the initial listing has been delivered to all handlers.
    fn on_endpoints_synced(&self);
}

/// A resource kind that a [`Broker`](crate::Broker) can watch, along with the handler interface
/// its changes are delivered through.
pub trait Watched:
    kube::Resource<DynamicType = ()> + DeserializeOwned + Clone + Send + Sync + 'static
{
    type Handler: ?Sized + Send + Sync;

    fn dispatch(handler: &Self::Handler, event: &ResourceEvent<Self>);

    fn synced(handler: &Self::Handler);
}

impl Watched for Service {
    type Handler = dyn ServiceHandler;

    fn dispatch(handler: &Self::Handler, event: &ResourceEvent<Self>) {
        match event {
            ResourceEvent::Added(svc) => handler.on_service_add(svc),
            ResourceEvent::Updated { old, new } => handler.on_service_update(old, new),
            ResourceEvent::Deleted(svc) => handler.on_service_delete(svc),
        }
    }

    fn synced(handler: &Self::Handler) {
        handler.on_service_synced()
    }
}

impl Watched for Endpoints {
    type Handler = dyn EndpointsHandler;

    fn dispatch(handler: &Self::Handler, event: &ResourceEvent<Self>) {
        match event {
            ResourceEvent::Added(ep) => handler.on_endpoints_add(ep),
            ResourceEvent::Updated { old, new } => handler.on_endpoints_update(old, new),
            ResourceEvent::Deleted(ep) => handler.on_endpoints_delete(ep),
        }
    }

    fn synced(handler: &Self::Handler) {
        handler.on_endpoints_synced()
    }
}
