//! Service and Endpoints configuration
//!
//! A [`Broker`] consumes a cluster watch for a single resource kind and fans each change out to
//! the handlers registered with it:
//!
//! - Every event is delivered to every handler, in the order the handlers were registered, before
//!   the next event is processed.
//! - Handlers are notified that the broker has synced exactly once, after the watch's initial
//!   listing has been delivered.
//! - When a restarted watch no longer lists a resource that was known before, the resource is
//!   reported as deleted using its last known state.
//!
//! Watch payloads are decoded into the broker's resource type as they arrive; objects that do not
//! decode are reported and dropped.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod broker;
mod event;
mod handler;
mod resource_id;
pub mod sync;


pub use self::{
    broker::Broker,
    event::ResourceEvent,
    handler::{EndpointsHandler, ServiceHandler, Watched},
    resource_id::ResourceId,
    sync::Synced,
};
pub use k8s_openapi::api::core::v1::{Endpoints, Service};

/// Tracks the cluster's Services.
pub type ServiceConfig = Broker<Service>;

/// Tracks the cluster's Endpoints.
pub type EndpointsConfig = Broker<Endpoints>;
