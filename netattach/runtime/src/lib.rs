#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use netattach_core as core;
pub use netattach_k8s_config as config;

mod args;
mod controller;
mod crictl;
mod errors;
mod pods;

pub use self::{
    args::Args,
    controller::{Controller, ControllerMetrics},
    crictl::Crictl,
    errors::LogErrors,
    pods::NodePods,
};
