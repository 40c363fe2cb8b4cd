#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use template_controller_core as core;
pub use template_controller_k8s_api as k8s;

mod admission;
mod args;
mod controller;
mod index;
mod lease;
mod metrics;
mod store;

pub use self::{
    args::Args,
    controller::Controller,
    index::{Index, ResourceId, SharedIndex},
    metrics::{ControllerMetrics, IndexMetrics},
    store::KubeObjectStore,
};
