//! Day-2 operations for Stackable managed database clusters.
//!
//! An [`OpsRequest`](crd::ops_request::OpsRequest) describes one imperative operation (scale,
//! restart, reconfigure, expand storage, switch leadership, rebuild a member, start/stop, expose
//! or a custom action set) against a [`Cluster`](crd::cluster::Cluster). The
//! [`OpsManager`](operations::OpsManager) admits requests one at a time per mutual exclusion
//! scope, drives them through their phases and reports pod level progress in the request status.
//!
//! All coordination state lives in the persisted objects: the request status and the queue
//! annotation on the cluster object. Every entry point is level triggered and safe to re-run.

pub mod cli;
pub mod client;
pub mod collaborators;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod instance;
pub mod logging;
pub mod operations;
pub mod quantity;
pub mod validation;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
