//! Game deployment reconciliation controller.
//!
//! Drives a fleet of identity-bearing workload instances toward the desired
//! state of a `GameDeployment`: the right number of instances, all on the
//! newest template revision, rolled out step by step under surge,
//! unavailability, and partition budgets, with external verification hooks
//! gating canary steps and instance deletion.
//!
//! ## Components
//!
//! - [`revision::RevisionStore`]: content-addressed template snapshots
//! - [`expectations::ExpectationStore`]: actions issued but not yet observed
//! - [`scale::ScaleEngine`]: creates and deletes instances
//! - [`update::UpdateEngine`]: moves instances to the update revision
//! - [`canary::CanaryOrchestrator`]: canary step state machine
//! - [`predelete::PreDeleteGate`]: hook-gated instance deletion
//! - [`controller::Controller`]: one reconcile pass per deployment key
//! - [`worker::WorkerPool`] and [`worker::EventDispatcher`]: the runtime
//!
//! The cluster API is reached only through [`cluster::ClusterClient`].

pub mod canary;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod expectations;
pub mod model;
pub mod predelete;
pub mod queue;
pub mod retry;
pub mod revision;
pub mod scale;
pub mod status;
pub mod update;
pub mod worker;

#[cfg(test)]
mod fixtures;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterClient, ClusterError, ClusterEvent, ClusterObject, InMemoryCluster, TimeoutClient};
pub use config::ControllerConfig;
pub use controller::{Action, Controller};
pub use error::{ControllerError, ControllerResult};
pub use expectations::ExpectationStore;
pub use worker::{DeploymentQueue, EventDispatcher, WorkerPool};
