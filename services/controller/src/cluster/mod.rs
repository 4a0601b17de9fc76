//! Observation source interface.
//!
//! The cluster API is an external collaborator. The controller only needs:
//! - list-by-selector, get, create, update, delete, and merge-patch
//! - "not found", "conflict", and "already exists" told apart from other failures
//! - a typed change stream (`ClusterEvent`) delivered independently of calls
//!
//! `InMemoryCluster` implements the interface for tests and development;
//! `TimeoutClient` bounds every call of another implementation.

mod memory;
mod timeout;

use async_trait::async_trait;
use gamefleet_events::{EventEnvelope, ObjectKey};
use thiserror::Error;

use crate::model::{GameDeployment, HookRun, Revision, Selector, WorkloadInstance};

pub use memory::InMemoryCluster;
pub use timeout::TimeoutClient;

/// Result type for observation source calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors reported by the observation source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency check failed.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The request itself was rejected.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ClusterError::Invalid(_))
    }
}

/// Any object the observation source can report.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterObject {
    Deployment(GameDeployment),
    Instance(WorkloadInstance),
    Revision(Revision),
    HookRun(HookRun),
}

/// A change notification from the observation source.
pub type ClusterEvent = EventEnvelope<ClusterObject>;

/// Cluster API operations used by the controller.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // Deployments

    async fn list_deployments(&self) -> ClusterResult<Vec<GameDeployment>>;

    async fn get_deployment(&self, key: &ObjectKey) -> ClusterResult<GameDeployment>;

    /// Applies a JSON merge patch to the deployment spec/metadata.
    async fn patch_deployment(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> ClusterResult<GameDeployment>;

    /// Replaces the status subresource. Fails with `Conflict` when the
    /// resource version is stale.
    async fn update_deployment_status(
        &self,
        deployment: &GameDeployment,
    ) -> ClusterResult<GameDeployment>;

    // Instances

    async fn list_instances(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> ClusterResult<Vec<WorkloadInstance>>;

    async fn create_instance(&self, instance: &WorkloadInstance) -> ClusterResult<WorkloadInstance>;

    async fn update_instance(&self, instance: &WorkloadInstance) -> ClusterResult<WorkloadInstance>;

    async fn delete_instance(&self, key: &ObjectKey) -> ClusterResult<()>;

    // Revisions

    async fn list_revisions(&self, namespace: &str, selector: &Selector) -> ClusterResult<Vec<Revision>>;

    async fn get_revision(&self, key: &ObjectKey) -> ClusterResult<Revision>;

    async fn create_revision(&self, revision: &Revision) -> ClusterResult<Revision>;

    async fn update_revision(&self, revision: &Revision) -> ClusterResult<Revision>;

    async fn delete_revision(&self, key: &ObjectKey) -> ClusterResult<()>;

    // Hook runs

    async fn list_hook_runs(&self, namespace: &str, selector: &Selector) -> ClusterResult<Vec<HookRun>>;

    async fn get_hook_run(&self, key: &ObjectKey) -> ClusterResult<HookRun>;

    async fn create_hook_run(&self, run: &HookRun) -> ClusterResult<HookRun>;

    async fn update_hook_run(&self, run: &HookRun) -> ClusterResult<HookRun>;

    async fn delete_hook_run(&self, key: &ObjectKey) -> ClusterResult<()>;
}
