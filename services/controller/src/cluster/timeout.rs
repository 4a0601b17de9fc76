//! Per-call deadline for observation source calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gamefleet_events::ObjectKey;
use tracing::warn;

use super::{ClusterClient, ClusterError, ClusterResult};
use crate::model::{GameDeployment, HookRun, Revision, Selector, WorkloadInstance};

/// Wraps a client so no call can block past `timeout`.
///
/// An expired call is dropped, which cancels it, and reported as the
/// transient `ClusterError::Timeout`.
pub struct TimeoutClient {
    inner: Arc<dyn ClusterClient>,
    timeout: Duration,
}

impl TimeoutClient {
    pub fn new(inner: Arc<dyn ClusterClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guard<T, F>(&self, operation: &'static str, call: F) -> ClusterResult<T>
    where
        F: Future<Output = ClusterResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Cluster call timed out"
                );
                Err(ClusterError::Timeout {
                    operation,
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl ClusterClient for TimeoutClient {
    async fn list_deployments(&self) -> ClusterResult<Vec<GameDeployment>> {
        self.guard("list_deployments", self.inner.list_deployments())
            .await
    }

    async fn get_deployment(&self, key: &ObjectKey) -> ClusterResult<GameDeployment> {
        self.guard("get_deployment", self.inner.get_deployment(key))
            .await
    }

    async fn patch_deployment(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> ClusterResult<GameDeployment> {
        self.guard("patch_deployment", self.inner.patch_deployment(key, patch))
            .await
    }

    async fn update_deployment_status(
        &self,
        deployment: &GameDeployment,
    ) -> ClusterResult<GameDeployment> {
        self.guard(
            "update_deployment_status",
            self.inner.update_deployment_status(deployment),
        )
        .await
    }

    async fn list_instances(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> ClusterResult<Vec<WorkloadInstance>> {
        self.guard("list_instances", self.inner.list_instances(namespace, selector))
            .await
    }

    async fn create_instance(&self, instance: &WorkloadInstance) -> ClusterResult<WorkloadInstance> {
        self.guard("create_instance", self.inner.create_instance(instance))
            .await
    }

    async fn update_instance(&self, instance: &WorkloadInstance) -> ClusterResult<WorkloadInstance> {
        self.guard("update_instance", self.inner.update_instance(instance))
            .await
    }

    async fn delete_instance(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.guard("delete_instance", self.inner.delete_instance(key))
            .await
    }

    async fn list_revisions(&self, namespace: &str, selector: &Selector) -> ClusterResult<Vec<Revision>> {
        self.guard("list_revisions", self.inner.list_revisions(namespace, selector))
            .await
    }

    async fn get_revision(&self, key: &ObjectKey) -> ClusterResult<Revision> {
        self.guard("get_revision", self.inner.get_revision(key)).await
    }

    async fn create_revision(&self, revision: &Revision) -> ClusterResult<Revision> {
        self.guard("create_revision", self.inner.create_revision(revision))
            .await
    }

    async fn update_revision(&self, revision: &Revision) -> ClusterResult<Revision> {
        self.guard("update_revision", self.inner.update_revision(revision))
            .await
    }

    async fn delete_revision(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.guard("delete_revision", self.inner.delete_revision(key))
            .await
    }

    async fn list_hook_runs(&self, namespace: &str, selector: &Selector) -> ClusterResult<Vec<HookRun>> {
        self.guard("list_hook_runs", self.inner.list_hook_runs(namespace, selector))
            .await
    }

    async fn get_hook_run(&self, key: &ObjectKey) -> ClusterResult<HookRun> {
        self.guard("get_hook_run", self.inner.get_hook_run(key)).await
    }

    async fn create_hook_run(&self, run: &HookRun) -> ClusterResult<HookRun> {
        self.guard("create_hook_run", self.inner.create_hook_run(run))
            .await
    }

    async fn update_hook_run(&self, run: &HookRun) -> ClusterResult<HookRun> {
        self.guard("update_hook_run", self.inner.update_hook_run(run))
            .await
    }

    async fn delete_hook_run(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.guard("delete_hook_run", self.inner.delete_hook_run(key))
            .await
    }
}
