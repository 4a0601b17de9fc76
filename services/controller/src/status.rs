//! Status calculation and write-back.
//!
//! The status is recomputed from the observed instances on every pass and
//! written only when it differs from what the deployment already carries.
//! Writes use optimistic concurrency: on conflict the deployment is re-read
//! and the write retried with backoff, unless another actor changed the spec
//! or the canary pause conditions in between, in which case the pass is
//! abandoned so it can be recomputed from the fresh object.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterError};
use crate::error::ControllerResult;
use crate::model::{
    CanaryStatus, DeploymentCondition, GameDeployment, GameDeploymentStatus, PauseCondition,
    PreDeleteHookCondition, Selector, WorkloadInstance,
};
use crate::retry::BackoffPolicy;
use crate::revision::ResolvedRevisions;
use crate::update::UpdateStrategy;

/// Inputs for one status computation beyond the observed instances.
pub struct StatusInputs<'a> {
    pub revisions: &'a ResolvedRevisions,
    pub selector: &'a Selector,
    pub canary: Option<CanaryStatus>,
    pub conditions: Vec<DeploymentCondition>,
    pub pre_delete_hooks: Vec<PreDeleteHookCondition>,
}

/// Computes the status of `deploy` from its live instances.
pub fn calculate_status(
    deploy: &GameDeployment,
    instances: &[WorkloadInstance],
    inputs: StatusInputs<'_>,
    now: DateTime<Utc>,
) -> GameDeploymentStatus {
    let strategy = UpdateStrategy::from(deploy.spec.update_strategy.kind);
    let min_ready = deploy.spec.min_ready_seconds;
    let update = inputs.revisions.update.name();

    let mut status = GameDeploymentStatus {
        observed_generation: deploy.meta.generation,
        replicas: instances.len() as i32,
        current_revision: inputs.revisions.current.name().to_string(),
        update_revision: update.to_string(),
        collision_count: inputs.revisions.collision_count,
        label_selector: inputs.selector.to_string(),
        canary: inputs.canary,
        conditions: inputs.conditions,
        pre_delete_hooks: inputs.pre_delete_hooks,
        ..Default::default()
    };

    for instance in instances {
        let updated = instance.revision() == Some(update);
        let available = strategy.is_ready(instance, min_ready, now);
        if instance.is_ready() {
            status.ready_replicas += 1;
        }
        if available {
            status.available_replicas += 1;
        }
        if updated {
            status.updated_replicas += 1;
            if available {
                status.updated_ready_replicas += 1;
            }
        }
    }

    status
}

/// Time until the next ready instance crosses `min_ready_seconds`.
pub fn next_availability_check(
    deploy: &GameDeployment,
    instances: &[WorkloadInstance],
    now: DateTime<Utc>,
) -> Option<Duration> {
    instances
        .iter()
        .filter_map(|i| i.until_available(deploy.spec.min_ready_seconds, now))
        .min()
        .and_then(|d| d.to_std().ok())
}

pub struct StatusWriter<'a> {
    client: &'a dyn ClusterClient,
    backoff: BackoffPolicy,
    retries: u32,
}

impl<'a> StatusWriter<'a> {
    pub fn new(client: &'a dyn ClusterClient, retries: u32) -> Self {
        Self {
            client,
            backoff: BackoffPolicy::default(),
            retries,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Writes `status` if it differs from the one on `deploy`. Returns true
    /// when a write happened.
    pub async fn write(
        &self,
        deploy: &GameDeployment,
        status: GameDeploymentStatus,
    ) -> ControllerResult<bool> {
        if deploy.status.as_ref() == Some(&status) {
            debug!(deployment = %deploy.key(), "Status unchanged");
            return Ok(false);
        }

        let observed_pause = pause_conditions(deploy);
        let mut target = deploy.clone();
        target.status = Some(status);
        let mut attempt = 0;

        loop {
            let err = match self.client.update_deployment_status(&target).await {
                Ok(_) => {
                    info!(
                        deployment = %deploy.key(),
                        attempt,
                        "Updated deployment status"
                    );
                    return Ok(true);
                }
                Err(e) if e.is_conflict() && attempt < self.retries => e,
                Err(e) => return Err(e.into()),
            };

            let delay = self.backoff.delay(attempt);
            attempt += 1;
            warn!(
                deployment = %deploy.key(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Status write conflicted, retrying"
            );
            tokio::time::sleep(delay).await;

            let fresh = self.client.get_deployment(&deploy.key()).await?;
            if fresh.meta.generation != deploy.meta.generation {
                return Err(ClusterError::Conflict(format!(
                    "{} spec changed during status write",
                    deploy.key()
                ))
                .into());
            }
            if pause_conditions(&fresh) != observed_pause {
                return Err(ClusterError::Conflict(format!(
                    "{} pause conditions changed during status write",
                    deploy.key()
                ))
                .into());
            }

            let status = target.status.take();
            target = fresh;
            target.status = status;
        }
    }
}

fn pause_conditions(deploy: &GameDeployment) -> Vec<PauseCondition> {
    deploy
        .status
        .as_ref()
        .and_then(|s| s.canary.as_ref())
        .map(|c| c.pause_conditions.clone())
        .unwrap_or_default()
}
