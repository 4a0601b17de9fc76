//! Reconciliation controller.
//!
//! One pass over one deployment key:
//! 1. Read the deployment; a missing one clears its expectations
//! 2. Validate the selector and list the owned instances
//! 3. Resolve current and update revisions
//! 4. Stop early while earlier actions are still unobserved
//! 5. Evaluate the canary plan for the effective partition
//! 6. Scale; if nothing was scaled, update
//! 7. Collect superseded hook runs, write status, prune history
//!
//! Passes for the same key never overlap; the work queue guarantees it.

use std::sync::Arc;
use std::time::Duration;

use gamefleet_events::ObjectKey;
use gamefleet_id::ReconcileId;
use tracing::{debug, info, instrument, warn};

use crate::canary::CanaryOrchestrator;
use crate::clock::Clock;
use crate::cluster::{ClusterClient, TimeoutClient};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::expectations::ExpectationStore;
use crate::model::{ConditionKind, GameDeployment, Selector, WorkloadInstance};
use crate::predelete::PreDeleteGate;
use crate::revision::RevisionStore;
use crate::scale::ScaleEngine;
use crate::status::{calculate_status, next_availability_check, StatusInputs, StatusWriter};
use crate::update::UpdateEngine;

/// What the caller should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing pending; wait for the next change event.
    AwaitChange,
    /// Run again after the delay.
    RequeueAfter(Duration),
}

pub struct Controller {
    client: Arc<dyn ClusterClient>,
    expectations: Arc<ExpectationStore>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
}

impl Controller {
    /// Every call made through `client` is bounded by the configured call
    /// timeout.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        expectations: Arc<ExpectationStore>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        let timeout = config.call_timeout();
        let client: Arc<dyn ClusterClient> = Arc::new(TimeoutClient::new(client, timeout));
        Self {
            client,
            expectations,
            clock,
            config,
        }
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    pub fn expectations(&self) -> &Arc<ExpectationStore> {
        &self.expectations
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Runs one reconcile pass for `key`.
    #[instrument(skip(self, key), fields(deployment = %key, pass = %ReconcileId::new()))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let client = self.client.as_ref();
        let clock = self.clock.as_ref();

        let deploy = match client.get_deployment(key).await {
            Ok(deploy) => deploy,
            Err(e) if e.is_not_found() => {
                debug!("Deployment gone, dropping expectations");
                self.expectations.delete_key(key);
                return Ok(Action::AwaitChange);
            }
            Err(e) => return Err(e.into()),
        };
        if deploy.meta.is_terminating() {
            debug!("Deployment terminating, skipping");
            return Ok(Action::AwaitChange);
        }

        let selector = match validate_selector(&deploy) {
            Ok(selector) => selector,
            Err(e) => {
                self.record_failure(&deploy, ConditionKind::FailedScale, &e).await;
                return Err(e);
            }
        };

        let instances = self.owned_instances(&deploy, &selector).await?;
        let revisions = RevisionStore::new(client).resolve(&deploy, &instances).await?;

        let (satisfied, dirty) = self.expectations.satisfied(key, revisions.update.name());
        if !satisfied {
            debug!(dirty, "Expectations unsatisfied, skipping pass");
            return Ok(Action::RequeueAfter(self.config.expectation_recheck()));
        }

        let canary = CanaryOrchestrator::new(
            client,
            clock,
            &deploy,
            &revisions,
            self.config.hook_poll(),
        );
        let decision = match canary.reconcile(&instances).await {
            Ok(decision) => decision,
            Err(e) if e.is_permanent() => {
                self.record_failure(&deploy, ConditionKind::FailedUpdate, &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        debug!(
            state = ?decision.state,
            partition = decision.partition,
            paused = decision.paused,
            "Canary decision"
        );

        let now = clock.now();
        let mut scratch = deploy.status_or_default();
        let mut gate = PreDeleteGate::new(client, clock, &deploy);
        let mut pass_error: Option<ControllerError> = None;

        let scaled = ScaleEngine::new(client, &self.expectations, &deploy, &revisions)
            .reconcile(&instances, decision.partition, &mut gate)
            .await;
        let scaled = match scaled {
            Ok(scaled) => {
                scratch.clear_condition(ConditionKind::FailedScale);
                scaled
            }
            Err(e) => {
                scratch.set_condition(ConditionKind::FailedScale, e.reason(), e.to_string(), now);
                pass_error = Some(e);
                true
            }
        };

        if !scaled {
            let updated = UpdateEngine::new(client, &self.expectations, clock, &deploy, &revisions)
                .reconcile(&instances, decision.partition, decision.paused, &mut gate)
                .await;
            match updated {
                Ok(()) => scratch.clear_condition(ConditionKind::FailedUpdate),
                Err(e) => {
                    scratch.set_condition(ConditionKind::FailedUpdate, e.reason(), e.to_string(), now);
                    pass_error = Some(e);
                }
            }
        }

        gate.garbage_collect(&instances).await;
        canary.garbage_collect(decision.status.as_ref()).await;
        let gate_pending = !gate.conditions().is_empty();

        let status = calculate_status(
            &deploy,
            &instances,
            StatusInputs {
                revisions: &revisions,
                selector: &selector,
                canary: decision.status.clone(),
                conditions: scratch.conditions,
                pre_delete_hooks: gate.into_conditions(),
            },
            now,
        );
        let writer = StatusWriter::new(client, self.config.status_update_retries);
        if let Err(e) = writer.write(&deploy, status).await {
            match &pass_error {
                None => pass_error = Some(e),
                Some(_) => warn!(error = %e, "Failed to write status after failed pass"),
            }
        }

        let limit = deploy
            .spec
            .revision_history_limit
            .map(|l| l.max(0) as usize)
            .unwrap_or(self.config.revision_history_limit);
        RevisionStore::new(client)
            .truncate_history(&deploy, &revisions, &instances, limit)
            .await;
        self.trim_deletion_list(&deploy, &instances).await;

        if let Some(e) = pass_error {
            return Err(e);
        }

        let requeue = [
            decision.requeue_after,
            next_availability_check(&deploy, &instances, now),
            gate_pending.then(|| self.config.hook_poll()),
        ]
        .into_iter()
        .flatten()
        .min();

        Ok(requeue.map_or(Action::AwaitChange, Action::RequeueAfter))
    }

    async fn owned_instances(
        &self,
        deploy: &GameDeployment,
        selector: &Selector,
    ) -> ControllerResult<Vec<WorkloadInstance>> {
        Ok(self
            .client
            .list_instances(&deploy.meta.namespace, selector)
            .await?
            .into_iter()
            .filter(|i| i.meta.is_controlled_by(&deploy.meta.uid))
            .filter(|i| !i.meta.is_terminating())
            .collect())
    }

    /// Surfaces a failure that ended the pass before status was computed.
    async fn record_failure(&self, deploy: &GameDeployment, kind: ConditionKind, err: &ControllerError) {
        let mut status = deploy.status_or_default();
        status.observed_generation = deploy.meta.generation;
        status.set_condition(kind, err.reason(), err.to_string(), self.clock.now());

        let writer = StatusWriter::new(self.client.as_ref(), self.config.status_update_retries);
        if let Err(e) = writer.write(deploy, status).await {
            warn!(deployment = %deploy.key(), error = %e, "Failed to record failure condition");
        }
    }

    /// Drops names from the explicit deletion list that match no live
    /// instance. Failures are logged only.
    async fn trim_deletion_list(&self, deploy: &GameDeployment, instances: &[WorkloadInstance]) {
        let requested = &deploy.spec.scale_strategy.instances_to_delete;
        let kept: Vec<&String> = requested
            .iter()
            .filter(|name| instances.iter().any(|i| i.name() == name.as_str()))
            .collect();
        if kept.len() == requested.len() {
            return;
        }

        let patch = serde_json::json!({
            "spec": { "scale_strategy": { "instances_to_delete": kept } }
        });
        match self.client.patch_deployment(&deploy.key(), &patch).await {
            Ok(_) => info!(
                deployment = %deploy.key(),
                removed = requested.len() - kept.len(),
                "Trimmed stale deletion requests"
            ),
            Err(e) => warn!(deployment = %deploy.key(), error = %e, "Failed to trim deletion requests"),
        }
    }
}

/// Parses the selector and checks that the template would be selected by it.
fn validate_selector(deploy: &GameDeployment) -> ControllerResult<Selector> {
    let selector = Selector::parse(&deploy.spec.selector)?;
    if !selector.matches(&deploy.spec.template.labels) {
        return Err(ControllerError::InvalidSelector(format!(
            "selector '{selector}' does not match template labels"
        )));
    }
    Ok(selector)
}
