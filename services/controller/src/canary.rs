//! Canary/hook orchestrator.
//!
//! Drives a rollout through the steps of its canary plan. Progress is keyed
//! by (update revision, step-plan hash) and lives in the deployment status;
//! a new update revision or an edited plan restarts at step 0.
//!
//! Per step:
//! - `StepUpgrading`: the step's partition is handed to the scale and update
//!   engines until enough updated instances are ready
//! - `StepPending` / `StepRunning`: the step's hook run is created (under a
//!   deterministic name) and awaited
//! - `StepPaused`: the hook failed or the step defines a pause; a timed pause
//!   requests a requeue for the remaining time
//! - `StepAdvance`: the step is done; the next pass works on the next step
//!
//! Clearing the pause conditions externally resumes a paused step. For a
//! failed hook that means a fresh run; for a plain pause it means advancing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use gamefleet_reconcile::content_digest;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::cluster::ClusterClient;
use crate::error::{ControllerError, ControllerResult};
use crate::model::{
    labels, CanaryStatus, CanaryStep, GameDeployment, HookRun, HookRunSpec, HookStep, ObjectMeta,
    PauseCondition, PauseReason, Selector, WorkloadInstance,
};
use crate::revision::ResolvedRevisions;
use crate::update::UpdateStrategy;

/// Where a deployment stands in its canary plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanaryState {
    /// No plan, no rollout, or every step done.
    NoStep,
    /// Waiting for the step's partition to be reached.
    StepUpgrading,
    /// Hook run just created.
    StepPending,
    /// Hook run not yet terminal.
    StepRunning,
    StepPaused,
    StepAdvance,
}

/// What the rest of the pass should do.
#[derive(Debug, Clone)]
pub struct CanaryDecision {
    pub state: CanaryState,
    /// Instances that must stay on the old revision.
    pub partition: i32,
    /// Hold the update engine.
    pub paused: bool,
    pub requeue_after: Option<Duration>,
    /// Progress to write back.
    pub status: Option<CanaryStatus>,
}

impl CanaryDecision {
    fn no_step(partition: i32, status: Option<CanaryStatus>) -> Self {
        Self {
            state: CanaryState::NoStep,
            partition,
            paused: false,
            requeue_after: None,
            status,
        }
    }
}

/// Name of the hook run verifying `step` of `revision`.
pub fn step_run_name(revision: &str, step: usize, template: &str) -> String {
    format!("{revision}-{step}-{template}")
}

/// Hash of the step plan; progress restarts when it changes.
pub fn step_hash(steps: &[CanaryStep]) -> ControllerResult<String> {
    let value = serde_json::to_value(steps)?;
    Ok(content_digest(&value))
}

/// End of the timed pause of `step` when it starts at `start`.
///
/// Negative durations and deadlines outside the representable time range
/// are rejected.
fn pause_deadline(
    idx: usize,
    step: &CanaryStep,
    start: DateTime<Utc>,
) -> ControllerResult<Option<DateTime<Utc>>> {
    let Some(seconds) = step.pause.as_ref().and_then(|p| p.duration_seconds) else {
        return Ok(None);
    };
    chrono::Duration::try_seconds(seconds)
        .filter(|d| *d >= chrono::Duration::zero())
        .and_then(|d| start.checked_add_signed(d))
        .map(Some)
        .ok_or_else(|| {
            ControllerError::InvalidCanaryStep(format!(
                "step {idx}: pause duration {seconds}s is out of range"
            ))
        })
}

pub struct CanaryOrchestrator<'a> {
    client: &'a dyn ClusterClient,
    clock: &'a dyn Clock,
    deploy: &'a GameDeployment,
    revisions: &'a ResolvedRevisions,
    hook_poll: Duration,
}

impl<'a> CanaryOrchestrator<'a> {
    pub fn new(
        client: &'a dyn ClusterClient,
        clock: &'a dyn Clock,
        deploy: &'a GameDeployment,
        revisions: &'a ResolvedRevisions,
        hook_poll: Duration,
    ) -> Self {
        Self {
            client,
            clock,
            deploy,
            revisions,
            hook_poll,
        }
    }

    #[instrument(skip_all, fields(deployment = %self.deploy.key(), revision = %self.revisions.update.name()))]
    pub async fn reconcile(&self, instances: &[WorkloadInstance]) -> ControllerResult<CanaryDecision> {
        let strategy = &self.deploy.spec.update_strategy;
        let prior = self.deploy.status.as_ref().and_then(|s| s.canary.clone());
        let update = self.revisions.update.name();

        let steps = match &strategy.canary {
            Some(plan) if !plan.steps.is_empty() => &plan.steps,
            _ => return Ok(CanaryDecision::no_step(strategy.partition, None)),
        };

        let hash = step_hash(steps)?;
        for (idx, step) in steps.iter().enumerate() {
            pause_deadline(idx, step, self.clock.now())?;
        }
        let mut status = match prior {
            Some(s) if s.revision == update && s.step_hash == hash => s,
            prior => {
                if prior.is_some() {
                    info!(step_hash = %hash, "Canary progress reset to step 0");
                }
                CanaryStatus {
                    revision: update.to_string(),
                    step_index: 0,
                    step_hash: hash,
                    ..Default::default()
                }
            }
        };

        if self.revisions.consistent() {
            return Ok(CanaryDecision::no_step(strategy.partition, Some(status)));
        }

        let idx = status.step_index.max(0) as usize;
        let Some(step) = steps.get(idx) else {
            debug!("Canary plan exhausted");
            return Ok(CanaryDecision::no_step(0, Some(status)));
        };

        let replicas = self.deploy.spec.replicas.max(0);
        let partition = step.partition.unwrap_or(0).clamp(0, replicas);
        let mut decision = CanaryDecision {
            state: CanaryState::StepUpgrading,
            partition,
            paused: false,
            requeue_after: None,
            status: None,
        };

        let ready = self.updated_ready(instances);
        let target = replicas - partition;
        if ready < target {
            debug!(step = idx, ready, target, "Canary step upgrading");
            decision.status = Some(status);
            return Ok(decision);
        }

        self.evaluate_step(idx, step, &mut status, &mut decision).await?;
        decision.status = Some(status);
        Ok(decision)
    }

    async fn evaluate_step(
        &self,
        idx: usize,
        step: &CanaryStep,
        status: &mut CanaryStatus,
        decision: &mut CanaryDecision,
    ) -> ControllerResult<()> {
        let now = self.clock.now();

        if let Some(started) = status.pause_start {
            if status.pause_conditions.is_empty() {
                if self.failed_hook_pending_retry(status).await? {
                    info!(step = idx, "Pause cleared, retrying failed step hook");
                    if let Some(run) = status.current_hook_run.take() {
                        self.delete_run(&run).await;
                    }
                    status.pause_start = None;
                    decision.state = CanaryState::StepPending;
                    decision.paused = true;
                    decision.requeue_after = Some(Duration::ZERO);
                    return Ok(());
                }
                info!(step = idx, "Pause cleared, advancing");
                self.advance(status, decision);
                return Ok(());
            }

            decision.state = CanaryState::StepPaused;
            decision.paused = true;
            if status
                .pause_conditions
                .iter()
                .any(|c| c.reason == PauseReason::HookFailed)
            {
                return Ok(());
            }
            match pause_deadline(idx, step, started)? {
                Some(deadline) => {
                    let remaining = deadline - now;
                    if remaining > chrono::Duration::zero() {
                        decision.requeue_after = Some(remaining.to_std().unwrap_or_default());
                        debug!(step = idx, remaining_secs = remaining.num_seconds(), "Canary step paused");
                    } else {
                        info!(step = idx, "Pause elapsed, advancing");
                        self.advance(status, decision);
                    }
                }
                None => debug!(step = idx, "Canary step paused until cleared"),
            }
            return Ok(());
        }

        if let Some(hook) = &step.hook {
            let (run, created) = self.ensure_run(idx, hook).await?;
            status.current_hook_run = Some(run.meta.name.clone());
            let phase = run.phase();

            if phase.is_successful() {
                debug!(step = idx, hook_run = %run.meta.name, "Step hook succeeded");
            } else if phase.is_terminal() {
                warn!(step = idx, hook_run = %run.meta.name, phase = %phase, "Step hook failed, pausing rollout");
                status.pause_start = Some(now);
                status.pause_conditions = vec![PauseCondition {
                    reason: PauseReason::HookFailed,
                    start_time: now,
                }];
                decision.state = CanaryState::StepPaused;
                decision.paused = true;
                return Ok(());
            } else {
                decision.state = if created {
                    CanaryState::StepPending
                } else {
                    CanaryState::StepRunning
                };
                decision.paused = true;
                decision.requeue_after = Some(self.hook_poll);
                return Ok(());
            }
        }

        if let Some(pause) = &step.pause {
            info!(step = idx, duration_secs = ?pause.duration_seconds, "Canary step pausing");
            status.pause_start = Some(now);
            status.pause_conditions = vec![PauseCondition {
                reason: PauseReason::CanaryPause,
                start_time: now,
            }];
            decision.state = CanaryState::StepPaused;
            decision.paused = true;
            decision.requeue_after = pause_deadline(idx, step, now)?
                .map(|deadline| (deadline - now).to_std().unwrap_or_default());
            return Ok(());
        }

        self.advance(status, decision);
        Ok(())
    }

    fn advance(&self, status: &mut CanaryStatus, decision: &mut CanaryDecision) {
        status.step_index += 1;
        status.pause_start = None;
        status.pause_conditions.clear();
        status.current_hook_run = None;
        info!(step = status.step_index, "Canary advanced to next step");

        decision.state = CanaryState::StepAdvance;
        decision.paused = false;
        decision.requeue_after = Some(Duration::ZERO);
    }

    /// True when the tracked hook run exists and ended without success.
    async fn failed_hook_pending_retry(&self, status: &CanaryStatus) -> ControllerResult<bool> {
        let Some(name) = &status.current_hook_run else {
            return Ok(false);
        };
        let key = self.deploy.meta.key().sibling(name.clone());
        match self.client.get_hook_run(&key).await {
            Ok(run) => Ok(run.phase().is_terminal() && !run.phase().is_successful()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches the step's hook run, creating it if absent. The flag is set
    /// when this call created it.
    async fn ensure_run(&self, idx: usize, hook: &HookStep) -> ControllerResult<(HookRun, bool)> {
        let update = self.revisions.update.name();
        let name = step_run_name(update, idx, &hook.template_name);
        let key = self.deploy.meta.key().sibling(name.clone());

        match self.client.get_hook_run(&key).await {
            Ok(run) => return Ok((run, false)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut meta = ObjectMeta::named(self.deploy.meta.namespace.clone(), name.clone());
        meta.labels
            .insert(labels::DEPLOYMENT.into(), self.deploy.name().to_string());
        meta.labels
            .insert(labels::HOOK_TYPE.into(), labels::HOOK_TYPE_CANARY.into());
        meta.labels.insert(labels::REVISION_HASH.into(), update.to_string());
        meta.labels.insert(labels::STEP_INDEX.into(), idx.to_string());
        meta.owner_references.push(self.deploy.owner_reference());

        let run = HookRun {
            meta,
            spec: HookRunSpec {
                template_name: hook.template_name.clone(),
                args: hook.args.clone(),
                terminate: false,
            },
            status: Default::default(),
        };

        match self.client.create_hook_run(&run).await {
            Ok(created) => {
                info!(step = idx, hook_run = %name, template = %hook.template_name, "Created step hook run");
                Ok((created, true))
            }
            Err(e) if e.is_already_exists() => Ok((self.client.get_hook_run(&key).await?, false)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_run(&self, name: &str) {
        let key = self.deploy.meta.key().sibling(name.to_string());
        match self.client.delete_hook_run(&key).await {
            Ok(()) => debug!(hook_run = %name, "Deleted step hook run"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(hook_run = %name, error = %e, "Failed to delete step hook run"),
        }
    }

    fn updated_ready(&self, instances: &[WorkloadInstance]) -> i32 {
        let strategy = UpdateStrategy::from(self.deploy.spec.update_strategy.kind);
        let now = self.clock.now();
        let update = self.revisions.update.name();
        instances
            .iter()
            .filter(|i| i.revision() == Some(update))
            .filter(|i| strategy.is_ready(i, self.deploy.spec.min_ready_seconds, now))
            .count() as i32
    }

    /// Cancels hook runs of superseded steps and deletes runs of superseded
    /// revisions once they have stopped. Failures are logged only.
    pub async fn garbage_collect(&self, status: Option<&CanaryStatus>) {
        let selector = Selector::for_labels([
            (labels::DEPLOYMENT, self.deploy.name()),
            (labels::HOOK_TYPE, labels::HOOK_TYPE_CANARY),
        ]);
        let runs = match self
            .client
            .list_hook_runs(&self.deploy.meta.namespace, &selector)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(deployment = %self.deploy.key(), error = %e, "Failed to list step hook runs");
                return;
            }
        };

        let update = self.revisions.update.name();
        let tracked = status.and_then(|s| s.current_hook_run.as_deref());

        for mut run in runs {
            if !run.meta.is_controlled_by(&self.deploy.meta.uid) {
                continue;
            }
            let same_revision = run.meta.label(labels::REVISION_HASH) == Some(update);

            if run.is_active() && (!same_revision || tracked != Some(run.meta.name.as_str())) {
                run.spec.terminate = true;
                match self.client.update_hook_run(&run).await {
                    Ok(_) => info!(hook_run = %run.meta.name, "Cancelled superseded step hook run"),
                    Err(e) => warn!(hook_run = %run.meta.name, error = %e, "Failed to cancel step hook run"),
                }
                continue;
            }

            if !same_revision && !run.is_active() {
                self.delete_run(&run.meta.name).await;
            }
        }
    }
}
