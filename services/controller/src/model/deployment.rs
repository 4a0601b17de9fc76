//! Game deployments: desired spec and controller-owned status.

use chrono::{DateTime, Utc};
use gamefleet_events::ObjectKey;
use gamefleet_reconcile::IntOrPercent;
use serde::{Deserialize, Serialize};

use super::hook::HookPhase;
use super::instance::InstanceTemplate;
use super::meta::{LabelSelector, ObjectMeta, OwnerReference};

/// Kind name used in owner references.
pub const GAME_DEPLOYMENT_KIND: &str = "GameDeployment";

/// Conditions kept per deployment, oldest dropped first.
pub const MAX_CONDITIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDeployment {
    pub meta: ObjectMeta,
    pub spec: GameDeploymentSpec,
    #[serde(default)]
    pub status: Option<GameDeploymentStatus>,
}

impl GameDeployment {
    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Controller reference stamped on every owned object.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: GAME_DEPLOYMENT_KIND.to_string(),
            name: self.meta.name.clone(),
            uid: self.meta.uid,
            controller: true,
        }
    }

    /// Status as last written, or an empty one.
    pub fn status_or_default(&self) -> GameDeploymentStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDeploymentSpec {
    pub replicas: i32,
    pub selector: LabelSelector,
    pub template: InstanceTemplate,
    #[serde(default)]
    pub scale_strategy: ScaleStrategy,
    #[serde(default)]
    pub update_strategy: UpdateStrategySpec,
    /// Verification run before any instance is deleted.
    #[serde(default)]
    pub pre_delete_hook: Option<HookStep>,
    #[serde(default)]
    pub min_ready_seconds: i32,
    /// Overrides the controller-wide history limit.
    #[serde(default)]
    pub revision_history_limit: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScaleStrategy {
    /// Instances to delete before any diff-based scale-in.
    #[serde(default)]
    pub instances_to_delete: Vec<String>,
}

/// How not-yet-updated instances move to the update revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpdateStrategyKind {
    /// Delete and let scale-out recreate on the new revision.
    #[default]
    Recreate,
    /// Patch container images; availability waits on a readiness gate.
    InPlace,
    /// Patch container images while the instance keeps serving.
    HotPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UpdateStrategySpec {
    #[serde(default)]
    pub kind: UpdateStrategyKind,
    /// Instances to keep on the old revision when no canary step applies.
    #[serde(default)]
    pub partition: i32,
    #[serde(default)]
    pub max_unavailable: Option<IntOrPercent>,
    #[serde(default)]
    pub max_surge: Option<IntOrPercent>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub canary: Option<CanaryPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CanaryPlan {
    pub steps: Vec<CanaryStep>,
}

/// One stage of a canary rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CanaryStep {
    /// Instances left on the old revision during this step.
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub pause: Option<PauseSpec>,
    #[serde(default)]
    pub hook: Option<HookStep>,
}

/// A pause; without a duration it lasts until cleared externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PauseSpec {
    #[serde(default)]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookStep {
    pub template_name: String,
    #[serde(default)]
    pub args: Vec<HookArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookArg {
    pub name: String,
    pub value: String,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GameDeploymentStatus {
    pub observed_generation: i64,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub updated_replicas: i32,
    pub updated_ready_replicas: i32,
    pub current_revision: String,
    pub update_revision: String,
    #[serde(default)]
    pub collision_count: i32,
    #[serde(default)]
    pub label_selector: String,
    #[serde(default)]
    pub canary: Option<CanaryStatus>,
    #[serde(default)]
    pub conditions: Vec<DeploymentCondition>,
    #[serde(default)]
    pub pre_delete_hooks: Vec<PreDeleteHookCondition>,
}

/// Canary progress for one update revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CanaryStatus {
    /// Update revision this progress belongs to.
    pub revision: String,
    pub step_index: i32,
    /// Hash of the step plan; a different plan restarts at step 0.
    pub step_hash: String,
    #[serde(default)]
    pub current_hook_run: Option<String>,
    #[serde(default)]
    pub pause_start: Option<DateTime<Utc>>,
    /// Clearing this list externally resumes a paused step.
    #[serde(default)]
    pub pause_conditions: Vec<PauseCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseCondition {
    pub reason: PauseReason,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    /// The step defines a pause.
    CanaryPause,
    /// The step's hook ended in failure, error, or inconclusive.
    HookFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    FailedScale,
    FailedUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentCondition {
    pub kind: ConditionKind,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Progress of one instance's pre-delete hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreDeleteHookCondition {
    pub instance_name: String,
    pub identity: String,
    pub hook_run: String,
    pub phase: HookPhase,
    pub start_time: DateTime<Utc>,
}

impl GameDeploymentStatus {
    pub fn condition(&self, kind: ConditionKind) -> Option<&DeploymentCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Records a failure condition. The transition time only moves when the
    /// reason or message changes.
    pub fn set_condition(
        &mut self,
        kind: ConditionKind,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.kind == kind) {
            if existing.reason != reason || existing.message != message {
                existing.reason = reason;
                existing.message = message;
                existing.last_transition_time = now;
            }
            return;
        }

        self.conditions.push(DeploymentCondition {
            kind,
            reason,
            message,
            last_transition_time: now,
        });
        if self.conditions.len() > MAX_CONDITIONS {
            let excess = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(..excess);
        }
    }

    pub fn clear_condition(&mut self, kind: ConditionKind) {
        self.conditions.retain(|c| c.kind != kind);
    }
}
