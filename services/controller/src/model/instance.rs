//! Workload instances and the template they are stamped from.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use gamefleet_events::ObjectKey;
use gamefleet_reconcile::{InstancePhase, InstanceRank};
use serde::{Deserialize, Serialize};

use super::meta::{labels, ObjectMeta};

/// Template instances are created from; the hashed part of a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstanceTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: InstanceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstanceSpec {
    pub containers: Vec<Container>,
    #[serde(default)]
    pub readiness_gates: Vec<ReadinessGate>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Extra condition an instance must report before it counts as ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessGate {
    pub condition_type: InstanceConditionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceConditionType {
    Ready,
    InPlaceUpdateReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCondition {
    pub condition_type: InstanceConditionType,
    pub status: bool,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    /// Image the container is actually running.
    pub image: String,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<InstanceCondition>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

/// A running unit created from a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub meta: ObjectMeta,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

/// Record written to `gamefleet.io/inplace-update-state` on in-place update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InPlaceUpdateState {
    pub revision: String,
    pub update_timestamp: DateTime<Utc>,
    /// Container name to image before the update.
    pub last_container_images: BTreeMap<String, String>,
}

impl WorkloadInstance {
    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Revision name from the revision label.
    pub fn revision(&self) -> Option<&str> {
        self.meta.label(labels::REVISION_HASH)
    }

    /// Identity token from the instance-id label.
    pub fn identity(&self) -> Option<&str> {
        self.meta.label(labels::INSTANCE_ID)
    }

    pub fn is_scheduled(&self) -> bool {
        self.status.node_name.is_some()
    }

    pub fn condition(&self, condition_type: InstanceConditionType) -> Option<&InstanceCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Sets a condition, keeping the transition time when the status is unchanged.
    pub fn set_condition(&mut self, condition_type: InstanceConditionType, status: bool, now: DateTime<Utc>) {
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) if existing.status == status => {}
            Some(existing) => {
                existing.status = status;
                existing.last_transition_time = now;
            }
            None => self.status.conditions.push(InstanceCondition {
                condition_type,
                status,
                last_transition_time: now,
            }),
        }
    }

    pub fn has_readiness_gate(&self, condition_type: InstanceConditionType) -> bool {
        self.spec
            .readiness_gates
            .iter()
            .any(|g| g.condition_type == condition_type)
    }

    /// Running with a true `Ready` condition.
    pub fn is_ready(&self) -> bool {
        self.status.phase == InstancePhase::Running
            && self
                .condition(InstanceConditionType::Ready)
                .is_some_and(|c| c.status)
    }

    /// When the instance last became ready.
    pub fn ready_since(&self) -> Option<DateTime<Utc>> {
        if !self.is_ready() {
            return None;
        }
        self.condition(InstanceConditionType::Ready)
            .map(|c| c.last_transition_time)
    }

    /// Ready for at least `min_ready_seconds`.
    pub fn is_available(&self, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
        match self.ready_since() {
            None => false,
            Some(_) if min_ready_seconds <= 0 => true,
            Some(since) => since + Duration::seconds(i64::from(min_ready_seconds)) <= now,
        }
    }

    /// Time until a ready-but-not-yet-available instance becomes available.
    pub fn until_available(&self, min_ready_seconds: i32, now: DateTime<Utc>) -> Option<Duration> {
        if min_ready_seconds <= 0 {
            return None;
        }
        let since = self.ready_since()?;
        let remaining = since + Duration::seconds(i64::from(min_ready_seconds)) - now;
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// True once every container reports the image its spec asks for.
    pub fn images_converged(&self) -> bool {
        self.spec.containers.iter().all(|c| {
            self.status
                .container_statuses
                .iter()
                .any(|s| s.name == c.name && s.image == c.image)
        })
    }

    pub fn in_place_update_state(&self) -> Option<InPlaceUpdateState> {
        self.meta
            .annotations
            .get(labels::INPLACE_UPDATE_STATE)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Sort key from worst to best state.
    pub fn rank(&self) -> InstanceRank {
        InstanceRank {
            scheduled: self.is_scheduled(),
            phase: self.status.phase,
            ready: self.is_ready(),
            ready_since: self.ready_since(),
            created_at: self.meta.creation_timestamp,
        }
    }
}
