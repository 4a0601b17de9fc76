//! Hook runs: externally executed verification tasks.

use gamefleet_events::ObjectKey;
use serde::{Deserialize, Serialize};

use super::deployment::HookArg;
use super::meta::ObjectMeta;

/// Phase reported by the hook execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HookPhase {
    #[default]
    Pending,
    Running,
    Successful,
    Failed,
    Error,
    Inconclusive,
}

impl HookPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HookPhase::Pending | HookPhase::Running)
    }

    pub fn is_successful(self) -> bool {
        self == HookPhase::Successful
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookPhase::Pending => "Pending",
            HookPhase::Running => "Running",
            HookPhase::Successful => "Successful",
            HookPhase::Failed => "Failed",
            HookPhase::Error => "Error",
            HookPhase::Inconclusive => "Inconclusive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HookRunSpec {
    pub template_name: String,
    #[serde(default)]
    pub args: Vec<HookArg>,
    /// Set to ask the backend to stop a non-terminal run.
    #[serde(default)]
    pub terminate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HookRunStatus {
    #[serde(default)]
    pub phase: HookPhase,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRun {
    pub meta: ObjectMeta,
    pub spec: HookRunSpec,
    #[serde(default)]
    pub status: HookRunStatus,
}

impl HookRun {
    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn phase(&self) -> HookPhase {
        self.status.phase
    }

    /// Non-terminal and not yet asked to stop.
    pub fn is_active(&self) -> bool {
        !self.status.phase.is_terminal() && !self.spec.terminate
    }
}
