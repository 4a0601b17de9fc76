//! Ordering of instances from "worst state" to "best state".
//!
//! Scale-in removes instances from the front of this order and the update
//! engine transitions them in the same order, so the instances that serve
//! traffic least are disturbed first.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a workload instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstancePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    /// Lower ranks are removed first.
    fn rank(self) -> u8 {
        match self {
            InstancePhase::Failed | InstancePhase::Succeeded => 0,
            InstancePhase::Pending => 1,
            InstancePhase::Unknown => 2,
            InstancePhase::Running => 3,
        }
    }
}

/// Sort key summarizing how healthy an instance is.
///
/// `Ord` puts the least valuable instance first:
/// unscheduled < scheduled, terminal < pending < unknown < running,
/// not ready < ready, recently ready < long ready, new < old.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRank {
    pub scheduled: bool,
    pub phase: InstancePhase,
    pub ready: bool,
    pub ready_since: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Ord for InstanceRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled
            .cmp(&other.scheduled)
            .then_with(|| self.phase.rank().cmp(&other.phase.rank()))
            .then_with(|| self.ready.cmp(&other.ready))
            .then_with(|| {
                if self.ready && other.ready {
                    newest_first(self.ready_since, other.ready_since)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| newest_first(self.created_at, other.created_at))
    }
}

impl PartialOrd for InstanceRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Unknown timestamps sort before any known one.
fn newest_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => b.cmp(&a),
    }
}
