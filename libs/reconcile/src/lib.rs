//! Reconciliation decision primitives.
//!
//! This library holds the pure, synchronous half of the game deployment
//! controller: given observed counts and the desired spec it decides how many
//! instances to create, delete, or update. Nothing here performs I/O. Key
//! concepts:
//!
//! - **Revision**: a content hash of the instance template. Instances on the
//!   newest revision are *updated*, the rest are *not yet updated*.
//! - **Partition**: how many instances must stay on the old revision.
//! - **Surge / unavailable budgets**: how far the instance count may rise
//!   above, or availability fall below, the desired replica count mid-rollout.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - `total_instances - total_diff == desired_replicas + surge_used` for every diff
//! - An update count never pushes unavailability past the budget it was given

mod batch;
mod budget;
mod hash;
mod order;
mod scale;
mod update;

use thiserror::Error;

pub use batch::SlowStart;
pub use budget::IntOrPercent;
pub use hash::{canonical_json, content_digest, revision_hash};
pub use order::{InstancePhase, InstanceRank};
pub use scale::{choose_victims, compute_diff, split_by_revision, CreationSplit, ScaleDiff, ScaleInputs};
pub use update::{compute_update_count, UpdateOptions, DEFAULT_MAX_UNAVAILABLE};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// An int-or-percent value could not be interpreted.
    #[error("invalid int-or-percent value '{0}'")]
    InvalidIntOrPercent(String),

    /// A count that must be non-negative was negative.
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },
}
