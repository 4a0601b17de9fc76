//! Update count: how many not-yet-updated instances may transition this pass.

use crate::{IntOrPercent, ReconcileError};

/// Unavailable budget applied when the strategy does not set one.
pub const DEFAULT_MAX_UNAVAILABLE: &str = "20%";

/// Rollout knobs taken from the update strategy and canary state.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Instances that must stay on the old revision.
    pub partition: i32,
    pub max_unavailable: Option<IntOrPercent>,
    pub max_surge: Option<IntOrPercent>,
    /// Paused deployments (or canary steps) never transition instances.
    pub paused: bool,
}

impl UpdateOptions {
    /// Resolves the unavailable budget against `total_replicas`.
    ///
    /// Percentages round up unless a nonzero surge is configured, in which
    /// case they round down so surge and unavailability cannot both be zero
    /// after rounding.
    pub fn unavailable_budget(&self, total_replicas: i32) -> Result<i32, ReconcileError> {
        let round_up = match &self.max_surge {
            Some(surge) => surge.scaled_value(total_replicas, true)? == 0,
            None => true,
        };
        self.max_unavailable
            .clone()
            .unwrap_or_else(|| IntOrPercent::Percent(DEFAULT_MAX_UNAVAILABLE.to_string()))
            .scaled_value(total_replicas, round_up)
    }
}

/// Computes how many of the waiting instances may be updated concurrently.
///
/// `waiting_indexes` index into `instances` and list the not-yet-updated
/// instances in the order they should be updated. `is_ready` decides
/// availability (including any min-ready-seconds rule). Instances that are
/// already unavailable are free to update; each ready instance taken consumes
/// one unit of `max_unavailable + surge_used`.
pub fn compute_update_count<T, F>(
    options: &UpdateOptions,
    total_replicas: i32,
    waiting_indexes: &[usize],
    instances: &[T],
    is_ready: F,
) -> Result<usize, ReconcileError>
where
    F: Fn(&T) -> bool,
{
    if options.paused {
        return Ok(0);
    }

    let partition = options.partition.max(0) as usize;
    if waiting_indexes.len() <= partition {
        return Ok(0);
    }
    let waiting = &waiting_indexes[..waiting_indexes.len() - partition];

    let max_unavailable = i64::from(options.unavailable_budget(total_replicas)?);
    let surge_used = instances.len() as i64 - i64::from(total_replicas);
    let budget = max_unavailable + surge_used;

    let mut not_ready = instances.iter().filter(|i| !is_ready(i)).count() as i64;
    let mut count = 0;

    for &idx in waiting {
        let Some(instance) = instances.get(idx) else {
            continue;
        };
        if is_ready(instance) {
            if not_ready >= budget {
                break;
            }
            not_ready += 1;
        }
        count += 1;
    }

    Ok(count)
}
