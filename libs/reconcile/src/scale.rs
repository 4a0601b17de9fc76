//! Scale diff: how many instances to add or remove, and from which revision.

use crate::{IntOrPercent, ReconcileError};

/// Observed and desired counts feeding the scale decision.
#[derive(Debug, Clone)]
pub struct ScaleInputs {
    /// Desired replica count from the spec.
    pub desired_replicas: i32,

    /// Instances that must stay on the current revision (active canary step
    /// partition, or the static partition setting).
    pub partition: i32,

    /// Surge budget from the update strategy.
    pub max_surge: Option<IntOrPercent>,

    /// True when the current and update revisions are the same object.
    pub revisions_consistent: bool,

    /// Live instances of the deployment.
    pub total_instances: i32,

    /// Live instances not on the update revision.
    pub not_updated: i32,
}

/// Result of the scale computation.
///
/// `total_diff < 0` means scale out by `-total_diff`, `> 0` means scale in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaleDiff {
    pub total_diff: i32,
    pub current_rev_diff: i32,
    pub surge_used: i32,
}

/// How a scale-out is split between the two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreationSplit {
    pub on_current: usize,
    pub on_update: usize,
}

impl ScaleDiff {
    /// Number of instances to create this pass.
    pub fn create_count(&self) -> usize {
        if self.total_diff < 0 {
            self.total_diff.unsigned_abs() as usize
        } else {
            0
        }
    }

    /// Number of instances to delete this pass.
    pub fn delete_count(&self) -> usize {
        if self.total_diff > 0 {
            self.total_diff as usize
        } else {
            0
        }
    }

    /// Splits a scale-out: the partition deficit is minted on the current
    /// revision, the remainder on the update revision.
    pub fn creation_split(&self) -> CreationSplit {
        let total = self.create_count();
        let on_current = if self.current_rev_diff < 0 {
            (self.current_rev_diff.unsigned_abs() as usize).min(total)
        } else {
            0
        };
        CreationSplit {
            on_current,
            on_update: total - on_current,
        }
    }
}

/// Computes the scale diff.
///
/// While a rollout is active, `current_rev_diff` is how many not-updated
/// instances exceed the partition; a positive value lets the rollout borrow
/// up to `max_surge` extra instances (rounded up, capped at the excess).
pub fn compute_diff(inputs: &ScaleInputs) -> Result<ScaleDiff, ReconcileError> {
    for (field, value) in [
        ("desired_replicas", inputs.desired_replicas),
        ("partition", inputs.partition),
        ("total_instances", inputs.total_instances),
        ("not_updated", inputs.not_updated),
    ] {
        if value < 0 {
            return Err(ReconcileError::Negative {
                field,
                value: i64::from(value),
            });
        }
    }

    let mut current_rev_diff = 0;
    let mut surge_used = 0;

    if !inputs.revisions_consistent {
        current_rev_diff =
            inputs.not_updated - inputs.partition.min(inputs.desired_replicas);

        if current_rev_diff > 0 {
            if let Some(max_surge) = &inputs.max_surge {
                surge_used = max_surge
                    .scaled_value(inputs.desired_replicas, true)?
                    .min(current_rev_diff);
            }
        }
    }

    Ok(ScaleDiff {
        total_diff: inputs.total_instances - inputs.desired_replicas - surge_used,
        current_rev_diff,
        surge_used,
    })
}

/// Splits instances into (updated, not updated) by revision.
pub fn split_by_revision<I, F>(instances: I, update_revision: &str, revision_of: F) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    F: Fn(&I::Item) -> Option<&str>,
{
    let mut updated = Vec::new();
    let mut not_updated = Vec::new();

    for instance in instances {
        if revision_of(&instance) == Some(update_revision) {
            updated.push(instance);
        } else {
            not_updated.push(instance);
        }
    }

    (updated, not_updated)
}

/// Picks scale-in victims.
///
/// Not-updated instances go first, up to `current_rev_diff`; the remainder
/// comes from the updated set. Within a set, instances are ordered by `rank`
/// (worst state first) unless the whole set is being removed.
pub fn choose_victims<T, K, F>(
    total_diff: usize,
    current_rev_diff: i32,
    not_updated: Vec<T>,
    updated: Vec<T>,
    rank: F,
) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let choose = |mut set: Vec<T>, count: usize| -> Vec<T> {
        if count < set.len() {
            set.sort_by_key(|item| rank(item));
            set.truncate(count);
        }
        set
    };

    let from_old = if current_rev_diff > 0 {
        (current_rev_diff as usize).min(total_diff)
    } else {
        0
    };

    let mut victims = choose(not_updated, from_old);
    let shortfall = total_diff - victims.len();
    if shortfall > 0 {
        victims.extend(choose(updated, shortfall));
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn inputs(
        desired: i32,
        partition: i32,
        surge: Option<IntOrPercent>,
        consistent: bool,
        total: i32,
        not_updated: i32,
    ) -> ScaleInputs {
        ScaleInputs {
            desired_replicas: desired,
            partition,
            max_surge: surge,
            revisions_consistent: consistent,
            total_instances: total,
            not_updated,
        }
    }

    #[test]
    fn test_fresh_deployment_scales_out_on_update_revision() {
        let diff = compute_diff(&inputs(3, 0, None, true, 0, 0)).unwrap();
        assert_eq!(diff.total_diff, -3);
        assert_eq!(diff.create_count(), 3);
        assert_eq!(
            diff.creation_split(),
            CreationSplit {
                on_current: 0,
                on_update: 3
            }
        );
    }

    #[test]
    fn test_partition_satisfied_means_no_forced_scale() {
        // 10 replicas, 8 updated, 2 old, partition 2.
        let diff = compute_diff(&inputs(10, 2, None, false, 10, 2)).unwrap();
        assert_eq!(diff.current_rev_diff, 0);
        assert_eq!(diff.total_diff, 0);
    }

    #[rstest]
    // surge of 25% of 10 rounds up to 3, capped by the 10 old instances
    #[case(IntOrPercent::percent(25), 10, 3, -3)]
    // surge capped by current_rev_diff
    #[case(IntOrPercent::Int(5), 2, 2, -2)]
    #[case(IntOrPercent::Int(0), 10, 0, 0)]
    fn test_surge_is_capped_by_excess(
        #[case] surge: IntOrPercent,
        #[case] not_updated: i32,
        #[case] expected_surge: i32,
        #[case] expected_total: i32,
    ) {
        let diff = compute_diff(&inputs(10, 0, Some(surge), false, 10, not_updated)).unwrap();
        assert_eq!(diff.surge_used, expected_surge);
        assert_eq!(diff.total_diff, expected_total);
    }

    #[test]
    fn test_partition_deficit_is_minted_on_current_revision() {
        // Partition 4 but only 1 old instance left, 2 instances missing.
        let diff = compute_diff(&inputs(10, 4, None, false, 8, 1)).unwrap();
        assert_eq!(diff.current_rev_diff, -3);
        assert_eq!(diff.total_diff, -2);
        assert_eq!(
            diff.creation_split(),
            CreationSplit {
                on_current: 2,
                on_update: 0
            }
        );
    }

    #[test]
    fn test_surge_ignored_when_revisions_consistent() {
        let diff = compute_diff(&inputs(5, 0, Some(IntOrPercent::Int(2)), true, 7, 0)).unwrap();
        assert_eq!(diff.surge_used, 0);
        assert_eq!(diff.total_diff, 2);
        assert_eq!(diff.delete_count(), 2);
    }

    #[test]
    fn test_negative_input_rejected() {
        assert!(compute_diff(&inputs(-1, 0, None, true, 0, 0)).is_err());
    }

    #[test]
    fn test_choose_victims_prefers_not_updated_then_worst_state() {
        // (name, rank); lower rank is worse
        let old = vec![("old-a", 5), ("old-b", 1), ("old-c", 3)];
        let new = vec![("new-a", 4), ("new-b", 0)];

        let victims = choose_victims(3, 2, old, new, |(_, r)| *r);
        let names: Vec<_> = victims.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["old-b", "old-c", "new-b"]);
    }

    #[test]
    fn test_choose_victims_whole_set_unsorted() {
        let old = vec![("old-a", 5), ("old-b", 1)];
        let victims = choose_victims(2, 2, old, vec![], |(_, r)| *r);
        let names: Vec<_> = victims.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["old-a", "old-b"]);
    }

    #[test]
    fn test_choose_victims_only_updated_when_no_excess_old() {
        let old = vec![("old-a", 0)];
        let new = vec![("new-a", 2), ("new-b", 1)];
        let victims = choose_victims(1, 0, old, new, |(_, r)| *r);
        assert_eq!(victims, vec![("new-b", 1)]);
    }

    #[test]
    fn test_split_by_revision() {
        let instances = vec![("i1", "rev-b"), ("i2", "rev-a"), ("i3", "rev-b")];
        let (updated, not_updated) = split_by_revision(instances, "rev-b", |(_, r)| Some(*r));
        assert_eq!(updated.len(), 2);
        assert_eq!(not_updated, vec![("i2", "rev-a")]);
    }

    proptest! {
        #[test]
        fn prop_scale_diff_conserves_instances(
            desired in 0i32..200,
            total in 0i32..260,
            partition in 0i32..220,
            surge in proptest::option::of(0i32..50),
            not_updated_frac in 0.0f64..=1.0,
            consistent in any::<bool>(),
        ) {
            let not_updated = if consistent { 0 } else { (f64::from(total) * not_updated_frac) as i32 };
            let diff = compute_diff(&inputs(
                desired, partition, surge.map(IntOrPercent::Int), consistent, total, not_updated,
            )).unwrap();

            // Applying the diff lands exactly on desired + surge.
            prop_assert_eq!(total - diff.total_diff, desired + diff.surge_used);
            prop_assert!(diff.surge_used >= 0);
            prop_assert!(diff.surge_used <= diff.current_rev_diff.max(0));

            let split = diff.creation_split();
            prop_assert_eq!(split.on_current + split.on_update, diff.create_count());
        }

        #[test]
        fn prop_victims_never_exceed_request(
            old_count in 0usize..20,
            new_count in 0usize..20,
            want in 0usize..40,
            rev_diff in -5i32..25,
        ) {
            let want = want.min(old_count + new_count);
            let old: Vec<usize> = (0..old_count).collect();
            let new: Vec<usize> = (100..100 + new_count).collect();
            let victims = choose_victims(want, rev_diff, old, new, |v| *v);
            prop_assert!(victims.len() <= want);
            let from_old = victims.iter().filter(|v| **v < 100).count();
            prop_assert!(from_old <= rev_diff.max(0) as usize);
        }
    }
}
