//! Update engine.
//!
//! Moves not-yet-updated instances to the update revision, as many per pass
//! as the unavailable budget allows. The strategy decides how:
//! - `Recreate` deletes the instance (through the pre-delete gate) and lets
//!   the scale engine mint a replacement on the update revision
//! - `InPlace` patches container images and injects the `InPlaceUpdateReady`
//!   readiness gate; the instance counts as unavailable until every container
//!   reports the new image
//! - `HotPatch` patches container images while the instance keeps serving
//!
//! In-place and hot-patch updates may only change container images. Any
//! other difference between the source and target templates is rejected
//! before a single instance is touched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gamefleet_reconcile::{compute_update_count, InstanceRank, UpdateOptions};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::cluster::ClusterClient;
use crate::error::{ControllerError, ControllerResult};
use crate::expectations::ExpectationStore;
use crate::model::{
    labels, GameDeployment, InPlaceUpdateState, InstanceConditionType, ReadinessGate, Revision,
    UpdateStrategyKind, WorkloadInstance,
};
use crate::predelete::PreDeleteGate;
use crate::revision::ResolvedRevisions;

// =============================================================================
// Strategy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    Recreate,
    InPlace,
    HotPatch,
}

impl From<UpdateStrategyKind> for UpdateStrategy {
    fn from(kind: UpdateStrategyKind) -> Self {
        match kind {
            UpdateStrategyKind::Recreate => UpdateStrategy::Recreate,
            UpdateStrategyKind::InPlace => UpdateStrategy::InPlace,
            UpdateStrategyKind::HotPatch => UpdateStrategy::HotPatch,
        }
    }
}

impl UpdateStrategy {
    /// True when the deployment or the current canary step holds updates.
    ///
    /// The same for every strategy: only the deployment's `paused` flag and a
    /// held canary step stop updates. Strategy differences start at
    /// [`Self::is_ready`].
    pub fn is_paused(self, deploy: &GameDeployment, canary_paused: bool) -> bool {
        deploy.spec.update_strategy.paused || canary_paused
    }

    /// Availability as the unavailable budget sees it.
    pub fn is_ready(self, instance: &WorkloadInstance, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
        let available = instance.is_available(min_ready_seconds, now);
        match self {
            UpdateStrategy::InPlace => available && in_place_gate_open(instance),
            UpdateStrategy::Recreate | UpdateStrategy::HotPatch => available,
        }
    }

    /// Update order: worst state first, for every strategy.
    pub fn sort_key(self, instance: &WorkloadInstance) -> InstanceRank {
        instance.rank()
    }

    /// Moves one instance to the update revision.
    pub async fn apply_update(
        self,
        engine: &UpdateEngine<'_>,
        instance: &WorkloadInstance,
        gate: &mut PreDeleteGate<'_>,
    ) -> ControllerResult<()> {
        match self {
            UpdateStrategy::Recreate => engine.recreate(instance, gate).await,
            UpdateStrategy::InPlace => engine.patch_images(instance, true).await,
            UpdateStrategy::HotPatch => engine.patch_images(instance, false).await,
        }
    }

    fn patches_in_place(self) -> bool {
        !matches!(self, UpdateStrategy::Recreate)
    }
}

fn in_place_gate_open(instance: &WorkloadInstance) -> bool {
    !instance.has_readiness_gate(InstanceConditionType::InPlaceUpdateReady)
        || instance
            .condition(InstanceConditionType::InPlaceUpdateReady)
            .is_some_and(|c| c.status)
}

// =============================================================================
// Validation
// =============================================================================

/// Checks that going from `old` to `new` revision data only replaces
/// container images.
pub fn validate_in_place(old: &serde_json::Value, new: &serde_json::Value) -> ControllerResult<()> {
    let patch = serde_json::to_value(json_patch::diff(old, new))?;
    let ops = patch.as_array().map(Vec::as_slice).unwrap_or_default();

    for op in ops {
        let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or_default();
        let path = op.get("path").and_then(|v| v.as_str()).unwrap_or_default();
        if kind != "replace" || !is_container_image_path(path) {
            return Err(ControllerError::InvalidInPlaceUpdate {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

fn is_container_image_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').collect();
    matches!(
        segments.as_slice(),
        ["", "spec", "template", "spec", "containers", idx, "image"]
            if !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit())
    )
}

// =============================================================================
// Engine
// =============================================================================

pub struct UpdateEngine<'a> {
    client: &'a dyn ClusterClient,
    expectations: &'a ExpectationStore,
    clock: &'a dyn Clock,
    deploy: &'a GameDeployment,
    revisions: &'a ResolvedRevisions,
}

impl<'a> UpdateEngine<'a> {
    pub fn new(
        client: &'a dyn ClusterClient,
        expectations: &'a ExpectationStore,
        clock: &'a dyn Clock,
        deploy: &'a GameDeployment,
        revisions: &'a ResolvedRevisions,
    ) -> Self {
        Self {
            client,
            expectations,
            clock,
            deploy,
            revisions,
        }
    }

    /// Runs one update step over the live `instances`.
    #[instrument(skip_all, fields(deployment = %self.deploy.key(), partition = partition))]
    pub async fn reconcile(
        &self,
        instances: &[WorkloadInstance],
        partition: i32,
        canary_paused: bool,
        gate: &mut PreDeleteGate<'_>,
    ) -> ControllerResult<()> {
        let strategy = UpdateStrategy::from(self.deploy.spec.update_strategy.kind);
        let instances = self.open_converged_gates(instances).await?;

        if self.revisions.consistent() {
            return Ok(());
        }

        let update = self.revisions.update.name();
        let mut waiting: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.revision() != Some(update))
            .map(|(idx, _)| idx)
            .collect();
        waiting.sort_by_key(|&idx| strategy.sort_key(&instances[idx]));

        let spec = &self.deploy.spec.update_strategy;
        let options = UpdateOptions {
            partition,
            max_unavailable: spec.max_unavailable.clone(),
            max_surge: spec.max_surge.clone(),
            paused: strategy.is_paused(self.deploy, canary_paused),
        };
        let now = self.clock.now();
        let min_ready = self.deploy.spec.min_ready_seconds;
        let count = compute_update_count(&options, self.deploy.spec.replicas, &waiting, &instances, |i| {
            strategy.is_ready(i, min_ready, now)
        })?;

        debug!(waiting = waiting.len(), count, strategy = ?strategy, "Computed update count");
        if count == 0 {
            return Ok(());
        }

        let selected: Vec<&WorkloadInstance> = waiting[..count].iter().map(|&idx| &instances[idx]).collect();

        if strategy.patches_in_place() {
            for instance in &selected {
                validate_in_place(&self.source_revision(instance).data, &self.revisions.update.data)?;
            }
        }

        let mut first_error = None;
        for instance in selected {
            if let Err(e) = strategy.apply_update(self, instance, gate).await {
                warn!(instance = %instance.name(), error = %e, "Instance update failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn source_revision(&self, instance: &WorkloadInstance) -> &Revision {
        instance
            .revision()
            .and_then(|name| self.revisions.history.iter().find(|r| r.name() == name))
            .unwrap_or(&self.revisions.current)
    }

    /// Flips `InPlaceUpdateReady` to true on instances whose containers all
    /// run their target images. Returns the instances as they are now.
    async fn open_converged_gates(&self, instances: &[WorkloadInstance]) -> ControllerResult<Vec<WorkloadInstance>> {
        let mut result = Vec::with_capacity(instances.len());
        for instance in instances {
            let pending = instance.has_readiness_gate(InstanceConditionType::InPlaceUpdateReady)
                && !in_place_gate_open(instance)
                && instance.images_converged();
            if !pending {
                result.push(instance.clone());
                continue;
            }

            let mut opened = instance.clone();
            opened.set_condition(InstanceConditionType::InPlaceUpdateReady, true, self.clock.now());
            let opened = self.client.update_instance(&opened).await?;
            info!(instance = %opened.name(), "In-place update converged, readiness gate opened");
            result.push(opened);
        }
        Ok(result)
    }

    async fn recreate(&self, instance: &WorkloadInstance, gate: &mut PreDeleteGate<'_>) -> ControllerResult<()> {
        if !gate.check_delete(instance).await? {
            return Ok(());
        }

        let key = self.deploy.key();
        self.expectations.expect_delete(&key, instance.name());
        match self.client.delete_instance(&instance.key()).await {
            Ok(()) => {
                info!(instance = %instance.name(), from = ?instance.revision(), "Deleted instance for recreate");
                Ok(())
            }
            Err(e) => {
                self.expectations.retract_delete(&key, instance.name());
                if e.is_not_found() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn patch_images(&self, instance: &WorkloadInstance, with_gate: bool) -> ControllerResult<()> {
        let target = self.revisions.update.template()?;
        let now = self.clock.now();

        let mut patched = instance.clone();
        let last_container_images: BTreeMap<String, String> = instance
            .spec
            .containers
            .iter()
            .map(|c| (c.name.clone(), c.image.clone()))
            .collect();
        for container in &mut patched.spec.containers {
            if let Some(wanted) = target.spec.containers.iter().find(|c| c.name == container.name) {
                container.image = wanted.image.clone();
            }
        }

        let update = self.revisions.update.name();
        patched
            .meta
            .labels
            .insert(labels::REVISION_HASH.into(), update.to_string());
        let state = InPlaceUpdateState {
            revision: update.to_string(),
            update_timestamp: now,
            last_container_images,
        };
        patched
            .meta
            .annotations
            .insert(labels::INPLACE_UPDATE_STATE.into(), serde_json::to_string(&state)?);

        if with_gate {
            if !patched.has_readiness_gate(InstanceConditionType::InPlaceUpdateReady) {
                patched.spec.readiness_gates.push(ReadinessGate {
                    condition_type: InstanceConditionType::InPlaceUpdateReady,
                });
            }
            patched.set_condition(InstanceConditionType::InPlaceUpdateReady, false, now);
        }

        let key = self.deploy.key();
        self.expectations.expect_update(&key, instance.name(), update);
        match self.client.update_instance(&patched).await {
            Ok(_) => {
                info!(
                    instance = %instance.name(),
                    from = ?instance.revision(),
                    to = %update,
                    gated = with_gate,
                    "Patched instance images"
                );
                Ok(())
            }
            Err(e) => {
                self.expectations.retract_update(&key, instance.name());
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::clock::SystemClock;
    use crate::cluster::InMemoryCluster;
    use crate::fixtures::{self, NAMESPACE};
    use crate::model::{Container, EnvVar};
    use crate::revision::RevisionStore;
    use crate::scale::ScaleEngine;
    use gamefleet_reconcile::IntOrPercent;
    use rstest::rstest;

    #[rstest]
    #[case("/spec/template/spec/containers/0/image", true)]
    #[case("/spec/template/spec/containers/12/image", true)]
    #[case("/spec/template/spec/containers/x/image", false)]
    #[case("/spec/template/spec/containers/0/args", false)]
    #[case("/spec/template/labels/app", false)]
    #[case("/spec/template/spec/containers//image", false)]
    fn test_image_path_matcher(#[case] path: &str, #[case] ok: bool) {
        assert_eq!(is_container_image_path(path), ok);
    }

    #[rstest]
    fn test_pause_sources_shared_by_all_strategies(
        #[values(UpdateStrategy::Recreate, UpdateStrategy::InPlace, UpdateStrategy::HotPatch)]
        strategy: UpdateStrategy,
    ) {
        let mut deploy = fixtures::deployment("arena", 2, "arena:1");
        assert!(!strategy.is_paused(&deploy, false));
        assert!(strategy.is_paused(&deploy, true));
        deploy.spec.update_strategy.paused = true;
        assert!(strategy.is_paused(&deploy, false));
    }

    #[test]
    fn test_validate_allows_image_only_change() {
        let old = Revision::data_for(&fixtures::template("arena", "arena:1")).unwrap();
        let new = Revision::data_for(&fixtures::template("arena", "arena:2")).unwrap();
        assert!(validate_in_place(&old, &new).is_ok());
        assert!(validate_in_place(&old, &old).is_ok());
    }

    #[test]
    fn test_validate_rejects_other_fields() {
        let old = Revision::data_for(&fixtures::template("arena", "arena:1")).unwrap();
        let mut template = fixtures::template("arena", "arena:2");
        template.spec.containers[0].env.push(EnvVar {
            name: "MAP".into(),
            value: "dust".into(),
        });
        let new = Revision::data_for(&template).unwrap();

        match validate_in_place(&old, &new) {
            Err(ControllerError::InvalidInPlaceUpdate { path }) => {
                assert!(path.starts_with("/spec/template/spec/containers/0/env"), "{path}");
            }
            other => panic!("expected invalid in-place update, got {other:?}"),
        }

        let mut template = fixtures::template("arena", "arena:1");
        template.spec.containers.push(Container {
            name: "sidecar".into(),
            image: "proxy:1".into(),
            ..Default::default()
        });
        let new = Revision::data_for(&template).unwrap();
        assert!(validate_in_place(&old, &new).is_err());
    }

    struct Harness {
        cluster: InMemoryCluster,
        expectations: ExpectationStore,
        clock: SystemClock,
    }

    impl Harness {
        async fn start(replicas: i32, kind: UpdateStrategyKind) -> (Self, GameDeployment) {
            let h = Self {
                cluster: InMemoryCluster::new(),
                expectations: ExpectationStore::new(Arc::new(SystemClock), Duration::from_secs(300)),
                clock: SystemClock,
            };
            let mut deploy = fixtures::deployment("arena", replicas, "arena:1");
            deploy.spec.update_strategy.kind = kind;
            let deploy = h.cluster.apply_deployment(&deploy).unwrap();

            let revisions = RevisionStore::new(&h.cluster).resolve(&deploy, &[]).await.unwrap();
            let mut gate = PreDeleteGate::new(&h.cluster, &h.clock, &deploy);
            ScaleEngine::new(&h.cluster, &h.expectations, &deploy, &revisions)
                .reconcile(&[], 0, &mut gate)
                .await
                .unwrap();
            h.cluster.mark_all_ready(NAMESPACE).unwrap();
            // no event dispatcher here; start from a clean slate
            h.expectations.delete_key(&deploy.key());
            (h, deploy)
        }

        async fn update(&self, deploy: &GameDeployment, partition: i32) -> ControllerResult<()> {
            let instances = self.cluster.instances(NAMESPACE);
            let revisions = RevisionStore::new(&self.cluster)
                .resolve(deploy, &instances)
                .await?;
            let mut gate = PreDeleteGate::new(&self.cluster, &self.clock, deploy);
            UpdateEngine::new(&self.cluster, &self.expectations, &self.clock, deploy, &revisions)
                .reconcile(&instances, partition, false, &mut gate)
                .await
        }

        fn images(&self) -> Vec<String> {
            self.cluster
                .instances(NAMESPACE)
                .iter()
                .map(|i| i.spec.containers[0].image.clone())
                .collect()
        }
    }

    fn roll(cluster: &InMemoryCluster, mut deploy: GameDeployment, image: &str) -> GameDeployment {
        deploy.spec.template = fixtures::template("arena", image);
        cluster.apply_deployment(&deploy).unwrap()
    }

    #[tokio::test]
    async fn test_in_place_update_respects_budget_and_gate() {
        let (h, deploy) = Harness::start(10, UpdateStrategyKind::InPlace).await;
        let deploy = roll(&h.cluster, deploy, "arena:2");

        // default 20% of 10 = 2 per pass
        h.update(&deploy, 0).await.unwrap();
        let patched: Vec<WorkloadInstance> = h
            .cluster
            .instances(NAMESPACE)
            .into_iter()
            .filter(|i| i.spec.containers[0].image == "arena:2")
            .collect();
        assert_eq!(patched.len(), 2);
        for inst in &patched {
            assert!(inst.has_readiness_gate(InstanceConditionType::InPlaceUpdateReady));
            let state = inst.in_place_update_state().unwrap();
            assert_eq!(state.last_container_images["server"], "arena:1");
            assert_eq!(inst.revision(), Some(state.revision.as_str()));
        }
        assert_eq!(h.expectations.pending(&deploy.key()), 2);

        // still unavailable: gate closed, so the budget is spent
        h.update(&deploy, 0).await.unwrap();
        assert_eq!(h.images().iter().filter(|i| *i == "arena:2").count(), 2);

        // containers report the new image; gate opens and two more go
        for inst in &patched {
            h.cluster.set_instance_ready(&inst.key(), true).unwrap();
        }
        h.update(&deploy, 0).await.unwrap();
        assert_eq!(h.images().iter().filter(|i| *i == "arena:2").count(), 4);
        let gated_open = h
            .cluster
            .instances(NAMESPACE)
            .iter()
            .filter(|i| {
                i.condition(InstanceConditionType::InPlaceUpdateReady)
                    .is_some_and(|c| c.status)
            })
            .count();
        assert_eq!(gated_open, 2);
    }

    #[tokio::test]
    async fn test_partition_holds_instances_back() {
        let (h, mut deploy) = Harness::start(4, UpdateStrategyKind::HotPatch).await;
        deploy.spec.update_strategy.max_unavailable = Some(IntOrPercent::Int(4));
        let deploy = roll(&h.cluster, deploy, "arena:2");

        h.update(&deploy, 3).await.unwrap();
        assert_eq!(h.images().iter().filter(|i| *i == "arena:2").count(), 1);

        // hot-patched instances never close a gate
        assert!(h
            .cluster
            .instances(NAMESPACE)
            .iter()
            .all(|i| i.spec.readiness_gates.is_empty()));
    }

    #[tokio::test]
    async fn test_recreate_deletes_selected_instances() {
        let (h, mut deploy) = Harness::start(5, UpdateStrategyKind::Recreate).await;
        deploy.spec.update_strategy.max_unavailable = Some(IntOrPercent::Int(2));
        let deploy = roll(&h.cluster, deploy, "arena:2");

        h.update(&deploy, 0).await.unwrap();
        assert_eq!(h.cluster.instances(NAMESPACE).len(), 3);
        assert_eq!(h.cluster.call_count("delete_instance"), 2);
        assert_eq!(h.expectations.pending(&deploy.key()), 2);
    }

    #[tokio::test]
    async fn test_in_place_rejects_non_image_change_before_patching() {
        let (h, mut deploy) = Harness::start(3, UpdateStrategyKind::InPlace).await;
        deploy.spec.template = fixtures::template("arena", "arena:2");
        deploy.spec.template.spec.containers[0].args = vec!["--ranked".into()];
        let deploy = h.cluster.apply_deployment(&deploy).unwrap();

        let err = h.update(&deploy, 0).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInPlaceUpdate { .. }));
        assert!(err.is_permanent());
        assert_eq!(h.cluster.call_count("update_instance"), 0);
    }

    #[tokio::test]
    async fn test_paused_strategy_updates_nothing() {
        let (h, mut deploy) = Harness::start(3, UpdateStrategyKind::HotPatch).await;
        deploy.spec.update_strategy.paused = true;
        let deploy = roll(&h.cluster, deploy, "arena:2");

        h.update(&deploy, 0).await.unwrap();
        assert!(h.images().iter().all(|i| i == "arena:1"));
    }
}
