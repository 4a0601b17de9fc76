//! Scale engine.
//!
//! Brings the instance count to the desired replica count:
//! - explicitly named deletions run first and end the scale phase
//! - scale-out mints instances in slow-start batches, on the current revision
//!   when the partition is short and on the update revision otherwise
//! - scale-in removes the worst-ranked instances, not-yet-updated first
//!
//! Every create and delete is recorded as an expectation before the call is
//! issued and retracted if the call fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;
use gamefleet_id::InstanceIdentity;
use gamefleet_reconcile::{choose_victims, compute_diff, split_by_revision, ScaleInputs, SlowStart};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterClient, ClusterError};
use crate::error::{ControllerError, ControllerResult};
use crate::expectations::ExpectationStore;
use crate::model::{labels, GameDeployment, InstanceTemplate, ObjectMeta, Revision, WorkloadInstance};
use crate::predelete::PreDeleteGate;
use crate::revision::ResolvedRevisions;

/// Size of the first creation batch.
const INITIAL_BATCH_SIZE: usize = 1;

/// Builds a new instance of `deploy` from `template` on `revision`.
pub fn new_instance(
    deploy: &GameDeployment,
    revision: &Revision,
    template: &InstanceTemplate,
    identity: &InstanceIdentity,
) -> WorkloadInstance {
    let name = format!("{}-{}", deploy.name(), identity.as_str());
    let mut meta = ObjectMeta::named(deploy.meta.namespace.clone(), name);
    meta.labels = template.labels.clone();
    meta.labels
        .insert(labels::DEPLOYMENT.into(), deploy.name().to_string());
    meta.labels
        .insert(labels::REVISION_HASH.into(), revision.name().to_string());
    meta.labels
        .insert(labels::INSTANCE_ID.into(), identity.as_str().to_string());
    meta.annotations = template.annotations.clone();
    meta.owner_references.push(deploy.owner_reference());

    WorkloadInstance {
        meta,
        spec: template.spec.clone(),
        status: Default::default(),
    }
}

pub struct ScaleEngine<'a> {
    client: &'a dyn ClusterClient,
    expectations: &'a ExpectationStore,
    deploy: &'a GameDeployment,
    revisions: &'a ResolvedRevisions,
}

impl<'a> ScaleEngine<'a> {
    pub fn new(
        client: &'a dyn ClusterClient,
        expectations: &'a ExpectationStore,
        deploy: &'a GameDeployment,
        revisions: &'a ResolvedRevisions,
    ) -> Self {
        Self {
            client,
            expectations,
            deploy,
            revisions,
        }
    }

    /// Runs one scale step. Returns true when instances were created, deleted,
    /// or held back by the pre-delete gate; the update step is skipped then.
    #[instrument(skip_all, fields(deployment = %self.deploy.key(), partition = partition))]
    pub async fn reconcile(
        &self,
        instances: &[WorkloadInstance],
        partition: i32,
        gate: &mut PreDeleteGate<'_>,
    ) -> ControllerResult<bool> {
        let named: Vec<&WorkloadInstance> = instances
            .iter()
            .filter(|i| {
                self.deploy
                    .spec
                    .scale_strategy
                    .instances_to_delete
                    .iter()
                    .any(|n| n == i.name())
            })
            .collect();
        if !named.is_empty() {
            debug!(count = named.len(), "Handling explicit deletions");
            self.delete_all(named, gate).await?;
            return Ok(true);
        }

        let update = self.revisions.update.name();
        let (updated, not_updated) = split_by_revision(instances.iter(), update, |i| i.revision());

        let diff = compute_diff(&ScaleInputs {
            desired_replicas: self.deploy.spec.replicas,
            partition,
            max_surge: self.deploy.spec.update_strategy.max_surge.clone(),
            revisions_consistent: self.revisions.consistent(),
            total_instances: instances.len() as i32,
            not_updated: not_updated.len() as i32,
        })?;

        debug!(
            total_diff = diff.total_diff,
            current_rev_diff = diff.current_rev_diff,
            surge_used = diff.surge_used,
            "Computed scale diff"
        );

        if diff.create_count() > 0 {
            let split = diff.creation_split();
            self.create(instances, split.on_current, split.on_update).await?;
            return Ok(true);
        }

        if diff.delete_count() > 0 {
            let victims = choose_victims(
                diff.delete_count(),
                diff.current_rev_diff,
                not_updated,
                updated,
                |i| i.rank(),
            );
            info!(count = victims.len(), "Scaling in");
            self.delete_all(victims, gate).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn create(
        &self,
        live: &[WorkloadInstance],
        on_current: usize,
        on_update: usize,
    ) -> ControllerResult<()> {
        let requested = on_current + on_update;
        let live_identities: HashSet<String> = live
            .iter()
            .filter_map(|i| i.identity().map(str::to_string))
            .collect();
        let identities = InstanceIdentity::generate_pool(&mut rand::rng(), requested, &live_identities);

        let update_template = &self.deploy.spec.template;
        let current_template = if on_current > 0 {
            Some(self.revisions.current.template()?)
        } else {
            None
        };

        let mut pending: Vec<WorkloadInstance> = Vec::with_capacity(requested);
        for (idx, identity) in identities.iter().enumerate() {
            let instance = match &current_template {
                Some(template) if idx < on_current => {
                    new_instance(self.deploy, &self.revisions.current, template, identity)
                }
                _ => new_instance(self.deploy, &self.revisions.update, update_template, identity),
            };
            pending.push(instance);
        }

        info!(requested, on_current, on_update, "Scaling out");

        let created = AtomicUsize::new(0);
        let mut remaining = pending.into_iter();
        for size in SlowStart::new(requested, INITIAL_BATCH_SIZE) {
            let batch: Vec<WorkloadInstance> = remaining.by_ref().take(size).collect();
            let results = join_all(batch.iter().map(|inst| self.create_one(inst, &created))).await;

            if let Some(source) = results.into_iter().find_map(Result::err) {
                let created = created.load(Ordering::SeqCst);
                warn!(created, requested, error = %source, "Instance creation stopped after a failed batch");
                return Err(ControllerError::PartialCreate {
                    created,
                    requested,
                    source,
                });
            }
        }

        Ok(())
    }

    async fn create_one(&self, instance: &WorkloadInstance, created: &AtomicUsize) -> Result<(), ClusterError> {
        let key = self.deploy.key();
        self.expectations.expect_create(&key, instance.name());
        match self.client.create_instance(instance).await {
            Ok(_) => {
                created.fetch_add(1, Ordering::SeqCst);
                debug!(instance = %instance.name(), revision = ?instance.revision(), "Created instance");
                Ok(())
            }
            Err(e) => {
                self.expectations.retract_create(&key, instance.name());
                Err(e)
            }
        }
    }

    /// Deletes each instance the gate allows. Denied instances are skipped
    /// this pass. The first delete failure is returned after all attempts.
    async fn delete_all(
        &self,
        victims: Vec<&WorkloadInstance>,
        gate: &mut PreDeleteGate<'_>,
    ) -> ControllerResult<()> {
        let mut first_error = None;
        for victim in victims {
            match gate.check_delete(victim).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            if let Err(e) = self.delete_one(victim).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn delete_one(&self, instance: &WorkloadInstance) -> ControllerResult<()> {
        let key = self.deploy.key();
        self.expectations.expect_delete(&key, instance.name());
        match self.client.delete_instance(&instance.key()).await {
            Ok(()) => {
                info!(instance = %instance.name(), revision = ?instance.revision(), "Deleted instance");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.expectations.retract_delete(&key, instance.name());
                Ok(())
            }
            Err(e) => {
                self.expectations.retract_delete(&key, instance.name());
                Err(e.into())
            }
        }
    }
}
