//! Revision store.
//!
//! Resolves a deployment's template to its revision records:
//! - the newest revision with identical content is reused as-is
//! - an older revision with identical content is a rollback: its sequence
//!   number is bumped in place, keeping its name
//! - otherwise a new revision is minted; a name taken by different content
//!   bumps the collision count and re-derives the name
//!
//! History truncation prunes non-live revisions beyond the retention limit,
//! oldest sequence first.

use std::collections::HashSet;

use gamefleet_reconcile::revision_hash;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::error::{ControllerError, ControllerResult};
use crate::model::{labels, GameDeployment, ObjectMeta, Revision, Selector, WorkloadInstance};

/// Attempts at deriving a free revision name before giving up.
const MAX_COLLISION_RETRIES: i32 = 64;

/// Revisions in effect for one reconcile pass.
#[derive(Debug, Clone)]
pub struct ResolvedRevisions {
    /// Oldest revision still referenced by a live instance.
    pub current: Revision,
    /// Revision of the desired template.
    pub update: Revision,
    pub collision_count: i32,
    /// Every revision of the deployment, oldest sequence first.
    pub history: Vec<Revision>,
}

impl ResolvedRevisions {
    /// True when no rollout is in progress.
    pub fn consistent(&self) -> bool {
        self.current.name() == self.update.name()
    }
}

/// Name of the revision for `hash`.
pub fn revision_name(deployment: &str, hash: &str) -> String {
    format!("{deployment}-{hash}")
}

pub struct RevisionStore<'a> {
    client: &'a dyn ClusterClient,
}

impl<'a> RevisionStore<'a> {
    pub fn new(client: &'a dyn ClusterClient) -> Self {
        Self { client }
    }

    /// Revisions controlled by `deploy`, oldest sequence first.
    pub async fn list(&self, deploy: &GameDeployment) -> ControllerResult<Vec<Revision>> {
        let selector = Selector::for_labels([(labels::DEPLOYMENT, deploy.name())]);
        let mut revisions: Vec<Revision> = self
            .client
            .list_revisions(&deploy.meta.namespace, &selector)
            .await?
            .into_iter()
            .filter(|r| r.meta.is_controlled_by(&deploy.meta.uid))
            .collect();
        sort_history(&mut revisions);
        Ok(revisions)
    }

    #[instrument(skip_all, fields(deployment = %deploy.key()))]
    pub async fn resolve(
        &self,
        deploy: &GameDeployment,
        instances: &[WorkloadInstance],
    ) -> ControllerResult<ResolvedRevisions> {
        let mut history = self.list(deploy).await?;
        let data = Revision::data_for(&deploy.spec.template)?;
        let mut collision_count = deploy.status.as_ref().map_or(0, |s| s.collision_count);
        let next_sequence = history.last().map_or(1, |r| r.revision + 1);

        let update = match history.iter().rposition(|r| r.same_content(&data)) {
            Some(idx) if idx + 1 == history.len() => history[idx].clone(),
            Some(idx) => {
                let mut rev = history[idx].clone();
                info!(
                    revision = %rev.name(),
                    from = rev.revision,
                    to = next_sequence,
                    "Rolling back to earlier revision"
                );
                rev.revision = next_sequence;
                let bumped = self.client.update_revision(&rev).await?;
                history[idx] = bumped.clone();
                bumped
            }
            None => {
                let (created, count) = self
                    .create(deploy, &data, next_sequence, collision_count)
                    .await?;
                collision_count = count;
                if !history.iter().any(|r| r.name() == created.name()) {
                    history.push(created.clone());
                }
                created
            }
        };
        sort_history(&mut history);

        let current = history
            .iter()
            .find(|r| instances.iter().any(|i| i.revision() == Some(r.name())))
            .cloned()
            .unwrap_or_else(|| update.clone());

        debug!(
            current = %current.name(),
            update = %update.name(),
            collision_count,
            "Resolved revisions"
        );

        Ok(ResolvedRevisions {
            current,
            update,
            collision_count,
            history,
        })
    }

    async fn create(
        &self,
        deploy: &GameDeployment,
        data: &serde_json::Value,
        sequence: i64,
        mut collision_count: i32,
    ) -> ControllerResult<(Revision, i32)> {
        for _ in 0..MAX_COLLISION_RETRIES {
            let name = revision_name(deploy.name(), &revision_hash(data, collision_count));
            let mut meta = ObjectMeta::named(deploy.meta.namespace.clone(), name.clone());
            meta.labels
                .insert(labels::DEPLOYMENT.into(), deploy.name().to_string());
            meta.labels.insert(labels::REVISION_HASH.into(), name.clone());
            meta.owner_references.push(deploy.owner_reference());

            let revision = Revision {
                meta,
                data: data.clone(),
                revision: sequence,
            };

            match self.client.create_revision(&revision).await {
                Ok(created) => {
                    info!(revision = %name, sequence, "Created revision");
                    return Ok((created, collision_count));
                }
                Err(e) if e.is_already_exists() => {
                    let existing = self.client.get_revision(&revision.key()).await?;
                    if existing.same_content(data) && existing.meta.is_controlled_by(&deploy.meta.uid) {
                        return Ok((existing, collision_count));
                    }
                    warn!(revision = %name, collision_count, "Revision name collision");
                    collision_count += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControllerError::RevisionNameExhausted {
            deployment: deploy.key().to_string(),
            attempts: MAX_COLLISION_RETRIES,
        })
    }

    /// Deletes non-live revisions beyond `limit`. Failures are logged only.
    #[instrument(skip_all, fields(deployment = %deploy.key()))]
    pub async fn truncate_history(
        &self,
        deploy: &GameDeployment,
        resolved: &ResolvedRevisions,
        instances: &[WorkloadInstance],
        limit: usize,
    ) -> usize {
        let mut live: HashSet<&str> = instances.iter().filter_map(|i| i.revision()).collect();
        live.insert(resolved.current.name());
        live.insert(resolved.update.name());

        let mut pruned = 0;
        for revision in revisions_to_prune(&resolved.history, &live, limit) {
            match self.client.delete_revision(&revision.key()).await {
                Ok(()) => {
                    info!(revision = %revision.name(), sequence = revision.revision, "Pruned revision");
                    pruned += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(revision = %revision.name(), error = %e, "Failed to prune revision");
                }
            }
        }
        pruned
    }
}

fn sort_history(history: &mut [Revision]) {
    history.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Non-live revisions beyond `limit`, oldest first. `history` must be sorted.
pub fn revisions_to_prune<'r>(
    history: &'r [Revision],
    live: &HashSet<&str>,
    limit: usize,
) -> Vec<&'r Revision> {
    let non_live: Vec<&Revision> = history
        .iter()
        .filter(|r| !live.contains(r.name()))
        .collect();
    let excess = non_live.len().saturating_sub(limit);
    non_live.into_iter().take(excess).collect()
}
