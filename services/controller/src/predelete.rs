//! Pre-delete gate.
//!
//! When a deployment defines a pre-delete hook, no instance is deleted until
//! a hook run for its (revision, identity) pair has succeeded. The gate owns
//! the per-instance tracking records for the pass and hands them back for
//! the status write.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::cluster::ClusterClient;
use crate::error::ControllerResult;
use crate::model::{
    labels, GameDeployment, HookArg, HookPhase, HookRun, HookRunSpec, HookStep, ObjectMeta,
    PreDeleteHookCondition, Selector, WorkloadInstance,
};

/// Hook argument carrying the instance name.
pub const ARG_INSTANCE_NAME: &str = "instance-name";
/// Hook argument carrying the instance identity token.
pub const ARG_INSTANCE_IDENTITY: &str = "instance-identity";

/// Name of the pre-delete hook run for an instance on a revision.
pub fn pre_delete_run_name(revision: &str, identity: &str) -> String {
    format!("{revision}-predelete-{identity}")
}

pub struct PreDeleteGate<'a> {
    client: &'a dyn ClusterClient,
    clock: &'a dyn Clock,
    deploy: &'a GameDeployment,
    conditions: Vec<PreDeleteHookCondition>,
}

impl<'a> PreDeleteGate<'a> {
    pub fn new(client: &'a dyn ClusterClient, clock: &'a dyn Clock, deploy: &'a GameDeployment) -> Self {
        let conditions = deploy
            .status
            .as_ref()
            .map(|s| s.pre_delete_hooks.clone())
            .unwrap_or_default();
        Self {
            client,
            clock,
            deploy,
            conditions,
        }
    }

    pub fn conditions(&self) -> &[PreDeleteHookCondition] {
        &self.conditions
    }

    pub fn into_conditions(self) -> Vec<PreDeleteHookCondition> {
        self.conditions
    }

    /// Phase recorded for `instance`, if its deletion is being gated.
    pub fn tracked_phase(&self, instance: &str) -> Option<HookPhase> {
        self.conditions
            .iter()
            .find(|c| c.instance_name == instance)
            .map(|c| c.phase)
    }

    /// Returns true when `instance` may be deleted now.
    #[instrument(skip_all, fields(deployment = %self.deploy.key(), instance = %instance.name()))]
    pub async fn check_delete(&mut self, instance: &WorkloadInstance) -> ControllerResult<bool> {
        let Some(hook) = &self.deploy.spec.pre_delete_hook else {
            return Ok(true);
        };

        let identity = instance.identity().unwrap_or(instance.name()).to_string();
        let revision = instance.revision().unwrap_or_default().to_string();

        let selector = Selector::for_labels([
            (labels::DEPLOYMENT, self.deploy.name()),
            (labels::HOOK_TYPE, labels::HOOK_TYPE_PRE_DELETE),
            (labels::REVISION_HASH, revision.as_str()),
            (labels::INSTANCE_ID, identity.as_str()),
        ]);
        let runs: Vec<HookRun> = self
            .client
            .list_hook_runs(&self.deploy.meta.namespace, &selector)
            .await?
            .into_iter()
            .filter(|r| r.meta.is_controlled_by(&self.deploy.meta.uid))
            .collect();

        let run = match runs.iter().find(|r| r.phase().is_successful()).or(runs.first()) {
            Some(run) => run.clone(),
            None => self.create_run(hook, instance, &revision, &identity).await?,
        };

        if run.phase().is_successful() {
            info!(hook_run = %run.meta.name, "Pre-delete hook succeeded, deletion allowed");
            self.conditions.retain(|c| c.instance_name != instance.name());
            return Ok(true);
        }

        debug!(hook_run = %run.meta.name, phase = %run.phase(), "Deletion blocked by pre-delete hook");
        self.track(instance.name(), &identity, &run);
        Ok(false)
    }

    async fn create_run(
        &self,
        hook: &HookStep,
        instance: &WorkloadInstance,
        revision: &str,
        identity: &str,
    ) -> ControllerResult<HookRun> {
        let name = pre_delete_run_name(revision, identity);
        let mut meta = ObjectMeta::named(self.deploy.meta.namespace.clone(), name.clone());
        meta.labels
            .insert(labels::DEPLOYMENT.into(), self.deploy.name().to_string());
        meta.labels
            .insert(labels::HOOK_TYPE.into(), labels::HOOK_TYPE_PRE_DELETE.into());
        meta.labels
            .insert(labels::REVISION_HASH.into(), revision.to_string());
        meta.labels
            .insert(labels::INSTANCE_ID.into(), identity.to_string());
        meta.owner_references.push(self.deploy.owner_reference());

        let mut args = hook.args.clone();
        args.push(HookArg {
            name: ARG_INSTANCE_NAME.into(),
            value: instance.name().to_string(),
        });
        args.push(HookArg {
            name: ARG_INSTANCE_IDENTITY.into(),
            value: identity.to_string(),
        });

        let run = HookRun {
            meta,
            spec: HookRunSpec {
                template_name: hook.template_name.clone(),
                args,
                terminate: false,
            },
            status: Default::default(),
        };

        match self.client.create_hook_run(&run).await {
            Ok(created) => {
                info!(hook_run = %name, template = %hook.template_name, "Created pre-delete hook run");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => Ok(self.client.get_hook_run(&run.key()).await?),
            Err(e) => Err(e.into()),
        }
    }

    fn track(&mut self, instance_name: &str, identity: &str, run: &HookRun) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.instance_name == instance_name)
        {
            if existing.hook_run != run.meta.name {
                existing.hook_run = run.meta.name.clone();
                existing.start_time = run.meta.creation_timestamp.unwrap_or_else(|| self.clock.now());
            }
            existing.phase = run.phase();
            return;
        }
        self.conditions.push(PreDeleteHookCondition {
            instance_name: instance_name.to_string(),
            identity: identity.to_string(),
            hook_run: run.meta.name.clone(),
            phase: run.phase(),
            start_time: run.meta.creation_timestamp.unwrap_or_else(|| self.clock.now()),
        });
    }

    /// Drops records of vanished instances and deletes their finished hook
    /// runs. Failures are logged only.
    pub async fn garbage_collect(&mut self, live: &[WorkloadInstance]) {
        let live_names: HashSet<&str> = live.iter().map(|i| i.name()).collect();
        let live_identities: HashSet<&str> = live.iter().filter_map(|i| i.identity()).collect();

        self.conditions
            .retain(|c| live_names.contains(c.instance_name.as_str()));

        let selector = Selector::for_labels([
            (labels::DEPLOYMENT, self.deploy.name()),
            (labels::HOOK_TYPE, labels::HOOK_TYPE_PRE_DELETE),
        ]);
        let runs = match self
            .client
            .list_hook_runs(&self.deploy.meta.namespace, &selector)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(deployment = %self.deploy.key(), error = %e, "Failed to list pre-delete hook runs");
                return;
            }
        };

        for run in runs {
            let orphaned = run
                .meta
                .label(labels::INSTANCE_ID)
                .is_none_or(|id| !live_identities.contains(id));
            if !orphaned || !run.phase().is_terminal() || !run.meta.is_controlled_by(&self.deploy.meta.uid) {
                continue;
            }
            match self.client.delete_hook_run(&run.key()).await {
                Ok(()) => debug!(hook_run = %run.meta.name, "Deleted finished pre-delete hook run"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(hook_run = %run.meta.name, error = %e, "Failed to delete pre-delete hook run"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::cluster::InMemoryCluster;
    use crate::fixtures::{self, NAMESPACE};
    use gamefleet_events::ObjectKey;

    fn hooked_deployment(cluster: &InMemoryCluster) -> GameDeployment {
        let mut deploy = fixtures::deployment("arena", 2, "arena:1");
        deploy.spec.pre_delete_hook = Some(HookStep {
            template_name: "drain-players".into(),
            args: vec![HookArg {
                name: "grace".into(),
                value: "30s".into(),
            }],
        });
        cluster.apply_deployment(&deploy).unwrap()
    }

    #[tokio::test]
    async fn test_no_hook_always_allows() {
        let cluster = InMemoryCluster::new();
        let deploy = cluster
            .apply_deployment(&fixtures::deployment("arena", 2, "arena:1"))
            .unwrap();
        let clock = SystemClock;
        let mut gate = PreDeleteGate::new(&cluster, &clock, &deploy);

        let inst = fixtures::instance(&deploy, "arena-rev1", "bcdfg");
        assert!(gate.check_delete(&inst).await.unwrap());
        assert_eq!(cluster.call_count("list_hook_runs"), 0);
    }

    #[tokio::test]
    async fn test_first_check_creates_run_and_blocks() {
        let cluster = InMemoryCluster::new();
        let deploy = hooked_deployment(&cluster);
        let clock = SystemClock;
        let inst = fixtures::instance(&deploy, "arena-rev1", "bcdfg");

        let mut gate = PreDeleteGate::new(&cluster, &clock, &deploy);
        assert!(!gate.check_delete(&inst).await.unwrap());
        assert!(!gate.check_delete(&inst).await.unwrap());

        let runs = cluster.hook_runs(NAMESPACE);
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.meta.name, pre_delete_run_name("arena-rev1", "bcdfg"));
        assert_eq!(run.spec.template_name, "drain-players");
        let arg_names: Vec<&str> = run.spec.args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(arg_names, vec!["grace", ARG_INSTANCE_NAME, ARG_INSTANCE_IDENTITY]);

        assert_eq!(gate.conditions().len(), 1);
        assert_eq!(gate.tracked_phase(inst.name()), Some(HookPhase::Pending));
    }

    #[tokio::test]
    async fn test_success_allows_and_clears_record() {
        let cluster = InMemoryCluster::new();
        let deploy = hooked_deployment(&cluster);
        let clock = SystemClock;
        let inst = fixtures::instance(&deploy, "arena-rev1", "bcdfg");

        let mut gate = PreDeleteGate::new(&cluster, &clock, &deploy);
        assert!(!gate.check_delete(&inst).await.unwrap());

        let run_key = ObjectKey::new(NAMESPACE, pre_delete_run_name("arena-rev1", "bcdfg"));
        cluster.set_hook_phase(&run_key, HookPhase::Running).unwrap();
        assert!(!gate.check_delete(&inst).await.unwrap());
        assert_eq!(gate.tracked_phase(inst.name()), Some(HookPhase::Running));

        cluster.set_hook_phase(&run_key, HookPhase::Successful).unwrap();
        assert!(gate.check_delete(&inst).await.unwrap());
        assert!(gate.into_conditions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_hook_keeps_blocking() {
        let cluster = InMemoryCluster::new();
        let deploy = hooked_deployment(&cluster);
        let clock = SystemClock;
        let inst = fixtures::instance(&deploy, "arena-rev1", "bcdfg");

        let mut gate = PreDeleteGate::new(&cluster, &clock, &deploy);
        gate.check_delete(&inst).await.unwrap();
        let run_key = ObjectKey::new(NAMESPACE, pre_delete_run_name("arena-rev1", "bcdfg"));
        cluster.set_hook_phase(&run_key, HookPhase::Failed).unwrap();

        assert!(!gate.check_delete(&inst).await.unwrap());
        assert_eq!(cluster.hook_runs(NAMESPACE).len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_collect_removes_orphans() {
        let cluster = InMemoryCluster::new();
        let deploy = hooked_deployment(&cluster);
        let clock = SystemClock;
        let gone = fixtures::instance(&deploy, "arena-rev1", "bcdfg");
        let alive = fixtures::instance(&deploy, "arena-rev1", "hjklm");

        let mut gate = PreDeleteGate::new(&cluster, &clock, &deploy);
        gate.check_delete(&gone).await.unwrap();
        gate.check_delete(&alive).await.unwrap();
        for id in ["bcdfg", "hjklm"] {
            let key = ObjectKey::new(NAMESPACE, pre_delete_run_name("arena-rev1", id));
            cluster.set_hook_phase(&key, HookPhase::Successful).unwrap();
        }

        gate.garbage_collect(std::slice::from_ref(&alive)).await;

        let runs: Vec<String> = cluster
            .hook_runs(NAMESPACE)
            .into_iter()
            .map(|r| r.meta.name)
            .collect();
        assert_eq!(runs, vec![pre_delete_run_name("arena-rev1", "hjklm")]);
        assert_eq!(gate.conditions().len(), 1);
        assert_eq!(gate.conditions()[0].instance_name, alive.name());
    }
}
