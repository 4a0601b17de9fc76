//! In-memory observation source for tests and development.
//!
//! Behaves like the cluster API the controller is written against:
//! - every write bumps a global resource version and publishes a change event
//! - updates carrying a stale resource version fail with `Conflict`
//! - deployment spec changes bump the generation
//!
//! Fault injection (failed creates, forced status conflicts, call latency)
//! lets tests drive the partial-failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use gamefleet_events::{ChangeKind, EventEnvelope, ObjectKey, ResourceKind};
use gamefleet_id::{EventId, ObjectUid, ResourceVersion};
use gamefleet_reconcile::InstancePhase;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ClusterClient, ClusterError, ClusterEvent, ClusterObject, ClusterResult};
use crate::clock::{Clock, SystemClock};
use crate::model::{
    ContainerStatus, GameDeployment, HookPhase, HookRun, InstanceConditionType, ObjectMeta,
    Revision, Selector, WorkloadInstance,
};

// =============================================================================
// Storage
// =============================================================================

#[derive(Default)]
struct ClusterState {
    version: u64,
    deployments: BTreeMap<ObjectKey, GameDeployment>,
    instances: BTreeMap<ObjectKey, WorkloadInstance>,
    revisions: BTreeMap<ObjectKey, Revision>,
    hook_runs: BTreeMap<ObjectKey, HookRun>,
}

impl ClusterState {
    fn next_version(&mut self) -> ResourceVersion {
        self.version += 1;
        ResourceVersion::new(self.version)
    }
}

/// An object kind kept by the in-memory cluster.
trait Stored: Clone + Send + 'static {
    const RESOURCE: ResourceKind;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_object(self) -> ClusterObject;
    fn store(state: &mut ClusterState) -> &mut BTreeMap<ObjectKey, Self>;
}

macro_rules! stored {
    ($ty:ty, $resource:ident, $field:ident, $variant:ident) => {
        impl Stored for $ty {
            const RESOURCE: ResourceKind = ResourceKind::$resource;

            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }

            fn into_object(self) -> ClusterObject {
                ClusterObject::$variant(self)
            }

            fn store(state: &mut ClusterState) -> &mut BTreeMap<ObjectKey, Self> {
                &mut state.$field
            }
        }
    };
}

stored!(GameDeployment, GameDeployment, deployments, Deployment);
stored!(WorkloadInstance, Instance, instances, Instance);
stored!(Revision, Revision, revisions, Revision);
stored!(HookRun, HookRun, hook_runs, HookRun);

#[derive(Default)]
struct Faults {
    /// Instance creations allowed before every further one fails.
    instance_create_budget: Option<usize>,
    /// Status updates that fail with `Conflict` before one succeeds.
    status_conflicts: usize,
    latency: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// InMemoryCluster
// =============================================================================

/// Cluster API backed by in-process maps.
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, usize>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClusterEvent>>>,
    next_event_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a cluster stamping timestamps from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_event_id: AtomicU64::new(0),
            clock,
        }
    }

    /// Opens a change stream. Only changes after this call are delivered.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Lets `count` more instance creations succeed, then fails the rest.
    pub fn fail_instance_creates_after(&self, count: usize) {
        lock(&self.faults).instance_create_budget = Some(count);
    }

    pub fn allow_instance_creates(&self) {
        lock(&self.faults).instance_create_budget = None;
    }

    /// Fails the next `count` status updates with `Conflict`.
    pub fn inject_status_conflicts(&self, count: usize) {
        lock(&self.faults).status_conflicts = count;
    }

    /// Delays every client call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        lock(&self.faults).latency = latency;
    }

    /// Number of client calls made for `operation` (e.g. `"create_instance"`).
    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls).get(operation).copied().unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Test-side mutations (what users and other system actors do)
    // -------------------------------------------------------------------------

    /// Creates the deployment, or replaces its spec keeping status.
    pub fn apply_deployment(&self, deployment: &GameDeployment) -> ClusterResult<GameDeployment> {
        let exists = lock(&self.state)
            .deployments
            .contains_key(&deployment.meta.key());
        if !exists {
            return self.insert(deployment);
        }
        let mut replacement = deployment.clone();
        replacement.meta.resource_version = ResourceVersion::UNSET;
        self.replace(&replacement, |existing, mut new| {
            new.status = existing.status.clone();
            new.meta.generation = bumped_generation(existing, &new);
            new
        })
    }

    /// Reports an instance as running with the given readiness, and its
    /// containers as running the images in its spec.
    pub fn set_instance_ready(&self, key: &ObjectKey, ready: bool) -> ClusterResult<WorkloadInstance> {
        let now = self.clock.now();
        self.modify::<WorkloadInstance>(key, |inst| {
            inst.status.phase = InstancePhase::Running;
            inst.status
                .node_name
                .get_or_insert_with(|| "node-0".to_string());
            inst.status.container_statuses = inst
                .spec
                .containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone(),
                    ready,
                })
                .collect();
            inst.set_condition(InstanceConditionType::Ready, ready, now);
        })
    }

    /// Marks every instance in `namespace` ready.
    pub fn mark_all_ready(&self, namespace: &str) -> ClusterResult<()> {
        for inst in self.instances(namespace) {
            self.set_instance_ready(&inst.key(), true)?;
        }
        Ok(())
    }

    /// Moves a hook run to `phase`, as the hook backend would.
    pub fn set_hook_phase(&self, key: &ObjectKey, phase: HookPhase) -> ClusterResult<HookRun> {
        self.modify::<HookRun>(key, |run| run.status.phase = phase)
    }

    /// Clears canary pause conditions, resuming a paused step.
    pub fn clear_pause_conditions(&self, key: &ObjectKey) -> ClusterResult<GameDeployment> {
        self.modify::<GameDeployment>(key, |d| {
            if let Some(canary) = d.status.as_mut().and_then(|s| s.canary.as_mut()) {
                canary.pause_conditions.clear();
            }
        })
    }

    pub fn deployment(&self, key: &ObjectKey) -> Option<GameDeployment> {
        lock(&self.state).deployments.get(key).cloned()
    }

    pub fn instances(&self, namespace: &str) -> Vec<WorkloadInstance> {
        self.list::<WorkloadInstance>(namespace, None)
    }

    pub fn revisions(&self, namespace: &str) -> Vec<Revision> {
        self.list::<Revision>(namespace, None)
    }

    pub fn hook_runs(&self, namespace: &str) -> Vec<HookRun> {
        self.list::<HookRun>(namespace, None)
    }

    // -------------------------------------------------------------------------
    // Generic store operations
    // -------------------------------------------------------------------------

    fn insert<T: Stored>(&self, obj: &T) -> ClusterResult<T> {
        let key = obj.meta().key();
        if key.namespace.is_empty() || key.name.is_empty() {
            return Err(ClusterError::Invalid(format!(
                "{} must have a namespace and a name",
                T::RESOURCE
            )));
        }

        let now = self.clock.now();
        let mut state = lock(&self.state);
        if T::store(&mut state).contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("{} {key}", T::RESOURCE)));
        }

        let version = state.next_version();
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = ObjectUid::new();
        meta.resource_version = version;
        meta.generation = 1;
        meta.creation_timestamp = Some(now);
        meta.deletion_timestamp = None;

        T::store(&mut state).insert(key, created.clone());
        self.publish(ChangeKind::Added, &created);
        Ok(created)
    }

    fn replace<T, F>(&self, obj: &T, merge: F) -> ClusterResult<T>
    where
        T: Stored,
        F: FnOnce(&T, T) -> T,
    {
        let key = obj.meta().key();
        let mut state = lock(&self.state);
        let existing = T::store(&mut state)
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} {key}", T::RESOURCE)))?;

        let expected = obj.meta().resource_version;
        let current = existing.meta().resource_version;
        if expected != ResourceVersion::UNSET && expected != current {
            return Err(ClusterError::Conflict(format!(
                "{} {key}: resource version {expected} is stale, current is {current}",
                T::RESOURCE
            )));
        }

        let version = state.next_version();
        let mut updated = merge(&existing, obj.clone());
        let meta = updated.meta_mut();
        meta.uid = existing.meta().uid;
        meta.creation_timestamp = existing.meta().creation_timestamp;
        meta.resource_version = version;

        T::store(&mut state).insert(key, updated.clone());
        self.publish(ChangeKind::Modified, &updated);
        Ok(updated)
    }

    fn modify<T: Stored>(&self, key: &ObjectKey, f: impl FnOnce(&mut T)) -> ClusterResult<T> {
        let mut state = lock(&self.state);
        let mut obj = T::store(&mut state)
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} {key}", T::RESOURCE)))?;
        f(&mut obj);
        obj.meta_mut().resource_version = state.next_version();
        T::store(&mut state).insert(key.clone(), obj.clone());
        self.publish(ChangeKind::Modified, &obj);
        Ok(obj)
    }

    fn remove<T: Stored>(&self, key: &ObjectKey) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let removed = T::store(&mut state)
            .remove(key)
            .ok_or_else(|| ClusterError::NotFound(format!("{} {key}", T::RESOURCE)))?;
        state.next_version();
        self.publish(ChangeKind::Deleted, &removed);
        Ok(())
    }

    fn get<T: Stored>(&self, key: &ObjectKey) -> ClusterResult<T> {
        T::store(&mut lock(&self.state))
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} {key}", T::RESOURCE)))
    }

    fn list<T: Stored>(&self, namespace: &str, selector: Option<&Selector>) -> Vec<T> {
        T::store(&mut lock(&self.state))
            .values()
            .filter(|o| o.meta().namespace == namespace)
            .filter(|o| selector.is_none_or(|s| s.matches(&o.meta().labels)))
            .cloned()
            .collect()
    }

    // Called with the state lock held so events leave in write order.
    fn publish<T: Stored>(&self, change: ChangeKind, obj: &T) {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event = EventEnvelope::builder()
            .event_id(EventId::new(event_id))
            .occurred_at(self.clock.now())
            .change(change)
            .object(T::RESOURCE, obj.meta().key())
            .resource_version(obj.meta().resource_version)
            .payload(obj.clone().into_object())
            .build();

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed change event");
                return;
            }
        };

        debug!(
            event_id,
            change = %event.change,
            resource = %event.resource,
            key = %event.key,
            "Publishing change event"
        );
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn enter(&self, operation: &'static str) {
        *lock(&self.calls).entry(operation).or_insert(0) += 1;
        let latency = lock(&self.faults).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn bumped_generation(existing: &GameDeployment, new: &GameDeployment) -> i64 {
    if existing.spec != new.spec {
        existing.meta.generation + 1
    } else {
        existing.meta.generation
    }
}

// =============================================================================
// ClusterClient
// =============================================================================

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn list_deployments(&self) -> ClusterResult<Vec<GameDeployment>> {
        self.enter("list_deployments").await;
        Ok(lock(&self.state).deployments.values().cloned().collect())
    }

    async fn get_deployment(&self, key: &ObjectKey) -> ClusterResult<GameDeployment> {
        self.enter("get_deployment").await;
        self.get(key)
    }

    async fn patch_deployment(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> ClusterResult<GameDeployment> {
        self.enter("patch_deployment").await;
        let existing: GameDeployment = self.get(key)?;

        let mut doc =
            serde_json::to_value(&existing).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let patched: GameDeployment =
            serde_json::from_value(doc).map_err(|e| ClusterError::Invalid(e.to_string()))?;

        if patched.meta.key() != *key {
            return Err(ClusterError::Invalid(format!(
                "patch may not rename {key}"
            )));
        }

        self.replace(&patched, |existing, mut new| {
            new.status = existing.status.clone();
            new.meta.generation = bumped_generation(existing, &new);
            new
        })
    }

    async fn update_deployment_status(
        &self,
        deployment: &GameDeployment,
    ) -> ClusterResult<GameDeployment> {
        self.enter("update_deployment_status").await;
        {
            let mut faults = lock(&self.faults);
            if faults.status_conflicts > 0 {
                faults.status_conflicts -= 1;
                return Err(ClusterError::Conflict(format!(
                    "injected status conflict on {}",
                    deployment.meta.key()
                )));
            }
        }

        self.replace(deployment, |existing, new| GameDeployment {
            meta: existing.meta.clone(),
            spec: existing.spec.clone(),
            status: new.status,
        })
    }

    async fn list_instances(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> ClusterResult<Vec<WorkloadInstance>> {
        self.enter("list_instances").await;
        Ok(self.list(namespace, Some(selector)))
    }

    async fn create_instance(&self, instance: &WorkloadInstance) -> ClusterResult<WorkloadInstance> {
        self.enter("create_instance").await;
        {
            let mut faults = lock(&self.faults);
            if let Some(budget) = faults.instance_create_budget.as_mut() {
                if *budget == 0 {
                    return Err(ClusterError::Unavailable(format!(
                        "injected create failure for {}",
                        instance.meta.key()
                    )));
                }
                *budget -= 1;
            }
        }
        self.insert(instance)
    }

    async fn update_instance(&self, instance: &WorkloadInstance) -> ClusterResult<WorkloadInstance> {
        self.enter("update_instance").await;
        self.replace(instance, |existing, mut new| {
            new.meta.generation = existing.meta.generation;
            new
        })
    }

    async fn delete_instance(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.enter("delete_instance").await;
        self.remove::<WorkloadInstance>(key)
    }

    async fn list_revisions(&self, namespace: &str, selector: &Selector) -> ClusterResult<Vec<Revision>> {
        self.enter("list_revisions").await;
        Ok(self.list(namespace, Some(selector)))
    }

    async fn get_revision(&self, key: &ObjectKey) -> ClusterResult<Revision> {
        self.enter("get_revision").await;
        self.get(key)
    }

    async fn create_revision(&self, revision: &Revision) -> ClusterResult<Revision> {
        self.enter("create_revision").await;
        self.insert(revision)
    }

    async fn update_revision(&self, revision: &Revision) -> ClusterResult<Revision> {
        self.enter("update_revision").await;
        self.replace(revision, |_, new| new)
    }

    async fn delete_revision(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.enter("delete_revision").await;
        self.remove::<Revision>(key)
    }

    async fn list_hook_runs(&self, namespace: &str, selector: &Selector) -> ClusterResult<Vec<HookRun>> {
        self.enter("list_hook_runs").await;
        Ok(self.list(namespace, Some(selector)))
    }

    async fn get_hook_run(&self, key: &ObjectKey) -> ClusterResult<HookRun> {
        self.enter("get_hook_run").await;
        self.get(key)
    }

    async fn create_hook_run(&self, run: &HookRun) -> ClusterResult<HookRun> {
        self.enter("create_hook_run").await;
        self.insert(run)
    }

    async fn update_hook_run(&self, run: &HookRun) -> ClusterResult<HookRun> {
        self.enter("update_hook_run").await;
        self.replace(run, |existing, mut new| {
            // the backend owns the phase
            new.status = existing.status.clone();
            new
        })
    }

    async fn delete_hook_run(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.enter("delete_hook_run").await;
        self.remove::<HookRun>(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceSpec, LabelSelector};

    fn instance(name: &str, app: &str) -> WorkloadInstance {
        let mut meta = ObjectMeta::named("games", name);
        meta.labels.insert("app".into(), app.into());
        WorkloadInstance {
            meta,
            spec: InstanceSpec::default(),
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_create_publishes_and_lists_by_selector() {
        let cluster = InMemoryCluster::new();
        let mut events = cluster.subscribe();

        cluster.create_instance(&instance("a", "lobby")).await.unwrap();
        cluster.create_instance(&instance("b", "arena")).await.unwrap();

        let selector = Selector::parse(&LabelSelector::from_labels([("app", "lobby")])).unwrap();
        let listed = cluster.list_instances("games", &selector).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].meta.name, "a");

        let first = events.recv().await.unwrap();
        assert_eq!(first.change, ChangeKind::Added);
        assert_eq!(first.resource, ResourceKind::Instance);
        assert_eq!(first.key, ObjectKey::new("games", "a"));
    }

    #[tokio::test]
    async fn test_duplicate_create_and_stale_update() {
        let cluster = InMemoryCluster::new();
        let created = cluster.create_instance(&instance("a", "lobby")).await.unwrap();
        let err = cluster.create_instance(&instance("a", "lobby")).await.unwrap_err();
        assert!(err.is_already_exists());

        let mut first = created.clone();
        first.meta.labels.insert("tier".into(), "gold".into());
        cluster.update_instance(&first).await.unwrap();

        // second writer still holds the original version
        let mut second = created;
        second.meta.labels.insert("tier".into(), "silver".into());
        let err = cluster.update_instance(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_budget_fault() {
        let cluster = InMemoryCluster::new();
        cluster.fail_instance_creates_after(1);
        assert!(cluster.create_instance(&instance("a", "x")).await.is_ok());
        let err = cluster.create_instance(&instance("b", "x")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable(_)));
        assert_eq!(cluster.call_count("create_instance"), 2);
    }

    #[tokio::test]
    async fn test_delete_reports_last_state() {
        let cluster = InMemoryCluster::new();
        cluster.create_instance(&instance("a", "x")).await.unwrap();
        let mut events = cluster.subscribe();

        cluster
            .delete_instance(&ObjectKey::new("games", "a"))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(event.is_deletion());
        assert!(matches!(event.payload, ClusterObject::Instance(ref i) if i.meta.name == "a"));

        let err = cluster
            .delete_instance(&ObjectKey::new("games", "a"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
