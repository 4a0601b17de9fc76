//! Expectation tracking.
//!
//! Every create, delete, or in-place update the controller issues is recorded
//! here before the call is made and cleared when the change stream shows its
//! effect. While a deployment has outstanding expectations its reconcile pass
//! is a no-op: the listed instances are known to be stale.
//!
//! The store is shared between the event dispatcher (which observes) and the
//! reconcile workers (which expect and check), so all state sits behind one
//! mutex that is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gamefleet_events::{ChangeKind, ObjectKey};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::cluster::{ClusterEvent, ClusterObject};

#[derive(Debug, Default)]
struct KeyExpectations {
    creations: HashMap<String, DateTime<Utc>>,
    deletions: HashMap<String, DateTime<Utc>>,
    updates: HashMap<String, PendingUpdate>,
}

#[derive(Debug)]
struct PendingUpdate {
    revision: String,
    since: DateTime<Utc>,
}

impl KeyExpectations {
    fn len(&self) -> usize {
        self.creations.len() + self.deletions.len() + self.updates.len()
    }
}

/// Outstanding actions per deployment key.
pub struct ExpectationStore {
    entries: Mutex<HashMap<ObjectKey, KeyExpectations>>,
    timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl ExpectationStore {
    /// Creates a store; expectations older than `timeout` are dropped.
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, KeyExpectations>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn expect_create(&self, key: &ObjectKey, instance: &str) {
        let now = self.clock.now();
        self.lock()
            .entry(key.clone())
            .or_default()
            .creations
            .insert(instance.to_string(), now);
    }

    pub fn expect_delete(&self, key: &ObjectKey, instance: &str) {
        let now = self.clock.now();
        self.lock()
            .entry(key.clone())
            .or_default()
            .deletions
            .insert(instance.to_string(), now);
    }

    /// Expects `instance` to be observed on `revision`.
    pub fn expect_update(&self, key: &ObjectKey, instance: &str, revision: &str) {
        let now = self.clock.now();
        self.lock().entry(key.clone()).or_default().updates.insert(
            instance.to_string(),
            PendingUpdate {
                revision: revision.to_string(),
                since: now,
            },
        );
    }

    /// Drops a creation the cluster never accepted.
    pub fn retract_create(&self, key: &ObjectKey, instance: &str) {
        if let Some(exp) = self.lock().get_mut(key) {
            exp.creations.remove(instance);
        }
    }

    pub fn retract_delete(&self, key: &ObjectKey, instance: &str) {
        if let Some(exp) = self.lock().get_mut(key) {
            exp.deletions.remove(instance);
        }
    }

    pub fn retract_update(&self, key: &ObjectKey, instance: &str) {
        if let Some(exp) = self.lock().get_mut(key) {
            exp.updates.remove(instance);
        }
    }

    /// Clears expectations confirmed by a change event.
    pub fn observe(&self, event: &ClusterEvent) {
        let ClusterObject::Instance(instance) = &event.payload else {
            return;
        };
        let Some(key) = instance.meta.deployment_key() else {
            return;
        };

        let mut entries = self.lock();
        let Some(exp) = entries.get_mut(&key) else {
            return;
        };
        let name = instance.name();

        match event.change {
            ChangeKind::Deleted => {
                exp.creations.remove(name);
                exp.deletions.remove(name);
                exp.updates.remove(name);
            }
            ChangeKind::Added | ChangeKind::Modified => {
                exp.creations.remove(name);
                if instance.meta.is_terminating() {
                    exp.deletions.remove(name);
                }
                let confirmed = exp
                    .updates
                    .get(name)
                    .is_some_and(|u| instance.revision() == Some(u.revision.as_str()));
                if confirmed {
                    exp.updates.remove(name);
                }
            }
        }

        if exp.len() == 0 {
            entries.remove(&key);
        }
    }

    /// Reports whether every expectation for `key` has been observed, and how
    /// many are still outstanding.
    ///
    /// Update expectations for a revision other than `revision` belong to a
    /// superseded rollout and are discarded. Expectations older than the
    /// timeout are dropped with a warning so a lost event cannot block the
    /// deployment forever.
    pub fn satisfied(&self, key: &ObjectKey, revision: &str) -> (bool, usize) {
        let now = self.clock.now();
        let cutoff = now.checked_sub_signed(self.timeout);

        let mut entries = self.lock();
        let Some(exp) = entries.get_mut(key) else {
            return (true, 0);
        };

        exp.updates.retain(|name, u| {
            let keep = u.revision == revision;
            if !keep {
                debug!(deployment = %key, instance = %name, revision = %u.revision, "Dropping superseded update expectation");
            }
            keep
        });

        if let Some(cutoff) = cutoff {
            let expired = |kind: &'static str, name: &str, since: DateTime<Utc>| {
                let expired = since <= cutoff;
                if expired {
                    warn!(deployment = %key, instance = %name, kind, "Expectation timed out, dropping");
                }
                !expired
            };
            exp.creations.retain(|name, since| expired("create", name.as_str(), *since));
            exp.deletions.retain(|name, since| expired("delete", name.as_str(), *since));
            exp.updates.retain(|name, u| expired("update", name.as_str(), u.since));
        }

        let dirty = exp.len();
        if dirty == 0 {
            entries.remove(key);
        }
        (dirty == 0, dirty)
    }

    /// Forgets everything about a deleted deployment.
    pub fn delete_key(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }

    /// Outstanding expectations for `key`.
    pub fn pending(&self, key: &ObjectKey) -> usize {
        self.lock().get(key).map_or(0, KeyExpectations::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{labels, InstanceSpec, ObjectMeta, WorkloadInstance};
    use gamefleet_events::{EventEnvelope, ResourceKind};
    use gamefleet_id::{EventId, ResourceVersion};

    fn instance(name: &str, revision: &str) -> WorkloadInstance {
        let mut meta = ObjectMeta::named("games", name);
        meta.labels.insert(labels::DEPLOYMENT.into(), "lobby".into());
        meta.labels.insert(labels::REVISION_HASH.into(), revision.into());
        WorkloadInstance {
            meta,
            spec: InstanceSpec::default(),
            status: Default::default(),
        }
    }

    fn event(change: ChangeKind, inst: WorkloadInstance) -> ClusterEvent {
        EventEnvelope::builder()
            .event_id(EventId::new(1))
            .change(change)
            .object(ResourceKind::Instance, inst.key())
            .resource_version(ResourceVersion::new(1))
            .payload(ClusterObject::Instance(inst))
            .build()
            .unwrap()
    }

    fn store() -> (Arc<ManualClock>, ExpectationStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = ExpectationStore::new(clock.clone(), Duration::from_secs(300));
        (clock, store)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("games", "lobby")
    }

    #[test]
    fn test_create_cleared_by_observation() {
        let (_, store) = store();
        store.expect_create(&key(), "lobby-a");
        store.expect_create(&key(), "lobby-b");
        assert_eq!(store.satisfied(&key(), "rev-1"), (false, 2));

        store.observe(&event(ChangeKind::Added, instance("lobby-a", "rev-1")));
        assert_eq!(store.satisfied(&key(), "rev-1"), (false, 1));

        store.retract_create(&key(), "lobby-b");
        assert_eq!(store.satisfied(&key(), "rev-1"), (true, 0));
    }

    #[test]
    fn test_delete_cleared_by_deleted_event() {
        let (_, store) = store();
        store.expect_delete(&key(), "lobby-a");
        store.observe(&event(ChangeKind::Modified, instance("lobby-a", "rev-1")));
        assert_eq!(store.pending(&key()), 1);
        store.observe(&event(ChangeKind::Deleted, instance("lobby-a", "rev-1")));
        assert!(store.satisfied(&key(), "rev-1").0);
    }

    #[test]
    fn test_update_needs_target_revision() {
        let (_, store) = store();
        store.expect_update(&key(), "lobby-a", "rev-2");
        store.observe(&event(ChangeKind::Modified, instance("lobby-a", "rev-1")));
        assert_eq!(store.satisfied(&key(), "rev-2"), (false, 1));
        store.observe(&event(ChangeKind::Modified, instance("lobby-a", "rev-2")));
        assert_eq!(store.satisfied(&key(), "rev-2"), (true, 0));
    }

    #[test]
    fn test_superseded_update_dropped() {
        let (_, store) = store();
        store.expect_update(&key(), "lobby-a", "rev-2");
        assert_eq!(store.satisfied(&key(), "rev-3"), (true, 0));
    }

    #[test]
    fn test_expired_expectations_dropped() {
        let (clock, store) = store();
        store.expect_create(&key(), "lobby-a");
        clock.advance(chrono::Duration::seconds(299));
        assert!(!store.satisfied(&key(), "rev-1").0);
        clock.advance(chrono::Duration::seconds(1));
        assert!(store.satisfied(&key(), "rev-1").0);
    }

    #[test]
    fn test_observation_of_unrelated_key_ignored() {
        let (_, store) = store();
        store.expect_create(&key(), "lobby-a");
        let mut other = instance("lobby-a", "rev-1");
        other
            .meta
            .labels
            .insert(labels::DEPLOYMENT.into(), "arena".into());
        store.observe(&event(ChangeKind::Added, other));
        assert_eq!(store.pending(&key()), 1);
    }

    #[test]
    fn test_concurrent_expect_and_observe() {
        let (_, store) = store();
        let store = Arc::new(store);
        let names: Vec<String> = (0..200).map(|i| format!("lobby-{i}")).collect();
        for name in &names {
            store.expect_create(&key(), name);
        }

        let handles: Vec<_> = names
            .chunks(50)
            .map(|chunk| {
                let store = store.clone();
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for name in chunk {
                        store.observe(&event(ChangeKind::Added, instance(&name, "rev-1")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.satisfied(&key(), "rev-1"), (true, 0));
    }
}
