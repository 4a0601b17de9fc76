//! End-to-end reconcile scenarios.
//!
//! Each scenario drives the controller against the in-memory cluster with a
//! manual clock. Change events are delivered to the expectation store between
//! passes, the way the event dispatcher does it at runtime:
//!
//! 1. Fresh deployment scales out on the update revision
//! 2. Rolling update stops at the partition
//! 3. Timed canary pause requeues, then advances
//! 4. Pre-delete hook gates an explicit deletion
//! 5. In-place update touching more than images is rejected
//!
//! ## Running
//!
//! ```bash
//! cargo test -p gamefleet-e2e --test scenarios
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gamefleet_controller::model::{
    labels, CanaryPlan, CanaryStep, ConditionKind, Container, EnvVar, GameDeployment,
    GameDeploymentSpec, GameDeploymentStatus, HookPhase, HookStep, InstanceSpec, InstanceTemplate,
    LabelSelector, ObjectMeta, PauseSpec, UpdateStrategyKind, WorkloadInstance,
};
use gamefleet_controller::{
    Action, ClusterEvent, Controller, ControllerConfig, ControllerError, ControllerResult,
    ExpectationStore, InMemoryCluster, ManualClock,
};
use gamefleet_events::ObjectKey;
use gamefleet_reconcile::{compute_diff, compute_update_count, IntOrPercent, ScaleInputs, UpdateOptions};
use tokio::sync::mpsc;

const NAMESPACE: &str = "games";

/// `RUST_LOG` wins; otherwise the configured controller log level applies.
fn init_tracing(config: &ControllerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn deployment(name: &str, replicas: i32, image: &str) -> GameDeployment {
    GameDeployment {
        meta: ObjectMeta::named(NAMESPACE, name),
        spec: GameDeploymentSpec {
            replicas,
            selector: LabelSelector::from_labels([("app", name)]),
            template: InstanceTemplate {
                labels: BTreeMap::from([("app".to_string(), name.to_string())]),
                annotations: BTreeMap::new(),
                spec: InstanceSpec {
                    containers: vec![Container {
                        name: "server".into(),
                        image: image.into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
            scale_strategy: Default::default(),
            update_strategy: Default::default(),
            pre_delete_hook: None,
            min_ready_seconds: 0,
            revision_history_limit: None,
        },
        status: None,
    }
}

/// A controller wired to an in-memory cluster.
struct Fleet {
    cluster: Arc<InMemoryCluster>,
    clock: Arc<ManualClock>,
    expectations: Arc<ExpectationStore>,
    controller: Controller,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
}

impl Fleet {
    fn new() -> Self {
        let config = ControllerConfig::default();
        init_tracing(&config);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cluster = Arc::new(InMemoryCluster::with_clock(clock.clone()));
        let events = cluster.subscribe();
        let expectations = Arc::new(ExpectationStore::new(
            clock.clone(),
            config.expectation_timeout(),
        ));
        let controller = Controller::new(
            cluster.clone(),
            expectations.clone(),
            clock.clone(),
            config,
        );
        Self {
            cluster,
            clock,
            expectations,
            controller,
            events,
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(NAMESPACE, name)
    }

    fn apply(&self, deploy: &GameDeployment) {
        self.cluster.apply_deployment(deploy).unwrap();
    }

    /// Applies a change to the stored deployment spec.
    fn edit(&self, name: &str, f: impl FnOnce(&mut GameDeploymentSpec)) {
        let mut deploy = self.deployment(name);
        f(&mut deploy.spec);
        self.apply(&deploy);
    }

    fn deployment(&self, name: &str) -> GameDeployment {
        self.cluster.deployment(&Self::key(name)).unwrap()
    }

    fn status(&self, name: &str) -> GameDeploymentStatus {
        self.deployment(name).status.unwrap_or_default()
    }

    fn instances(&self) -> Vec<WorkloadInstance> {
        self.cluster.instances(NAMESPACE)
    }

    /// Feeds every pending change event to the expectation store.
    fn deliver(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.expectations.observe(&event);
        }
    }

    async fn pass(&mut self, name: &str) -> ControllerResult<Action> {
        self.deliver();
        let result = self.controller.reconcile(&Self::key(name)).await;
        self.deliver();
        result
    }

    fn ready_all(&mut self) {
        self.cluster.mark_all_ready(NAMESPACE).unwrap();
        self.deliver();
    }

    /// Runs passes, marking instances ready in between, until a pass takes
    /// no action.
    async fn settle(&mut self, name: &str) {
        for _ in 0..20 {
            let writes = self.mutations();
            self.pass(name).await.unwrap();
            self.ready_all();
            if self.mutations() == writes {
                return;
            }
        }
        panic!("{name} did not settle");
    }

    fn mutations(&self) -> usize {
        ["create_instance", "update_instance", "delete_instance"]
            .iter()
            .map(|op| self.cluster.call_count(op))
            .sum()
    }
}

#[tokio::test]
async fn scenario_fresh_deployment_scales_out_on_update_revision() {
    let diff = compute_diff(&ScaleInputs {
        desired_replicas: 3,
        partition: 0,
        max_surge: None,
        revisions_consistent: true,
        total_instances: 0,
        not_updated: 0,
    })
    .unwrap();
    assert_eq!(diff.total_diff, -3);

    let mut fleet = Fleet::new();
    fleet.apply(&deployment("arena", 3, "arena:1"));

    fleet.pass("arena").await.unwrap();
    assert_eq!(fleet.cluster.call_count("create_instance"), 3);

    fleet.ready_all();
    fleet.pass("arena").await.unwrap();

    let status = fleet.status("arena");
    let revisions = fleet.cluster.revisions(NAMESPACE);
    assert_eq!(revisions.len(), 1);
    assert_eq!(status.update_revision, revisions[0].name());
    assert_eq!(status.current_revision, status.update_revision);
    assert_eq!(status.replicas, 3);
    assert_eq!(status.ready_replicas, 3);
    assert_eq!(status.updated_replicas, 3);

    let instances = fleet.instances();
    assert_eq!(instances.len(), 3);
    assert!(instances
        .iter()
        .all(|i| i.revision() == Some(status.update_revision.as_str())));
    let mut identities: Vec<&str> = instances.iter().filter_map(|i| i.identity()).collect();
    identities.sort();
    identities.dedup();
    assert_eq!(identities.len(), 3);
}

#[tokio::test]
async fn scenario_rolling_update_stops_at_partition() {
    let diff = compute_diff(&ScaleInputs {
        desired_replicas: 10,
        partition: 2,
        max_surge: None,
        revisions_consistent: false,
        total_instances: 10,
        not_updated: 2,
    })
    .unwrap();
    assert_eq!(diff.current_rev_diff, 0);
    assert_eq!(diff.total_diff, 0);

    let options = UpdateOptions {
        partition: 2,
        max_unavailable: Some(IntOrPercent::percent(20)),
        max_surge: None,
        paused: false,
    };
    let ready = [true; 10];
    assert_eq!(compute_update_count(&options, 10, &[8, 9], &ready, |r| *r).unwrap(), 0);

    let mut fleet = Fleet::new();
    let mut deploy = deployment("arena", 10, "arena:1");
    deploy.spec.update_strategy.kind = UpdateStrategyKind::HotPatch;
    deploy.spec.update_strategy.max_unavailable = Some(IntOrPercent::percent(20));
    fleet.apply(&deploy);
    fleet.settle("arena").await;
    assert_eq!(fleet.instances().len(), 10);

    fleet.edit("arena", |spec| {
        spec.template.spec.containers[0].image = "arena:2".into();
        spec.update_strategy.partition = 2;
    });

    // two per pass under a 20% budget
    let before = fleet.cluster.call_count("update_instance");
    fleet.pass("arena").await.unwrap();
    assert_eq!(fleet.cluster.call_count("update_instance") - before, 2);
    fleet.ready_all();
    fleet.settle("arena").await;

    let status = fleet.status("arena");
    assert_eq!(status.replicas, 10);
    assert_eq!(status.updated_replicas, 8);
    assert_eq!(status.updated_ready_replicas, 8);
    assert_ne!(status.current_revision, status.update_revision);

    let mutations = fleet.mutations();
    fleet.pass("arena").await.unwrap();
    assert_eq!(fleet.mutations(), mutations);
    let old: Vec<WorkloadInstance> = fleet
        .instances()
        .into_iter()
        .filter(|i| i.revision() != Some(status.update_revision.as_str()))
        .collect();
    assert_eq!(old.len(), 2);
    assert!(old.iter().all(|i| i.is_ready()));
}

#[tokio::test]
async fn scenario_timed_canary_pause_requeues_then_advances() {
    let mut fleet = Fleet::new();
    let mut deploy = deployment("arena", 2, "arena:1");
    deploy.spec.update_strategy.kind = UpdateStrategyKind::HotPatch;
    deploy.spec.update_strategy.max_unavailable = Some(IntOrPercent::Int(1));
    fleet.apply(&deploy);
    fleet.settle("arena").await;

    fleet.edit("arena", |spec| {
        spec.template.spec.containers[0].image = "arena:2".into();
        spec.update_strategy.canary = Some(CanaryPlan {
            steps: vec![CanaryStep {
                partition: Some(1),
                pause: Some(PauseSpec {
                    duration_seconds: Some(300),
                }),
                hook: None,
            }],
        });
    });

    // upgrade one instance to reach the step partition
    fleet.pass("arena").await.unwrap();
    fleet.ready_all();

    let action = fleet.pass("arena").await.unwrap();
    assert_eq!(action, Action::RequeueAfter(Duration::from_secs(300)));
    let canary = fleet.status("arena").canary.unwrap();
    assert_eq!(canary.step_index, 0);
    assert!(canary.pause_start.is_some());
    assert_eq!(canary.pause_conditions.len(), 1);

    fleet.clock.advance(chrono::Duration::seconds(120));
    let action = fleet.pass("arena").await.unwrap();
    assert_eq!(action, Action::RequeueAfter(Duration::from_secs(180)));
    let updated = fleet.status("arena").updated_replicas;
    assert_eq!(updated, 1);

    fleet.clock.advance(chrono::Duration::seconds(180));
    let action = fleet.pass("arena").await.unwrap();
    assert_eq!(action, Action::RequeueAfter(Duration::ZERO));
    let canary = fleet.status("arena").canary.unwrap();
    assert_eq!(canary.step_index, 1);
    assert!(canary.pause_conditions.is_empty());

    fleet.settle("arena").await;
    let status = fleet.status("arena");
    assert_eq!(status.updated_replicas, 2);
    assert_eq!(status.current_revision, status.update_revision);
}

#[tokio::test]
async fn scenario_pre_delete_hook_gates_deletion() {
    let mut fleet = Fleet::new();
    let mut deploy = deployment("arena", 2, "arena:1");
    deploy.spec.pre_delete_hook = Some(HookStep {
        template_name: "drain-sessions".into(),
        args: vec![],
    });
    fleet.apply(&deploy);
    fleet.settle("arena").await;

    let victim = fleet.instances()[0].clone();
    fleet.edit("arena", |spec| {
        spec.scale_strategy.instances_to_delete = vec![victim.name().to_string()];
    });

    // first pass: hook run created, deletion blocked
    fleet.pass("arena").await.unwrap();
    assert!(fleet.instances().iter().any(|i| i.name() == victim.name()));
    let runs = fleet.cluster.hook_runs(NAMESPACE);
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0].meta.label(labels::INSTANCE_ID),
        victim.identity()
    );
    let hooks = fleet.status("arena").pre_delete_hooks;
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].instance_name, victim.name());

    // the run is reused, never duplicated
    fleet.cluster.set_hook_phase(&runs[0].key(), HookPhase::Running).unwrap();
    fleet.pass("arena").await.unwrap();
    assert_eq!(fleet.cluster.hook_runs(NAMESPACE).len(), 1);
    assert_eq!(fleet.status("arena").pre_delete_hooks[0].phase, HookPhase::Running);
    assert!(fleet.instances().iter().any(|i| i.name() == victim.name()));

    // hook succeeded: deletion proceeds and tracking is cleared
    fleet.cluster.set_hook_phase(&runs[0].key(), HookPhase::Successful).unwrap();
    fleet.pass("arena").await.unwrap();
    assert!(fleet.instances().iter().all(|i| i.name() != victim.name()));
    assert!(fleet.status("arena").pre_delete_hooks.is_empty());

    // replacement minted, stale deletion request and finished run cleaned up
    fleet.pass("arena").await.unwrap();
    assert_eq!(fleet.instances().len(), 2);
    assert!(fleet.cluster.hook_runs(NAMESPACE).is_empty());
    assert!(fleet
        .deployment("arena")
        .spec
        .scale_strategy
        .instances_to_delete
        .is_empty());
}

#[tokio::test]
async fn scenario_in_place_update_rejects_non_image_change() {
    let mut fleet = Fleet::new();
    let mut deploy = deployment("arena", 2, "arena:1");
    deploy.spec.update_strategy.kind = UpdateStrategyKind::InPlace;
    fleet.apply(&deploy);
    fleet.settle("arena").await;

    fleet.edit("arena", |spec| {
        let container = &mut spec.template.spec.containers[0];
        container.image = "arena:2".into();
        container.env.push(EnvVar {
            name: "MAX_PLAYERS".into(),
            value: "64".into(),
        });
    });

    let err = fleet.pass("arena").await.unwrap_err();
    assert!(err.is_permanent());
    match &err {
        ControllerError::InvalidInPlaceUpdate { path } => {
            assert!(path.starts_with("/spec/template/spec/containers/0/env"), "{path}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fleet.cluster.call_count("update_instance"), 0);

    let status = fleet.status("arena");
    let condition = status.condition(ConditionKind::FailedUpdate).unwrap();
    assert_eq!(condition.reason, "InvalidInPlaceUpdate");
    assert!(fleet
        .instances()
        .iter()
        .all(|i| i.spec.containers[0].image == "arena:1"));
}
