//! Background workers.
//!
//! - `EventDispatcher` consumes the change stream: every event is first fed
//!   to the expectation store, then the owning deployment key is enqueued
//! - `WorkerPool` runs a fixed number of workers pulling keys off the work
//!   queue, each pass bounded by the pass timeout
//!
//! Both stop when the shutdown channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use gamefleet_events::ObjectKey;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterEvent, ClusterObject};
use crate::controller::{Action, Controller};
use crate::expectations::ExpectationStore;
use crate::queue::WorkQueue;

/// Work queue of deployment keys.
pub type DeploymentQueue = WorkQueue<ObjectKey>;

/// Key of the deployment an event concerns.
pub fn owner_key(event: &ClusterEvent) -> Option<ObjectKey> {
    match &event.payload {
        ClusterObject::Deployment(_) => Some(event.key.clone()),
        ClusterObject::Instance(instance) => instance.meta.deployment_key(),
        ClusterObject::Revision(revision) => revision.meta.deployment_key(),
        ClusterObject::HookRun(run) => run.meta.deployment_key(),
    }
}

// =============================================================================
// Event dispatcher
// =============================================================================

pub struct EventDispatcher {
    expectations: Arc<ExpectationStore>,
    queue: Arc<DeploymentQueue>,
}

impl EventDispatcher {
    pub fn new(expectations: Arc<ExpectationStore>, queue: Arc<DeploymentQueue>) -> Self {
        Self { expectations, queue }
    }

    pub fn dispatch(&self, event: &ClusterEvent) {
        self.expectations.observe(event);
        match owner_key(event) {
            Some(key) => self.queue.add(key),
            None => debug!(key = %event.key, resource = %event.resource, "Event has no owning deployment"),
        }
    }

    /// Dispatches events until the stream closes or shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting event dispatcher");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(&event),
                    None => {
                        warn!("Change stream closed, event dispatcher stopping");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Worker pool
// =============================================================================

pub struct WorkerPool {
    controller: Arc<Controller>,
    queue: Arc<DeploymentQueue>,
    workers: usize,
    pass_timeout: Duration,
}

impl WorkerPool {
    pub fn new(controller: Arc<Controller>, queue: Arc<DeploymentQueue>) -> Self {
        let config = controller.config();
        let workers = config.workers.max(1);
        let pass_timeout = config.pass_timeout();
        Self {
            controller,
            queue,
            workers,
            pass_timeout,
        }
    }

    /// Seeds the queue with every deployment, then runs the workers until
    /// shutdown is signaled. In-flight passes are allowed to finish.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, "Starting reconcile workers");

        match self.controller.client().list_deployments().await {
            Ok(deployments) => {
                for deploy in &deployments {
                    self.queue.add(deploy.key());
                }
                debug!(count = deployments.len(), "Queued existing deployments");
            }
            Err(e) => error!(error = %e, "Failed to list deployments at startup"),
        }

        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    controller: Arc::clone(&self.controller),
                    queue: Arc::clone(&self.queue),
                    pass_timeout: self.pass_timeout,
                };
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                info!("Reconcile workers shutting down");
                break;
            }
        }

        self.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Reconcile worker panicked");
            }
        }
    }
}

struct Worker {
    id: usize,
    controller: Arc<Controller>,
    queue: Arc<DeploymentQueue>,
    pass_timeout: Duration,
}

impl Worker {
    async fn run(&self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = self.id, "Worker stopped");
    }

    /// Runs one pass in its own task, so a panic or timeout releases the key.
    async fn process(&self, key: &ObjectKey) {
        let controller = Arc::clone(&self.controller);
        let pass_key = key.clone();
        let mut pass = tokio::spawn(async move { controller.reconcile(&pass_key).await });

        match tokio::time::timeout(self.pass_timeout, &mut pass).await {
            Ok(Ok(Ok(Action::AwaitChange))) => {
                self.queue.forget(key);
            }
            Ok(Ok(Ok(Action::RequeueAfter(delay)))) => {
                self.queue.forget(key);
                debug!(deployment = %key, delay_ms = delay.as_millis() as u64, "Requeue scheduled");
                self.queue.add_after(key.clone(), delay);
            }
            Ok(Ok(Err(e))) if e.is_permanent() => {
                error!(deployment = %key, reason = e.reason(), error = %e, "Reconcile failed permanently");
                self.queue.forget(key);
            }
            Ok(Ok(Err(e))) => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    deployment = %key,
                    reason = e.reason(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed, retrying"
                );
            }
            Ok(Err(e)) => {
                let delay = self.queue.add_rate_limited(key.clone());
                error!(
                    deployment = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile pass panicked"
                );
            }
            Err(_) => {
                pass.abort();
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    deployment = %key,
                    timeout_secs = self.pass_timeout.as_secs(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile pass timed out"
                );
            }
        }
    }
}
