//! The control loop of a single deployment.
//!
//! Each deployment gets its own task which is the only writer of the deployment's plan and
//! members. The task reacts to updates forwarded by the K8s controller and re-inspects the
//! deployment on a timer which backs off while there is nothing to do.

mod context;
mod inspector;
mod update;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use metrics::{increment_counter, register_counter};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::ConnectionCache;
use crate::config::Config;
use crate::persistence::{update_with_retry, RecordStore, WriteTarget};
use crate::resources::{EventKind, ResourceClient, ResourceNames};
use crate::scaling::{ScalingHandle, ScalingSynchronizer};
use arango_core::crd::{ArangoDeployment, DeploymentPhase, DeploymentStatus, MemberPhase, RequiredMetadata};
use arango_core::AppResult;

/// The capacity of a deployment's event queue.
const EVENT_QUEUE_SIZE: usize = 256;
/// The number of queued events past which senders log a warning.
const EVENT_QUEUE_HIGH_WATERMARK: usize = EVENT_QUEUE_SIZE * 8 / 10;
/// The shortest interval between two inspections.
const MIN_INSPECTION_INTERVAL: Duration = Duration::from_millis(250);
/// The longest interval between two inspections.
const MAX_INSPECTION_INTERVAL: Duration = Duration::from_secs(10);
/// The factor by which the inspection interval grows while there is nothing to do.
const INSPECTION_BACKOFF_FACTOR: f64 = 1.5;

const METRIC_INSPECTIONS: &str = "arango_operator_inspections";
const METRIC_INSPECTION_FAILURES: &str = "arango_operator_inspection_failures";
const METRIC_EVENT_QUEUE_HIGH_WATERMARK: &str = "arango_operator_event_queue_high_watermark";

/// Register the metrics of this module.
pub fn register_metrics() {
    register_counter!(METRIC_INSPECTIONS, metrics::Unit::Count, "number of deployment inspections");
    register_counter!(METRIC_INSPECTION_FAILURES, metrics::Unit::Count, "number of deployment inspections which failed");
    register_counter!(
        METRIC_EVENT_QUEUE_HIGH_WATERMARK,
        metrics::Unit::Count,
        "number of events sent while a deployment's event queue was nearly full"
    );
}

/// The collaborators through which a deployment reaches the outside world.
#[derive(Clone)]
pub struct Collaborators {
    /// The store of deployment records.
    pub store: Arc<dyn RecordStore<ArangoDeployment>>,
    /// The lifecycle of the deployment's K8s objects.
    pub resources: Arc<dyn ResourceClient>,
    /// The cache of clients of the deployment's database servers.
    pub clients: Arc<ConnectionCache>,
}

/// An update delivered to a deployment's control loop.
#[derive(Debug)]
pub enum DeploymentEvent {
    /// The spec of the deployment record has changed.
    SpecUpdated,
    /// A pod of the deployment was created or updated.
    PodApplied(Pod),
    /// A pod of the deployment was deleted.
    PodDeleted(Pod),
    /// The full set of pods of the deployment, after a watcher restart.
    PodsRestarted(Vec<Pod>),
}

/// A handle to a running deployment.
pub struct DeploymentHandle {
    events_tx: mpsc::Sender<DeploymentEvent>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeploymentHandle {
    /// Send an event to the deployment, waiting for queue capacity as needed.
    ///
    /// Returns false if the deployment was stopped before the event was accepted.
    pub async fn send(&self, event: DeploymentEvent) -> bool {
        if *self.stop_rx.borrow() {
            return false;
        }
        if self.is_nearly_full() {
            tracing::warn!(used = self.queued(), capacity = EVENT_QUEUE_SIZE, "deployment event queue is nearly full");
            increment_counter!(METRIC_EVENT_QUEUE_HIGH_WATERMARK);
        }
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            res = self.events_tx.send(event) => res.is_ok(),
            _ = stop_rx.changed() => false,
        }
    }

    /// The number of events waiting in the queue.
    fn queued(&self) -> usize {
        EVENT_QUEUE_SIZE - self.events_tx.capacity()
    }

    /// Check if the queue has filled up past its high watermark.
    fn is_nearly_full(&self) -> bool {
        self.queued() >= EVENT_QUEUE_HIGH_WATERMARK
    }

    /// Signal the deployment that its record was deleted.
    ///
    /// This may be called any number of times, only the first call has an effect.
    pub fn delete(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for all tasks of the deployment to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(error = ?err, "error joining deployment task");
            }
        }
    }
}

/// The control loop of a deployment.
pub struct Deployment {
    /// The name of the deployment.
    name: String,
    names: ResourceNames,
    /// The latest known version of the deployment record.
    depl: ArangoDeployment,
    deps: Collaborators,
    /// The deployment's pods, by name.
    pods: HashMap<String, Pod>,
    /// Pods which were seen being deleted and whose members have not been recreated yet.
    deleted_pods: HashSet<String>,
    services_ensured: bool,
    scaling: ScalingHandle,
    /// Publishes the latest deployment record to the synchronizer & client factory.
    view_tx: watch::Sender<Arc<ArangoDeployment>>,

    events_rx: mpsc::Receiver<DeploymentEvent>,
    /// A signal that the deployment's record was deleted.
    stop_rx: watch::Receiver<bool>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    interval: Duration,
    next_inspection: Instant,
}

impl Deployment {
    /// Create a new instance, along with its scaling synchronizer and an unspawned handle.
    pub fn new(
        config: Arc<Config>, depl: ArangoDeployment, deps: Collaborators, view_tx: watch::Sender<Arc<ArangoDeployment>>,
        view_rx: watch::Receiver<Arc<ArangoDeployment>>, shutdown_tx: &broadcast::Sender<()>,
    ) -> (Self, ScalingSynchronizer, DeploymentHandle) {
        let name = depl.name().to_string();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (sync, scaling) = ScalingSynchronizer::new(config, name.clone(), deps.clone(), view_rx, stop_rx.clone(), shutdown_tx);
        let this = Self {
            names: ResourceNames::new(&depl),
            name,
            depl,
            deps,
            pods: Default::default(),
            deleted_pods: Default::default(),
            services_ensured: false,
            scaling,
            view_tx,
            events_rx,
            stop_rx: stop_rx.clone(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            interval: MIN_INSPECTION_INTERVAL,
            next_inspection: Instant::now(),
        };
        let handle = DeploymentHandle {
            events_tx,
            stop_tx,
            stop_rx,
            tasks: vec![],
        };
        (this, sync, handle)
    }

    /// Create a new deployment and spawn its control loop and scaling synchronizer.
    pub fn launch(
        config: Arc<Config>, depl: ArangoDeployment, deps: Collaborators, view_tx: watch::Sender<Arc<ArangoDeployment>>,
        view_rx: watch::Receiver<Arc<ArangoDeployment>>, shutdown_tx: &broadcast::Sender<()>,
    ) -> DeploymentHandle {
        let (this, sync, mut handle) = Self::new(config, depl, deps, view_tx, view_rx, shutdown_tx);
        handle.tasks.push(sync.spawn());
        handle.tasks.push(this.spawn());
        handle
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(deployment = %self.name))]
    async fn run(mut self) {
        tracing::info!("deployment control loop started");
        // A resumed deployment pushes its accepted counts once the synchronizer gets to it.
        if let Some(accepted) = self.depl.status.as_ref().and_then(|status| status.accepted_spec.clone()) {
            self.scaling.queue_update(accepted).await;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => break,
                res = self.stop_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    if *self.stop_rx.borrow() {
                        self.cleanup().await;
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = tokio::time::sleep_until(self.next_inspection) => {
                    let has_work = self.inspect().await;
                    self.interval = next_interval(self.interval, has_work);
                    self.next_inspection = Instant::now() + self.interval;
                }
            }
        }
        tracing::info!("deployment control loop stopped");
    }

    async fn handle_event(&mut self, event: DeploymentEvent) {
        match event {
            DeploymentEvent::SpecUpdated => {
                if let Err(err) = self.handle_spec_update().await {
                    tracing::error!(error = ?err, deployment = %self.name, "error handling spec update");
                }
            }
            DeploymentEvent::PodApplied(pod) => {
                let name = pod.metadata.name.clone().unwrap_or_default();
                self.deleted_pods.remove(&name);
                self.pods.insert(name, pod);
            }
            DeploymentEvent::PodDeleted(pod) => {
                let name = pod.metadata.name.clone().unwrap_or_default();
                self.pods.remove(&name);
                self.deleted_pods.insert(name);
            }
            DeploymentEvent::PodsRestarted(pods) => {
                let live: HashMap<String, Pod> = pods
                    .into_iter()
                    .map(|pod| (pod.metadata.name.clone().unwrap_or_default(), pod))
                    .collect();
                let mut vanished: Vec<String> = self.pods.keys().filter(|name| !live.contains_key(*name)).cloned().collect();
                // The pods of members may have gone while no instance was watching them.
                let status = self.status();
                for (group, member) in status.members.iter() {
                    if matches!(member.phase, MemberPhase::Created | MemberPhase::Rotating) {
                        let pod_name = self.pod_name(group, member);
                        if !live.contains_key(&pod_name) {
                            vanished.push(pod_name);
                        }
                    }
                }
                self.deleted_pods.extend(vanished);
                self.deleted_pods.retain(|name| !live.contains_key(name));
                self.pods = live;
            }
        }
        self.trigger_inspection();
    }

    /// Have the next inspection run right away.
    fn trigger_inspection(&mut self) {
        self.interval = MIN_INSPECTION_INTERVAL;
        self.next_inspection = Instant::now();
    }

    /// Remove the finalizers of the deployment's objects, once, after its record was deleted.
    async fn cleanup(&mut self) {
        tracing::info!(deployment = %self.name, "deployment deleted, removing finalizers");
        if let Err(err) = self.deps.resources.remove_finalizers(&self.name).await {
            tracing::error!(error = ?err, deployment = %self.name, "error removing finalizers of deleted deployment");
        }
    }

    fn status(&self) -> DeploymentStatus {
        self.depl.status.clone().unwrap_or_default()
    }

    fn phase(&self) -> DeploymentPhase {
        self.depl.status.as_ref().map(|status| status.phase).unwrap_or_default()
    }

    /// Replace the known deployment record, publishing it.
    fn set_record(&mut self, depl: ArangoDeployment) {
        self.depl = depl;
        publish(&self.view_tx, &self.depl);
    }

    /// Modify and persist the status of the deployment.
    async fn write_status<F>(&mut self, modify: F) -> AppResult<()>
    where
        F: FnMut(&mut DeploymentStatus) + Send,
    {
        write_status(self.deps.store.as_ref(), &mut self.depl, modify).await?;
        publish(&self.view_tx, &self.depl);
        Ok(())
    }

    /// Record a diagnostic event against the deployment, logging failures.
    async fn record_event(&self, kind: EventKind, reason: &str, message: &str) {
        if let Err(err) = self.deps.resources.record_event(&self.depl, kind, reason, message).await {
            tracing::error!(error = ?err, deployment = %self.name, reason, "error recording event");
        }
    }
}

/// Modify and persist the status of the given deployment record, updating it in place.
async fn write_status<F>(store: &dyn RecordStore<ArangoDeployment>, depl: &mut ArangoDeployment, mut modify: F) -> AppResult<()>
where
    F: FnMut(&mut DeploymentStatus) + Send,
{
    let name = depl.name().to_string();
    let updated = update_with_retry(store, &name, WriteTarget::Status, depl.clone(), false, |record: &mut ArangoDeployment| {
        modify(record.status.get_or_insert_with(Default::default))
    })
    .await?;
    *depl = updated;
    Ok(())
}

fn publish(view_tx: &watch::Sender<Arc<ArangoDeployment>>, depl: &ArangoDeployment) {
    let _ = view_tx.send(Arc::new(depl.clone()));
}

/// The interval to wait before the next inspection.
///
/// Any found work resets the interval to its minimum, otherwise it backs off up to its maximum.
fn next_interval(current: Duration, has_work: bool) -> Duration {
    if has_work {
        return MIN_INSPECTION_INTERVAL;
    }
    current.mul_f64(INSPECTION_BACKOFF_FACTOR).min(MAX_INSPECTION_INTERVAL)
}
