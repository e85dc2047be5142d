//! Synchronization of member counts between deployment specs and their clusters.
//!
//! An ArangoDB cluster carries its own notion of the desired number of coordinators and database
//! servers, which can be edited through the database UI. The synchronizer pushes the counts of the
//! accepted spec to the cluster, and copies counts edited in the cluster back into the spec.
//!
//! Within a tick, any pending push always happens before the counts are read back. Reading first
//! would pick up the cluster's stale value right before our own write replaces it, and the two
//! sides would flap between each other.


use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::prelude::*;
use metrics::{increment_counter, register_counter};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::NumberOfServers;
use crate::config::Config;
use crate::deployment::Collaborators;
use crate::resources::EventKind;
use arango_core::crd::{ArangoDeployment, DeploymentMode, DeploymentPhase, DeploymentSpec, ServerGroup};
use arango_core::{AppError, AppResult};

/// The cadence at which the synchronizer runs.
const SCALING_TICK: Duration = Duration::from_secs(2);
/// The window after startup during which failures are expected and logged at debug level.
const BOOTSTRAP_GRACE_PERIOD: Duration = Duration::from_secs(120);

const METRIC_SCALING_PUSHES: &str = "arango_operator_scaling_pushes";
const METRIC_SCALING_UPDATES: &str = "arango_operator_scaling_spec_updates";

/// Register the metrics of this module.
pub fn register_metrics() {
    register_counter!(METRIC_SCALING_PUSHES, metrics::Unit::Count, "number of server count updates pushed to clusters");
    register_counter!(METRIC_SCALING_UPDATES, metrics::Unit::Count, "number of spec updates copied from cluster server counts");
}

/// State shared between the synchronizer and its handle.
#[derive(Default)]
struct ScalingState {
    /// A spec whose counts are waiting to be pushed to the cluster.
    pending_update: Mutex<Option<DeploymentSpec>>,
    /// The counts last seen in, or pushed to, the cluster.
    last_number_of_servers: Mutex<NumberOfServers>,
}

/// The state of the synchronization gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gate {
    Enabled,
    /// Enabled, but the initial push of the desired counts has not succeeded yet.
    EnablePending,
    Disabled,
}

/// A handle used by a deployment's control loop to drive its synchronizer.
pub struct ScalingHandle {
    state: Arc<ScalingState>,
    enabled_tx: watch::Sender<bool>,
    enabled: bool,
}

impl ScalingHandle {
    /// Queue the counts of the given spec to be pushed to the cluster.
    ///
    /// A newer spec replaces any update still waiting to be pushed.
    pub async fn queue_update(&self, spec: DeploymentSpec) {
        *self.state.pending_update.lock().await = Some(spec);
    }

    /// Turn synchronization on or off, does nothing if it is already in that state.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        let _ = self.enabled_tx.send(enabled);
    }
}

/// A periodic task synchronizing the server counts of one deployment.
pub struct ScalingSynchronizer {
    config: Arc<Config>,
    /// The name of the deployment.
    name: String,
    deps: Collaborators,
    /// The latest deployment record published by the control loop.
    deployment: watch::Receiver<Arc<ArangoDeployment>>,
    state: Arc<ScalingState>,
    gate: Gate,
    enabled_rx: watch::Receiver<bool>,

    /// A signal that the deployment has been deleted.
    stop_rx: watch::Receiver<bool>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    started_at: Instant,
    successful_reads: u64,
}

impl ScalingSynchronizer {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, name: String, deps: Collaborators, deployment: watch::Receiver<Arc<ArangoDeployment>>, stop_rx: watch::Receiver<bool>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> (Self, ScalingHandle) {
        let state = Arc::new(ScalingState::default());
        let (enabled_tx, enabled_rx) = watch::channel(true);
        let handle = ScalingHandle {
            state: state.clone(),
            enabled_tx,
            enabled: true,
        };
        let this = Self {
            config,
            name,
            deps,
            deployment,
            state,
            gate: Gate::Enabled,
            enabled_rx,
            stop_rx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            started_at: Instant::now(),
            successful_reads: 0,
        };
        (this, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(deployment = %self.name))]
    async fn run(mut self) {
        tracing::debug!("scaling synchronizer started");
        let mut ticker = tokio::time::interval(SCALING_TICK);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => break,
                res = self.stop_rx.changed() => {
                    if res.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                res = self.enabled_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let enabled = *self.enabled_rx.borrow();
                    self.set_enabled(enabled).await;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::debug!("scaling synchronizer stopped");
    }

    /// Run one synchronization pass.
    pub(crate) async fn tick(&mut self) {
        let depl = self.deployment.borrow().clone();
        if !is_synchronized(&depl) {
            return;
        }
        if !self.config.scaling_integration_enabled {
            if let Err(err) = self.clear_override().await {
                self.log_error(&err, "error clearing server count override");
            }
            return;
        }
        match self.gate {
            Gate::Disabled => return,
            Gate::EnablePending => {
                if let Err(err) = self.push(NumberOfServers::from_spec(depl.accepted_spec())).await {
                    self.log_error(&err, "error pushing server counts after enabling synchronization");
                    return;
                }
                self.gate = Gate::Enabled;
            }
            Gate::Enabled => (),
        }

        match self.push_pending().await {
            Ok(true) => (),
            // A newer spec was queued during the push, the cluster is read once it has been pushed too.
            Ok(false) => return,
            Err(err) => {
                self.log_error(&err, "error pushing server counts to cluster");
                return;
            }
        }
        if let Err(err) = self.read_back(&depl).await {
            self.log_error(&err, "error reading server counts from cluster");
        }
    }

    /// Push the counts of the pending spec, if any, clearing it unless it was replaced meanwhile.
    ///
    /// Returns true if the cluster's counts may be read back, which is not the case while a newer
    /// spec is still waiting to be pushed.
    async fn push_pending(&self) -> AppResult<bool> {
        let spec = match self.state.pending_update.lock().await.clone() {
            Some(spec) => spec,
            None => return Ok(true),
        };
        let desired = NumberOfServers::from_spec(&spec);
        let last = *self.state.last_number_of_servers.lock().await;
        if desired != last {
            self.push(desired).await?;
        }

        let mut pending = self.state.pending_update.lock().await;
        let superseded = pending.as_ref() != Some(&spec);
        if !superseded {
            *pending = None;
        }
        drop(pending);
        *self.state.last_number_of_servers.lock().await = desired;
        Ok(!superseded)
    }

    /// Read the cluster's counts, copying edited counts into the deployment spec.
    async fn read_back(&mut self, depl: &ArangoDeployment) -> AppResult<()> {
        let client = self.deps.clients.get_database().await?;
        let counts = client.get_server_counts().await?;
        self.successful_reads += 1;

        let last = *self.state.last_number_of_servers.lock().await;
        let changed: Vec<(ServerGroup, u32)> = [
            (ServerGroup::Coordinators, counts.coordinators, last.coordinators),
            (ServerGroup::DBServers, counts.dbservers, last.dbservers),
        ]
        .iter()
        .filter_map(|(group, current, last)| match current {
            Some(count) if Some(*count) != *last => Some((*group, *count)),
            _ => None,
        })
        .collect();
        if changed.is_empty() {
            *self.state.last_number_of_servers.lock().await = counts;
            return Ok(());
        }

        // Counts outside of the spec's bounds are rejected and the accepted counts pushed back.
        let spec = depl.accepted_spec();
        let rejected: Vec<String> = changed
            .iter()
            .filter(|(group, count)| !spec.group_spec(*group).allows_count(*count))
            .map(|(group, count)| {
                let group_spec = spec.group_spec(*group);
                format!("{} count {} is outside of [{}, {}]", group, count, group_spec.min_count(), group_spec.max_count())
            })
            .collect();
        if !rejected.is_empty() {
            let message = format!("server counts set in the cluster were rejected: {}", rejected.join(", "));
            tracing::warn!(deployment = %self.name, %message);
            if let Err(err) = self.deps.resources.record_event(depl, EventKind::Warning, "ScalingRejected", &message).await {
                tracing::error!(error = ?err, deployment = %self.name, "error recording event");
            }
            *self.state.pending_update.lock().await = Some(spec.clone());
            *self.state.last_number_of_servers.lock().await = counts;
            return Ok(());
        }

        let mut groups = Map::new();
        for (group, count) in changed.iter() {
            let key = match group {
                ServerGroup::Coordinators => "coordinators",
                _ => "dbservers",
            };
            groups.insert(key.into(), json!({ "count": count }));
        }
        self.deps.store.patch(&self.name, json!({ "spec": Value::Object(groups) })).await?;
        increment_counter!(METRIC_SCALING_UPDATES);
        tracing::info!(deployment = %self.name, %counts, "copied server counts from cluster into spec");
        *self.state.last_number_of_servers.lock().await = counts;
        Ok(())
    }

    /// Apply a change of the gate requested by the control loop.
    async fn set_enabled(&mut self, enabled: bool) {
        let depl = self.deployment.borrow().clone();
        if enabled {
            if self.gate == Gate::Enabled {
                return;
            }
            self.gate = Gate::EnablePending;
            if !is_synchronized(&depl) || !self.config.scaling_integration_enabled {
                return;
            }
            match self.push(NumberOfServers::from_spec(depl.accepted_spec())).await {
                Ok(_) => self.gate = Gate::Enabled,
                Err(err) => self.log_error(&err, "error pushing server counts after enabling synchronization, will retry"),
            }
            return;
        }

        if self.gate == Gate::Disabled {
            return;
        }
        if is_synchronized(&depl) {
            if let Err(err) = self.push(NumberOfServers::default()).await {
                self.log_error(&err, "error clearing server count override while disabling synchronization");
            }
        }
        self.gate = Gate::Disabled;
    }

    /// Clear any server count override found in the cluster.
    async fn clear_override(&self) -> AppResult<()> {
        let client = self.deps.clients.get_database().await?;
        if client.get_server_counts().await?.is_empty() {
            return Ok(());
        }
        client.set_server_counts(NumberOfServers::default()).await?;
        tracing::info!(deployment = %self.name, "cleared server count override of cluster");
        Ok(())
    }

    async fn push(&self, counts: NumberOfServers) -> AppResult<()> {
        let client = self.deps.clients.get_database().await?;
        client.set_server_counts(counts).await?;
        increment_counter!(METRIC_SCALING_PUSHES);
        tracing::debug!(deployment = %self.name, %counts, "pushed server counts to cluster");
        Ok(())
    }

    fn log_error(&self, err: &AppError, msg: &str) {
        let expected_success = self.successful_reads > 0 || self.started_at.elapsed() > BOOTSTRAP_GRACE_PERIOD;
        if expected_success {
            tracing::error!(error = ?err, deployment = %self.name, "{}", msg);
        } else {
            tracing::debug!(error = ?err, deployment = %self.name, "{}", msg);
        }
    }
}

/// Check if the counts of the given deployment are synchronized with its cluster.
fn is_synchronized(depl: &ArangoDeployment) -> bool {
    let phase = depl.status.as_ref().map(|status| status.phase).unwrap_or_default();
    depl.accepted_spec().mode == DeploymentMode::Cluster && phase == DeploymentPhase::Running
}
