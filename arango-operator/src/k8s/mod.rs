//! Kubernetes controller.
//!
//! This controller observes the deployment records and pods of its namespace, spawns a control
//! loop for every deployment record and forwards the changes relevant to each deployment to its
//! control loop. All other K8s access of the operator goes through the store and resource client
//! of this module.

mod data;
mod resources;
mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use metrics::register_counter;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::deployment::DeploymentHandle;
use arango_core::crd::ArangoDeployment;
use arango_core::{AppError, AppResult, ARANGO_OPERATOR_LABEL_SELECTORS};

pub use resources::KubeResources;
pub use store::KubeRecordStore;

/// The timeout of a single call against the K8s API.
pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay applied after a watcher error before the watcher is polled again.
const WATCHER_ERROR_DELAY: Duration = Duration::from_secs(10);

const METRIC_WATCHER_ERRORS: &str = "arango_operator_watcher_errors";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Register the metrics of this module.
pub fn register_metrics() {
    register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "number of errors returned from K8s watchers");
}

/// Map an error of the K8s client onto the application's error classes.
pub(crate) fn map_kube_error(err: kube::Error) -> AppError {
    match &err {
        kube::Error::Api(res) if res.code == 409 => AppError::Conflict,
        kube::Error::Api(res) if res.code == 404 => AppError::ResourceNotFound,
        kube::Error::Api(res) if res.code == 401 || res.code == 403 => AppError::Unauthorized,
        _ => AppError::Ise(anyhow::Error::from(err).context("error from K8s API")),
    }
}

/// Await the given K8s API call, bounded by `API_TIMEOUT`.
pub(crate) async fn call<T, F>(op: &'static str, fut: F) -> AppResult<T>
where
    F: Future<Output = kube::Result<T>>,
{
    timeout(API_TIMEOUT, fut).await.map_err(|_| AppError::Timeout(op))?.map_err(map_kube_error)
}

/// A deployment known to the controller.
struct DeploymentEntry {
    /// The last observed version of the deployment record.
    record: ArangoDeployment,
    /// The handle of the deployment's control loop.
    handle: DeploymentHandle,
}

/// Kubernetes controller for watching ArangoDB deployment records.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// All known deployments, by name.
    deployments: HashMap<Arc<String>, DeploymentEntry>,
    /// All known pods managed by this operator, by name.
    pods: HashMap<Arc<String>, Pod>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            deployments: Default::default(),
            pods: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let deployments: Api<ArangoDeployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let deployments_watcher = watcher(deployments, ListParams::default());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pods_watcher = watcher(pods, self.list_params_operator_selector_labels());
        tokio::pin!(deployments_watcher, pods_watcher);

        tracing::info!(namespace = %self.config.namespace, "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = deployments_watcher.next() => self.handle_deployment_event(k8s_event_res).await,
                Some(k8s_event_res) = pods_watcher.next() => self.handle_pod_event(k8s_event_res).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        for (_, entry) in self.deployments.drain() {
            entry.handle.join().await;
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Create a list params object which selects only objects controlled by this operator.
    fn list_params_operator_selector_labels(&self) -> ListParams {
        ListParams {
            label_selector: Some(ARANGO_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}
