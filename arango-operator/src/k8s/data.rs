use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use kube::Resource;
use metrics::increment_counter;
use tokio::sync::watch;

use crate::cluster::{ConnectionCache, HttpClientFactory};
use crate::deployment::{Collaborators, Deployment, DeploymentEvent, DeploymentHandle};
use crate::k8s::{Controller, DeploymentEntry, EventResult, KubeRecordStore, KubeResources, METRIC_WATCHER_ERRORS, WATCHER_ERROR_DELAY};
use crate::resources::ResourceNames;
use arango_core::crd::ArangoDeployment;
use arango_core::LABEL_ARANGO_DEPLOYMENT;

//////////////////////////////////////////////////////////////////////////////
// Deployment Events /////////////////////////////////////////////////////////
impl Controller {
    /// Handle `ArangoDeployment` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_deployment_event(&mut self, res: EventResult<ArangoDeployment>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from ArangoDeployment k8s watcher");
                increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.deployment_applied(obj).await,
            Event::Deleted(obj) => self.deployment_deleted(obj).await,
            Event::Restarted(objs) => self.deployment_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, depl))]
    async fn deployment_applied(&mut self, depl: ArangoDeployment) {
        let name_str = match depl.meta().name.as_ref() {
            Some(name_str) => name_str.clone(),
            None => return, // Not actually possible as K8s requires name.
        };
        if let Some(entry) = self.deployments.get_mut(&name_str) {
            // Status writes of the control loop come back here as well, only spec changes matter.
            let spec_changed = entry.record.spec != depl.spec;
            entry.record = depl;
            if spec_changed {
                tracing::debug!(deployment = %name_str, "spec of deployment changed");
                if !entry.handle.send(DeploymentEvent::SpecUpdated).await {
                    tracing::warn!(deployment = %name_str, "deployment stopped before spec update was delivered");
                }
            }
            return;
        }

        tracing::info!(deployment = %name_str, "new deployment detected, starting its control loop");
        let name = Arc::new(name_str);
        let handle = self.launch_deployment(depl.clone());
        // Always a full listing, even when empty, so that pods lost while nothing watched are noticed.
        let pods: Vec<Pod> = self.pods_of(&name).cloned().collect();
        handle.send(DeploymentEvent::PodsRestarted(pods)).await;
        self.deployments.insert(name, DeploymentEntry { record: depl, handle });
    }

    #[tracing::instrument(level = "debug", skip(self, depl))]
    async fn deployment_deleted(&mut self, depl: ArangoDeployment) {
        let name_str = match depl.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, entry) = match self.deployments.remove_entry(name_str) {
            Some((name, entry)) => (name, entry),
            None => return,
        };
        tracing::info!(deployment = %name, "deployment deleted, stopping its control loop");
        entry.handle.delete();
        // Joined in the background so that the controller keeps making progress.
        tokio::spawn(entry.handle.join());
    }

    #[tracing::instrument(level = "debug", skip(self, depls))]
    async fn deployment_restarted(&mut self, depls: Vec<ArangoDeployment>) {
        let live: Vec<String> = depls.iter().filter_map(|depl| depl.meta().name.clone()).collect();
        let vanished: Vec<ArangoDeployment> = self
            .deployments
            .iter()
            .filter(|(name, _)| !live.contains(&**name))
            .map(|(_, entry)| entry.record.clone())
            .collect();
        for depl in depls {
            self.deployment_applied(depl).await;
        }
        for depl in vanished {
            self.deployment_deleted(depl).await;
        }
    }

    /// Spawn the control loop of the given deployment, wired to the K8s API.
    fn launch_deployment(&self, depl: ArangoDeployment) -> DeploymentHandle {
        let names = ResourceNames::new(&depl);
        let (view_tx, view_rx) = watch::channel(Arc::new(depl.clone()));
        let factory = HttpClientFactory::new(self.client.clone(), names, view_rx.clone(), self.config.database_timeout());
        let deps = Collaborators {
            store: Arc::new(KubeRecordStore::new(self.client.clone(), &self.config.namespace)),
            resources: Arc::new(KubeResources::new(self.client.clone(), &self.config.namespace)),
            clients: Arc::new(ConnectionCache::new(Arc::new(factory))),
        };
        Deployment::launch(self.config.clone(), depl, deps, view_tx, view_rx, &self.shutdown_tx)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pod Events ////////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Pod` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_pod_event(&mut self, res: EventResult<Pod>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pod k8s watcher");
                increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.pod_applied(obj).await,
            Event::Deleted(obj) => self.pod_deleted(obj).await,
            Event::Restarted(objs) => self.pod_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pod))]
    async fn pod_applied(&mut self, pod: Pod) {
        let name_str = match pod.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.pods.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &pod {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.pods.insert(name, pod.clone());
        if let Some(handle) = self.handle_of(&pod) {
            handle.send(DeploymentEvent::PodApplied(pod)).await;
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pod))]
    async fn pod_deleted(&mut self, pod: Pod) {
        let name_str = match pod.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        if self.pods.remove(name_str).is_none() {
            return;
        }
        if let Some(handle) = self.handle_of(&pod) {
            handle.send(DeploymentEvent::PodDeleted(pod)).await;
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pods))]
    async fn pod_restarted(&mut self, pods: Vec<Pod>) {
        self.pods = pods
            .into_iter()
            .filter_map(|pod| pod.meta().name.clone().map(|name| (Arc::new(name), pod)))
            .collect();

        let mut by_deployment: HashMap<Arc<String>, Vec<Pod>> =
            self.deployments.keys().map(|name| (name.clone(), vec![])).collect();
        for pod in self.pods.values() {
            if let Some(pods) = deployment_label(pod).and_then(|name| by_deployment.get_mut(name)) {
                pods.push(pod.clone());
            }
        }
        for (name, pods) in by_deployment {
            if let Some(entry) = self.deployments.get_mut(&name) {
                entry.handle.send(DeploymentEvent::PodsRestarted(pods)).await;
            }
        }
    }

    /// The handle of the deployment owning the given pod.
    fn handle_of(&mut self, pod: &Pod) -> Option<&mut DeploymentHandle> {
        let name = deployment_label(pod)?;
        self.deployments.get_mut(name).map(|entry| &mut entry.handle)
    }

    /// The known pods of the named deployment.
    fn pods_of<'a>(&'a self, name: &'a String) -> impl Iterator<Item = &'a Pod> + 'a {
        self.pods.values().filter(move |pod| deployment_label(pod) == Some(name))
    }
}

/// The name of the deployment owning the given object, taken from its labels.
fn deployment_label(pod: &Pod) -> Option<&String> {
    pod.metadata.labels.as_ref()?.get(LABEL_ARANGO_DEPLOYMENT)
}
