use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event as K8sEvent, EventSource, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::k8s::call;
use crate::resources::{EventKind, ResourceClient, APP_NAME};
use arango_core::crd::{ArangoDeployment, RequiredMetadata};
use arango_core::{AppError, AppResult, LABEL_ARANGO_DEPLOYMENT};

/// The lifecycle of a deployment's objects, backed by the K8s API.
pub struct KubeResources {
    client: Client,
    namespace: String,
}

impl KubeResources {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Clear the finalizers of the named object, tolerating its absence.
    async fn clear_finalizers<K>(&self, api: &Api<K>, name: &str) -> AppResult<()>
    where
        K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let patch = json!({"metadata": {"finalizers": null}});
        match call("clearing finalizers", api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))).await {
            Ok(_) | Err(AppError::ResourceNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Delete the named object after clearing its finalizers, tolerating its absence.
    async fn delete<K>(&self, name: &str) -> AppResult<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = self.api();
        self.clear_finalizers(&api, name).await?;
        match call("deleting object", api.delete(name, &DeleteParams::default())).await {
            Ok(_) | Err(AppError::ResourceNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Treat an object which already exists as created.
fn tolerate_conflict<T>(res: AppResult<T>) -> AppResult<()> {
    match res {
        Ok(_) | Err(AppError::Conflict) => Ok(()),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ResourceClient for KubeResources {
    #[tracing::instrument(level = "debug", skip(self, pod), fields(pod = ?pod.metadata.name))]
    async fn create_pod(&self, pod: &Pod) -> AppResult<()> {
        let api: Api<Pod> = self.api();
        tolerate_conflict(call("creating pod", api.create(&PostParams::default(), pod)).await)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_pod(&self, name: &str) -> AppResult<()> {
        self.delete::<Pod>(name).await
    }

    #[tracing::instrument(level = "debug", skip(self, pvc), fields(pvc = ?pvc.metadata.name))]
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> AppResult<()> {
        let api: Api<PersistentVolumeClaim> = self.api();
        tolerate_conflict(call("creating persistent volume claim", api.create(&PostParams::default(), pvc)).await)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_pvc(&self, name: &str) -> AppResult<()> {
        self.delete::<PersistentVolumeClaim>(name).await
    }

    #[tracing::instrument(level = "debug", skip(self, service), fields(service = ?service.metadata.name))]
    async fn ensure_service(&self, service: &Service) -> AppResult<()> {
        let api: Api<Service> = self.api();
        let name = service.metadata.name.clone().unwrap_or_default();
        match call("fetching service", api.get(&name)).await {
            Ok(_) => Ok(()),
            Err(AppError::ResourceNotFound) => tolerate_conflict(call("creating service", api.create(&PostParams::default(), service)).await),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pod), fields(pod = ?pod.metadata.name))]
    async fn remove_pod_finalizers(&self, pod: &Pod, finalizers: &[String]) -> AppResult<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let remaining: Vec<&String> = pod
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|finalizer| !finalizers.contains(*finalizer))
            .collect();
        // The resource version makes the patch fail on a pod changed since it was observed.
        let patch = json!({"metadata": {"finalizers": remaining, "resourceVersion": pod.metadata.resource_version}});
        let api: Api<Pod> = self.api();
        // A conflict means the pod changed meanwhile, it is looked at again once observed.
        match call("removing pod finalizers", api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))).await {
            Ok(_) | Err(AppError::ResourceNotFound) | Err(AppError::Conflict) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn read_secret(&self, name: &str, key: &str) -> AppResult<String> {
        let api: Api<Secret> = self.api();
        let secret = call("fetching secret", api.get(name)).await?;
        let value = secret
            .data
            .and_then(|mut data| data.remove(key))
            .ok_or_else(|| AppError::InvalidInput(format!("secret {} has no {} key", name, key)))?;
        String::from_utf8(value.0).map_err(|_| AppError::InvalidInput(format!("key {} of secret {} is not valid UTF-8", key, name)))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn remove_finalizers(&self, deployment: &str) -> AppResult<()> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_ARANGO_DEPLOYMENT, deployment));
        let pods: Api<Pod> = self.api();
        for pod in call("listing pods", pods.list(&params)).await?.items {
            if let Some(name) = pod.metadata.name.as_deref() {
                self.clear_finalizers(&pods, name).await?;
            }
        }
        let pvcs: Api<PersistentVolumeClaim> = self.api();
        for pvc in call("listing persistent volume claims", pvcs.list(&params)).await?.items {
            if let Some(name) = pvc.metadata.name.as_deref() {
                self.clear_finalizers(&pvcs, name).await?;
            }
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, depl, message), fields(deployment = %depl.name()))]
    async fn record_event(&self, depl: &ArangoDeployment, kind: EventKind, reason: &str, message: &str) -> AppResult<()> {
        let now = Time(Utc::now());
        let event = K8sEvent {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", depl.name())),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            involved_object: depl.object_ref(&()),
            type_: Some(kind.as_str().into()),
            reason: Some(reason.into()),
            message: Some(message.into()),
            source: Some(EventSource {
                component: Some(APP_NAME.into()),
                host: None,
            }),
            reporting_component: Some(APP_NAME.into()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };
        let api: Api<K8sEvent> = self.api();
        call("recording event", api.create(&PostParams::default(), &event)).await?;
        Ok(())
    }
}
