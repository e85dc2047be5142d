use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use serde_json::Value;

use crate::k8s::call;
use crate::persistence::{RecordStore, WriteTarget};
use arango_core::crd::{ArangoDeployment, RequiredMetadata};
use arango_core::{AppError, AppResult};

/// A record store of deployment records backed by the K8s API.
///
/// Writes carry the resource version of the given record, so K8s rejects stale writes with a
/// conflict.
pub struct KubeRecordStore {
    api: Api<ArangoDeployment>,
}

impl KubeRecordStore {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl RecordStore<ArangoDeployment> for KubeRecordStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, name: &str) -> AppResult<ArangoDeployment> {
        call("fetching deployment", self.api.get(name)).await
    }

    #[tracing::instrument(level = "debug", skip(self, record), fields(deployment = %record.name()))]
    async fn update(&self, target: WriteTarget, record: &ArangoDeployment) -> AppResult<ArangoDeployment> {
        let params = PostParams::default();
        match target {
            WriteTarget::Spec => call("updating deployment spec", self.api.replace(record.name(), &params, record)).await,
            WriteTarget::Status => {
                let data = serde_json::to_vec(record).map_err(|err| AppError::Ise(anyhow::Error::from(err).context("error encoding deployment")))?;
                call("updating deployment status", self.api.replace_status(record.name(), &params, data)).await
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn patch(&self, name: &str, patch: Value) -> AppResult<ArangoDeployment> {
        call("patching deployment", self.api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))).await
    }
}
