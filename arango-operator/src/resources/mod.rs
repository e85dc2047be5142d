//! Kubernetes resources owned by a deployment.
//!
//! This module only builds and inspects objects. Creating and deleting them in the cluster goes
//! through the `ResourceClient` trait, which is implemented on top of the K8s API in
//! `crate::k8s::resources`.

mod args;
mod pods;
mod services;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use arango_core::crd::{ArangoDeployment, RequiredMetadata, ServerGroup};
use arango_core::{AppResult, LABEL_ARANGO_DEPLOYMENT, LABEL_MEMBER_ID, LABEL_ROLE};

pub use args::member_args;
pub use pods::{build_member_pod, build_member_pvc, pod_is_ready, pod_is_terminated, pod_needs_rotation, releasable_finalizers, CONTAINER_NAME};
pub use services::build_services;

/// The port served by every database server.
pub const ARANGO_PORT: i32 = 8529;
/// The port served by every sync server.
pub const ARANGOSYNC_PORT: i32 = 8629;

/// The name of the app used by the operator.
pub const APP_NAME: &str = "arango-operator";

/// The kind of a diagnostic event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Lifecycle operations on the Kubernetes objects of a deployment.
///
/// Creating an object which already exists and deleting one which is already gone both succeed.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create the given pod.
    async fn create_pod(&self, pod: &Pod) -> AppResult<()>;

    /// Delete the named pod, removing its finalizers first.
    async fn delete_pod(&self, name: &str) -> AppResult<()>;

    /// Create the given persistent volume claim.
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> AppResult<()>;

    /// Delete the named persistent volume claim, removing its finalizers first.
    async fn delete_pvc(&self, name: &str) -> AppResult<()>;

    /// Create the given service if it does not exist yet.
    async fn ensure_service(&self, service: &Service) -> AppResult<()>;

    /// Remove the given finalizers from the given pod. A missing pod is not an error.
    async fn remove_pod_finalizers(&self, pod: &Pod, finalizers: &[String]) -> AppResult<()>;

    /// Read the value stored under the given key of the named secret.
    async fn read_secret(&self, name: &str, key: &str) -> AppResult<String>;

    /// Remove the operator's finalizers from all pods and claims of the named deployment.
    async fn remove_finalizers(&self, deployment: &str) -> AppResult<()>;

    /// Record a diagnostic event against the given deployment.
    async fn record_event(&self, deployment: &ArangoDeployment, kind: EventKind, reason: &str, message: &str) -> AppResult<()>;
}

/// Build the reference which makes the given deployment the controlling owner of an object.
///
/// Returns `None` for deployments which were not yet assigned a UID by the API server.
fn controller_owner_ref(depl: &ArangoDeployment) -> Option<OwnerReference> {
    let meta = depl.meta();
    Some(OwnerReference {
        api_version: ArangoDeployment::api_version(&()).into_owned(),
        kind: ArangoDeployment::kind(&()).into_owned(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Naming of the objects and addresses of one deployment.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceNames {
    /// The name of the deployment.
    pub deployment: String,
    /// The namespace of the deployment.
    pub namespace: String,
    /// The owner reference placed on all created objects.
    pub owner: Option<OwnerReference>,
}

impl ResourceNames {
    /// Create a new instance for the given deployment.
    pub fn new(depl: &ArangoDeployment) -> Self {
        Self {
            deployment: depl.name().into(),
            namespace: depl.namespace().into(),
            owner: controller_owner_ref(depl),
        }
    }

    /// The name of the pod of the given member.
    pub fn pod_name(&self, group: ServerGroup, id: &str) -> String {
        format!("{}-{}-{}", self.deployment, group.as_role(), id)
    }

    /// The name of the persistent volume claim of the given member.
    pub fn pvc_name(&self, group: ServerGroup, id: &str) -> String {
        self.pod_name(group, id)
    }

    /// The name of the headless service which gives every member a DNS name.
    pub fn headless_service_name(&self) -> String {
        format!("{}-int", self.deployment)
    }

    /// The name of the service used by database clients.
    pub fn client_service_name(&self) -> String {
        self.deployment.clone()
    }

    /// The DNS name of the given member.
    pub fn member_dns_name(&self, group: ServerGroup, id: &str) -> String {
        format!("{}.{}.{}.svc", self.pod_name(group, id), self.headless_service_name(), self.namespace)
    }

    /// The DNS name of the client service.
    pub fn client_dns_name(&self) -> String {
        format!("{}.{}.svc", self.client_service_name(), self.namespace)
    }

    /// The labels placed on all objects of this deployment.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        set_cannonical_labels(&mut labels);
        labels.insert(LABEL_ARANGO_DEPLOYMENT.into(), self.deployment.clone());
        labels
    }

    /// The labels placed on the objects of the given member.
    pub fn member_labels(&self, group: ServerGroup, id: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(LABEL_ROLE.into(), group.as_role().into());
        labels.insert(LABEL_MEMBER_ID.into(), id.into());
        labels
    }
}

/// Set the cannonical labels on an object controlled by the operator.
fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "arangodb".into());
    labels.insert("arangodb.com/controlled-by".into(), APP_NAME.into());
}
