//! Test fixtures and in-memory fakes of the operator's collaborators.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodCondition, PodStatus, Service};
use kube::api::ObjectMeta;
use serde_json::Value;

use crate::cluster::{ClientFactory, ClientKey, ClusterClient, NumberOfServers};
use crate::persistence::{RecordStore, WriteTarget};
use crate::reconcile::ActionContext;
use crate::resources::{EventKind, ResourceClient, ResourceNames};
use arango_core::crd::{
    Action, ArangoDeployment, ConditionType, DeploymentMode, DeploymentPhase, DeploymentSpec, DeploymentStatus, MemberPhase, MemberStatus, ServerGroup,
};
use arango_core::{AppError, AppResult};

pub const NAME: &str = "example";
pub const NAMESPACE: &str = "default";

/// A defaulted cluster spec with the given coordinator and database server counts.
pub fn cluster_spec(coordinators: u32, dbservers: u32) -> DeploymentSpec {
    let mut spec = DeploymentSpec {
        mode: DeploymentMode::Cluster,
        ..Default::default()
    };
    spec.coordinators.count = Some(coordinators);
    spec.dbservers.count = Some(dbservers);
    spec.set_defaults(NAME);
    spec
}

/// The resource names of the test deployment.
pub fn names() -> ResourceNames {
    ResourceNames {
        deployment: NAME.into(),
        namespace: NAMESPACE.into(),
        owner: None,
    }
}

/// A deployment record with the given spec and no status.
pub fn deployment(spec: DeploymentSpec) -> ArangoDeployment {
    let mut depl = ArangoDeployment::new(NAME, spec);
    depl.metadata.namespace = Some(NAMESPACE.into());
    depl.metadata.resource_version = Some("1".into());
    depl
}

/// A deployment record which has been bootstrapped with the given spec and members.
pub fn running_deployment(spec: DeploymentSpec, members: &[(ServerGroup, MemberStatus)]) -> ArangoDeployment {
    let mut status = DeploymentStatus {
        phase: DeploymentPhase::Running,
        accepted_spec: Some(spec.clone()),
        ..Default::default()
    };
    for (group, member) in members {
        status.members.add(member.clone(), *group).expect("error adding fixture member");
    }
    let mut depl = deployment(spec);
    depl.status = Some(status);
    depl
}

/// A member whose pod has been created.
pub fn member(id: &str) -> MemberStatus {
    let mut member = MemberStatus::new(id.into());
    member.phase = MemberPhase::Created;
    member
}

/// A member whose pod has been created and reports ready.
pub fn ready_member(id: &str) -> MemberStatus {
    let mut member = member(id);
    member.conditions.update(ConditionType::Ready, true, "PodReady", "");
    member
}

/// A bare pod of the given member.
pub fn member_pod(group: ServerGroup, id: &str, ready: bool) -> Pod {
    let names = names();
    Pod {
        metadata: ObjectMeta {
            name: Some(names.pod_name(group, id)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(names.member_labels(group, id)),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".into()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: if ready { "True".into() } else { "False".into() },
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

//////////////////////////////////////////////////////////////////////////////
// Record Store //////////////////////////////////////////////////////////////

/// An in-memory record store holding a single deployment.
pub struct MemoryStore {
    pub record: Mutex<ArangoDeployment>,
    /// The number of upcoming writes which are rejected as conflicting.
    pub conflicts: AtomicUsize,
    /// Reject all writes as if the record was gone.
    pub missing: AtomicBool,
    pub gets: AtomicUsize,
    pub updates: AtomicUsize,
    pub patches: Mutex<Vec<Value>>,
}

impl MemoryStore {
    pub fn new(record: ArangoDeployment) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(record),
            conflicts: AtomicUsize::new(0),
            missing: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            patches: Mutex::new(vec![]),
        })
    }

    /// A copy of the stored record.
    pub fn current(&self) -> ArangoDeployment {
        self.record.lock().expect("store lock poisoned").clone()
    }

    /// The stored status, defaulted when unset.
    pub fn status(&self) -> DeploymentStatus {
        self.current().status.unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore<ArangoDeployment> for MemoryStore {
    async fn get(&self, _name: &str) -> AppResult<ArangoDeployment> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.missing.load(Ordering::SeqCst) {
            return Err(AppError::ResourceNotFound);
        }
        Ok(self.current())
    }

    async fn update(&self, target: WriteTarget, record: &ArangoDeployment) -> AppResult<ArangoDeployment> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.missing.load(Ordering::SeqCst) {
            return Err(AppError::ResourceNotFound);
        }
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| val.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Conflict);
        }
        let mut stored = self.record.lock().expect("store lock poisoned");
        match target {
            WriteTarget::Spec => stored.spec = record.spec.clone(),
            WriteTarget::Status => stored.status = record.status.clone(),
        }
        bump_version(&mut stored);
        Ok(stored.clone())
    }

    async fn patch(&self, _name: &str, patch: Value) -> AppResult<ArangoDeployment> {
        self.patches.lock().expect("store lock poisoned").push(patch.clone());
        let mut stored = self.record.lock().expect("store lock poisoned");
        let mut doc = serde_json::to_value(&*stored).map_err(anyhow::Error::from)?;
        merge_patch(&mut doc, &patch);
        *stored = serde_json::from_value(doc).map_err(anyhow::Error::from)?;
        bump_version(&mut stored);
        Ok(stored.clone())
    }
}

fn bump_version(record: &mut ArangoDeployment) {
    let version: u64 = record.metadata.resource_version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
    record.metadata.resource_version = Some((version + 1).to_string());
}

/// Apply a JSON merge patch to the given document.
fn merge_patch(doc: &mut Value, patch: &Value) {
    match (doc, patch) {
        (Value::Object(doc), Value::Object(patch)) => {
            for (key, val) in patch {
                if val.is_null() {
                    doc.remove(key);
                } else {
                    merge_patch(doc.entry(key.clone()).or_insert(Value::Null), val);
                }
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}

//////////////////////////////////////////////////////////////////////////////
// Resource Client ///////////////////////////////////////////////////////////

/// A resource client which records all calls.
#[derive(Default)]
pub struct FakeResources {
    pub pods_created: Mutex<Vec<Pod>>,
    pub pods_deleted: Mutex<Vec<String>>,
    pub pvcs_created: Mutex<Vec<PersistentVolumeClaim>>,
    pub pvcs_deleted: Mutex<Vec<String>>,
    pub services: Mutex<Vec<Service>>,
    pub finalizers_removed: Mutex<Vec<String>>,
    pub pod_finalizers_removed: Mutex<Vec<(String, Vec<String>)>>,
    pub events: Mutex<Vec<(EventKind, String, String)>>,
    /// Secrets by name, holding their data by key.
    pub secrets: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl FakeResources {
    pub fn event_reasons(&self) -> Vec<String> {
        self.events.lock().expect("lock poisoned").iter().map(|(_, reason, _)| reason.clone()).collect()
    }
}

#[async_trait]
impl ResourceClient for FakeResources {
    async fn create_pod(&self, pod: &Pod) -> AppResult<()> {
        self.pods_created.lock().expect("lock poisoned").push(pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> AppResult<()> {
        self.pods_deleted.lock().expect("lock poisoned").push(name.into());
        Ok(())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> AppResult<()> {
        self.pvcs_created.lock().expect("lock poisoned").push(pvc.clone());
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> AppResult<()> {
        self.pvcs_deleted.lock().expect("lock poisoned").push(name.into());
        Ok(())
    }

    async fn ensure_service(&self, service: &Service) -> AppResult<()> {
        self.services.lock().expect("lock poisoned").push(service.clone());
        Ok(())
    }

    async fn remove_pod_finalizers(&self, pod: &Pod, finalizers: &[String]) -> AppResult<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pod_finalizers_removed.lock().expect("lock poisoned").push((name, finalizers.to_vec()));
        Ok(())
    }

    async fn read_secret(&self, name: &str, key: &str) -> AppResult<String> {
        let secrets = self.secrets.lock().expect("lock poisoned");
        let secret = secrets.get(name).ok_or(AppError::ResourceNotFound)?;
        secret
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::InvalidInput(format!("secret {} has no {} key", name, key)))
    }

    async fn remove_finalizers(&self, deployment: &str) -> AppResult<()> {
        self.finalizers_removed.lock().expect("lock poisoned").push(deployment.into());
        Ok(())
    }

    async fn record_event(&self, _deployment: &ArangoDeployment, kind: EventKind, reason: &str, message: &str) -> AppResult<()> {
        self.events.lock().expect("lock poisoned").push((kind, reason.into(), message.into()));
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Cluster Clients ///////////////////////////////////////////////////////////

/// A cluster client backed by in-memory state, recording all calls.
#[derive(Default)]
pub struct FakeClusterClient {
    /// Reject all calls as unauthorized.
    pub unauthorized: AtomicBool,
    /// Fail all calls as if the server was unreachable.
    pub unavailable: AtomicBool,
    /// Fail only writes of the server counts.
    pub fail_set_counts: AtomicBool,
    pub server_counts: Mutex<NumberOfServers>,
    pub maintenance: AtomicBool,
    pub cleaned_out: AtomicBool,
    /// Database users with their passwords.
    pub users: Mutex<BTreeMap<String, String>>,
    pub calls: Mutex<Vec<String>>,
    /// Run once right after the next successful write of the server counts.
    pub after_set_counts: Mutex<Option<Box<dyn FnOnce(&FakeClusterClient) + Send>>>,
}

impl FakeClusterClient {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    /// Set the server counts as if edited through the database UI.
    pub fn set_counts(&self, counts: NumberOfServers) {
        *self.server_counts.lock().expect("lock poisoned") = counts;
    }

    pub fn counts(&self) -> NumberOfServers {
        *self.server_counts.lock().expect("lock poisoned")
    }

    fn call(&self, op: String) -> AppResult<()> {
        self.calls.lock().expect("lock poisoned").push(op);
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(AppError::Unauthorized);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Timeout("contacting server"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn version(&self) -> AppResult<String> {
        self.call("version".into())?;
        Ok("3.8.0".into())
    }

    async fn get_server_counts(&self) -> AppResult<NumberOfServers> {
        self.call("get_server_counts".into())?;
        Ok(self.counts())
    }

    async fn set_server_counts(&self, counts: NumberOfServers) -> AppResult<()> {
        self.call(format!("set_server_counts {}", counts))?;
        if self.fail_set_counts.load(Ordering::SeqCst) {
            return Err(AppError::Timeout("setting server counts"));
        }
        self.set_counts(counts);
        let hook = self.after_set_counts.lock().expect("lock poisoned").take();
        if let Some(hook) = hook {
            hook(self);
        }
        Ok(())
    }

    async fn get_maintenance_mode(&self) -> AppResult<bool> {
        self.call("get_maintenance_mode".into())?;
        Ok(self.maintenance.load(Ordering::SeqCst))
    }

    async fn set_maintenance_mode(&self, enabled: bool) -> AppResult<()> {
        self.call(format!("set_maintenance_mode {}", enabled))?;
        self.maintenance.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn clean_out_server(&self, server_id: &str) -> AppResult<String> {
        self.call(format!("clean_out_server {}", server_id))?;
        Ok(format!("job-{}", server_id))
    }

    async fn is_cleaned_out(&self, server_id: &str) -> AppResult<bool> {
        self.call(format!("is_cleaned_out {}", server_id))?;
        Ok(self.cleaned_out.load(Ordering::SeqCst))
    }

    async fn create_user(&self, user: &str, password: &str) -> AppResult<()> {
        self.call(format!("create_user {}", user))?;
        let mut users = self.users.lock().expect("lock poisoned");
        if users.contains_key(user) {
            return Err(AppError::Conflict);
        }
        users.insert(user.into(), password.into());
        Ok(())
    }

    async fn update_user(&self, user: &str, password: &str) -> AppResult<()> {
        self.call(format!("update_user {}", user))?;
        match self.users.lock().expect("lock poisoned").get_mut(user) {
            Some(current) => {
                *current = password.into();
                Ok(())
            }
            None => Err(AppError::ResourceNotFound),
        }
    }

    async fn shutdown(&self, remove_from_cluster: bool) -> AppResult<()> {
        self.call(format!("shutdown {}", remove_from_cluster))
    }
}

/// A client factory handing out fake clients.
///
/// With a shared client every key gets the same client, otherwise a fresh client is created on
/// every call.
#[derive(Default)]
pub struct FakeFactory {
    pub shared: Option<Arc<FakeClusterClient>>,
    pub created: Mutex<Vec<(ClientKey, Arc<FakeClusterClient>)>>,
}

impl FakeFactory {
    pub fn shared(client: Arc<FakeClusterClient>) -> Arc<Self> {
        Arc::new(Self {
            shared: Some(client),
            created: Default::default(),
        })
    }

    pub fn created(&self) -> Vec<(ClientKey, Arc<FakeClusterClient>)> {
        self.created.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(&self, key: &ClientKey) -> AppResult<Arc<dyn ClusterClient>> {
        let client = self.shared.clone().unwrap_or_default();
        self.created.lock().expect("lock poisoned").push((key.clone(), client.clone()));
        Ok(client as Arc<dyn ClusterClient>)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Action Context ////////////////////////////////////////////////////////////

/// An action context over an in-memory status.
pub struct FakeContext {
    pub names: ResourceNames,
    pub status: DeploymentStatus,
    pub client: Arc<FakeClusterClient>,
    pub pods: Mutex<HashSet<String>>,
    pub pods_deleted: Mutex<Vec<String>>,
    pub pvcs_deleted: Mutex<Vec<String>>,
    pub events: Mutex<Vec<(EventKind, String)>>,
    pub plan_writes: usize,
}

impl FakeContext {
    /// A context with the given members, all of which have a pod.
    pub fn new(members: &[(ServerGroup, MemberStatus)], plan: Vec<Action>) -> Self {
        let names = names();
        let mut status = DeploymentStatus {
            phase: DeploymentPhase::Running,
            plan,
            ..Default::default()
        };
        let mut pods = HashSet::new();
        for (group, member) in members {
            status.members.add(member.clone(), *group).expect("error adding fixture member");
            pods.insert(names.pod_name(*group, &member.id));
        }
        Self {
            names,
            status,
            client: Arc::new(FakeClusterClient::default()),
            pods: Mutex::new(pods),
            pods_deleted: Default::default(),
            pvcs_deleted: Default::default(),
            events: Default::default(),
            plan_writes: 0,
        }
    }

    pub fn member(&self, id: &str) -> Option<MemberStatus> {
        self.status.members.element_by_id(id).map(|(_, member)| member.clone())
    }
}

#[async_trait]
impl ActionContext for FakeContext {
    fn names(&self) -> &ResourceNames {
        &self.names
    }

    async fn database_client(&self) -> AppResult<Arc<dyn ClusterClient>> {
        Ok(self.client.clone() as Arc<dyn ClusterClient>)
    }

    async fn agency_client(&self) -> AppResult<Arc<dyn ClusterClient>> {
        Ok(self.client.clone() as Arc<dyn ClusterClient>)
    }

    async fn member_client(&self, _group: ServerGroup, _id: &str) -> AppResult<Arc<dyn ClusterClient>> {
        Ok(self.client.clone() as Arc<dyn ClusterClient>)
    }

    fn member_status_by_id(&self, id: &str) -> Option<(ServerGroup, MemberStatus)> {
        self.status.members.element_by_id(id).map(|(group, member)| (group, member.clone()))
    }

    fn pod_exists(&self, name: &str) -> bool {
        self.pods.lock().expect("lock poisoned").contains(name)
    }

    async fn create_member(&mut self, group: ServerGroup) -> AppResult<String> {
        let id = self.status.members.new_member_id(group);
        self.status.members.add(MemberStatus::new(id.clone()), group)?;
        Ok(id)
    }

    async fn update_member(&mut self, group: ServerGroup, member: MemberStatus) -> AppResult<()> {
        self.status.members.update(member, group)
    }

    async fn remove_member_by_id(&mut self, id: &str) -> AppResult<()> {
        match self.status.members.element_by_id(id).map(|(group, _)| group) {
            Some(group) => self.status.members.remove_by_id(id, group),
            None => Ok(()),
        }
    }

    async fn delete_pod(&self, name: &str) -> AppResult<()> {
        self.pods.lock().expect("lock poisoned").remove(name);
        self.pods_deleted.lock().expect("lock poisoned").push(name.into());
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> AppResult<()> {
        self.pvcs_deleted.lock().expect("lock poisoned").push(name.into());
        Ok(())
    }

    fn plan(&self) -> Vec<Action> {
        self.status.plan.clone()
    }

    async fn set_plan(&mut self, plan: Vec<Action>) -> AppResult<()> {
        self.plan_writes += 1;
        self.status.plan = plan;
        Ok(())
    }

    async fn record_event(&self, kind: EventKind, reason: &str, _message: &str) {
        self.events.lock().expect("lock poisoned").push((kind, reason.into()));
    }
}
