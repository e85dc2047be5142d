use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::watch;

use crate::cluster::ClusterClient;
use crate::deployment::{publish, write_status, Collaborators, Deployment};
use crate::reconcile::ActionContext;
use crate::resources::{EventKind, ResourceNames};
use arango_core::crd::{Action, ArangoDeployment, DeploymentStatus, MemberStatus, ServerGroup};
use arango_core::{AppError, AppResult};

/// A new member of the given group, named after the objects it will own.
pub(super) fn new_member(names: &ResourceNames, group: ServerGroup, id: String) -> MemberStatus {
    let mut member = MemberStatus::new(id);
    member.pod_name = Some(names.pod_name(group, &member.id));
    if group.requires_persistent_volume() {
        member.persistent_volume_claim_name = Some(names.pvc_name(group, &member.id));
    }
    member
}

/// The capabilities of a deployment handed to the plan executor.
pub(super) struct PlanContext<'a> {
    name: &'a str,
    names: &'a ResourceNames,
    deps: &'a Collaborators,
    pods: &'a HashMap<String, Pod>,
    depl: &'a mut ArangoDeployment,
    view_tx: &'a watch::Sender<Arc<ArangoDeployment>>,
}

impl<'a> PlanContext<'a> {
    pub(super) fn new(deployment: &'a mut Deployment) -> Self {
        Self {
            name: &deployment.name,
            names: &deployment.names,
            deps: &deployment.deps,
            pods: &deployment.pods,
            depl: &mut deployment.depl,
            view_tx: &deployment.view_tx,
        }
    }

    async fn write<F>(&mut self, modify: F) -> AppResult<()>
    where
        F: FnMut(&mut DeploymentStatus) + Send,
    {
        write_status(self.deps.store.as_ref(), self.depl, modify).await?;
        publish(self.view_tx, &*self.depl);
        Ok(())
    }
}

#[async_trait]
impl<'a> ActionContext for PlanContext<'a> {
    fn names(&self) -> &ResourceNames {
        self.names
    }

    async fn database_client(&self) -> AppResult<Arc<dyn ClusterClient>> {
        self.deps.clients.get_database().await
    }

    async fn agency_client(&self) -> AppResult<Arc<dyn ClusterClient>> {
        self.deps.clients.get_agency().await
    }

    async fn member_client(&self, group: ServerGroup, id: &str) -> AppResult<Arc<dyn ClusterClient>> {
        self.deps.clients.get_member(group, id).await
    }

    fn member_status_by_id(&self, id: &str) -> Option<(ServerGroup, MemberStatus)> {
        self.depl
            .status
            .as_ref()
            .and_then(|status| status.members.element_by_id(id))
            .map(|(group, member)| (group, member.clone()))
    }

    fn pod_exists(&self, name: &str) -> bool {
        self.pods.contains_key(name)
    }

    async fn create_member(&mut self, group: ServerGroup) -> AppResult<String> {
        let id = self.depl.status.get_or_insert_with(Default::default).members.new_member_id(group);
        let member = new_member(self.names, group, id.clone());
        self.write(|status| {
            if !status.members.contains_id(&member.id) {
                let _ = status.members.add(member.clone(), group);
            }
        })
        .await?;
        Ok(id)
    }

    async fn update_member(&mut self, group: ServerGroup, member: MemberStatus) -> AppResult<()> {
        let mut found = true;
        self.write(|status| found = status.members.update(member.clone(), group).is_ok()).await?;
        if !found {
            return Err(AppError::ResourceNotFound);
        }
        Ok(())
    }

    async fn remove_member_by_id(&mut self, id: &str) -> AppResult<()> {
        self.write(|status| {
            if let Some(group) = status.members.element_by_id(id).map(|(group, _)| group) {
                let _ = status.members.remove_by_id(id, group);
            }
        })
        .await
    }

    async fn delete_pod(&self, name: &str) -> AppResult<()> {
        self.deps.resources.delete_pod(name).await
    }

    async fn delete_pvc(&self, name: &str) -> AppResult<()> {
        self.deps.resources.delete_pvc(name).await
    }

    fn plan(&self) -> Vec<Action> {
        self.depl.status.as_ref().map(|status| status.plan.clone()).unwrap_or_default()
    }

    async fn set_plan(&mut self, plan: Vec<Action>) -> AppResult<()> {
        self.write(|status| status.plan = plan.clone()).await
    }

    async fn record_event(&self, kind: EventKind, reason: &str, message: &str) {
        if let Err(err) = self.deps.resources.record_event(&*self.depl, kind, reason, message).await {
            tracing::error!(error = ?err, deployment = %self.name, reason, "error recording event");
        }
    }
}
