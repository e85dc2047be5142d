use k8s_openapi::api::core::v1::Pod;
use metrics::increment_counter;

use crate::deployment::context::PlanContext;
use crate::deployment::{Deployment, METRIC_INSPECTIONS, METRIC_INSPECTION_FAILURES};
use crate::reconcile::{create_plan, execute_plan, plan_has_scaling_actions};
use crate::resources::{build_member_pod, build_member_pvc, build_services, pod_is_ready, pod_is_terminated, releasable_finalizers};
use arango_core::crd::{ConditionType, DeploymentPhase, MemberPhase, MemberStatus, ServerGroup};
use arango_core::{AppError, AppResult};

/// The key of a bootstrap password within its secret.
const SECRET_KEY_PASSWORD: &str = "password";

impl Deployment {
    /// Inspect the deployment, returning true if work was found which needs a quick follow up.
    pub(super) async fn inspect(&mut self) -> bool {
        increment_counter!(METRIC_INSPECTIONS);
        match self.try_inspect().await {
            Ok(has_work) => has_work,
            Err(err) => {
                increment_counter!(METRIC_INSPECTION_FAILURES);
                tracing::error!(error = ?err, deployment = %self.name, "error inspecting deployment");
                false
            }
        }
    }

    async fn try_inspect(&mut self) -> AppResult<bool> {
        if self.phase() == DeploymentPhase::None && !self.bootstrap().await? {
            return Ok(false);
        }
        if self.phase() != DeploymentPhase::Running {
            return Ok(false);
        }

        let mut has_work = self.update_member_states().await?;
        has_work |= self.release_pod_finalizers().await?;

        let status = self.status();
        let pods: Vec<Pod> = self.pods.values().cloned().collect();
        let (plan, changed) = create_plan(&status.plan, self.depl.accepted_spec(), &status, &pods, &self.names);
        if changed {
            tracing::info!(deployment = %self.name, actions = plan.len(), "created new plan");
            self.write_status(|status| status.plan = plan.clone()).await?;
            has_work = true;
        }
        // Edits made through the database UI must not race with a plan changing member counts.
        self.scaling.set_enabled(!plan_has_scaling_actions(&plan));

        let needs_polling = execute_plan(&mut PlanContext::new(self)).await?;
        has_work |= needs_polling;

        has_work |= self.ensure_resources().await?;
        self.update_conditions().await?;
        Ok(has_work)
    }

    /// Update the members from the observed state of their pods.
    async fn update_member_states(&mut self) -> AppResult<bool> {
        let status = self.status();
        let mut updates: Vec<(ServerGroup, MemberStatus)> = vec![];
        for (group, member) in status.members.iter() {
            let pod_name = self.pod_name(group, member);
            let mut next = member.clone();
            match self.pods.get(&pod_name) {
                Some(pod) => {
                    if pod_is_ready(pod) {
                        next.conditions.update(ConditionType::Ready, true, "PodReady", "");
                    } else {
                        next.conditions.update(ConditionType::Ready, false, "PodNotReady", "");
                    }
                    if pod_is_terminated(pod) {
                        next.conditions.update(ConditionType::Terminated, true, "PodTerminated", "");
                    }
                }
                None if self.deleted_pods.contains(&pod_name) && matches!(member.phase, MemberPhase::Created | MemberPhase::Rotating) => {
                    tracing::info!(deployment = %self.name, member = %member.id, "pod of member is gone, recreating it");
                    next.phase = MemberPhase::None;
                    next.conditions.update(ConditionType::Ready, false, "PodDeleted", "");
                    next.conditions.remove(ConditionType::Terminated);
                }
                None => (),
            }
            if &next != member {
                updates.push((group, next));
            }
        }
        if updates.is_empty() {
            return Ok(false);
        }

        self.write_status(|status| {
            for (group, member) in updates.iter() {
                let _ = status.members.update(member.clone(), *group);
            }
        })
        .await?;
        Ok(true)
    }

    /// Release the finalizers of member pods being deleted, once losing the member is safe.
    async fn release_pod_finalizers(&mut self) -> AppResult<bool> {
        let status = self.status();
        let agents = status.members.group(ServerGroup::Agents);
        let mut released = false;
        for (group, member) in status.members.iter() {
            let pod_name = self.pod_name(group, member);
            let pod = match self.pods.get_mut(&pod_name) {
                Some(pod) => pod,
                None => continue,
            };
            let finalizers = releasable_finalizers(pod, member, agents);
            if finalizers.is_empty() {
                continue;
            }
            self.deps.resources.remove_pod_finalizers(pod, &finalizers).await?;
            tracing::info!(deployment = %self.name, member = %member.id, ?finalizers, "released finalizers of deleted pod");
            if let Some(remaining) = pod.metadata.finalizers.as_mut() {
                remaining.retain(|finalizer| !finalizers.contains(finalizer));
            }
            released = true;
        }
        Ok(released)
    }

    /// Create the objects of members which have none yet, and replace terminated pods.
    async fn ensure_resources(&mut self) -> AppResult<bool> {
        let status = self.status();
        let spec = self.depl.accepted_spec().clone();
        if !self.services_ensured {
            for service in build_services(&spec, &self.names) {
                self.deps.resources.ensure_service(&service).await?;
            }
            self.services_ensured = true;
        }

        let agents = status.members.group(ServerGroup::Agents).to_vec();
        let mut created: Vec<(ServerGroup, MemberStatus)> = vec![];
        let mut has_work = false;
        for (group, member) in status.members.iter() {
            match member.phase {
                MemberPhase::None => {
                    if group.requires_persistent_volume() {
                        let pvc = build_member_pvc(&spec, &self.names, group, member);
                        self.deps.resources.create_pvc(&pvc).await?;
                    }
                    let pod = build_member_pod(&spec, &self.names, group, member, &agents);
                    self.deps.resources.create_pod(&pod).await?;
                    tracing::info!(deployment = %self.name, member = %member.id, %group, "created pod of member");

                    let mut next = member.clone();
                    next.phase = MemberPhase::Created;
                    next.pod_name = pod.metadata.name.clone();
                    if group.requires_persistent_volume() {
                        next.persistent_volume_claim_name = Some(self.names.pvc_name(group, &member.id));
                    }
                    let pod_name = self.pod_name(group, member);
                    self.deleted_pods.remove(&pod_name);
                    created.push((group, next));
                }
                MemberPhase::Created if member.conditions.is_true(ConditionType::Terminated) => {
                    let pod_name = self.pod_name(group, member);
                    let deleting = self
                        .pods
                        .get(&pod_name)
                        .map(|pod| pod.metadata.deletion_timestamp.is_some())
                        .unwrap_or(true);
                    if !deleting {
                        tracing::info!(deployment = %self.name, member = %member.id, "pod of member has terminated, deleting it");
                        self.deps.resources.delete_pod(&pod_name).await?;
                        has_work = true;
                    }
                }
                _ => (),
            }
        }
        if created.is_empty() {
            return Ok(has_work);
        }

        self.write_status(|status| {
            for (group, member) in created.iter() {
                let _ = status.members.update(member.clone(), *group);
            }
        })
        .await?;
        Ok(true)
    }

    /// Update the conditions of the deployment as a whole.
    async fn update_conditions(&mut self) -> AppResult<()> {
        let status = self.status();
        let all_ready = {
            let mut members = status.members.iter().peekable();
            members.peek().is_some() && members.all(|(_, member)| member.is_ready())
        };
        let bootstrapped = status.conditions.is_true(ConditionType::BootstrapCompleted);
        let ready_matches = status.conditions.get(ConditionType::Ready).map(|cond| cond.status) == Some(all_ready);
        if ready_matches && (bootstrapped || !all_ready) {
            return Ok(());
        }
        if all_ready && !bootstrapped {
            self.bootstrap_users().await?;
        }

        self.write_status(|status| {
            if all_ready {
                status.conditions.update(ConditionType::Ready, true, "AllMembersReady", "");
                if !status.conditions.is_true(ConditionType::BootstrapCompleted) {
                    status.conditions.update(ConditionType::BootstrapCompleted, true, "BootstrapCompleted", "all members became ready");
                }
            } else {
                status.conditions.update(ConditionType::Ready, false, "MembersNotReady", "not all members are ready");
            }
        })
        .await?;
        if all_ready && !bootstrapped {
            tracing::info!(deployment = %self.name, "all members are ready, bootstrap completed");
        }
        Ok(())
    }

    /// Set the passwords of the bootstrap users, creating users which do not exist yet.
    async fn bootstrap_users(&mut self) -> AppResult<()> {
        let secrets = self.depl.accepted_spec().bootstrap.password_secret_names.clone();
        if secrets.is_empty() {
            return Ok(());
        }
        let client = self.deps.clients.get_database().await?;
        for (user, secret_name) in secrets.iter() {
            let password = self.deps.resources.read_secret(secret_name, SECRET_KEY_PASSWORD).await?;
            match client.create_user(user, &password).await {
                Ok(()) => tracing::info!(deployment = %self.name, %user, "created bootstrap user"),
                Err(AppError::Conflict) => {
                    client.update_user(user, &password).await?;
                    tracing::info!(deployment = %self.name, %user, "updated password of bootstrap user");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub(super) fn pod_name(&self, group: ServerGroup, member: &MemberStatus) -> String {
        member.pod_name.clone().unwrap_or_else(|| self.names.pod_name(group, &member.id))
    }
}
