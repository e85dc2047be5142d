use crate::deployment::context::new_member;
use crate::deployment::Deployment;
use crate::persistence::{update_with_retry, WriteTarget};
use crate::resources::EventKind;
use arango_core::crd::{ArangoDeployment, DeploymentPhase, DeploymentSpec, ServerGroup};
use arango_core::{AppError, AppResult};

impl Deployment {
    /// Initialize a deployment which has no status yet.
    ///
    /// Returns false if the spec was rejected, in which case the deployment stays uninitialized.
    pub(super) async fn bootstrap(&mut self) -> AppResult<bool> {
        let mut spec = self.depl.spec.clone();
        spec.set_defaults(&self.name);
        if let Err(err) = spec.validate() {
            let reason = format!("invalid spec: {}", err);
            let current = self.depl.status.as_ref().and_then(|status| status.reason.as_deref());
            if current != Some(reason.as_str()) {
                tracing::warn!(deployment = %self.name, %reason, "rejecting deployment");
                self.record_event(EventKind::Warning, "InvalidSpec", &reason).await;
                self.write_status(|status| status.reason = Some(reason.clone())).await?;
            }
            return Ok(false);
        }

        if spec != self.depl.spec {
            self.write_spec(spec.clone(), false).await?;
        }
        let names = self.names.clone();
        self.write_status(|status| {
            for group in ServerGroup::ALL {
                if !spec.is_group_used(group) {
                    continue;
                }
                let desired = spec.group_spec(group).count() as usize;
                while status.members.group(group).len() < desired {
                    let id = status.members.new_member_id(group);
                    let _ = status.members.add(new_member(&names, group, id), group);
                }
            }
            status.accepted_spec = Some(spec.clone());
            status.phase = DeploymentPhase::Running;
            status.reason = None;
        })
        .await?;
        tracing::info!(deployment = %self.name, mode = %spec.mode, "deployment bootstrapped");
        self.scaling.queue_update(spec).await;
        Ok(true)
    }

    /// Handle an update of the deployment's spec.
    ///
    /// A valid spec becomes the new accepted spec. An invalid one is reported and reverted to the
    /// accepted spec.
    pub(super) async fn handle_spec_update(&mut self) -> AppResult<()> {
        let current = match self.deps.store.get(&self.name).await {
            Ok(current) => current,
            Err(AppError::ResourceNotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.set_record(current);
        let accepted = match self.depl.status.as_ref().and_then(|status| status.accepted_spec.clone()) {
            Some(accepted) => accepted,
            None => {
                self.trigger_inspection();
                return Ok(());
            }
        };

        let mut spec = self.depl.spec.clone();
        spec.set_defaults_from(&accepted);
        spec.set_defaults(&self.name);
        let reset = accepted.reset_immutable_fields(&mut spec);
        if !reset.is_empty() {
            let message = format!("fields cannot be changed after creation: {}", reset.join(", "));
            tracing::warn!(deployment = %self.name, %message, "resetting immutable fields");
            self.record_event(EventKind::Warning, "ImmutableFieldsReset", &message).await;
            self.write_spec(spec.clone(), true).await?;
        }

        if let Err(err) = spec.validate() {
            let message = format!("spec update rejected, restoring the last accepted spec: {}", err);
            tracing::warn!(deployment = %self.name, %message);
            self.record_event(EventKind::Warning, "InvalidSpec", &message).await;
            self.write_spec(accepted, true).await?;
            return Ok(());
        }

        if spec != accepted {
            tracing::info!(deployment = %self.name, "accepted spec update");
            self.write_status(|status| status.accepted_spec = Some(spec.clone())).await?;
            self.scaling.queue_update(spec).await;
        }
        self.trigger_inspection();
        Ok(())
    }

    /// Replace the spec of the deployment record.
    async fn write_spec(&mut self, spec: DeploymentSpec, force: bool) -> AppResult<()> {
        let updated = update_with_retry(
            self.deps.store.as_ref(),
            &self.name,
            WriteTarget::Spec,
            self.depl.clone(),
            force,
            |record: &mut ArangoDeployment| record.spec = spec.clone(),
        )
        .await?;
        self.set_record(updated);
        Ok(())
    }
}
