use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use arango_core::crd::{Action, ActionType, ConditionType, MemberPhase, MemberStatus, ServerGroup};
use arango_core::{AppError, AppResult};

use crate::cluster::ClusterClient;
use crate::resources::{EventKind, ResourceNames};

const METRIC_ACTIONS_COMPLETED: &str = "arango_operator_actions_completed";
const METRIC_ACTIONS_TIMED_OUT: &str = "arango_operator_actions_timed_out";

/// Register the metrics of this module.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_ACTIONS_COMPLETED, metrics::Unit::Count, "number of plan actions completed");
    metrics::register_counter!(METRIC_ACTIONS_TIMED_OUT, metrics::Unit::Count, "number of plan actions which timed out");
}

/// The capabilities available to action handlers.
///
/// Every mutating method persists its change before returning, so the state seen by the next
/// handler is the durable state.
#[async_trait]
pub trait ActionContext: Send + Sync {
    /// The naming of the deployment's objects.
    fn names(&self) -> &ResourceNames;

    /// Get a client of the deployment as a whole.
    async fn database_client(&self) -> AppResult<Arc<dyn ClusterClient>>;

    /// Get a client of the agency.
    async fn agency_client(&self) -> AppResult<Arc<dyn ClusterClient>>;

    /// Get a client of the given member.
    async fn member_client(&self, group: ServerGroup, id: &str) -> AppResult<Arc<dyn ClusterClient>>;

    /// Find the member with the given ID, along with its group.
    fn member_status_by_id(&self, id: &str) -> Option<(ServerGroup, MemberStatus)>;

    /// Check if the named pod is known to exist.
    fn pod_exists(&self, name: &str) -> bool;

    /// Create a new member in the given group, returning its ID.
    async fn create_member(&mut self, group: ServerGroup) -> AppResult<String>;

    /// Replace the status of the given member.
    async fn update_member(&mut self, group: ServerGroup, member: MemberStatus) -> AppResult<()>;

    /// Remove the member with the given ID.
    async fn remove_member_by_id(&mut self, id: &str) -> AppResult<()>;

    /// Delete the named pod. A missing pod is not an error.
    async fn delete_pod(&self, name: &str) -> AppResult<()>;

    /// Delete the named persistent volume claim. A missing claim is not an error.
    async fn delete_pvc(&self, name: &str) -> AppResult<()>;

    /// The current plan.
    fn plan(&self) -> Vec<Action>;

    /// Replace the current plan.
    async fn set_plan(&mut self, plan: Vec<Action>) -> AppResult<()>;

    /// Record a diagnostic event against the deployment. Failures are only logged.
    async fn record_event(&self, kind: EventKind, reason: &str, message: &str);
}

/// Drain the plan of the given context as far as possible.
///
/// Returns true when the head action is still in progress and needs to be polled again.
pub async fn execute_plan<C: ActionContext + ?Sized>(ctx: &mut C) -> AppResult<bool> {
    loop {
        let mut plan = ctx.plan();
        let mut action = match plan.first() {
            Some(action) => action.clone(),
            None => return Ok(false),
        };

        let started = match action.start_time {
            Some(started) => started,
            None => {
                // Starts which keep failing count against the timeout of the action.
                if let Some(failed) = action.start_failed_time {
                    if abandon_if_timed_out(ctx, &action, failed).await? {
                        return Ok(true);
                    }
                }
                tracing::info!(action = %action.type_, group = %action.group, member = action.member_id(), "starting action");
                let done = match start_action(ctx, &action).await {
                    Ok(done) => done,
                    Err(err) => {
                        if action.type_.timeout().is_some() && action.start_failed_time.is_none() {
                            action.start_failed_time = Some(Utc::now());
                            plan[0] = action;
                            ctx.set_plan(plan).await?;
                        }
                        return Err(err);
                    }
                };
                if done {
                    plan.remove(0);
                    ctx.set_plan(plan).await?;
                    metrics::increment_counter!(METRIC_ACTIONS_COMPLETED);
                    continue;
                }
                action.start_time = Some(Utc::now());
                plan[0] = action;
                ctx.set_plan(plan).await?;
                return Ok(true);
            }
        };

        if abandon_if_timed_out(ctx, &action, started).await? {
            return Ok(true);
        }

        if !check_progress(ctx, &action).await? {
            return Ok(true);
        }
        tracing::info!(action = %action.type_, group = %action.group, member = action.member_id(), "action finished");
        plan.remove(0);
        ctx.set_plan(plan).await?;
        metrics::increment_counter!(METRIC_ACTIONS_COMPLETED);
    }
}

/// Drop the plan if the given action has been running for longer than its timeout.
async fn abandon_if_timed_out<C: ActionContext + ?Sized>(ctx: &mut C, action: &Action, since: DateTime<Utc>) -> AppResult<bool> {
    let timeout = match action.type_.timeout() {
        Some(timeout) => timeout,
        None => return Ok(false),
    };
    let elapsed = (Utc::now() - since).to_std().unwrap_or_default();
    if elapsed <= timeout {
        return Ok(false);
    }
    tracing::warn!(action = %action.type_, member = action.member_id(), ?elapsed, "action timed out, abandoning plan");
    let msg = format!("action {} on member {} did not finish within {:?}", action.type_, action.member_id(), timeout);
    ctx.record_event(EventKind::Warning, "ActionTimeout", &msg).await;
    // A pending release of the agency's maintenance mode survives, the supervision must not stay off.
    let remaining: Vec<Action> = ctx
        .plan()
        .into_iter()
        .skip(1)
        .filter(|queued| queued.type_ == ActionType::DisableMaintenance)
        .take(1)
        .map(|mut queued| {
            queued.start_time = None;
            queued.start_failed_time = None;
            queued
        })
        .collect();
    ctx.set_plan(remaining).await?;
    metrics::increment_counter!(METRIC_ACTIONS_TIMED_OUT);
    Ok(true)
}

/// Perform the side effect of the given action, returning true if it is already done.
async fn start_action<C: ActionContext + ?Sized>(ctx: &mut C, action: &Action) -> AppResult<bool> {
    match action.type_ {
        ActionType::AddMember => {
            let id = ctx.create_member(action.group).await?;
            tracing::info!(group = %action.group, member = %id, "added member");
            Ok(true)
        }
        ActionType::RemoveMember => {
            let (group, member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            ctx.delete_pod(&pod_name(ctx.names(), group, &member)).await?;
            if group.requires_persistent_volume() {
                ctx.delete_pvc(&pvc_name(ctx.names(), group, &member)).await?;
            }
            ctx.remove_member_by_id(&member.id).await?;
            Ok(true)
        }
        ActionType::CleanOutMember => {
            let (group, mut member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            if member.conditions.is_true(ConditionType::CleanedOut) {
                return Ok(true);
            }
            let client = ctx.database_client().await?;
            let job_id = client.clean_out_server(&member.id).await?;
            tracing::info!(member = %member.id, job = %job_id, "clean out of member started");
            member.cleanout_job_id = Some(job_id);
            member.phase = MemberPhase::CleanOut;
            ctx.update_member(group, member).await?;
            Ok(false)
        }
        ActionType::ShutdownMember => {
            let (group, mut member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            let pod = pod_name(ctx.names(), group, &member);
            if group.is_arangod() {
                let remove_from_cluster = matches!(group, ServerGroup::DBServers | ServerGroup::Coordinators);
                let res = match ctx.member_client(group, &member.id).await {
                    Ok(client) => client.shutdown(remove_from_cluster).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = res {
                    // The server may already be gone, in which case only the pod remains.
                    tracing::warn!(error = ?err, member = %member.id, "error shutting down member, deleting its pod");
                    ctx.delete_pod(&pod).await?;
                }
            } else {
                ctx.delete_pod(&pod).await?;
            }
            member.phase = MemberPhase::ShutdownPending;
            ctx.update_member(group, member).await?;
            Ok(false)
        }
        ActionType::RotateMember => {
            let (group, mut member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            ctx.delete_pod(&pod_name(ctx.names(), group, &member)).await?;
            member.phase = MemberPhase::Rotating;
            member.conditions.update(ConditionType::Ready, false, "Rotating", "pod is being replaced");
            ctx.update_member(group, member).await?;
            Ok(false)
        }
        ActionType::WaitForMemberUp => Ok(false),
        ActionType::EnableMaintenance | ActionType::DisableMaintenance => {
            let enabled = action.type_ == ActionType::EnableMaintenance;
            ctx.agency_client().await?.set_maintenance_mode(enabled).await?;
            tracing::info!(enabled, "set agency maintenance mode");
            Ok(false)
        }
        ActionType::Unknown => Err(AppError::UnknownAction(format!("{} (action {})", action.type_, action.id))),
    }
}

/// Check if the given started action has finished.
async fn check_progress<C: ActionContext + ?Sized>(ctx: &mut C, action: &Action) -> AppResult<bool> {
    match action.type_ {
        ActionType::AddMember | ActionType::RemoveMember => Ok(true),
        ActionType::CleanOutMember => {
            let (group, mut member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            let client = ctx.database_client().await?;
            if !client.is_cleaned_out(&member.id).await? {
                return Ok(false);
            }
            member.conditions.update(ConditionType::CleanedOut, true, "CleanedOut", "member holds no more shards");
            ctx.update_member(group, member).await?;
            Ok(true)
        }
        ActionType::ShutdownMember => {
            let (group, member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            if member.conditions.is_true(ConditionType::Terminated) {
                return Ok(true);
            }
            Ok(!ctx.pod_exists(&pod_name(ctx.names(), group, &member)))
        }
        ActionType::RotateMember => match ctx.member_status_by_id(action.member_id()) {
            Some((_, member)) => Ok(member.phase == MemberPhase::Created),
            None => Ok(true),
        },
        ActionType::WaitForMemberUp => {
            let (group, member) = match ctx.member_status_by_id(action.member_id()) {
                Some(found) => found,
                None => return Ok(true),
            };
            if !member.is_ready() {
                return Ok(false);
            }
            if !group.is_arangod() {
                return Ok(true);
            }
            let client = ctx.member_client(group, &member.id).await?;
            match client.version().await {
                Ok(_) => Ok(true),
                Err(err) => {
                    tracing::debug!(error = ?err, member = %member.id, "member is not serving yet");
                    Ok(false)
                }
            }
        }
        ActionType::EnableMaintenance | ActionType::DisableMaintenance => {
            let enabled = action.type_ == ActionType::EnableMaintenance;
            let client = ctx.agency_client().await?;
            Ok(client.get_maintenance_mode().await? == enabled)
        }
        ActionType::Unknown => Err(AppError::UnknownAction(format!("{} (action {})", action.type_, action.id))),
    }
}

fn pod_name(names: &ResourceNames, group: ServerGroup, member: &MemberStatus) -> String {
    member.pod_name.clone().unwrap_or_else(|| names.pod_name(group, &member.id))
}

fn pvc_name(names: &ResourceNames, group: ServerGroup, member: &MemberStatus) -> String {
    member
        .persistent_volume_claim_name
        .clone()
        .unwrap_or_else(|| names.pvc_name(group, &member.id))
}
