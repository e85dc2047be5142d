//! Deployment status types.
//!
//! The status sub-document is the durable memory of the operator. Everything needed to resume
//! reconciliation after a restart, including progress of the current plan, lives here.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Action, DeploymentSpec, ServerGroup};
use crate::error::{AppError, AppResult};

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// The lifecycle phase of the deployment.
    #[serde(default)]
    pub phase: DeploymentPhase,
    /// A human readable reason for the current phase.
    #[serde(default)]
    pub reason: Option<String>,
    /// The members of the deployment, per server group.
    #[serde(default)]
    pub members: DeploymentMembers,
    /// The queue of actions being executed, empty when converged.
    #[serde(default)]
    pub plan: Vec<Action>,
    /// Named facts about the deployment.
    #[serde(default)]
    pub conditions: ConditionList,
    /// The last spec which passed validation.
    #[serde(default)]
    pub accepted_spec: Option<DeploymentSpec>,
}

/// The lifecycle phase of a deployment.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum DeploymentPhase {
    /// The deployment has not been initialized yet.
    None,
    /// The deployment is being reconciled.
    Running,
    /// The deployment has failed and will not be reconciled further.
    Failed,
}

impl Default for DeploymentPhase {
    fn default() -> Self {
        Self::None
    }
}

//////////////////////////////////////////////////////////////////////////////
// Members ///////////////////////////////////////////////////////////////////

/// The members of a deployment, per server group.
///
/// Member IDs are unique across all groups combined.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMembers {
    #[serde(default)]
    pub single: Vec<MemberStatus>,
    #[serde(default)]
    pub agents: Vec<MemberStatus>,
    #[serde(default)]
    pub dbservers: Vec<MemberStatus>,
    #[serde(default)]
    pub coordinators: Vec<MemberStatus>,
    #[serde(default)]
    pub syncmasters: Vec<MemberStatus>,
    #[serde(default)]
    pub syncworkers: Vec<MemberStatus>,
}

impl DeploymentMembers {
    /// The members of the given group.
    pub fn group(&self, group: ServerGroup) -> &[MemberStatus] {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DBServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
            ServerGroup::SyncMasters => &self.syncmasters,
            ServerGroup::SyncWorkers => &self.syncworkers,
        }
    }

    fn group_mut(&mut self, group: ServerGroup) -> &mut Vec<MemberStatus> {
        match group {
            ServerGroup::Single => &mut self.single,
            ServerGroup::Agents => &mut self.agents,
            ServerGroup::DBServers => &mut self.dbservers,
            ServerGroup::Coordinators => &mut self.coordinators,
            ServerGroup::SyncMasters => &mut self.syncmasters,
            ServerGroup::SyncWorkers => &mut self.syncworkers,
        }
    }

    /// Iterate over all members of all groups, along with their group.
    pub fn iter(&self) -> impl Iterator<Item = (ServerGroup, &MemberStatus)> + '_ {
        ServerGroup::ALL
            .into_iter()
            .flat_map(move |group| self.group(group).iter().map(move |member| (group, member)))
    }

    /// Check if a member with the given ID exists in any group.
    pub fn contains_id(&self, id: &str) -> bool {
        self.iter().any(|(_, member)| member.id == id)
    }

    /// Find the member with the given ID in any group.
    pub fn element_by_id(&self, id: &str) -> Option<(ServerGroup, &MemberStatus)> {
        self.iter().find(|(_, member)| member.id == id)
    }

    /// Add the given member to the given group.
    ///
    /// Members are kept sorted by ID within their group.
    pub fn add(&mut self, member: MemberStatus, group: ServerGroup) -> AppResult<()> {
        if self.contains_id(&member.id) {
            return Err(AppError::InvalidInput(format!("member {} already exists", member.id)));
        }
        let list = self.group_mut(group);
        list.push(member);
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(())
    }

    /// Replace the member of the given group which has the same ID as the given member.
    pub fn update(&mut self, member: MemberStatus, group: ServerGroup) -> AppResult<()> {
        match self.group_mut(group).iter_mut().find(|m| m.id == member.id) {
            Some(slot) => {
                *slot = member;
                Ok(())
            }
            None => Err(AppError::ResourceNotFound),
        }
    }

    /// Remove the member with the given ID from the given group.
    pub fn remove_by_id(&mut self, id: &str, group: ServerGroup) -> AppResult<()> {
        let list = self.group_mut(group);
        match list.iter().position(|m| m.id == id) {
            Some(idx) => {
                list.remove(idx);
                Ok(())
            }
            None => Err(AppError::ResourceNotFound),
        }
    }

    /// Generate a new member ID for the given group, which is unique across all groups.
    pub fn new_member_id(&self, group: ServerGroup) -> String {
        loop {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(|c| char::from(c).to_ascii_lowercase())
                .collect();
            let id = format!("{}-{}", group.as_role_abbreviated(), suffix);
            if !self.contains_id(&id) {
                return id;
            }
        }
    }
}

/// The status of a single member of a deployment.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// The unique ID of the member, prefixed by the abbreviated role of its group.
    pub id: String,
    /// The lifecycle phase of this member.
    #[serde(default)]
    pub phase: MemberPhase,
    /// The time at which this member was created.
    pub created_at: DateTime<Utc>,
    /// Named facts about this member.
    #[serde(default)]
    pub conditions: ConditionList,
    /// The name of the pod running this member.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// The name of the persistent volume claim holding the data of this member.
    #[serde(default)]
    pub persistent_volume_claim_name: Option<String>,
    /// The ID of the clean-out job of this member, if one was started.
    #[serde(default)]
    pub cleanout_job_id: Option<String>,
}

impl MemberStatus {
    /// Create a new member which has not been brought up yet.
    pub fn new(id: String) -> Self {
        Self {
            id,
            phase: MemberPhase::None,
            created_at: Utc::now(),
            conditions: Default::default(),
            pod_name: None,
            persistent_volume_claim_name: None,
            cleanout_job_id: None,
        }
    }

    /// Check if this member reports itself ready.
    pub fn is_ready(&self) -> bool {
        self.conditions.is_true(ConditionType::Ready)
    }
}

/// The lifecycle phase of a member.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum MemberPhase {
    /// No pod has been created for the member yet.
    None,
    /// A pod has been created for the member.
    Created,
    /// The member has failed and must be replaced.
    Failed,
    /// The member is being drained of its data.
    CleanOut,
    /// The member is being shut down.
    ShutdownPending,
    /// The pod of the member is being replaced.
    Rotating,
}

impl Default for MemberPhase {
    fn default() -> Self {
        Self::None
    }
}

//////////////////////////////////////////////////////////////////////////////
// Conditions ////////////////////////////////////////////////////////////////

/// The type of a condition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// The deployment or member is serving requests.
    Ready,
    /// The process of the member has terminated.
    Terminated,
    /// The member holds no more data and can be removed.
    CleanedOut,
    /// The member is known to the cluster.
    MemberOfCluster,
    /// The initial members of the deployment have all become ready once.
    BootstrapCompleted,
}

/// A named boolean fact, along with its reason.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The type of this condition.
    #[serde(rename = "type")]
    pub type_: ConditionType,
    /// The status of this condition.
    pub status: bool,
    /// The last time this condition was updated.
    pub last_update_time: DateTime<Utc>,
    /// The last time the status of this condition changed.
    pub last_transition_time: DateTime<Utc>,
    /// A machine readable reason for the status.
    #[serde(default)]
    pub reason: Option<String>,
    /// A human readable message for the status.
    #[serde(default)]
    pub message: Option<String>,
}

/// A list of conditions, holding at most one condition per type.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ConditionList(pub Vec<Condition>);

impl ConditionList {
    /// Check if the condition of the given type exists and is true.
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).map(|c| c.status).unwrap_or(false)
    }

    /// Get the condition of the given type.
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Create or update the condition of the given type.
    ///
    /// Returns true if anything other than the update time was changed.
    pub fn update(&mut self, type_: ConditionType, status: bool, reason: &str, message: &str) -> bool {
        let now = Utc::now();
        let (reason, message) = (Some(reason.to_string()), Some(message.to_string()));
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(cond) => {
                if cond.status == status && cond.reason == reason && cond.message == message {
                    return false;
                }
                if cond.status != status {
                    cond.last_transition_time = now;
                }
                cond.status = status;
                cond.last_update_time = now;
                cond.reason = reason;
                cond.message = message;
                true
            }
            None => {
                self.0.push(Condition {
                    type_,
                    status,
                    last_update_time: now,
                    last_transition_time: now,
                    reason,
                    message,
                });
                true
            }
        }
    }

    /// Remove the condition of the given type, returning true if it existed.
    pub fn remove(&mut self, type_: ConditionType) -> bool {
        let len = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        self.0.len() != len
    }
}
