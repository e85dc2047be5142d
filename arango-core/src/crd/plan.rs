//! Plan actions.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ServerGroup;

/// The type of an action.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ActionType {
    /// Register a new member in a group.
    AddMember,
    /// Remove a member from the status, along with its pod and volume claim.
    RemoveMember,
    /// Move all data off a database server.
    CleanOutMember,
    /// Stop the server process of a member.
    ShutdownMember,
    /// Replace the pod of a member so that it picks up a changed spec.
    RotateMember,
    /// Wait until a member serves requests.
    WaitForMemberUp,
    /// Stop the agency supervision from reacting to members going away.
    EnableMaintenance,
    /// Hand control back to the agency supervision.
    DisableMaintenance,
    /// A type written by a different version of the operator.
    #[serde(other)]
    Unknown,
}

impl ActionType {
    /// The duration after which a started action of this type is abandoned.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::AddMember | Self::RemoveMember | Self::Unknown => None,
            Self::CleanOutMember => Some(Duration::from_secs(12 * 60 * 60)),
            Self::ShutdownMember => Some(Duration::from_secs(30 * 60)),
            Self::RotateMember => Some(Duration::from_secs(5 * 60)),
            Self::WaitForMemberUp => Some(Duration::from_secs(15 * 60)),
            Self::EnableMaintenance | Self::DisableMaintenance => Some(Duration::from_secs(60)),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of a plan.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// A unique ID of this action.
    pub id: String,
    /// The type of this action.
    #[serde(rename = "type")]
    pub type_: ActionType,
    /// The server group this action targets.
    pub group: ServerGroup,
    /// The member this action targets, if any.
    #[serde(default)]
    pub member_id: Option<String>,
    /// Why this action was planned.
    #[serde(default)]
    pub reason: Option<String>,
    /// The time at which this action was planned.
    pub creation_time: DateTime<Utc>,
    /// The time at which this action was started, unset while pending.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// The time of the first failed attempt to start this action.
    #[serde(default)]
    pub start_failed_time: Option<DateTime<Utc>>,
}

impl Action {
    /// Create a new pending action.
    pub fn new(type_: ActionType, group: ServerGroup, member_id: Option<&str>, reason: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            type_,
            group,
            member_id: member_id.map(String::from),
            reason: Some(reason.into()),
            creation_time: Utc::now(),
            start_time: None,
            start_failed_time: None,
        }
    }

    /// The member ID of this action, or an empty string for group level actions.
    pub fn member_id(&self) -> &str {
        self.member_id.as_deref().unwrap_or_default()
    }
}
