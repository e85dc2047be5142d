//! Server groups.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::DeploymentMode;

/// A role class of members sharing scaling and lifecycle rules.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServerGroup {
    Single,
    Agents,
    #[serde(rename = "dbservers")]
    DBServers,
    Coordinators,
    #[serde(rename = "syncmasters")]
    SyncMasters,
    #[serde(rename = "syncworkers")]
    SyncWorkers,
}

impl ServerGroup {
    /// All server groups, in the order in which their members are brought up.
    pub const ALL: [ServerGroup; 6] = [
        ServerGroup::Agents,
        ServerGroup::Single,
        ServerGroup::DBServers,
        ServerGroup::Coordinators,
        ServerGroup::SyncMasters,
        ServerGroup::SyncWorkers,
    ];

    /// The role string of this group, as used in labels and member addresses.
    pub fn as_role(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Agents => "agent",
            Self::DBServers => "dbserver",
            Self::Coordinators => "coordinator",
            Self::SyncMasters => "syncmaster",
            Self::SyncWorkers => "syncworker",
        }
    }

    /// The abbreviated role of this group, used as the prefix of member IDs.
    pub fn as_role_abbreviated(&self) -> &'static str {
        match self {
            Self::Single => "sngl",
            Self::Agents => "agnt",
            Self::DBServers => "prmr",
            Self::Coordinators => "crdn",
            Self::SyncMasters => "syma",
            Self::SyncWorkers => "sywo",
        }
    }

    /// Members of stateless groups keep no data of their own.
    pub fn is_stateless(&self) -> bool {
        matches!(self, Self::Coordinators | Self::SyncMasters | Self::SyncWorkers)
    }

    /// Check if members of this group run an `arangod` process.
    pub fn is_arangod(&self) -> bool {
        matches!(self, Self::Single | Self::Agents | Self::DBServers | Self::Coordinators)
    }

    /// Check if members of this group run an `arangosync` process.
    pub fn is_arangosync(&self) -> bool {
        matches!(self, Self::SyncMasters | Self::SyncWorkers)
    }

    /// Check if members of this group need a persistent volume for their data.
    pub fn requires_persistent_volume(&self) -> bool {
        self.is_arangod() && !self.is_stateless()
    }

    /// Check if the member count of this group is driven by the plan builder in the given mode.
    ///
    /// Agents are never scaled, as the size of the agency is fixed once it has been bootstrapped.
    pub fn is_scalable_in(&self, mode: DeploymentMode) -> bool {
        match mode {
            DeploymentMode::Single => false,
            DeploymentMode::ResilientSingle => matches!(self, Self::Single),
            DeploymentMode::Cluster => matches!(self, Self::DBServers | Self::Coordinators | Self::SyncMasters | Self::SyncWorkers),
        }
    }

    /// The default number of members of this group, when the group is in use.
    pub fn default_count(&self, mode: DeploymentMode) -> u32 {
        match (self, mode) {
            (Self::Single, DeploymentMode::Single) => 1,
            (Self::Single, _) => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_role())
    }
}
