//! Clients of the administrative surface of managed database deployments.

mod cache;
mod http;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use arango_core::crd::{DeploymentSpec, ServerGroup};
use arango_core::AppResult;

pub use cache::ConnectionCache;
pub use self::http::HttpClientFactory;

/// Server counts as reported by, or pushed to, a cluster.
///
/// These are distinct from the desired counts of the spec, as the cluster's own UI can change
/// them independently. `None` means that no value is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NumberOfServers {
    #[serde(rename = "numberOfCoordinators", default)]
    pub coordinators: Option<u32>,
    #[serde(rename = "numberOfDBServers", default)]
    pub dbservers: Option<u32>,
}

impl NumberOfServers {
    /// The counts which the controller wants a cluster to show for the given spec.
    ///
    /// A group whose bounds pin the count to a single value is left unset, which hides the
    /// scaling control of that group in the cluster UI.
    pub fn from_spec(spec: &DeploymentSpec) -> Self {
        let desired = |group: ServerGroup| {
            let group_spec = spec.group_spec(group);
            if group_spec.min_count() == group_spec.max_count() {
                None
            } else {
                Some(group_spec.count())
            }
        };
        Self {
            coordinators: desired(ServerGroup::Coordinators),
            dbservers: desired(ServerGroup::DBServers),
        }
    }

    /// Check if neither count is set.
    pub fn is_empty(&self) -> bool {
        self.coordinators.is_none() && self.dbservers.is_none()
    }
}

impl fmt::Display for NumberOfServers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |val: Option<u32>| val.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        write!(f, "{}/{}", show(self.coordinators), show(self.dbservers))
    }
}

/// The key of a cached client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// A client of the deployment as a whole, reaching any coordinator or the single server.
    Database,
    /// A client of the agency.
    Agency,
    /// A client of one specific member.
    Member(ServerGroup, String),
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Agency => write!(f, "agency"),
            Self::Member(group, id) => write!(f, "{}/{}", group, id),
        }
    }
}

/// The administrative surface of a database server, agency or whole deployment.
///
/// Implementations must bound every call by a timeout.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the server version, used as a cheap liveness check.
    async fn version(&self) -> AppResult<String>;

    /// Fetch the server counts which the cluster currently asks for.
    async fn get_server_counts(&self) -> AppResult<NumberOfServers>;

    /// Set the server counts the cluster shows, `None` values clear the override.
    async fn set_server_counts(&self, counts: NumberOfServers) -> AppResult<()>;

    /// Check if the agency supervision is in maintenance mode.
    async fn get_maintenance_mode(&self) -> AppResult<bool>;

    /// Turn agency supervision maintenance mode on or off.
    async fn set_maintenance_mode(&self, enabled: bool) -> AppResult<()>;

    /// Start moving all shards off the given database server, returning the job ID.
    async fn clean_out_server(&self, server_id: &str) -> AppResult<String>;

    /// Check if the given database server holds no more shards.
    async fn is_cleaned_out(&self, server_id: &str) -> AppResult<bool>;

    /// Create a database user with the given password.
    async fn create_user(&self, user: &str, password: &str) -> AppResult<()>;

    /// Update the password of an existing database user.
    async fn update_user(&self, user: &str, password: &str) -> AppResult<()>;

    /// Ask the server to shut down.
    async fn shutdown(&self, remove_from_cluster: bool) -> AppResult<()>;
}

/// A factory of fresh clients, used by the connection cache.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create a new client for the given key.
    async fn create(&self, key: &ClientKey) -> AppResult<Arc<dyn ClusterClient>>;
}
