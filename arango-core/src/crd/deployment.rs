//! ArangoDeployment CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{DeploymentStatus, ServerGroup};
use crate::error::{AppError, AppResult};

/// The default image used for database servers.
pub const DEFAULT_IMAGE: &str = "arangodb/arangodb:latest";
/// The value which disables a secret-backed feature when used as the secret name.
pub const SECRET_NAME_NONE: &str = "None";

/// CRD spec for the ArangoDeployment resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    status = "DeploymentStatus",
    group = "database.arangodb.com",
    version = "v1alpha",
    kind = "ArangoDeployment",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "arangodb",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// The topology of the deployment.
    #[serde(default)]
    pub mode: DeploymentMode,
    /// The environment the deployment runs in, which controls validation strictness.
    #[serde(default)]
    pub environment: Environment,
    /// The storage engine used by all database servers.
    #[serde(default)]
    pub storage_engine: StorageEngine,
    /// The image used for all database servers.
    #[serde(default)]
    pub image: Option<String>,
    /// The pull policy used for all database server images.
    #[serde(default)]
    pub image_pull_policy: Option<PullPolicy>,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthSpec,
    /// TLS settings.
    #[serde(default)]
    pub tls: TlsSpec,
    /// Datacenter-to-datacenter replication settings.
    #[serde(default)]
    pub sync: SyncSpec,
    /// Settings applied once, when the deployment first becomes ready.
    #[serde(default)]
    pub bootstrap: BootstrapSpec,

    /// Settings for the single server group.
    #[serde(default)]
    pub single: ServerGroupSpec,
    /// Settings for the agents group.
    #[serde(default)]
    pub agents: ServerGroupSpec,
    /// Settings for the database servers group.
    #[serde(default)]
    pub dbservers: ServerGroupSpec,
    /// Settings for the coordinators group.
    #[serde(default)]
    pub coordinators: ServerGroupSpec,
    /// Settings for the sync masters group.
    #[serde(default)]
    pub syncmasters: ServerGroupSpec,
    /// Settings for the sync workers group.
    #[serde(default)]
    pub syncworkers: ServerGroupSpec,
}

impl ArangoDeployment {
    /// The last spec which passed validation, falling back to the raw spec before bootstrap.
    pub fn accepted_spec(&self) -> &DeploymentSpec {
        self.status.as_ref().and_then(|status| status.accepted_spec.as_ref()).unwrap_or(&self.spec)
    }
}

/// The topology of a deployment.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum DeploymentMode {
    /// A single server without any redundancy.
    Single,
    /// Two single servers in leader/follower setup, with an agency to manage failover.
    ResilientSingle,
    /// A sharded cluster of agents, database servers and coordinators.
    Cluster,
}

impl Default for DeploymentMode {
    fn default() -> Self {
        Self::Cluster
    }
}

impl DeploymentMode {
    /// Check if this mode runs servers of the single group.
    pub fn has_single_servers(&self) -> bool {
        matches!(self, Self::Single | Self::ResilientSingle)
    }

    /// Check if this mode runs an agency.
    pub fn has_agents(&self) -> bool {
        matches!(self, Self::ResilientSingle | Self::Cluster)
    }

    /// Check if this mode runs database servers.
    pub fn has_dbservers(&self) -> bool {
        matches!(self, Self::Cluster)
    }

    /// Check if this mode runs coordinators.
    pub fn has_coordinators(&self) -> bool {
        matches!(self, Self::Cluster)
    }

    /// Check if this mode supports datacenter-to-datacenter replication.
    pub fn supports_sync(&self) -> bool {
        matches!(self, Self::Cluster)
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "Single"),
            Self::ResilientSingle => write!(f, "ResilientSingle"),
            Self::Cluster => write!(f, "Cluster"),
        }
    }
}

/// The environment a deployment runs in.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum Environment {
    Development,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

/// The storage engine of a deployment.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum StorageEngine {
    MMFiles,
    RocksDB,
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::RocksDB
    }
}

impl StorageEngine {
    /// The value of this engine as understood by `arangod`.
    pub fn as_arangod_value(&self) -> &'static str {
        match self {
            Self::MMFiles => "mmfiles",
            Self::RocksDB => "rocksdb",
        }
    }
}

/// The image pull policy of the database servers.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    /// The value of this policy as used in a Kubernetes container spec.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

/// Authentication settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// The name of the secret holding the JWT secret, `None` disables authentication.
    #[serde(default)]
    pub jwt_secret_name: Option<String>,
}

impl AuthSpec {
    /// Check if authentication is turned on.
    pub fn is_authenticated(&self) -> bool {
        self.jwt_secret_name.as_deref() != Some(SECRET_NAME_NONE)
    }
}

/// TLS settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// The name of the secret holding the CA certificate, `None` disables TLS.
    #[serde(default)]
    pub ca_secret_name: Option<String>,
}

impl TlsSpec {
    /// Check if TLS is turned on.
    pub fn is_secure(&self) -> bool {
        self.ca_secret_name.as_deref() != Some(SECRET_NAME_NONE)
    }
}

/// Datacenter-to-datacenter replication settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Turns on the sync masters and workers groups.
    #[serde(default)]
    pub enabled: bool,
    /// The image used for sync servers, defaults to the deployment image.
    #[serde(default)]
    pub image: Option<String>,
}

/// Settings applied once, when the deployment first becomes ready.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    /// Maps user names to the secrets holding their initial password under the `password` key.
    #[serde(default)]
    pub password_secret_names: BTreeMap<String, String>,
}

/// Settings for a single server group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupSpec {
    /// The desired number of members.
    #[serde(default)]
    pub count: Option<u32>,
    /// The lower bound of `count`, defaults to 1.
    #[serde(default)]
    pub min_count: Option<u32>,
    /// The upper bound of `count`, defaults to unbounded.
    #[serde(default)]
    pub max_count: Option<u32>,
    /// Additional command line arguments passed to the servers of this group.
    #[serde(default)]
    pub args: Vec<String>,
    /// The storage class used for the persistent volumes of this group.
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Compute and storage resources of the servers of this group.
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// Compute and storage resources of a server.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request, as a Kubernetes quantity.
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory request, as a Kubernetes quantity.
    #[serde(default)]
    pub memory: Option<String>,
    /// Size of the persistent volume, as a Kubernetes quantity.
    #[serde(default)]
    pub storage: Option<String>,
}

impl ServerGroupSpec {
    /// The desired number of members, zero when unset.
    pub fn count(&self) -> u32 {
        self.count.unwrap_or(0)
    }

    /// The lower bound of the member count.
    pub fn min_count(&self) -> u32 {
        self.min_count.unwrap_or(1)
    }

    /// The upper bound of the member count.
    pub fn max_count(&self) -> u32 {
        self.max_count.unwrap_or(u32::MAX)
    }

    /// Check if the given count lies within the bounds of this group.
    pub fn allows_count(&self, count: u32) -> bool {
        self.min_count() <= count && count <= self.max_count()
    }

    fn set_defaults(&mut self, group: ServerGroup, used: bool, mode: DeploymentMode) {
        if !used {
            self.count = Some(0);
            self.min_count = None;
            self.max_count = None;
            return;
        }
        if self.count.unwrap_or(0) == 0 {
            self.count = Some(group.default_count(mode));
        }
    }

    fn set_defaults_from(&mut self, source: &ServerGroupSpec) {
        if self.count.is_none() {
            self.count = source.count;
        }
        if self.min_count.is_none() {
            self.min_count = source.min_count;
        }
        if self.max_count.is_none() {
            self.max_count = source.max_count;
        }
        if self.storage_class_name.is_none() {
            self.storage_class_name = source.storage_class_name.clone();
        }
        if self.resources.storage.is_none() {
            self.resources.storage = source.resources.storage.clone();
        }
    }

    fn validate(&self, group: ServerGroup, used: bool, mode: DeploymentMode, env: Environment) -> AppResult<()> {
        if !used {
            return Ok(());
        }
        let implicit_min = match (env, group, mode) {
            (_, ServerGroup::Single, DeploymentMode::ResilientSingle) => 2,
            (Environment::Production, ServerGroup::Agents, _) => 3,
            (Environment::Production, ServerGroup::DBServers | ServerGroup::Coordinators | ServerGroup::SyncMasters | ServerGroup::SyncWorkers, _) => 2,
            (Environment::Development, ServerGroup::DBServers, _) => 2,
            _ => 1,
        };
        let count = self.count();
        if self.min_count() > self.max_count() {
            return Err(invalid(group, format!("min count ({}) is bigger than max count ({})", self.min_count(), self.max_count())));
        }
        if count < self.min_count() {
            return Err(invalid(group, format!("count {} is below min count {}", count, self.min_count())));
        }
        if count > self.max_count() {
            return Err(invalid(group, format!("count {} is above max count {}", count, self.max_count())));
        }
        if count < implicit_min {
            return Err(invalid(group, format!("count {} is below the minimum of {} for this mode and environment", count, implicit_min)));
        }
        if group == ServerGroup::Single && mode == DeploymentMode::Single && count > 1 {
            return Err(invalid(group, format!("count {} is not allowed in Single mode, expected 1", count)));
        }
        if let Some(arg) = self.args.iter().find(|arg| is_critical_arg(arg)) {
            return Err(invalid(group, format!("critical option '{}' cannot be overridden", arg)));
        }
        Ok(())
    }
}

/// Options which the operator owns and which must not be set through group args.
const CRITICAL_OPTIONS: &[&str] = &[
    "--agency.activate",
    "--agency.my-address",
    "--agency.size",
    "--cluster.agency-endpoint",
    "--cluster.my-address",
    "--cluster.my-role",
    "--database.directory",
    "--server.authentication",
    "--server.endpoint",
    "--server.jwt-secret",
    "--server.storage-engine",
];

fn is_critical_arg(arg: &str) -> bool {
    let key = arg.split('=').next().unwrap_or_default().trim();
    CRITICAL_OPTIONS.contains(&key)
}

fn invalid(group: ServerGroup, msg: String) -> AppError {
    AppError::InvalidInput(format!("{}: {}", group.as_role(), msg))
}

impl DeploymentSpec {
    /// The settings of the given server group.
    pub fn group_spec(&self, group: ServerGroup) -> &ServerGroupSpec {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DBServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
            ServerGroup::SyncMasters => &self.syncmasters,
            ServerGroup::SyncWorkers => &self.syncworkers,
        }
    }

    /// The mutable settings of the given server group.
    pub fn group_spec_mut(&mut self, group: ServerGroup) -> &mut ServerGroupSpec {
        match group {
            ServerGroup::Single => &mut self.single,
            ServerGroup::Agents => &mut self.agents,
            ServerGroup::DBServers => &mut self.dbservers,
            ServerGroup::Coordinators => &mut self.coordinators,
            ServerGroup::SyncMasters => &mut self.syncmasters,
            ServerGroup::SyncWorkers => &mut self.syncworkers,
        }
    }

    /// Check if the given group runs any servers under this spec.
    pub fn is_group_used(&self, group: ServerGroup) -> bool {
        match group {
            ServerGroup::Single => self.mode.has_single_servers(),
            ServerGroup::Agents => self.mode.has_agents(),
            ServerGroup::DBServers => self.mode.has_dbservers(),
            ServerGroup::Coordinators => self.mode.has_coordinators(),
            ServerGroup::SyncMasters | ServerGroup::SyncWorkers => self.sync_enabled(),
        }
    }

    /// Check if sync servers are part of this deployment.
    pub fn sync_enabled(&self) -> bool {
        self.sync.enabled && self.mode.supports_sync()
    }

    /// The image used for database servers.
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    /// The image used by servers of the given group.
    pub fn image_for(&self, group: ServerGroup) -> &str {
        match (group.is_arangosync(), self.sync.image.as_deref()) {
            (true, Some(image)) => image,
            _ => self.image(),
        }
    }

    /// The pull policy used for all server images.
    pub fn image_pull_policy(&self) -> PullPolicy {
        self.image_pull_policy.unwrap_or(PullPolicy::IfNotPresent)
    }

    /// The JWT secret name, if authentication is on.
    pub fn jwt_secret_name(&self) -> Option<&str> {
        if !self.auth.is_authenticated() {
            return None;
        }
        self.auth.jwt_secret_name.as_deref()
    }

    /// Fill in default values for everything left unset.
    ///
    /// The deployment name is used to derive the default names of secrets.
    pub fn set_defaults(&mut self, deployment_name: &str) {
        if self.image.is_none() {
            self.image = Some(DEFAULT_IMAGE.into());
        }
        if self.image_pull_policy.is_none() {
            self.image_pull_policy = Some(PullPolicy::IfNotPresent);
        }
        if self.auth.jwt_secret_name.is_none() {
            self.auth.jwt_secret_name = Some(format!("{}-jwt", deployment_name));
        }
        if self.tls.ca_secret_name.is_none() {
            self.tls.ca_secret_name = Some(format!("{}-ca", deployment_name));
        }
        let mode = self.mode;
        for group in ServerGroup::ALL {
            let used = self.is_group_used(group);
            self.group_spec_mut(group).set_defaults(group, used, mode);
        }
    }

    /// Fill in values left unset from the given spec, typically the last accepted one.
    pub fn set_defaults_from(&mut self, source: &DeploymentSpec) {
        if self.image.is_none() {
            self.image = source.image.clone();
        }
        if self.image_pull_policy.is_none() {
            self.image_pull_policy = source.image_pull_policy;
        }
        if self.auth.jwt_secret_name.is_none() {
            self.auth.jwt_secret_name = source.auth.jwt_secret_name.clone();
        }
        if self.tls.ca_secret_name.is_none() {
            self.tls.ca_secret_name = source.tls.ca_secret_name.clone();
        }
        if self.sync.image.is_none() {
            self.sync.image = source.sync.image.clone();
        }
        for group in ServerGroup::ALL {
            self.group_spec_mut(group).set_defaults_from(source.group_spec(group));
        }
    }

    /// Reset all fields which may not change after creation to the values of `self`.
    ///
    /// Returns the paths of the fields which were reset.
    pub fn reset_immutable_fields(&self, target: &mut DeploymentSpec) -> Vec<&'static str> {
        let mut reset = vec![];
        if self.mode != target.mode {
            target.mode = self.mode;
            reset.push("mode");
        }
        if self.storage_engine != target.storage_engine {
            target.storage_engine = self.storage_engine;
            reset.push("storageEngine");
        }
        if self.auth.is_authenticated() != target.auth.is_authenticated() {
            target.auth = self.auth.clone();
            reset.push("auth.jwtSecretName");
        }
        for group in ServerGroup::ALL {
            let (source, dest) = (self.group_spec(group), target.group_spec_mut(group));
            if group.requires_persistent_volume() && source.storage_class_name != dest.storage_class_name {
                dest.storage_class_name = source.storage_class_name.clone();
                reset.push(match group {
                    ServerGroup::Single => "single.storageClassName",
                    ServerGroup::Agents => "agents.storageClassName",
                    _ => "dbservers.storageClassName",
                });
            }
        }
        reset
    }

    /// Validate this spec, which is expected to have its defaults set.
    pub fn validate(&self) -> AppResult<()> {
        if self.image().is_empty() {
            return Err(AppError::InvalidInput("image must not be empty".into()));
        }
        if self.sync.enabled && !self.mode.supports_sync() {
            return Err(AppError::InvalidInput(format!("sync is not supported in {} mode", self.mode)));
        }
        for group in ServerGroup::ALL {
            let used = self.is_group_used(group);
            self.group_spec(group).validate(group, used, self.mode, self.environment)?;
        }
        Ok(())
    }
}
