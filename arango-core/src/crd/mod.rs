//! ArangoDB operator CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod deployment;
mod group;
mod plan;
mod status;
#[cfg(test)]
mod status_test;

use kube::Resource;

pub use deployment::{
    ArangoDeployment, AuthSpec, BootstrapSpec, DeploymentMode, DeploymentSpec, Environment, PullPolicy, ResourceSpec, ServerGroupSpec, StorageEngine, SyncSpec, TlsSpec,
    DEFAULT_IMAGE, SECRET_NAME_NONE,
};
pub use group::ServerGroup;
pub use plan::{Action, ActionType};
pub use status::{Condition, ConditionList, ConditionType, DeploymentMembers, DeploymentPhase, DeploymentStatus, MemberPhase, MemberStatus};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for ArangoDeployment {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
