use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use arango_core::crd::{ConditionType, DeploymentSpec, MemberPhase, MemberStatus, ServerGroup};

use crate::resources::args::{DATA_MOUNT_PATH, ENV_JWT_SECRET};
use crate::resources::{member_args, ResourceNames, ARANGOSYNC_PORT, ARANGO_PORT};

/// The name of the server container in member pods.
///
/// NOTE WELL: do not change the name of this container, rotation detection depends on it.
pub const CONTAINER_NAME: &str = "server";
/// The key of the JWT secret within its K8s secret.
pub const SECRET_KEY_TOKEN: &str = "token";
/// The default size of member volumes.
const DEFAULT_VOLUME_SIZE: &str = "8Gi";
/// The name of the data volume in member pods.
const VOLUME_NAME_DATA: &str = "arangod-data";

/// The finalizer keeping an agent pod until the agency no longer needs it.
pub const FINALIZER_AGENCY_SERVING: &str = "agent.database.arangodb.com/agency-serving";
/// The finalizer keeping a database server pod until it has been drained.
pub const FINALIZER_DRAIN_DBSERVER: &str = "dbserver.database.arangodb.com/drain";
/// The finalizer keeping a claim while its member exists.
pub const FINALIZER_MEMBER_EXISTS: &str = "pvc.database.arangodb.com/member-exists";

/// Build the pod of the given member.
pub fn build_member_pod(spec: &DeploymentSpec, names: &ResourceNames, group: ServerGroup, member: &MemberStatus, agents: &[MemberStatus]) -> Pod {
    let group_spec = spec.group_spec(group);
    let pod_name = member.pod_name.clone().unwrap_or_else(|| names.pod_name(group, &member.id));
    let port = if group.is_arangosync() { ARANGOSYNC_PORT } else { ARANGO_PORT };

    let mut env = vec![];
    if let Some(secret_name) = spec.jwt_secret_name() {
        env.push(EnvVar {
            name: ENV_JWT_SECRET.into(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(secret_name.into()),
                    key: SECRET_KEY_TOKEN.into(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut requests = BTreeMap::new();
    if let Some(cpu) = group_spec.resources.cpu.as_ref() {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = group_spec.resources.memory.as_ref() {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }

    let (mut volumes, mut volume_mounts) = (vec![], vec![]);
    if group.requires_persistent_volume() {
        let claim_name = member
            .persistent_volume_claim_name
            .clone()
            .unwrap_or_else(|| names.pvc_name(group, &member.id));
        volumes.push(Volume {
            name: VOLUME_NAME_DATA.into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name, read_only: None }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: VOLUME_NAME_DATA.into(),
            mount_path: DATA_MOUNT_PATH.into(),
            ..Default::default()
        });
    }

    let finalizers = match group {
        ServerGroup::Agents => Some(vec![FINALIZER_AGENCY_SERVING.to_string()]),
        ServerGroup::DBServers => Some(vec![FINALIZER_DRAIN_DBSERVER.to_string()]),
        _ => None,
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(names.namespace.clone()),
            labels: Some(names.member_labels(group, &member.id)),
            owner_references: names.owner.clone().map(|owner| vec![owner]),
            finalizers,
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(names.pod_name(group, &member.id)),
            subdomain: Some(names.headless_service_name()),
            containers: vec![Container {
                name: CONTAINER_NAME.into(),
                image: Some(spec.image_for(group).into()),
                image_pull_policy: Some(spec.image_pull_policy().as_str().into()),
                args: Some(member_args(spec, names, group, &member.id, agents)),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    name: Some("server".into()),
                    container_port: port,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    limits: None,
                }),
                volume_mounts: Some(volume_mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            restart_policy: Some("Never".into()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the persistent volume claim of the given member.
pub fn build_member_pvc(spec: &DeploymentSpec, names: &ResourceNames, group: ServerGroup, member: &MemberStatus) -> PersistentVolumeClaim {
    let group_spec = spec.group_spec(group);
    let size = group_spec.resources.storage.clone().unwrap_or_else(|| DEFAULT_VOLUME_SIZE.into());
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(names.pvc_name(group, &member.id)),
            namespace: Some(names.namespace.clone()),
            labels: Some(names.member_labels(group, &member.id)),
            owner_references: names.owner.clone().map(|owner| vec![owner]),
            finalizers: Some(vec![FINALIZER_MEMBER_EXISTS.into()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: group_spec.storage_class_name.clone(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Check if the given pod reports itself ready.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conds| conds.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
        .unwrap_or(false)
}

/// Check if the process of the given pod has terminated.
pub fn pod_is_terminated(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if matches!(status.phase.as_deref(), Some("Succeeded") | Some("Failed")) {
        return true;
    }
    match status.container_statuses.as_ref() {
        Some(statuses) if !statuses.is_empty() => statuses
            .iter()
            .all(|cs| cs.state.as_ref().map(|state| state.terminated.is_some()).unwrap_or(false)),
        _ => false,
    }
}

/// The operator's finalizers of the given pod which may be released.
///
/// Only pods being deleted release finalizers. A pod whose server has terminated releases all of
/// them. Otherwise an agent pod is released while the other agents still form a majority of the
/// agency, and a database server pod is released unless its member is still being cleaned out.
pub fn releasable_finalizers(pod: &Pod, member: &MemberStatus, agents: &[MemberStatus]) -> Vec<String> {
    if pod.metadata.deletion_timestamp.is_none() {
        return vec![];
    }
    let server_dead = pod_is_terminated(pod);
    let finalizers = pod.metadata.finalizers.as_deref().unwrap_or_default();
    finalizers
        .iter()
        .filter(|finalizer| match finalizer.as_str() {
            FINALIZER_AGENCY_SERVING => {
                let others_ready = agents.iter().filter(|agent| agent.id != member.id && agent.is_ready()).count();
                server_dead || others_ready > agents.len() / 2
            }
            FINALIZER_DRAIN_DBSERVER => {
                let draining = member.phase == MemberPhase::CleanOut && !member.conditions.is_true(ConditionType::CleanedOut);
                server_dead || !draining
            }
            _ => false,
        })
        .cloned()
        .collect()
}

/// Check if the given pod differs from what the current spec would produce for its member.
///
/// Returns the reason for a rotation, if one is needed.
pub fn pod_needs_rotation(
    pod: &Pod, spec: &DeploymentSpec, names: &ResourceNames, group: ServerGroup, member: &MemberStatus, agents: &[MemberStatus],
) -> Option<&'static str> {
    let container = pod
        .spec
        .as_ref()
        .and_then(|pod_spec| pod_spec.containers.iter().find(|c| c.name == CONTAINER_NAME))?;
    if container.image.as_deref() != Some(spec.image_for(group)) {
        return Some("image changed");
    }
    if container.image_pull_policy.as_deref() != Some(spec.image_pull_policy().as_str()) {
        return Some("image pull policy changed");
    }
    let expected = member_args(spec, names, group, &member.id, agents);
    if container.args.as_ref() != Some(&expected) {
        return Some("server arguments changed");
    }
    None
}
