use k8s_openapi::api::core::v1::Pod;

use arango_core::crd::{Action, ActionType, DeploymentMode, DeploymentSpec, DeploymentStatus, MemberPhase, MemberStatus, ServerGroup};

use crate::resources::{pod_needs_rotation, ResourceNames};

/// The order in which groups are compared against their desired counts.
const SCALING_ORDER: [ServerGroup; 5] = [
    ServerGroup::Single,
    ServerGroup::DBServers,
    ServerGroup::Coordinators,
    ServerGroup::SyncMasters,
    ServerGroup::SyncWorkers,
];

/// Compute the next plan of the deployment.
///
/// A non-empty current plan is returned as is, only one plan drains at a time. Otherwise the
/// returned plan holds either the scaling actions of all groups, or the rotation of at most one
/// member. The flag is true when a new plan was produced.
pub fn create_plan(current: &[Action], spec: &DeploymentSpec, status: &DeploymentStatus, pods: &[Pod], names: &ResourceNames) -> (Vec<Action>, bool) {
    if !current.is_empty() {
        return (current.to_vec(), false);
    }

    let mut plan = create_scaling_plan(spec, status);
    if plan.is_empty() {
        plan = create_rotation_plan(spec, status, pods, names);
    }
    let changed = !plan.is_empty();
    (plan, changed)
}

/// Select the member of a group to remove when scaling down.
///
/// Members which were never brought up go first, then members which are not ready, then the most
/// recently created. Ties are broken by the larger ID, so the choice is deterministic.
pub fn select_member_to_remove(members: &[MemberStatus]) -> Option<&MemberStatus> {
    members
        .iter()
        .max_by_key(|member| (member.phase == MemberPhase::None, !member.is_ready(), member.created_at, member.id.clone()))
}

fn create_scaling_plan(spec: &DeploymentSpec, status: &DeploymentStatus) -> Vec<Action> {
    let mut plan = vec![];
    let mut removal_planned = false;
    for group in SCALING_ORDER.into_iter().filter(|group| group.is_scalable_in(spec.mode)) {
        let members = status.members.group(group);
        // Groups no longer in use, such as sync servers after sync was disabled, scale down to zero.
        let desired = if spec.is_group_used(group) { spec.group_spec(group).count() as usize } else { 0 };
        let actual = members.len();
        if desired > actual {
            for _ in actual..desired {
                plan.push(Action::new(ActionType::AddMember, group, None, "scaling up"));
            }
        } else if desired < actual && !removal_planned {
            let member = match select_member_to_remove(members) {
                Some(member) => member,
                None => continue,
            };
            tracing::debug!(%group, member = %member.id, desired, actual, "planning removal of member");
            if group == ServerGroup::DBServers {
                plan.push(Action::new(ActionType::CleanOutMember, group, Some(&member.id), "scaling down"));
            }
            plan.push(Action::new(ActionType::ShutdownMember, group, Some(&member.id), "scaling down"));
            plan.push(Action::new(ActionType::RemoveMember, group, Some(&member.id), "scaling down"));
            removal_planned = true;
        }
    }
    plan
}

fn create_rotation_plan(spec: &DeploymentSpec, status: &DeploymentStatus, pods: &[Pod], names: &ResourceNames) -> Vec<Action> {
    let agents = status.members.group(ServerGroup::Agents);
    for (group, member) in status.members.iter() {
        if member.phase != MemberPhase::Created {
            continue;
        }
        let pod_name = member.pod_name.clone().unwrap_or_else(|| names.pod_name(group, &member.id));
        let pod = match pods.iter().find(|pod| pod.metadata.name.as_deref() == Some(pod_name.as_str())) {
            Some(pod) => pod,
            None => continue,
        };
        if let Some(reason) = pod_needs_rotation(pod, spec, names, group, member, agents) {
            tracing::debug!(%group, member = %member.id, reason, "planning rotation of member");
            let mut plan = vec![
                Action::new(ActionType::RotateMember, group, Some(&member.id), reason),
                Action::new(ActionType::WaitForMemberUp, group, Some(&member.id), reason),
            ];
            // The supervision would otherwise start moving shards off the restarting server.
            if group == ServerGroup::DBServers && spec.mode == DeploymentMode::Cluster {
                plan.insert(0, Action::new(ActionType::EnableMaintenance, group, Some(&member.id), reason));
                plan.push(Action::new(ActionType::DisableMaintenance, group, Some(&member.id), reason));
            }
            return plan;
        }
    }
    vec![]
}
