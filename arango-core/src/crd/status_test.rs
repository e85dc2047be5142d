use anyhow::Result;

use super::*;
use crate::error::AppError;

#[test]
fn members_add_keeps_ids_unique_across_groups() -> Result<()> {
    let mut members = DeploymentMembers::default();
    members.add(MemberStatus::new("prmr-aaaa".into()), ServerGroup::DBServers)?;

    let res = members.add(MemberStatus::new("prmr-aaaa".into()), ServerGroup::Coordinators);

    assert!(res.is_err(), "expected duplicate ID to be rejected");
    assert!(members.coordinators.is_empty(), "expected coordinators to be empty, got {:?}", members.coordinators);

    Ok(())
}

#[test]
fn members_add_sorts_by_id() -> Result<()> {
    let mut members = DeploymentMembers::default();
    members.add(MemberStatus::new("prmr-cccc".into()), ServerGroup::DBServers)?;
    members.add(MemberStatus::new("prmr-aaaa".into()), ServerGroup::DBServers)?;
    members.add(MemberStatus::new("prmr-bbbb".into()), ServerGroup::DBServers)?;

    let ids: Vec<_> = members.dbservers.iter().map(|m| m.id.as_str()).collect();
    assert!(ids == vec!["prmr-aaaa", "prmr-bbbb", "prmr-cccc"], "unexpected member order {:?}", ids);

    Ok(())
}

#[test]
fn members_lookup_update_and_remove() -> Result<()> {
    let mut members = DeploymentMembers::default();
    members.add(MemberStatus::new("crdn-aaaa".into()), ServerGroup::Coordinators)?;

    let (group, found) = members.element_by_id("crdn-aaaa").ok_or_else(|| anyhow::anyhow!("expected member to be found"))?;
    assert!(group == ServerGroup::Coordinators, "unexpected group, got {}, expected {}", group, ServerGroup::Coordinators);

    let mut updated = found.clone();
    updated.phase = MemberPhase::Created;
    members.update(updated, ServerGroup::Coordinators)?;
    assert!(members.coordinators[0].phase == MemberPhase::Created, "expected phase to be updated, got {:?}", members.coordinators[0].phase);

    members.remove_by_id("crdn-aaaa", ServerGroup::Coordinators)?;
    assert!(!members.contains_id("crdn-aaaa"), "expected member to be removed");
    let res = members.remove_by_id("crdn-aaaa", ServerGroup::Coordinators);
    assert!(matches!(res, Err(AppError::ResourceNotFound)), "expected not found on second removal, got {:?}", res);

    Ok(())
}

#[test]
fn new_member_id_is_prefixed_and_lowercase() -> Result<()> {
    let members = DeploymentMembers::default();
    let id = members.new_member_id(ServerGroup::SyncWorkers);

    assert!(id.starts_with("sywo-"), "expected sywo- prefix, got {}", id);
    assert!(id.len() == 13, "unexpected id length, got {}, expected {}", id.len(), 13);
    assert!(id == id.to_lowercase(), "expected lowercase id, got {}", id);

    Ok(())
}

#[test]
fn conditions_update_reports_changes() -> Result<()> {
    let mut conditions = ConditionList::default();

    assert!(conditions.update(ConditionType::Ready, true, "PodReady", ""), "expected first update to be a change");
    assert!(!conditions.update(ConditionType::Ready, true, "PodReady", ""), "expected identical update to be a no-op");
    assert!(conditions.is_true(ConditionType::Ready), "expected Ready to be true");
    assert!(conditions.update(ConditionType::Ready, false, "PodNotReady", ""), "expected status flip to be a change");
    assert!(!conditions.is_true(ConditionType::Ready), "expected Ready to be false");
    assert!(conditions.remove(ConditionType::Ready), "expected removal of existing condition");
    assert!(!conditions.remove(ConditionType::Ready), "expected removal of missing condition to be a no-op");

    Ok(())
}

#[test]
fn unknown_action_types_are_preserved_as_unknown() -> Result<()> {
    let action: Action = serde_json::from_value(serde_json::json!({
        "id": "a1",
        "type": "UpgradeMember",
        "group": "dbservers",
        "memberId": "prmr-aaaa",
        "creationTime": "2018-05-01T10:00:00Z",
    }))?;

    assert!(action.type_ == ActionType::Unknown, "unexpected action type, got {}, expected {}", action.type_, ActionType::Unknown);
    assert!(action.start_time.is_none(), "expected action to be pending, got {:?}", action.start_time);

    Ok(())
}
