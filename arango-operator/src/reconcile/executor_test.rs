use std::sync::atomic::Ordering;

use anyhow::Result;
use chrono::{Duration, Utc};

use super::*;
use crate::fixtures::{self, FakeContext};
use crate::resources::EventKind;
use arango_core::crd::{ConditionType, MemberPhase, ServerGroup};
use arango_core::AppError;

#[tokio::test]
async fn add_member_actions_drain_in_one_pass() -> Result<()> {
    let plan = vec![
        Action::new(ActionType::AddMember, ServerGroup::DBServers, None, "test"),
        Action::new(ActionType::AddMember, ServerGroup::Coordinators, None, "test"),
    ];
    let mut ctx = FakeContext::new(&[], plan);

    let needs_polling = execute_plan(&mut ctx).await?;

    assert!(!needs_polling, "expected drained plan to not need polling");
    assert!(ctx.status.plan.is_empty(), "expected plan to be drained, got {} actions", ctx.status.plan.len());
    assert!(ctx.plan_writes == 2, "expected one plan write per popped action, got {}, expected {}", ctx.plan_writes, 2);
    let (dbservers, coordinators) = (ctx.status.members.dbservers.len(), ctx.status.members.coordinators.len());
    assert!(dbservers == 1 && coordinators == 1, "unexpected member counts, got {}/{}, expected 1/1", dbservers, coordinators);
    assert!(
        ctx.status.members.dbservers[0].id.starts_with("prmr-"),
        "unexpected member id, got {}",
        ctx.status.members.dbservers[0].id
    );

    Ok(())
}

#[tokio::test]
async fn dbserver_removal_runs_start_and_poll_steps() -> Result<()> {
    let id = "prmr-aaaa";
    let plan = vec![
        Action::new(ActionType::CleanOutMember, ServerGroup::DBServers, Some(id), "test"),
        Action::new(ActionType::ShutdownMember, ServerGroup::DBServers, Some(id), "test"),
        Action::new(ActionType::RemoveMember, ServerGroup::DBServers, Some(id), "test"),
    ];
    let mut ctx = FakeContext::new(&[(ServerGroup::DBServers, fixtures::ready_member(id))], plan);

    // Clean out is started and then polled.
    assert!(execute_plan(&mut ctx).await?, "expected clean out to need polling");
    assert!(ctx.status.plan.len() == 3, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 3);
    assert!(ctx.status.plan[0].start_time.is_some(), "expected clean out action to be stamped as started");
    let member = ctx.member(id).ok_or_else(|| anyhow::anyhow!("member not found"))?;
    assert!(member.phase == MemberPhase::CleanOut, "unexpected member phase, got {:?}, expected {:?}", member.phase, MemberPhase::CleanOut);
    assert!(
        member.cleanout_job_id.as_deref() == Some("job-prmr-aaaa"),
        "unexpected clean out job, got {:?}",
        member.cleanout_job_id
    );

    assert!(execute_plan(&mut ctx).await?, "expected unfinished clean out to need polling");
    assert!(ctx.status.plan.len() == 3, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 3);

    // Clean out finishes, shutdown is started.
    ctx.client.cleaned_out.store(true, Ordering::SeqCst);
    assert!(execute_plan(&mut ctx).await?, "expected shutdown to need polling");
    assert!(ctx.status.plan.len() == 2, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 2);
    let member = ctx.member(id).ok_or_else(|| anyhow::anyhow!("member not found"))?;
    assert!(member.conditions.is_true(ConditionType::CleanedOut), "expected member to be marked as cleaned out");
    assert!(
        member.phase == MemberPhase::ShutdownPending,
        "unexpected member phase, got {:?}, expected {:?}",
        member.phase,
        MemberPhase::ShutdownPending
    );
    let calls = ctx.client.calls();
    assert!(calls.contains(&"shutdown true".to_string()), "expected shutdown call, got {:?}", calls);

    // Pod goes away, the member is removed.
    let pod_name = fixtures::names().pod_name(ServerGroup::DBServers, id);
    ctx.pods.lock().expect("lock poisoned").remove(&pod_name);
    assert!(!execute_plan(&mut ctx).await?, "expected drained plan to not need polling");
    assert!(ctx.status.plan.is_empty(), "expected plan to be drained, got {} actions", ctx.status.plan.len());
    assert!(ctx.member(id).is_none(), "expected member to be removed");
    let pvcs = ctx.pvcs_deleted.lock().expect("lock poisoned").clone();
    assert!(pvcs == vec![pod_name], "unexpected deleted claims, got {:?}", pvcs);

    Ok(())
}

#[tokio::test]
async fn started_action_is_polled_not_restarted() -> Result<()> {
    let id = "prmr-aaaa";
    let mut action = Action::new(ActionType::CleanOutMember, ServerGroup::DBServers, Some(id), "test");
    action.start_time = Some(Utc::now());
    let mut ctx = FakeContext::new(&[(ServerGroup::DBServers, fixtures::ready_member(id))], vec![action]);

    assert!(execute_plan(&mut ctx).await?, "expected unfinished clean out to need polling");

    let calls = ctx.client.calls();
    assert!(calls == vec!["is_cleaned_out prmr-aaaa".to_string()], "unexpected calls, got {:?}", calls);
    assert!(ctx.plan_writes == 0, "expected no plan writes while polling, got {}", ctx.plan_writes);

    Ok(())
}

#[tokio::test]
async fn unknown_action_aborts_the_tick() -> Result<()> {
    let mut action = Action::new(ActionType::AddMember, ServerGroup::DBServers, None, "test");
    action.type_ = ActionType::Unknown;
    let mut ctx = FakeContext::new(&[], vec![action]);

    let res = execute_plan(&mut ctx).await;

    assert!(matches!(res, Err(AppError::UnknownAction(_))), "expected unknown action error, got {:?}", res);
    assert!(ctx.status.plan.len() == 1, "expected plan to be left untouched, got {} actions", ctx.status.plan.len());
    assert!(ctx.status.members.dbservers.is_empty(), "expected no members to be created");

    Ok(())
}

#[tokio::test]
async fn timed_out_action_drops_the_plan() -> Result<()> {
    let id = "crdn-aaaa";
    let mut rotate = Action::new(ActionType::RotateMember, ServerGroup::Coordinators, Some(id), "test");
    rotate.start_time = Some(Utc::now() - Duration::minutes(6));
    let wait = Action::new(ActionType::WaitForMemberUp, ServerGroup::Coordinators, Some(id), "test");
    let mut ctx = FakeContext::new(&[(ServerGroup::Coordinators, fixtures::member(id))], vec![rotate, wait]);

    let needs_polling = execute_plan(&mut ctx).await?;

    assert!(needs_polling, "expected a quick follow up after a timeout");
    assert!(ctx.status.plan.is_empty(), "expected plan to be dropped, got {} actions", ctx.status.plan.len());
    let events = ctx.events.lock().expect("lock poisoned").clone();
    assert!(
        events == vec![(EventKind::Warning, "ActionTimeout".to_string())],
        "unexpected events, got {:?}",
        events
    );

    Ok(())
}

#[tokio::test]
async fn removal_of_missing_member_succeeds() -> Result<()> {
    let plan = vec![Action::new(ActionType::RemoveMember, ServerGroup::Coordinators, Some("crdn-gone"), "test")];
    let mut ctx = FakeContext::new(&[], plan);

    let needs_polling = execute_plan(&mut ctx).await?;

    assert!(!needs_polling, "expected drained plan to not need polling");
    assert!(ctx.status.plan.is_empty(), "expected plan to be drained, got {} actions", ctx.status.plan.len());
    let deleted = ctx.pods_deleted.lock().expect("lock poisoned").clone();
    assert!(deleted.is_empty(), "expected no pods to be deleted, got {:?}", deleted);

    Ok(())
}

#[tokio::test]
async fn rotation_waits_for_member_to_come_back() -> Result<()> {
    let id = "crdn-aaaa";
    let plan = vec![
        Action::new(ActionType::RotateMember, ServerGroup::Coordinators, Some(id), "test"),
        Action::new(ActionType::WaitForMemberUp, ServerGroup::Coordinators, Some(id), "test"),
    ];
    let mut ctx = FakeContext::new(&[(ServerGroup::Coordinators, fixtures::ready_member(id))], plan);

    assert!(execute_plan(&mut ctx).await?, "expected rotation to need polling");
    let member = ctx.member(id).ok_or_else(|| anyhow::anyhow!("member not found"))?;
    assert!(member.phase == MemberPhase::Rotating, "unexpected member phase, got {:?}, expected {:?}", member.phase, MemberPhase::Rotating);
    assert!(!member.is_ready(), "expected rotating member to not be ready");
    let deleted = ctx.pods_deleted.lock().expect("lock poisoned").clone();
    assert!(deleted.len() == 1, "expected the member pod to be deleted, got {:?}", deleted);

    // The pod is recreated but not ready yet.
    ctx.status.members.update(fixtures::member(id), ServerGroup::Coordinators)?;
    assert!(execute_plan(&mut ctx).await?, "expected wait for member to need polling");
    assert!(ctx.status.plan.len() == 1, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 1);
    assert!(execute_plan(&mut ctx).await?, "expected unready member to need polling");

    // The member reports ready and answers requests.
    ctx.status.members.update(fixtures::ready_member(id), ServerGroup::Coordinators)?;
    assert!(!execute_plan(&mut ctx).await?, "expected drained plan to not need polling");
    assert!(ctx.status.plan.is_empty(), "expected plan to be drained, got {} actions", ctx.status.plan.len());

    Ok(())
}

#[tokio::test]
async fn maintenance_mode_is_toggled_and_confirmed() -> Result<()> {
    let id = "prmr-aaaa";
    let plan = vec![
        Action::new(ActionType::EnableMaintenance, ServerGroup::DBServers, Some(id), "test"),
        Action::new(ActionType::DisableMaintenance, ServerGroup::DBServers, Some(id), "test"),
    ];
    let mut ctx = FakeContext::new(&[(ServerGroup::DBServers, fixtures::ready_member(id))], plan);

    assert!(execute_plan(&mut ctx).await?, "expected enabling maintenance to need polling");
    assert!(ctx.client.maintenance.load(Ordering::SeqCst), "expected maintenance mode to be enabled");
    assert!(ctx.status.plan.len() == 2, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 2);

    assert!(execute_plan(&mut ctx).await?, "expected disabling maintenance to need polling");
    assert!(!ctx.client.maintenance.load(Ordering::SeqCst), "expected maintenance mode to be disabled");
    assert!(ctx.status.plan.len() == 1, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 1);

    assert!(!execute_plan(&mut ctx).await?, "expected drained plan to not need polling");
    let calls = ctx.client.calls();
    let expected = vec![
        "set_maintenance_mode true".to_string(),
        "get_maintenance_mode".to_string(),
        "set_maintenance_mode false".to_string(),
        "get_maintenance_mode".to_string(),
    ];
    assert!(calls == expected, "unexpected calls, got {:?}, expected {:?}", calls, expected);

    Ok(())
}

#[tokio::test]
async fn failing_start_times_out() -> Result<()> {
    let id = "prmr-aaaa";
    let plan = vec![
        Action::new(ActionType::CleanOutMember, ServerGroup::DBServers, Some(id), "test"),
        Action::new(ActionType::ShutdownMember, ServerGroup::DBServers, Some(id), "test"),
    ];
    let mut ctx = FakeContext::new(&[(ServerGroup::DBServers, fixtures::member(id))], plan);
    ctx.client.unavailable.store(true, Ordering::SeqCst);

    let res = execute_plan(&mut ctx).await;
    assert!(res.is_err(), "expected failing clean out to return its error, got {:?}", res);
    let failed = ctx.status.plan[0].start_failed_time;
    assert!(failed.is_some(), "expected the failed start to be recorded");
    assert!(ctx.status.plan[0].start_time.is_none(), "expected the action to not be marked as started");

    // Further failures keep the time of the first one and retry the start.
    let res = execute_plan(&mut ctx).await;
    assert!(res.is_err(), "expected failing clean out to return its error, got {:?}", res);
    assert!(ctx.status.plan[0].start_failed_time == failed, "expected the first failure time to be kept");
    assert!(ctx.plan_writes == 1, "unexpected plan writes, got {}, expected {}", ctx.plan_writes, 1);
    let starts = ctx.client.calls().iter().filter(|call| call.starts_with("clean_out_server")).count();
    assert!(starts == 2, "unexpected number of clean out attempts, got {}, expected {}", starts, 2);

    // Once failing for longer than the timeout of the action, the plan is dropped.
    ctx.status.plan[0].start_failed_time = Some(Utc::now() - Duration::hours(13));
    assert!(execute_plan(&mut ctx).await?, "expected a quick follow up after a timeout");
    assert!(ctx.status.plan.is_empty(), "expected plan to be dropped, got {} actions", ctx.status.plan.len());
    let events = ctx.events.lock().expect("lock poisoned").clone();
    assert!(
        events == vec![(EventKind::Warning, "ActionTimeout".to_string())],
        "unexpected events, got {:?}",
        events
    );

    Ok(())
}

#[tokio::test]
async fn timed_out_rotation_still_releases_maintenance() -> Result<()> {
    let id = "prmr-aaaa";
    let mut wait = Action::new(ActionType::WaitForMemberUp, ServerGroup::DBServers, Some(id), "test");
    wait.start_time = Some(Utc::now() - Duration::minutes(16));
    let plan = vec![wait, Action::new(ActionType::DisableMaintenance, ServerGroup::DBServers, Some(id), "test")];
    let mut ctx = FakeContext::new(&[(ServerGroup::DBServers, fixtures::member(id))], plan);
    ctx.client.maintenance.store(true, Ordering::SeqCst);

    assert!(execute_plan(&mut ctx).await?, "expected a quick follow up after a timeout");
    assert!(ctx.status.plan.len() == 1, "unexpected plan length, got {}, expected {}", ctx.status.plan.len(), 1);
    let head = &ctx.status.plan[0];
    assert!(
        head.type_ == ActionType::DisableMaintenance,
        "unexpected remaining action, got {}, expected {}",
        head.type_,
        ActionType::DisableMaintenance
    );
    assert!(head.start_time.is_none(), "expected the remaining action to not be started yet");

    assert!(execute_plan(&mut ctx).await?, "expected disabling maintenance to need polling");
    assert!(!execute_plan(&mut ctx).await?, "expected drained plan to not need polling");
    assert!(!ctx.client.maintenance.load(Ordering::SeqCst), "expected maintenance mode to be disabled");

    Ok(())
}
