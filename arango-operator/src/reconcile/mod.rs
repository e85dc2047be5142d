//! Reconciliation of a deployment's topology.
//!
//! The plan builder diffs the desired spec against the observed status and yields a short queue of
//! corrective actions. The executor drains that queue one action at a time, persisting progress
//! after every step so that a restarted operator resumes exactly where it left off.

mod executor;
#[cfg(test)]
mod executor_test;
mod plan_builder;

pub use executor::{execute_plan, register_metrics, ActionContext};
pub use plan_builder::{create_plan, select_member_to_remove};

use arango_core::crd::{Action, ActionType};

/// Check if the given plan changes the member count of any group.
pub fn plan_has_scaling_actions(plan: &[Action]) -> bool {
    plan.iter().any(|action| matches!(action.type_, ActionType::AddMember | ActionType::RemoveMember))
}
