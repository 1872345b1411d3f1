//! Executable frontier selection over a goal's dependency graph.

use std::collections::BTreeSet;

use crate::core::types::{Step, StepStatus};

/// Ids of steps whose status is `complete`.
pub fn completed_ids(plan: &[Step]) -> BTreeSet<u32> {
    plan.iter()
        .filter(|step| step.status == StepStatus::Complete)
        .map(|step| step.id)
        .collect()
}

/// Pending steps whose dependencies are all complete, in step id order.
pub fn frontier(plan: &[Step]) -> Vec<&Step> {
    let completed = completed_ids(plan);
    let mut ready: Vec<&Step> = plan
        .iter()
        .filter(|step| step.is_pending() && step.dependencies.is_subset(&completed))
        .collect();
    ready.sort_by_key(|step| step.id);
    ready
}

/// What the scheduler should do with a plan this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// No step is pending. `all_complete` decides the goal's terminal status.
    Finished { all_complete: bool },
    /// Pending steps exist but none is eligible yet.
    Blocked,
    /// Run these steps now.
    Dispatch(Batch),
}

/// A set of eligible steps to run together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    /// A heavyweight step runs alone, synchronously.
    Exclusive(u32),
    /// Independent plain steps run concurrently.
    Swarm(Vec<u32>),
}

/// Classify the plan's state and choose the next batch.
///
/// A heavyweight step in the frontier preempts the swarm: only the lowest-id
/// heavyweight step runs and every plain step waits for a later cycle.
pub fn plan_progress(plan: &[Step]) -> Progress {
    let ready = frontier(plan);
    if ready.is_empty() {
        if plan.iter().all(|step| !step.is_pending()) {
            return Progress::Finished {
                all_complete: plan.iter().all(|step| step.status == StepStatus::Complete),
            };
        }
        return Progress::Blocked;
    }

    if let Some(heavy) = ready.iter().find(|step| step.is_heavyweight()) {
        return Progress::Dispatch(Batch::Exclusive(heavy.id));
    }
    Progress::Dispatch(Batch::Swarm(ready.iter().map(|step| step.id).collect()))
}

/// Pending steps other than `except`, used as the monitor's view of the rest of the plan.
pub fn remaining_steps(plan: &[Step], except: u32) -> Vec<&Step> {
    plan.iter()
        .filter(|step| step.is_pending() && step.id != except)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{REACTIVE_SOLVE, ToolCall};

    fn complete(mut step: Step) -> Step {
        step.status = StepStatus::Complete;
        step.output = Some("done".to_string());
        step
    }

    #[test]
    fn diamond_runs_roots_then_join() {
        let plan = vec![
            Step::instruction(1, &[], "a"),
            Step::instruction(2, &[], "b"),
            Step::instruction(3, &[1, 2], "c"),
        ];
        assert_eq!(
            plan_progress(&plan),
            Progress::Dispatch(Batch::Swarm(vec![1, 2]))
        );

        let plan = vec![
            complete(Step::instruction(1, &[], "a")),
            complete(Step::instruction(2, &[], "b")),
            Step::instruction(3, &[1, 2], "c"),
        ];
        let ids: Vec<u32> = frontier(&plan).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn heavyweight_step_preempts_swarm() {
        let plan = vec![
            Step::instruction(1, &[], "a"),
            Step::tool(2, &[], ToolCall::new(REACTIVE_SOLVE)),
            Step::instruction(3, &[], "c"),
        ];
        assert_eq!(plan_progress(&plan), Progress::Dispatch(Batch::Exclusive(2)));
    }

    #[test]
    fn finished_reports_failure_when_any_step_failed() {
        let mut failed = Step::instruction(2, &[], "b");
        failed.status = StepStatus::Failed;
        let plan = vec![complete(Step::instruction(1, &[], "a")), failed];
        assert_eq!(
            plan_progress(&plan),
            Progress::Finished {
                all_complete: false
            }
        );
    }

    #[test]
    fn pending_step_behind_failed_dependency_is_blocked() {
        let mut failed = Step::instruction(1, &[], "a");
        failed.status = StepStatus::Failed;
        let plan = vec![failed, Step::instruction(2, &[1], "b")];
        assert_eq!(plan_progress(&plan), Progress::Blocked);
    }
}
