//! Structural plan invariants not expressible via JSON Schema.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::types::{PlannedStep, Step, StepAction, StepStatus};

/// Check structural invariants of a proposed plan:
/// - At least one step
/// - No duplicate step ids
/// - Exactly one of `instruction`/`tool_call`, instructions non-empty
/// - Tool names drawn from `known_tools`
/// - Dependencies reference existing ids, never the step itself
/// - The dependency graph is acyclic
///
/// Returns every violation found; an empty list means the plan is executable.
pub fn validate_plan(steps: &[PlannedStep], known_tools: &[&str]) -> Vec<String> {
    let mut errors = Vec::new();
    if steps.is_empty() {
        errors.push("plan has no steps".to_string());
        return errors;
    }

    let mut ids = BTreeSet::new();
    for step in steps {
        if !ids.insert(step.step_id) {
            errors.push(format!("duplicate step id {}", step.step_id));
        }
    }

    for step in steps {
        let id = step.step_id;
        match (&step.instruction, &step.tool_call) {
            (Some(_), Some(_)) | (None, None) => errors.push(format!(
                "step {id}: must have exactly one of 'instruction' or 'tool_call'"
            )),
            (Some(text), None) if text.trim().is_empty() => {
                errors.push(format!("step {id}: instruction is empty"));
            }
            (None, Some(call)) if !known_tools.contains(&call.tool_name.as_str()) => {
                errors.push(format!(
                    "step {id}: references an unknown tool '{}'",
                    call.tool_name
                ));
            }
            _ => {}
        }

        for dep in &step.dependencies {
            if *dep == id {
                errors.push(format!("step {id}: depends on itself"));
            } else if !ids.contains(dep) {
                errors.push(format!("step {id}: depends on unknown step {dep}"));
            }
        }
    }

    if let Some(cycle) = find_cycle(steps, &ids) {
        let listed: Vec<String> = cycle.iter().map(u32::to_string).collect();
        errors.push(format!(
            "dependency cycle among steps {}",
            listed.join(", ")
        ));
    }

    errors
}

/// Kahn's algorithm over resolvable, non-self edges. Returns the ids left
/// unsorted when a cycle exists.
fn find_cycle(steps: &[PlannedStep], ids: &BTreeSet<u32>) -> Option<Vec<u32>> {
    let mut indegree: BTreeMap<u32, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for step in steps {
        let deps: BTreeSet<u32> = step
            .dependencies
            .iter()
            .copied()
            .filter(|dep| *dep != step.step_id && ids.contains(dep))
            .collect();
        for dep in deps {
            *indegree.entry(step.step_id).or_default() += 1;
            dependents.entry(dep).or_default().push(step.step_id);
        }
    }

    let mut queue: VecDeque<u32> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        sorted.insert(id);
        for next in dependents.get(&id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = indegree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    let remaining: Vec<u32> = ids.difference(&sorted).copied().collect();
    if remaining.is_empty() {
        None
    } else {
        Some(remaining)
    }
}

/// Convert a validated plan into pending steps.
///
/// Callers must run [`validate_plan`] first; steps that violate the
/// one-action rule are skipped here.
pub fn into_steps(planned: Vec<PlannedStep>) -> Vec<Step> {
    planned
        .into_iter()
        .filter_map(|step| {
            let action = match (step.instruction, step.tool_call) {
                (Some(text), None) => StepAction::Instruction(text),
                (None, Some(call)) => StepAction::ToolCall(call),
                _ => return None,
            };
            Some(Step {
                id: step.step_id,
                dependencies: step.dependencies.into_iter().collect(),
                action,
                status: StepStatus::Pending,
                output: None,
                summary: None,
                retries: 0,
            })
        })
        .collect()
}
