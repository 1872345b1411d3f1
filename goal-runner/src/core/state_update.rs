//! Orchestrator-owned step state transitions.

use crate::core::types::{Step, StepOutcome, StepStatus};

/// Maximum length of a step summary in characters.
pub const SUMMARY_MAX_CHARS: usize = 200;

/// How a dispatch outcome changed the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Output and summary recorded, step is complete.
    Completed,
    /// Transient failure with retries left; step stays pending.
    Retrying { retries: u32 },
    /// Transient failure after `max_retries` retries; step is failed and so is the goal.
    RetriesExhausted { retries: u32 },
    /// Quota sentinel; the step is untouched.
    RateLimited,
    /// A producer must answer before the step can run.
    AwaitingInput,
}

/// Apply a dispatch outcome to `step`.
///
/// Rate limits and input requests never touch the retry counter. Completion
/// sets output and summary exactly once; a non-pending step is left as is.
pub fn apply_step_outcome(step: &mut Step, outcome: &StepOutcome, max_retries: u32) -> Transition {
    match outcome {
        StepOutcome::Completed { output } => {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Complete;
                step.summary = Some(summarize(output));
                step.output = Some(output.clone());
            }
            Transition::Completed
        }
        StepOutcome::Failed { .. } => {
            if step.retries < max_retries {
                step.retries += 1;
                Transition::Retrying {
                    retries: step.retries,
                }
            } else {
                step.status = StepStatus::Failed;
                Transition::RetriesExhausted {
                    retries: step.retries,
                }
            }
        }
        StepOutcome::RateLimited => Transition::RateLimited,
        StepOutcome::AwaitingInput { .. } => Transition::AwaitingInput,
    }
}

/// First non-empty line of `output`, capped at [`SUMMARY_MAX_CHARS`].
pub fn summarize(output: &str) -> String {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if line.chars().count() <= SUMMARY_MAX_CHARS {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> StepOutcome {
        StepOutcome::Failed {
            error: "boom".to_string(),
        }
    }

    #[test]
    fn failure_retries_up_to_cap_then_fails() {
        let mut step = Step::instruction(1, &[], "a");
        assert_eq!(
            apply_step_outcome(&mut step, &failed(), 2),
            Transition::Retrying { retries: 1 }
        );
        assert_eq!(step.status, StepStatus::Pending);

        assert_eq!(
            apply_step_outcome(&mut step, &failed(), 2),
            Transition::Retrying { retries: 2 }
        );
        assert_eq!(
            apply_step_outcome(&mut step, &failed(), 2),
            Transition::RetriesExhausted { retries: 2 }
        );
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn rate_limit_does_not_count_as_retry() {
        let mut step = Step::instruction(1, &[], "a");
        assert_eq!(
            apply_step_outcome(&mut step, &StepOutcome::RateLimited, 2),
            Transition::RateLimited
        );
        assert_eq!(step.retries, 0);
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn completion_sets_output_once() {
        let mut step = Step::instruction(1, &[], "a");
        let first = StepOutcome::Completed {
            output: "\n  first line\nsecond".to_string(),
        };
        apply_step_outcome(&mut step, &first, 2);
        assert_eq!(step.summary.as_deref(), Some("first line"));

        let second = StepOutcome::Completed {
            output: "other".to_string(),
        };
        apply_step_outcome(&mut step, &second, 2);
        assert_eq!(step.output.as_deref(), Some("\n  first line\nsecond"));
    }

    #[test]
    fn summary_is_capped() {
        let long = "x".repeat(500);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS);
        assert!(summary.ends_with("..."));
    }
}
