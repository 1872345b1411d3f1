//! Step Dispatcher: runs one step and reports its outcome.
//!
//! Instructions are resolved, optionally refined on the utility tier, and
//! executed on the goal's tier. Tool calls go to the [`ToolBox`], except
//! `reactive_solve`, which runs the [`ReactSolver`]. The dispatcher never
//! mutates the goal; the orchestrator applies the returned outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::placeholders::{resolve_text, resolve_value};
use crate::core::types::{Goal, REACTIVE_SOLVE, Step, StepAction, StepOutcome, ToolCall};
use crate::io::config::RunnerConfig;
use crate::io::generator::{Generation, GenerationRequest, Generator};
use crate::io::prompt::{ContextEntry, PromptBuilder, StepPrompt};
use crate::react::{ReactLimits, ReactOutcome, ReactRequest, ReactSolver, Sleeper, describe_turn};
use crate::tools::{ToolBox, ToolResult};

/// The parts of a goal a step needs, detached from the mutable goal.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalView {
    pub text: String,
    pub strategy: Option<String>,
    pub tier: String,
}

impl GoalView {
    pub fn of(goal: &Goal) -> Self {
        let strategy = match &goal.strategy {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => serde_json::to_string_pretty(other).ok(),
        };
        Self {
            text: goal.text.clone(),
            strategy,
            tier: goal.preferred_tier.clone(),
        }
    }
}

/// Everything needed to run one step.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub goal: &'a GoalView,
    pub step: &'a Step,
    /// Curated outputs shown to the model.
    pub context: &'a BTreeMap<u32, String>,
    /// Every completed output, for placeholder substitution.
    pub outputs: &'a BTreeMap<u32, String>,
}

/// A step outcome plus the lines the orchestrator should log for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub outcome: StepOutcome,
    pub log: Vec<String>,
}

impl Dispatched {
    fn new(outcome: StepOutcome, log: Vec<String>) -> Self {
        Self { outcome, log }
    }

    fn failed(error: String, log: Vec<String>) -> Self {
        Self::new(StepOutcome::Failed { error }, log)
    }
}

pub struct Dispatcher {
    generator: Arc<dyn Generator>,
    sleeper: Arc<dyn Sleeper>,
    tools: ToolBox,
    prompts: PromptBuilder,
    limits: ReactLimits,
    utility_tier: String,
    refine: bool,
}

impl Dispatcher {
    pub fn new(
        config: &RunnerConfig,
        generator: Arc<dyn Generator>,
        sleeper: Arc<dyn Sleeper>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            generator,
            sleeper,
            tools: ToolBox::new(output_dir),
            prompts: PromptBuilder::new(config.dispatch.prompt_budget_bytes),
            limits: ReactLimits::from_config(config),
            utility_tier: config.utility_tier.clone(),
            refine: config.dispatch.refine_prompts,
        }
    }

    #[instrument(skip_all, fields(step_id = request.step.id, tier = %request.goal.tier))]
    pub fn dispatch(&self, request: &DispatchRequest<'_>) -> Dispatched {
        match &request.step.action {
            StepAction::Instruction(text) => self.run_instruction(request, text),
            StepAction::ToolCall(call) => {
                let resolved = ToolCall {
                    tool_name: call.tool_name.clone(),
                    parameters: call
                        .parameters
                        .iter()
                        .map(|(key, value)| (key.clone(), resolve_value(value, request.outputs)))
                        .collect(),
                };
                if resolved.tool_name == REACTIVE_SOLVE {
                    self.run_reactive(request, &resolved)
                } else {
                    self.run_tool(request, &resolved)
                }
            }
        }
    }

    fn run_instruction(&self, request: &DispatchRequest<'_>, text: &str) -> Dispatched {
        let id = request.step.id;
        let mut log = Vec::new();
        let resolved = resolve_text(text, request.outputs);
        let refined = if self.refine {
            self.refine_instruction(request, &resolved, &mut log)
        } else {
            None
        };
        let prompt = match self.prompts.step(&StepPrompt {
            goal: &request.goal.text,
            strategy: request.goal.strategy.clone(),
            instruction: refined.as_deref().unwrap_or(&resolved),
            context: context_entries(request.context),
        }) {
            Ok(prompt) => prompt,
            Err(err) => return Dispatched::failed(format!("render step {id} prompt: {err:#}"), log),
        };
        match self
            .generator
            .generate(&GenerationRequest::new(prompt, &request.goal.tier))
        {
            Generation::Text(output) => {
                Dispatched::new(StepOutcome::Completed { output }, log)
            }
            Generation::RateLimited => Dispatched::new(StepOutcome::RateLimited, log),
            Generation::Failed(err) => Dispatched::failed(err, log),
        }
    }

    /// Rewrite the instruction on the utility tier. Any failure keeps the original.
    fn refine_instruction(
        &self,
        request: &DispatchRequest<'_>,
        instruction: &str,
        log: &mut Vec<String>,
    ) -> Option<String> {
        let id = request.step.id;
        let prompt = self
            .prompts
            .refine(&StepPrompt {
                goal: &request.goal.text,
                strategy: request.goal.strategy.clone(),
                instruction,
                context: Vec::new(),
            })
            .ok()?;
        match self
            .generator
            .generate(&GenerationRequest::new(prompt, &self.utility_tier))
        {
            Generation::Text(text) if !text.trim().is_empty() => {
                debug!(step_id = id, "instruction refined");
                log.push(format!("step {id}: instruction refined on {}", self.utility_tier));
                Some(text.trim().to_string())
            }
            other => {
                let reason = match other {
                    Generation::RateLimited => "rate limited".to_string(),
                    Generation::Failed(err) => err,
                    Generation::Text(_) => "empty refinement".to_string(),
                };
                warn!(step_id = id, reason = %reason, "refinement skipped");
                log.push(format!("step {id}: refinement skipped ({reason}); using original"));
                None
            }
        }
    }

    fn run_tool(&self, request: &DispatchRequest<'_>, call: &ToolCall) -> Dispatched {
        let outcome = match self
            .tools
            .execute(call, self.generator.as_ref(), &request.goal.tier)
        {
            ToolResult::Output(output) => StepOutcome::Completed { output },
            ToolResult::RateLimited => StepOutcome::RateLimited,
            ToolResult::AwaitingInput(question) => StepOutcome::AwaitingInput { question },
            ToolResult::Error(error) => StepOutcome::Failed { error },
        };
        Dispatched::new(outcome, Vec::new())
    }

    fn run_reactive(&self, request: &DispatchRequest<'_>, call: &ToolCall) -> Dispatched {
        let id = request.step.id;
        let Some(sub_goal) = call.param_str("sub_goal") else {
            return Dispatched::failed(
                format!("step {id}: reactive_solve requires a 'sub_goal' parameter"),
                Vec::new(),
            );
        };
        let first_action = call.param_str("first_tool").map(|tool_name| ToolCall {
            tool_name,
            parameters: call
                .parameters
                .get("first_parameters")
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        });

        let solver = ReactSolver {
            generator: self.generator.as_ref(),
            tools: &self.tools,
            prompts: &self.prompts,
            sleeper: self.sleeper.as_ref(),
            limits: &self.limits,
        };
        let run = match solver.solve(&ReactRequest {
            goal: &request.goal.text,
            strategy: request.goal.strategy.clone(),
            sub_goal: &sub_goal,
            context: context_entries(request.context),
            tier: &request.goal.tier,
            first_action,
        }) {
            Ok(run) => run,
            Err(err) => {
                return Dispatched::failed(format!("step {id}: solver error: {err:#}"), Vec::new());
            }
        };

        let mut log: Vec<String> = run
            .turns
            .iter()
            .enumerate()
            .map(|(index, turn)| format!("step {id}: {}", describe_turn(index, turn)))
            .collect();
        let outcome = match run.outcome {
            ReactOutcome::Finished(answer) => StepOutcome::Completed { output: answer },
            ReactOutcome::Exhausted => StepOutcome::Failed {
                error: format!(
                    "reactive solver used all {} iterations without finishing",
                    run.iterations
                ),
            },
            ReactOutcome::Escalate | ReactOutcome::RateLimited => StepOutcome::RateLimited,
        };
        log.push(format!(
            "step {id}: reactive solver stopped after {} iterations",
            run.iterations
        ));
        Dispatched::new(outcome, log)
    }
}

fn context_entries(context: &BTreeMap<u32, String>) -> Vec<ContextEntry> {
    context
        .iter()
        .map(|(id, output)| ContextEntry {
            id: *id,
            output: output.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoopSleeper, ScriptedGenerator};
    use crate::tools::{REQUEST_USER_INPUT, WRITE_TO_FILE};

    fn dispatcher(generator: Arc<ScriptedGenerator>, refine: bool, out: PathBuf) -> Dispatcher {
        let mut config = RunnerConfig::default();
        config.dispatch.refine_prompts = refine;
        Dispatcher::new(&config, generator, Arc::new(NoopSleeper::default()), out)
    }

    fn view(tier: &str) -> GoalView {
        GoalView {
            text: "write a travel brief".to_string(),
            strategy: None,
            tier: tier.to_string(),
        }
    }

    fn outputs() -> BTreeMap<u32, String> {
        BTreeMap::from([(1, "Lisbon is sunny".to_string())])
    }

    #[test]
    fn instruction_is_refined_then_run_on_goal_tier() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Generation::Text("Write three sentences about Lisbon is sunny.".to_string()),
            Generation::Text("brief".to_string()),
        ]));
        let d = dispatcher(generator.clone(), true, PathBuf::from("out"));
        let step = Step::instruction(2, &[1], "summarize [output_of_step_1]");
        let outputs = outputs();
        let g = view("tier3");
        let result = d.dispatch(&DispatchRequest {
            goal: &g,
            step: &step,
            context: &outputs,
            outputs: &outputs,
        });
        assert_eq!(
            result.outcome,
            StepOutcome::Completed {
                output: "brief".to_string()
            }
        );
        let calls = generator.calls();
        assert_eq!(calls[0].tier, "tier2");
        assert!(calls[0].prompt.contains("summarize Lisbon is sunny"));
        assert_eq!(calls[1].tier, "tier3");
        assert!(calls[1].prompt.contains("Write three sentences"));
        assert!(result.log[0].contains("refined"));
    }

    #[test]
    fn failed_refinement_keeps_original_instruction() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Generation::RateLimited,
            Generation::Text("done".to_string()),
        ]));
        let d = dispatcher(generator.clone(), true, PathBuf::from("out"));
        let step = Step::instruction(1, &[], "say hello");
        let empty = BTreeMap::new();
        let g = view("tier1");
        let result = d.dispatch(&DispatchRequest {
            goal: &g,
            step: &step,
            context: &empty,
            outputs: &empty,
        });
        assert!(matches!(result.outcome, StepOutcome::Completed { .. }));
        assert!(generator.calls()[1].prompt.contains("say hello"));
        assert!(result.log[0].contains("rate limited"));
    }

    #[test]
    fn tool_parameters_are_resolved_before_execution() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = Arc::new(ScriptedGenerator::always_text("unused"));
        let d = dispatcher(generator, false, temp.path().to_path_buf());
        let step = Step::tool(
            2,
            &[1],
            ToolCall::new(WRITE_TO_FILE)
                .with_param("filename", "brief.md")
                .with_param("content", "# Brief\n[output_of_step_1]"),
        );
        let outputs = outputs();
        let g = view("tier2");
        let result = d.dispatch(&DispatchRequest {
            goal: &g,
            step: &step,
            context: &outputs,
            outputs: &outputs,
        });
        assert!(matches!(result.outcome, StepOutcome::Completed { .. }));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("brief.md")).expect("read"),
            "# Brief\nLisbon is sunny"
        );
    }

    #[test]
    fn request_user_input_maps_to_awaiting_input() {
        let generator = Arc::new(ScriptedGenerator::always_text("unused"));
        let d = dispatcher(generator, false, PathBuf::from("out"));
        let step = Step::tool(
            1,
            &[],
            ToolCall::new(REQUEST_USER_INPUT).with_param("question", "Budget?"),
        );
        let empty = BTreeMap::new();
        let g = view("tier2");
        let result = d.dispatch(&DispatchRequest {
            goal: &g,
            step: &step,
            context: &empty,
            outputs: &empty,
        });
        assert_eq!(
            result.outcome,
            StepOutcome::AwaitingInput {
                question: "Budget?".to_string()
            }
        );
    }

    /// An escalating solver surfaces as the rate-limit sentinel.
    #[test]
    fn reactive_escalation_is_rate_limited_outcome() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Generation::RateLimited]));
        let d = dispatcher(generator, false, PathBuf::from("out"));
        let step = Step::tool(
            1,
            &[],
            ToolCall::new(REACTIVE_SOLVE).with_param("sub_goal", "find a venue"),
        );
        let empty = BTreeMap::new();
        let g = view("tier1");
        let result = d.dispatch(&DispatchRequest {
            goal: &g,
            step: &step,
            context: &empty,
            outputs: &empty,
        });
        assert_eq!(result.outcome, StepOutcome::RateLimited);
    }

    #[test]
    fn reactive_without_sub_goal_fails() {
        let generator = Arc::new(ScriptedGenerator::always_text("unused"));
        let d = dispatcher(generator.clone(), false, PathBuf::from("out"));
        let step = Step::tool(1, &[], ToolCall::new(REACTIVE_SOLVE));
        let empty = BTreeMap::new();
        let g = view("tier2");
        let result = d.dispatch(&DispatchRequest {
            goal: &g,
            step: &step,
            context: &empty,
            outputs: &empty,
        });
        assert!(matches!(result.outcome, StepOutcome::Failed { .. }));
        assert!(generator.calls().is_empty());
    }
}
