//! Reactive sub-solver: a bounded think-act-observe loop for open-ended steps.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::state_update::summarize;
use crate::core::types::ToolCall;
use crate::io::config::RunnerConfig;
use crate::io::generator::{Generation, GenerationRequest, Generator, extract_json};
use crate::io::prompt::{ContextEntry, PromptBuilder, ReactPrompt, TurnView};
use crate::tools::{FINISH, ToolBox, ToolResult, WEB_SEARCH, WEB_SEARCH_ALIAS, WRITE_TO_FILE};

const REACT_TOOLS: &[&str] = &[WEB_SEARCH, WEB_SEARCH_ALIAS, WRITE_TO_FILE, FINISH];

/// Blocking wait used for rate-limit backoff. Tests substitute a recorder.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Bounds of one solver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactLimits {
    pub max_iterations: u32,
    pub max_rate_limit_waits: u32,
    pub rate_limit_backoff: Duration,
    pub premium_tier: String,
}

impl ReactLimits {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            max_iterations: config.react.max_iterations,
            max_rate_limit_waits: config.react.max_rate_limit_waits,
            rate_limit_backoff: config.orchestrator.rate_limit_backoff(),
            premium_tier: config.premium_tier.clone(),
        }
    }
}

/// One sub-goal to solve.
#[derive(Debug, Clone)]
pub struct ReactRequest<'a> {
    pub goal: &'a str,
    pub strategy: Option<String>,
    pub sub_goal: &'a str,
    pub context: Vec<ContextEntry>,
    pub tier: &'a str,
    /// Hot start: run this action before the first model round-trip.
    pub first_action: Option<ToolCall>,
}

/// One recorded turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactTurn {
    pub thought: String,
    pub action: String,
    pub observation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactOutcome {
    Finished(String),
    /// Premium tier exhausted; the goal needs a tier decision.
    Escalate,
    /// Fallback tier stayed exhausted; the orchestrator should defer.
    RateLimited,
    /// Iteration cap reached without `finish`.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ReactRun {
    pub outcome: ReactOutcome,
    pub turns: Vec<ReactTurn>,
    pub iterations: u32,
}

/// Either an observation to record or a terminal outcome.
enum Act {
    Observe(String),
    Stop(ReactOutcome),
}

pub struct ReactSolver<'a> {
    pub generator: &'a dyn Generator,
    pub tools: &'a ToolBox,
    pub prompts: &'a PromptBuilder,
    pub sleeper: &'a dyn Sleeper,
    pub limits: &'a ReactLimits,
}

impl ReactSolver<'_> {
    #[instrument(skip_all, fields(tier = request.tier))]
    pub fn solve(&self, request: &ReactRequest<'_>) -> Result<ReactRun> {
        let mut turns = Vec::new();
        let mut iterations = 0u32;
        let mut waits = 0u32;

        if let Some(first) = &request.first_action {
            debug!(tool = %first.tool_name, "hot start");
            match self.act(first, request.tier, &mut waits) {
                Act::Observe(observation) => {
                    turns.push(turn("Hot start from the plan.", first, observation));
                    iterations += 1;
                }
                Act::Stop(outcome) => return Ok(finish(outcome, turns, iterations)),
            }
        }

        while iterations < self.limits.max_iterations {
            let prompt = self.prompts.react(&ReactPrompt {
                goal: request.goal,
                strategy: request.strategy.clone(),
                sub_goal: request.sub_goal,
                context: request.context.clone(),
                history: turns
                    .iter()
                    .map(|t: &ReactTurn| TurnView {
                        thought: t.thought.clone(),
                        action: t.action.clone(),
                        observation: t.observation.clone(),
                    })
                    .collect(),
                tools: ToolBox::react_specs(),
            })?;

            let text = match self
                .generator
                .generate(&GenerationRequest::new(prompt, request.tier))
            {
                Generation::Text(text) => text,
                Generation::RateLimited => match self.wait_or_stop(request.tier, &mut waits) {
                    Some(outcome) => return Ok(finish(outcome, turns, iterations)),
                    None => continue,
                },
                Generation::Failed(err) => {
                    warn!(err = %err, "solver generation failed");
                    waits = 0;
                    turns.push(ReactTurn {
                        thought: String::new(),
                        action: "(none)".to_string(),
                        observation: format!("Generation failed: {err}"),
                    });
                    iterations += 1;
                    continue;
                }
            };
            waits = 0;

            let Some((thought, call)) = parse_turn(&text) else {
                turns.push(ReactTurn {
                    thought: String::new(),
                    action: "(unparseable)".to_string(),
                    observation: "Your reply was not a JSON object with `thought` and \
                                  `action.tool_name`. Reply with exactly one such object."
                        .to_string(),
                });
                iterations += 1;
                continue;
            };

            match self.act(&call, request.tier, &mut waits) {
                Act::Observe(observation) => turns.push(turn(&thought, &call, observation)),
                Act::Stop(outcome) => return Ok(finish(outcome, turns, iterations + 1)),
            }
            iterations += 1;
        }

        info!(iterations, "solver hit iteration cap");
        Ok(finish(ReactOutcome::Exhausted, turns, iterations))
    }

    fn act(&self, call: &ToolCall, tier: &str, waits: &mut u32) -> Act {
        if call.tool_name == FINISH {
            return match call.param_str("answer") {
                Some(answer) if !answer.trim().is_empty() => {
                    Act::Stop(ReactOutcome::Finished(answer))
                }
                _ => Act::Observe("`finish` needs a non-empty `answer` parameter.".to_string()),
            };
        }
        if !REACT_TOOLS.contains(&call.tool_name.as_str()) {
            return Act::Observe(format!(
                "Unknown tool '{}'. Available: {}.",
                call.tool_name,
                REACT_TOOLS.join(", ")
            ));
        }
        loop {
            match self.tools.execute(call, self.generator, tier) {
                ToolResult::Output(output) => return Act::Observe(output),
                ToolResult::Error(err) => return Act::Observe(format!("Tool error: {err}")),
                ToolResult::AwaitingInput(question) => {
                    return Act::Observe(format!(
                        "The user cannot be asked from here ({question}); decide without them."
                    ));
                }
                ToolResult::RateLimited => {
                    if let Some(outcome) = self.wait_or_stop(tier, waits) {
                        return Act::Stop(outcome);
                    }
                }
            }
        }
    }

    /// Premium quota escalates at once; fallback quota waits unless the
    /// consecutive-wait cap is spent.
    fn wait_or_stop(&self, tier: &str, waits: &mut u32) -> Option<ReactOutcome> {
        if tier == self.limits.premium_tier {
            info!(tier, "premium tier rate limited; escalating");
            return Some(ReactOutcome::Escalate);
        }
        if *waits >= self.limits.max_rate_limit_waits {
            info!(tier, waits = *waits, "rate limit persisted; deferring");
            return Some(ReactOutcome::RateLimited);
        }
        *waits += 1;
        debug!(tier, waits = *waits, "rate limited; backing off");
        self.sleeper.sleep(self.limits.rate_limit_backoff);
        None
    }
}

fn turn(thought: &str, call: &ToolCall, observation: String) -> ReactTurn {
    ReactTurn {
        thought: thought.to_string(),
        action: serde_json::to_string(call).unwrap_or_else(|_| call.tool_name.clone()),
        observation,
    }
}

fn finish(outcome: ReactOutcome, turns: Vec<ReactTurn>, iterations: u32) -> ReactRun {
    ReactRun {
        outcome,
        turns,
        iterations,
    }
}

fn parse_turn(text: &str) -> Option<(String, ToolCall)> {
    let value = extract_json(text)?;
    let thought = value
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let call: ToolCall = serde_json::from_value(value.get("action")?.clone()).ok()?;
    (!call.tool_name.trim().is_empty()).then_some((thought, call))
}

/// One-line digest of a turn for the goal's execution log.
pub fn describe_turn(index: usize, turn: &ReactTurn) -> String {
    format!(
        "react turn {}: {} -> {}",
        index + 1,
        turn.action,
        summarize(&turn.observation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoopSleeper, ScriptedGenerator};

    fn limits() -> ReactLimits {
        ReactLimits::from_config(&RunnerConfig::default())
    }

    fn request(tier: &str) -> ReactRequest<'_> {
        ReactRequest {
            goal: "plan a trip",
            strategy: None,
            sub_goal: "find the capital of Australia",
            context: Vec::new(),
            tier,
            first_action: None,
        }
    }

    fn search_reply() -> Generation {
        Generation::Text(
            r#"{"thought": "look it up", "action": {"tool_name": "web_search", "parameters": {"query": "capital of Australia"}}}"#
                .to_string(),
        )
    }

    fn finish_reply(answer: &str) -> Generation {
        Generation::Text(format!(
            r#"{{"thought": "done", "action": {{"tool_name": "finish", "parameters": {{"answer": "{answer}"}}}}}}"#
        ))
    }

    fn solve(
        generator: &ScriptedGenerator,
        sleeper: &NoopSleeper,
        limits: &ReactLimits,
        request: &ReactRequest<'_>,
    ) -> ReactRun {
        let tools = ToolBox::new("out");
        let prompts = PromptBuilder::new(60_000);
        ReactSolver {
            generator,
            tools: &tools,
            prompts: &prompts,
            sleeper,
            limits,
        }
        .solve(request)
        .expect("solve")
    }

    #[test]
    fn search_then_finish() {
        let generator = ScriptedGenerator::new(vec![
            search_reply(),
            Generation::Text("Canberra".to_string()),
            finish_reply("Canberra"),
        ]);
        let run = solve(&generator, &NoopSleeper::default(), &limits(), &request("tier2"));
        assert_eq!(run.outcome, ReactOutcome::Finished("Canberra".to_string()));
        assert_eq!(run.turns.len(), 1);
        assert_eq!(run.turns[0].observation, "Canberra");
        assert_eq!(run.iterations, 2);
        // The second model turn saw the first observation.
        assert!(generator.calls()[2].prompt.contains("Observation: Canberra"));
    }

    /// The hot-start tool runs before the first model call and counts as a turn.
    #[test]
    fn hot_start_counts_as_iteration() {
        let generator = ScriptedGenerator::new(vec![
            Generation::Text("Canberra".to_string()),
            finish_reply("Canberra"),
        ]);
        let mut req = request("tier2");
        req.first_action = Some(
            ToolCall::new(WEB_SEARCH).with_param("query", "capital of Australia"),
        );
        let run = solve(&generator, &NoopSleeper::default(), &limits(), &req);
        assert_eq!(run.outcome, ReactOutcome::Finished("Canberra".to_string()));
        assert_eq!(run.iterations, 2);
        let calls = generator.calls();
        assert!(calls[0].search, "hot start is the search itself");
        assert!(!calls[1].search);
    }

    #[test]
    fn premium_rate_limit_escalates_without_sleeping() {
        let generator = ScriptedGenerator::new(vec![Generation::RateLimited]);
        let sleeper = NoopSleeper::default();
        let run = solve(&generator, &sleeper, &limits(), &request("tier1"));
        assert_eq!(run.outcome, ReactOutcome::Escalate);
        assert!(sleeper.slept().is_empty());
    }

    /// Fallback waits do not consume iterations; the wait cap defers.
    #[test]
    fn fallback_rate_limit_waits_then_defers() {
        let mut limits = limits();
        limits.max_rate_limit_waits = 2;
        limits.max_iterations = 1;
        let generator = ScriptedGenerator::from_fn(|_| Generation::RateLimited);
        let sleeper = NoopSleeper::default();
        let run = solve(&generator, &sleeper, &limits, &request("tier2"));
        assert_eq!(run.outcome, ReactOutcome::RateLimited);
        assert_eq!(run.iterations, 0);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(30); 2]);
        assert_eq!(generator.calls().len(), 3);
    }

    #[test]
    fn fallback_rate_limit_recovers() {
        let generator = ScriptedGenerator::new(vec![
            Generation::RateLimited,
            finish_reply("42"),
        ]);
        let sleeper = NoopSleeper::default();
        let run = solve(&generator, &sleeper, &limits(), &request("tier3"));
        assert_eq!(run.outcome, ReactOutcome::Finished("42".to_string()));
        assert_eq!(sleeper.slept().len(), 1);
    }

    /// Failures and malformed replies each burn one iteration until the cap.
    #[test]
    fn failures_consume_iterations_until_exhausted() {
        let mut limits = limits();
        limits.max_iterations = 3;
        let generator = ScriptedGenerator::new(vec![
            Generation::Failed("boom".to_string()),
            Generation::Text("not json".to_string()),
            Generation::Text(r#"{"thought": "x", "action": {"tool_name": "teleport"}}"#.to_string()),
        ]);
        let run = solve(&generator, &NoopSleeper::default(), &limits, &request("tier2"));
        assert_eq!(run.outcome, ReactOutcome::Exhausted);
        assert_eq!(run.iterations, 3);
        assert!(run.turns[0].observation.contains("boom"));
        assert!(run.turns[2].observation.contains("Unknown tool 'teleport'"));
    }
}
