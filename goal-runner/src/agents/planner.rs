//! Planning service: turns a goal text into a validated step graph.

use std::fmt;
use std::sync::{Arc, LazyLock};

use anyhow::{Result, bail};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::plan_check::validate_plan;
use crate::core::types::PlannedStep;
use crate::io::config::RunnerConfig;
use crate::io::generator::{Generation, GenerationRequest, Generator, extract_json};
use crate::io::goal_store::GoalStore;
use crate::io::prompt::{PlannerPrompt, PlannerRetry, PromptBuilder};
use crate::tools::{PLAN_TOOLS, ToolBox};

const PLANNER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");

static PLANNER_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(PLANNER_OUTPUT_SCHEMA).expect("bundled planner schema is JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("bundled planner schema compiles")
});

/// What the planning service proposes for a goal.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Plan {
        steps: Vec<PlannedStep>,
        strategy: Value,
    },
    /// The goal cannot be planned without an answer from the user.
    Clarify { question: String, strategy: Value },
}

/// Decomposes goals into plans. `strategy_context` carries the previous
/// strategy (including `prior_outputs`) when a goal is re-planned.
pub trait PlanningService: Send + Sync {
    fn plan(&self, goal_text: &str, strategy_context: Option<&Value>) -> Result<PlanOutcome>;
}

/// The planning call hit a quota limit; the goal should wait, not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningRateLimited {
    pub tier: String,
}

impl fmt::Display for PlanningRateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "planning rate limited on {}", self.tier)
    }
}

impl std::error::Error for PlanningRateLimited {}

/// The proposed plan failed schema or structural validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPlanError {
    pub errors: Vec<String>,
}

impl fmt::Display for InvalidPlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan:\n- {}", self.errors.join("\n- "))
    }
}

impl std::error::Error for InvalidPlanError {}

#[derive(Debug, Deserialize)]
struct PlannerResponse {
    #[serde(default)]
    strategy: Value,
    #[serde(default)]
    requires_clarification: bool,
    #[serde(default)]
    clarification_question: Option<String>,
    #[serde(default)]
    steps: Vec<PlannedStep>,
}

/// Planner backed by a generation call.
///
/// A response that fails validation is sent back once (by default) with the
/// violations so the model can correct itself.
pub struct GeneratorPlanner {
    generator: Arc<dyn Generator>,
    prompts: PromptBuilder,
    tier: String,
    max_retries: u32,
    profile: Option<GoalStore>,
}

impl GeneratorPlanner {
    pub fn new(generator: Arc<dyn Generator>, config: &RunnerConfig) -> Self {
        Self {
            generator,
            prompts: PromptBuilder::new(config.dispatch.prompt_budget_bytes),
            tier: config.planner.tier.clone(),
            max_retries: config.planner.max_planning_retries,
            profile: None,
        }
    }

    /// Include the user profile stored in `store` in every planning prompt.
    pub fn with_profile(mut self, store: GoalStore) -> Self {
        self.profile = Some(store);
        self
    }
}

impl PlanningService for GeneratorPlanner {
    #[instrument(skip_all, fields(tier = %self.tier))]
    fn plan(&self, goal_text: &str, strategy_context: Option<&Value>) -> Result<PlanOutcome> {
        let profile = match &self.profile {
            Some(store) => store.profile_list()?,
            None => Vec::new(),
        };
        let prior = strategy_context
            .and_then(|strategy| strategy.get("prior_outputs"))
            .filter(|outputs| outputs.as_object().is_some_and(|map| !map.is_empty()))
            .map(|outputs| serde_json::to_string_pretty(outputs).unwrap_or_default());

        let mut retry = None;
        let mut errors = Vec::new();
        for attempt in 0..=self.max_retries {
            let prompt = self.prompts.planner(&PlannerPrompt {
                goal: goal_text,
                tools: ToolBox::plan_specs(),
                profile: profile.clone(),
                prior: prior.clone(),
                retry: retry.take(),
            })?;
            let text = match self
                .generator
                .generate(&GenerationRequest::new(prompt, &self.tier))
            {
                Generation::Text(text) => text,
                Generation::RateLimited => {
                    return Err(PlanningRateLimited {
                        tier: self.tier.clone(),
                    }
                    .into());
                }
                Generation::Failed(err) => bail!("planning call failed: {err}"),
            };
            match parse_plan_response(&text) {
                Ok(outcome) => {
                    info!(attempt, "plan accepted");
                    return Ok(outcome);
                }
                Err(found) => {
                    warn!(attempt, errors = found.len(), "plan rejected");
                    retry = Some(PlannerRetry {
                        previous: text,
                        error: found.join("\n"),
                    });
                    errors = found;
                }
            }
        }
        Err(InvalidPlanError { errors }.into())
    }
}

/// Parse and validate a raw planner response.
pub fn parse_plan_response(text: &str) -> Result<PlanOutcome, Vec<String>> {
    let Some(value) = extract_json(text) else {
        return Err(vec!["response contains no JSON object".to_string()]);
    };
    let schema_errors: Vec<String> = PLANNER_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !schema_errors.is_empty() {
        return Err(schema_errors);
    }
    let response: PlannerResponse =
        serde_json::from_value(value).map_err(|err| vec![format!("malformed plan: {err}")])?;

    if response.requires_clarification {
        return match response.clarification_question {
            Some(question) if !question.trim().is_empty() => Ok(PlanOutcome::Clarify {
                question,
                strategy: response.strategy,
            }),
            _ => Err(vec![
                "clarification requested without a clarification_question".to_string(),
            ]),
        };
    }

    let errors = validate_plan(&response.steps, PLAN_TOOLS);
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(PlanOutcome::Plan {
        steps: response.steps,
        strategy: response.strategy,
    })
}
