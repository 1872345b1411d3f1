//! Shared deterministic types for goal orchestration.
//!
//! These types define stable contracts between core components and the
//! persisted store. They should not depend on external state or I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool name of the open-ended step kind that runs the reactive sub-solver.
pub const REACTIVE_SOLVE: &str = "reactive_solve";

/// Lifecycle state of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    Complete,
    Failed,
    Cancelled,
    AwaitingInput,
    AwaitingTierDecision,
    AwaitingReplan,
    Paused,
}

impl GoalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GoalStatus::Pending => "pending",
            GoalStatus::InProgress => "in-progress",
            GoalStatus::Complete => "complete",
            GoalStatus::Failed => "failed",
            GoalStatus::Cancelled => "cancelled",
            GoalStatus::AwaitingInput => "awaiting_input",
            GoalStatus::AwaitingTierDecision => "awaiting_tier_decision",
            GoalStatus::AwaitingReplan => "awaiting_replan",
            GoalStatus::Paused => "paused",
        }
    }

    /// Statuses a goal may carry into the archive table.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GoalStatus::Complete | GoalStatus::Failed | GoalStatus::Cancelled
        )
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GoalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s {
            "pending" => GoalStatus::Pending,
            "in-progress" => GoalStatus::InProgress,
            "complete" => GoalStatus::Complete,
            "failed" => GoalStatus::Failed,
            "cancelled" => GoalStatus::Cancelled,
            "awaiting_input" => GoalStatus::AwaitingInput,
            "awaiting_tier_decision" => GoalStatus::AwaitingTierDecision,
            "awaiting_replan" => GoalStatus::AwaitingReplan,
            "paused" => GoalStatus::Paused,
            other => return Err(anyhow!("unknown goal status '{other}'")),
        };
        Ok(status)
    }
}

/// Per-step execution status. Advances monotonically out of `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Complete,
    Failed,
}

/// A named tool plus its parameters.
///
/// String parameter values may contain `[output_of_step_N]` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// String parameter lookup; non-string values are rendered as JSON.
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.parameters.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// What a step does: free text for the generator, or a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Instruction(String),
    ToolCall(ToolCall),
}

/// One node in a goal's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "step_id")]
    pub id: u32,
    #[serde(default)]
    pub dependencies: BTreeSet<u32>,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub retries: u32,
}

impl Step {
    pub fn instruction(id: u32, deps: &[u32], text: &str) -> Self {
        Self::new(id, deps, StepAction::Instruction(text.to_string()))
    }

    pub fn tool(id: u32, deps: &[u32], call: ToolCall) -> Self {
        Self::new(id, deps, StepAction::ToolCall(call))
    }

    fn new(id: u32, deps: &[u32], action: StepAction) -> Self {
        Self {
            id,
            dependencies: deps.iter().copied().collect(),
            action,
            status: StepStatus::Pending,
            output: None,
            summary: None,
            retries: 0,
        }
    }

    /// Open-ended steps run the reactive sub-solver and preempt the swarm.
    pub fn is_heavyweight(&self) -> bool {
        matches!(&self.action, StepAction::ToolCall(call) if call.tool_name == REACTIVE_SOLVE)
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    /// Human-readable task text used for context selection and prompts.
    pub fn task_text(&self) -> String {
        match &self.action {
            StepAction::Instruction(text) => text.clone(),
            StepAction::ToolCall(call) => match call.param_str("sub_goal") {
                Some(sub_goal) => sub_goal,
                None => format!(
                    "{} {}",
                    call.tool_name,
                    serde_json::to_string(&call.parameters).unwrap_or_default()
                ),
            },
        }
    }
}

/// A step as proposed by the planning service, before structural validation.
///
/// Planners may emit `prompt` for the instruction text; both spellings are
/// accepted. Exactly one of `instruction`/`tool_call` must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub step_id: u32,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default, alias = "prompt", skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl PlannedStep {
    pub fn instruction(id: u32, deps: &[u32], text: &str) -> Self {
        Self {
            step_id: id,
            dependencies: deps.to_vec(),
            instruction: Some(text.to_string()),
            tool_call: None,
        }
    }

    pub fn tool(id: u32, deps: &[u32], call: ToolCall) -> Self {
        Self {
            step_id: id,
            dependencies: deps.to_vec(),
            instruction: None,
            tool_call: Some(call),
        }
    }
}

/// A unit of work submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub text: String,
    pub plan: Vec<Step>,
    pub status: GoalStatus,
    /// Opaque blueprint from the planning service; context for generation only.
    pub strategy: Value,
    pub preferred_tier: String,
    pub execution_log: String,
    pub replan_count: u32,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Goal {
    pub fn new(id: String, text: String, preferred_tier: String, created_at: i64) -> Self {
        Self {
            id,
            text,
            plan: Vec::new(),
            status: GoalStatus::Pending,
            strategy: Value::Null,
            preferred_tier,
            execution_log: String::new(),
            replan_count: 0,
            created_at,
        }
    }

    pub fn has_plan(&self) -> bool {
        !self.plan.is_empty()
    }

    pub fn step(&self, id: u32) -> Option<&Step> {
        self.plan.iter().find(|step| step.id == id)
    }

    pub fn step_mut(&mut self, id: u32) -> Option<&mut Step> {
        self.plan.iter_mut().find(|step| step.id == id)
    }

    /// Append one line to the execution log. The log is never rewritten.
    pub fn append_log(&mut self, line: &str) {
        self.execution_log.push_str(line);
        if !line.ends_with('\n') {
            self.execution_log.push('\n');
        }
    }

    /// Outputs of completed steps keyed by step id.
    pub fn completed_outputs(&self) -> BTreeMap<u32, String> {
        self.plan
            .iter()
            .filter(|step| step.status == StepStatus::Complete)
            .map(|step| (step.id, step.output.clone().unwrap_or_default()))
            .collect()
    }
}

/// Result of dispatching one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed { output: String },
    /// Transient failure unrelated to quota.
    Failed { error: String },
    /// Quota sentinel; never counted as a failure.
    RateLimited,
    /// The step needs information only a producer can supply.
    AwaitingInput { question: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_status_round_trips_through_str() {
        for status in [
            GoalStatus::Pending,
            GoalStatus::InProgress,
            GoalStatus::AwaitingTierDecision,
            GoalStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<GoalStatus>().expect("parse"), status);
        }
        assert!("done".parse::<GoalStatus>().is_err());
    }

    #[test]
    fn in_progress_serializes_with_hyphen() {
        let json = serde_json::to_string(&GoalStatus::InProgress).expect("json");
        assert_eq!(json, "\"in-progress\"");
    }

    /// Steps persist with `step_id` and a flattened action key.
    #[test]
    fn step_json_uses_flat_action_keys() {
        let step = Step::tool(2, &[1], ToolCall::new("web_search").with_param("query", "rust"));
        let json = serde_json::to_value(&step).expect("json");
        assert_eq!(json["step_id"], 2);
        assert_eq!(json["tool_call"]["tool_name"], "web_search");
        assert!(json.get("instruction").is_none());

        let back: Step = serde_json::from_value(json).expect("parse");
        assert_eq!(back, step);
    }

    #[test]
    fn planned_step_accepts_prompt_alias() {
        let raw = r#"{"step_id": 1, "dependencies": [], "prompt": "say hi"}"#;
        let step: PlannedStep = serde_json::from_str(raw).expect("parse");
        assert_eq!(step.instruction.as_deref(), Some("say hi"));
        assert!(step.tool_call.is_none());
    }

    #[test]
    fn reactive_solve_is_heavyweight() {
        let heavy = Step::tool(1, &[], ToolCall::new(REACTIVE_SOLVE));
        let light = Step::instruction(2, &[], "write");
        assert!(heavy.is_heavyweight());
        assert!(!light.is_heavyweight());
    }
}
