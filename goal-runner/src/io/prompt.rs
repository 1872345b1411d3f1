//! Prompt builders for every generation call the orchestrator makes.
//!
//! Templates live in `prompts/*.md` and mark their sections with
//! `<!-- section:KEY required|droppable -->`. Rendered prompts that exceed the
//! byte budget lose droppable sections first, then the last section is
//! truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");
const REACT_TEMPLATE: &str = include_str!("prompts/react.md");
const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const SELECTOR_TEMPLATE: &str = include_str!("prompts/selector.md");
const MONITOR_TEMPLATE: &str = include_str!("prompts/monitor.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 5] = ["profile", "strategy", "prior", "context", "history"];

/// One earlier step's output made visible to a prompt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContextEntry {
    pub id: u32,
    pub output: String,
}

/// Tool description shown to planners and the reactive solver.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: &'static str,
}

/// Inputs for executing or refining a plain instruction step.
#[derive(Debug, Clone, Serialize)]
pub struct StepPrompt<'a> {
    pub goal: &'a str,
    pub strategy: Option<String>,
    pub instruction: &'a str,
    pub context: Vec<ContextEntry>,
}

/// One recorded think-act-observe turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnView {
    pub thought: String,
    pub action: String,
    pub observation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactPrompt<'a> {
    pub goal: &'a str,
    pub strategy: Option<String>,
    pub sub_goal: &'a str,
    pub context: Vec<ContextEntry>,
    pub history: Vec<TurnView>,
    pub tools: Vec<ToolSpec>,
}

/// Feedback for a planner retry after validation failed.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerRetry {
    pub previous: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerPrompt<'a> {
    pub goal: &'a str,
    pub tools: Vec<ToolSpec>,
    pub profile: Vec<(String, String)>,
    pub prior: Option<String>,
    pub retry: Option<PlannerRetry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectorCandidate {
    pub id: u32,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectorPrompt<'a> {
    pub task: &'a str,
    pub candidates: Vec<SelectorCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorPrompt<'a> {
    pub goal: &'a str,
    pub remaining: Vec<String>,
    pub last_output: &'a str,
}

/// Renders templates and enforces the byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("step", STEP_TEMPLATE),
            ("refine", REFINE_TEMPLATE),
            ("react", REACT_TEMPLATE),
            ("planner", PLANNER_TEMPLATE),
            ("selector", SELECTOR_TEMPLATE),
            ("monitor", MONITOR_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled prompt templates should be valid");
        }
        Self { env, budget_bytes }
    }

    pub fn step(&self, input: &StepPrompt<'_>) -> Result<String> {
        self.render("step", input)
    }

    pub fn refine(&self, input: &StepPrompt<'_>) -> Result<String> {
        self.render("refine", input)
    }

    pub fn react(&self, input: &ReactPrompt<'_>) -> Result<String> {
        self.render("react", input)
    }

    pub fn planner(&self, input: &PlannerPrompt<'_>) -> Result<String> {
        self.render("planner", input)
    }

    pub fn selector(&self, input: &SelectorPrompt<'_>) -> Result<String> {
        self.render("selector", input)
    }

    pub fn monitor(&self, input: &MonitorPrompt<'_>) -> Result<String> {
        self.render("monitor", input)
    }

    fn render<S: Serialize>(&self, name: &str, input: &S) -> Result<String> {
        let rendered = self
            .env
            .get_template(name)?
            .render(input)
            .with_context(|| format!("render {name} prompt"))?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                &caps[2] == "required",
            ))
        })
        .collect();

    markers
        .iter()
        .enumerate()
        .filter_map(|(i, (_, body_start, key, required))| {
            let body_end = markers
                .get(i + 1)
                .map_or(rendered.len(), |(next_start, ..)| *next_start);
            let content = rendered[*body_start..body_end].trim().to_string();
            (!content.is_empty() || *required).then(|| ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            })
        })
        .collect()
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    if let Some(last) = sections.last_mut() {
        let keep = last.content.len().saturating_sub(over + 12);
        let cut = floor_char_boundary(&last.content, keep);
        let before = last.content.len();
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(section = %last.key, before, after = last.content.len(), "truncated prompt section");
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_input(context: Vec<ContextEntry>) -> StepPrompt<'static> {
        StepPrompt {
            goal: "write a haiku",
            strategy: Some("keep it short".to_string()),
            instruction: "draft the haiku using [step 1]",
            context,
        }
    }

    /// Sections appear in template order: contract, goal, strategy, context, task.
    #[test]
    fn step_prompt_orders_sections() {
        let input = step_input(vec![ContextEntry {
            id: 1,
            output: "autumn words".to_string(),
        }]);
        let prompt = PromptBuilder::new(10_000).step(&input).expect("render");
        let positions: Vec<usize> = [
            "### Task Contract",
            "### Goal",
            "### Strategy",
            "### Context From Earlier Steps",
            "### Task",
        ]
        .iter()
        .map(|header| prompt.find(header).expect(header))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.contains("[step 1]\nautumn words"));
        assert!(!prompt.contains("section:"), "markers are stripped");
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let input = StepPrompt {
            strategy: None,
            ..step_input(Vec::new())
        };
        let prompt = PromptBuilder::new(10_000).step(&input).expect("render");
        assert!(!prompt.contains("### Strategy"));
        assert!(!prompt.contains("### Context"));
    }

    /// Over budget: strategy goes before context, required sections stay.
    #[test]
    fn budget_drops_droppable_sections_first() {
        let input = StepPrompt {
            strategy: Some("s".repeat(400)),
            ..step_input(vec![ContextEntry {
                id: 1,
                output: "c".repeat(100),
            }])
        };
        let full = PromptBuilder::new(100_000).step(&input).expect("render");
        let prompt = PromptBuilder::new(full.len() - 300).step(&input).expect("render");
        assert!(!prompt.contains("### Strategy"));
        assert!(prompt.contains("### Context From Earlier Steps"));
        assert!(prompt.contains("### Task"));
    }

    #[test]
    fn react_prompt_lists_tools_and_history() {
        let input = ReactPrompt {
            goal: "g",
            strategy: None,
            sub_goal: "find the capital",
            context: Vec::new(),
            history: vec![TurnView {
                thought: "search first".to_string(),
                action: "{\"tool_name\":\"web_search\"}".to_string(),
                observation: "Canberra".to_string(),
            }],
            tools: vec![ToolSpec {
                name: "finish",
                description: "End with an answer.",
                parameters: "{\"answer\": string}",
            }],
        };
        let prompt = PromptBuilder::new(10_000).react(&input).expect("render");
        assert!(prompt.contains("- `finish`: End with an answer."));
        assert!(prompt.contains("Observation: Canberra"));
    }
}
