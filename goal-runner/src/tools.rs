//! Tools a plan step (or the reactive solver) may invoke.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use crate::core::types::{REACTIVE_SOLVE, ToolCall};
use crate::io::generator::{Generation, GenerationRequest, Generator};
use crate::io::prompt::ToolSpec;

pub const WEB_SEARCH: &str = "web_search";
/// Older planners name the search tool after the search provider.
pub const WEB_SEARCH_ALIAS: &str = "google_search";
pub const WRITE_TO_FILE: &str = "write_to_file";
pub const REQUEST_USER_INPUT: &str = "request_user_input";
/// Terminal action of the reactive solver; never valid in a plan.
pub const FINISH: &str = "finish";

/// Tool names a plan step may reference.
pub const PLAN_TOOLS: &[&str] = &[
    WEB_SEARCH,
    WEB_SEARCH_ALIAS,
    WRITE_TO_FILE,
    REQUEST_USER_INPUT,
    REACTIVE_SOLVE,
];

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    Output(String),
    RateLimited,
    AwaitingInput(String),
    Error(String),
}

/// Executes the non-reactive tools.
#[derive(Debug, Clone)]
pub struct ToolBox {
    output_dir: PathBuf,
}

impl ToolBox {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Tools offered to the planner.
    pub fn plan_specs() -> Vec<ToolSpec> {
        vec![
            web_search_spec(),
            write_to_file_spec(),
            ToolSpec {
                name: REQUEST_USER_INPUT,
                description: "Pause the goal and ask the user a question.",
                parameters: r#"{"question": string}"#,
            },
            ToolSpec {
                name: REACTIVE_SOLVE,
                description: "Solve an open-ended sub-goal with several tool calls.",
                parameters: r#"{"sub_goal": string, "first_tool"?: string, "first_parameters"?: object}"#,
            },
        ]
    }

    /// Tools offered inside the reactive solver.
    pub fn react_specs() -> Vec<ToolSpec> {
        vec![
            web_search_spec(),
            write_to_file_spec(),
            ToolSpec {
                name: FINISH,
                description: "End the sub-goal with the complete answer.",
                parameters: r#"{"answer": string}"#,
            },
        ]
    }

    /// Run `call` on `tier`. Placeholders must already be resolved.
    #[instrument(skip_all, fields(tool = %call.tool_name, tier))]
    pub fn execute(&self, call: &ToolCall, generator: &dyn Generator, tier: &str) -> ToolResult {
        match call.tool_name.as_str() {
            WEB_SEARCH | WEB_SEARCH_ALIAS => {
                let Some(query) = call.param_str("query") else {
                    return ToolResult::Error("web_search requires a 'query' parameter".to_string());
                };
                let prompt = format!(
                    "Search the web for the following and report the findings with sources:\n{query}"
                );
                match generator.generate(&GenerationRequest::new(prompt, tier).with_search()) {
                    Generation::Text(text) => ToolResult::Output(text),
                    Generation::RateLimited => ToolResult::RateLimited,
                    Generation::Failed(err) => ToolResult::Error(err),
                }
            }
            WRITE_TO_FILE => {
                let (Some(filename), Some(content)) =
                    (call.param_str("filename"), call.param_str("content"))
                else {
                    return ToolResult::Error(
                        "write_to_file requires 'filename' and 'content' parameters".to_string(),
                    );
                };
                match self.write_file(&filename, &content) {
                    Ok(path) => ToolResult::Output(format!(
                        "Wrote {} bytes to {}",
                        content.len(),
                        path.display()
                    )),
                    Err(err) => ToolResult::Error(format!("{err:#}")),
                }
            }
            REQUEST_USER_INPUT => ToolResult::AwaitingInput(
                call.param_str("question")
                    .unwrap_or_else(|| "More information is needed to continue.".to_string()),
            ),
            other => ToolResult::Error(format!("tool '{other}' is not available here")),
        }
    }

    fn write_file(&self, filename: &str, content: &str) -> Result<PathBuf> {
        let relative = Path::new(filename);
        if filename.trim().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("filename '{filename}' must be a plain relative path");
        }
        let path = self.output_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), bytes = content.len(), "wrote output file");
        Ok(path)
    }
}

fn web_search_spec() -> ToolSpec {
    ToolSpec {
        name: WEB_SEARCH,
        description: "Search the web and summarize what was found.",
        parameters: r#"{"query": string}"#,
    }
}

fn write_to_file_spec() -> ToolSpec {
    ToolSpec {
        name: WRITE_TO_FILE,
        description: "Save text to a file in the output directory.",
        parameters: r#"{"filename": string, "content": string}"#,
    }
}
