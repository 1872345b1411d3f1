//! Context selection: which completed outputs a step gets to see.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, warn};

use crate::core::types::{Step, StepStatus};
use crate::io::config::RunnerConfig;
use crate::io::generator::{Generation, GenerationRequest, Generator, extract_json};
use crate::io::prompt::{PromptBuilder, SelectorCandidate, SelectorPrompt};

/// A completed step offered as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: u32,
    pub output: String,
    pub summary: String,
}

/// Picks the subset of `candidates` relevant to `task`, keyed by step id.
pub trait ContextSelector: Send + Sync {
    fn select(&self, task: &str, candidates: &[Candidate]) -> Result<BTreeMap<u32, String>>;
}

/// Every completed step of `plan`, in id order.
pub fn candidates_from(plan: &[Step]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = plan
        .iter()
        .filter(|step| step.status == StepStatus::Complete)
        .map(|step| {
            let output = step.output.clone().unwrap_or_default();
            Candidate {
                id: step.id,
                summary: step.summary.clone().unwrap_or_else(|| output.clone()),
                output,
            }
        })
        .collect();
    candidates.sort_by_key(|candidate| candidate.id);
    candidates
}

/// Curated context for `task`. Never fails: a selector error falls back to
/// the full candidate set, and zero or one candidate skips the call.
pub fn curate(
    selector: &dyn ContextSelector,
    task: &str,
    candidates: &[Candidate],
) -> BTreeMap<u32, String> {
    let full = || -> BTreeMap<u32, String> {
        candidates
            .iter()
            .map(|candidate| (candidate.id, candidate.output.clone()))
            .collect()
    };
    if candidates.len() <= 1 {
        return full();
    }
    match selector.select(task, candidates) {
        Ok(selected) => {
            debug!(offered = candidates.len(), kept = selected.len(), "context curated");
            selected
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "context selection failed; using full context");
            full()
        }
    }
}

/// Selector backed by a generation call on the utility tier.
pub struct GeneratorSelector {
    generator: Arc<dyn Generator>,
    prompts: PromptBuilder,
    tier: String,
}

impl GeneratorSelector {
    pub fn new(generator: Arc<dyn Generator>, config: &RunnerConfig) -> Self {
        Self {
            generator,
            prompts: PromptBuilder::new(config.dispatch.prompt_budget_bytes),
            tier: config.utility_tier.clone(),
        }
    }
}

impl ContextSelector for GeneratorSelector {
    fn select(&self, task: &str, candidates: &[Candidate]) -> Result<BTreeMap<u32, String>> {
        let prompt = self.prompts.selector(&SelectorPrompt {
            task,
            candidates: candidates
                .iter()
                .map(|candidate| SelectorCandidate {
                    id: candidate.id,
                    summary: candidate.summary.clone(),
                })
                .collect(),
        })?;
        let text = match self
            .generator
            .generate(&GenerationRequest::new(prompt, &self.tier))
        {
            Generation::Text(text) => text,
            Generation::RateLimited => bail!("context selection rate limited on {}", self.tier),
            Generation::Failed(err) => bail!("context selection failed: {err}"),
        };
        let ids = extract_json(&text)
            .and_then(|value| value.get("selected_step_ids").cloned())
            .and_then(|ids| serde_json::from_value::<Vec<u32>>(ids).ok())
            .ok_or_else(|| anyhow!("selector response has no selected_step_ids list"))?;
        Ok(candidates
            .iter()
            .filter(|candidate| ids.contains(&candidate.id))
            .map(|candidate| (candidate.id, candidate.output.clone()))
            .collect())
    }
}
