//! Plan Monitor: after a step completes, decide whether the rest of the plan
//! is still worth running.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::io::config::{MonitorConfig, RunnerConfig};
use crate::io::generator::{Generation, GenerationRequest, Generator, extract_json};
use crate::io::prompt::{MonitorPrompt, PromptBuilder};

/// A reviewer's raw judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Continue,
    Replan,
    Unclear,
}

/// The monitor's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Replan,
}

pub trait QualityAssessor: Send + Sync {
    fn assess(&self, goal: &str, remaining: &[String], last_output: &str) -> Result<Assessment>;
}

/// Fails open: only an explicit `Replan` assessment stops the plan.
pub struct PlanMonitor {
    assessor: Arc<dyn QualityAssessor>,
    config: MonitorConfig,
}

impl PlanMonitor {
    pub fn new(assessor: Arc<dyn QualityAssessor>, config: &MonitorConfig) -> Self {
        Self {
            assessor,
            config: config.clone(),
        }
    }

    pub fn check(&self, goal: &str, remaining: &[String], last_output: &str) -> Verdict {
        if !self.config.enabled
            || remaining.is_empty()
            || last_output.trim().len() < self.config.min_output_chars
        {
            return Verdict::Continue;
        }
        match self.assessor.assess(goal, remaining, last_output) {
            Ok(Assessment::Replan) => {
                info!(remaining = remaining.len(), "monitor requested re-plan");
                Verdict::Replan
            }
            Ok(assessment) => {
                debug!(?assessment, "monitor keeps plan");
                Verdict::Continue
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "monitor assessment failed; continuing");
                Verdict::Continue
            }
        }
    }
}

/// Assessor backed by a generation call on the utility tier.
pub struct GeneratorAssessor {
    generator: Arc<dyn Generator>,
    prompts: PromptBuilder,
    tier: String,
}

impl GeneratorAssessor {
    pub fn new(generator: Arc<dyn Generator>, config: &RunnerConfig) -> Self {
        Self {
            generator,
            prompts: PromptBuilder::new(config.dispatch.prompt_budget_bytes),
            tier: config.utility_tier.clone(),
        }
    }
}

impl QualityAssessor for GeneratorAssessor {
    fn assess(&self, goal: &str, remaining: &[String], last_output: &str) -> Result<Assessment> {
        let prompt = self.prompts.monitor(&MonitorPrompt {
            goal,
            remaining: remaining.to_vec(),
            last_output,
        })?;
        let text = match self
            .generator
            .generate(&GenerationRequest::new(prompt, &self.tier))
        {
            Generation::Text(text) => text,
            Generation::RateLimited => bail!("assessment rate limited on {}", self.tier),
            Generation::Failed(err) => bail!("assessment failed: {err}"),
        };
        let verdict = extract_json(&text).and_then(|value| {
            value
                .get("verdict")
                .and_then(|verdict| verdict.as_str())
                .map(str::to_lowercase)
        });
        Ok(match verdict.as_deref() {
            Some("replan") => Assessment::Replan,
            Some("continue") => Assessment::Continue,
            _ => Assessment::Unclear,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedAssessor, ScriptedGenerator};

    const LONG_OUTPUT: &str = "The venue is closed for renovation until next year.";

    fn monitor(script: Vec<Result<Assessment, String>>) -> (Arc<ScriptedAssessor>, PlanMonitor) {
        let assessor = Arc::new(ScriptedAssessor::new(script));
        let monitor = PlanMonitor::new(assessor.clone(), &MonitorConfig::default());
        (assessor, monitor)
    }

    #[test]
    fn skips_when_nothing_remains_or_output_is_short() {
        let (assessor, monitor) = monitor(vec![Ok(Assessment::Replan)]);
        assert_eq!(monitor.check("g", &[], LONG_OUTPUT), Verdict::Continue);
        assert_eq!(
            monitor.check("g", &["book it".to_string()], "  ok  "),
            Verdict::Continue
        );
        assert!(assessor.calls().is_empty());
    }

    #[test]
    fn only_explicit_replan_stops_the_plan() {
        let remaining = vec!["book it".to_string()];
        let (_, monitor) = monitor(vec![
            Ok(Assessment::Unclear),
            Err("backend down".to_string()),
            Ok(Assessment::Replan),
        ]);
        assert_eq!(monitor.check("g", &remaining, LONG_OUTPUT), Verdict::Continue);
        assert_eq!(monitor.check("g", &remaining, LONG_OUTPUT), Verdict::Continue);
        assert_eq!(monitor.check("g", &remaining, LONG_OUTPUT), Verdict::Replan);
    }

    #[test]
    fn disabled_monitor_never_asks() {
        let assessor = Arc::new(ScriptedAssessor::new(vec![Ok(Assessment::Replan)]));
        let config = MonitorConfig {
            enabled: false,
            ..MonitorConfig::default()
        };
        let monitor = PlanMonitor::new(assessor.clone(), &config);
        assert_eq!(
            monitor.check("g", &["next".to_string()], LONG_OUTPUT),
            Verdict::Continue
        );
        assert!(assessor.calls().is_empty());
    }

    #[test]
    fn generator_assessor_reads_verdict() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Generation::Text(r#"{"verdict": "REPLAN", "reason": "closed"}"#.to_string()),
            Generation::Text("looks fine to me".to_string()),
        ]));
        let assessor = GeneratorAssessor::new(generator, &RunnerConfig::default());
        let remaining = vec!["book it".to_string()];
        assert_eq!(
            assessor.assess("g", &remaining, LONG_OUTPUT).expect("assess"),
            Assessment::Replan
        );
        assert_eq!(
            assessor.assess("g", &remaining, LONG_OUTPUT).expect("assess"),
            Assessment::Unclear
        );
    }
}
