//! Generation service abstraction.
//!
//! The [`Generator`] trait decouples orchestration from the model backend.
//! The orchestrator never interprets generated text; it only distinguishes
//! the two sentinel outcomes ([`Generation::RateLimited`] and
//! [`Generation::Failed`]). Tests use scripted generators that never spawn
//! processes.

use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::io::config::{GeneratorConfig, RunnerConfig};
use crate::io::process::run_command_with_timeout;
use crate::io::rate_limiter::RateLimiter;

/// One generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub tier: String,
    /// Ground the answer with web search.
    pub search: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            tier: tier.into(),
            search: false,
        }
    }

    pub fn with_search(mut self) -> Self {
        self.search = true;
        self
    }
}

/// Outcome of a generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Text(String),
    /// Quota sentinel: the tier's budget (local or remote) is exhausted.
    RateLimited,
    /// Hard failure unrelated to quota.
    Failed(String),
}

/// Abstraction over generation backends.
pub trait Generator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Generation;
}

impl<G: Generator + ?Sized> Generator for &G {
    fn generate(&self, request: &GenerationRequest) -> Generation {
        (**self).generate(request)
    }
}

/// Generator that spawns the configured model CLI with the prompt on stdin.
pub struct CommandGenerator {
    config: GeneratorConfig,
    models: Vec<(String, String)>,
}

impl CommandGenerator {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            config: config.generator.clone(),
            models: config
                .tiers
                .iter()
                .map(|(name, tier)| (name.clone(), tier.model.clone()))
                .collect(),
        }
    }

    fn model_for(&self, tier: &str) -> Option<&str> {
        self.models
            .iter()
            .find(|(name, _)| name == tier)
            .map(|(_, model)| model.as_str())
    }

    fn is_rate_limited(&self, stderr: &str) -> bool {
        let lowered = stderr.to_lowercase();
        self.config
            .rate_limit_markers
            .iter()
            .any(|marker| lowered.contains(marker.as_str()))
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(tier = %request.tier, search = request.search))]
    fn generate(&self, request: &GenerationRequest) -> Generation {
        let Some(model) = self.model_for(&request.tier) else {
            return Generation::Failed(format!("unknown tier '{}'", request.tier));
        };
        let mut argv = self
            .config
            .command
            .iter()
            .map(|arg| arg.replace("{model}", model));
        let Some(program) = argv.next() else {
            return Generation::Failed("generator.command is empty".to_string());
        };
        let mut cmd = Command::new(program);
        cmd.args(argv);
        if request.search {
            cmd.args(&self.config.search_args);
        }

        info!(model, "starting generation");
        let output = match run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "generator command failed to run");
                return Generation::Failed(format!("{err:#}"));
            }
        };

        if output.timed_out {
            return Generation::Failed(format!(
                "generation timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            if self.is_rate_limited(&stderr) {
                warn!(model, "generator reported quota exhaustion");
                return Generation::RateLimited;
            }
            return Generation::Failed(format!(
                "generator exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        let text = output.stdout_text();
        if text.trim().is_empty() {
            return Generation::Failed("generator returned no text".to_string());
        }
        debug!(bytes = text.len(), "generation finished");
        Generation::Text(text)
    }
}

/// Decorator that consults the rate limiter before every call.
///
/// A refused `allow` becomes the [`Generation::RateLimited`] sentinel without
/// reaching the backend.
pub struct RateLimitedGenerator<G> {
    inner: G,
    limiter: RateLimiter,
}

impl<G: Generator> RateLimitedGenerator<G> {
    pub fn new(inner: G, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }
}

impl<G: Generator> Generator for RateLimitedGenerator<G> {
    fn generate(&self, request: &GenerationRequest) -> Generation {
        match self.limiter.allow(&request.tier) {
            Ok(true) => self.inner.generate(request),
            Ok(false) => {
                info!(tier = %request.tier, "local rate limit reached");
                Generation::RateLimited
            }
            Err(err) => Generation::Failed(format!("rate limiter: {err:#}")),
        }
    }
}

/// Pull the first JSON object or array out of free-form model text.
///
/// Models often wrap JSON in prose or code fences; everything outside the
/// outermost brackets is ignored.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str(&text[start..=end])
        {
            return Some(value);
        }
    }
    None
}
