//! Runner configuration stored under `<data_dir>/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the tuned values the scheduler was built around; none of them is assumed
/// optimal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Tier whose quota exhaustion escalates the goal instead of waiting.
    pub premium_tier: String,
    /// Tier used for cheap helper calls (prompt refinement, context selection).
    pub utility_tier: String,
    /// Tier assigned to new goals when the producer does not choose one.
    pub default_tier: String,
    pub orchestrator: OrchestratorConfig,
    pub react: ReactConfig,
    pub monitor: MonitorConfig,
    pub idle: IdleConfig,
    pub store: StoreConfig,
    pub generator: GeneratorConfig,
    pub planner: PlannerConfig,
    pub dispatch: DispatchConfig,
    pub tiers: BTreeMap<String, TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wake-signal timeout between cycles.
    pub poll_interval_secs: u64,
    /// Retries granted to a transiently failing step before the goal fails.
    pub max_retries: u32,
    /// Wait before re-attempting a step deferred by a fallback-tier rate limit.
    pub rate_limit_backoff_secs: u64,
    /// Re-plans allowed for one goal text before it is failed instead.
    pub max_replans: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_retries: 2,
            rate_limit_backoff_secs: 30,
            max_replans: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReactConfig {
    pub max_iterations: u32,
    /// Consecutive fallback-tier rate-limit waits before the solver gives the
    /// turn back to the orchestrator.
    pub max_rate_limit_waits: u32,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_rate_limit_waits: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Outputs shorter than this (trimmed) are not judged.
    pub min_output_chars: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_output_chars: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    pub idle_threshold_secs: u64,
    /// Points by which elapsed-day % must exceed usage % for a tier.
    pub surplus_threshold: f64,
    /// Offset of the quota day boundary from UTC.
    pub utc_offset_hours: i32,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 300,
            surplus_threshold: 25.0,
            utc_offset_hours: -8,
        }
    }
}

impl IdleConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite `busy_timeout` applied to every connection.
    pub busy_timeout_ms: u64,
    /// Attempts made by the contention wrapper before surfacing the error.
    pub busy_retries: u32,
    /// Base delay of the contention wrapper's exponential backoff.
    pub busy_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            busy_retries: 8,
            busy_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command to run for a generation call; the prompt is fed on stdin.
    /// `{model}` is replaced with the tier's model name.
    pub command: Vec<String>,
    /// Extra arguments appended for search-grounded calls.
    pub search_args: Vec<String>,
    /// Lowercase stderr fragments that mark a quota rejection.
    pub rate_limit_markers: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "llm".to_string(),
                "prompt".to_string(),
                "-m".to_string(),
                "{model}".to_string(),
            ],
            search_args: vec!["-o".to_string(), "google_search".to_string(), "1".to_string()],
            rate_limit_markers: vec![
                "429".to_string(),
                "resource_exhausted".to_string(),
                "rate limit".to_string(),
            ],
            timeout_secs: 300,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Extra planning attempts after a plan fails validation.
    pub max_planning_retries: u32,
    /// Tier used for planning calls.
    pub tier: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_planning_retries: 1,
            tier: "tier1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Rewrite plain instructions into detailed prompts on the utility tier.
    pub refine_prompts: bool,
    pub prompt_budget_bytes: usize,
    /// Directory `write_to_file` writes into. Relative paths resolve against the data dir.
    pub output_dir: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            refine_prompts: true,
            prompt_budget_bytes: 60_000,
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Request budget and model for one tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    pub rpm: u32,
    pub rpd: u32,
    pub model: String,
}

impl TierConfig {
    fn new(rpm: u32, rpd: u32, model: &str) -> Self {
        Self {
            rpm,
            rpd,
            model: model.to_string(),
        }
    }
}

pub fn default_tiers() -> BTreeMap<String, TierConfig> {
    BTreeMap::from([
        ("tier1".to_string(), TierConfig::new(2, 50, "gemini-2.5-pro")),
        ("tier2".to_string(), TierConfig::new(10, 250, "gemini-2.5-flash")),
        (
            "tier3".to_string(),
            TierConfig::new(15, 1000, "gemini-2.5-flash-lite"),
        ),
    ])
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            premium_tier: "tier1".to_string(),
            utility_tier: "tier2".to_string(),
            default_tier: "tier1".to_string(),
            orchestrator: OrchestratorConfig::default(),
            react: ReactConfig::default(),
            monitor: MonitorConfig::default(),
            idle: IdleConfig::default(),
            store: StoreConfig::default(),
            generator: GeneratorConfig::default(),
            planner: PlannerConfig::default(),
            dispatch: DispatchConfig::default(),
            tiers: default_tiers(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(anyhow!("at least one [tiers.<name>] table is required"));
        }
        for (name, tier) in &self.tiers {
            if tier.rpm == 0 || tier.rpd == 0 {
                return Err(anyhow!("tiers.{name}: rpm and rpd must be > 0"));
            }
            if tier.rpm > tier.rpd {
                return Err(anyhow!("tiers.{name}: rpm must not exceed rpd"));
            }
        }
        for (field, tier) in [
            ("premium_tier", &self.premium_tier),
            ("utility_tier", &self.utility_tier),
            ("default_tier", &self.default_tier),
            ("planner.tier", &self.planner.tier),
        ] {
            if !self.tiers.contains_key(tier) {
                return Err(anyhow!("{field} '{tier}' is not a configured tier"));
            }
        }
        if self.orchestrator.poll_interval_secs == 0 {
            return Err(anyhow!("orchestrator.poll_interval_secs must be > 0"));
        }
        if self.react.max_iterations == 0 {
            return Err(anyhow!("react.max_iterations must be > 0"));
        }
        if self.store.busy_retries == 0 {
            return Err(anyhow!("store.busy_retries must be > 0"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if !(-12..=14).contains(&self.idle.utc_offset_hours) {
            return Err(anyhow!("idle.utc_offset_hours must be within -12..=14"));
        }
        Ok(())
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.keys().cloned().collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
