//! Scripted collaborators and fixtures for tests.
//!
//! None of these spawn processes or touch the network. Every fake records
//! the calls it receives so tests can assert on what the orchestrator asked.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::agents::monitor::{Assessment, QualityAssessor};
use crate::agents::planner::{PlanOutcome, PlanningRateLimited, PlanningService};
use crate::agents::selector::{Candidate, ContextSelector};
use crate::core::types::{Goal, PlannedStep, Step};
use crate::cycle::{Collaborators, Orchestrator};
use crate::io::config::{RunnerConfig, StoreConfig};
use crate::io::db::Database;
use crate::io::generator::{Generation, GenerationRequest, Generator};
use crate::io::goal_store::GoalStore;
use crate::react::Sleeper;

type Responder = Box<dyn Fn(&GenerationRequest) -> Generation + Send + Sync>;

/// Generator that replays a script, or answers through a closure.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Generation>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    /// Replay `script` in order, then fail every further call.
    pub fn new(script: Vec<Generation>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_text(text: &str) -> Self {
        let text = text.to_string();
        Self::from_fn(move |_| Generation::Text(text.clone()))
    }

    pub fn from_fn(
        responder: impl Fn(&GenerationRequest) -> Generation + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> Generation {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.clone());
        if let Some(next) = self.script.lock().expect("script lock").pop_front() {
            return next;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Generation::Failed("scripted generator exhausted".to_string()),
        }
    }
}

/// One scripted planner answer.
#[derive(Debug, Clone)]
pub enum ScriptedPlan {
    Outcome(PlanOutcome),
    RateLimited,
    Error(String),
}

/// Planner that replays outcomes and records `(goal_text, strategy_context)`.
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<ScriptedPlan>>,
    calls: Mutex<Vec<(String, Option<Value>)>>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<ScriptedPlan>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Plans each call with the next step list and an empty strategy.
    pub fn plans(plans: Vec<Vec<PlannedStep>>) -> Self {
        Self::new(
            plans
                .into_iter()
                .map(|steps| {
                    ScriptedPlan::Outcome(PlanOutcome::Plan {
                        steps,
                        strategy: serde_json::json!({"approach": "scripted"}),
                    })
                })
                .collect(),
        )
    }

    pub fn calls(&self) -> Vec<(String, Option<Value>)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl PlanningService for ScriptedPlanner {
    fn plan(&self, goal_text: &str, strategy_context: Option<&Value>) -> Result<PlanOutcome> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((goal_text.to_string(), strategy_context.cloned()));
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(ScriptedPlan::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedPlan::RateLimited) => Err(PlanningRateLimited {
                tier: "tier1".to_string(),
            }
            .into()),
            Some(ScriptedPlan::Error(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted planner exhausted")),
        }
    }
}

/// Selector that hands every candidate through unchanged, or always fails.
pub struct StaticSelector {
    fail: bool,
    calls: Mutex<Vec<(String, Vec<u32>)>>,
}

impl StaticSelector {
    pub fn keep_all() -> Self {
        Self {
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<u32>)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ContextSelector for StaticSelector {
    fn select(&self, task: &str, candidates: &[Candidate]) -> Result<BTreeMap<u32, String>> {
        self.calls.lock().expect("calls lock").push((
            task.to_string(),
            candidates.iter().map(|c| c.id).collect(),
        ));
        if self.fail {
            return Err(anyhow!("selector unavailable"));
        }
        Ok(candidates
            .iter()
            .map(|c| (c.id, c.output.clone()))
            .collect())
    }
}

/// Assessor that replays verdicts and answers `Continue` once the script runs out.
pub struct ScriptedAssessor {
    script: Mutex<VecDeque<Result<Assessment, String>>>,
    calls: Mutex<Vec<(Vec<String>, String)>>,
}

impl ScriptedAssessor {
    pub fn new(script: Vec<Result<Assessment, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_continue() -> Self {
        Self::new(Vec::new())
    }

    /// `(remaining steps, last output)` per call.
    pub fn calls(&self) -> Vec<(Vec<String>, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl QualityAssessor for ScriptedAssessor {
    fn assess(&self, _goal: &str, remaining: &[String], last_output: &str) -> Result<Assessment> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((remaining.to_vec(), last_output.to_string()));
        match self.script.lock().expect("script lock").pop_front() {
            Some(Ok(assessment)) => Ok(assessment),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Assessment::Continue),
        }
    }
}

/// Sleeper that returns at once and records requested durations.
#[derive(Default)]
pub struct NoopSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl NoopSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().expect("slept lock").clone()
    }
}

impl Sleeper for NoopSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().expect("slept lock").push(duration);
    }
}

/// Open a fresh store at `<dir>/goals.sqlite`.
pub fn store_in(dir: &Path) -> GoalStore {
    let db = Database::open(&dir.join("goals.sqlite"), &StoreConfig::default()).expect("open db");
    GoalStore::new(db)
}

/// Config tuned for tests: monitor on, no refinement, short waits.
pub fn test_config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.dispatch.refine_prompts = false;
    config.orchestrator.poll_interval_secs = 1;
    config.store.busy_backoff_ms = 1;
    config
}

/// A pending goal with no plan.
pub fn pending_goal(id: &str, text: &str, tier: &str, created_at: i64) -> Goal {
    Goal::new(id.to_string(), text.to_string(), tier.to_string(), created_at)
}

/// A goal that already carries `plan`.
pub fn planned_goal(id: &str, tier: &str, created_at: i64, plan: Vec<Step>) -> Goal {
    let mut goal = pending_goal(id, &format!("{id} goal"), tier, created_at);
    goal.plan = plan;
    goal
}

/// Scripted collaborators bundled for orchestrator tests. The `Arc`s stay
/// shared with the orchestrator so tests can inspect recorded calls.
pub struct Fakes {
    pub generator: Arc<ScriptedGenerator>,
    pub planner: Arc<ScriptedPlanner>,
    pub selector: Arc<StaticSelector>,
    pub assessor: Arc<ScriptedAssessor>,
    pub sleeper: Arc<NoopSleeper>,
}

impl Fakes {
    pub fn new(generator: ScriptedGenerator, planner: ScriptedPlanner) -> Self {
        Self {
            generator: Arc::new(generator),
            planner: Arc::new(planner),
            selector: Arc::new(StaticSelector::keep_all()),
            assessor: Arc::new(ScriptedAssessor::always_continue()),
            sleeper: Arc::new(NoopSleeper::default()),
        }
    }

    pub fn with_assessor(mut self, assessor: ScriptedAssessor) -> Self {
        self.assessor = Arc::new(assessor);
        self
    }

    pub fn with_selector(mut self, selector: StaticSelector) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            generator: self.generator.clone(),
            planner: self.planner.clone(),
            selector: self.selector.clone(),
            assessor: self.assessor.clone(),
            sleeper: self.sleeper.clone(),
        }
    }

    /// Orchestrator over a store in `dir`, writing files under `dir/output`.
    pub fn orchestrator(&self, dir: &Path, config: RunnerConfig) -> Orchestrator {
        Orchestrator::new(
            store_in(dir),
            config,
            dir.join("output"),
            self.collaborators(),
        )
    }
}
