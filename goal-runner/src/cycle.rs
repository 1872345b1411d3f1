//! One orchestrator cycle over the single active goal.
//!
//! A cycle archives cancelled goals, fetches the oldest runnable goal, plans
//! it on first sight, and dispatches its frontier: a heavyweight step alone,
//! otherwise every eligible step as a swarm of scoped threads. Every step
//! transition is persisted before the next result is looked at.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::agents::monitor::{PlanMonitor, QualityAssessor, Verdict};
use crate::agents::planner::{InvalidPlanError, PlanOutcome, PlanningRateLimited, PlanningService};
use crate::agents::selector::{ContextSelector, candidates_from, curate};
use crate::core::frontier::{Batch, Progress, plan_progress, remaining_steps};
use crate::core::plan_check::{into_steps, validate_plan};
use crate::core::state_update::{Transition, apply_step_outcome};
use crate::core::types::{Goal, GoalStatus, Step, StepOutcome, ToolCall};
use crate::dispatch::{DispatchRequest, Dispatched, Dispatcher, GoalView};
use crate::io::config::RunnerConfig;
use crate::io::generator::Generator;
use crate::io::goal_store::GoalStore;
use crate::react::Sleeper;
use crate::tools::{PLAN_TOOLS, REQUEST_USER_INPUT};

/// Status change published to listeners after every persisted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalEvent {
    pub goal_id: String,
    pub status: GoalStatus,
    pub detail: String,
}

/// What a cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No runnable goal.
    Idle,
    /// The goal has pending steps but none is eligible.
    NoProgress { goal_id: String },
    /// Steps ran; `completed` lists the ones that finished.
    Advanced { goal_id: String, completed: Vec<u32> },
    /// A fallback tier is out of quota; retry after `wait`.
    Deferred { goal_id: String, wait: Duration },
    /// The goal left the runnable set (archived or paused) with `status`.
    Stopped { goal_id: String, status: GoalStatus },
    /// The goal was superseded by a fresh plan under a new id.
    Replanned {
        old_goal_id: String,
        new_goal_id: String,
    },
}

impl CycleOutcome {
    /// Whether the next cycle may run without waiting.
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Advanced { .. }
                | CycleOutcome::Stopped { .. }
                | CycleOutcome::Replanned { .. }
        )
    }
}

/// External services the orchestrator drives.
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub planner: Arc<dyn PlanningService>,
    pub selector: Arc<dyn ContextSelector>,
    pub assessor: Arc<dyn QualityAssessor>,
    pub sleeper: Arc<dyn Sleeper>,
}

/// How the cycle continues after one step result is applied.
enum Flow {
    Continue { completed: bool },
    Defer(Duration),
    Stop(CycleOutcome),
}

pub struct Orchestrator {
    store: GoalStore,
    config: RunnerConfig,
    planner: Arc<dyn PlanningService>,
    selector: Arc<dyn ContextSelector>,
    monitor: PlanMonitor,
    dispatcher: Dispatcher,
    events: Option<Sender<GoalEvent>>,
}

impl Orchestrator {
    pub fn new(
        store: GoalStore,
        config: RunnerConfig,
        output_dir: impl Into<PathBuf>,
        collaborators: Collaborators,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            &config,
            collaborators.generator,
            collaborators.sleeper,
            output_dir,
        );
        Self {
            monitor: PlanMonitor::new(collaborators.assessor, &config.monitor),
            planner: collaborators.planner,
            selector: collaborators.selector,
            dispatcher,
            store,
            config,
            events: None,
        }
    }

    /// Publish a [`GoalEvent`] for every persisted transition.
    pub fn with_events(mut self, events: Sender<GoalEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &GoalStore {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[instrument(skip_all)]
    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        self.archive_cancelled()?;
        let Some(mut goal) = self.store.fetch_active_goal()? else {
            return Ok(CycleOutcome::Idle);
        };
        debug!(goal_id = %goal.id, status = %goal.status, "active goal");

        if !goal.has_plan()
            && let Some(outcome) = self.plan_goal(&mut goal)?
        {
            return Ok(outcome);
        }

        match plan_progress(&goal.plan) {
            Progress::Finished { all_complete } => self.finish(goal, all_complete),
            Progress::Blocked => Ok(CycleOutcome::NoProgress { goal_id: goal.id }),
            Progress::Dispatch(Batch::Exclusive(step_id)) => self.run_exclusive(goal, step_id),
            Progress::Dispatch(Batch::Swarm(step_ids)) => self.run_swarm(goal, &step_ids),
        }
    }

    /// Archive every goal a producer cancelled since the last cycle.
    fn archive_cancelled(&self) -> Result<()> {
        for goal_id in self.store.cancelled_ids()? {
            if let Some(mut goal) = self.store.get(&goal_id)? {
                note(&mut goal, "goal cancelled by producer; archiving");
                self.store.update(&goal)?;
            }
            if self.store.archive(&goal_id)? {
                self.emit(&goal_id, GoalStatus::Cancelled, "archived after cancellation");
            }
        }
        Ok(())
    }

    /// Returns `Some` when planning ended the cycle.
    fn plan_goal(&self, goal: &mut Goal) -> Result<Option<CycleOutcome>> {
        let context = (!goal.strategy.is_null()).then_some(&goal.strategy);
        let planned = self.planner.plan(&goal.text, context);
        let outcome = match planned {
            Ok(PlanOutcome::Plan { steps, strategy }) => {
                let errors = validate_plan(&steps, PLAN_TOOLS);
                if !errors.is_empty() {
                    return self
                        .fail_planning(goal, &InvalidPlanError { errors }.into())
                        .map(Some);
                }
                goal.strategy = merge_strategy(&goal.strategy, strategy);
                goal.plan = into_steps(steps);
                goal.status = GoalStatus::InProgress;
                let line = format!("plan accepted with {} steps", goal.plan.len());
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Some(cancelled(goal)));
                }
                return Ok(None);
            }
            Ok(PlanOutcome::Clarify { question, strategy }) => {
                goal.strategy = merge_strategy(&goal.strategy, strategy);
                goal.plan = vec![Step::tool(
                    1,
                    &[],
                    ToolCall::new(REQUEST_USER_INPUT).with_param("question", question.as_str()),
                )];
                goal.status = GoalStatus::AwaitingInput;
                let line = format!("planner needs clarification: {question}");
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Some(cancelled(goal)));
                }
                stopped(goal)
            }
            Err(err) if err.downcast_ref::<PlanningRateLimited>().is_some() => {
                info!(goal_id = %goal.id, err = %err, "planning deferred");
                CycleOutcome::Deferred {
                    goal_id: goal.id.clone(),
                    wait: self.config.orchestrator.rate_limit_backoff(),
                }
            }
            Err(err) => return self.fail_planning(goal, &err).map(Some),
        };
        Ok(Some(outcome))
    }

    /// Archive a goal whose planning failed. The plan stays empty.
    fn fail_planning(&self, goal: &mut Goal, err: &anyhow::Error) -> Result<CycleOutcome> {
        warn!(goal_id = %goal.id, err = %format!("{err:#}"), "planning failed");
        goal.status = GoalStatus::Failed;
        note(goal, &format!("planning failed: {err:#}"));
        self.archive(goal, "planning failed")
    }

    fn run_exclusive(&self, mut goal: Goal, step_id: u32) -> Result<CycleOutcome> {
        let step = goal
            .step(step_id)
            .cloned()
            .ok_or_else(|| anyhow!("step {step_id} missing from goal {}", goal.id))?;
        let view = GoalView::of(&goal);
        let outputs = goal.completed_outputs();
        let context = curate(
            self.selector.as_ref(),
            &step.task_text(),
            &candidates_from(&goal.plan),
        );
        note(&mut goal, &format!("step {step_id}: dispatching exclusively"));

        let dispatched = self.dispatcher.dispatch(&DispatchRequest {
            goal: &view,
            step: &step,
            context: &context,
            outputs: &outputs,
        });
        Ok(match self.apply(&mut goal, step_id, dispatched)? {
            Flow::Continue { completed } => CycleOutcome::Advanced {
                goal_id: goal.id,
                completed: if completed { vec![step_id] } else { Vec::new() },
            },
            Flow::Defer(wait) => CycleOutcome::Deferred {
                goal_id: goal.id,
                wait,
            },
            Flow::Stop(outcome) => outcome,
        })
    }

    /// Dispatch every step in `step_ids` concurrently and apply results as
    /// they arrive. A stopping result raises the abort flag; workers that
    /// have not dispatched yet skip their call and later results are dropped.
    fn run_swarm(&self, mut goal: Goal, step_ids: &[u32]) -> Result<CycleOutcome> {
        let steps: Vec<Step> = step_ids
            .iter()
            .filter_map(|id| goal.step(*id).cloned())
            .collect();
        let view = GoalView::of(&goal);
        let outputs = goal.completed_outputs();
        let candidates = candidates_from(&goal.plan);
        let listed: Vec<String> = step_ids.iter().map(u32::to_string).collect();
        note(
            &mut goal,
            &format!("dispatching swarm of steps {}", listed.join(", ")),
        );

        let abort = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<(u32, Dispatched)>();
        let mut completed = Vec::new();
        let mut deferred: Option<Duration> = None;

        let stopped = thread::scope(|scope| -> Result<Option<CycleOutcome>> {
            for step in &steps {
                let tx = tx.clone();
                let abort = &abort;
                let dispatcher = &self.dispatcher;
                let selector = self.selector.as_ref();
                let (view, outputs, candidates) = (&view, &outputs, &candidates);
                scope.spawn(move || {
                    if abort.load(Ordering::SeqCst) {
                        return;
                    }
                    let context = curate(selector, &step.task_text(), candidates);
                    if abort.load(Ordering::SeqCst) {
                        return;
                    }
                    let dispatched = dispatcher.dispatch(&DispatchRequest {
                        goal: view,
                        step,
                        context: &context,
                        outputs,
                    });
                    // The receiver is gone once the cycle has stopped.
                    let _ = tx.send((step.id, dispatched));
                });
            }
            drop(tx);

            for (step_id, dispatched) in rx {
                match self.apply(&mut goal, step_id, dispatched) {
                    Ok(Flow::Continue { completed: true }) => completed.push(step_id),
                    Ok(Flow::Continue { completed: false }) => {}
                    Ok(Flow::Defer(wait)) => deferred = Some(wait),
                    Ok(Flow::Stop(outcome)) => {
                        abort.store(true, Ordering::SeqCst);
                        return Ok(Some(outcome));
                    }
                    Err(err) => {
                        abort.store(true, Ordering::SeqCst);
                        return Err(err);
                    }
                }
            }
            Ok(None)
        })?;

        if let Some(outcome) = stopped {
            return Ok(outcome);
        }
        // Progress wins over a deferral; the next cycle meets the limiter again.
        Ok(match deferred {
            Some(wait) if completed.is_empty() => CycleOutcome::Deferred {
                goal_id: goal.id,
                wait,
            },
            _ => CycleOutcome::Advanced {
                goal_id: goal.id,
                completed,
            },
        })
    }

    /// Apply one dispatch result to the goal, persist it, and decide how the
    /// cycle goes on.
    #[instrument(skip_all, fields(goal_id = %goal.id, step_id = step_id))]
    fn apply(&self, goal: &mut Goal, step_id: u32, dispatched: Dispatched) -> Result<Flow> {
        for line in &dispatched.log {
            note(goal, line);
        }
        let max_retries = self.config.orchestrator.max_retries;
        let step = goal
            .step_mut(step_id)
            .ok_or_else(|| anyhow!("step {step_id} missing from goal"))?;
        let transition = apply_step_outcome(step, &dispatched.outcome, max_retries);
        let summary = step.summary.clone().unwrap_or_default();

        match (transition, dispatched.outcome) {
            (Transition::Completed, StepOutcome::Completed { output }) => {
                let line = format!("step {step_id}: complete: {summary}");
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Flow::Stop(cancelled(goal)));
                }
                let remaining: Vec<String> = remaining_steps(&goal.plan, step_id)
                    .iter()
                    .map(|step| step.task_text())
                    .collect();
                match self.monitor.check(&goal.text, &remaining, &output) {
                    Verdict::Continue => Ok(Flow::Continue { completed: true }),
                    Verdict::Replan => {
                        note(goal, &format!("monitor requested a re-plan after step {step_id}"));
                        self.replan(goal).map(Flow::Stop)
                    }
                }
            }
            (Transition::Retrying { retries }, StepOutcome::Failed { error }) => {
                let line = format!(
                    "step {step_id}: failed (retry {retries} of {max_retries}): {error}"
                );
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Flow::Stop(cancelled(goal)));
                }
                Ok(Flow::Continue { completed: false })
            }
            (Transition::RetriesExhausted { retries }, StepOutcome::Failed { error }) => {
                goal.status = GoalStatus::Failed;
                note(
                    goal,
                    &format!("step {step_id}: failed after {retries} retries: {error}"),
                );
                self.archive(goal, "retries exhausted").map(Flow::Stop)
            }
            (Transition::RateLimited, _) if goal.preferred_tier == self.config.premium_tier => {
                goal.status = GoalStatus::AwaitingTierDecision;
                let line = format!(
                    "step {step_id}: rate limited on premium tier {}; raise tier with `goal-runner tier`",
                    goal.preferred_tier
                );
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Flow::Stop(cancelled(goal)));
                }
                Ok(Flow::Stop(stopped(goal)))
            }
            (Transition::RateLimited, _) => {
                let wait = self.config.orchestrator.rate_limit_backoff();
                let line = format!(
                    "step {step_id}: rate limited on {}; deferring {}s",
                    goal.preferred_tier,
                    wait.as_secs()
                );
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Flow::Stop(cancelled(goal)));
                }
                Ok(Flow::Defer(wait))
            }
            (Transition::AwaitingInput, StepOutcome::AwaitingInput { question }) => {
                goal.status = GoalStatus::AwaitingInput;
                let line = format!("step {step_id}: waiting for user input: {question}");
                note(goal, &line);
                if !self.persist(goal, &line)? {
                    return Ok(Flow::Stop(cancelled(goal)));
                }
                Ok(Flow::Stop(stopped(goal)))
            }
            (transition, outcome) => Err(anyhow!(
                "step {step_id}: transition {transition:?} does not match outcome {outcome:?}"
            )),
        }
    }

    /// Supersede `goal` with a fresh, unplanned goal carrying its outputs.
    fn replan(&self, goal: &mut Goal) -> Result<CycleOutcome> {
        let max_replans = self.config.orchestrator.max_replans;
        if goal.replan_count >= max_replans {
            goal.status = GoalStatus::Failed;
            note(goal, &format!("re-plan limit of {max_replans} reached; failing goal"));
            return self.archive(goal, "re-plan limit reached");
        }

        goal.status = GoalStatus::AwaitingReplan;
        if !self.persist(goal, "awaiting re-plan")? {
            return Ok(cancelled(goal));
        }

        let mut successor = Goal::new(
            new_goal_id(),
            goal.text.clone(),
            goal.preferred_tier.clone(),
            goal.created_at,
        );
        successor.replan_count = goal.replan_count + 1;
        successor.strategy = json!({
            "prior_outputs": prior_outputs(goal),
            "replanned_from": goal.id,
        });
        let line = format!("re-plan {} of goal {}", successor.replan_count, goal.id);
        note(&mut successor, &line);
        self.store.insert(&successor)?;
        self.emit(&successor.id, successor.status, "created by re-plan");

        goal.status = GoalStatus::Complete;
        note(goal, &format!("superseded by re-planned goal {}", successor.id));
        self.archive(goal, "superseded by re-plan")?;
        Ok(CycleOutcome::Replanned {
            old_goal_id: goal.id.clone(),
            new_goal_id: successor.id,
        })
    }

    fn finish(&self, mut goal: Goal, all_complete: bool) -> Result<CycleOutcome> {
        goal.status = if all_complete {
            GoalStatus::Complete
        } else {
            GoalStatus::Failed
        };
        let line = format!("goal finished: {}", goal.status);
        note(&mut goal, &line);
        self.archive(&mut goal, "finished")
    }

    /// Persist a terminal status and move the goal to the archive.
    fn archive(&self, goal: &mut Goal, detail: &str) -> Result<CycleOutcome> {
        if !self.persist(goal, detail)? {
            return Ok(cancelled(goal));
        }
        self.store.archive(&goal.id)?;
        info!(goal_id = %goal.id, status = %goal.status, "goal archived");
        Ok(stopped(goal))
    }

    /// Write `goal` and publish the transition. Returns `false` when a
    /// producer cancelled the goal meanwhile; the goal is archived then.
    fn persist(&self, goal: &mut Goal, detail: &str) -> Result<bool> {
        let stored = self.store.update(goal)?;
        if stored == GoalStatus::Cancelled {
            goal.status = GoalStatus::Cancelled;
            note(goal, "goal cancelled by producer; archiving");
            self.store.update(goal)?;
            self.store.archive(&goal.id)?;
            self.emit(&goal.id, GoalStatus::Cancelled, "archived after cancellation");
            return Ok(false);
        }
        self.emit(&goal.id, goal.status, detail);
        Ok(true)
    }

    fn emit(&self, goal_id: &str, status: GoalStatus, detail: &str) {
        if let Some(events) = &self.events {
            // Listeners are optional; a dropped receiver is not an error.
            let _ = events.send(GoalEvent {
                goal_id: goal_id.to_string(),
                status,
                detail: detail.to_string(),
            });
        }
    }
}

fn cancelled(goal: &Goal) -> CycleOutcome {
    CycleOutcome::Stopped {
        goal_id: goal.id.clone(),
        status: GoalStatus::Cancelled,
    }
}

fn stopped(goal: &Goal) -> CycleOutcome {
    CycleOutcome::Stopped {
        goal_id: goal.id.clone(),
        status: goal.status,
    }
}

/// Fresh goal id: time-ordered UUID v7.
pub fn new_goal_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Append a timestamped line to the goal's execution log.
pub fn note(goal: &mut Goal, message: &str) {
    debug!(goal_id = %goal.id, "{message}");
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    goal.append_log(&format!("[{stamp}] {message}"));
}

/// Completed outputs keyed by step id, as carried into a successor goal.
pub(crate) fn prior_outputs(goal: &Goal) -> Value {
    Value::Object(
        goal.completed_outputs()
            .into_iter()
            .map(|(id, output)| (id.to_string(), Value::String(output)))
            .collect(),
    )
}

/// Keep the bookkeeping keys of the goal's current strategy when the
/// planner returns a new one.
fn merge_strategy(current: &Value, planned: Value) -> Value {
    let Value::Object(current) = current else {
        return planned;
    };
    let mut merged = match planned {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("plan".to_string(), other)]),
    };
    for key in ["prior_outputs", "replanned_from", "continued_from"] {
        if let Some(value) = current.get(key) {
            merged.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_prior_outputs() {
        let current = json!({"prior_outputs": {"1": "a"}, "replanned_from": "g1", "approach": "old"});
        let merged = merge_strategy(&current, json!({"approach": "new"}));
        assert_eq!(
            merged,
            json!({"approach": "new", "prior_outputs": {"1": "a"}, "replanned_from": "g1"})
        );
        assert_eq!(merge_strategy(&Value::Null, json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn notes_are_timestamped_lines() {
        let mut goal = Goal::new("g".to_string(), "t".to_string(), "tier1".to_string(), 0);
        note(&mut goal, "hello");
        assert!(goal.execution_log.starts_with('['));
        assert!(goal.execution_log.ends_with("] hello\n"));
    }

    #[test]
    fn goal_ids_are_unique_uuids() {
        let a = new_goal_id();
        let b = new_goal_id();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }
}
