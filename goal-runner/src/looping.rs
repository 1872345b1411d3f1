//! Long-running orchestrator loop for `goal-runner run`.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::idle::idle_work_permitted;
use crate::cycle::{CycleOutcome, Orchestrator};
use crate::io::config::IdleConfig;
use crate::io::db::duration_ms;
use crate::io::rate_limiter::{RateLimiter, TierUsage};
use crate::io::wake::{Wake, WakeSignal};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No runnable goal was left and `stop_when_idle` was set.
    Idle,
    /// `max_cycles` cycles ran.
    MaxCycles,
    /// Every waker was dropped; nothing can signal the loop again.
    WakeClosed,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub cycles: u32,
    pub stop: LoopStop,
}

#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    pub max_cycles: Option<u32>,
    pub stop_when_idle: bool,
}

/// Emitted once per idle stretch when background work is permitted.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleReport {
    pub idle_for: Duration,
    pub usage: Vec<TierUsage>,
}

/// Tracks how long the loop has gone without an active goal and checks the
/// daily quota surplus once the idle threshold has passed.
pub struct IdleGate {
    limiter: RateLimiter,
    config: IdleConfig,
    idle_since: Option<Instant>,
    reported: bool,
}

impl IdleGate {
    pub fn new(limiter: RateLimiter, config: &IdleConfig) -> Self {
        Self {
            limiter,
            config: config.clone(),
            idle_since: None,
            reported: false,
        }
    }

    pub fn observe(&mut self, outcome: &CycleOutcome, now: Instant) -> Result<Option<IdleReport>> {
        if *outcome != CycleOutcome::Idle {
            self.idle_since = None;
            self.reported = false;
            return Ok(None);
        }
        let since = *self.idle_since.get_or_insert(now);
        let idle_for = now.saturating_duration_since(since);
        if self.reported || idle_for <= self.config.idle_threshold() {
            return Ok(None);
        }

        let usage = self.limiter.report()?;
        let surpluses: Vec<f64> = usage.iter().map(|tier| tier.surplus).collect();
        if !idle_work_permitted(
            &surpluses,
            self.config.surplus_threshold,
            idle_for,
            self.config.idle_threshold(),
        ) {
            return Ok(None);
        }
        self.reported = true;
        Ok(Some(IdleReport { idle_for, usage }))
    }
}

/// Run cycles until a stop condition holds.
///
/// After a cycle that made progress the next one starts at once. Otherwise
/// the loop waits for a wake signal, up to the poll interval or the deferral
/// a rate-limited cycle asked for. Cycle errors are logged and the loop
/// carries on after the poll interval.
pub fn run_loop<C, I>(
    orchestrator: &Orchestrator,
    wake: &WakeSignal,
    idle: &mut IdleGate,
    options: &LoopOptions,
    mut on_cycle: C,
    mut on_idle: I,
) -> Result<LoopOutcome>
where
    C: FnMut(&CycleOutcome),
    I: FnMut(&IdleReport),
{
    let poll = orchestrator.config().orchestrator.poll_interval();
    let mut cycles = 0u32;
    loop {
        if options.max_cycles.is_some_and(|max| cycles >= max) {
            return Ok(LoopOutcome {
                cycles,
                stop: LoopStop::MaxCycles,
            });
        }

        let result = orchestrator.run_cycle();
        cycles += 1;
        let wait = match result {
            Ok(outcome) => {
                on_cycle(&outcome);
                match idle.observe(&outcome, Instant::now()) {
                    Ok(Some(report)) => {
                        info!(idle_secs = report.idle_for.as_secs(), "idle work permitted");
                        on_idle(&report);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(err = %format!("{err:#}"), "idle check failed"),
                }
                if outcome == CycleOutcome::Idle && options.stop_when_idle {
                    return Ok(LoopOutcome {
                        cycles,
                        stop: LoopStop::Idle,
                    });
                }
                match outcome {
                    CycleOutcome::Deferred { wait, .. } => wait,
                    outcome if outcome.made_progress() => Duration::ZERO,
                    _ => poll,
                }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "cycle failed");
                poll
            }
        };

        if wait.is_zero() {
            continue;
        }
        if options.max_cycles.is_some_and(|max| cycles >= max) {
            continue;
        }
        debug!(wait_ms = duration_ms(wait), "waiting for wake");
        if wake.wait(wait) == Wake::Closed {
            return Ok(LoopOutcome {
                cycles,
                stop: LoopStop::WakeClosed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GoalStatus, Step};
    use crate::io::config::StoreConfig;
    use crate::io::db::Database;
    use crate::io::rate_limiter::ManualClock;
    use crate::test_support::{
        Fakes, ScriptedGenerator, ScriptedPlanner, planned_goal, test_config,
    };
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn gate(dir: &tempfile::TempDir, at_ms: i64) -> IdleGate {
        let db = Database::open(&dir.path().join("goals.sqlite"), &StoreConfig::default())
            .expect("open db");
        let config = test_config();
        let limiter = RateLimiter::with_clock(db, &config, Arc::new(ManualClock::at(at_ms)));
        IdleGate::new(limiter, &config.idle)
    }

    /// Noon in the default UTC-8 quota day.
    fn local_noon_ms() -> i64 {
        Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0)
            .single()
            .expect("time")
            .timestamp_millis()
    }

    #[test]
    fn loop_drains_queue_and_stops_when_idle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fakes = Fakes::new(
            ScriptedGenerator::always_text("step finished"),
            ScriptedPlanner::new(Vec::new()),
        );
        let orchestrator = fakes.orchestrator(temp.path(), test_config());
        for (id, created_at) in [("a", 1), ("b", 2)] {
            let goal = planned_goal(id, "tier1", created_at, vec![Step::instruction(1, &[], "do it")]);
            orchestrator.store().insert(&goal).expect("insert");
        }

        let (_waker, wake) = WakeSignal::new();
        let mut idle = gate(&temp, local_noon_ms());
        let mut seen = Vec::new();
        let outcome = run_loop(
            &orchestrator,
            &wake,
            &mut idle,
            &LoopOptions {
                max_cycles: Some(20),
                stop_when_idle: true,
            },
            |cycle| seen.push(cycle.clone()),
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Idle);
        assert_eq!(outcome.cycles, 5);
        assert_eq!(
            seen[1],
            CycleOutcome::Stopped {
                goal_id: "a".to_string(),
                status: GoalStatus::Complete
            }
        );
        assert!(orchestrator.store().list_active().expect("list").is_empty());
        assert!(fakes.planner.calls().is_empty());
    }

    #[test]
    fn loop_honours_max_cycles() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fakes = Fakes::new(
            ScriptedGenerator::always_text("unused"),
            ScriptedPlanner::new(Vec::new()),
        );
        let orchestrator = fakes.orchestrator(temp.path(), test_config());
        let (_waker, wake) = WakeSignal::new();
        let mut idle = gate(&temp, local_noon_ms());
        let outcome = run_loop(
            &orchestrator,
            &wake,
            &mut idle,
            &LoopOptions {
                max_cycles: Some(1),
                stop_when_idle: false,
            },
            |_| {},
            |_| {},
        )
        .expect("loop");
        assert_eq!(
            outcome,
            LoopOutcome {
                cycles: 1,
                stop: LoopStop::MaxCycles
            }
        );
    }

    #[test]
    fn loop_stops_when_wakers_are_gone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fakes = Fakes::new(
            ScriptedGenerator::always_text("unused"),
            ScriptedPlanner::new(Vec::new()),
        );
        let orchestrator = fakes.orchestrator(temp.path(), test_config());
        let (waker, wake) = WakeSignal::new();
        drop(waker);
        let mut idle = gate(&temp, local_noon_ms());
        let outcome = run_loop(
            &orchestrator,
            &wake,
            &mut idle,
            &LoopOptions::default(),
            |_| {},
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::WakeClosed);
        assert_eq!(outcome.cycles, 1);
    }

    /// Half the quota day has passed and nothing was spent, so every tier
    /// has a 50 point surplus; only the idle time decides.
    #[test]
    fn idle_gate_reports_once_per_idle_stretch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gate = gate(&temp, local_noon_ms());
        let start = Instant::now();
        let later = start + Duration::from_secs(301);

        assert_eq!(gate.observe(&CycleOutcome::Idle, start).expect("observe"), None);
        let report = gate
            .observe(&CycleOutcome::Idle, later)
            .expect("observe")
            .expect("report");
        assert_eq!(report.idle_for, Duration::from_secs(301));
        assert_eq!(report.usage.len(), 3);
        assert!(report.usage.iter().all(|tier| tier.surplus > 49.0));
        assert_eq!(gate.observe(&CycleOutcome::Idle, later).expect("observe"), None);

        let busy = CycleOutcome::NoProgress {
            goal_id: "g".to_string(),
        };
        assert_eq!(gate.observe(&busy, later).expect("observe"), None);
        assert_eq!(gate.observe(&CycleOutcome::Idle, later).expect("observe"), None);
    }
}
