//! Producer operations: everything outside the orchestrator does to the queue.
//!
//! Producers only talk to the Goal Store. After each write they signal the
//! orchestrator through the wake file (other processes) or a [`Waker`]
//! (same process) so it reacts without waiting for the poll timeout.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, bail};
use serde_json::json;
use tracing::{info, warn};

use crate::core::types::{Goal, GoalStatus};
use crate::cycle::{new_goal_id, note, prior_outputs};
use crate::io::config::RunnerConfig;
use crate::io::db::now_ms;
use crate::io::goal_store::{ArchivePage, GoalStore};
use crate::io::wake::{Waker, touch};

/// The goal id is unknown or already archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalNotActive {
    pub goal_id: String,
}

impl fmt::Display for GoalNotActive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "goal {} is not active", self.goal_id)
    }
}

impl std::error::Error for GoalNotActive {}

/// Result of a tier change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierChange {
    /// The goal kept its id; only the tier changed.
    Updated,
    /// The goal was waiting for a tier decision and was replaced.
    Superseded { new_goal_id: String },
}

pub struct Producer {
    store: GoalStore,
    tiers: Vec<String>,
    default_tier: String,
    wake_path: Option<PathBuf>,
    waker: Option<Waker>,
}

impl Producer {
    pub fn new(store: GoalStore, config: &RunnerConfig) -> Self {
        Self {
            store,
            tiers: config.tier_names(),
            default_tier: config.default_tier.clone(),
            wake_path: None,
            waker: None,
        }
    }

    /// Touch `wake_path` after every write.
    pub fn with_wake_file(mut self, wake_path: impl Into<PathBuf>) -> Self {
        self.wake_path = Some(wake_path.into());
        self
    }

    /// Signal an in-process loop after every write.
    pub fn with_waker(mut self, waker: Waker) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn store(&self) -> &GoalStore {
        &self.store
    }

    /// Queue a new goal on `tier` (or the default tier).
    pub fn submit_goal(&self, text: &str, tier: Option<&str>) -> Result<Goal> {
        let text = text.trim();
        if text.is_empty() {
            bail!("goal text is empty");
        }
        let tier = tier.unwrap_or(&self.default_tier);
        self.check_tier(tier)?;

        let mut goal = Goal::new(new_goal_id(), text.to_string(), tier.to_string(), now_ms());
        note(&mut goal, &format!("submitted on {tier}"));
        self.store.insert(&goal)?;
        info!(goal_id = %goal.id, tier, "goal submitted");
        self.wake();
        Ok(goal)
    }

    /// Mark an active goal cancelled. The orchestrator archives it on its
    /// next cycle and never overwrites the status.
    pub fn cancel_goal(&self, goal_id: &str) -> Result<()> {
        match self.store.status(goal_id)? {
            None => return Err(not_active(goal_id)),
            Some(status) if status.is_terminal() => {
                info!(goal_id, %status, "goal already stopping; nothing to cancel");
                return Ok(());
            }
            Some(_) => {}
        }
        self.store.set_status(goal_id, GoalStatus::Cancelled)?;
        info!(goal_id, "goal cancelled");
        self.wake();
        Ok(())
    }

    /// Change a goal's tier. A goal waiting for a tier decision is archived
    /// as `complete` and replaced by a pending goal on the new tier that
    /// carries its completed outputs.
    pub fn set_tier(&self, goal_id: &str, tier: &str) -> Result<TierChange> {
        self.check_tier(tier)?;
        let goal = self.active(goal_id)?;
        if goal.status != GoalStatus::AwaitingTierDecision {
            self.store.set_tier(goal_id, tier)?;
            self.wake();
            return Ok(TierChange::Updated);
        }

        let successor = self.supersede(
            goal,
            |old| old.text.clone(),
            tier,
            &format!("tier changed to {tier}"),
        )?;
        Ok(TierChange::Superseded {
            new_goal_id: successor.id,
        })
    }

    /// Answer a goal waiting for user input. Returns the replacement goal.
    pub fn provide_input(&self, goal_id: &str, answer: &str) -> Result<Goal> {
        let answer = answer.trim();
        if answer.is_empty() {
            bail!("answer is empty");
        }
        let goal = self.active(goal_id)?;
        if goal.status != GoalStatus::AwaitingInput {
            bail!(
                "goal {goal_id} is {} and not waiting for input",
                goal.status
            );
        }
        let tier = goal.preferred_tier.clone();
        self.supersede(
            goal,
            |old| format!("Original goal: '{}'. The user clarified: '{answer}'", old.text),
            &tier,
            "user answered",
        )
    }

    pub fn list_active(&self) -> Result<Vec<Goal>> {
        self.store.list_active()
    }

    pub fn list_archived(&self, page: u32, per_page: u32) -> Result<ArchivePage> {
        self.store.list_archived(page, per_page)
    }

    /// Insert the successor first, then archive the old goal as `complete`.
    fn supersede(
        &self,
        mut goal: Goal,
        text: impl FnOnce(&Goal) -> String,
        tier: &str,
        reason: &str,
    ) -> Result<Goal> {
        let mut successor = Goal::new(new_goal_id(), text(&goal), tier.to_string(), goal.created_at);
        successor.strategy = json!({
            "prior_outputs": prior_outputs(&goal),
            "continued_from": goal.id,
        });
        note(&mut successor, &format!("continues goal {} ({reason})", goal.id));
        self.store.insert(&successor)?;

        goal.status = GoalStatus::Complete;
        note(&mut goal, &format!("superseded by goal {} ({reason})", successor.id));
        let stored = self.store.update(&goal)?;
        if stored == GoalStatus::Cancelled {
            warn!(goal_id = %goal.id, "goal was cancelled while being superseded");
        }
        self.store.archive(&goal.id)?;
        info!(old = %goal.id, new = %successor.id, reason, "goal superseded");
        self.wake();
        Ok(successor)
    }

    fn active(&self, goal_id: &str) -> Result<Goal> {
        self.store
            .get(goal_id)?
            .ok_or_else(|| not_active(goal_id))
    }

    fn check_tier(&self, tier: &str) -> Result<()> {
        if !self.tiers.iter().any(|known| known == tier) {
            bail!(
                "unknown tier '{tier}' (known: {})",
                self.tiers.join(", ")
            );
        }
        Ok(())
    }

    fn wake(&self) {
        if let Some(path) = &self.wake_path
            && let Err(err) = touch(path)
        {
            warn!(err = %format!("{err:#}"), "could not touch wake file");
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}

fn not_active(goal_id: &str) -> anyhow::Error {
    GoalNotActive {
        goal_id: goal_id.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Step, StepStatus};
    use crate::io::wake::{Wake, WakeSignal};
    use crate::test_support::store_in;
    use std::time::Duration;

    fn producer(dir: &tempfile::TempDir) -> Producer {
        Producer::new(store_in(dir.path()), &RunnerConfig::default())
    }

    #[test]
    fn submit_validates_text_and_tier() {
        let temp = tempfile::tempdir().expect("tempdir");
        let producer = producer(&temp);
        assert!(producer.submit_goal("   ", None).is_err());
        assert!(producer.submit_goal("plan a trip", Some("tier9")).is_err());

        let goal = producer.submit_goal("plan a trip", None).expect("submit");
        assert_eq!(goal.status, GoalStatus::Pending);
        assert_eq!(goal.preferred_tier, "tier1");
        assert!(goal.plan.is_empty());
        assert_eq!(producer.list_active().expect("list").len(), 1);
    }

    #[test]
    fn submit_wakes_in_process_loop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (waker, signal) = WakeSignal::new();
        let producer = producer(&temp).with_waker(waker);
        producer.submit_goal("x", None).expect("submit");
        assert_eq!(signal.wait(Duration::from_secs(1)), Wake::Signalled);
    }

    #[test]
    fn cancel_requires_active_goal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let producer = producer(&temp);
        let err = producer.cancel_goal("missing").expect_err("unknown goal");
        assert!(err.downcast_ref::<GoalNotActive>().is_some());
        let goal = producer.submit_goal("x", None).expect("submit");
        producer.cancel_goal(&goal.id).expect("cancel");
        assert_eq!(
            producer.store().status(&goal.id).expect("status"),
            Some(GoalStatus::Cancelled)
        );
    }

    /// Choosing a tier for an escalated goal replaces it, keeping its place
    /// in the queue and its completed outputs.
    #[test]
    fn tier_decision_supersedes_goal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let producer = producer(&temp);
        let mut goal = producer.submit_goal("research venues", None).expect("submit");
        let mut done = Step::instruction(1, &[], "list venues");
        done.status = StepStatus::Complete;
        done.output = Some("three venues".to_string());
        goal.plan = vec![done, Step::instruction(2, &[1], "compare")];
        goal.status = GoalStatus::AwaitingTierDecision;
        producer.store().update(&goal).expect("update");

        let TierChange::Superseded { new_goal_id } =
            producer.set_tier(&goal.id, "tier2").expect("set tier")
        else {
            panic!("expected supersede");
        };
        let old = producer
            .store()
            .get_archived(&goal.id)
            .expect("get")
            .expect("archived");
        assert_eq!(old.status, GoalStatus::Complete);
        let new = producer.store().get(&new_goal_id).expect("get").expect("new");
        assert_eq!(new.status, GoalStatus::Pending);
        assert_eq!(new.preferred_tier, "tier2");
        assert_eq!(new.created_at, goal.created_at);
        assert_eq!(new.strategy["prior_outputs"]["1"], "three venues");
        assert!(new.plan.is_empty());
    }

    #[test]
    fn tier_change_in_place_when_not_escalated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let producer = producer(&temp);
        let goal = producer.submit_goal("x", None).expect("submit");
        assert_eq!(
            producer.set_tier(&goal.id, "tier3").expect("set tier"),
            TierChange::Updated
        );
        let stored = producer.store().get(&goal.id).expect("get").expect("goal");
        assert_eq!(stored.preferred_tier, "tier3");
    }

    #[test]
    fn answer_replaces_waiting_goal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let producer = producer(&temp);
        let goal = producer.submit_goal("plan my trip", None).expect("submit");
        assert!(producer.provide_input(&goal.id, "Lisbon").is_err());

        producer
            .store()
            .set_status(&goal.id, GoalStatus::AwaitingInput)
            .expect("pause");
        let next = producer.provide_input(&goal.id, "Lisbon").expect("answer");
        assert_eq!(
            next.text,
            "Original goal: 'plan my trip'. The user clarified: 'Lisbon'"
        );
        assert!(producer.store().get(&goal.id).expect("get").is_none());
        assert_eq!(producer.list_archived(1, 10).expect("archive").total, 1);
    }
}
