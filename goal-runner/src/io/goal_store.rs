//! Persisted goal queue: an active table and an archive table with identical
//! columns, plus the user-profile key/value table.
//!
//! All operations are single-row statements (or one short transaction for
//! `archive`) executed through [`Database::with_retry`], so concurrent
//! producers and the orchestrator never see contention errors.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::types::{Goal, GoalStatus, Step};
use crate::io::db::{Database, missing_row};

const COLUMNS: &str =
    "id, goal, plan, status, strategy, execution_log, preferred_tier, replan_count, created_at";

/// Goal persistence shared by every process that touches the queue.
#[derive(Debug, Clone)]
pub struct GoalStore {
    db: Database,
}

/// One page of archived goals, newest first.
#[derive(Debug, Clone)]
pub struct ArchivePage {
    pub goals: Vec<Goal>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

struct GoalRow {
    id: String,
    text: String,
    plan: String,
    status: String,
    strategy: String,
    execution_log: String,
    preferred_tier: String,
    replan_count: u32,
    created_at: i64,
}

impl GoalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            plan: row.get(2)?,
            status: row.get(3)?,
            strategy: row.get(4)?,
            execution_log: row.get(5)?,
            preferred_tier: row.get(6)?,
            replan_count: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_goal(self) -> Result<Goal> {
        let plan: Vec<Step> = serde_json::from_str(&self.plan)
            .with_context(|| format!("parse plan of goal {}", self.id))?;
        let strategy: Value = serde_json::from_str(&self.strategy)
            .with_context(|| format!("parse strategy of goal {}", self.id))?;
        Ok(Goal {
            status: self.status.parse()?,
            id: self.id,
            text: self.text,
            plan,
            strategy,
            preferred_tier: self.preferred_tier,
            execution_log: self.execution_log,
            replan_count: self.replan_count,
            created_at: self.created_at,
        })
    }
}

impl GoalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(goal_id = %goal.id))]
    pub fn insert(&self, goal: &Goal) -> Result<()> {
        let plan = serde_json::to_string(&goal.plan).context("serialize plan")?;
        let strategy = serde_json::to_string(&goal.strategy).context("serialize strategy")?;
        self.db.with_retry("insert goal", |conn| {
            conn.execute(
                &format!("INSERT INTO goals ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    goal.id,
                    goal.text,
                    plan,
                    goal.status.as_str(),
                    strategy,
                    goal.execution_log,
                    goal.preferred_tier,
                    goal.replan_count,
                    goal.created_at,
                ],
            )
        })?;
        info!(status = %goal.status, tier = %goal.preferred_tier, "goal inserted");
        Ok(())
    }

    /// The single oldest goal that is `pending` or `in-progress`.
    ///
    /// Paused and awaiting goals are skipped, so the same goal keeps coming
    /// back until it reaches a terminal or paused state.
    pub fn fetch_active_goal(&self) -> Result<Option<Goal>> {
        let row = self.db.with_retry("fetch active goal", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLUMNS} FROM goals
                     WHERE status IN ('pending', 'in-progress')
                     ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                [],
                GoalRow::from_row,
            )
            .optional()
        })?;
        row.map(GoalRow::into_goal).transpose()
    }

    /// Persist plan, status, strategy and log.
    ///
    /// A `cancelled` status written by another process is never overwritten;
    /// returns the status actually stored.
    #[instrument(skip_all, fields(goal_id = %goal.id, status = %goal.status))]
    pub fn update(&self, goal: &Goal) -> Result<GoalStatus> {
        let plan = serde_json::to_string(&goal.plan).context("serialize plan")?;
        let strategy = serde_json::to_string(&goal.strategy).context("serialize strategy")?;
        let stored: Option<String> = self.db.with_retry("update goal", |conn| {
            conn.query_row(
                "UPDATE goals
                 SET plan = ?2,
                     status = CASE WHEN status = 'cancelled' THEN status ELSE ?3 END,
                     strategy = ?4,
                     execution_log = ?5
                 WHERE id = ?1
                 RETURNING status",
                params![goal.id, plan, goal.status.as_str(), strategy, goal.execution_log],
                |row| row.get(0),
            )
            .optional()
        })?;
        let stored = stored.ok_or_else(|| missing_row("goals", &goal.id))?;
        debug!(stored = %stored, "goal updated");
        stored.parse()
    }

    /// Atomically move a goal from the active table to the archive.
    ///
    /// Returns `false` when the goal is no longer active (already archived or
    /// never inserted); the archive is left untouched in that case.
    #[instrument(skip(self))]
    pub fn archive(&self, goal_id: &str) -> Result<bool> {
        let moved = self.db.with_retry("archive goal", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let copied = tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO archive ({COLUMNS})
                     SELECT {COLUMNS} FROM goals WHERE id = ?1"
                ),
                params![goal_id],
            )?;
            tx.execute("DELETE FROM goals WHERE id = ?1", params![goal_id])?;
            tx.commit()?;
            Ok(copied > 0)
        })?;
        if moved {
            info!("goal archived");
        }
        Ok(moved)
    }

    pub fn set_status(&self, goal_id: &str, status: GoalStatus) -> Result<()> {
        let changed = self.db.with_retry("set goal status", |conn| {
            conn.execute(
                "UPDATE goals SET status = ?2 WHERE id = ?1",
                params![goal_id, status.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(missing_row("goals", goal_id));
        }
        info!(goal_id, status = %status, "goal status set");
        Ok(())
    }

    pub fn set_tier(&self, goal_id: &str, tier: &str) -> Result<()> {
        let changed = self.db.with_retry("set goal tier", |conn| {
            conn.execute(
                "UPDATE goals SET preferred_tier = ?2 WHERE id = ?1",
                params![goal_id, tier],
            )
        })?;
        if changed == 0 {
            return Err(missing_row("goals", goal_id));
        }
        info!(goal_id, tier, "goal tier set");
        Ok(())
    }

    /// Read-only status lookup; `None` once the goal has left the active table.
    pub fn status(&self, goal_id: &str) -> Result<Option<GoalStatus>> {
        let status: Option<String> = self.db.with_retry("read goal status", |conn| {
            conn.query_row(
                "SELECT status FROM goals WHERE id = ?1",
                params![goal_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        status.map(|s| s.parse()).transpose()
    }

    pub fn get(&self, goal_id: &str) -> Result<Option<Goal>> {
        self.get_from("goals", goal_id)
    }

    pub fn get_archived(&self, goal_id: &str) -> Result<Option<Goal>> {
        self.get_from("archive", goal_id)
    }

    fn get_from(&self, table: &str, goal_id: &str) -> Result<Option<Goal>> {
        let row = self.db.with_retry("read goal", |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM {table} WHERE id = ?1"),
                params![goal_id],
                GoalRow::from_row,
            )
            .optional()
        })?;
        row.map(GoalRow::into_goal).transpose()
    }

    /// Every goal still in the active table (runnable or paused), newest first.
    pub fn list_active(&self) -> Result<Vec<Goal>> {
        let rows = self.db.with_retry("list active goals", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM goals ORDER BY created_at DESC, rowid DESC"
            ))?;
            stmt.query_map([], GoalRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().map(GoalRow::into_goal).collect()
    }

    /// Ids of active-table goals a producer has cancelled, oldest first.
    pub fn cancelled_ids(&self) -> Result<Vec<String>> {
        self.db.with_retry("list cancelled goals", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM goals WHERE status = 'cancelled'
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        })
    }

    /// One page (1-based) of the archive, newest first.
    pub fn list_archived(&self, page: u32, per_page: u32) -> Result<ArchivePage> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let offset = i64::from(page - 1) * i64::from(per_page);
        let rows = self.db.with_retry("list archived goals", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM archive
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
            ))?;
            stmt.query_map(params![per_page, offset], GoalRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;
        let goals = rows
            .into_iter()
            .map(GoalRow::into_goal)
            .collect::<Result<Vec<_>>>()?;
        Ok(ArchivePage {
            goals,
            page,
            per_page,
            total: self.archived_count()?,
        })
    }

    pub fn archived_count(&self) -> Result<u64> {
        let count: i64 = self.db.with_retry("count archived goals", |conn| {
            conn.query_row("SELECT COUNT(*) FROM archive", [], |row| row.get(0))
        })?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn profile_get(&self, key: &str) -> Result<Option<String>> {
        self.db.with_retry("read profile", |conn| {
            conn.query_row(
                "SELECT value FROM user_profile WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn profile_set(&self, key: &str, value: &str) -> Result<()> {
        self.db.with_retry("write profile", |conn| {
            conn.execute(
                "INSERT INTO user_profile (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
        })?;
        Ok(())
    }

    pub fn profile_list(&self) -> Result<Vec<(String, String)>> {
        self.db.with_retry("list profile", |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM user_profile ORDER BY key")?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
    }
}
