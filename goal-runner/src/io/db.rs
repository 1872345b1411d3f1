//! SQLite connection setup, schema, and the contention-retry wrapper shared by
//! the goal store and the rate limiter.
//!
//! Every operation opens its own short-lived connection so that separate
//! processes (the orchestrator and any number of producers) only ever hold
//! row-level or single-statement locks.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, warn};

use crate::io::config::StoreConfig;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS goals (
    id TEXT PRIMARY KEY,
    goal TEXT NOT NULL,
    plan TEXT NOT NULL,
    status TEXT NOT NULL,
    strategy TEXT NOT NULL,
    execution_log TEXT NOT NULL DEFAULT '',
    preferred_tier TEXT NOT NULL,
    replan_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_goals_status_created ON goals(status, created_at);

CREATE TABLE IF NOT EXISTS archive (
    id TEXT PRIMARY KEY,
    goal TEXT NOT NULL,
    plan TEXT NOT NULL,
    status TEXT NOT NULL,
    strategy TEXT NOT NULL,
    execution_log TEXT NOT NULL DEFAULT '',
    preferred_tier TEXT NOT NULL,
    replan_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_profile (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rate_limits (
    tier TEXT NOT NULL,
    ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rate_limits_tier_ts ON rate_limits(tier, ts);
";

/// Location and contention policy of the shared database.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    store: StoreConfig,
}

impl Database {
    /// Create the database file (and parent directory) and apply the schema.
    pub fn open(path: &Path, store: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let db = Self {
            path: path.to_path_buf(),
            store: store.clone(),
        };
        db.with_retry("apply schema", |conn| conn.execute_batch(SCHEMA_SQL))?;
        Ok(db)
    }

    /// Open a fresh connection with WAL and `busy_timeout` applied.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open database {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_millis(self.store.busy_timeout_ms))
            .context("set busy_timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .context("apply pragmas")?;
        Ok(conn)
    }

    /// Run `op` on a fresh connection, retrying lock contention with backoff.
    ///
    /// Errors other than `SQLITE_BUSY`/`SQLITE_LOCKED` are returned at once.
    pub fn with_retry<T>(
        &self,
        label: &str,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        with_busy_retry(&self.store, label, || {
            let mut conn = self.connect()?;
            Ok(op(&mut conn)?)
        })
    }
}

/// Retry `op` while it fails with lock contention, sleeping with exponential
/// backoff plus jitter between attempts.
pub fn with_busy_retry<T>(
    store: &StoreConfig,
    label: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_contention(&err) && attempt + 1 < store.busy_retries => {
                let delay = backoff_delay(store.busy_backoff_ms, attempt);
                debug!(label, attempt, delay_ms = duration_ms(delay), "store busy, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                if is_contention(&err) {
                    warn!(label, attempts = attempt + 1, "store still busy, giving up");
                }
                return Err(err.context(format!("store {label}")));
            }
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..=base_ms)
    } else {
        0
    };
    Duration::from_millis(exp.min(5_000) + jitter)
}

/// True when the error chain carries `SQLITE_BUSY` or `SQLITE_LOCKED`.
pub fn is_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn missing_row(table: &str, id: &str) -> anyhow::Error {
    anyhow!("no row '{id}' in {table}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn busy_error() -> anyhow::Error {
        anyhow::Error::new(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    fn fast_store() -> StoreConfig {
        StoreConfig {
            busy_timeout_ms: 10,
            busy_retries: 4,
            busy_backoff_ms: 0,
        }
    }

    #[test]
    fn open_creates_all_tables() {
        let temp = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&temp.path().join("nested/goals.sqlite"), &fast_store())
            .expect("open");
        let conn = db.connect().expect("connect");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(names, vec!["archive", "goals", "rate_limits", "user_profile"]);
    }

    #[test]
    fn busy_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let value = with_busy_retry(&fast_store(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(busy_error())
            } else {
                Ok(7)
            }
        })
        .expect("eventually succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = with_busy_retry(&fast_store(), "test", || {
            calls.set(calls.get() + 1);
            Err(anyhow!("syntax"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn contention_gives_up_after_configured_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = with_busy_retry(&fast_store(), "test", || {
            calls.set(calls.get() + 1);
            Err(busy_error())
        });
        let err = result.expect_err("gives up");
        assert!(is_contention(&err));
        assert_eq!(calls.get(), 4);
    }
}
