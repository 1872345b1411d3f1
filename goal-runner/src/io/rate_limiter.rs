//! Per-tier sliding-window request budgets backed by the shared database.
//!
//! `allow` is the only check-then-insert in the system. It runs inside a
//! `BEGIN IMMEDIATE` transaction so two callers (threads or processes) can
//! never both take the last slot of a window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use rusqlite::{TransactionBehavior, params};
use tracing::{debug, instrument};

use crate::core::idle::{elapsed_day_pct, surplus};
use crate::io::config::{RunnerConfig, TierConfig};
use crate::io::db::{Database, now_ms};

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 86_400_000;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_ms()
    }
}

/// Hand-advanced clock for window tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn at(ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(ms)),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Usage snapshot for one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierUsage {
    pub tier: String,
    pub last_minute: u32,
    pub last_day: u32,
    pub rpm: u32,
    pub rpd: u32,
    pub usage_pct: f64,
    pub surplus: f64,
}

/// Tiered limiter. Cheap to clone; each call opens its own connection.
#[derive(Clone)]
pub struct RateLimiter {
    db: Database,
    tiers: BTreeMap<String, TierConfig>,
    utc_offset_hours: i32,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(db: Database, config: &RunnerConfig) -> Self {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, config: &RunnerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            tiers: config.tiers.clone(),
            utc_offset_hours: config.idle.utc_offset_hours,
            clock,
        }
    }

    fn budget(&self, tier: &str) -> Result<&TierConfig> {
        self.tiers
            .get(tier)
            .ok_or_else(|| anyhow!("unknown tier '{tier}'"))
    }

    /// Consume one request unit for `tier` if both windows have room.
    #[instrument(skip(self))]
    pub fn allow(&self, tier: &str) -> Result<bool> {
        let budget = self.budget(tier)?;
        let (rpm, rpd) = (i64::from(budget.rpm), i64::from(budget.rpd));
        let now = self.clock.now_ms();
        let allowed = self.db.with_retry("rate limit allow", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM rate_limits WHERE ts <= ?1", params![now - DAY_MS])?;
            let minute: i64 = tx.query_row(
                "SELECT COUNT(*) FROM rate_limits WHERE tier = ?1 AND ts > ?2",
                params![tier, now - MINUTE_MS],
                |row| row.get(0),
            )?;
            let day: i64 = tx.query_row(
                "SELECT COUNT(*) FROM rate_limits WHERE tier = ?1 AND ts > ?2",
                params![tier, now - DAY_MS],
                |row| row.get(0),
            )?;
            let allowed = minute < rpm && day < rpd;
            if allowed {
                tx.execute(
                    "INSERT INTO rate_limits (tier, ts) VALUES (?1, ?2)",
                    params![tier, now],
                )?;
            }
            tx.commit()?;
            debug!(minute, day, allowed, "rate limit checked");
            Ok(allowed)
        })?;
        Ok(allowed)
    }

    /// `(records in the trailing 24h / rpd) * 100`.
    pub fn usage_percentage(&self, tier: &str) -> Result<f64> {
        let budget = self.budget(tier)?;
        let day = self.count_since(tier, self.clock.now_ms() - DAY_MS)?;
        Ok(f64::from(day) / f64::from(budget.rpd) * 100.0)
    }

    fn count_since(&self, tier: &str, since: i64) -> Result<u32> {
        let count: i64 = self.db.with_retry("rate limit count", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM rate_limits WHERE tier = ?1 AND ts > ?2",
                params![tier, since],
                |row| row.get(0),
            )
        })?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Percentage of the quota day elapsed, in the configured UTC offset.
    pub fn elapsed_day_pct(&self) -> f64 {
        elapsed_day_pct(self.local_now())
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        let utc = DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms()).unwrap_or_default();
        let offset =
            FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        utc.with_timezone(&offset)
    }

    /// Usage and surplus for every configured tier.
    pub fn report(&self) -> Result<Vec<TierUsage>> {
        let now = self.clock.now_ms();
        let elapsed = self.elapsed_day_pct();
        let mut report = Vec::with_capacity(self.tiers.len());
        for (name, budget) in &self.tiers {
            let last_day = self.count_since(name, now - DAY_MS)?;
            let usage_pct = f64::from(last_day) / f64::from(budget.rpd) * 100.0;
            report.push(TierUsage {
                tier: name.clone(),
                last_minute: self.count_since(name, now - MINUTE_MS)?,
                last_day,
                rpm: budget.rpm,
                rpd: budget.rpd,
                usage_pct,
                surplus: surplus(elapsed, usage_pct),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::StoreConfig;

    fn limiter(dir: &tempfile::TempDir, clock: ManualClock) -> RateLimiter {
        let db = Database::open(&dir.path().join("goals.sqlite"), &StoreConfig::default())
            .expect("open db");
        RateLimiter::with_clock(db, &RunnerConfig::default(), Arc::new(clock))
    }

    /// tier1 allows 2 per minute; the third call inside the window is refused
    /// and the window reopens once the first records age out.
    #[test]
    fn minute_window_slides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::at(10 * DAY_MS);
        let limiter = limiter(&temp, clock.clone());

        assert!(limiter.allow("tier1").expect("allow"));
        assert!(limiter.allow("tier1").expect("allow"));
        assert!(!limiter.allow("tier1").expect("allow"));

        clock.advance_ms(MINUTE_MS);
        assert!(limiter.allow("tier1").expect("allow"));
    }

    #[test]
    fn day_budget_caps_across_minutes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::at(10 * DAY_MS);
        let limiter = limiter(&temp, clock.clone());

        let mut allowed = 0;
        for _ in 0..40 {
            for _ in 0..3 {
                if limiter.allow("tier1").expect("allow") {
                    allowed += 1;
                }
            }
            clock.advance_ms(MINUTE_MS);
        }
        assert_eq!(allowed, 50);
        assert!((limiter.usage_percentage("tier1").expect("usage") - 100.0).abs() < 1e-9);

        clock.advance_ms(DAY_MS);
        assert!(limiter.allow("tier1").expect("allow after a day"));
    }

    #[test]
    fn tiers_have_independent_budgets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(&temp, ManualClock::at(10 * DAY_MS));
        assert!(limiter.allow("tier1").expect("allow"));
        assert!(limiter.allow("tier1").expect("allow"));
        assert!(!limiter.allow("tier1").expect("allow"));
        assert!(limiter.allow("tier2").expect("allow"));
        assert!(limiter.allow("nope").is_err());
    }

    #[test]
    fn report_lists_every_tier() {
        let temp = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(&temp, ManualClock::at(10 * DAY_MS));
        limiter.allow("tier2").expect("allow");
        let report = limiter.report().expect("report");
        assert_eq!(report.len(), 3);
        let tier2 = report.iter().find(|u| u.tier == "tier2").expect("tier2");
        assert_eq!(tier2.last_minute, 1);
        assert!((tier2.usage_pct - 0.4).abs() < 1e-9);
    }
}
