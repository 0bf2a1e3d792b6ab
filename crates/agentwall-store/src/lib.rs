//! Run-state store (component C4).
//!
//! Backs [`Run`] records behind a key space of `agentwall:run:<run-id>`
//! with a 24 h TTL reset on every write — the same shape a Redis-backed
//! deployment would use, realized here as an in-process `DashMap` since
//! AgentWall runs as a single gateway process. If the backing is marked
//! degraded (construction failure, lost connectivity in a future
//! networked backend), every load returns a fresh zero-state [`Run`] that
//! is never persisted — governance degrades to per-request limits only.
//!
//! Also home to [`TeamSpend`], the per-team daily/monthly running totals
//! the budget gate (C5) compares each step's incremental cost against.

use agentwall_core::{Money, Run, RunId, RunLimits};
use chrono::{Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// TTL applied to every run record on write.
pub const RUN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    run: Run,
    expires_at: Instant,
}

/// Shared, cloneable handle to the run-state store.
#[derive(Clone)]
pub struct RunStore {
    runs: Arc<DashMap<RunId, Entry>>,
    healthy: Arc<AtomicBool>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the store is currently serving in degraded (memoryless) mode.
    pub fn is_degraded(&self) -> bool {
        !self.healthy.load(Ordering::Relaxed)
    }

    /// Flip degraded mode. A future networked backend would call this on
    /// connect/disconnect; exposed here so callers and tests can exercise
    /// the degraded-mode fallback path.
    pub fn set_degraded(&self, degraded: bool) {
        let was_degraded = !self.healthy.swap(!degraded, Ordering::Relaxed);
        if degraded && !was_degraded {
            warn!("run store entering degraded memoryless mode");
        } else if !degraded && was_degraded {
            info!("run store recovered from degraded mode");
        }
    }

    /// Load the run with `run_id`, creating a fresh zero-state record if
    /// none exists or the existing one has expired. In degraded mode the
    /// returned run is always fresh and is not written back.
    pub fn load_or_create(
        &self,
        run_id: &str,
        team_id: &str,
        user_id: &str,
        limits: RunLimits,
    ) -> Run {
        if self.is_degraded() {
            return Run::new(run_id.to_string(), team_id.to_string(), user_id.to_string(), limits);
        }

        let now = Instant::now();
        if let Some(entry) = self.runs.get(run_id) {
            if entry.expires_at > now {
                return entry.run.clone();
            }
        }

        let fresh = Run::new(run_id.to_string(), team_id.to_string(), user_id.to_string(), limits);
        self.save(&fresh);
        fresh
    }

    /// Persist `run`, resetting its TTL to [`RUN_TTL`] from now. No-op in
    /// degraded mode — nothing this process writes would survive anyway.
    pub fn save(&self, run: &Run) {
        if self.is_degraded() {
            return;
        }
        self.runs.insert(
            run.run_id.clone(),
            Entry {
                run: run.clone(),
                expires_at: Instant::now() + RUN_TTL,
            },
        );
    }

    /// Whether a (non-expired) record exists for `run_id`.
    pub fn contains(&self, run_id: &str) -> bool {
        self.runs
            .get(run_id)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    /// Number of live (non-expired) entries. Expired entries are not
    /// eagerly evicted on read, so this may over-count until the next
    /// [`RunStore::sweep_expired`].
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Evict expired entries. Intended to be called periodically from a
    /// background task, mirroring the rate limiter's bucket cleanup.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.runs.retain(|_, entry| entry.expires_at > now);
    }
}

/// Per-team running totals the budget gate (C5) compares incremental cost
/// against (the `daily-spent`/`monthly-spent` inputs). Rolls over on the
/// wall-clock day/month boundary rather than on a fixed TTL, since a
/// team's spend resets at midnight regardless of when it was last active.
#[derive(Clone, Copy)]
struct SpendEntry {
    day: NaiveDate,
    month: (i32, u32),
    daily_total: Money,
    monthly_total: Money,
}

/// Shared, cloneable handle to per-team daily/monthly spend accumulators.
#[derive(Clone)]
pub struct TeamSpend {
    teams: Arc<DashMap<String, SpendEntry>>,
}

impl Default for TeamSpend {
    fn default() -> Self {
        Self::new()
    }
}

impl TeamSpend {
    pub fn new() -> Self {
        Self { teams: Arc::new(DashMap::new()) }
    }

    fn fresh(now: NaiveDate) -> SpendEntry {
        SpendEntry {
            day: now,
            month: (now.year(), now.month()),
            daily_total: Money::ZERO,
            monthly_total: Money::ZERO,
        }
    }

    /// Running totals *before* adding the incremental cost of the step the
    /// budget gate is about to evaluate — the gate itself adds the
    /// increment when projecting the new total.
    pub fn running_totals(&self, team_id: &str) -> (Money, Money) {
        let now = Utc::now().date_naive();
        let mut entry = self.teams.entry(team_id.to_string()).or_insert_with(|| Self::fresh(now));
        roll_over(&mut entry, now);
        (entry.daily_total, entry.monthly_total)
    }

    /// Record a step's actually-incurred cost against the team's running
    /// totals. Called once the upstream call has returned and cost (C1) has
    /// been computed — never speculatively.
    pub fn record(&self, team_id: &str, cost: Money) {
        let now = Utc::now().date_naive();
        let mut entry = self.teams.entry(team_id.to_string()).or_insert_with(|| Self::fresh(now));
        roll_over(&mut entry, now);
        entry.daily_total += cost;
        entry.monthly_total += cost;
    }
}

fn roll_over(entry: &mut SpendEntry, now: NaiveDate) {
    if entry.day != now {
        entry.day = now;
        entry.daily_total = Money::ZERO;
    }
    let month = (now.year(), now.month());
    if entry.month != month {
        entry.month = month;
        entry.monthly_total = Money::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_creates_fresh_run_on_first_access() {
        let store = RunStore::new();
        let run = store.load_or_create("run-1", "team-a", "user-a", RunLimits::default());
        assert_eq!(run.run_id, "run-1");
        assert_eq!(run.step_count, 0);
        assert!(store.contains("run-1"));
    }

    #[test]
    fn save_then_load_returns_persisted_state() {
        let store = RunStore::new();
        let mut run = store.load_or_create("run-2", "team-a", "user-a", RunLimits::default());
        run.step_count = 5;
        store.save(&run);

        let reloaded = store.load_or_create("run-2", "team-a", "user-a", RunLimits::default());
        assert_eq!(reloaded.step_count, 5);
    }

    #[test]
    fn degraded_mode_never_persists() {
        let store = RunStore::new();
        store.set_degraded(true);

        let mut run = store.load_or_create("run-3", "team-a", "user-a", RunLimits::default());
        run.step_count = 9;
        store.save(&run);

        assert!(!store.contains("run-3"));
        let reloaded = store.load_or_create("run-3", "team-a", "user-a", RunLimits::default());
        assert_eq!(reloaded.step_count, 0);
    }

    #[test]
    fn recovering_from_degraded_mode_resumes_persistence() {
        let store = RunStore::new();
        store.set_degraded(true);
        store.set_degraded(false);

        let run = store.load_or_create("run-4", "team-a", "user-a", RunLimits::default());
        store.save(&run);
        assert!(store.contains("run-4"));
    }

    #[test]
    fn sweep_expired_is_a_no_op_on_fresh_entries() {
        let store = RunStore::new();
        let run = store.load_or_create("run-5", "team-a", "user-a", RunLimits::default());
        store.save(&run);
        store.sweep_expired();
        assert!(store.contains("run-5"));
    }

    #[test]
    fn team_spend_starts_at_zero() {
        let spend = TeamSpend::new();
        assert_eq!(spend.running_totals("team-a"), (Money::ZERO, Money::ZERO));
    }

    #[test]
    fn team_spend_accumulates_daily_and_monthly() {
        let spend = TeamSpend::new();
        spend.record("team-a", Money::from_dollars_f64(1.0));
        spend.record("team-a", Money::from_dollars_f64(2.0));
        let (daily, monthly) = spend.running_totals("team-a");
        assert_eq!(daily, Money::from_dollars_f64(3.0));
        assert_eq!(monthly, Money::from_dollars_f64(3.0));
    }

    #[test]
    fn team_spend_is_isolated_per_team() {
        let spend = TeamSpend::new();
        spend.record("team-a", Money::from_dollars_f64(5.0));
        spend.record("team-b", Money::from_dollars_f64(1.0));
        assert_eq!(spend.running_totals("team-a").0, Money::from_dollars_f64(5.0));
        assert_eq!(spend.running_totals("team-b").0, Money::from_dollars_f64(1.0));
    }
}
