//! Consolidation scheduler
//!
//! Deterministic cron-like dispatch: each cadence (daily decay, weekly
//! association, monthly clustering/compression/forgetting) has a most
//! recent anchor instant; a phase is due when its persisted last-run
//! timestamp predates that anchor. Lapsed cadences are coalesced so a
//! process that was down for a month still runs each phase exactly once,
//! in pipeline order.
//!
//! A run lock in `store_meta` provides mutual exclusion across cooperative
//! tasks and across processes; the database's row atomicity makes the
//! insert race-free. A crashed holder's lock is taken over after a
//! staleness bound.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Weekday};

use crate::config::ScheduleConfig;
use crate::consolidation::phases::{ConsolidationError, Consolidator, Phase, RunReport};
use crate::memory::Timestamp;
use crate::service::OpBudget;
use crate::storage::MemoryStore;

const LOCK_KEY: &str = "consolidation.run_lock";
const LAST_ERROR_KEY: &str = "consolidation.last_error";

fn last_run_key(phase: Phase) -> String {
    format!("consolidation.last_run.{phase}")
}

/// Cadence dispatcher and run-lock owner
pub struct Scheduler {
    store: Arc<MemoryStore>,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(store: Arc<MemoryStore>, config: ScheduleConfig) -> Self {
        Self { store, config }
    }

    /// Phases whose cadence has lapsed as of `now`, in pipeline order
    pub fn due_phases(&self, now: DateTime<Local>) -> Result<Vec<Phase>, ConsolidationError> {
        let mut due = Vec::new();
        for phase in Phase::pipeline() {
            let Some(anchor) = self.anchor_for(phase, now) else {
                continue;
            };
            let last_run: Option<f64> = self
                .store
                .get_meta(&last_run_key(phase))?
                .and_then(|v| v.parse().ok());
            let anchor_epoch =
                anchor.timestamp() as f64 + f64::from(anchor.timestamp_subsec_micros()) / 1e6;
            if last_run.is_none_or(|t| t < anchor_epoch) {
                due.push(phase);
            }
        }
        Ok(due)
    }

    /// Most recent scheduled instant at or before `now` for a phase
    fn anchor_for(&self, phase: Phase, now: DateTime<Local>) -> Option<DateTime<Local>> {
        match phase {
            Phase::Decay => daily_anchor(now, self.config.decay_hour),
            Phase::Association => weekly_anchor(
                now,
                self.config.association_weekday,
                self.config.association_hour,
            ),
            Phase::Clustering | Phase::Compression | Phase::Forgetting => {
                monthly_anchor(now, self.config.monthly_day, self.config.monthly_hour)
            }
        }
    }

    /// Scheduler tick: run lapsed phases, if any. Returns `None` when
    /// nothing is due or another run already holds the lock.
    pub fn tick(
        &self,
        consolidator: &Consolidator,
        budget: &OpBudget,
    ) -> Result<Option<RunReport>, ConsolidationError> {
        self.tick_at(consolidator, Local::now(), budget)
    }

    /// `tick` against an explicit local time (tests, catch-up replay)
    pub fn tick_at(
        &self,
        consolidator: &Consolidator,
        now: DateTime<Local>,
        budget: &OpBudget,
    ) -> Result<Option<RunReport>, ConsolidationError> {
        let due = self.due_phases(now)?;
        if due.is_empty() {
            return Ok(None);
        }
        tracing::info!(?due, "consolidation cadences lapsed, running");
        let now_epoch = Timestamp::now().epoch;
        match self.run_locked(consolidator, &due, now_epoch, budget) {
            Ok(report) => Ok(Some(report)),
            // Another task or process is already on it
            Err(ConsolidationError::AlreadyRunning) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run phases under the store-level run lock
    pub fn run_locked(
        &self,
        consolidator: &Consolidator,
        phases: &[Phase],
        now_epoch: f64,
        budget: &OpBudget,
    ) -> Result<RunReport, ConsolidationError> {
        let token = self.acquire_lock(now_epoch)?;
        let run_id = match self.store.begin_run_record(now_epoch) {
            Ok(id) => id,
            Err(e) => {
                self.release_lock(&token);
                return Err(e.into());
            }
        };

        match consolidator.run(phases, now_epoch, budget) {
            Ok(report) => {
                for phase in phases {
                    self.store
                        .set_meta(&last_run_key(*phase), &now_epoch.to_string())?;
                }
                let phases_json =
                    serde_json::to_string(&report.phases).unwrap_or_else(|_| "[]".to_string());
                self.store.finish_run_record(
                    run_id,
                    report.finished_at,
                    "completed",
                    &phases_json,
                )?;
                self.release_lock(&token);
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("consolidation run failed: {e}");
                let _ = self
                    .store
                    .set_meta(LAST_ERROR_KEY, &format!("{now_epoch}: {e}"));
                let _ = self
                    .store
                    .finish_run_record(run_id, Timestamp::now().epoch, "failed", "[]");
                self.release_lock(&token);
                Err(e)
            }
        }
    }

    /// Acquire the run lock, taking over a stale one
    fn acquire_lock(&self, now_epoch: f64) -> Result<String, ConsolidationError> {
        let token = format!("{now_epoch}:{}", uuid::Uuid::new_v4());
        if self.store.try_insert_meta(LOCK_KEY, &token)? {
            return Ok(token);
        }

        let Some(existing) = self.store.get_meta(LOCK_KEY)? else {
            // Holder released between our insert attempt and the read
            if self.store.try_insert_meta(LOCK_KEY, &token)? {
                return Ok(token);
            }
            return Err(ConsolidationError::AlreadyRunning);
        };

        let held_since: f64 = existing
            .split(':')
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        if now_epoch - held_since > self.config.stale_lock_secs as f64 {
            tracing::warn!("taking over stale consolidation lock held since {held_since}");
            if self.store.compare_and_swap_meta(LOCK_KEY, &existing, &token)? {
                return Ok(token);
            }
        }
        Err(ConsolidationError::AlreadyRunning)
    }

    /// Release the lock if we still hold it
    fn release_lock(&self, token: &str) {
        match self.store.get_meta(LOCK_KEY) {
            Ok(Some(current)) if current == token => {
                let _ = self.store.delete_meta(LOCK_KEY);
            }
            _ => {}
        }
    }
}

// ============================================================================
// ANCHORS
// ============================================================================

fn at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Local>> {
    Local
        .from_local_datetime(&date.and_hms_opt(hour.min(23), 0, 0)?)
        .earliest()
}

/// Today at `hour`, or yesterday's when that is still in the future
fn daily_anchor(now: DateTime<Local>, hour: u32) -> Option<DateTime<Local>> {
    let today = at_hour(now.date_naive(), hour)?;
    if today <= now {
        Some(today)
    } else {
        at_hour(now.date_naive() - Duration::days(1), hour)
    }
}

/// Most recent `weekday` (0 = Sunday) at `hour`
fn weekly_anchor(now: DateTime<Local>, weekday: u32, hour: u32) -> Option<DateTime<Local>> {
    let target = match weekday % 7 {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    };
    let offset = (now.date_naive().weekday().num_days_from_sunday() + 7
        - target.num_days_from_sunday())
        % 7;
    let candidate_date = now.date_naive() - Duration::days(i64::from(offset));
    let candidate = at_hour(candidate_date, hour)?;
    if candidate <= now {
        Some(candidate)
    } else {
        at_hour(candidate_date - Duration::days(7), hour)
    }
}

/// Most recent month-day (clamped to month length) at `hour`
fn monthly_anchor(now: DateTime<Local>, day: u32, hour: u32) -> Option<DateTime<Local>> {
    let mut year = now.year();
    let mut month = now.month();
    for _ in 0..3 {
        let clamped = day.clamp(1, days_in_month(year, month));
        let date = NaiveDate::from_ymd_opt(year, month, clamped)?;
        if let Some(candidate) = at_hour(date, hour) {
            if candidate <= now {
                return Some(candidate);
            }
        }
        if month == 1 {
            month = 12;
            year -= 1;
        } else {
            month -= 1;
        }
    }
    None
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn local(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn test_daily_anchor() {
        // After 02:00, the anchor is today 02:00
        let now = local(2025, 6, 18, 12);
        assert_eq!(daily_anchor(now, 2).unwrap(), local(2025, 6, 18, 2));

        // Before 02:00, the anchor is yesterday 02:00
        let early = local(2025, 6, 18, 1);
        assert_eq!(daily_anchor(early, 2).unwrap(), local(2025, 6, 17, 2));
    }

    #[test]
    fn test_weekly_anchor_sunday() {
        // 2025-06-18 is a Wednesday; most recent Sunday 03:00 is 06-15
        let now = local(2025, 6, 18, 12);
        assert_eq!(weekly_anchor(now, 0, 3).unwrap(), local(2025, 6, 15, 3));

        // On Sunday before 03:00, the anchor is the prior Sunday
        let sunday_early = local(2025, 6, 15, 1);
        assert_eq!(
            weekly_anchor(sunday_early, 0, 3).unwrap(),
            local(2025, 6, 8, 3)
        );
    }

    #[test]
    fn test_monthly_anchor() {
        let now = local(2025, 6, 18, 12);
        assert_eq!(monthly_anchor(now, 1, 4).unwrap(), local(2025, 6, 1, 4));

        // Before the monthly instant, fall back to the previous month
        let early = local(2025, 6, 1, 3);
        assert_eq!(monthly_anchor(early, 1, 4).unwrap(), local(2025, 5, 1, 4));

        // Day 31 clamps in shorter months
        let feb = local(2025, 3, 1, 0);
        assert_eq!(monthly_anchor(feb, 31, 4).unwrap(), local(2025, 2, 28, 4));
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2025, 2), 28);
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2025, 12), 31);
    }
}
