//! Busy/locked retry with bounded exponential backoff
//!
//! The database's own lock is the source of truth across processes. Short
//! waits are absorbed in-engine by the `busy_timeout` pragma; this layer
//! handles longer contention by retrying the whole statement with
//! exponential backoff until a total budget is exhausted.

use std::time::{Duration, Instant};

use rusqlite::ErrorCode;

/// Backoff policy for SQLITE_BUSY / SQLITE_LOCKED retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First retry delay
    pub base_delay: Duration,
    /// Per-retry delay cap
    pub max_delay: Duration,
    /// Total time budget across all retries
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            total_budget: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), with deterministic
    /// jitter derived from the attempt counter so concurrent writers
    /// desynchronize without an RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
            .min(self.max_delay);
        let jitter_ms = u64::from(attempt).wrapping_mul(7919) % 17;
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Outcome of a retried operation that never succeeded
#[derive(Debug)]
pub enum RetryError {
    /// Still contended after the whole budget
    Exhausted {
        attempts: u32,
        last: rusqlite::Error,
    },
    /// A non-transient database error; retrying would not help
    Fatal(rusqlite::Error),
}

/// Whether an error is transient lock contention
pub fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

/// Run a database operation, retrying on busy/locked with backoff
pub fn run_with_retry<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                let delay = policy.delay_for(attempt);
                if started.elapsed() + delay > policy.total_budget {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "database busy, backing off");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(RetryError::Fatal(err)),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
