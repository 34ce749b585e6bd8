//! Timestamps and the natural-language time-range grammar
//!
//! Memories carry a paired timestamp: high-resolution epoch seconds (REAL in
//! the database, used for all comparisons) plus an ISO-8601 UTC string for
//! human legibility. Both are produced together and kept in sync.
//!
//! `recall_by_time` accepts a small natural-language grammar resolved against
//! the process's local timezone at call time. Ranges are inclusive of start
//! and exclusive of end.
//!
//! Grammar:
//! - absolute: `2025-01-01`, `2025-01-01T12:30:00`, `2025-01-01..2025-01-31`
//! - relative: `today`, `yesterday`, `this week`, `this month`, `last week`,
//!   `last month`, `last N days|weeks|months`, `N days|weeks|months ago`
//! - weekdays: `monday` (most recent), `last tuesday` (strictly before today)
//!
//! `last week` / `last N units` are trailing windows ending at the call
//! instant, so a memory stored earlier today falls inside `last week`.
//! `N units ago` and weekday names denote whole calendar days. A single
//! absolute datetime means "from that instant until now". Relative months
//! are 30-day windows.

use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
    Weekday,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// TIMESTAMP PAIR
// ============================================================================

/// Paired wall-clock timestamp: epoch seconds + ISO-8601 UTC string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    pub epoch: f64,
    pub iso: String,
}

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Build the pair from epoch seconds
    pub fn from_epoch(epoch: f64) -> Self {
        let secs = epoch.floor() as i64;
        let micros = ((epoch - secs as f64) * 1e6).round() as u32;
        let dt = DateTime::<Utc>::from_timestamp(secs, micros.saturating_mul(1000))
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default());
        Self {
            epoch,
            iso: dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    fn from_datetime(dt: DateTime<Utc>) -> Self {
        let epoch = dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6;
        Self {
            epoch,
            iso: dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

// ============================================================================
// TIME RANGE
// ============================================================================

/// Half-open time window `[start, end)` in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn contains(&self, epoch: f64) -> bool {
        epoch >= self.start && epoch < self.end
    }
}

/// Time expression parse failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimeParseError {
    #[error("unrecognized time expression: {0:?}")]
    Unrecognized(String),
    #[error("invalid date in time expression: {0:?}")]
    InvalidDate(String),
}

// ============================================================================
// PARSER
// ============================================================================

/// Parse a time expression against the local timezone at the call instant
pub fn parse_time_expression(expr: &str) -> Result<TimeRange, TimeParseError> {
    parse_time_expression_at(expr, Local::now())
}

/// Parse a time expression against an explicit "now" (used by tests and
/// by callers replaying historical requests)
pub fn parse_time_expression_at(
    expr: &str,
    now: DateTime<Local>,
) -> Result<TimeRange, TimeParseError> {
    let raw = expr.trim();
    if raw.is_empty() {
        return Err(TimeParseError::Unrecognized(expr.to_string()));
    }
    let lower = raw.to_lowercase();
    let today = now.date_naive();

    // Absolute range: `a..b`
    if let Some((left, right)) = raw.split_once("..") {
        let (start, _) = parse_absolute(left.trim(), &lower)?;
        let (end_start, end_day) = parse_absolute(right.trim(), &lower)?;
        let end = end_day.unwrap_or(end_start);
        if end <= start {
            return Err(TimeParseError::InvalidDate(raw.to_string()));
        }
        return Ok(TimeRange { start, end });
    }

    match lower.as_str() {
        "today" => return day_range(today),
        "yesterday" => return day_range(today - Duration::days(1)),
        "this week" => {
            let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
            let start = day_start_epoch(monday)?;
            let end = day_start_epoch(monday + Duration::days(7))?;
            return Ok(TimeRange { start, end });
        }
        "this month" => {
            let first = today
                .with_day(1)
                .ok_or_else(|| TimeParseError::InvalidDate(raw.to_string()))?;
            let next = next_month_start(first)?;
            return Ok(TimeRange {
                start: day_start_epoch(first)?,
                end: day_start_epoch(next)?,
            });
        }
        "last week" => return Ok(trailing(now, Duration::days(7))),
        "last month" => return Ok(trailing(now, Duration::days(30))),
        _ => {}
    }

    // `last <weekday>` / bare weekday
    if let Some(rest) = lower.strip_prefix("last ") {
        if let Some(weekday) = parse_weekday(rest.trim()) {
            return day_range(most_recent_weekday(today, weekday, true));
        }
    }
    if let Some(weekday) = parse_weekday(&lower) {
        return day_range(most_recent_weekday(today, weekday, false));
    }

    let words: Vec<&str> = lower.split_whitespace().collect();

    // `last N days|weeks|months`
    if words.len() == 3 && words[0] == "last" {
        if let (Ok(n), Some(unit)) = (words[1].parse::<i64>(), parse_unit(words[2])) {
            if n > 0 {
                return Ok(trailing(now, unit * n as i32));
            }
        }
    }

    // `N days|weeks|months ago` — the whole calendar day that far back
    if words.len() == 3 && words[2] == "ago" {
        if let (Ok(n), Some(unit)) = (words[0].parse::<i64>(), parse_unit(words[1])) {
            if n > 0 {
                let target = now - unit * n as i32;
                return day_range(target.date_naive());
            }
        }
    }

    // Absolute date or datetime
    let (start, day_end) = parse_absolute(raw, &lower)?;
    match day_end {
        Some(end) => Ok(TimeRange { start, end }),
        // A bare instant reads as "since then"
        None => Ok(TimeRange {
            start,
            end: epoch_of(now),
        }),
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn epoch_of<Tz: TimeZone>(dt: DateTime<Tz>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6
}

fn trailing(now: DateTime<Local>, span: Duration) -> TimeRange {
    TimeRange {
        start: epoch_of(now - span),
        end: epoch_of(now),
    }
}

fn day_start_epoch(date: NaiveDate) -> Result<f64, TimeParseError> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| TimeParseError::InvalidDate(date.to_string()))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| TimeParseError::InvalidDate(date.to_string()))?;
    Ok(epoch_of(local))
}

fn day_range(date: NaiveDate) -> Result<TimeRange, TimeParseError> {
    Ok(TimeRange {
        start: day_start_epoch(date)?,
        end: day_start_epoch(date + Duration::days(1))?,
    })
}

fn next_month_start(first_of_month: NaiveDate) -> Result<NaiveDate, TimeParseError> {
    let (year, month) = if first_of_month.month() == 12 {
        (first_of_month.year() + 1, 1)
    } else {
        (first_of_month.year(), first_of_month.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| TimeParseError::InvalidDate(first_of_month.to_string()))
}

fn parse_unit(word: &str) -> Option<Duration> {
    match word.trim_end_matches('s') {
        "day" => Some(Duration::days(1)),
        "week" => Some(Duration::days(7)),
        "month" => Some(Duration::days(30)),
        _ => None,
    }
}

fn parse_weekday(word: &str) -> Option<Weekday> {
    match word {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn most_recent_weekday(today: NaiveDate, target: Weekday, strictly_before: bool) -> NaiveDate {
    let mut offset = (today.weekday().num_days_from_monday() + 7
        - target.num_days_from_monday())
        % 7;
    if offset == 0 && strictly_before {
        offset = 7;
    }
    today - Duration::days(i64::from(offset))
}

/// Parse an absolute date or datetime. Returns the start instant plus, for
/// date-only input, the exclusive end of that day.
fn parse_absolute(raw: &str, lower: &str) -> Result<(f64, Option<f64>), TimeParseError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let start = day_start_epoch(date)?;
        let end = day_start_epoch(date + Duration::days(1))?;
        return Ok((start, Some(end)));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok((epoch_of(dt.with_timezone(&Utc)), None));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            let local = Local
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| TimeParseError::InvalidDate(raw.to_string()))?;
            return Ok((epoch_of(local), None));
        }
    }
    Err(TimeParseError::Unrecognized(lower.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
