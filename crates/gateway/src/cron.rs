//! Timezone-aware cron evaluator (5-field: min hour dom month dow).
//!
//! Expressions are evaluated in the schedule's IANA timezone and fire
//! instants are returned in UTC. DST transitions are honored: a fire falling
//! into a spring-forward gap occurs at the instant local time resumes (the
//! end of the skipped hour); a fire in a fall-back repeated hour occurs once,
//! at the first occurrence.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Preview length cap for `next_fires`.
pub const MAX_PREVIEW_FIRES: usize = 20;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid timezone: '{0}' — use IANA names like 'America/New_York' or 'UTC'")]
    InvalidTimezone(String),
}

/// Parse an IANA timezone name.
pub fn parse_tz(tz: &str) -> Result<Tz, CronError> {
    tz.parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(tz.to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

/// Validate a 5-field cron expression.
pub fn validate_cron(cron: &str) -> Result<(), CronError> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::InvalidCron(format!(
            "expected 5 fields (minute hour dom month dow), got {}",
            fields.len()
        )));
    }
    for (i, field) in fields.iter().enumerate() {
        validate_field(field, FIELD_NAMES[i], FIELD_RANGES[i].0, FIELD_RANGES[i].1)
            .map_err(CronError::InvalidCron)?;
    }
    Ok(())
}

fn validate_field(field: &str, name: &str, min: u32, max: u32) -> Result<(), String> {
    if field == "*" {
        return Ok(());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| format!("{name}: invalid step '*/{step}' — expected a number"))?;
        if n == 0 || n > max {
            return Err(format!("{name}: step {n} out of range 1..={max}"));
        }
        return Ok(());
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| format!("{name}: invalid range start '{start_s}'"))?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| format!("{name}: invalid range end '{end_s}'"))?;
            if start < min || start > max || end < min || end > max {
                return Err(format!(
                    "{name}: range {start}-{end} out of bounds {min}..={max}"
                ));
            }
            if start > end {
                return Err(format!("{name}: range start {start} > end {end}"));
            }
        } else {
            let n: u32 = part
                .parse()
                .map_err(|_| format!("{name}: invalid value '{part}'"))?;
            if n < min || n > max {
                return Err(format!("{name}: value {n} out of range {min}..={max}"));
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Matching & evaluation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check whether a local wall-clock minute matches the expression.
fn matches_naive(cron: &str, dt: &NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[2], dt.day())
        && field_matches(fields[3], dt.month())
        && field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Compute the next fire strictly after `after` for a cron expression
/// evaluated in `timezone`, returned as a UTC instant.
pub fn next_fire(
    cron: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    validate_cron(cron)?;
    let tz = parse_tz(timezone)?;

    // Advance to the next whole local minute strictly after `after`.
    let local_after = after.with_timezone(&tz).naive_local();
    let next_min_secs = 60 - i64::from(local_after.second());
    let mut candidate = local_after + chrono::Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    // Fall-back repeated hour: fire once, at the first mapping.
                    return Ok(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // Spring-forward gap: the local minute does not exist.
                    // The fire occurs when local time resumes, at the end of
                    // the skipped interval.
                    return resume_after_gap(tz, candidate);
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    Err(CronError::InvalidCron(format!(
        "no fire within a year of {after}"
    )))
}

/// Walk forward from a nonexistent local minute to the first minute that
/// maps back onto the timeline.
fn resume_after_gap(tz: Tz, mut candidate: NaiveDateTime) -> Result<DateTime<Utc>, CronError> {
    // DST gaps are at most a few hours; 26h bounds exotic offset changes.
    for _ in 0..(26 * 60) {
        candidate += chrono::Duration::minutes(1);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(earliest, _) => {
                return Ok(earliest.with_timezone(&Utc))
            }
            chrono::LocalResult::None => continue,
        }
    }
    Err(CronError::InvalidTimezone(format!(
        "no valid local time after gap at {candidate}"
    )))
}

/// Compute up to `n` future fires (capped at [`MAX_PREVIEW_FIRES`]).
pub fn next_fires(
    cron: &str,
    timezone: &str,
    after: DateTime<Utc>,
    n: usize,
) -> Result<Vec<DateTime<Utc>>, CronError> {
    let n = n.min(MAX_PREVIEW_FIRES);
    let mut results = Vec::with_capacity(n);
    let mut cursor = after;
    for _ in 0..n {
        let next = next_fire(cron, timezone, cursor)?;
        results.push(next);
        cursor = next;
    }
    Ok(results)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Human-readable description
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const WEEKDAYS: [&str; 7] = [
    "Sunday", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday",
];

/// Plain-English description of the expression, covering the common shapes
/// and falling back to a field-by-field rendering.
pub fn describe(cron: &str) -> Result<String, CronError> {
    validate_cron(cron)?;
    let fields: Vec<&str> = cron.split_whitespace().collect();
    let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

    if let Some(step) = minute.strip_prefix("*/") {
        if hour == "*" && dom == "*" && month == "*" && dow == "*" {
            return Ok(format!("Every {step} minutes"));
        }
    }
    if minute == "*" && hour == "*" && dom == "*" && month == "*" && dow == "*" {
        return Ok("Every minute".to_string());
    }
    if let (Ok(m), Ok(h)) = (minute.parse::<u32>(), hour.parse::<u32>()) {
        let at = format!("At {h:02}:{m:02}");
        if dom == "*" && month == "*" && dow == "*" {
            return Ok(format!("{at}, every day"));
        }
        if dom == "*" && month == "*" {
            if let Some(days) = describe_weekdays(dow) {
                return Ok(format!("{at} on {days}"));
            }
        }
        if month == "*" && dow == "*" {
            if let Ok(day) = dom.parse::<u32>() {
                return Ok(format!("{at} on day {day} of the month"));
            }
        }
    }
    Ok(format!(
        "At minute {minute}, hour {hour}, day-of-month {dom}, month {month}, day-of-week {dow}"
    ))
}

fn describe_weekdays(dow: &str) -> Option<String> {
    if dow == "1-5" {
        return Some("weekdays".to_string());
    }
    let mut names = Vec::new();
    for part in dow.split(',') {
        let n: u32 = part.parse().ok()?;
        names.push(*WEEKDAYS.get(n as usize)?);
    }
    Some(names.join(", "))
}
