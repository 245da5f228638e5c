//! Date-range derivation for scheduled reports.
//!
//! Named ranges are computed from a reference instant in UTC. All boundaries
//! except the rolling-window types (`last_N_days`, `last_N_hours`) snap to
//! calendar boundaries (midnight / first-of-month / first-of-quarter).

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Overlap subtracted from the previous completion so a jittered boundary
/// cannot lose events.
pub const INCREMENTAL_OVERLAP_SECONDS: i64 = 60;

/// First-run window for incremental reports.
const FIRST_RUN_WINDOW_DAYS: i64 = 7;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub range_type: String,
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"))
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(23, 59, 59).expect("end of day"))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).expect("first of month")
}

/// Compute a named date range relative to `reference`.
///
/// Unknown names fall back to `last_7_days` (logged), matching the lenient
/// handling reports expect from historical configs.
pub fn named_range(range_type: &str, reference: DateTime<Utc>) -> DateRange {
    let today = reference.date_naive();
    let (start, end) = match range_type {
        "last_7_days" => (reference - Duration::days(7), reference),
        "last_30_days" => (reference - Duration::days(30), reference),
        "last_90_days" => (reference - Duration::days(90), reference),
        "last_hour" => (reference - Duration::hours(1), reference),
        "last_24_hours" => (reference - Duration::hours(24), reference),
        "yesterday" => {
            let y = today - Duration::days(1);
            (midnight(y), end_of_day(y))
        }
        "last_week" => {
            // Previous Monday through Sunday.
            let days_since_monday = today.weekday().num_days_from_monday() as i64;
            let last_monday = today - Duration::days(days_since_monday + 7);
            (midnight(last_monday), end_of_day(last_monday + Duration::days(6)))
        }
        "last_month" => {
            let first_this = midnight(first_of_month(today));
            let end = first_this - Duration::seconds(1);
            (midnight(first_of_month(end.date_naive())), end)
        }
        "month_to_date" => (midnight(first_of_month(today)), reference),
        "quarter_to_date" => {
            let quarter_month = (today.month0() / 3) * 3 + 1;
            let first = NaiveDate::from_ymd_opt(today.year(), quarter_month, 1)
                .expect("first of quarter");
            (midnight(first), reference)
        }
        "year_to_date" => {
            let first = NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("jan 1");
            (midnight(first), reference)
        }
        "last_year" => {
            let year = today.year() - 1;
            let start = NaiveDate::from_ymd_opt(year, 1, 1).expect("jan 1");
            let end = NaiveDate::from_ymd_opt(year, 12, 31).expect("dec 31");
            (midnight(start), end_of_day(end))
        }
        other => {
            tracing::warn!(range_type = other, "unknown range type, defaulting to last_7_days");
            return DateRange {
                start: reference - Duration::days(7),
                end: reference,
                range_type: "last_7_days".to_string(),
            };
        }
    };
    DateRange {
        start,
        end,
        range_type: range_type.to_string(),
    }
}

/// Window for an incremental report: from the previous completion (minus the
/// overlap) to now. The first run covers the trailing week.
pub fn incremental_range(
    last_completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateRange {
    let start = match last_completed_at {
        Some(t) => t - Duration::seconds(INCREMENTAL_OVERLAP_SECONDS),
        None => now - Duration::days(FIRST_RUN_WINDOW_DAYS),
    };
    DateRange {
        start,
        end: now,
        range_type: "incremental".to_string(),
    }
}
