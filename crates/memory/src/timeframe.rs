//! Date-range resolution for search filters.
//!
//! Callers may pass either explicit bounds (RFC 3339 instants or plain
//! `YYYY-MM-DD` dates) or a named expression like `"today"` or
//! `"last week"`. Named expressions are resolved against the configured
//! process timezone, not UTC, so "today" means the operator's today.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// A date-range filter as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateRange {
    /// `"today"`, `"yesterday"`, `"this week"`, `"last week"`,
    /// `"this month"`, `"last month"`, `"recent"`.
    Named(String),
    /// Explicit inclusive bounds; either side may be open.
    Bounds {
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
}

/// Inclusive UTC bounds ready for the payload filter.
pub type ResolvedRange = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

pub fn resolve(range: &DateRange, tz: Tz, now: DateTime<Utc>) -> Result<ResolvedRange> {
    match range {
        DateRange::Named(name) => resolve_named(name, tz, now),
        DateRange::Bounds { from, to } => {
            let from = from
                .as_deref()
                .map(|raw| parse_bound(raw, tz, false))
                .transpose()?;
            let to = to
                .as_deref()
                .map(|raw| parse_bound(raw, tz, true))
                .transpose()?;
            if let (Some(f), Some(t)) = (from, to)
                && f > t
            {
                return Err(MemoryError::Validation(format!(
                    "date range is inverted: {f} > {t}"
                )));
            }
            Ok((from, to))
        }
    }
}

fn resolve_named(name: &str, tz: Tz, now: DateTime<Utc>) -> Result<ResolvedRange> {
    let normalized = name.trim().to_lowercase().replace(['_', '-'], " ");
    let local_today = now.with_timezone(&tz).date_naive();

    match normalized.as_str() {
        "today" => day_span(local_today, local_today, tz),
        "yesterday" => {
            let day = local_today - Duration::days(1);
            day_span(day, day, tz)
        }
        "this week" => {
            let monday =
                local_today - Duration::days(local_today.weekday().num_days_from_monday() as i64);
            day_span(monday, local_today, tz)
        }
        "last week" => {
            let this_monday =
                local_today - Duration::days(local_today.weekday().num_days_from_monday() as i64);
            let last_monday = this_monday - Duration::days(7);
            day_span(last_monday, this_monday - Duration::days(1), tz)
        }
        "this month" => {
            let first = first_of_month(local_today.year(), local_today.month())?;
            day_span(first, local_today, tz)
        }
        "last month" => {
            let (year, month) = if local_today.month() == 1 {
                (local_today.year() - 1, 12)
            } else {
                (local_today.year(), local_today.month() - 1)
            };
            let first = first_of_month(year, month)?;
            let last = first_of_month(local_today.year(), local_today.month())?
                - Duration::days(1);
            day_span(first, last, tz)
        }
        "recent" => Ok((Some(now - Duration::days(7)), Some(now))),
        other => Err(MemoryError::Validation(format!(
            "unrecognised date expression '{other}'"
        ))),
    }
}

/// Inclusive span covering local `first..=last` whole days, in UTC.
fn day_span(first: NaiveDate, last: NaiveDate, tz: Tz) -> Result<ResolvedRange> {
    let start = local_to_utc(first.and_time(NaiveTime::MIN), tz)?;
    let end = local_to_utc((last + Duration::days(1)).and_time(NaiveTime::MIN), tz)?
        - Duration::microseconds(1);
    Ok((Some(start), Some(end)))
}

fn parse_bound(raw: &str, tz: Tz, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return if end_of_day {
            Ok(local_to_utc((date + Duration::days(1)).and_time(NaiveTime::MIN), tz)?
                - Duration::microseconds(1))
        } else {
            local_to_utc(date.and_time(NaiveTime::MIN), tz)
        };
    }
    Err(MemoryError::Validation(format!(
        "unparseable date bound '{raw}' (expected RFC 3339 or YYYY-MM-DD)"
    )))
}

fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> Result<DateTime<Utc>> {
    // `earliest` picks the pre-transition instant on DST-ambiguous wall
    // times and the first valid instant after a spring-forward gap.
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            MemoryError::Validation(format!("'{naive}' does not exist in timezone {tz}"))
        })
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| MemoryError::Internal(format!("invalid month {year}-{month}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::Tz;

    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        // Wednesday, 2024-03-13 15:30 UTC.
        Utc.with_ymd_and_hms(2024, 3, 13, 15, 30, 0).unwrap()
    }

    #[test]
    fn today_covers_the_local_civil_day() {
        let (from, to) =
            resolve(&DateRange::Named("today".into()), Tz::UTC, fixed_now()).unwrap();
        assert_eq!(from.unwrap(), Utc.with_ymd_and_hms(2024, 3, 13, 0, 0, 0).unwrap());
        assert!(to.unwrap() < Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap());
        assert!(to.unwrap() > Utc.with_ymd_and_hms(2024, 3, 13, 23, 59, 58).unwrap());
    }

    #[test]
    fn today_respects_the_configured_timezone() {
        // 15:30 UTC on the 13th is already the 14th in Tokyo (UTC+9).
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let (from, _) = resolve(&DateRange::Named("today".into()), tz, fixed_now()).unwrap();
        assert_eq!(from.unwrap(), Utc.with_ymd_and_hms(2024, 3, 13, 15, 0, 0).unwrap());
    }

    #[test]
    fn last_week_is_the_previous_monday_to_sunday() {
        let (from, to) =
            resolve(&DateRange::Named("last week".into()), Tz::UTC, fixed_now()).unwrap();
        // 2024-03-13 is a Wednesday; last week ran Mon 03-04 .. Sun 03-10.
        assert_eq!(from.unwrap(), Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
        assert!(to.unwrap() < Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn last_month_spans_the_whole_previous_month() {
        let (from, to) =
            resolve(&DateRange::Named("last month".into()), Tz::UTC, fixed_now()).unwrap();
        assert_eq!(from.unwrap(), Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert!(to.unwrap() < Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn named_expressions_tolerate_separator_variants() {
        assert!(resolve(&DateRange::Named("Last_Week".into()), Tz::UTC, fixed_now()).is_ok());
        assert!(resolve(&DateRange::Named("this-month".into()), Tz::UTC, fixed_now()).is_ok());
    }

    #[test]
    fn explicit_bounds_parse_dates_and_instants() {
        let range = DateRange::Bounds {
            from: Some("2024-03-01".into()),
            to: Some("2024-03-10T12:00:00Z".into()),
        };
        let (from, to) = resolve(&range, Tz::UTC, fixed_now()).unwrap();
        assert_eq!(from.unwrap(), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(to.unwrap(), Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let range = DateRange::Bounds {
            from: Some("2024-03-10".into()),
            to: Some("2024-03-01".into()),
        };
        assert!(resolve(&range, Tz::UTC, fixed_now()).is_err());
    }

    #[test]
    fn unknown_expression_is_a_validation_error() {
        let err =
            resolve(&DateRange::Named("fortnight ago".into()), Tz::UTC, fixed_now()).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }
}
