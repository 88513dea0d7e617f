//! Calendar arithmetic for accounting periods.
//!
//! Monthly cost tracking resets on the local calendar month, so these helpers
//! are generic over the time zone and tests can pin them to UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Midnight on the first day of the month containing `now`, in `now`'s zone.
pub fn start_of_month<Tz: TimeZone>(now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let first = now.date_naive().with_day(1)?;
    now.timezone()
        .from_local_datetime(&first.and_hms_opt(0, 0, 0)?)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
}

/// 23:59:59 on the last day of the month containing `now`, in `now`'s zone.
pub fn end_of_month<Tz: TimeZone>(now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let last = last_day_of_month(now.date_naive())?;
    now.timezone()
        .from_local_datetime(&last.and_hms_opt(23, 59, 59)?)
        .latest()
        .map(|d| d.with_timezone(&Utc))
}

pub fn last_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.pred_opt()
}

/// Month-to-date range as (first day, today).
pub fn month_to_date(today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    Some((today.with_day(1)?, today))
}

/// Hours from `now` until `boundary`; negative when the boundary has passed.
pub fn hours_between(now: DateTime<Utc>, boundary: DateTime<Utc>) -> f64 {
    (boundary - now).num_seconds() as f64 / 3600.0
}

/// Parses vendor and stored timestamps. RFC 3339 is preferred; a bare
/// `YYYY-MM-DDTHH:MM:SS[.fff]` is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
            .single()
            .expect("valid date")
    }

    #[test]
    fn end_of_month_handles_leap_years_and_december() {
        assert_eq!(
            end_of_month(&utc(2024, 2, 10, 8)),
            Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).single()
        );
        assert_eq!(
            end_of_month(&utc(2025, 2, 10, 8)),
            Utc.with_ymd_and_hms(2025, 2, 28, 23, 59, 59).single()
        );
        assert_eq!(
            end_of_month(&utc(2025, 12, 31, 23)),
            Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).single()
        );
    }

    #[test]
    fn start_of_month_is_midnight_on_the_first() {
        assert_eq!(start_of_month(&utc(2025, 11, 14, 18)), Some(utc(2025, 11, 1, 0)));
    }

    #[test]
    fn month_to_date_starts_on_the_first() {
        let today = NaiveDate::from_ymd_opt(2025, 11, 14).expect("valid date");
        let (start, end) = month_to_date(today).expect("range");
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 11, 1).expect("valid date"));
        assert_eq!(end, today);
    }

    #[test]
    fn hours_between_is_signed() {
        assert_eq!(hours_between(utc(2025, 1, 1, 0), utc(2025, 1, 1, 3)), 3.0);
        assert_eq!(hours_between(utc(2025, 1, 1, 3), utc(2025, 1, 1, 0)), -3.0);
    }

    #[test]
    fn parse_timestamp_accepts_offsets_and_naive_values() {
        assert_eq!(
            parse_timestamp("2025-11-14T18:00:00.512+00:00").map(|d| d.timestamp()),
            Some(1_763_143_200)
        );
        assert_eq!(
            parse_timestamp("2025-01-01T00:00:00").map(|d| d.timestamp()),
            Some(1_735_689_600)
        );
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("tomorrow").is_none());
    }
}
