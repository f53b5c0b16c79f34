//! Clock and timezone resolver.
//!
//! Converts IANA timezone names plus calendar dates into absolute instants.
//! Every function takes the reference instant explicitly; the scheduler
//! gets "now" from an injected [`Clock`].

use std::sync::Mutex;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use vigil_core::error::{Result, VigilError};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

/// Resolve an IANA timezone name.
pub fn resolve_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| VigilError::UnknownTimezone(name.to_string()))
}

/// Resolve `name`, falling back to `fallback` (and then UTC) when it is blank or unknown.
pub fn resolve_or(name: &str, fallback: &str) -> (Tz, bool) {
    match resolve_timezone(name) {
        Ok(tz) => (tz, false),
        Err(_) => (resolve_timezone(fallback).unwrap_or(Tz::UTC), true),
    }
}

/// Pin a local wall-clock time to an instant. Times inside a DST gap move
/// forward by an hour; ambiguous times take the earlier instant.
fn localize(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = local + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                // No zone has back-to-back gaps; treat the wall time as UTC.
                LocalResult::None => Utc.from_utc_datetime(&local),
            }
        }
    }
}

/// The calendar date of `instant` in `tz`.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Midnight of `reference`'s date in `timezone`, as an absolute instant.
pub fn start_of_day(timezone: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = resolve_timezone(timezone)?;
    Ok(localize(tz, local_date(reference, tz).and_time(NaiveTime::MIN)))
}

/// `hour:minute` on `reference`'s date in `timezone`.
pub fn at_time_of_day(
    timezone: &str,
    hour: u32,
    minute: u32,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let tz = resolve_timezone(timezone)?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| VigilError::InvalidDate(format!("{hour:02}:{minute:02}")))?;
    Ok(localize(tz, local_date(reference, tz).and_time(time)))
}

/// Midnight of a `yyyy-mm-dd` date in `timezone`.
pub fn parse_calendar_date(date: &str, timezone: &str) -> Result<DateTime<Utc>> {
    let tz = resolve_timezone(timezone)?;
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| VigilError::InvalidDate(format!("'{date}': {e}")))?;
    Ok(localize(tz, day.and_time(NaiveTime::MIN)))
}

/// Whole calendar days between `instant`'s date and `now`'s date, both taken
/// in `timezone`. Day-boundary arithmetic, not elapsed hours.
pub fn days_since(instant: DateTime<Utc>, timezone: &str, now: DateTime<Utc>) -> Result<i64> {
    let tz = resolve_timezone(timezone)?;
    Ok(local_date(now, tz)
        .signed_duration_since(local_date(instant, tz))
        .num_days())
}

/// `yyyy-mm-dd` of `instant` in `timezone`.
pub fn date_string(instant: DateTime<Utc>, timezone: &str) -> Result<String> {
    let tz = resolve_timezone(timezone)?;
    Ok(local_date(instant, tz).format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(matches!(
            resolve_timezone("Mars/Olympus"),
            Err(VigilError::UnknownTimezone(_))
        ));
        assert!(start_of_day("Nowhere", Utc::now()).is_err());
        let (tz, fell_back) = resolve_or("Nowhere", "UTC");
        assert_eq!(tz, Tz::UTC);
        assert!(fell_back);
        let (tz, fell_back) = resolve_or("Asia/Shanghai", "UTC");
        assert_eq!(tz, chrono_tz::Asia::Shanghai);
        assert!(!fell_back);
    }

    #[test]
    fn test_start_of_day_shanghai() {
        // 2024-01-01 01:30Z is 09:30 in Shanghai; local midnight is 2023-12-31 16:00Z.
        let start = start_of_day("Asia/Shanghai", utc(2024, 1, 1, 1, 30)).unwrap();
        assert_eq!(start, utc(2023, 12, 31, 16, 0));
    }

    #[test]
    fn test_at_time_of_day() {
        let nine = at_time_of_day("Asia/Shanghai", 9, 0, utc(2024, 1, 1, 1, 30)).unwrap();
        assert_eq!(nine, utc(2024, 1, 1, 1, 0));
        assert!(at_time_of_day("UTC", 25, 0, Utc::now()).is_err());
    }

    #[test]
    fn test_at_time_of_day_in_dst_gap_moves_forward() {
        // 2024-03-10 02:30 does not exist in New York; 03:30 EDT is 07:30Z.
        let t = at_time_of_day("America/New_York", 2, 30, utc(2024, 3, 10, 12, 0)).unwrap();
        assert_eq!(t, utc(2024, 3, 10, 7, 30));
    }

    #[test]
    fn test_parse_calendar_date() {
        let midnight = parse_calendar_date("2024-01-02", "Asia/Shanghai").unwrap();
        assert_eq!(midnight, utc(2024, 1, 1, 16, 0));
        assert!(matches!(
            parse_calendar_date("2024-13-40", "UTC"),
            Err(VigilError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_days_since_same_calendar_day_is_zero() {
        // 00:01 to 23:59 on the same UTC+14 date: almost 24h elapsed, still day 0.
        let checked_in = utc(2024, 1, 1, 10, 1); // 2024-01-02 00:01 +14
        let now = utc(2024, 1, 2, 9, 59); // 2024-01-02 23:59 +14
        assert_eq!(days_since(checked_in, "Pacific/Kiritimati", now).unwrap(), 0);
    }

    #[test]
    fn test_days_since_crossing_midnight_is_one() {
        // 23:59 then 00:01 the next UTC+14 date: two minutes, one calendar day.
        let checked_in = utc(2024, 1, 1, 9, 59);
        let now = utc(2024, 1, 1, 10, 1);
        assert_eq!(days_since(checked_in, "Pacific/Kiritimati", now).unwrap(), 1);

        // 23 hours earlier across a midnight boundary.
        let checked_in = utc(2024, 1, 1, 2, 0); // 16:00 +14
        let now = utc(2024, 1, 2, 1, 0); // 15:00 next day +14
        assert_eq!(days_since(checked_in, "Pacific/Kiritimati", now).unwrap(), 1);
    }

    #[test]
    fn test_days_since_across_dst_change() {
        // 2024-03-09 12:00 to 2024-03-12 12:00 New York spans the spring-forward night.
        let then = utc(2024, 3, 9, 17, 0);
        let now = utc(2024, 3, 12, 16, 0);
        assert_eq!(days_since(then, "America/New_York", now).unwrap(), 3);
    }

    #[test]
    fn test_date_string() {
        let instant = utc(2023, 12, 31, 16, 30);
        assert_eq!(date_string(instant, "Asia/Shanghai").unwrap(), "2024-01-01");
        assert_eq!(date_string(instant, "UTC").unwrap(), "2023-12-31");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(utc(2024, 1, 1, 0, 0));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), utc(2024, 1, 1, 0, 5));
        clock.set(utc(2025, 1, 1, 0, 0));
        assert_eq!(clock.now(), utc(2025, 1, 1, 0, 0));
    }
}
