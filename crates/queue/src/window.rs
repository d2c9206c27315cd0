//! Business-day operating window.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Tenant-configured window during which automated sends are permitted.
///
/// Expressed as a weekday set plus a local start/end time with a fixed UTC
/// offset; entries outside the window stay `queued` and are re-evaluated on
/// the next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessWindow {
    pub weekdays: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Tenant-local offset from UTC in minutes (e.g. +120 for UTC+2).
    pub utc_offset_minutes: i32,
}

impl Default for BusinessWindow {
    fn default() -> Self {
        Self {
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            start: NaiveTime::from_hms_opt(9, 0, 0).expect("static time"),
            end: NaiveTime::from_hms_opt(18, 0, 0).expect("static time"),
            utc_offset_minutes: 0,
        }
    }
}

impl BusinessWindow {
    /// A window that is always open (for tests and tenants without one).
    pub fn always_open() -> Self {
        Self {
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            start: NaiveTime::from_hms_opt(0, 0, 0).expect("static time"),
            end: NaiveTime::from_hms_opt(23, 59, 59).expect("static time"),
            utc_offset_minutes: 0,
        }
    }

    /// Whether automated sends are permitted at `now`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now + Duration::minutes(self.utc_offset_minutes as i64);
        if !self.weekdays.contains(&local.weekday()) {
            return false;
        }
        let time = local.time();
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            // Overnight window (e.g. 22:00-06:00).
            time >= self.start || time <= self.end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekday_business_hours() {
        let window = BusinessWindow::default();
        // 2026-08-28 is a Friday.
        assert!(window.contains(at(2026, 8, 28, 10, 0)));
        assert!(!window.contains(at(2026, 8, 28, 8, 59)));
        assert!(!window.contains(at(2026, 8, 28, 18, 1)));
        // 2026-08-29 is a Saturday.
        assert!(!window.contains(at(2026, 8, 29, 10, 0)));
    }

    #[test]
    fn utc_offset_shifts_the_window() {
        let window = BusinessWindow {
            utc_offset_minutes: 120,
            ..BusinessWindow::default()
        };
        // 07:30 UTC is 09:30 local (UTC+2): open.
        assert!(window.contains(at(2026, 8, 28, 7, 30)));
        // 17:00 UTC is 19:00 local: closed.
        assert!(!window.contains(at(2026, 8, 28, 17, 0)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let window = BusinessWindow {
            weekdays: vec![Weekday::Fri],
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            utc_offset_minutes: 0,
        };
        assert!(window.contains(at(2026, 8, 28, 23, 0)));
        assert!(window.contains(at(2026, 8, 28, 5, 0)));
        assert!(!window.contains(at(2026, 8, 28, 12, 0)));
    }

    #[test]
    fn always_open_is_always_open() {
        let window = BusinessWindow::always_open();
        assert!(window.contains(at(2026, 8, 30, 0, 0)));
        assert!(window.contains(at(2026, 8, 29, 23, 59)));
    }
}
