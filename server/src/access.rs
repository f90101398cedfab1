//! Access-time policy for assets.
//!
//! An [`AccessAuth`] is a declarative schedule stored on the asset record:
//! optional absolute start/end bounds plus weekly `"HH:MM~HH:MM"` windows.
//! The schedule's weekday index is 0-based starting at Monday; a range with
//! index `w` applies when `(w + 1) % 7` equals the days-from-Sunday weekday
//! of the evaluation instant.

use chrono::{DateTime, Datelike, Local, Utc};
use serde::{Deserialize, Serialize};

/// One weekday's windows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeekRange {
    /// 0-based weekday index, 0 = Monday.
    pub week: i64,
    /// `"HH:MM~HH:MM"` windows, inclusive on both ends.
    #[serde(default)]
    pub times: Vec<String>,
}

/// Per-asset connection schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessAuth {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ranges: Vec<WeekRange>,
    /// true: windows are an allow-list; false: a deny-list.
    #[serde(default)]
    pub allow: bool,
}

/// Whether a connection is permitted at `now`.
///
/// Absolute bounds are checked first. A schedule with no windows at all means
/// "nothing specified" and always allows; otherwise the `allow` flag selects
/// whether a matching window permits or forbids.
pub fn allowed(now: DateTime<Local>, auth: &AccessAuth) -> bool {
    let now_utc = now.with_timezone(&Utc);
    if auth.start.is_some_and(|start| now_utc < start)
        || auth.end.is_some_and(|end| now_utc > end)
    {
        return false;
    }

    let weekday = i64::from(now.weekday().num_days_from_sunday());
    let hm = now.format("%H:%M").to_string();
    let mut matched = false;
    let mut has_any_window = false;
    for range in &auth.ranges {
        has_any_window = has_any_window || !range.times.is_empty();
        if (range.week + 1).rem_euclid(7) != weekday {
            continue;
        }
        for window in &range.times {
            if let Some((from, to)) = window.split_once('~') {
                matched = matched || (hm.as_str() >= from && hm.as_str() <= to);
            }
        }
    }

    !has_any_window || matched == auth.allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn weekdays_nine_to_six(allow: bool) -> AccessAuth {
        AccessAuth {
            ranges: (0..5)
                .map(|week| WeekRange {
                    week,
                    times: vec!["09:00~18:00".to_string()],
                })
                .collect(),
            allow,
            ..AccessAuth::default()
        }
    }

    #[test]
    fn empty_schedule_always_allows() {
        let now = at(2024, 1, 6, 10, 0);
        for allow in [true, false] {
            let auth = AccessAuth {
                allow,
                ..AccessAuth::default()
            };
            assert!(allowed(now, &auth));
        }
    }

    #[test]
    fn ranges_without_times_always_allow() {
        let auth = AccessAuth {
            ranges: vec![WeekRange {
                week: 0,
                times: vec![],
            }],
            allow: false,
            ..AccessAuth::default()
        };
        assert!(allowed(at(2024, 1, 1, 12, 0), &auth));
    }

    #[test]
    fn before_start_rejects() {
        let auth = AccessAuth {
            start: Some(Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap()),
            ..AccessAuth::default()
        };
        assert!(!allowed(at(2024, 1, 1, 12, 0), &auth));
    }

    #[test]
    fn after_end_rejects() {
        let auth = AccessAuth {
            end: Some(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()),
            ..AccessAuth::default()
        };
        assert!(!allowed(at(2024, 1, 1, 12, 0), &auth));
    }

    #[test]
    fn weekday_window_allows_inside_rejects_outside() {
        let auth = weekdays_nine_to_six(true);
        // 2024-01-01 is a Monday
        assert!(allowed(at(2024, 1, 1, 10, 30), &auth));
        assert!(allowed(at(2024, 1, 1, 9, 0), &auth));
        assert!(allowed(at(2024, 1, 1, 18, 0), &auth));
        assert!(!allowed(at(2024, 1, 1, 8, 59), &auth));
        assert!(!allowed(at(2024, 1, 1, 18, 1), &auth));
        // 2024-01-06 is a Saturday: no matching range
        assert!(!allowed(at(2024, 1, 6, 10, 0), &auth));
    }

    #[test]
    fn deny_list_inverts_the_match() {
        let auth = weekdays_nine_to_six(false);
        assert!(!allowed(at(2024, 1, 1, 10, 30), &auth));
        assert!(allowed(at(2024, 1, 1, 8, 0), &auth));
        // Saturday is outside every deny window
        assert!(allowed(at(2024, 1, 6, 10, 0), &auth));
    }
}
