//! Recurrence rules for scheduled posts
//!
//! Two rule shapes: `daily:HH:MM` and `weekly:DAY:HH:MM` (3-letter day).
//! Times are interpreted in UTC; the dashboard layer owns timezone
//! presentation. Malformed rules yield `None` and the caller drops the
//! recurrence rather than guessing.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};

/// Compute the next occurrence of `rule` strictly after `from` (epoch
/// seconds). Daily rules always land on the following day; weekly rules
/// may land later the same day when the time has not yet passed.
pub fn next_occurrence(rule: &str, from: i64) -> Option<i64> {
    let from_dt = Utc.timestamp_opt(from, 0).single()?;
    let mut parts = rule.split(':');

    match parts.next()? {
        "daily" => {
            let (hour, minute) = parse_time(parts.next()?, parts.next()?)?;
            if parts.next().is_some() {
                return None;
            }
            let next = at_time(from_dt + Duration::days(1), hour, minute)?;
            Some(next.timestamp())
        }
        "weekly" => {
            let weekday = parse_weekday(parts.next()?)?;
            let (hour, minute) = parse_time(parts.next()?, parts.next()?)?;
            if parts.next().is_some() {
                return None;
            }

            let days_ahead = (weekday.num_days_from_monday() as i64
                - from_dt.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            let mut candidate = at_time(from_dt + Duration::days(days_ahead), hour, minute)?;
            // Same weekday with the time already passed rolls a full week.
            if candidate.timestamp() <= from {
                candidate = at_time(candidate + Duration::days(7), hour, minute)?;
            }
            Some(candidate.timestamp())
        }
        _ => None,
    }
}

fn parse_time(hour: &str, minute: &str) -> Option<(u32, u32)> {
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_ascii_lowercase().as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn at_time(day: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    day.with_hour(hour)?
        .with_minute(minute)?
        .with_second(0)?
        .with_nanosecond(0)
}
