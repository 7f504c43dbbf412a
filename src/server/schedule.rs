//! Agent availability windows

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::models::WeeklySchedule;

fn day_key(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Whether an agent with this schedule takes calls at `at`.
///
/// No schedule means always open. A day that is missing or disabled is
/// closed. An unknown timezone or unparsable hours count as open so a bad
/// configuration never silently drops calls.
pub fn is_open(schedule: Option<&WeeklySchedule>, timezone: Option<&str>, at: DateTime<Utc>) -> bool {
    let Some(schedule) = schedule else {
        return true;
    };
    let tz: Tz = match timezone.unwrap_or("UTC").parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("Unknown schedule timezone {:?}, treating agent as available", timezone);
            return true;
        }
    };

    let local = at.with_timezone(&tz);
    let Some(day) = schedule.get(day_key(local.weekday())) else {
        return false;
    };
    if !day.enabled {
        return false;
    }

    let (start, end) = match (
        NaiveTime::parse_from_str(day.start.trim(), "%H:%M"),
        NaiveTime::parse_from_str(day.end.trim(), "%H:%M"),
    ) {
        (Ok(start), Ok(end)) => (start, end),
        _ => {
            tracing::warn!("Unparsable schedule hours {}-{}, treating agent as available", day.start, day.end);
            return true;
        }
    };

    let now = local.time();
    if start <= end {
        now >= start && now <= end
    } else {
        // Window runs past midnight.
        now >= start || now <= end
    }
}
