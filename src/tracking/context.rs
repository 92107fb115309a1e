use chrono::{DateTime, Local, Timelike, Utc};

use crate::{models::Sample, settings::TrackerSettings};

pub const HOME_RADIUS_METERS: f64 = 100.0;

pub fn minute_of_day(time: DateTime<Utc>) -> i64 {
    let local = time.with_timezone(&Local);
    i64::from(local.hour()) * 60 + i64::from(local.minute())
}

/// Day window test on minutes from midnight. `start == end` means "always day";
/// `start > end` wraps past midnight.
pub fn is_day_minute(minute: i64, settings: &TrackerSettings) -> bool {
    let start = settings.day_starts_minutes_from_midnight;
    let end = settings.day_ends_minutes_from_midnight;

    if start == end {
        return true;
    }

    if start < end {
        return (start..end).contains(&minute);
    }

    minute >= start || minute < end
}

pub fn is_day(time: DateTime<Utc>, settings: &TrackerSettings) -> bool {
    is_day_minute(minute_of_day(time), settings)
}

pub fn is_at_home(sample: &Sample, settings: &TrackerSettings) -> bool {
    sample.distance_to(&settings.home()) <= HOME_RADIUS_METERS
}
