//! Working-day calendar: Monday through Friday, no holidays.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

pub const HOURS_PER_WORK_DAY: f64 = 8.0;
pub const WORK_DAYS_PER_WEEK: f64 = 5.0;

pub fn is_work_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Every calendar day of the inclusive range. Empty when `start > end`.
pub fn days(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let count = (end - start).num_days().max(-1) + 1;
    (0..count).map(move |offset| start + Duration::days(offset))
}

/// Working days of the inclusive range.
pub fn work_days(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    days(start, end).filter(|d| is_work_day(*d))
}
