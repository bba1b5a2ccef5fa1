//! Time windows: half-open day ranges for trends, instant ranges for adapter fetches.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window end {end} must be after start {start}")]
    Empty { start: NaiveDate, end: NaiveDate },
    #[error("invalid window spec {0:?}; expected e.g. \"7d\"")]
    InvalidSpec(String),
    #[error("invalid month {0:?}; expected YYYY-MM")]
    InvalidMonth(String),
}

/// Half-open `[start, end)` range of calendar days (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if end <= start {
            return Err(WindowError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    /// The `days` most recent days, `today` included.
    pub fn trailing(days: u32, today: NaiveDate) -> Self {
        let days = i64::from(days.max(1));
        let end = today + Duration::days(1);
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    /// Calendar month `year-month`.
    pub fn month(year: i32, month: u32) -> Result<Self, WindowError> {
        let label = format!("{year:04}-{month:02}");
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or(WindowError::InvalidMonth(label.clone()))?;
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .ok_or(WindowError::InvalidMonth(label))?;
        Ok(Self { start, end })
    }

    pub fn parse_month(input: &str) -> Result<Self, WindowError> {
        let invalid = || WindowError::InvalidMonth(input.to_string());
        let (year, month) = input.trim().split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::month(year, month)
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Window of equal length ending exactly where this one starts.
    pub fn preceding(&self) -> Self {
        Self {
            start: self.start - Duration::days(self.days()),
            end: self.start,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    /// True when `previous` has the same length and ends where `self` starts.
    pub fn is_adjacent_successor_of(&self, previous: &DayWindow) -> bool {
        previous.end == self.start && previous.days() == self.days()
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        (0..self.days()).map(move |offset| start + Duration::days(offset))
    }

    pub fn to_collection_window(&self) -> CollectionWindow {
        CollectionWindow {
            since: self.start.and_time(NaiveTime::MIN).and_utc(),
            until: self.end.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    pub fn month_label(&self) -> String {
        format!("{:04}-{:02}", self.start.year(), self.start.month())
    }
}

/// Parse a trailing-window spec such as `"7d"` into a day count.
pub fn parse_days_spec(spec: &str) -> Result<u32, WindowError> {
    let trimmed = spec.trim();
    let digits = trimmed.strip_suffix('d').unwrap_or(trimmed);
    match digits.parse::<u32>() {
        Ok(days) if (1..=366).contains(&days) => Ok(days),
        _ => Err(WindowError::InvalidSpec(spec.to_string())),
    }
}

/// Instant range `[since, until)` handed to adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl CollectionWindow {
    pub fn lookback(hours: u32, now: DateTime<Utc>) -> Self {
        Self {
            since: now - Duration::hours(i64::from(hours.max(1))),
            until: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.since && at < self.until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn trailing_window_includes_today_and_precedes_without_gap() {
        let current = DayWindow::trailing(7, d(2026, 10, 19));
        assert_eq!(current.start, d(2026, 10, 13));
        assert_eq!(current.end, d(2026, 10, 20));
        assert_eq!(current.days(), 7);

        let previous = current.preceding();
        assert_eq!(previous.end, current.start);
        assert_eq!(previous.days(), 7);
        assert!(current.is_adjacent_successor_of(&previous));
        assert!(!previous.contains(current.start));
    }

    #[test]
    fn month_windows_handle_year_rollover() {
        let dec = DayWindow::parse_month("2025-12").unwrap();
        assert_eq!(dec.start, d(2025, 12, 1));
        assert_eq!(dec.end, d(2026, 1, 1));
        assert_eq!(dec.month_label(), "2025-12");
        assert!(DayWindow::parse_month("2025-13").is_err());
        assert!(DayWindow::parse_month("soon").is_err());
    }

    #[test]
    fn day_specs_parse_with_or_without_suffix() {
        assert_eq!(parse_days_spec("7d").unwrap(), 7);
        assert_eq!(parse_days_spec("30").unwrap(), 30);
        assert!(parse_days_spec("0d").is_err());
        assert!(parse_days_spec("week").is_err());
    }

    #[test]
    fn empty_window_is_rejected() {
        assert!(DayWindow::new(d(2026, 1, 2), d(2026, 1, 2)).is_err());
        assert_eq!(DayWindow::new(d(2026, 1, 1), d(2026, 1, 4)).unwrap().iter_days().count(), 3);
    }
}
