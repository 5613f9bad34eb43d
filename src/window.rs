use chrono::{Duration, Local, NaiveDate};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("fromDate {from} is after toDate {to}")]
    Reversed { from: NaiveDate, to: NaiveDate },
}

/// Inclusive calendar-day range used by the upstream API, the sync routine
/// and every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, WindowError> {
        if from > to {
            return Err(WindowError::Reversed { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn parse(from: &str, to: &str) -> Result<Self, WindowError> {
        Self::new(parse_date(from)?, parse_date(to)?)
    }

    /// Parse optional bounds, filling whichever is missing from `default`.
    pub fn parse_or(
        from: Option<&str>,
        to: Option<&str>,
        default: DateWindow,
    ) -> Result<Self, WindowError> {
        let from = match from.filter(|s| !s.trim().is_empty()) {
            Some(s) => parse_date(s)?,
            None => default.from,
        };
        let to = match to.filter(|s| !s.trim().is_empty()) {
            Some(s) => parse_date(s)?,
            None => default.to,
        };
        Self::new(from, to)
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }

    /// Yesterday in local time; the default sync window.
    pub fn yesterday() -> Self {
        Self::single(today() - Duration::days(1))
    }

    /// The `days` days ending today, inclusive.
    pub fn last_days(days: u32) -> Self {
        let to = today();
        let back = i64::from(days.max(1)) - 1;
        Self {
            from: to - Duration::days(back),
            to,
        }
    }

    /// `[today - lookback_days, today]`
    pub fn lookback(lookback_days: u32) -> Self {
        let to = today();
        Self {
            from: to - Duration::days(i64::from(lookback_days)),
            to,
        }
    }

    pub fn from_day(&self) -> String {
        self.from.format(DATE_FORMAT).to_string()
    }

    pub fn to_day(&self) -> String {
        self.to.format(DATE_FORMAT).to_string()
    }

    pub fn day_count(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from_day(), self.to_day())
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, WindowError> {
    let trimmed = raw.trim();
    // Accept full timestamps too; only the day part matters.
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, DATE_FORMAT)
        .map_err(|_| WindowError::InvalidDate(raw.to_string()))
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
