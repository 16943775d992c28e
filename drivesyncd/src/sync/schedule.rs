use thiserror::Error;
use time::{Duration, OffsetDateTime, Time};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule time, expected HH:MM: {0}")]
    InvalidTime(String),
}

/// A daily transfer window in local wall-clock time. A window whose start is
/// later than its end wraps over midnight (e.g. 22:00..06:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: Time,
    pub end: Time,
}

impl ScheduleWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    pub fn contains(&self, now: Time) -> bool {
        if self.start <= self.end {
            now >= self.start && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }

    /// The next moment uploads may run. When `now` already falls inside the
    /// window this is `now` itself; otherwise it is today's start, or
    /// tomorrow's when today's has already passed.
    pub fn next_start(&self, now: OffsetDateTime) -> OffsetDateTime {
        if self.contains(now.time()) {
            return now;
        }
        let candidate = now.replace_time(self.start);
        if candidate > now {
            candidate
        } else {
            candidate + Duration::days(1)
        }
    }
}

pub fn parse_hhmm(value: &str) -> Result<Time, ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(value.to_string());
    let (hours, minutes) = value.split_once(':').ok_or_else(invalid)?;
    let hours: u8 = hours.parse().map_err(|_| invalid())?;
    let minutes: u8 = minutes.parse().map_err(|_| invalid())?;
    Time::from_hms(hours, minutes, 0).map_err(|_| invalid())
}

pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
