use chrono::{NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static WINDOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,2}):(\d{2})\s*-\s*(\d{1,2}):(\d{2})\s*$").expect("window pattern is valid")
});

const MINUTES_PER_DAY: i64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowParseError {
    #[error("invalid schedule window '{0}', expected HH:MM-HH:MM")]
    Format(String),
    #[error("invalid time of day in schedule window '{0}'")]
    Time(String),
}

/// Daily time-of-day window in the scheduler's fixed timezone.
///
/// Both bounds are inclusive. A window whose end is before its start wraps
/// past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn from_hm(start_hour: u32, start_minute: u32, end_hour: u32, end_minute: u32) -> Option<Self> {
        Some(Self {
            start: NaiveTime::from_hms_opt(start_hour, start_minute, 0)?,
            end: NaiveTime::from_hms_opt(end_hour, end_minute, 0)?,
        })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn wraps_midnight(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.wraps_midnight() {
            time >= self.start || time <= self.end
        } else {
            self.start <= time && time <= self.end
        }
    }

    /// Whole minutes from `time` until this window next opens.
    pub fn minutes_until_start(&self, time: NaiveTime) -> i64 {
        let now = i64::from(time.hour() * 60 + time.minute());
        let start = i64::from(self.start.hour() * 60 + self.start.minute());
        let diff = (start - now).rem_euclid(MINUTES_PER_DAY);
        if diff == 0 && time > self.start {
            MINUTES_PER_DAY
        } else {
            diff
        }
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}

impl FromStr for ScheduleWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = WINDOW_RE
            .captures(s)
            .ok_or_else(|| WindowParseError::Format(s.to_string()))?;
        let number = |i: usize| -> Result<u32, WindowParseError> {
            caps[i]
                .parse()
                .map_err(|_| WindowParseError::Time(s.to_string()))
        };

        ScheduleWindow::from_hm(number(1)?, number(2)?, number(3)?, number(4)?)
            .ok_or_else(|| WindowParseError::Time(s.to_string()))
    }
}

impl TryFrom<String> for ScheduleWindow {
    type Error = WindowParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleWindow> for String {
    fn from(window: ScheduleWindow) -> Self {
        window.to_string()
    }
}

/// Parse a comma-separated list such as `"08:55-09:10, 09:55-10:10"`.
pub fn parse_windows(list: &str) -> Result<Vec<ScheduleWindow>, WindowParseError> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

pub fn default_windows() -> Vec<ScheduleWindow> {
    [(8, 55, 9, 10), (9, 55, 10, 10)]
        .into_iter()
        .filter_map(|(sh, sm, eh, em)| ScheduleWindow::from_hm(sh, sm, eh, em))
        .collect()
}
