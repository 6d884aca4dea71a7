use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize, Serializer};

pub const SIGNUP: &str = "signup";
pub const ONBOARDING_STEP: &str = "onboarding_step";
pub const LESSON_START: &str = "lesson_start";
pub const LESSON_COMPLETE: &str = "lesson_complete";
pub const PRACTICE: &str = "practice";
pub const STREAK_UPDATE: &str = "streak_update";

pub const FUNNEL_STAGES: [&str; 6] = [
    SIGNUP,
    ONBOARDING_STEP,
    LESSON_START,
    LESSON_COMPLETE,
    PRACTICE,
    STREAK_UPDATE,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,
    pub event_type: String,
    pub timestamp: NaiveDateTime,
}

impl Event {
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event_type: event_type.into(),
            timestamp,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    #[default]
    Day,
    Week,
    Month,
}

impl Window {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Day => "dau",
            Self::Week => "wau",
            Self::Month => "mau",
        }
    }

    pub fn period_of(&self, timestamp: &NaiveDateTime) -> Period {
        let date = timestamp.date();
        match self {
            Self::Day => Period::Day(date),
            Self::Week => {
                let iso = date.iso_week();
                Period::Week {
                    year: iso.year(),
                    week: iso.week(),
                }
            }
            Self::Month => Period::Month {
                year: date.year(),
                month: date.month(),
            },
        }
    }
}

/// A period key present in the data: a day, an ISO week or a calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Period {
    Day(NaiveDate),
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day(date) => write!(f, "{}", date),
            Self::Week { year, week } => write!(f, "{}-W{:02}", year, week),
            Self::Month { year, month } => write!(f, "{}-{:02}", year, month),
        }
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Round to two decimals, the precision every reported percentage uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Division that yields 0 instead of NaN or infinity.
pub fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    #[test]
    fn periods_follow_window() {
        let ts = at(2024, 1, 3);
        assert_eq!(
            Window::Day.period_of(&ts),
            Period::Day(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap())
        );
        assert_eq!(
            Window::Week.period_of(&ts),
            Period::Week { year: 2024, week: 1 }
        );
        assert_eq!(
            Window::Month.period_of(&ts),
            Period::Month { year: 2024, month: 1 }
        );
    }

    #[test]
    fn iso_week_crosses_calendar_year() {
        // 2021-01-01 belongs to ISO week 53 of 2020.
        let period = Window::Week.period_of(&at(2021, 1, 1));
        assert_eq!(period, Period::Week { year: 2020, week: 53 });
        assert_eq!(period.to_string(), "2020-W53");
    }

    #[test]
    fn period_display() {
        assert_eq!(Window::Month.period_of(&at(2024, 3, 9)).to_string(), "2024-03");
        assert_eq!(Window::Day.period_of(&at(2024, 3, 9)).to_string(), "2024-03-09");
    }

    #[test]
    fn ratio_never_divides_by_zero() {
        assert_eq!(ratio(5, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }

    #[test]
    fn round2_keeps_two_decimals() {
        assert_eq!(round2(33.33333), 33.33);
        assert_eq!(round2(50.0), 50.0);
    }
}
