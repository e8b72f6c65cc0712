//! Market session classification.
//!
//! A-share continuous trading runs 09:30-11:30 and 13:00-15:00, Monday to
//! Friday. Exchange holidays are not modeled.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

const MORNING_START: u32 = 9 * 3600 + 30 * 60;
const MORNING_END: u32 = 11 * 3600 + 30 * 60;
const AFTERNOON_START: u32 = 13 * 3600;
const AFTERNOON_END: u32 = 15 * 3600;

/// Wall-clock market state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    /// Continuous trading (endpoints inclusive)
    Open,
    /// Lunch recess, strictly between the two sessions
    Break,
    /// Weekend, pre-open or post-close
    Closed,
}

impl MarketSession {
    /// Classify a local timestamp.
    pub fn classify(now: NaiveDateTime) -> Self {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return Self::Closed;
        }

        let secs = now.time().num_seconds_from_midnight();
        if (MORNING_START..=MORNING_END).contains(&secs)
            || (AFTERNOON_START..=AFTERNOON_END).contains(&secs)
        {
            Self::Open
        } else if secs > MORNING_END && secs < AFTERNOON_START {
            Self::Break
        } else {
            Self::Closed
        }
    }

    /// Open and break both count as an active trading day session.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Break)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Break => "break",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for MarketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
