//! RFC 5545 recurrence rules for multi-session events, as consumed by the calendar export.
use chrono::Utc;

use crate::model::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
        }
    }
}

/// Derive `RRULE:FREQ=..;UNTIL=..Z` from the gap between the first two sessions.
///
/// Returns `None` for a single session or sessions less than a day apart.
pub fn rule_from_sessions(sessions: &[Session]) -> Option<String> {
    let (first, second) = match sessions {
        [first, second, ..] => (first, second),
        _ => return None,
    };
    let gap = second.start_date.signed_duration_since(first.start_date);
    let freq = if gap.num_weeks() >= 1 {
        Frequency::Weekly
    } else if gap.num_days() >= 1 {
        Frequency::Daily
    } else {
        return None;
    };
    let last = sessions.last()?;
    let until = last.start_date.with_timezone(&Utc).format("%Y%m%dT%H%M%SZ");
    Some(format!("RRULE:FREQ={};UNTIL={}", freq.as_str(), until))
}
