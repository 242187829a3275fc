//! Daily time-of-day slots and next-trigger computation

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// A time of day in the scheduler's timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSlot {
    hour: u8,
    minute: u8,
}

impl TimeSlot {
    pub fn new(hour: u8, minute: u8) -> Result<Self, SchedulerError> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidTime(format!("{}:{}", hour, minute)));
        }
        Ok(Self { hour, minute })
    }

    /// Parse a 24-hour `HH:MM` string (a single-digit hour is accepted)
    pub fn parse(input: &str) -> Result<Self, SchedulerError> {
        let invalid = || SchedulerError::InvalidTime(input.to_string());
        let (h, m) = input.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(invalid());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    fn as_naive(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour.into(), self.minute.into(), 0)
    }
}

impl std::fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl std::str::FromStr for TimeSlot {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TimeSlot {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TimeSlot> for String {
    fn from(slot: TimeSlot) -> Self {
        slot.to_string()
    }
}

pub fn is_valid_time(input: &str) -> bool {
    TimeSlot::parse(input).is_ok()
}

/// Parse a list of `HH:MM` strings, failing on the first invalid entry
pub fn parse_slots<S: AsRef<str>>(times: &[S]) -> Result<Vec<TimeSlot>, SchedulerError> {
    let slots = times
        .iter()
        .map(|t| TimeSlot::parse(t.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(normalize(slots))
}

/// Sort ascending and drop duplicates
pub fn normalize(mut slots: Vec<TimeSlot>) -> Vec<TimeSlot> {
    slots.sort();
    slots.dedup();
    slots
}

pub fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::UnknownTimezone(name.to_string()))
}

/// Earliest slot strictly after `now`, evaluated in `tz`
///
/// Slots whose local time does not exist on a given day (DST gap) are skipped
/// for that day. Ambiguous local times resolve to the earlier instant.
pub fn next_slot_after(slots: &[TimeSlot], tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if slots.is_empty() {
        return None;
    }
    let sorted = normalize(slots.to_vec());
    let today = now.with_timezone(&tz).date_naive();

    // Two extra days cover a slot that falls in a gap both today and tomorrow.
    for offset in 0..3 {
        let day = today + Duration::days(offset);
        for slot in &sorted {
            let Some(time) = slot.as_naive() else {
                continue;
            };
            let Some(local) = tz.from_local_datetime(&day.and_time(time)).earliest() else {
                continue;
            };
            let instant = local.with_timezone(&Utc);
            if instant > now {
                return Some(instant);
            }
        }
    }
    None
}
