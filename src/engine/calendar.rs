use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike};

use crate::model::*;

// ── Availability Calendar ─────────────────────────────────────────

/// A room's opening window for one calendar date, after exceptions are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveHours {
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    pub max_duration_minutes: Option<u32>,
    /// True when an exception replaced the weekday hours.
    pub special: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedReason {
    NoOperatingHours { weekday: u8 },
    Holiday { date: NaiveDate, reason: Option<String> },
    OutsideHours { opening: NaiveTime, closing: NaiveTime },
    TooLong { max_minutes: u32 },
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedReason::NoOperatingHours { weekday } => {
                write!(f, "outside operating hours (no hours set for weekday {weekday})")
            }
            ClosedReason::Holiday { date, reason } => match reason {
                Some(r) => write!(f, "holiday on {date}: {r}"),
                None => write!(f, "holiday on {date}"),
            },
            ClosedReason::OutsideHours { opening, closing } => write!(
                f,
                "outside operating hours {}-{}",
                opening.format("%H:%M"),
                closing.format("%H:%M")
            ),
            ClosedReason::TooLong { max_minutes } => {
                write!(f, "longer than the {max_minutes} minute daily maximum")
            }
        }
    }
}

/// 0 = Sunday .. 6 = Saturday.
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Minutes since midnight, seconds truncated.
fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Resolve the opening window for `date`.
///
/// The weekday entry must exist; an active exception on the date then either
/// closes the room for the day or replaces the weekday times.
pub fn effective_hours(rs: &RoomState, date: NaiveDate) -> Result<EffectiveHours, ClosedReason> {
    let weekday = weekday_of(date);
    let hour = rs
        .active_hour(weekday)
        .ok_or(ClosedReason::NoOperatingHours { weekday })?;

    let mut hours = EffectiveHours {
        opening: hour.opening,
        closing: hour.closing,
        max_duration_minutes: hour.max_duration_minutes,
        special: false,
    };

    if let Some(exception) = rs.active_exception(date) {
        match exception.override_hours() {
            Some((opening, closing)) => {
                hours.opening = opening;
                hours.closing = closing;
                hours.special = true;
            }
            None => {
                return Err(ClosedReason::Holiday {
                    date,
                    reason: exception.reason.clone(),
                });
            }
        }
    }

    Ok(hours)
}

/// Whether `[start, end)` fits the room's effective window on the start date.
/// Clock times are compared at minute granularity, inclusive on both ends.
/// Callers reject windows that cross midnight before getting here.
pub fn is_open(
    rs: &RoomState,
    start: &DateTime<FixedOffset>,
    end: &DateTime<FixedOffset>,
) -> Result<EffectiveHours, ClosedReason> {
    let hours = effective_hours(rs, start.date_naive())?;
    let end = end.with_timezone(start.offset());

    let from = minute_of_day(start.time());
    let to = minute_of_day(end.time());
    if from < minute_of_day(hours.opening) || to > minute_of_day(hours.closing) {
        return Err(ClosedReason::OutsideHours {
            opening: hours.opening,
            closing: hours.closing,
        });
    }

    if let Some(max_minutes) = hours.max_duration_minutes {
        let minutes = (end - *start).num_minutes();
        if minutes > i64::from(max_minutes) {
            return Err(ClosedReason::TooLong { max_minutes });
        }
    }

    Ok(hours)
}
