//! Injected time source.
//!
//! Every component reads the current instant through [`TimeSource`] so the
//! engine stays deterministic under test. Local decomposition (hour of day,
//! weekday, calendar day) uses a fixed UTC offset supplied by the source.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone,
    Timelike, Utc, Weekday,
};
use std::sync::{Mutex, PoisonError};

/// Supplies the current time and its local decomposition.
pub trait TimeSource: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Offset used to decompose instants into local hour/day.
    fn offset(&self) -> FixedOffset;

    /// Current instant in local time.
    fn local_now(&self) -> DateTime<FixedOffset> {
        self.now().with_timezone(&self.offset())
    }

    /// Local hour of day (0-23) of an instant.
    fn hour_of(&self, at: DateTime<Utc>) -> u8 {
        at.with_timezone(&self.offset()).hour() as u8
    }

    /// Local day of week (1-7, Sunday = 1) of an instant.
    fn day_of_week_of(&self, at: DateTime<Utc>) -> u8 {
        day_number(at.with_timezone(&self.offset()).weekday())
    }
}

/// Day number with Sunday = 1 through Saturday = 7.
pub fn day_number(weekday: Weekday) -> u8 {
    weekday.number_from_sunday() as u8
}

/// Inverse of [`day_number`]; `None` outside 1-7.
pub fn weekday_from_number(day: u8) -> Option<Weekday> {
    match day {
        1 => Some(Weekday::Sun),
        2 => Some(Weekday::Mon),
        3 => Some(Weekday::Tue),
        4 => Some(Weekday::Wed),
        5 => Some(Weekday::Thu),
        6 => Some(Weekday::Fri),
        7 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Converts a local wall-clock time in `offset` to UTC.
pub fn local_to_utc(offset: FixedOffset, local: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(offset.local_minus_utc()))))
}

/// UTC instant of local midnight starting `date`.
pub fn start_of_local_day(offset: FixedOffset, date: NaiveDate) -> DateTime<Utc> {
    local_to_utc(offset, date.and_time(NaiveTime::MIN))
}

/// Wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Wall clock decomposed in UTC.
    pub fn utc() -> Self {
        Self {
            offset: utc_offset(),
        }
    }

    /// Wall clock decomposed in the given offset.
    pub fn with_offset(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    /// Clock frozen at `now`, decomposed in UTC.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_offset(now, utc_offset())
    }

    /// Clock frozen at `now`, decomposed in `offset`.
    pub fn with_offset(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    /// Move the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}
