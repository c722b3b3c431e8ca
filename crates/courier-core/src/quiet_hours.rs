//! Quiet hours: a daily do-not-disturb window and the queue of requests
//! deferred while it is in effect.
//!
//! The window is given as local `HH:MM` start and end. When start is later
//! than end the window wraps past midnight and belongs to the weekday on
//! which it started, so 22:00–08:00 on Friday covers Saturday 03:00 as well.
//! Equal start and end describe an empty window.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{local_to_utc, TimeSource};
use crate::error::ConfigError;
use crate::request::{InterruptionLevel, NotificationRequest};
use crate::storage::StateSlot;

/// Wall-clock time of day with minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ConfigError> {
        if hour > 23 || minute > 59 {
            return Err(ConfigError::InvalidTimeOfDay(format!("{hour}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    /// Minutes since midnight.
    pub fn minute_of_day(self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }

    fn as_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTimeOfDay(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str, max_len: usize| {
            !part.is_empty() && part.len() <= max_len && part.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(hour, 2) || !digits(minute, 2) || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Quiet hours settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    /// Weekdays on which the window applies (None = every day)
    #[serde(default)]
    pub active_weekdays: Option<Vec<Weekday>>,
    /// Let `critical` requests through
    #[serde(default = "default_true")]
    pub allow_critical: bool,
    /// Let `time_sensitive` requests through
    #[serde(default)]
    pub allow_time_sensitive: bool,
}

fn default_true() -> bool {
    true
}

impl QuietHoursConfig {
    /// Window applying every day with default bypass rules.
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self {
            enabled: true,
            start,
            end,
            active_weekdays: None,
            allow_critical: true,
            allow_time_sensitive: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(&self.active_weekdays, Some(days) if days.is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "quiet_hours.active_weekdays".into(),
                message: "must not be empty; omit it to apply every day".into(),
            });
        }
        Ok(())
    }

    fn applies_on(&self, weekday: Weekday) -> bool {
        self.active_weekdays
            .as_ref()
            .map_or(true, |days| days.contains(&weekday))
    }

    fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }
}

/// Whether deliveries currently proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuietState {
    Open,
    Quiet,
}

/// A request parked while quiet hours were active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRequest {
    pub request: NotificationRequest,
    pub deferred_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeferredSnapshot {
    deferred: VecDeque<DeferredRequest>,
}

/// Quiet-hours suppression plus the FIFO of deferred requests.
pub struct QuietHoursPolicy {
    config: Option<QuietHoursConfig>,
    clock: Arc<dyn TimeSource>,
    slot: StateSlot,
    state: Mutex<DeferredSnapshot>,
}

impl QuietHoursPolicy {
    /// Create a policy. `None` (or a disabled config) never goes quiet but
    /// still honors bypass flags and holds a queue.
    pub fn new(
        config: Option<QuietHoursConfig>,
        clock: Arc<dyn TimeSource>,
        slot: StateSlot,
    ) -> Result<Self, ConfigError> {
        if let Some(config) = &config {
            config.validate()?;
        }
        let state = slot.load::<DeferredSnapshot>().unwrap_or_default();
        if !state.deferred.is_empty() {
            tracing::info!(pending = state.deferred.len(), "restored deferred notifications");
        }
        Ok(Self {
            config,
            clock,
            slot,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> Option<&QuietHoursConfig> {
        self.config.as_ref()
    }

    fn active_config(&self) -> Option<&QuietHoursConfig> {
        self.config
            .as_ref()
            .filter(|c| c.enabled && c.start != c.end)
    }

    /// Whether quiet hours are in effect right now.
    pub fn is_active_now(&self) -> bool {
        self.is_active_at(self.clock.now())
    }

    pub fn state(&self) -> QuietState {
        if self.is_active_now() {
            QuietState::Quiet
        } else {
            QuietState::Open
        }
    }

    /// Whether quiet hours are in effect at `at`.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        let Some(config) = self.active_config() else {
            return false;
        };
        let local = at.with_timezone(&self.clock.offset());
        let minute = local.hour() * 60 + local.minute();
        let (start, end) = (config.start.minute_of_day(), config.end.minute_of_day());

        if config.wraps_midnight() {
            if minute >= start {
                config.applies_on(local.weekday())
            } else if minute < end {
                config.applies_on(local.weekday().pred())
            } else {
                false
            }
        } else {
            minute >= start && minute < end && config.applies_on(local.weekday())
        }
    }

    /// Time left until the current window closes; `None` when not quiet.
    pub fn time_until_window_end(&self) -> Option<Duration> {
        let now = self.clock.now();
        if !self.is_active_at(now) {
            return None;
        }
        let config = self.active_config()?;
        let offset = self.clock.offset();
        let local = now.with_timezone(&offset);
        let today = local.date_naive();
        let minute = local.hour() * 60 + local.minute();

        let end_date = if config.wraps_midnight() && minute >= config.start.minute_of_day() {
            today.succ_opt()?
        } else {
            today
        };
        let end = local_to_utc(offset, end_date.and_time(config.end.as_naive()));
        Some((end - now).max(Duration::zero()))
    }

    /// Next instant a window opens, strictly after now.
    pub fn next_window_start(&self) -> Option<DateTime<Utc>> {
        let config = self.active_config()?;
        let now = self.clock.now();
        let offset = self.clock.offset();
        let today = now.with_timezone(&offset).date_naive();

        (0..=7)
            .filter_map(|days| today.checked_add_signed(Duration::days(days)))
            .filter(|date: &NaiveDate| config.applies_on(date.weekday()))
            .map(|date| local_to_utc(offset, date.and_time(config.start.as_naive())))
            .find(|start| *start > now)
    }

    /// Whether `request` goes through regardless of quiet hours.
    pub fn should_bypass(&self, request: &NotificationRequest) -> bool {
        if request.bypass_quiet_hours {
            return true;
        }
        let (allow_critical, allow_time_sensitive) = self
            .config
            .as_ref()
            .map_or((true, false), |c| (c.allow_critical, c.allow_time_sensitive));
        match request.interruption_level {
            InterruptionLevel::Critical => allow_critical,
            InterruptionLevel::TimeSensitive => allow_time_sensitive,
            InterruptionLevel::Passive | InterruptionLevel::Active => false,
        }
    }

    /// Parks `request` at the back of the queue. Returns the queue length.
    pub fn defer(&self, request: NotificationRequest) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        tracing::debug!(request_id = %request.id, "deferring notification");
        state.deferred.push_back(DeferredRequest {
            request,
            deferred_at: now,
        });
        self.slot.save(&*state);
        state.deferred.len()
    }

    /// Removes and returns every deferred request in submission order.
    pub fn drain_deferred(&self) -> Vec<NotificationRequest> {
        self.take_deferred().into_iter().map(|d| d.request).collect()
    }

    /// Like [`drain_deferred`](Self::drain_deferred) but keeps the deferral
    /// timestamps, so entries can be put back with
    /// [`requeue_front`](Self::requeue_front).
    pub fn take_deferred(&self) -> Vec<DeferredRequest> {
        let mut state = self.lock();
        if state.deferred.is_empty() {
            return Vec::new();
        }
        let drained: Vec<_> = std::mem::take(&mut state.deferred).into();
        self.slot.save(&*state);
        tracing::debug!(count = drained.len(), "drained deferred notifications");
        drained
    }

    /// Puts `entries` back at the head of the queue, keeping their order
    /// ahead of anything deferred since they were taken.
    pub fn requeue_front(&self, entries: Vec<DeferredRequest>) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.lock();
        tracing::debug!(count = entries.len(), "requeued deferred notifications");
        for entry in entries.into_iter().rev() {
            state.deferred.push_front(entry);
        }
        self.slot.save(&*state);
    }

    /// Number of requests waiting.
    pub fn pending_count(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Copy of the queue, oldest first.
    pub fn pending(&self) -> Vec<DeferredRequest> {
        self.lock().deferred.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, DeferredSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{FixedOffset, TimeZone};
    use proptest::prelude::*;

    // 2026-03-02 is a Monday.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn overnight() -> QuietHoursConfig {
        QuietHoursConfig::new("22:00".parse().unwrap(), "08:00".parse().unwrap())
    }

    fn policy(config: Option<QuietHoursConfig>, now: DateTime<Utc>) -> (Arc<ManualClock>, QuietHoursPolicy) {
        let clock = Arc::new(ManualClock::new(now));
        let policy =
            QuietHoursPolicy::new(config, clock.clone(), StateSlot::detached("courier.quiet_hours"))
                .unwrap();
        (clock, policy)
    }

    #[test]
    fn parses_time_of_day() {
        assert_eq!("22:00".parse::<TimeOfDay>().unwrap(), TimeOfDay::new(22, 0).unwrap());
        assert_eq!("7:05".parse::<TimeOfDay>().unwrap().minute_of_day(), 425);
        for bad in ["24:00", "12:60", "12", "12:5", "ab:cd", "-1:00", "12:000", ""] {
            assert!(
                matches!(bad.parse::<TimeOfDay>(), Err(ConfigError::InvalidTimeOfDay(_))),
                "{bad} should be rejected"
            );
        }
        assert_eq!(TimeOfDay::new(8, 5).unwrap().to_string(), "08:05");
    }

    #[test]
    fn overnight_window_spans_midnight() {
        let (clock, policy) = policy(Some(overnight()), at(2, 23, 30));
        assert!(policy.is_active_now());
        clock.set(at(3, 3, 0));
        assert!(policy.is_active_now());
        clock.set(at(3, 12, 0));
        assert!(!policy.is_active_now());
        assert_eq!(policy.state(), QuietState::Open);
        clock.set(at(3, 8, 0));
        assert!(!policy.is_active_now());
        clock.set(at(3, 22, 0));
        assert_eq!(policy.state(), QuietState::Quiet);
    }

    #[test]
    fn daytime_window_is_a_plain_range() {
        let config = QuietHoursConfig::new("12:00".parse().unwrap(), "13:30".parse().unwrap());
        let (clock, policy) = policy(Some(config), at(2, 12, 0));
        assert!(policy.is_active_now());
        clock.set(at(2, 13, 29));
        assert!(policy.is_active_now());
        clock.set(at(2, 13, 30));
        assert!(!policy.is_active_now());
        clock.set(at(2, 11, 59));
        assert!(!policy.is_active_now());
    }

    #[test]
    fn equal_start_and_end_never_activates() {
        let config = QuietHoursConfig::new("09:00".parse().unwrap(), "09:00".parse().unwrap());
        let (_, policy) = policy(Some(config), at(2, 9, 0));
        assert!(!policy.is_active_now());
        assert!(policy.next_window_start().is_none());
    }

    #[test]
    fn weekday_filter_uses_start_day_for_overnight_part() {
        let mut config = overnight();
        config.active_weekdays = Some(vec![Weekday::Fri]);
        // Friday 2026-03-06 23:00 and Saturday 03:00 are both inside.
        let (clock, policy) = policy(Some(config), at(6, 23, 0));
        assert!(policy.is_active_now());
        clock.set(at(7, 3, 0));
        assert!(policy.is_active_now());
        // Saturday night is not.
        clock.set(at(7, 23, 0));
        assert!(!policy.is_active_now());
        // Friday 03:00 belongs to Thursday's window.
        clock.set(at(6, 3, 0));
        assert!(!policy.is_active_now());
    }

    #[test]
    fn time_until_window_end_handles_wrap() {
        let (clock, policy) = policy(Some(overnight()), at(2, 23, 0));
        assert_eq!(policy.time_until_window_end(), Some(Duration::hours(9)));
        clock.set(at(3, 7, 30));
        assert_eq!(policy.time_until_window_end(), Some(Duration::minutes(30)));
        clock.set(at(3, 12, 0));
        assert_eq!(policy.time_until_window_end(), None);
    }

    #[test]
    fn next_window_start_skips_inactive_days() {
        let mut config = overnight();
        config.active_weekdays = Some(vec![Weekday::Wed]);
        let (clock, policy) = policy(Some(config), at(2, 12, 0));
        assert_eq!(policy.next_window_start(), Some(at(4, 22, 0)));
        clock.set(at(4, 22, 30));
        assert_eq!(policy.next_window_start(), Some(at(11, 22, 0)));
    }

    #[test]
    fn offset_shifts_the_window() {
        // 21:30 UTC is 23:30 at +02:00.
        let clock = Arc::new(ManualClock::with_offset(
            at(2, 21, 30),
            FixedOffset::east_opt(2 * 3600).unwrap(),
        ));
        let policy = QuietHoursPolicy::new(Some(overnight()), clock, StateSlot::detached("k")).unwrap();
        assert!(policy.is_active_now());
    }

    #[test]
    fn bypass_rules() {
        let (_, quiet) = policy(Some(overnight()), at(2, 23, 0));
        let plain = NotificationRequest::new("n", "t", "b");
        assert!(!quiet.should_bypass(&plain));
        assert!(quiet.should_bypass(&plain.clone().with_bypass_quiet_hours(true)));
        assert!(quiet.should_bypass(
            &plain.clone().with_interruption_level(InterruptionLevel::Critical)
        ));
        assert!(!quiet.should_bypass(
            &plain.clone().with_interruption_level(InterruptionLevel::TimeSensitive)
        ));

        let mut config = overnight();
        config.allow_critical = false;
        config.allow_time_sensitive = true;
        let (_, strict) = policy(Some(config), at(2, 23, 0));
        assert!(!strict.should_bypass(
            &plain.clone().with_interruption_level(InterruptionLevel::Critical)
        ));
        assert!(strict.should_bypass(
            &plain.with_interruption_level(InterruptionLevel::TimeSensitive)
        ));
    }

    #[test]
    fn disabled_policy_is_always_open() {
        let mut config = overnight();
        config.enabled = false;
        let (_, policy) = policy(Some(config), at(2, 23, 0));
        assert!(!policy.is_active_now());
        let (_, none) = self::policy(None, at(2, 23, 0));
        assert!(!none.is_active_now());
        assert!(none.next_window_start().is_none());
    }

    #[test]
    fn empty_weekday_list_is_rejected() {
        let mut config = overnight();
        config.active_weekdays = Some(Vec::new());
        let clock = Arc::new(ManualClock::new(at(2, 12, 0)));
        assert!(QuietHoursPolicy::new(Some(config), clock, StateSlot::detached("k")).is_err());
    }

    #[test]
    fn drain_is_fifo_and_idempotent() {
        let (_, policy) = policy(Some(overnight()), at(2, 23, 0));
        for i in 0..5 {
            policy.defer(NotificationRequest::new(format!("n-{i}"), "t", "b"));
        }
        assert_eq!(policy.pending_count(), 5);
        let ids: Vec<_> = policy.drain_deferred().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["n-0", "n-1", "n-2", "n-3", "n-4"]);
        assert!(policy.drain_deferred().is_empty());
        policy.defer(NotificationRequest::new("n-5", "t", "b"));
        assert_eq!(policy.drain_deferred().len(), 1);
    }

    #[test]
    fn requeued_entries_go_back_ahead_of_newer_ones() {
        let (clock, policy) = policy(Some(overnight()), at(2, 23, 0));
        for id in ["a", "b", "c"] {
            policy.defer(NotificationRequest::new(id, "t", "b"));
        }
        let mut taken = policy.take_deferred();
        assert_eq!(policy.pending_count(), 0);

        clock.set(at(2, 23, 30));
        policy.defer(NotificationRequest::new("d", "t", "b"));
        taken.remove(0);
        policy.requeue_front(taken);

        let pending = policy.pending();
        let ids: Vec<_> = pending.iter().map(|d| d.request.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
        assert_eq!(pending[0].deferred_at, at(2, 23, 0));
    }

    #[test]
    fn deferred_queue_survives_restart() {
        let clock = Arc::new(ManualClock::new(at(2, 23, 0)));
        let slot = StateSlot::detached("courier.quiet_hours");
        let first = QuietHoursPolicy::new(Some(overnight()), clock.clone(), slot.clone()).unwrap();
        first.defer(NotificationRequest::new("a", "t", "b"));
        first.defer(NotificationRequest::new("b", "t", "b"));
        drop(first);

        let second = QuietHoursPolicy::new(Some(overnight()), clock, slot).unwrap();
        let pending = second.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].request.id, "a");
        assert_eq!(pending[0].deferred_at, at(2, 23, 0));
    }

    #[test]
    fn time_of_day_deserializes_from_string() {
        let config: QuietHoursConfig =
            serde_json::from_str(r#"{"start":"22:00","end":"07:30"}"#).unwrap();
        assert!(config.enabled);
        assert!(config.allow_critical);
        assert!(!config.allow_time_sensitive);
        assert_eq!(config.end, TimeOfDay::new(7, 30).unwrap());
        assert!(serde_json::from_str::<QuietHoursConfig>(r#"{"start":"25:00","end":"07:30"}"#).is_err());
    }

    proptest! {
        #[test]
        fn prop_overnight_membership(minute_of_day in 0u32..1440, start_h in 13u8..24, end_h in 0u8..12) {
            let config = QuietHoursConfig::new(
                TimeOfDay::new(start_h, 0).unwrap(),
                TimeOfDay::new(end_h, 0).unwrap(),
            );
            let now = at(2, 0, 0) + Duration::minutes(i64::from(minute_of_day));
            let (_, policy) = policy(Some(config), now);
            let expected = minute_of_day >= u32::from(start_h) * 60 || minute_of_day < u32::from(end_h) * 60;
            prop_assert_eq!(policy.is_active_now(), expected);
        }
    }
}
