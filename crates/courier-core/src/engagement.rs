//! Engagement log.
//!
//! Append-only, bounded history of how users reacted to delivered
//! notifications. Oldest records are evicted first once the capacity is
//! reached. The log only feeds read-side aggregation in
//! [`crate::optimizer`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::TimeSource;
use crate::error::ValidationError;

/// How the user reacted to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Opened,
    Actioned,
    Replied,
    Dismissed,
    Expired,
}

impl InteractionType {
    /// Counts towards the engagement score. Everything except an explicit
    /// dismissal does.
    pub fn is_engaged(self) -> bool {
        !matches!(self, InteractionType::Dismissed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InteractionType::Opened => "opened",
            InteractionType::Actioned => "actioned",
            InteractionType::Replied => "replied",
            InteractionType::Dismissed => "dismissed",
            InteractionType::Expired => "expired",
        }
    }
}

/// One observed interaction. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Local hour, 0-23
    pub hour_of_day: u8,
    /// Local weekday, 1-7 with Sunday = 1
    pub day_of_week: u8,
    pub interaction: InteractionType,
    /// Time between delivery and the interaction
    #[serde(default)]
    pub response_time: Option<Duration>,
}

impl EngagementRecord {
    /// Record with explicit buckets.
    pub fn new(
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        hour_of_day: u8,
        day_of_week: u8,
        interaction: InteractionType,
    ) -> Result<Self, ValidationError> {
        let request_id = request_id.into();
        if request_id.is_empty() {
            return Err(ValidationError::EmptyId("request_id"));
        }
        if hour_of_day > 23 {
            return Err(ValidationError::HourOutOfRange(hour_of_day));
        }
        if !(1..=7).contains(&day_of_week) {
            return Err(ValidationError::DayOutOfRange(day_of_week));
        }
        Ok(Self {
            request_id,
            timestamp,
            hour_of_day,
            day_of_week,
            interaction,
            response_time: None,
        })
    }

    /// Record whose buckets are derived from `timestamp` in the clock's
    /// local offset.
    pub fn observed(
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        interaction: InteractionType,
        clock: &dyn TimeSource,
    ) -> Result<Self, ValidationError> {
        Self::new(
            request_id,
            timestamp,
            clock.hour_of(timestamp),
            clock.day_of_week_of(timestamp),
            interaction,
        )
    }

    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = Some(response_time);
        self
    }
}

/// Engagement counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub total: u32,
    pub engaged: u32,
}

impl BucketStats {
    fn add(&mut self, record: &EngagementRecord) {
        self.total += 1;
        if record.interaction.is_engaged() {
            self.engaged += 1;
        }
    }

    /// Engaged share of the bucket, `None` when empty.
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| f64::from(self.engaged) / f64::from(self.total))
    }
}

/// Bounded ring of engagement records, oldest first.
#[derive(Debug, Clone)]
pub struct EngagementStore {
    capacity: usize,
    records: VecDeque<EngagementRecord>,
}

impl EngagementStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    /// Store seeded with `records`, keeping only the newest `capacity`.
    pub fn from_records(capacity: usize, records: impl IntoIterator<Item = EngagementRecord>) -> Self {
        let mut store = Self::new(capacity);
        for record in records {
            store.append(record);
        }
        store
    }

    /// Appends a record, evicting the oldest on overflow.
    pub fn append(&mut self, record: EngagementRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn records(&self) -> impl Iterator<Item = &EngagementRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Per-hour buckets, index = hour of day.
    pub fn by_hour(&self) -> [BucketStats; 24] {
        let mut buckets = [BucketStats::default(); 24];
        for record in &self.records {
            if let Some(bucket) = buckets.get_mut(usize::from(record.hour_of_day)) {
                bucket.add(record);
            }
        }
        buckets
    }

    /// Per-weekday buckets, index = day_of_week - 1.
    pub fn by_day(&self) -> [BucketStats; 7] {
        let mut buckets = [BucketStats::default(); 7];
        for record in &self.records {
            let index = usize::from(record.day_of_week).wrapping_sub(1);
            if let Some(bucket) = buckets.get_mut(index) {
                bucket.add(record);
            }
        }
        buckets
    }

    /// Totals over the whole history.
    pub fn overall(&self) -> BucketStats {
        let mut stats = BucketStats::default();
        for record in &self.records {
            stats.add(record);
        }
        stats
    }

    /// Records with `start <= timestamp < end`.
    pub fn count_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .count()
    }

    /// Mean response time over records that carry one.
    pub fn average_response_time(&self) -> Option<Duration> {
        // Summed in nanoseconds so huge samples cannot overflow.
        let (total, count) = self
            .records
            .iter()
            .filter_map(|r| r.response_time)
            .fold((0u128, 0u128), |(total, count), t| (total + t.as_nanos(), count + 1));
        if count == 0 {
            return None;
        }
        let mean = total / count;
        let secs = u64::try_from(mean / 1_000_000_000).unwrap_or(u64::MAX);
        Some(Duration::new(secs, (mean % 1_000_000_000) as u32))
    }
}
