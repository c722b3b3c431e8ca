//! Delivery timing optimizer.
//!
//! Scores each local hour and weekday by the share of engaged (not
//! dismissed) interactions recorded in it, and turns those scores into an
//! optimal send time, a heatmap and recommendations.
//!
//! Small samples give unstable rates, so a bucket only counts once it holds
//! `min_samples_per_bucket` records, and nothing is data-derived until the
//! history holds `min_total_samples`. Below either gate the optimizer
//! answers with the neutral score and the configured defaults.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{local_to_utc, start_of_local_day, weekday_from_number, TimeSource};
use crate::engagement::{BucketStats, EngagementRecord, EngagementStore, InteractionType};
use crate::error::{ConfigError, ValidationError};
use crate::storage::StateSlot;

/// Score reported for buckets without enough data.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Optimizer thresholds and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Records a single hour or weekday bucket needs before it is trusted
    #[serde(default = "default_min_samples_per_bucket")]
    pub min_samples_per_bucket: u32,
    /// Records the whole history needs before any estimate is made
    #[serde(default = "default_min_total_samples")]
    pub min_total_samples: usize,
    /// Records retained; oldest are evicted first
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Hour returned while under-sampled (0-23)
    #[serde(default = "default_hour")]
    pub default_hour: u8,
    /// Weekday returned while under-sampled (1-7, Sunday = 1)
    #[serde(default = "default_day_of_week")]
    pub default_day_of_week: u8,
    /// Hours scoring below this are flagged to avoid
    #[serde(default = "default_low_engagement_threshold")]
    pub low_engagement_threshold: f64,
    /// More records than this on one local day triggers a frequency warning
    #[serde(default = "default_daily_threshold")]
    pub daily_threshold: usize,
}

fn default_min_samples_per_bucket() -> u32 {
    3
}
fn default_min_total_samples() -> usize {
    10
}
fn default_max_history() -> usize {
    1000
}
fn default_hour() -> u8 {
    10
}
fn default_day_of_week() -> u8 {
    3
}
fn default_low_engagement_threshold() -> f64 {
    0.3
}
fn default_daily_threshold() -> usize {
    5
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_samples_per_bucket: default_min_samples_per_bucket(),
            min_total_samples: default_min_total_samples(),
            max_history: default_max_history(),
            default_hour: default_hour(),
            default_day_of_week: default_day_of_week(),
            low_engagement_threshold: default_low_engagement_threshold(),
            daily_threshold: default_daily_threshold(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: format!("optimizer.{key}"),
            message: message.to_string(),
        };
        if self.default_hour > 23 {
            return Err(invalid("default_hour", "must be 0-23"));
        }
        if !(1..=7).contains(&self.default_day_of_week) {
            return Err(invalid("default_day_of_week", "must be 1-7 (Sunday = 1)"));
        }
        if self.max_history == 0 {
            return Err(invalid("max_history", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.low_engagement_threshold) {
            return Err(invalid("low_engagement_threshold", "must be within 0.0-1.0"));
        }
        Ok(())
    }
}

/// Kind of recommendation, with the data behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecommendationKind {
    /// Send at this local hour
    SendAtHour { hour: u8, score: f64 },
    /// Prefer this weekday
    PreferDay { day_of_week: u8, score: f64 },
    /// Hours with poor engagement
    AvoidHours { hours: Vec<u8> },
    /// Too many notifications today
    ReduceFrequency { today_count: usize, threshold: usize },
    /// History too small for estimates
    CollectMoreData { samples: usize, required: usize },
}

/// A scheduling recommendation derived from engagement history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    /// Human-readable title
    pub title: String,
    /// Detailed description
    pub description: String,
    /// Priority (1-3, 1 being highest)
    pub priority: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngagementSnapshot {
    records: Vec<EngagementRecord>,
}

/// Engagement-driven send-time optimizer.
pub struct DeliveryOptimizer {
    config: OptimizerConfig,
    clock: Arc<dyn TimeSource>,
    slot: StateSlot,
    store: Mutex<EngagementStore>,
}

impl DeliveryOptimizer {
    pub fn new(
        config: OptimizerConfig,
        clock: Arc<dyn TimeSource>,
        slot: StateSlot,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let snapshot = slot.load::<EngagementSnapshot>().unwrap_or_default();
        let store = EngagementStore::from_records(config.max_history, snapshot.records);
        tracing::debug!(records = store.len(), "engagement history restored");
        Ok(Self {
            config,
            clock,
            slot,
            store: Mutex::new(store),
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Appends `record` to the history and persists it.
    pub fn record_engagement(&self, record: EngagementRecord) {
        let mut store = self.lock();
        store.append(record);
        let snapshot = EngagementSnapshot {
            records: store.records().cloned().collect(),
        };
        self.slot.save(&snapshot);
    }

    /// Records an interaction observed now.
    pub fn record_interaction(
        &self,
        request_id: &str,
        interaction: InteractionType,
        response_time: Option<std::time::Duration>,
    ) -> Result<EngagementRecord, ValidationError> {
        let mut record =
            EngagementRecord::observed(request_id, self.clock.now(), interaction, self.clock.as_ref())?;
        record.response_time = response_time;
        self.record_engagement(record.clone());
        Ok(record)
    }

    /// Records currently retained.
    pub fn history_len(&self) -> usize {
        self.lock().len()
    }

    /// Drops the whole history.
    pub fn clear_history(&self) {
        let mut store = self.lock();
        store.clear();
        self.slot.save(&EngagementSnapshot::default());
        tracing::info!("engagement history cleared");
    }

    /// Best local hour to send, or the default while under-sampled.
    pub fn optimal_hour(&self) -> u8 {
        let store = self.lock();
        if !self.has_enough_history(&store) {
            return self.config.default_hour;
        }
        self.argmax(&store.by_hour())
            .map_or(self.config.default_hour, |(index, _)| index as u8)
    }

    /// Best weekday (1-7, Sunday = 1), or the default while under-sampled.
    pub fn optimal_day_of_week(&self) -> u8 {
        let store = self.lock();
        if !self.has_enough_history(&store) {
            return self.config.default_day_of_week;
        }
        self.argmax(&store.by_day())
            .map_or(self.config.default_day_of_week, |(index, _)| index as u8 + 1)
    }

    /// Expected engagement for sending at `hour` on `day_of_week`, within
    /// 0.0-1.0. Mean of the hour and weekday bucket scores, each neutral
    /// when under-sampled.
    pub fn score_for_time(&self, hour: u8, day_of_week: u8) -> f64 {
        let store = self.lock();
        if !self.has_enough_history(&store) {
            return NEUTRAL_SCORE;
        }
        let hour_score = store
            .by_hour()
            .get(usize::from(hour))
            .and_then(|b| self.bucket_score(b))
            .unwrap_or(NEUTRAL_SCORE);
        let day_score = usize::from(day_of_week)
            .checked_sub(1)
            .and_then(|index| store.by_day().get(index).copied())
            .and_then(|b| self.bucket_score(&b))
            .unwrap_or(NEUTRAL_SCORE);
        ((hour_score + day_score) / 2.0).clamp(0.0, 1.0)
    }

    /// Score of every hour with enough samples. Empty while the history is
    /// under-sampled.
    pub fn engagement_heatmap(&self) -> BTreeMap<u8, f64> {
        let store = self.lock();
        if !self.has_enough_history(&store) {
            return BTreeMap::new();
        }
        self.eligible(&store.by_hour())
            .map(|(index, score)| (index as u8, score))
            .collect()
    }

    /// Score of every weekday (1-7) with enough samples.
    pub fn day_heatmap(&self) -> BTreeMap<u8, f64> {
        let store = self.lock();
        if !self.has_enough_history(&store) {
            return BTreeMap::new();
        }
        self.eligible(&store.by_day())
            .map(|(index, score)| (index as u8 + 1, score))
            .collect()
    }

    /// Engaged share over the whole history.
    pub fn overall_engagement_rate(&self) -> Option<f64> {
        self.lock().overall().rate()
    }

    /// Mean response time over records that carry one.
    pub fn average_response_time(&self) -> Option<std::time::Duration> {
        self.lock().average_response_time()
    }

    /// Next instant, strictly after now, at the top of the optimal hour.
    pub fn suggested_delivery_time(&self) -> DateTime<Utc> {
        let hour = self.optimal_hour();
        let now = self.clock.now();
        let offset = self.clock.offset();
        let local = now.with_timezone(&offset);
        let today_at = local
            .date_naive()
            .and_hms_opt(u32::from(hour), 0, 0)
            .map(|naive| local_to_utc(offset, naive));
        match today_at {
            Some(at) if at > now => at,
            Some(at) => at + Duration::days(1),
            None => now + Duration::days(1),
        }
    }

    /// Scheduling recommendations, most urgent first.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let store = self.lock();
        let mut recommendations = Vec::new();

        let now = self.clock.now();
        let offset = self.clock.offset();
        let day_start = start_of_local_day(offset, now.with_timezone(&offset).date_naive());
        let today_count = store.count_between(day_start, day_start + Duration::days(1));
        if today_count > self.config.daily_threshold {
            recommendations.push(Recommendation {
                kind: RecommendationKind::ReduceFrequency {
                    today_count,
                    threshold: self.config.daily_threshold,
                },
                title: "Reduce Notification Frequency".to_string(),
                description: format!(
                    "{} notifications recorded today, above the daily threshold of {}.",
                    today_count, self.config.daily_threshold
                ),
                priority: 1,
            });
        }

        if !self.has_enough_history(&store) {
            recommendations.push(Recommendation {
                kind: RecommendationKind::CollectMoreData {
                    samples: store.len(),
                    required: self.config.min_total_samples,
                },
                title: "Collect More Engagement Data".to_string(),
                description: format!(
                    "{} of {} interactions recorded; timing estimates use defaults until then.",
                    store.len(),
                    self.config.min_total_samples
                ),
                priority: 3,
            });
            recommendations.sort_by_key(|r| r.priority);
            return recommendations;
        }

        let hours = store.by_hour();
        let avoid: Vec<u8> = self
            .eligible(&hours)
            .filter(|(_, score)| *score < self.config.low_engagement_threshold)
            .map(|(index, _)| index as u8)
            .collect();
        if !avoid.is_empty() {
            let listed = avoid
                .iter()
                .map(|h| format!("{h:02}:00"))
                .collect::<Vec<_>>()
                .join(", ");
            recommendations.push(Recommendation {
                kind: RecommendationKind::AvoidHours { hours: avoid },
                title: "Avoid Low-Engagement Hours".to_string(),
                description: format!(
                    "Engagement below {:.0}% at {}.",
                    self.config.low_engagement_threshold * 100.0,
                    listed
                ),
                priority: 1,
            });
        }

        if let Some((index, score)) = self.argmax(&hours) {
            recommendations.push(Recommendation {
                kind: RecommendationKind::SendAtHour {
                    hour: index as u8,
                    score,
                },
                title: "Best Time to Send".to_string(),
                description: format!(
                    "Notifications sent around {:02}:00 are engaged with {:.0}% of the time.",
                    index,
                    score * 100.0
                ),
                priority: 2,
            });
        }

        if let Some((index, score)) = self.argmax(&store.by_day()) {
            let day_of_week = index as u8 + 1;
            let day_name = weekday_from_number(day_of_week)
                .map_or_else(|| day_of_week.to_string(), |d| d.to_string());
            recommendations.push(Recommendation {
                kind: RecommendationKind::PreferDay { day_of_week, score },
                title: "Best Day to Send".to_string(),
                description: format!(
                    "{} has the highest engagement ({:.0}%).",
                    day_name,
                    score * 100.0
                ),
                priority: 3,
            });
        }

        recommendations.sort_by_key(|r| r.priority);
        recommendations
    }

    fn lock(&self) -> MutexGuard<'_, EngagementStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_enough_history(&self, store: &EngagementStore) -> bool {
        store.len() >= self.config.min_total_samples
    }

    fn bucket_score(&self, bucket: &BucketStats) -> Option<f64> {
        if bucket.total < self.config.min_samples_per_bucket {
            return None;
        }
        bucket.rate()
    }

    fn eligible<'a>(&'a self, buckets: &'a [BucketStats]) -> impl Iterator<Item = (usize, f64)> + 'a {
        buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| self.bucket_score(bucket).map(|score| (index, score)))
    }

    /// Highest-scoring eligible bucket; ties go to the lowest index.
    fn argmax(&self, buckets: &[BucketStats]) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (index, score) in self.eligible(buckets) {
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((index, score));
            }
        }
        best
    }
}
