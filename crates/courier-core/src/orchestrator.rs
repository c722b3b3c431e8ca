//! The delivery decision pipeline.
//!
//! [`DeliveryOrchestrator::submit`] runs every request through a fixed
//! sequence of gates and stops at the first one that says no:
//!
//! 1. quiet hours (defer unless the request may bypass them)
//! 2. rate limit (reject unless `bypass_rate_limit`)
//! 3. user preferences (suppress)
//! 4. A/B variant (rewrite content)
//! 5. dispatch (record the send only when the channel accepted it)
//!
//! Deferred, suppressed and rejected are ordinary outcomes, not errors.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{SystemClock, TimeSource};
use crate::collaborators::{AllowAll, DeliveryChannel, DeliveryId, PreferenceGate};
use crate::config::EngineConfig;
use crate::engagement::{EngagementRecord, InteractionType};
use crate::error::{ConfigError, ValidationError};
use crate::events::{publish, Event, EventSink, TracingSink};
use crate::experiments::{Experiment, VariantAssigner};
use crate::optimizer::{DeliveryOptimizer, OptimizerConfig};
use crate::quiet_hours::{QuietHoursConfig, QuietHoursPolicy};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::request::NotificationRequest;
use crate::storage::{
    BlobStore, MemoryStore, StateSlot, ENGAGEMENT_KEY, EXPERIMENTS_KEY, QUIET_HOURS_KEY,
    RATE_LIMITER_KEY,
};

/// Why a request was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    QuietHours,
}

impl DeferReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeferReason::QuietHours => "quiet_hours",
        }
    }
}

/// Why a request was dropped without dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The preference gate refused it
    PreferenceDenied,
}

impl SuppressReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SuppressReason::PreferenceDenied => "preference_denied",
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A rate window is full; `retry_after` estimates when it frees up
    RateLimitExceeded { retry_after: Option<Duration> },
    /// The delivery channel returned an error
    DispatchFailed { message: String },
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::RateLimitExceeded { .. } => "rate_limit_exceeded",
            RejectReason::DispatchFailed { .. } => "dispatch_failed",
        }
    }
}

/// Result of submitting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dispatched {
        delivery_id: DeliveryId,
        /// Variant applied, if the request belonged to a running experiment
        variant_id: Option<String>,
    },
    Deferred(DeferReason),
    Suppressed(SuppressReason),
    Rejected(RejectReason),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Dispatched { .. } => "dispatched",
            Outcome::Deferred(_) => "deferred",
            Outcome::Suppressed(_) => "suppressed",
            Outcome::Rejected(_) => "rejected",
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, Outcome::Dispatched { .. })
    }
}

/// Wires the orchestrator's components and collaborators.
///
/// Only the delivery channel is required. Defaults: system clock in UTC,
/// in-memory store, [`AllowAll`] preferences, [`TracingSink`] events, and
/// default component configuration.
pub struct OrchestratorBuilder {
    installation_id: Option<String>,
    rate_limit: RateLimitConfig,
    quiet_hours: Option<QuietHoursConfig>,
    optimizer: OptimizerConfig,
    experiments: Vec<Experiment>,
    seed: Option<u64>,
    clock: Option<Arc<dyn TimeSource>>,
    store: Option<Arc<dyn BlobStore>>,
    delivery: Option<Arc<dyn DeliveryChannel>>,
    preferences: Arc<dyn PreferenceGate>,
    events: Arc<dyn EventSink>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            installation_id: None,
            rate_limit: RateLimitConfig::default(),
            quiet_hours: None,
            optimizer: OptimizerConfig::default(),
            experiments: Vec::new(),
            seed: None,
            clock: None,
            store: None,
            delivery: None,
            preferences: Arc::new(AllowAll),
            events: Arc::new(TracingSink),
        }
    }

    /// Builder seeded from a validated configuration. The clock defaults to
    /// the system clock in the configured offset.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let offset = config.offset()?;
        Ok(Self {
            installation_id: config.installation_id.clone(),
            rate_limit: config.rate_limit.clone(),
            quiet_hours: config.quiet_hours.clone(),
            optimizer: config.optimizer.clone(),
            experiments: config.experiments()?,
            clock: Some(Arc::new(SystemClock::with_offset(offset))),
            ..Self::new()
        })
    }

    pub fn installation_id(mut self, installation_id: impl Into<String>) -> Self {
        self.installation_id = Some(installation_id.into());
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn quiet_hours(mut self, config: QuietHoursConfig) -> Self {
        self.quiet_hours = Some(config);
        self
    }

    pub fn optimizer(mut self, config: OptimizerConfig) -> Self {
        self.optimizer = config;
        self
    }

    pub fn experiment(mut self, experiment: Experiment) -> Self {
        self.experiments.push(experiment);
        self
    }

    /// Seeds the variant draw.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn delivery(mut self, delivery: Arc<dyn DeliveryChannel>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn preferences(mut self, preferences: Arc<dyn PreferenceGate>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds every component and restores persisted state.
    ///
    /// # Errors
    /// Returns an error if no delivery channel was given or any component
    /// configuration is invalid.
    pub fn build(self) -> Result<DeliveryOrchestrator, ConfigError> {
        let delivery = self
            .delivery
            .ok_or(ConfigError::MissingCollaborator("delivery"))?;
        let clock: Arc<dyn TimeSource> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::utc()),
        };
        let store: Arc<dyn BlobStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let slot = |key: &str| StateSlot::new(store.clone(), key, self.events.clone(), clock.clone());

        let rate_limiter = RateLimiter::new(self.rate_limit, clock.clone(), slot(RATE_LIMITER_KEY))?;
        let quiet_hours = QuietHoursPolicy::new(self.quiet_hours, clock.clone(), slot(QUIET_HOURS_KEY))?;
        let optimizer = DeliveryOptimizer::new(self.optimizer, clock.clone(), slot(ENGAGEMENT_KEY))?;
        let mut variants = VariantAssigner::new(
            self.installation_id,
            self.experiments,
            clock.clone(),
            slot(EXPERIMENTS_KEY),
        )?;
        if let Some(seed) = self.seed {
            variants = variants.with_seed(seed);
        }

        tracing::info!(
            installation_id = %variants.installation_id(),
            deferred = quiet_hours.pending_count(),
            "delivery orchestrator ready"
        );

        Ok(DeliveryOrchestrator {
            clock,
            rate_limiter,
            quiet_hours,
            optimizer,
            variants,
            delivery,
            preferences: self.preferences,
            events: self.events,
            pipeline: Mutex::new(()),
        })
    }
}

/// Decides whether, when and in which variant each notification is sent.
pub struct DeliveryOrchestrator {
    clock: Arc<dyn TimeSource>,
    rate_limiter: RateLimiter,
    quiet_hours: QuietHoursPolicy,
    optimizer: DeliveryOptimizer,
    variants: VariantAssigner,
    delivery: Arc<dyn DeliveryChannel>,
    preferences: Arc<dyn PreferenceGate>,
    events: Arc<dyn EventSink>,
    /// Serializes the check/record pair so concurrent submits cannot
    /// over-admit.
    pipeline: Mutex<()>,
}

impl DeliveryOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Runs `request` through the pipeline.
    ///
    /// Outside quiet hours any backlog left from the last window is released
    /// first, so a fresh request never overtakes older deferred ones.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    pub fn submit(&self, request: NotificationRequest) -> Outcome {
        let quiet = self.quiet_hours.is_active_now();
        if quiet && !self.quiet_hours.should_bypass(&request) {
            let request_id = request.id.clone();
            let pending = self.quiet_hours.defer(request);
            let reason = DeferReason::QuietHours;
            tracing::info!(pending, reason = reason.as_str(), "notification deferred");
            self.emit(Event::NotificationDeferred {
                request_id,
                reason: reason.as_str().to_string(),
                pending,
                at: self.clock.now(),
            });
            return Outcome::Deferred(reason);
        }

        let _pipeline = self.lock_pipeline();
        if !quiet && self.quiet_hours.pending_count() > 0 {
            let released = self.flush_locked();
            tracing::debug!(released = released.len(), "released backlog before submit");
        }
        self.admit(request)
    }

    /// Releases requests deferred during quiet hours, oldest first, through
    /// the rest of the pipeline. Returns nothing while quiet hours are still
    /// active.
    ///
    /// Stops at the first request the rate limiter refuses; it and everything
    /// behind it stay queued for a later flush.
    #[tracing::instrument(skip(self))]
    pub fn flush_deferred(&self) -> Vec<(String, Outcome)> {
        if self.quiet_hours.is_active_now() {
            tracing::debug!(pending = self.quiet_hours.pending_count(), "still quiet, nothing flushed");
            return Vec::new();
        }
        let _pipeline = self.lock_pipeline();
        self.flush_locked()
    }

    /// Records how the user reacted to a delivered notification.
    pub fn record_engagement(
        &self,
        request_id: &str,
        interaction: InteractionType,
        response_time: Option<std::time::Duration>,
    ) -> Result<EngagementRecord, ValidationError> {
        let record = self
            .optimizer
            .record_interaction(request_id, interaction, response_time)?;
        self.emit(Event::EngagementRecorded {
            request_id: record.request_id.clone(),
            interaction: interaction.as_str().to_string(),
            at: record.timestamp,
        });
        Ok(record)
    }

    /// Next good moment to send: the optimizer's suggestion, pushed forward
    /// a day at a time while it falls into quiet hours.
    pub fn suggested_send_time(&self) -> DateTime<Utc> {
        let suggested = self.optimizer.suggested_delivery_time();
        (0..7)
            .map(|days| suggested + Duration::days(days))
            .find(|at| !self.quiet_hours.is_active_at(*at))
            .unwrap_or(suggested)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn quiet_hours(&self) -> &QuietHoursPolicy {
        &self.quiet_hours
    }

    pub fn optimizer(&self) -> &DeliveryOptimizer {
        &self.optimizer
    }

    pub fn variants(&self) -> &VariantAssigner {
        &self.variants
    }

    pub fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    /// Caller holds the pipeline lock.
    fn flush_locked(&self) -> Vec<(String, Outcome)> {
        let mut queue = self.quiet_hours.take_deferred().into_iter();
        let mut released = Vec::new();
        let mut held = Vec::new();

        while let Some(entry) = queue.next() {
            if !entry.request.bypass_rate_limit && !self.rate_limiter.can_schedule() {
                held.push(entry);
                held.extend(queue.by_ref());
                break;
            }
            let request_id = entry.request.id.clone();
            released.push((request_id, self.admit(entry.request)));
        }

        if released.is_empty() && held.is_empty() {
            return released;
        }
        tracing::info!(
            released = released.len(),
            requeued = held.len(),
            "flushed deferred notifications"
        );
        self.emit(Event::DeferredFlushed {
            count: released.len(),
            requeued: held.len(),
            at: self.clock.now(),
        });
        self.quiet_hours.requeue_front(held);
        released
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, ()> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Steps 2-5 of the pipeline. Caller holds the pipeline lock.
    fn admit(&self, request: NotificationRequest) -> Outcome {
        if !request.bypass_rate_limit && !self.rate_limiter.can_schedule() {
            let retry_after = self.rate_limiter.time_until_next_allowed();
            tracing::info!(
                retry_after_secs = retry_after.map(|d| d.num_seconds()),
                "rate limit exceeded"
            );
            return self.reject(&request.id, RejectReason::RateLimitExceeded { retry_after });
        }

        if !self.preferences.is_allowed(&request) {
            let reason = SuppressReason::PreferenceDenied;
            tracing::info!(reason = reason.as_str(), "notification suppressed");
            self.emit(Event::NotificationSuppressed {
                request_id: request.id.clone(),
                reason: reason.as_str().to_string(),
                at: self.clock.now(),
            });
            return Outcome::Suppressed(reason);
        }

        let variant = self.variants.variant_for(&request);
        let request = match &variant {
            Some(variant) => request.with_overrides(&variant.overrides),
            None => request,
        };

        match self.delivery.dispatch(&request) {
            Ok(delivery_id) => {
                self.rate_limiter.record_scheduled();
                let variant_id = variant.map(|v| v.id);
                if let (Some(experiment_id), Some(variant_id)) = (&request.experiment_id, &variant_id) {
                    self.variants.record_impression(experiment_id, variant_id);
                }
                tracing::info!(
                    delivery_id = %delivery_id,
                    variant_id = variant_id.as_deref(),
                    "notification dispatched"
                );
                self.emit(Event::NotificationDispatched {
                    request_id: request.id.clone(),
                    delivery_id: delivery_id.to_string(),
                    variant_id: variant_id.clone(),
                    at: self.clock.now(),
                });
                Outcome::Dispatched {
                    delivery_id,
                    variant_id,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dispatch failed");
                self.reject(
                    &request.id,
                    RejectReason::DispatchFailed {
                        message: e.to_string(),
                    },
                )
            }
        }
    }

    fn reject(&self, request_id: &str, reason: RejectReason) -> Outcome {
        self.emit(Event::NotificationRejected {
            request_id: request_id.to_string(),
            reason: reason.as_str().to_string(),
            at: self.clock.now(),
        });
        Outcome::Rejected(reason)
    }

    fn emit(&self, event: Event) {
        publish(self.events.as_ref(), &event);
    }
}
