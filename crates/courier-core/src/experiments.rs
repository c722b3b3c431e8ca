//! A/B variant assignment for notification content.
//!
//! Each installation is assigned one variant per experiment by a weighted
//! random draw. The assignment is persisted and reused on every later call,
//! including after a restart, until it is explicitly reset. Experiment
//! results stay stable only as long as this holds.
//!
//! # Usage
//! ```rust,ignore
//! use courier_core::experiments::*;
//!
//! let experiment = Experiment::new("subject-line", vec![
//!     Variant::new("control", 1),
//!     Variant::new("short", 1).with_override(ContentField::Title, "Quick break?"),
//! ]);
//! let assigner = VariantAssigner::new(None, vec![experiment], clock, slot)?;
//! let request = assigner.apply_variant(request);
//! ```

use chrono::{DateTime, Utc};
use rand::prelude::*;
use rand_pcg::Mcg128Xsl64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::TimeSource;
use crate::error::ConfigError;
use crate::request::{ContentField, NotificationRequest};
use crate::storage::StateSlot;

/// One arm of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Variant identifier (e.g., "control", "treatment")
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Relative weight for the draw
    pub weight: u32,
    /// Content fields replaced when this variant is applied
    #[serde(default)]
    pub overrides: BTreeMap<ContentField, String>,
}

impl Variant {
    pub fn new(id: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            name: None,
            weight,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_override(mut self, field: ContentField, value: impl Into<String>) -> Self {
        self.overrides.insert(field, value.into());
        self
    }
}

/// Definition of a content experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Variants in draw order
    pub variants: Vec<Variant>,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Start time (None = already started)
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// End time, exclusive (None = ongoing)
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl Experiment {
    pub fn new(id: impl Into<String>, variants: Vec<Variant>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            variants,
            active: true,
            starts_at: None,
            ends_at: None,
        }
    }

    pub fn with_window(mut self, starts_at: Option<DateTime<Utc>>, ends_at: Option<DateTime<Utc>>) -> Self {
        self.starts_at = starts_at;
        self.ends_at = ends_at;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Checks the definition can be drawn from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidExperiment {
            experiment_id: self.id.clone(),
            message,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("experiment id must not be empty".to_string()));
        }
        if self.variants.is_empty() {
            return Err(invalid("experiment has no variants".to_string()));
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.id.trim().is_empty() {
                return Err(invalid("variant id must not be empty".to_string()));
            }
            if !seen.insert(variant.id.as_str()) {
                return Err(invalid(format!("duplicate variant id '{}'", variant.id)));
            }
        }
        if self.total_weight() == 0 {
            return Err(invalid("variant weights sum to zero".to_string()));
        }
        if let (Some(start), Some(end)) = (self.starts_at, self.ends_at) {
            if start >= end {
                return Err(invalid("starts_at must be before ends_at".to_string()));
            }
        }
        Ok(())
    }

    pub fn total_weight(&self) -> u64 {
        self.variants.iter().map(|v| u64::from(v.weight)).sum()
    }

    /// Active and inside its validity window at `at`.
    pub fn is_running_at(&self, at: DateTime<Utc>) -> bool {
        self.active
            && self.starts_at.map_or(true, |start| at >= start)
            && self.ends_at.map_or(true, |end| at < end)
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// First variant whose cumulative weight exceeds `roll`.
    fn pick(&self, roll: u64) -> Option<&Variant> {
        let mut cumulative = 0u64;
        for variant in &self.variants {
            cumulative += u64::from(variant.weight);
            if cumulative > roll {
                return Some(variant);
            }
        }
        None
    }
}

/// Counters collected for a variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantMetrics {
    /// Dispatched notifications carrying this variant
    pub impressions: u64,
    pub conversions: u64,
    /// conversions / impressions (0.0 - 1.0)
    pub conversion_rate: f64,
}

/// Summary of an experiment's results for this installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: String,
    /// Variant currently assigned to this installation
    pub assigned_variant: Option<String>,
    /// Per-variant metrics, every defined variant included
    pub variants: BTreeMap<String, VariantMetrics>,
    pub total_impressions: u64,
}

/// Persisted assignment table.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AssignmentSnapshot {
    #[serde(default)]
    installation_id: Option<String>,
    #[serde(default)]
    assignments: BTreeMap<String, String>,
}

struct AssignerState {
    installation_id: String,
    experiments: BTreeMap<String, Experiment>,
    assignments: BTreeMap<String, String>,
    metrics: BTreeMap<String, BTreeMap<String, VariantMetrics>>,
    rng: Mcg128Xsl64,
}

impl AssignerState {
    fn snapshot(&self) -> AssignmentSnapshot {
        AssignmentSnapshot {
            installation_id: Some(self.installation_id.clone()),
            assignments: self.assignments.clone(),
        }
    }

    fn metrics_mut(&mut self, experiment_id: &str, variant_id: &str) -> &mut VariantMetrics {
        self.metrics
            .entry(experiment_id.to_string())
            .or_default()
            .entry(variant_id.to_string())
            .or_default()
    }
}

/// Weighted, persistent variant assignment for one installation.
pub struct VariantAssigner {
    clock: Arc<dyn TimeSource>,
    slot: StateSlot,
    state: Mutex<AssignerState>,
}

impl VariantAssigner {
    /// Builds the assigner and restores persisted assignments.
    ///
    /// The installation id is taken from `installation_id`, else from the
    /// persisted state, else freshly generated. Assignments persisted for a
    /// different installation id are discarded.
    ///
    /// # Errors
    /// Returns an error if any experiment definition is invalid or two
    /// experiments share an id.
    pub fn new(
        installation_id: Option<String>,
        experiments: Vec<Experiment>,
        clock: Arc<dyn TimeSource>,
        slot: StateSlot,
    ) -> Result<Self, ConfigError> {
        let mut registry = BTreeMap::new();
        for experiment in experiments {
            experiment.validate()?;
            if registry.contains_key(&experiment.id) {
                return Err(ConfigError::InvalidExperiment {
                    experiment_id: experiment.id,
                    message: "defined more than once".to_string(),
                });
            }
            registry.insert(experiment.id.clone(), experiment);
        }

        let snapshot = slot.load::<AssignmentSnapshot>().unwrap_or_default();
        let (installation_id, assignments, dirty) = match (installation_id, snapshot.installation_id) {
            (Some(configured), Some(persisted)) if configured == persisted => {
                (configured, snapshot.assignments, false)
            }
            (Some(configured), Some(_)) => {
                tracing::info!(installation_id = %configured, "installation id changed, dropping assignments");
                (configured, BTreeMap::new(), true)
            }
            (Some(configured), None) => (configured, snapshot.assignments, true),
            (None, Some(persisted)) => (persisted, snapshot.assignments, false),
            (None, None) => (uuid::Uuid::new_v4().to_string(), snapshot.assignments, true),
        };

        let assigner = Self {
            clock,
            slot,
            state: Mutex::new(AssignerState {
                installation_id,
                experiments: registry,
                assignments,
                metrics: BTreeMap::new(),
                rng: Mcg128Xsl64::from_entropy(),
            }),
        };
        if dirty {
            let state = assigner.lock();
            assigner.slot.save(&state.snapshot());
        }
        Ok(assigner)
    }

    /// Replaces the random source with a seeded one.
    pub fn with_seed(self, seed: u64) -> Self {
        self.lock().rng = Mcg128Xsl64::seed_from_u64(seed);
        self
    }

    pub fn installation_id(&self) -> String {
        self.lock().installation_id.clone()
    }

    /// Adds or replaces an experiment definition.
    ///
    /// An existing assignment is kept when its variant still exists and
    /// re-drawn lazily otherwise.
    pub fn register_experiment(&self, experiment: Experiment) -> Result<(), ConfigError> {
        experiment.validate()?;
        tracing::debug!(experiment_id = %experiment.id, variants = experiment.variants.len(), "experiment registered");
        self.lock()
            .experiments
            .insert(experiment.id.clone(), experiment);
        Ok(())
    }

    pub fn experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.lock().experiments.get(experiment_id).cloned()
    }

    pub fn experiments(&self) -> Vec<Experiment> {
        self.lock().experiments.values().cloned().collect()
    }

    /// Current assignments, experiment id to variant id.
    pub fn assignments(&self) -> BTreeMap<String, String> {
        self.lock().assignments.clone()
    }

    /// Variant assigned to this installation, drawing and persisting one on
    /// first use. `None` when the experiment is unknown.
    pub fn assigned_variant(&self, experiment_id: &str) -> Option<Variant> {
        let mut state = self.lock();
        self.resolve(&mut state, experiment_id)
    }

    /// Variant that applies to `request`, if its experiment is known and
    /// currently running.
    pub fn variant_for(&self, request: &NotificationRequest) -> Option<Variant> {
        let experiment_id = request.experiment_id.as_deref()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let running = state
            .experiments
            .get(experiment_id)
            .is_some_and(|e| e.is_running_at(now));
        if !running {
            tracing::debug!(experiment_id, "experiment not running, content unchanged");
            return None;
        }
        self.resolve(&mut state, experiment_id)
    }

    /// Returns `request` with the assigned variant's overrides applied.
    /// Unchanged when there is no running experiment for it.
    pub fn apply_variant(&self, request: NotificationRequest) -> NotificationRequest {
        match self.variant_for(&request) {
            Some(variant) => request.with_overrides(&variant.overrides),
            None => request,
        }
    }

    /// Forgets the assignment so the next resolution draws again.
    pub fn reset_assignment(&self, experiment_id: &str) -> bool {
        let mut state = self.lock();
        let removed = state.assignments.remove(experiment_id).is_some();
        if removed {
            tracing::info!(experiment_id, "variant assignment reset");
            self.slot.save(&state.snapshot());
        }
        removed
    }

    /// Counts a dispatched notification for `variant_id`.
    pub fn record_impression(&self, experiment_id: &str, variant_id: &str) {
        self.lock().metrics_mut(experiment_id, variant_id).impressions += 1;
    }

    /// Counts a conversion for the currently assigned variant. Returns
    /// `false` when nothing is assigned.
    pub fn record_conversion(&self, experiment_id: &str) -> bool {
        let mut state = self.lock();
        let Some(variant_id) = state.assignments.get(experiment_id).cloned() else {
            return false;
        };
        state.metrics_mut(experiment_id, &variant_id).conversions += 1;
        true
    }

    /// Metrics for every variant of the experiment.
    pub fn results(&self, experiment_id: &str) -> Option<ExperimentResults> {
        let state = self.lock();
        let experiment = state.experiments.get(experiment_id)?;
        let recorded = state.metrics.get(experiment_id);

        let mut variants = BTreeMap::new();
        let mut total_impressions = 0;
        for variant in &experiment.variants {
            let mut metrics = recorded
                .and_then(|m| m.get(&variant.id))
                .cloned()
                .unwrap_or_default();
            if metrics.impressions > 0 {
                metrics.conversion_rate = metrics.conversions as f64 / metrics.impressions as f64;
            }
            total_impressions += metrics.impressions;
            variants.insert(variant.id.clone(), metrics);
        }

        Some(ExperimentResults {
            experiment_id: experiment_id.to_string(),
            assigned_variant: state.assignments.get(experiment_id).cloned(),
            variants,
            total_impressions,
        })
    }

    fn resolve(&self, state: &mut AssignerState, experiment_id: &str) -> Option<Variant> {
        let experiment = state.experiments.get(experiment_id)?;

        if let Some(variant) = state
            .assignments
            .get(experiment_id)
            .and_then(|variant_id| experiment.variant(variant_id))
        {
            return Some(variant.clone());
        }

        let roll = state.rng.gen_range(0..experiment.total_weight());
        let variant = experiment.pick(roll)?.clone();
        tracing::info!(
            experiment_id,
            variant_id = %variant.id,
            installation_id = %state.installation_id,
            "variant assigned"
        );
        state
            .assignments
            .insert(experiment_id.to_string(), variant.id.clone());
        self.slot.save(&state.snapshot());
        Some(variant)
    }

    fn lock(&self) -> MutexGuard<'_, AssignerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(now()))
    }

    fn ab_test() -> Experiment {
        Experiment::new(
            "subject-line",
            vec![
                Variant::new("a", 1).with_override(ContentField::Title, "Variant A"),
                Variant::new("b", 1).with_override(ContentField::Title, "Variant B"),
            ],
        )
    }

    fn assigner(slot: StateSlot) -> VariantAssigner {
        VariantAssigner::new(Some("install-1".to_string()), vec![ab_test()], clock(), slot).unwrap()
    }

    #[test]
    fn test_assignment_is_stable_across_calls() {
        let assigner = assigner(StateSlot::detached("courier.experiments"));
        let first = assigner.assigned_variant("subject-line").unwrap();
        for _ in 0..100 {
            assert_eq!(assigner.assigned_variant("subject-line").unwrap().id, first.id);
        }
    }

    #[test]
    fn test_assignment_survives_restart() {
        let slot = StateSlot::detached("courier.experiments");
        let first = assigner(slot.clone()).assigned_variant("subject-line").unwrap();
        for seed in 0..20 {
            let reloaded = assigner(slot.clone()).with_seed(seed);
            assert_eq!(reloaded.assigned_variant("subject-line").unwrap().id, first.id);
        }
    }

    #[test]
    fn test_reset_draws_again() {
        let assigner = assigner(StateSlot::detached("courier.experiments")).with_seed(7);
        assigner.assigned_variant("subject-line").unwrap();
        assert!(assigner.reset_assignment("subject-line"));
        assert!(!assigner.reset_assignment("subject-line"));
        assert!(assigner.assignments().is_empty());
        assert!(assigner.assigned_variant("subject-line").is_some());
        assert_eq!(assigner.assignments().len(), 1);
    }

    #[test]
    fn test_weighted_assignment_converges() {
        let experiment = Experiment::new(
            "ratio",
            vec![Variant::new("heavy", 3), Variant::new("light", 1)],
        );
        let installations = 2000;
        let mut heavy = 0;
        for seed in 0..installations {
            let assigner = VariantAssigner::new(
                None,
                vec![experiment.clone()],
                clock(),
                StateSlot::detached("courier.experiments"),
            )
            .unwrap()
            .with_seed(seed);
            if assigner.assigned_variant("ratio").unwrap().id == "heavy" {
                heavy += 1;
            }
        }
        let share = f64::from(heavy) / installations as f64;
        assert!((share - 0.75).abs() < 0.05, "heavy share was {share}");
    }

    #[test]
    fn test_zero_weight_variant_is_never_chosen() {
        let experiment = Experiment::new(
            "holdout",
            vec![Variant::new("off", 0), Variant::new("on", 1)],
        );
        for seed in 0..50 {
            let assigner = VariantAssigner::new(
                None,
                vec![experiment.clone()],
                clock(),
                StateSlot::detached("courier.experiments"),
            )
            .unwrap()
            .with_seed(seed);
            assert_eq!(assigner.assigned_variant("holdout").unwrap().id, "on");
        }
    }

    #[test]
    fn test_apply_variant_overrides_only_named_fields() {
        let assigner = assigner(StateSlot::detached("courier.experiments"));
        let request = NotificationRequest::new("n-1", "Original", "Body stays")
            .with_experiment("subject-line");
        let applied = assigner.apply_variant(request.clone());
        assert!(applied.content.title.starts_with("Variant "));
        assert_eq!(applied.content.body, "Body stays");
        assert_eq!(applied.id, request.id);
    }

    #[test]
    fn test_apply_variant_noop_cases() {
        let clock = clock();
        let ended = Experiment::new("ended", vec![Variant::new("x", 1).with_override(ContentField::Body, "x")])
            .with_window(None, Some(now() - Duration::days(1)));
        let paused = Experiment::new("paused", vec![Variant::new("x", 1).with_override(ContentField::Body, "x")])
            .with_active(false);
        let assigner = VariantAssigner::new(
            None,
            vec![ended, paused],
            clock,
            StateSlot::detached("courier.experiments"),
        )
        .unwrap();

        for experiment_id in [None, Some("missing"), Some("ended"), Some("paused")] {
            let mut request = NotificationRequest::new("n-1", "Title", "Body");
            request.experiment_id = experiment_id.map(str::to_string);
            assert_eq!(assigner.apply_variant(request.clone()), request);
        }
        assert!(assigner.assignments().is_empty());
    }

    #[test]
    fn test_stale_assignment_is_redrawn() {
        let assigner = assigner(StateSlot::detached("courier.experiments"));
        assigner.assigned_variant("subject-line").unwrap();
        assigner
            .register_experiment(Experiment::new("subject-line", vec![Variant::new("c", 1)]))
            .unwrap();
        assert_eq!(assigner.assigned_variant("subject-line").unwrap().id, "c");
    }

    #[test]
    fn test_installation_id_generated_and_persisted() {
        let slot = StateSlot::detached("courier.experiments");
        let first = VariantAssigner::new(None, vec![], clock(), slot.clone()).unwrap();
        let id = first.installation_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        let second = VariantAssigner::new(None, vec![], clock(), slot).unwrap();
        assert_eq!(second.installation_id(), id);
    }

    #[test]
    fn test_changed_installation_id_drops_assignments() {
        let slot = StateSlot::detached("courier.experiments");
        assigner(slot.clone()).assigned_variant("subject-line").unwrap();
        let other =
            VariantAssigner::new(Some("install-2".to_string()), vec![ab_test()], clock(), slot).unwrap();
        assert!(other.assignments().is_empty());
    }

    #[test]
    fn test_results_track_impressions_and_conversions() {
        let assigner = assigner(StateSlot::detached("courier.experiments"));
        assert!(!assigner.record_conversion("subject-line"));
        let variant = assigner.assigned_variant("subject-line").unwrap();
        for _ in 0..4 {
            assigner.record_impression("subject-line", &variant.id);
        }
        assert!(assigner.record_conversion("subject-line"));

        let results = assigner.results("subject-line").unwrap();
        assert_eq!(results.total_impressions, 4);
        assert_eq!(results.assigned_variant.as_deref(), Some(variant.id.as_str()));
        assert_eq!(results.variants.len(), 2);
        assert_eq!(results.variants[&variant.id].conversion_rate, 0.25);
        assert!(assigner.results("missing").is_none());
    }

    #[test]
    fn test_invalid_experiments_rejected() {
        let cases = [
            Experiment::new("empty", vec![]),
            Experiment::new("zero", vec![Variant::new("a", 0), Variant::new("b", 0)]),
            Experiment::new("dupe", vec![Variant::new("a", 1), Variant::new("a", 1)]),
            Experiment::new("window", vec![Variant::new("a", 1)])
                .with_window(Some(now()), Some(now() - Duration::hours(1))),
        ];
        for experiment in cases {
            assert!(matches!(
                experiment.validate(),
                Err(ConfigError::InvalidExperiment { .. })
            ));
        }
        let twice = VariantAssigner::new(
            None,
            vec![ab_test(), ab_test()],
            clock(),
            StateSlot::detached("courier.experiments"),
        );
        assert!(twice.is_err());
    }
}
