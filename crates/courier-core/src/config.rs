//! Engine configuration.
//!
//! Loaded from TOML and validated eagerly: every problem surfaces as a
//! [`ConfigError`] before any component is built.
//!
//! ```toml
//! installation_id = "device-42"
//! utc_offset_minutes = 540
//!
//! [rate_limit]
//! burst_limit = 3
//! burst_window_secs = 60
//! hourly_limit = 10
//! daily_limit = 50
//!
//! [quiet_hours]
//! start = "22:00"
//! end = "07:30"
//! active_weekdays = ["Mon", "Tue", "Wed", "Thu", "Fri"]
//!
//! [[experiments]]
//! id = "subject-line"
//!
//! [[experiments.variants]]
//! id = "control"
//! weight = 1
//!
//! [[experiments.variants]]
//! id = "short"
//! weight = 1
//! overrides = { title = "Quick break?" }
//! ```

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::experiments::{Experiment, Variant};
use crate::optimizer::OptimizerConfig;
use crate::quiet_hours::QuietHoursConfig;
use crate::rate_limit::RateLimitConfig;
use crate::request::ContentField;
use crate::storage::data_dir;

/// Largest accepted UTC offset, in minutes.
const MAX_OFFSET_MINUTES: i32 = 18 * 60;

/// Variant as written in configuration; override keys are field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub weight: u32,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// Experiment as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

fn default_true() -> bool {
    true
}

impl ExperimentConfig {
    /// Converts to a validated [`Experiment`], resolving override names.
    pub fn to_experiment(&self) -> Result<Experiment, ConfigError> {
        let mut variants = Vec::with_capacity(self.variants.len());
        for variant in &self.variants {
            let mut overrides = BTreeMap::new();
            for (field, value) in &variant.overrides {
                overrides.insert(field.parse::<ContentField>()?, value.clone());
            }
            variants.push(Variant {
                id: variant.id.clone(),
                name: variant.name.clone(),
                weight: variant.weight,
                overrides,
            });
        }
        let experiment = Experiment {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            variants,
            active: self.active,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        };
        experiment.validate()?;
        Ok(experiment)
    }
}

/// Everything needed to build a delivery engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed installation id; generated and persisted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    /// Local offset from UTC used for hour/day bucketing and quiet hours
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Quiet hours window (None = no quiet hours)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHoursConfig>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub experiments: Vec<ExperimentConfig>,
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Loads `path`, or returns the defaults when the file does not exist.
    /// A file that exists but is invalid is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// `<data dir>/courier/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = data_dir().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from("config.toml"),
            message: e.to_string(),
        })?;
        Ok(dir.join("config.toml"))
    }

    /// Serializes to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.offset()?;
        if matches!(&self.installation_id, Some(id) if id.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "installation_id".into(),
                message: "must not be empty".into(),
            });
        }
        self.rate_limit.validate()?;
        if let Some(quiet_hours) = &self.quiet_hours {
            quiet_hours.validate()?;
        }
        self.optimizer.validate()?;
        self.experiments()?;
        Ok(())
    }

    /// Local offset described by `utc_offset_minutes`.
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: "utc_offset_minutes".into(),
            message: format!("{} is outside ±{MAX_OFFSET_MINUTES}", self.utc_offset_minutes),
        };
        if self.utc_offset_minutes.unsigned_abs() > MAX_OFFSET_MINUTES.unsigned_abs() {
            return Err(invalid());
        }
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(invalid)
    }

    /// Experiment definitions, validated and with duplicate ids rejected.
    pub fn experiments(&self) -> Result<Vec<Experiment>, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        let mut experiments = Vec::with_capacity(self.experiments.len());
        for config in &self.experiments {
            if !seen.insert(config.id.as_str()) {
                return Err(ConfigError::InvalidExperiment {
                    experiment_id: config.id.clone(),
                    message: "defined more than once".into(),
                });
            }
            experiments.push(config.to_experiment()?);
        }
        Ok(experiments)
    }

    /// Value at a dot-separated key (e.g. `rate_limit.hourly_limit`).
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let value = get_json_value_by_path(&json, key)?;
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Sets a value by dot-separated key and re-validates.
    ///
    /// # Errors
    /// Returns an error if the key is unknown, the value does not fit the
    /// field, or the resulting configuration is invalid. On error the
    /// configuration is left unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        set_json_value_by_path(&mut json, key, value)?;
        let updated: EngineConfig = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn get_json_value_by_path<'a>(root: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    if key.is_empty() {
        return None;
    }
    let mut current = root;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn set_json_value_by_path(root: &mut serde_json::Value, key: &str, value: &str) -> Result<(), ConfigError> {
    let unknown = || ConfigError::InvalidValue {
        key: key.to_string(),
        message: "unknown config key".into(),
    };
    let unparsable = |kind: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{value}' as {kind}"),
    };

    let mut parts = key.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_some() {
            current = current.get_mut(part).ok_or_else(unknown)?;
            continue;
        }
        let obj = current.as_object_mut().ok_or_else(unknown)?;
        let existing = obj.get(part).ok_or_else(unknown)?;
        let new_value = match existing {
            serde_json::Value::Bool(_) => {
                serde_json::Value::Bool(value.parse::<bool>().map_err(|_| unparsable("bool"))?)
            }
            serde_json::Value::Number(_) => {
                if let Ok(n) = value.parse::<i64>() {
                    serde_json::Value::Number(n.into())
                } else {
                    value
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(serde_json::Value::Number)
                        .ok_or_else(|| unparsable("number"))?
                }
            }
            serde_json::Value::String(_) => serde_json::Value::String(value.into()),
            // Unset optionals, arrays and tables take JSON literals.
            _ => serde_json::from_str(value).map_err(|_| unparsable("JSON"))?,
        };
        obj.insert(part.to_string(), new_value);
        return Ok(());
    }
    Err(unknown())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiet_hours::TimeOfDay;

    #[test]
    fn default_config_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.rate_limit.burst_limit, 3);
        assert_eq!(parsed.optimizer.min_total_samples, 10);
    }

    #[test]
    fn parses_full_document() {
        let config = EngineConfig::from_toml_str(
            r#"
installation_id = "device-42"
utc_offset_minutes = 540

[rate_limit]
burst_limit = 2
hourly_limit = 8

[quiet_hours]
start = "22:00"
end = "7:30"
active_weekdays = ["Mon", "Fri"]
allow_time_sensitive = true

[[experiments]]
id = "subject-line"

[[experiments.variants]]
id = "control"
weight = 1

[[experiments.variants]]
id = "short"
weight = 3
overrides = { title = "Quick break?", thread_id = "breaks" }
"#,
        )
        .unwrap();

        assert_eq!(config.offset().unwrap().local_minus_utc(), 540 * 60);
        assert_eq!(config.rate_limit.burst_limit, 2);
        assert_eq!(config.rate_limit.daily_limit, None);
        let quiet = config.quiet_hours.as_ref().unwrap();
        assert_eq!(quiet.end, TimeOfDay::new(7, 30).unwrap());
        assert!(quiet.allow_critical);

        let experiments = config.experiments().unwrap();
        let short = experiments[0].variant("short").unwrap();
        assert_eq!(short.weight, 3);
        assert_eq!(short.overrides.get(&ContentField::ThreadId).map(String::as_str), Some("breaks"));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            "[quiet_hours]\nstart = \"25:00\"\nend = \"07:00\"",
            "[quiet_hours]\nstart = \"22:00\"\nend = \"07:00\"\nactive_weekdays = []",
            "[rate_limit]\nburst_limit = 0",
            "[rate_limit]\nburst_window_secs = 0",
            "utc_offset_minutes = 2000",
            "[optimizer]\ndefault_hour = 24",
            "[[experiments]]\nid = \"x\"\n[[experiments.variants]]\nid = \"a\"\nweight = 0",
            "[[experiments]]\nid = \"x\"",
            "[[experiments]]\nid = \"x\"\n[[experiments.variants]]\nid = \"a\"\nweight = 1\noverrides = { colour = \"red\" }",
            "not toml at all [",
        ];
        for case in cases {
            assert!(EngineConfig::from_toml_str(case).is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn unknown_override_field_is_named() {
        let err = EngineConfig::from_toml_str(
            "[[experiments]]\nid = \"x\"\n[[experiments.variants]]\nid = \"a\"\nweight = 1\noverrides = { colour = \"red\" }",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOverrideField(field) if field == "colour"));
    }

    #[test]
    fn get_and_set_by_key() {
        let mut config = EngineConfig::default();
        assert_eq!(config.get("rate_limit.hourly_limit").as_deref(), Some("10"));
        config.set("rate_limit.hourly_limit", "25").unwrap();
        assert_eq!(config.rate_limit.hourly_limit, 25);
        assert_eq!(config.get("rate_limit.daily_limit").as_deref(), Some("null"));
        config.set("rate_limit.daily_limit", "40").unwrap();
        assert_eq!(config.rate_limit.daily_limit, Some(40));

        assert!(config.set("rate_limit.nope", "1").is_err());
        assert!(config.set("rate_limit.burst_limit", "0").is_err());
        assert_eq!(config.rate_limit.burst_limit, 3);
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(EngineConfig::load_or_default(&path).unwrap(), EngineConfig::default());

        std::fs::write(&path, "utc_offset_minutes = -300\n").unwrap();
        let loaded = EngineConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.utc_offset_minutes, -300);

        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::LoadFailed { .. })
        ));
    }
}
