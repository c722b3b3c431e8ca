//! Notification request value type.
//!
//! A [`NotificationRequest`] is immutable once handed to the orchestrator.
//! The `with_*` methods consume and return a modified copy, so a rewrite
//! (variant overrides, deferral) always yields a new value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Urgency category of a notification.
///
/// Only used to decide quiet-hours bypass, never for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionLevel {
    /// Delivered silently.
    Passive,
    /// Standard notification.
    #[default]
    Active,
    /// Must reach the user promptly.
    TimeSensitive,
    /// Safety-relevant; may break through do-not-disturb.
    Critical,
}

impl InterruptionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptionLevel::Passive => "passive",
            InterruptionLevel::Active => "active",
            InterruptionLevel::TimeSensitive => "time_sensitive",
            InterruptionLevel::Critical => "critical",
        }
    }
}

/// Content fields an experiment variant may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentField {
    Title,
    Subtitle,
    Body,
    Sound,
    ThreadId,
    CategoryId,
}

impl ContentField {
    pub const ALL: [ContentField; 6] = [
        ContentField::Title,
        ContentField::Subtitle,
        ContentField::Body,
        ContentField::Sound,
        ContentField::ThreadId,
        ContentField::CategoryId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentField::Title => "title",
            ContentField::Subtitle => "subtitle",
            ContentField::Body => "body",
            ContentField::Sound => "sound",
            ContentField::ThreadId => "thread_id",
            ContentField::CategoryId => "category_id",
        }
    }
}

impl fmt::Display for ContentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownOverrideField(s.to_string()))
    }
}

/// Displayable payload of a notification. Opaque to the engine apart from
/// variant overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    pub body: String,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
}

impl NotificationContent {
    /// Current value of a field, if set.
    pub fn get(&self, field: ContentField) -> Option<&str> {
        match field {
            ContentField::Title => Some(self.title.as_str()),
            ContentField::Subtitle => self.subtitle.as_deref(),
            ContentField::Body => Some(self.body.as_str()),
            ContentField::Sound => self.sound.as_deref(),
            ContentField::ThreadId => self.thread_id.as_deref(),
            ContentField::CategoryId => self.category_id.as_deref(),
        }
    }

    /// Returns a copy with `field` replaced by `value`.
    pub fn with_field(mut self, field: ContentField, value: impl Into<String>) -> Self {
        let value = value.into();
        match field {
            ContentField::Title => self.title = value,
            ContentField::Subtitle => self.subtitle = Some(value),
            ContentField::Body => self.body = value,
            ContentField::Sound => self.sound = Some(value),
            ContentField::ThreadId => self.thread_id = Some(value),
            ContentField::CategoryId => self.category_id = Some(value),
        }
        self
    }
}

/// A request to deliver one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Caller-chosen opaque identifier
    pub id: String,
    pub content: NotificationContent,
    /// Target channel, if the caller routes by channel
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub interruption_level: InterruptionLevel,
    #[serde(default)]
    pub bypass_quiet_hours: bool,
    #[serde(default)]
    pub bypass_rate_limit: bool,
    /// Experiment whose variant should shape the content
    #[serde(default)]
    pub experiment_id: Option<String>,
    /// Free-form string metadata forwarded to the delivery channel
    #[serde(default)]
    pub user_info: BTreeMap<String, String>,
}

impl NotificationRequest {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: NotificationContent {
                title: title.into(),
                body: body.into(),
                ..Default::default()
            },
            channel_id: None,
            interruption_level: InterruptionLevel::default(),
            bypass_quiet_hours: false,
            bypass_rate_limit: false,
            experiment_id: None,
            user_info: BTreeMap::new(),
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.content.subtitle = Some(subtitle.into());
        self
    }

    pub fn with_sound(mut self, sound: impl Into<String>) -> Self {
        self.content.sound = Some(sound.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.content.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.content.category_id = Some(category_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_interruption_level(mut self, level: InterruptionLevel) -> Self {
        self.interruption_level = level;
        self
    }

    pub fn with_bypass_quiet_hours(mut self, bypass: bool) -> Self {
        self.bypass_quiet_hours = bypass;
        self
    }

    pub fn with_bypass_rate_limit(mut self, bypass: bool) -> Self {
        self.bypass_rate_limit = bypass;
        self
    }

    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    /// Returns a copy whose content has every override applied.
    ///
    /// Fields absent from `overrides` are left untouched.
    pub fn with_overrides(mut self, overrides: &BTreeMap<ContentField, String>) -> Self {
        for (field, value) in overrides {
            self.content = self.content.with_field(*field, value.clone());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let request = NotificationRequest::new("n-1", "Hello", "World")
            .with_channel("promotions")
            .with_interruption_level(InterruptionLevel::TimeSensitive)
            .with_bypass_quiet_hours(true)
            .with_experiment("copy-test")
            .with_user_info("deep_link", "app://inbox");

        assert_eq!(request.channel_id.as_deref(), Some("promotions"));
        assert_eq!(request.interruption_level, InterruptionLevel::TimeSensitive);
        assert!(request.bypass_quiet_hours);
        assert!(!request.bypass_rate_limit);
        assert_eq!(request.experiment_id.as_deref(), Some("copy-test"));
        assert_eq!(request.user_info["deep_link"], "app://inbox");
    }

    #[test]
    fn overrides_only_touch_named_fields() {
        let original = NotificationRequest::new("n-1", "Hello", "World").with_sound("chime");
        let mut overrides = BTreeMap::new();
        overrides.insert(ContentField::Title, "Hi there".to_string());
        overrides.insert(ContentField::Subtitle, "New".to_string());

        let rewritten = original.clone().with_overrides(&overrides);

        assert_eq!(rewritten.content.title, "Hi there");
        assert_eq!(rewritten.content.subtitle.as_deref(), Some("New"));
        assert_eq!(rewritten.content.body, "World");
        assert_eq!(rewritten.content.sound.as_deref(), Some("chime"));
        assert_eq!(original.content.title, "Hello");
    }

    #[test]
    fn content_field_parses_known_names() {
        assert_eq!("thread_id".parse::<ContentField>().unwrap(), ContentField::ThreadId);
        assert!(matches!(
            "badge".parse::<ContentField>(),
            Err(ConfigError::UnknownOverrideField(name)) if name == "badge"
        ));
    }

    #[test]
    fn request_serializes_level_in_snake_case() {
        let request = NotificationRequest::new("n-1", "t", "b")
            .with_interruption_level(InterruptionLevel::TimeSensitive);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"time_sensitive\""));
        let back: NotificationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
