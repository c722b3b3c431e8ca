//! Integration tests for building an engine from a TOML file.

use chrono::{TimeZone, Utc};
use courier_core::{
    ConfigError, DeliveryChannel, DeliveryError, DeliveryId, EngineConfig, ManualClock,
    NotificationRequest, OrchestratorBuilder, Outcome,
};
use std::sync::Arc;

struct AcceptAll;

impl DeliveryChannel for AcceptAll {
    fn dispatch(&self, request: &NotificationRequest) -> Result<DeliveryId, DeliveryError> {
        Ok(DeliveryId::new(request.id.clone()))
    }
}

const CONFIG: &str = r#"
installation_id = "device-42"
utc_offset_minutes = 540

[rate_limit]
burst_limit = 5
hourly_limit = 20
daily_limit = 40

[quiet_hours]
start = "22:00"
end = "08:00"

[optimizer]
default_hour = 18

[[experiments]]
id = "tone"

[[experiments.variants]]
id = "friendly"
weight = 1
overrides = { title = "Hey there" }
"#;

#[test]
fn test_engine_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = EngineConfig::load(&path).unwrap();
    let offset = config.offset().unwrap();

    // 14:00 UTC is 23:00 in UTC+9.
    let clock = Arc::new(ManualClock::with_offset(
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
        offset,
    ));
    let orchestrator = OrchestratorBuilder::from_config(&config)
        .unwrap()
        .clock(clock.clone())
        .delivery(Arc::new(AcceptAll))
        .build()
        .unwrap();

    assert_eq!(orchestrator.variants().installation_id(), "device-42");
    assert_eq!(orchestrator.rate_limiter().remaining_today(), Some(40));
    assert!(orchestrator.quiet_hours().is_active_now());
    assert!(matches!(
        orchestrator.submit(NotificationRequest::new("n-1", "t", "b")),
        Outcome::Deferred(_)
    ));

    // 00:00 UTC is 09:00 local.
    clock.set(Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap());
    let outcome = orchestrator.submit(NotificationRequest::new("n-2", "t", "b").with_experiment("tone"));
    assert!(matches!(outcome, Outcome::Dispatched { variant_id: Some(ref v), .. } if v == "friendly"));
    assert_eq!(orchestrator.optimizer().optimal_hour(), 18);
    // Next 18:00 local is 09:00 UTC.
    assert_eq!(
        orchestrator.optimizer().suggested_delivery_time(),
        Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap()
    );
}

#[test]
fn test_invalid_config_fails_before_build() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[rate_limit]\nhourly_limit = 0\n").unwrap();

    assert!(matches!(
        EngineConfig::load(&path),
        Err(ConfigError::ZeroRateLimit("hourly_limit"))
    ));
}

#[test]
fn test_saved_config_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let mut config = EngineConfig::from_toml_str(CONFIG).unwrap();
    config.set("quiet_hours.start", "21:30").unwrap();
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let reloaded = EngineConfig::load(&path).unwrap();
    assert_eq!(reloaded, config);
    assert_eq!(reloaded.get("quiet_hours.start").as_deref(), Some("21:30"));
}
