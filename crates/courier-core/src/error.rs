//! Core error types for courier-core.
//!
//! Policy outcomes (deferred, suppressed, rejected) are not errors and never
//! appear here; see [`crate::orchestrator::Outcome`]. This module covers the
//! failures that are actually failures: bad configuration, storage trouble
//! and invalid input.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for courier-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence-related errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration-specific errors.
///
/// All of these are raised while building an engine, never while it runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Malformed `HH:MM` time of day
    #[error("Invalid time of day '{0}': expected HH:MM")]
    InvalidTimeOfDay(String),

    /// A rate limit was configured as zero
    #[error("Rate limit '{0}' must be greater than zero")]
    ZeroRateLimit(&'static str),

    /// Experiment definition problems
    #[error("Invalid experiment '{experiment_id}': {message}")]
    InvalidExperiment {
        experiment_id: String,
        message: String,
    },

    /// Variant override names a content field that does not exist
    #[error("Unknown override field '{0}'")]
    UnknownOverrideField(String),

    /// A required collaborator was not supplied to the builder
    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
}

/// Persistence-specific errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Failed to open the backing store
    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Store is locked by another writer
    #[error("Store is locked")]
    Locked,

    /// Snapshot could not be encoded or decoded
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),

    /// Store rejected the operation for another reason
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Hour outside 0-23
    #[error("Hour {0} out of range (0-23)")]
    HourOutOfRange(u8),

    /// Day of week outside 1-7
    #[error("Day of week {0} out of range (1-7, Sunday = 1)")]
    DayOutOfRange(u8),

    /// Empty identifier
    #[error("Empty identifier for '{0}'")]
    EmptyId(&'static str),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _msg) => {
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked
                {
                    PersistenceError::Locked
                } else {
                    PersistenceError::QueryFailed(err.to_string())
                }
            }
            _ => PersistenceError::QueryFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_wraps_into_core_error() {
        let err: CoreError = ConfigError::ZeroRateLimit("hourly_limit").into();
        assert!(matches!(err, CoreError::Config(ConfigError::ZeroRateLimit(_))));
        assert_eq!(
            err.to_string(),
            "Configuration error: Rate limit 'hourly_limit' must be greater than zero"
        );
    }

    #[test]
    fn sqlite_busy_maps_to_locked() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(PersistenceError::from(err), PersistenceError::Locked));
    }
}
