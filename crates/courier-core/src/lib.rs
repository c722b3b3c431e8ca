//! # Courier Core Library
//!
//! Delivery decision engine for notifications. For every request it
//! decides whether it may be sent now, later, or not at all, and in which
//! A/B variant. Actual delivery, preferences and storage are collaborators
//! supplied by the embedding application.
//!
//! ## Architecture
//!
//! - **Rate limiting**: burst, hourly and daily sliding windows
//! - **Quiet hours**: do-not-disturb window with a FIFO deferral queue
//! - **Optimizer**: engagement history turned into send-time suggestions
//! - **Experiments**: persistent weighted variant assignment
//! - **Storage**: JSON snapshots in an in-memory or SQLite blob store
//!
//! ## Key Components
//!
//! - [`DeliveryOrchestrator`]: the pipeline, built with [`OrchestratorBuilder`]
//! - [`EngineConfig`]: TOML configuration
//! - [`DeliveryChannel`], [`PreferenceGate`], [`BlobStore`], [`EventSink`]:
//!   collaborator traits

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod engagement;
pub mod error;
pub mod events;
pub mod experiments;
pub mod optimizer;
pub mod orchestrator;
pub mod quiet_hours;
pub mod rate_limit;
pub mod request;
pub mod storage;

pub use clock::{ManualClock, SystemClock, TimeSource};
pub use collaborators::{AllowAll, DeliveryChannel, DeliveryError, DeliveryId, MutedChannels, PreferenceGate};
pub use config::EngineConfig;
pub use engagement::{EngagementRecord, EngagementStore, InteractionType};
pub use error::{ConfigError, CoreError, PersistenceError, ValidationError};
pub use events::{Event, EventSink, MemorySink, NullSink, TracingSink};
pub use experiments::{Experiment, ExperimentResults, Variant, VariantAssigner};
pub use optimizer::{DeliveryOptimizer, OptimizerConfig, Recommendation, RecommendationKind};
pub use orchestrator::{
    DeferReason, DeliveryOrchestrator, OrchestratorBuilder, Outcome, RejectReason, SuppressReason,
};
pub use quiet_hours::{QuietHoursConfig, QuietHoursPolicy, QuietState, TimeOfDay};
pub use rate_limit::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use request::{ContentField, InterruptionLevel, NotificationContent, NotificationRequest};
pub use storage::{BlobStore, MemoryStore, SqliteStore, StateSlot};
