//! Core domain model for the telemetry engine.
//!
//! This module contains the fundamental types shared by every layer:
//! the event model, the declarative configuration, the error taxonomy,
//! and the diagnostic counters.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    ActivationConfig, AlertConfig, ConfigKey, DimensionalSamplingConfig, DurationAggregation,
    EngineConfig, GaugeSampling, MatcherConfig, MatcherSpec, MetricConfig, PredicateConfig,
    PredicateInitialValue, PredicateSpec, ProducerConfig, ValueAggregation, NS_PER_SEC,
};
pub use diagnostics::{DiagnosticsSnapshot, EngineDiagnostics};
pub use error::{ComponentKind, InvalidConfigReason, Result, TallyError};
pub use types::{Event, EventBuilder, FieldPath, FieldValue, Position, Value, POSITION_COLLAPSED};
