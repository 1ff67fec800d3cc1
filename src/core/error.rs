use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("Metric not found: {0}")]
    MetricNotFound(i64),

    #[error("Pull failed for atom {atom_id}: {message}")]
    PullFailed { atom_id: u32, message: String },

    #[error("Memory limit exceeded: current {current} bytes, limit {limit} bytes")]
    MemoryLimitExceeded { current: usize, limit: usize },

    #[error("Sampling percentage must be between 1 and 100, got {0}")]
    InvalidSamplingPercentage(u8),

    #[error("Metadata codec error: {0}")]
    MetadataCodec(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, TallyError>;

impl TallyError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new invalid-event error
    pub fn invalid_event<S: Into<String>>(msg: S) -> Self {
        Self::InvalidEvent(msg.into())
    }

    /// Creates a new report error
    pub fn report<S: Into<String>>(msg: S) -> Self {
        Self::Report(msg.into())
    }

    /// Returns the error category for diagnostics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidEvent(_) => "validation",
            Self::Report(_) => "report",
            Self::MetricNotFound(_) => "not_found",
            Self::PullFailed { .. } => "pull",
            Self::MemoryLimitExceeded { .. } => "resource",
            Self::InvalidSamplingPercentage(_) => "validation",
            Self::MetadataCodec(_) => "serialization",
        }
    }
}

/// Why a configuration was rejected.
///
/// A rejected configuration does not produce an `Err`: the owning
/// MetricsManager is constructed in a permanently invalid state that
/// drops events and refuses reports, and this value records why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidConfigReason {
    /// A component id appears more than once.
    DuplicateId { id: i64 },
    /// A matcher referenced by id does not exist.
    MatcherNotFound { matcher_id: i64 },
    /// A predicate referenced by id does not exist.
    ConditionNotFound { condition_id: i64 },
    /// A combination references a component at an equal or later index.
    NotTopological { component: ComponentKind, id: i64 },
    /// A NOT combination must have exactly one child.
    BadNotArity { id: i64 },
    /// A simple predicate has neither a start nor a stop matcher.
    PredicateWithoutMatchers { predicate_id: i64 },
    /// A metric's "what" reference is missing.
    MetricWhatNotFound { metric_id: i64, what_id: i64 },
    /// A duration metric's "what" is not a simple predicate.
    DurationWhatNotSimple { metric_id: i64 },
    /// Position ANY appeared in a dimension or link specification.
    AnyPositionInDimensions { id: i64 },
    /// An activation references an unknown matcher.
    ActivationMatcherNotFound { metric_id: i64, matcher_id: i64 },
    /// An alert references an unknown metric.
    AlertMetricNotFound { alert_id: i64, metric_id: i64 },
    /// An alert's rolling window must cover at least one bucket.
    AlertZeroBuckets { alert_id: i64 },
    /// Sampling percentage outside [1, 100].
    BadSamplingPercentage { metric_id: i64, percentage: u8 },
    /// Dimensional sampling with a zero shard count.
    ZeroShardCount { metric_id: i64 },
    /// Too many matchers in one configuration.
    TooManyMatchers(usize),
    /// Too many predicates in one configuration.
    TooManyConditions(usize),
    /// Too many metrics in one configuration.
    TooManyMetrics(usize),
    /// Too many alerts in one configuration.
    TooManyAlerts(usize),
    /// Too many allowed log sources in one configuration.
    TooManyLogSources(usize),
}

/// Which component vector a graph error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Matcher,
    Condition,
    Metric,
    Alert,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Matcher => write!(f, "matcher"),
            ComponentKind::Condition => write!(f, "condition"),
            ComponentKind::Metric => write!(f, "metric"),
            ComponentKind::Alert => write!(f, "alert"),
        }
    }
}

impl fmt::Display for InvalidConfigReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId { id } => write!(f, "duplicate component id {}", id),
            Self::MatcherNotFound { matcher_id } => {
                write!(f, "matcher {} not found", matcher_id)
            }
            Self::ConditionNotFound { condition_id } => {
                write!(f, "predicate {} not found", condition_id)
            }
            Self::NotTopological { component, id } => {
                write!(f, "{} {} references a later or equal index", component, id)
            }
            Self::BadNotArity { id } => {
                write!(f, "NOT combination {} must have exactly one child", id)
            }
            Self::PredicateWithoutMatchers { predicate_id } => {
                write!(f, "predicate {} has neither start nor stop", predicate_id)
            }
            Self::MetricWhatNotFound { metric_id, what_id } => {
                write!(f, "metric {}: what {} not found", metric_id, what_id)
            }
            Self::DurationWhatNotSimple { metric_id } => {
                write!(f, "duration metric {}: what must be a simple predicate", metric_id)
            }
            Self::AnyPositionInDimensions { id } => {
                write!(f, "component {}: position ANY not supported in dimensions", id)
            }
            Self::ActivationMatcherNotFound { metric_id, matcher_id } => {
                write!(f, "metric {}: activation matcher {} not found", metric_id, matcher_id)
            }
            Self::AlertMetricNotFound { alert_id, metric_id } => {
                write!(f, "alert {}: metric {} not found", alert_id, metric_id)
            }
            Self::AlertZeroBuckets { alert_id } => {
                write!(f, "alert {}: num_buckets must be at least 1", alert_id)
            }
            Self::BadSamplingPercentage { metric_id, percentage } => {
                write!(f, "metric {}: sampling percentage {} outside [1, 100]", metric_id, percentage)
            }
            Self::ZeroShardCount { metric_id } => {
                write!(f, "metric {}: shard count must be non-zero", metric_id)
            }
            Self::TooManyMatchers(n) => write!(f, "too many matchers: {}", n),
            Self::TooManyConditions(n) => write!(f, "too many predicates: {}", n),
            Self::TooManyMetrics(n) => write!(f, "too many metrics: {}", n),
            Self::TooManyAlerts(n) => write!(f, "too many alerts: {}", n),
            Self::TooManyLogSources(n) => write!(f, "too many log sources: {}", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TallyError::config("test message");
        assert_eq!(err.to_string(), "Configuration error: test message");
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_memory_limit_error() {
        let err = TallyError::MemoryLimitExceeded {
            current: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Memory limit exceeded: current 2048 bytes, limit 1024 bytes"
        );
        assert_eq!(err.category(), "resource");
    }

    #[test]
    fn test_invalid_config_reason_display() {
        let reason = InvalidConfigReason::NotTopological {
            component: ComponentKind::Matcher,
            id: 17,
        };
        assert_eq!(reason.to_string(), "matcher 17 references a later or equal index");
    }
}
