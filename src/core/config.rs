//! Declarative engine configuration.
//!
//! A client ships one [`EngineConfig`] per configuration key. It names
//! atom matchers, predicates, metrics, alerts, activation rules, allowed
//! log sources, sampling, and memory caps; the engine compiles it into a
//! dataflow graph at [`MetricsManager`](crate::engine::MetricsManager)
//! construction. The whole tree derives serde so configurations can be
//! shipped as JSON and diffed structurally on update.

use crate::core::types::FieldPath;
use crate::dimension::FieldLink;
use crate::matcher::{FieldTransform, FieldValueMatcher, LogicalOperation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Nanoseconds per second.
pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Recognized bucket widths, in minutes.
pub const RECOGNIZED_BUCKET_WIDTHS_MIN: [u64; 6] = [1, 5, 10, 15, 30, 60];

/// Fallback bucket width when a configured width is unrecognized.
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(5 * 60);

/// Default per-configuration report byte cap (hard).
pub const DEFAULT_MAX_METRICS_BYTES: usize = 2 * 1024 * 1024;

/// Default per-configuration soft byte threshold.
pub const DEFAULT_TRIGGER_BYTES: usize = 192 * 1024;

/// Identity of a configuration: the submitting uid plus a client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    /// Uid of the configuration owner.
    pub uid: i32,
    /// Client-chosen configuration id.
    pub id: i64,
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.uid, self.id)
    }
}

/// Complete configuration for one MetricsManager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Atom matchers, in topological order.
    pub matchers: Vec<MatcherConfig>,
    /// Predicates (conditions), in topological order.
    pub predicates: Vec<PredicateConfig>,
    /// Metric definitions.
    pub metrics: Vec<MetricConfig>,
    /// Alert definitions.
    pub alerts: Vec<AlertConfig>,
    /// Allowed log source package names, resolved to uids via the UidMap.
    pub allowed_log_sources: Vec<String>,
    /// Allowed log source uids, used as-is.
    pub allowed_source_uids: Vec<i32>,
    /// Atom ids accepted regardless of source credentials.
    pub allowlisted_atom_ids: Vec<u32>,
    /// Configuration time-to-live; `None` means no expiry.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Hard report byte cap in KB.
    pub max_metrics_memory_kb: Option<u32>,
    /// Soft byte threshold in KB; crossing it is flagged for the host.
    pub soft_metrics_memory_kb: Option<u32>,
    /// Metric ids whose data is produced but never reported.
    pub no_report_metric_ids: Vec<i64>,
    /// Seed for the per-metric sampling RNG; random when absent.
    ///
    /// The engine uses `rand::rngs::StdRng`; fixing the seed makes
    /// probabilistic sampling and gauge reservoirs deterministic.
    pub sampling_seed: Option<u64>,
}

impl EngineConfig {
    /// Hard report byte cap in bytes.
    pub fn max_metrics_bytes(&self) -> usize {
        match self.max_metrics_memory_kb {
            Some(kb) if kb > 0 && (kb as usize) * 1024 <= 20 * 1024 * 1024 => kb as usize * 1024,
            Some(_) => DEFAULT_MAX_METRICS_BYTES,
            None => DEFAULT_MAX_METRICS_BYTES,
        }
    }

    /// Soft byte threshold in bytes.
    pub fn trigger_bytes(&self) -> usize {
        match self.soft_metrics_memory_kb {
            Some(kb) if kb > 0 && (kb as usize) * 1024 <= 10 * 1024 * 1024 => kb as usize * 1024,
            Some(_) => DEFAULT_TRIGGER_BYTES,
            None => DEFAULT_TRIGGER_BYTES,
        }
    }

    /// TTL in nanoseconds; -1 when the configuration never expires.
    pub fn ttl_ns(&self) -> i64 {
        match self.ttl {
            Some(d) => d.as_nanos() as i64,
            None => -1,
        }
    }
}

/// A named atom matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Matcher id, unique within the configuration.
    pub id: i64,
    /// The matcher body.
    pub spec: MatcherSpec,
}

/// Matcher variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatcherSpec {
    /// Matches a single atom id with optional field predicates and
    /// field transformations.
    Simple {
        /// Atom id this matcher fires on.
        atom_id: u32,
        /// Field-value predicates, all of which must hold.
        #[serde(default)]
        field_matchers: Vec<FieldValueMatcher>,
        /// Field rewrites applied to produce a transformed event.
        #[serde(default)]
        transforms: Vec<FieldTransform>,
    },
    /// Logical expression over earlier matchers.
    Combination {
        /// AND / OR / NOT.
        operation: LogicalOperation,
        /// Ids of the input matchers; must precede this matcher.
        matcher_ids: Vec<i64>,
    },
}

/// Initial value of a simple predicate before any history is observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateInitialValue {
    /// Start out false.
    #[default]
    False,
    /// Start out unknown until the first transition.
    Unknown,
    /// Start out true.
    True,
}

/// A named predicate (condition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateConfig {
    /// Predicate id, unique within the configuration.
    pub id: i64,
    /// The predicate body.
    pub spec: PredicateSpec,
}

/// Predicate variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredicateSpec {
    /// Two-matcher state machine, optionally sliced by dimensions.
    Simple {
        /// Matcher that turns the predicate true.
        #[serde(default)]
        start_matcher_id: Option<i64>,
        /// Matcher that turns the predicate false.
        #[serde(default)]
        stop_matcher_id: Option<i64>,
        /// Matcher that turns every slice false at once.
        #[serde(default)]
        stop_all_matcher_id: Option<i64>,
        /// Count outstanding starts; a slice turns false only when the
        /// count reaches zero. When disabled the count saturates at 1.
        #[serde(default = "default_true")]
        count_nesting: bool,
        /// Value before any history is observed.
        #[serde(default)]
        initial_value: PredicateInitialValue,
        /// Dimensions that slice this predicate's state.
        #[serde(default)]
        dimensions: Vec<FieldPath>,
    },
    /// Boolean formula over earlier predicates.
    Combination {
        /// AND / OR / NOT.
        operation: LogicalOperation,
        /// Ids of the input predicates; must precede this predicate.
        predicate_ids: Vec<i64>,
    },
}

fn default_true() -> bool {
    true
}

/// Duration metric aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationAggregation {
    /// Measure of the union of active intervals.
    #[default]
    Summed,
    /// Maximum single contiguous active interval per bucket.
    MaxSparse,
}

/// Value metric aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueAggregation {
    /// Sum of extracted values.
    #[default]
    Sum,
    /// Minimum extracted value.
    Min,
    /// Maximum extracted value.
    Max,
    /// Mean of extracted values.
    Avg,
    /// Sum of successive differences.
    Diff,
}

/// Gauge sampling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaugeSampling {
    /// Keep up to N matched snapshots per bucket per key, in arrival order.
    FirstN {
        /// Snapshot budget per bucket per key.
        samples: usize,
    },
    /// Keep one snapshot per bucket per key, chosen by a reservoir rule.
    RandomOne,
    /// Snapshot only when the metric's condition turns true.
    ConditionChangeToTrue,
}

impl Default for GaugeSampling {
    fn default() -> Self {
        GaugeSampling::RandomOne
    }
}

/// Dimensional sampling specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionalSamplingConfig {
    /// Field whose values shard the dimension space.
    pub sampled_what_field: FieldPath,
    /// Number of shards; the metric keeps shard zero.
    pub shard_count: u32,
}

/// One activation rule on a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Matcher that activates the metric.
    pub matcher_id: i64,
    /// How long the activation lasts; zero means forever once triggered.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Matcher that cancels this activation.
    #[serde(default)]
    pub deactivation_matcher_id: Option<i64>,
}

/// A metric definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Metric id, unique within the configuration.
    pub id: i64,
    /// Bucket width; `None` means one effectively infinite bucket.
    /// Recognized widths are 1, 5, 10, 15, 30, and 60 minutes;
    /// anything else is clamped to 5 minutes.
    #[serde(default, with = "humantime_serde")]
    pub bucket: Option<Duration>,
    /// Gating predicate id.
    #[serde(default)]
    pub condition_id: Option<i64>,
    /// Links from metric "what" fields to condition dimensions.
    #[serde(default)]
    pub condition_links: Vec<FieldLink>,
    /// State atoms that slice this metric's output.
    #[serde(default)]
    pub slice_by_state: Vec<u32>,
    /// Links from metric "what" fields to state primary fields.
    #[serde(default)]
    pub state_links: Vec<FieldLink>,
    /// Dimensions extracted from matched events.
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldPath>,
    /// Activation rules; a metric without any is always active.
    #[serde(default)]
    pub activations: Vec<ActivationConfig>,
    /// Probabilistic sampling percentage in [1, 100].
    #[serde(default)]
    pub sampling_percentage: Option<u8>,
    /// Dimensional sharding.
    #[serde(default)]
    pub dimensional_sampling: Option<DimensionalSamplingConfig>,
    /// Dimension count that triggers a warning.
    #[serde(default)]
    pub soft_dimension_limit: Option<usize>,
    /// Dimension count beyond which new keys are dropped.
    #[serde(default)]
    pub hard_dimension_limit: Option<usize>,
    /// Split the current bucket when an app upgrade is notified.
    #[serde(default = "default_true")]
    pub split_on_app_upgrade: bool,
    /// Skip zero/empty buckets for skipped boundaries.
    #[serde(default)]
    pub omit_empty_buckets: bool,
    /// The producer variant.
    pub producer: ProducerConfig,
}

/// Producer variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProducerConfig {
    /// Count matched events.
    Count {
        /// Matcher whose hits are counted.
        what_matcher_id: i64,
    },
    /// Accumulate time a simple predicate is true.
    Duration {
        /// Simple predicate whose active time is measured.
        what_predicate_id: i64,
        /// Summed or max-sparse accumulation.
        #[serde(default)]
        aggregation: DurationAggregation,
        /// Buckets shorter than this are dropped at seal time.
        #[serde(default, with = "humantime_serde")]
        min_duration: Option<Duration>,
    },
    /// Aggregate a numeric field of matched events.
    Value {
        /// Matcher whose events carry the value.
        what_matcher_id: i64,
        /// Field holding the numeric payload.
        value_field: FieldPath,
        /// Aggregation applied per bucket.
        #[serde(default)]
        aggregation: ValueAggregation,
        /// Pull this atom on bucket boundaries instead of relying on
        /// pushed events only.
        #[serde(default)]
        pull_atom_id: Option<u32>,
    },
    /// Sample atom field snapshots.
    Gauge {
        /// Matcher whose events are sampled.
        what_matcher_id: i64,
        /// Fields captured in each snapshot; empty captures all.
        #[serde(default)]
        fields: Vec<FieldPath>,
        /// Sampling strategy.
        #[serde(default)]
        sampling: GaugeSampling,
        /// Pull this atom on bucket boundaries and condition true-edges.
        #[serde(default)]
        pull_atom_id: Option<u32>,
    },
    /// Retain matched events verbatim, deduplicated.
    Event {
        /// Matcher whose events are retained.
        what_matcher_id: i64,
    },
}

impl ProducerConfig {
    /// The id of this producer's "what" component.
    pub fn what_id(&self) -> i64 {
        match self {
            ProducerConfig::Count { what_matcher_id }
            | ProducerConfig::Value { what_matcher_id, .. }
            | ProducerConfig::Gauge { what_matcher_id, .. }
            | ProducerConfig::Event { what_matcher_id } => *what_matcher_id,
            ProducerConfig::Duration { what_predicate_id, .. } => *what_predicate_id,
        }
    }
}

/// An alert over a metric's sealed buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Alert id, unique within the configuration.
    pub id: i64,
    /// Metric this alert watches.
    pub metric_id: i64,
    /// Rolling window size, in buckets.
    pub num_buckets: u32,
    /// Fire when the windowed sum exceeds this value.
    pub trigger_if_sum_gt: i64,
    /// Seconds after a firing during which the same key stays quiet.
    #[serde(default)]
    pub refractory_period_secs: u32,
}

/// Clamp a configured bucket width to the recognized set, in nanoseconds.
pub(crate) fn clamp_bucket_width_ns(width: Option<Duration>, metric_id: i64) -> i64 {
    match width {
        None => i64::MAX,
        Some(d) => {
            let minutes = d.as_secs() / 60;
            if d.as_secs() % 60 == 0 && RECOGNIZED_BUCKET_WIDTHS_MIN.contains(&minutes) {
                d.as_nanos() as i64
            } else {
                tracing::warn!(
                    metric_id,
                    configured_secs = d.as_secs(),
                    "unrecognized bucket width, clamping to 5 minutes"
                );
                DEFAULT_BUCKET_WIDTH.as_nanos() as i64
            }
        }
    }
}
