//! Report structures produced by a dump.
//!
//! A [`ConfigReport`] nests one [`MetricReport`] per reportable metric,
//! each carrying its bucket series per dimension. Dimensions are
//! expanded: the field path is sent once per metric and each series
//! carries only its leaf values, in path order. Data is sorted by
//! dimension so that repeated dumps of the same state serialize to
//! identical bytes.

use crate::core::config::ConfigKey;
use crate::core::types::{FieldPath, FieldValue, Value};
use crate::dimension::DimensionKey;
use serde::{Deserialize, Serialize};

/// How much work a dump may spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpLatency {
    /// Skip optional recomputation and pulls that could block.
    Fast,
    /// Take the time to produce the fullest report.
    Slow,
}

/// Parameters of one dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpRequest {
    /// Logical timestamp of the dump, elapsed nanoseconds.
    pub dump_time_ns: i64,
    /// Include the still-open bucket as a partial snapshot.
    pub include_current_partial_bucket: bool,
    /// Drain sealed buckets after reporting them.
    pub erase_data: bool,
    /// Latency hint.
    pub latency: DumpLatency,
}

/// Report for one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigReport {
    /// Which configuration produced this report.
    pub config_key: ConfigKey,
    /// When the previous report was taken.
    pub last_report_time_ns: i64,
    /// Logical timestamp of this dump.
    pub dump_time_ns: i64,
    /// Set when the byte cap forced dropping oldest buckets.
    pub truncated_for_memory: bool,
    /// Producer-side byte estimate at dump time.
    pub estimated_bytes: usize,
    /// One report per metric, in configuration order.
    pub metrics: Vec<MetricReport>,
}

/// Report for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Metric id.
    pub metric_id: i64,
    /// Whether the metric was active at dump time.
    pub is_active: bool,
    /// Set when the hard dimension guardrail dropped keys.
    pub dimension_guardrail_hit: bool,
    /// Time base the bucket numbers are relative to.
    pub time_base_ns: i64,
    /// Bucket width in nanoseconds ([`i64::MAX`] = infinite).
    pub bucket_size_ns: i64,
    /// Dimension field paths, sent once; series carry leaf values only.
    pub dimension_path_in_what: Vec<FieldPath>,
    /// The payload.
    pub data: MetricReportData,
}

/// Per-kind report payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricReportData {
    /// Count metric series.
    Count(Vec<CountSeries>),
    /// Duration metric series.
    Duration(Vec<DurationSeries>),
    /// Value metric series.
    Value(Vec<ValueSeries>),
    /// Gauge metric series.
    Gauge(Vec<GaugeSeries>),
    /// Event metric entries.
    Event(Vec<EventEntry>),
}

impl MetricReportData {
    /// Number of series or entries in this payload.
    pub fn len(&self) -> usize {
        match self {
            MetricReportData::Count(v) => v.len(),
            MetricReportData::Duration(v) => v.len(),
            MetricReportData::Value(v) => v.len(),
            MetricReportData::Gauge(v) => v.len(),
            MetricReportData::Event(v) => v.len(),
        }
    }

    /// True when the payload has no series or entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Count buckets for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSeries {
    /// Leaf dimension values, in `dimension_path_in_what` order.
    pub dimensions: Vec<Value>,
    /// State values this series is sliced on.
    pub state_values: DimensionKey,
    /// Sealed buckets, oldest first.
    pub buckets: Vec<CountBucketReport>,
}

/// One sealed count bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountBucketReport {
    /// Inclusive start, elapsed nanoseconds.
    pub start_elapsed_ns: i64,
    /// Exclusive end, elapsed nanoseconds.
    pub end_elapsed_ns: i64,
    /// Bucket number when full-sized and aligned.
    pub bucket_num: Option<u64>,
    /// Set for partial buckets.
    pub partial: bool,
    /// Events counted.
    pub count: i64,
    /// Nanoseconds the metric's condition was true within the bucket.
    pub condition_true_ns: Option<i64>,
}

/// Duration buckets for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSeries {
    /// Leaf dimension values, in `dimension_path_in_what` order.
    pub dimensions: Vec<Value>,
    /// State values this series is sliced on.
    pub state_values: DimensionKey,
    /// Sealed buckets, oldest first.
    pub buckets: Vec<DurationBucketReport>,
}

/// One sealed duration bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationBucketReport {
    /// Inclusive start, elapsed nanoseconds.
    pub start_elapsed_ns: i64,
    /// Exclusive end, elapsed nanoseconds.
    pub end_elapsed_ns: i64,
    /// Bucket number when full-sized and aligned.
    pub bucket_num: Option<u64>,
    /// Set for partial buckets.
    pub partial: bool,
    /// Accumulated duration in nanoseconds.
    pub duration_ns: i64,
    /// Nanoseconds the metric's condition was true within the bucket.
    pub condition_true_ns: Option<i64>,
}

/// Value buckets for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSeries {
    /// Leaf dimension values, in `dimension_path_in_what` order.
    pub dimensions: Vec<Value>,
    /// State values this series is sliced on.
    pub state_values: DimensionKey,
    /// Sealed buckets, oldest first.
    pub buckets: Vec<ValueBucketReport>,
}

/// One sealed value bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBucketReport {
    /// Inclusive start, elapsed nanoseconds.
    pub start_elapsed_ns: i64,
    /// Exclusive end, elapsed nanoseconds.
    pub end_elapsed_ns: i64,
    /// Bucket number when full-sized and aligned.
    pub bucket_num: Option<u64>,
    /// Set for partial buckets.
    pub partial: bool,
    /// Aggregated value.
    pub value: f64,
    /// Nanoseconds the metric's condition was true within the bucket.
    pub condition_true_ns: Option<i64>,
    /// Set when a pull for this bucket failed.
    pub pull_failed: bool,
}

/// Gauge buckets for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeSeries {
    /// Leaf dimension values, in `dimension_path_in_what` order.
    pub dimensions: Vec<Value>,
    /// State values this series is sliced on.
    pub state_values: DimensionKey,
    /// Sealed buckets, oldest first.
    pub buckets: Vec<GaugeBucketReport>,
}

/// One sealed gauge bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeBucketReport {
    /// Inclusive start, elapsed nanoseconds.
    pub start_elapsed_ns: i64,
    /// Exclusive end, elapsed nanoseconds.
    pub end_elapsed_ns: i64,
    /// Bucket number when full-sized and aligned.
    pub bucket_num: Option<u64>,
    /// Set for partial buckets.
    pub partial: bool,
    /// Sampled atom snapshots, in retention order.
    pub atoms: Vec<GaugeAtomReport>,
}

/// One sampled atom snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeAtomReport {
    /// When the snapshot was taken.
    pub elapsed_ns: i64,
    /// Captured field-values.
    pub values: Vec<FieldValue>,
}

/// One deduplicated event entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    /// Atom type of the retained events.
    pub tag_id: u32,
    /// The shared field-value tuple.
    pub values: Vec<FieldValue>,
    /// Timestamps of every occurrence, in arrival order.
    pub timestamps: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serialization_round_trip() {
        let report = ConfigReport {
            config_key: ConfigKey { uid: 1000, id: 1 },
            last_report_time_ns: 0,
            dump_time_ns: 100,
            truncated_for_memory: false,
            estimated_bytes: 64,
            metrics: vec![MetricReport {
                metric_id: 7,
                is_active: true,
                dimension_guardrail_hit: false,
                time_base_ns: 0,
                bucket_size_ns: 300_000_000_000,
                dimension_path_in_what: vec![FieldPath::leaf(42, 1)],
                data: MetricReportData::Count(vec![CountSeries {
                    dimensions: vec![Value::Int(7)],
                    state_values: DimensionKey::empty(),
                    buckets: vec![CountBucketReport {
                        start_elapsed_ns: 0,
                        end_elapsed_ns: 300_000_000_000,
                        bucket_num: Some(0),
                        partial: false,
                        count: 3,
                        condition_true_ns: None,
                    }],
                }]),
            }],
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: ConfigReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, back);
    }

    #[test]
    fn test_payload_len() {
        let data = MetricReportData::Event(vec![]);
        assert!(data.is_empty());
        let data = MetricReportData::Count(vec![CountSeries {
            dimensions: vec![],
            state_values: DimensionKey::empty(),
            buckets: vec![],
        }]);
        assert_eq!(data.len(), 1);
    }
}
