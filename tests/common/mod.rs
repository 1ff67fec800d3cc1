//! Shared fixtures: a small atom vocabulary and config builders.

#![allow(dead_code)]

use std::time::Duration;
use tally::core::{
    ConfigKey, EngineConfig, Event, MatcherConfig, MatcherSpec, MetricConfig, PredicateConfig,
    PredicateInitialValue, PredicateSpec, ProducerConfig,
};
use tally::engine::MetricsManager;
use tally::external::Collaborators;
use tally::matcher::{FieldValueMatcher, ValueComparison};
use tally::report::{DumpLatency, DumpRequest};
use tally::{FieldPath, Value};

pub const SEC: i64 = 1_000_000_000;
/// One five-minute bucket, in nanoseconds.
pub const B: i64 = 300 * SEC;
pub const BUCKET_5MIN: Duration = Duration::from_secs(300);

/// Uid all test events are logged from; allowed in every test config.
pub const SOURCE_UID: i32 = 1234;

/// Foreground-state atom: uid in field 1, state in field 2.
pub const ATOM_FOREGROUND: u32 = 3;
pub const STATE_BACKGROUND: i32 = 1;
pub const STATE_FOREGROUND: i32 = 0;

/// Crash atom: uid in field 1.
pub const ATOM_CRASH: u32 = 42;

/// Boot-complete style trigger atoms for activation tests.
pub const ATOM_ACTIVATE: u32 = 60;
pub const ATOM_CANCEL: u32 = 61;

pub fn crash_matcher(id: i64) -> MatcherConfig {
    MatcherConfig {
        id,
        spec: MatcherSpec::Simple {
            atom_id: ATOM_CRASH,
            field_matchers: vec![],
            transforms: vec![],
        },
    }
}

pub fn simple_matcher(id: i64, atom_id: u32) -> MatcherConfig {
    MatcherConfig {
        id,
        spec: MatcherSpec::Simple {
            atom_id,
            field_matchers: vec![],
            transforms: vec![],
        },
    }
}

/// Matcher on the foreground-state atom filtered to one state value.
pub fn state_matcher(id: i64, state: i32) -> MatcherConfig {
    MatcherConfig {
        id,
        spec: MatcherSpec::Simple {
            atom_id: ATOM_FOREGROUND,
            field_matchers: vec![FieldValueMatcher {
                field: FieldPath::leaf(ATOM_FOREGROUND, 2),
                comparison: ValueComparison::Equals(Value::Int(state)),
            }],
            transforms: vec![],
        },
    }
}

/// "uid is in background" predicate, sliced by uid.
pub fn background_predicate(id: i64, start_matcher: i64, stop_matcher: i64) -> PredicateConfig {
    PredicateConfig {
        id,
        spec: PredicateSpec::Simple {
            start_matcher_id: Some(start_matcher),
            stop_matcher_id: Some(stop_matcher),
            stop_all_matcher_id: None,
            count_nesting: true,
            initial_value: PredicateInitialValue::False,
            dimensions: vec![FieldPath::leaf(ATOM_FOREGROUND, 1)],
        },
    }
}

/// A metric config with every optional knob off.
pub fn base_metric(id: i64, producer: ProducerConfig) -> MetricConfig {
    MetricConfig {
        id,
        bucket: None,
        condition_id: None,
        condition_links: vec![],
        slice_by_state: vec![],
        state_links: vec![],
        dimensions_in_what: vec![],
        activations: vec![],
        sampling_percentage: None,
        dimensional_sampling: None,
        soft_dimension_limit: None,
        hard_dimension_limit: None,
        split_on_app_upgrade: true,
        omit_empty_buckets: false,
        producer,
    }
}

pub fn crash(uid: i32, ts: i64) -> Event {
    Event::builder(ATOM_CRASH)
        .uid(SOURCE_UID)
        .at(ts)
        .int_field(1, uid)
        .build()
}

pub fn foreground_state(uid: i32, state: i32, ts: i64) -> Event {
    Event::builder(ATOM_FOREGROUND)
        .uid(SOURCE_UID)
        .at(ts)
        .int_field(1, uid)
        .int_field(2, state)
        .build()
}

pub fn test_config(
    matchers: Vec<MatcherConfig>,
    predicates: Vec<PredicateConfig>,
    metrics: Vec<MetricConfig>,
) -> EngineConfig {
    EngineConfig {
        matchers,
        predicates,
        metrics,
        allowed_source_uids: vec![SOURCE_UID],
        sampling_seed: Some(0),
        ..Default::default()
    }
}

pub fn manager_at(config: EngineConfig, time_base_ns: i64) -> MetricsManager {
    MetricsManager::new(
        ConfigKey { uid: SOURCE_UID, id: 1 },
        config,
        time_base_ns,
        time_base_ns,
        Collaborators::default(),
    )
}

pub fn dump_at(ts: i64) -> DumpRequest {
    DumpRequest {
        dump_time_ns: ts,
        include_current_partial_bucket: false,
        erase_data: false,
        latency: DumpLatency::Slow,
    }
}

pub fn dump_with_partial(ts: i64) -> DumpRequest {
    DumpRequest {
        include_current_partial_bucket: true,
        ..dump_at(ts)
    }
}
