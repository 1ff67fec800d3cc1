//! Round-trip laws: repeated dumps, erase semantics, persisted
//! metadata, configuration updates, partial buckets, and guardrails.

mod common;

use common::*;
use tally::core::{AlertConfig, EngineConfig, GaugeSampling, ProducerConfig};
use tally::engine::EngineMetadata;
use tally::report::MetricReportData;
use tally::{FieldPath, Value};

fn counting_config() -> EngineConfig {
    let mut metric = base_metric(100, ProducerConfig::Count { what_matcher_id: 1 });
    metric.bucket = Some(BUCKET_5MIN);
    metric.dimensions_in_what = vec![FieldPath::leaf(ATOM_CRASH, 1)];
    test_config(vec![crash_matcher(1)], vec![], vec![metric])
}

/// Reporting with `erase_data=false` twice produces identical bytes;
/// with `erase_data=true` the second report omits those buckets.
#[test]
fn dump_twice_without_erase_is_identical() {
    let mut manager = manager_at(counting_config(), 0);
    manager.on_event(&crash(7, 10 * SEC));
    manager.on_event(&crash(8, 20 * SEC));
    manager.on_event(&crash(7, B + 10 * SEC));

    let request = dump_at(2 * B);
    let first = manager.dump_report(&request).unwrap();
    let second = manager.dump_report(&request).unwrap();
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );

    let mut erasing = request;
    erasing.erase_data = true;
    let third = manager.dump_report(&erasing).unwrap();
    assert_eq!(first.metrics, third.metrics);

    // Everything sealed was drained; a later dump starts empty.
    let fourth = manager.dump_report(&dump_at(2 * B + SEC)).unwrap();
    assert!(fourth.metrics[0].data.is_empty());
    assert_eq!(fourth.last_report_time_ns, 2 * B);
}

/// Persist-then-load alert metadata preserves refractory ends within
/// one-second precision.
#[test]
fn alert_metadata_round_trip() {
    let mut config = counting_config();
    config.alerts = vec![AlertConfig {
        id: 9,
        metric_id: 100,
        num_buckets: 1,
        trigger_if_sum_gt: 2,
        refractory_period_secs: 600,
    }];

    let mut manager = manager_at(config.clone(), 0);
    for i in 0..3 {
        manager.on_event(&crash(7, (10 + i) * SEC));
    }
    // Sealing bucket 0 crosses the threshold (3 > 2).
    manager.on_event(&crash(7, B + SEC));
    assert_eq!(manager.diagnostics().alerts_fired, 1);

    let blob = manager.write_metadata().to_json().unwrap();
    let metadata = EngineMetadata::from_json(&blob).unwrap();
    assert_eq!(metadata.alerts.len(), 1);

    // A rebooted manager with the metadata stays refractory.
    let mut restored = manager_at(config.clone(), 0);
    restored.load_metadata(&metadata);
    for i in 0..3 {
        restored.on_event(&crash(7, (10 + i) * SEC));
    }
    restored.on_event(&crash(7, B + SEC)); // seals at 300s < refractory end
    assert_eq!(restored.diagnostics().alerts_fired, 0);

    // A manager without the metadata fires immediately.
    let mut fresh = manager_at(config, 0);
    for i in 0..3 {
        fresh.on_event(&crash(7, (10 + i) * SEC));
    }
    fresh.on_event(&crash(7, B + SEC));
    assert_eq!(fresh.diagnostics().alerts_fired, 1);
}

/// Configuration update with identical content preserves all ongoing
/// bucket state.
#[test]
fn identical_config_update_preserves_state() {
    let config = counting_config();
    let mut manager = manager_at(config.clone(), 0);
    manager.on_event(&crash(7, 10 * SEC));
    manager.on_event(&crash(7, 20 * SEC));

    assert!(manager.update_config(config, 30 * SEC));
    manager.on_event(&crash(7, 40 * SEC));

    let report = manager.dump_report(&dump_with_partial(50 * SEC)).unwrap();
    let MetricReportData::Count(series) = &report.metrics[0].data else {
        panic!("expected count data");
    };
    assert_eq!(series.len(), 1);
    // No key reset: all three events in one partial bucket.
    assert_eq!(series[0].buckets.len(), 1);
    assert_eq!(series[0].buckets[0].count, 3);
}

/// Changing a metric's definition rebuilds it from scratch, while an
/// invalid update leaves the previous configuration in place.
#[test]
fn changed_or_invalid_config_updates() {
    let config = counting_config();
    let mut manager = manager_at(config.clone(), 0);
    manager.on_event(&crash(7, 10 * SEC));

    // Invalid update: references a missing matcher. Rejected, old
    // config keeps running.
    let mut broken = config.clone();
    broken.metrics[0].producer = ProducerConfig::Count { what_matcher_id: 99 };
    assert!(!manager.update_config(broken, 20 * SEC));
    assert!(manager.is_config_valid());
    assert_eq!(manager.diagnostics().config_updates_rejected, 1);
    manager.on_event(&crash(7, 25 * SEC));

    // Changed definition: counts restart.
    let mut changed = config;
    changed.metrics[0].hard_dimension_limit = Some(10);
    assert!(manager.update_config(changed, 30 * SEC));
    manager.on_event(&crash(7, 40 * SEC));

    let report = manager.dump_report(&dump_with_partial(50 * SEC)).unwrap();
    let MetricReportData::Count(series) = &report.metrics[0].data else {
        panic!("expected count data");
    };
    assert_eq!(series[0].buckets.iter().map(|b| b.count).sum::<i64>(), 1);
}

/// An app upgrade splits the open bucket into partial buckets with
/// explicit timestamps.
#[test]
fn app_upgrade_splits_partial_bucket() {
    let mut manager = manager_at(counting_config(), 0);
    manager.on_event(&crash(7, 10 * SEC));
    manager.notify_app_upgrade(20 * SEC, "com.example.app");
    manager.on_event(&crash(7, 30 * SEC));

    let report = manager.dump_report(&dump_with_partial(40 * SEC)).unwrap();
    let MetricReportData::Count(series) = &report.metrics[0].data else {
        panic!("expected count data");
    };
    let buckets = &series[0].buckets;
    assert_eq!(buckets.len(), 2);
    assert!(buckets[0].partial);
    assert_eq!(buckets[0].start_elapsed_ns, 0);
    assert_eq!(buckets[0].end_elapsed_ns, 20 * SEC);
    assert_eq!(buckets[0].count, 1);
    assert_eq!(buckets[1].start_elapsed_ns, 20 * SEC);
    assert_eq!(buckets[1].count, 1);
}

/// The hard dimension guardrail drops new keys and flags the report.
#[test]
fn dimension_guardrail_drops_and_flags() {
    let mut config = counting_config();
    config.metrics[0].soft_dimension_limit = Some(1);
    config.metrics[0].hard_dimension_limit = Some(2);
    let mut manager = manager_at(config, 0);

    manager.on_event(&crash(1, 10 * SEC));
    manager.on_event(&crash(2, 11 * SEC));
    manager.on_event(&crash(3, 12 * SEC)); // beyond the hard limit
    manager.on_event(&crash(1, 13 * SEC)); // existing keys still count

    let report = manager.dump_report(&dump_with_partial(20 * SEC)).unwrap();
    assert!(report.metrics[0].dimension_guardrail_hit);
    let MetricReportData::Count(series) = &report.metrics[0].data else {
        panic!("expected count data");
    };
    assert_eq!(series.len(), 2);
    let total: i64 = series.iter().flat_map(|s| s.buckets.iter().map(|b| b.count)).sum();
    assert_eq!(total, 3);
    assert_eq!(manager.diagnostics().hard_guardrail_hits, 1);
}

/// An invalid configuration drops events and refuses reports, keeping
/// the reason for inspection.
#[test]
fn invalid_config_is_inert() {
    let mut config = counting_config();
    config.metrics[0].producer = ProducerConfig::Count { what_matcher_id: 99 };
    let mut manager = manager_at(config, 0);

    assert!(!manager.is_config_valid());
    assert!(manager.invalid_config_reason().is_some());
    manager.on_event(&crash(7, SEC));
    assert!(manager.dump_report(&dump_at(10 * SEC)).is_none());
    assert_eq!(manager.diagnostics().events_processed, 0);
}

/// RANDOM_ONE_SAMPLE retains the k-th candidate with probability 1/k:
/// over many buckets each of three candidates is held roughly a third
/// of the time.
#[test]
fn gauge_reservoir_is_fair() {
    const ATOM_SNAPSHOT: u32 = 50;
    const BUCKETS: usize = 300;
    let mut metric = base_metric(
        100,
        ProducerConfig::Gauge {
            what_matcher_id: 1,
            fields: vec![FieldPath::leaf(ATOM_SNAPSHOT, 1)],
            sampling: GaugeSampling::RandomOne,
            pull_atom_id: None,
        },
    );
    metric.bucket = Some(BUCKET_5MIN);
    let config = test_config(vec![simple_matcher(1, ATOM_SNAPSHOT)], vec![], vec![metric]);
    let mut manager = manager_at(config, 0);

    for bucket in 0..BUCKETS as i64 {
        for position in 0..3 {
            let ts = bucket * B + (10 + position) * SEC;
            let event = tally::Event::builder(ATOM_SNAPSHOT)
                .uid(SOURCE_UID)
                .at(ts)
                .int_field(1, position as i32)
                .build();
            manager.on_event(&event);
        }
    }

    let report = manager.dump_report(&dump_at(BUCKETS as i64 * B + SEC)).unwrap();
    let MetricReportData::Gauge(series) = &report.metrics[0].data else {
        panic!("expected gauge data");
    };
    let mut held = [0usize; 3];
    for bucket in &series[0].buckets {
        assert_eq!(bucket.atoms.len(), 1);
        let Value::Int(position) = bucket.atoms[0].values[0].value else {
            panic!("expected int payload");
        };
        held[position as usize] += 1;
    }
    assert_eq!(held.iter().sum::<usize>(), BUCKETS);
    for count in held {
        // 1/3 of 300 = 100; allow generous slack for a seeded RNG.
        assert!((55..=145).contains(&count), "skewed reservoir: {:?}", held);
    }
}
