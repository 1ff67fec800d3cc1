//! Dimensional sampling end to end. Lives in its own binary because the
//! process-wide shard offset can be set only once.

mod common;

use common::*;
use tally::core::{DimensionalSamplingConfig, ProducerConfig};
use tally::dimension::extract_value;
use tally::report::MetricReportData;
use tally::sampling::{dimension_hash, set_shard_offset, shard_offset};
use tally::{FieldPath, Value};

const SHARD_COUNT: u32 = 2;
const OFFSET: i32 = 5;

fn uid_is_retained(uid: i32) -> bool {
    let event = crash(uid, 0);
    let fv = extract_value(&FieldPath::leaf(ATOM_CRASH, 1), &event.values).unwrap();
    let hash = dimension_hash(std::slice::from_ref(&fv));
    hash.wrapping_add(shard_offset() as i64 as u64) % u64::from(SHARD_COUNT) == 0
}

fn sampled_event_metric_config() -> tally::core::EngineConfig {
    let mut metric = base_metric(100, ProducerConfig::Event { what_matcher_id: 1 });
    metric.dimensional_sampling = Some(DimensionalSamplingConfig {
        sampled_what_field: FieldPath::leaf(ATOM_CRASH, 1),
        shard_count: SHARD_COUNT,
    });
    test_config(vec![crash_matcher(1)], vec![], vec![metric])
}

/// S3: with a fixed shard offset, exactly the uids whose shifted hash
/// lands on shard zero are present, each with all of its timestamps.
#[test]
fn dimensional_sampling_selects_consistent_uids() {
    set_shard_offset(OFFSET);

    let uids = [1001, 1002, 1003];
    let mut manager = manager_at(sampled_event_metric_config(), 0);
    for (i, &uid) in uids.iter().enumerate() {
        manager.on_event(&crash(uid, (10 + i as i64) * SEC));
        manager.on_event(&crash(uid, (20 + i as i64) * SEC));
    }

    let report = manager.dump_report(&dump_at(100 * SEC)).unwrap();
    let MetricReportData::Event(entries) = &report.metrics[0].data else {
        panic!("expected event data");
    };

    let mut reported: Vec<i32> = entries
        .iter()
        .map(|entry| match entry.values[0].value {
            Value::Int(uid) => uid,
            _ => panic!("uid field should be an int"),
        })
        .collect();
    reported.sort_unstable();

    let mut expected: Vec<i32> = uids.iter().copied().filter(|&u| uid_is_retained(u)).collect();
    expected.sort_unstable();
    assert_eq!(reported, expected);

    // Every retained uid keeps all of its crash timestamps.
    for (i, &uid) in uids.iter().enumerate() {
        if uid_is_retained(uid) {
            let entry = entries
                .iter()
                .find(|e| e.values[0].value == Value::Int(uid))
                .unwrap();
            assert_eq!(entry.timestamps, vec![(10 + i as i64) * SEC, (20 + i as i64) * SEC]);
        }
    }
}

/// Invariant: the retained dimension set does not depend on event
/// order.
#[test]
fn dimensional_sampling_is_order_independent() {
    set_shard_offset(OFFSET);

    let uids = [1001, 1002, 1003, 1004, 1005, 1006];
    let run = |order: &[i32]| -> Vec<i32> {
        let mut manager = manager_at(sampled_event_metric_config(), 0);
        for (i, &uid) in order.iter().enumerate() {
            manager.on_event(&crash(uid, (1 + i as i64) * SEC));
        }
        let report = manager.dump_report(&dump_at(100 * SEC)).unwrap();
        let MetricReportData::Event(entries) = &report.metrics[0].data else {
            panic!("expected event data");
        };
        let mut reported: Vec<i32> = entries
            .iter()
            .map(|entry| match entry.values[0].value {
                Value::Int(uid) => uid,
                _ => unreachable!(),
            })
            .collect();
        reported.sort_unstable();
        reported
    };

    let forward = run(&uids);
    let mut reversed = uids;
    reversed.reverse();
    assert_eq!(forward, run(&reversed));
}
