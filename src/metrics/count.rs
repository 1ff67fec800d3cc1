//! Count metric producer.
//!
//! Per metric-key, increments the open bucket's counter for each
//! matched event that passes the activation, condition, and sampling
//! gates.

use super::bucket::BucketBounds;
use super::{roll_buckets, MetricCore, SealedBucket};
use crate::condition::Condition;
use crate::core::types::Event;
use crate::dimension::MetricKey;
use crate::external::StateCache;
use crate::report::{CountBucketReport, CountSeries, DumpRequest, MetricReportData};
use ahash::AHashMap;

#[derive(Debug, Clone, PartialEq)]
struct CountBucketData {
    bounds: BucketBounds,
    count: i64,
    condition_true_ns: i64,
}

/// Counts matched events per metric-key per bucket.
#[derive(Debug, Default)]
pub struct CountMetric {
    current: AHashMap<MetricKey, i64>,
    past: AHashMap<MetricKey, Vec<CountBucketData>>,
    last_sealed_keys: Vec<MetricKey>,
}

impl CountMetric {
    /// Empty producer.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_matched(
        &mut self,
        core: &mut MetricCore,
        event: &Event,
        conditions: &[Condition],
        states: &StateCache,
    ) {
        if !core.event_passes_gates(event, conditions) {
            return;
        }
        let key = core.metric_key(&event.values, states);
        let exists = self.current.contains_key(&key) || self.past.contains_key(&key);
        if !exists && !core.guardrail.admit_new_key(self.current.len() + self.past.len()) {
            return;
        }
        *self.current.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn flush_if_needed(&mut self, core: &mut MetricCore, ts: i64) {
        roll_buckets(core, ts, |core, bounds, condition_true_ns, first| {
            self.seal(core, bounds, condition_true_ns, first);
        });
    }

    pub(crate) fn split_bucket(&mut self, core: &mut MetricCore, ts: i64) {
        super::split_bucket(core, ts, |core, bounds, condition_true_ns, first| {
            self.seal(core, bounds, condition_true_ns, first);
        });
    }

    fn seal(&mut self, core: &mut MetricCore, bounds: BucketBounds, condition_true_ns: i64, first: bool) {
        if first {
            self.last_sealed_keys.clear();
            for (key, count) in self.current.drain() {
                core.sealed_outbox.push(SealedBucket {
                    key: key.clone(),
                    bucket_num: bounds.bucket_num,
                    value: count,
                    end_ns: bounds.end_ns,
                });
                self.past.entry(key.clone()).or_default().push(CountBucketData {
                    bounds,
                    count,
                    condition_true_ns,
                });
                self.last_sealed_keys.push(key);
            }
        } else if !core.omit_empty_buckets {
            // Zero buckets for boundaries skipped within this flush.
            for key in &self.last_sealed_keys {
                self.past.entry(key.clone()).or_default().push(CountBucketData {
                    bounds,
                    count: 0,
                    condition_true_ns,
                });
            }
        }
    }

    pub(crate) fn dump(&mut self, core: &MetricCore, request: &DumpRequest) -> MetricReportData {
        let mut keys: Vec<MetricKey> = self.past.keys().cloned().collect();
        if request.include_current_partial_bucket {
            for key in self.current.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys.sort();

        let has_condition = core.condition_index.is_some();
        let mut series = Vec::with_capacity(keys.len());
        for key in keys {
            let mut buckets: Vec<CountBucketReport> = self
                .past
                .get(&key)
                .map(|data| data.iter().map(|b| report_bucket(b, has_condition)).collect())
                .unwrap_or_default();
            if request.include_current_partial_bucket {
                if let Some(&count) = self.current.get(&key) {
                    buckets.push(CountBucketReport {
                        start_elapsed_ns: core.current_bucket_start_ns,
                        end_elapsed_ns: request.dump_time_ns,
                        bucket_num: None,
                        partial: true,
                        count,
                        condition_true_ns: has_condition
                            .then(|| core.condition_timer.peek(request.dump_time_ns)),
                    });
                }
            }
            series.push(CountSeries {
                dimensions: key.what.values().iter().map(|fv| fv.value.clone()).collect(),
                state_values: key.state_values.clone(),
                buckets,
            });
        }

        if request.erase_data {
            self.past.clear();
        }
        MetricReportData::Count(series)
    }

    pub(crate) fn clear_current(&mut self) {
        self.current.clear();
    }

    pub(crate) fn clear_past(&mut self) {
        self.past.clear();
    }

    pub(crate) fn drop_oldest(&mut self) -> bool {
        let oldest = self
            .past
            .iter()
            .filter_map(|(key, buckets)| buckets.first().map(|b| (b.bounds.start_ns, key.clone())))
            .min();
        let Some((_, key)) = oldest else {
            return false;
        };
        if let Some(buckets) = self.past.get_mut(&key) {
            buckets.remove(0);
            if buckets.is_empty() {
                self.past.remove(&key);
            }
        }
        true
    }

    pub(crate) fn byte_size(&self) -> usize {
        let key_bytes: usize = self
            .past
            .keys()
            .chain(self.current.keys())
            .map(|k| 16 + 24 * (k.what.values().len() + k.state_values.values().len()))
            .sum();
        let bucket_bytes: usize = self.past.values().map(|v| v.len() * 48).sum();
        key_bytes + bucket_bytes + self.current.len() * 8
    }
}

fn report_bucket(data: &CountBucketData, has_condition: bool) -> CountBucketReport {
    CountBucketReport {
        start_elapsed_ns: data.bounds.start_ns,
        end_elapsed_ns: data.bounds.end_ns,
        bucket_num: data.bounds.bucket_num,
        partial: data.bounds.partial,
        count: data.count,
        condition_true_ns: has_condition.then_some(data.condition_true_ns),
    }
}
