//! Value metric producer.
//!
//! Extracts a numeric field from each matched event (or from pulled
//! data) and applies the configured aggregation to the open bucket per
//! metric-key. Diff aggregation accumulates successive differences,
//! carrying the base across buckets.

use super::bucket::BucketBounds;
use super::{roll_buckets, MetricCore, SealedBucket};
use crate::condition::{Condition, ConditionState};
use crate::core::config::ValueAggregation;
use crate::core::types::{Event, FieldPath};
use crate::dimension::{filter_values, MetricKey};
use crate::external::{StateCache, StatsPuller};
use crate::report::{DumpRequest, MetricReportData, ValueBucketReport, ValueSeries};
use ahash::AHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct ValueBucketData {
    bounds: BucketBounds,
    value: f64,
    condition_true_ns: i64,
    pull_failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct ValueAggregate {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    diff_sum: f64,
}

impl Default for ValueAggregate {
    fn default() -> Self {
        ValueAggregate {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            diff_sum: 0.0,
        }
    }
}

impl ValueAggregate {
    fn value(&self, aggregation: ValueAggregation) -> f64 {
        match aggregation {
            ValueAggregation::Sum => self.sum,
            ValueAggregation::Min => self.min,
            ValueAggregation::Max => self.max,
            ValueAggregation::Avg => {
                if self.count == 0 {
                    0.0
                } else {
                    self.sum / self.count as f64
                }
            }
            ValueAggregation::Diff => self.diff_sum,
        }
    }
}

/// Aggregates a numeric field per metric-key per bucket.
pub struct ValueMetric {
    /// Field holding the numeric payload.
    pub value_field: FieldPath,
    /// Aggregation applied per bucket.
    pub aggregation: ValueAggregation,
    /// Atom pulled on condition true-edges, if pull-based.
    pub pull_atom_id: Option<u32>,
    puller: Arc<dyn StatsPuller>,
    current: AHashMap<MetricKey, ValueAggregate>,
    past: AHashMap<MetricKey, Vec<ValueBucketData>>,
    /// Diff bases per key, carried across buckets.
    diff_bases: AHashMap<MetricKey, f64>,
    pull_failed_current: bool,
    last_condition_true: bool,
    last_sealed_keys: Vec<MetricKey>,
}

impl std::fmt::Debug for ValueMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueMetric")
            .field("value_field", &self.value_field)
            .field("aggregation", &self.aggregation)
            .field("pull_atom_id", &self.pull_atom_id)
            .field("current_keys", &self.current.len())
            .field("past_keys", &self.past.len())
            .finish_non_exhaustive()
    }
}

impl ValueMetric {
    /// Producer extracting `value_field` under `aggregation`.
    pub fn new(
        value_field: FieldPath,
        aggregation: ValueAggregation,
        pull_atom_id: Option<u32>,
        puller: Arc<dyn StatsPuller>,
    ) -> Self {
        ValueMetric {
            value_field,
            aggregation,
            pull_atom_id,
            puller,
            current: AHashMap::new(),
            past: AHashMap::new(),
            diff_bases: AHashMap::new(),
            pull_failed_current: false,
            last_condition_true: false,
            last_sealed_keys: Vec::new(),
        }
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
        let Some(value) = crate::dimension::extract_value(&self.value_field, &event.values)
            .and_then(|fv| fv.value.as_double())
        else {
            return;
        };
        let key = core.metric_key(&event.values, states);
        if !self.admit(core, &key) {
            return;
        }
        self.observe(key, value);
    }

    /// The unsliced condition flipped; pull-based metrics pull on the
    /// true edge.
    pub(crate) fn on_condition_edge(&mut self, core: &mut MetricCore, state: ConditionState, ts: i64) {
        let now_true = state.is_true();
        let rising = now_true && !self.last_condition_true;
        self.last_condition_true = now_true;
        if rising && self.pull_atom_id.is_some() {
            self.pull_into_bucket(core, ts);
        }
    }

    fn pull_into_bucket(&mut self, core: &mut MetricCore, _ts: i64) {
        let Some(atom_id) = self.pull_atom_id else {
            return;
        };
        match self.puller.pull(atom_id, &[]) {
            Ok(events) => {
                for event in events {
                    if event.tag_id != atom_id {
                        continue;
                    }
                    if let Some(sampler) = &core.dimensional_sampler {
                        if !sampler.keep(&event.values) {
                            continue;
                        }
                    }
                    let Some(value) = crate::dimension::extract_value(&self.value_field, &event.values)
                        .and_then(|fv| fv.value.as_double())
                    else {
                        continue;
                    };
                    // Pulled snapshots carry no sliced-state context.
                    let key =
                        MetricKey::what_only(filter_values(&core.dimensions_in_what, &event.values));
                    if !self.admit(core, &key) {
                        continue;
                    }
                    self.observe(key, value);
                }
            }
            Err(error) => {
                tracing::warn!(metric_id = core.metric_id, atom_id, %error, "pull failed");
                core.diagnostics.note_pull_failure();
                self.pull_failed_current = true;
            }
        }
    }

    fn admit(&mut self, core: &mut MetricCore, key: &MetricKey) -> bool {
        let exists = self.current.contains_key(key) || self.past.contains_key(key);
        exists || core.guardrail.admit_new_key(self.current.len() + self.past.len())
    }

    fn observe(&mut self, key: MetricKey, value: f64) {
        if let Some(base) = self.diff_bases.get(&key) {
            let delta = value - base;
            self.current.entry(key.clone()).or_default().diff_sum += delta;
        }
        self.diff_bases.insert(key.clone(), value);

        let aggregate = self.current.entry(key).or_default();
        aggregate.sum += value;
        aggregate.count += 1;
        aggregate.min = aggregate.min.min(value);
        aggregate.max = aggregate.max.max(value);
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
            let pull_failed = self.pull_failed_current;
            self.pull_failed_current = false;
            for (key, aggregate) in self.current.drain() {
                let value = aggregate.value(self.aggregation);
                core.sealed_outbox.push(SealedBucket {
                    key: key.clone(),
                    bucket_num: bounds.bucket_num,
                    value: value as i64,
                    end_ns: bounds.end_ns,
                });
                self.past.entry(key.clone()).or_default().push(ValueBucketData {
                    bounds,
                    value,
                    condition_true_ns,
                    pull_failed,
                });
                self.last_sealed_keys.push(key);
            }
        } else if !core.omit_empty_buckets {
            for key in &self.last_sealed_keys {
                self.past.entry(key.clone()).or_default().push(ValueBucketData {
                    bounds,
                    value: 0.0,
                    condition_true_ns,
                    pull_failed: false,
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
            let mut buckets: Vec<ValueBucketReport> = self
                .past
                .get(&key)
                .map(|data| {
                    data.iter()
                        .map(|b| ValueBucketReport {
                            start_elapsed_ns: b.bounds.start_ns,
                            end_elapsed_ns: b.bounds.end_ns,
                            bucket_num: b.bounds.bucket_num,
                            partial: b.bounds.partial,
                            value: b.value,
                            condition_true_ns: has_condition.then_some(b.condition_true_ns),
                            pull_failed: b.pull_failed,
                        })
                        .collect()
                })
                .unwrap_or_default();
            if request.include_current_partial_bucket {
                if let Some(aggregate) = self.current.get(&key) {
                    buckets.push(ValueBucketReport {
                        start_elapsed_ns: core.current_bucket_start_ns,
                        end_elapsed_ns: request.dump_time_ns,
                        bucket_num: None,
                        partial: true,
                        value: aggregate.value(self.aggregation),
                        condition_true_ns: has_condition
                            .then(|| core.condition_timer.peek(request.dump_time_ns)),
                        pull_failed: self.pull_failed_current,
                    });
                }
            }
            series.push(ValueSeries {
                dimensions: key.what.values().iter().map(|fv| fv.value.clone()).collect(),
                state_values: key.state_values.clone(),
                buckets,
            });
        }

        if request.erase_data {
            self.past.clear();
        }
        MetricReportData::Value(series)
    }

    pub(crate) fn clear_current(&mut self) {
        self.current.clear();
        self.pull_failed_current = false;
    }

    pub(crate) fn clear_past(&mut self) {
        self.past.clear();
    }

    pub(crate) fn drop_oldest(&mut self) -> bool {
        let oldest = self
            .past
            .iter()
            .filter_map(|(key, buckets)| buckets.first().map(|b| (b.bounds.start_ns, key.clone())))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
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
        let bucket_bytes: usize = self.past.values().map(|v| v.len() * 64).sum();
        key_bytes + bucket_bytes + self.current.len() * 48
    }
}
