//! Duration metric producer.
//!
//! Derived from a simple predicate designated as the metric's "what":
//! start events open an interval per metric-key, stop events close it,
//! and stop-all closes everything. With nesting, overlapping starts
//! keep one interval open until the count returns to zero. Trackers
//! pause while the metric's external condition is false or the metric
//! is inactive, and partial intervals carry across bucket rolls.

use super::bucket::BucketBounds;
use super::{roll_buckets, MetricCore, SealedBucket, SliceTransition};
use crate::condition::{wizard, Condition};
use crate::core::config::DurationAggregation;
use crate::core::types::Event;
use crate::dimension::{link_key_from_dimension, MetricKey};
use crate::external::StateCache;
use crate::report::{DumpRequest, DurationBucketReport, DurationSeries, MetricReportData};
use ahash::AHashMap;

#[derive(Debug, Clone, PartialEq)]
struct DurationBucketData {
    bounds: BucketBounds,
    duration_ns: i64,
    condition_true_ns: i64,
}

/// Per-key interval accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DurationTracker {
    /// Outstanding starts; the slice is active while non-zero.
    active_count: u32,
    /// Accumulation is suspended (condition false or metric inactive).
    paused: bool,
    /// Start of the open interval piece, valid while running.
    interval_start_ns: i64,
    /// Union measure accumulated in the open bucket.
    accumulated_ns: i64,
    /// Longest contiguous piece seen in the open bucket.
    max_piece_ns: i64,
}

impl DurationTracker {
    fn new(paused: bool) -> Self {
        DurationTracker {
            active_count: 0,
            paused,
            interval_start_ns: 0,
            accumulated_ns: 0,
            max_piece_ns: 0,
        }
    }

    fn running(&self) -> bool {
        self.active_count > 0 && !self.paused
    }

    /// Close the open piece at `ts`, folding it into the accumulators.
    fn close_piece(&mut self, ts: i64) {
        let piece = (ts - self.interval_start_ns).max(0);
        self.accumulated_ns += piece;
        self.max_piece_ns = self.max_piece_ns.max(piece);
    }
}

/// Accumulates predicate-true time per metric-key per bucket.
#[derive(Debug)]
pub struct DurationMetric {
    /// Matcher index opening intervals.
    pub start_index: usize,
    /// Matcher index closing intervals.
    pub stop_index: Option<usize>,
    /// Matcher index closing every interval at once.
    pub stop_all_index: Option<usize>,
    /// Count outstanding starts instead of saturating at one.
    pub nested: bool,
    /// Summed or max-sparse accumulation.
    pub aggregation: DurationAggregation,
    /// Buckets shorter than this are dropped at seal time.
    pub min_duration_ns: Option<i64>,
    trackers: AHashMap<MetricKey, DurationTracker>,
    past: AHashMap<MetricKey, Vec<DurationBucketData>>,
}

impl DurationMetric {
    /// Producer wired to its start/stop/stop-all matchers.
    pub fn new(
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        nested: bool,
        aggregation: DurationAggregation,
        min_duration_ns: Option<i64>,
    ) -> Self {
        DurationMetric {
            start_index,
            stop_index,
            stop_all_index,
            nested,
            aggregation,
            min_duration_ns,
            trackers: AHashMap::new(),
            past: AHashMap::new(),
        }
    }

    pub(crate) fn on_matched(
        &mut self,
        core: &mut MetricCore,
        matcher_index: usize,
        event: &Event,
        conditions: &[Condition],
        states: &StateCache,
    ) {
        let ts = event.elapsed_ns;
        if Some(matcher_index) == self.stop_all_index {
            for (key, tracker) in self.trackers.iter_mut() {
                if tracker.running() {
                    tracker.close_piece(ts);
                    core.slice_outbox.push(SliceTransition {
                        key: key.clone(),
                        started: false,
                        ts_ns: ts,
                        ongoing_ns: tracker.accumulated_ns,
                    });
                }
                tracker.active_count = 0;
            }
            return;
        }

        // Dimensional sampling is stable per key, so starts and stops of
        // one slice always agree. Probabilistic sampling would unpair
        // them and is not applied to durations.
        if let Some(sampler) = &core.dimensional_sampler {
            if !sampler.keep(&event.values) {
                return;
            }
        }

        let key = core.metric_key(&event.values, states);
        if matcher_index == self.start_index {
            let exists = self.trackers.contains_key(&key) || self.past.contains_key(&key);
            if !exists && !core.guardrail.admit_new_key(self.trackers.len() + self.past.len()) {
                return;
            }
            let gate_open = core.is_active && core.condition_met(event, conditions);
            let tracker = self
                .trackers
                .entry(key.clone())
                .or_insert_with(|| DurationTracker::new(!gate_open));
            if tracker.active_count == 0 {
                tracker.paused = !gate_open;
            }
            let was_running = tracker.running();
            tracker.active_count =
                if self.nested { tracker.active_count.saturating_add(1) } else { 1 };
            if !was_running && tracker.running() {
                tracker.interval_start_ns = ts;
                core.slice_outbox.push(SliceTransition {
                    key,
                    started: true,
                    ts_ns: ts,
                    ongoing_ns: tracker.accumulated_ns,
                });
            }
        } else if Some(matcher_index) == self.stop_index {
            if let Some(tracker) = self.trackers.get_mut(&key) {
                let was_running = tracker.running();
                tracker.active_count = tracker.active_count.saturating_sub(1);
                if was_running && !tracker.running() {
                    tracker.close_piece(ts);
                    core.slice_outbox.push(SliceTransition {
                        key,
                        started: false,
                        ts_ns: ts,
                        ongoing_ns: tracker.accumulated_ns,
                    });
                }
            }
        }
    }

    /// The activation or unsliced condition gate flipped at `ts`.
    pub(crate) fn on_gate_changed(&mut self, core: &mut MetricCore, ts: i64) {
        let gate_open = core.is_active
            && (core.condition_index.is_none() || core.condition_sliced || core.condition.is_true());
        for (key, tracker) in self.trackers.iter_mut() {
            if gate_open {
                resume(tracker, key, ts, core);
            } else {
                pause(tracker, key, ts, core);
            }
        }
    }

    /// A sliced condition this metric links to may have changed.
    ///
    /// With a single link covering every dimension of the sliced
    /// condition, only trackers named in the delta sets are touched;
    /// otherwise each tracker's slice is queried through the wizard.
    pub(crate) fn on_sliced_condition_may_change(
        &mut self,
        core: &mut MetricCore,
        ts: i64,
        conditions: &[Condition],
    ) {
        let Some(condition_index) = core.condition_index else {
            return;
        };
        if core.has_links_to_all_condition_dimensions {
            let link = core.condition_links[0].clone();
            let to_true = wizard::changed_to_true(conditions, condition_index);
            let to_false = wizard::changed_to_false(conditions, condition_index);
            for (key, tracker) in self.trackers.iter_mut() {
                let slice = link_key_from_dimension(&link, &key.what);
                if to_false.contains(&slice) {
                    pause(tracker, key, ts, core);
                } else if to_true.contains(&slice) && core.is_active {
                    resume(tracker, key, ts, core);
                }
            }
        } else {
            for (key, tracker) in self.trackers.iter_mut() {
                let slice = core.condition_link_key(key.what.values());
                if core.is_active && wizard::query(conditions, condition_index, &slice).is_true() {
                    resume(tracker, key, ts, core);
                } else {
                    pause(tracker, key, ts, core);
                }
            }
        }
    }

    pub(crate) fn flush_if_needed(&mut self, core: &mut MetricCore, ts: i64) {
        roll_buckets(core, ts, |core, bounds, condition_true_ns, _first| {
            self.seal(core, bounds, condition_true_ns);
        });
    }

    pub(crate) fn split_bucket(&mut self, core: &mut MetricCore, ts: i64) {
        super::split_bucket(core, ts, |core, bounds, condition_true_ns, _first| {
            self.seal(core, bounds, condition_true_ns);
        });
    }

    fn seal(&mut self, core: &mut MetricCore, bounds: BucketBounds, condition_true_ns: i64) {
        let mut idle = Vec::new();
        for (key, tracker) in self.trackers.iter_mut() {
            if tracker.running() {
                tracker.close_piece(bounds.end_ns);
                tracker.interval_start_ns = bounds.end_ns;
            }
            let value = match self.aggregation {
                DurationAggregation::Summed => tracker.accumulated_ns,
                DurationAggregation::MaxSparse => tracker.max_piece_ns,
            };
            tracker.accumulated_ns = 0;
            tracker.max_piece_ns = 0;
            if value > 0 && self.min_duration_ns.map_or(true, |min| value >= min) {
                self.past.entry(key.clone()).or_default().push(DurationBucketData {
                    bounds,
                    duration_ns: value,
                    condition_true_ns,
                });
                core.sealed_outbox.push(SealedBucket {
                    key: key.clone(),
                    bucket_num: bounds.bucket_num,
                    value,
                    end_ns: bounds.end_ns,
                });
            }
            if tracker.active_count == 0 {
                idle.push(key.clone());
            }
        }
        for key in idle {
            self.trackers.remove(&key);
        }
    }

    pub(crate) fn dump(&mut self, core: &MetricCore, request: &DumpRequest) -> MetricReportData {
        let mut keys: Vec<MetricKey> = self.past.keys().cloned().collect();
        if request.include_current_partial_bucket {
            for key in self.trackers.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys.sort();

        let has_condition = core.condition_index.is_some();
        let mut series = Vec::with_capacity(keys.len());
        for key in keys {
            let mut buckets: Vec<DurationBucketReport> = self
                .past
                .get(&key)
                .map(|data| {
                    data.iter()
                        .map(|b| DurationBucketReport {
                            start_elapsed_ns: b.bounds.start_ns,
                            end_elapsed_ns: b.bounds.end_ns,
                            bucket_num: b.bounds.bucket_num,
                            partial: b.bounds.partial,
                            duration_ns: b.duration_ns,
                            condition_true_ns: has_condition.then_some(b.condition_true_ns),
                        })
                        .collect()
                })
                .unwrap_or_default();
            if request.include_current_partial_bucket {
                if let Some(tracker) = self.trackers.get(&key) {
                    let mut ongoing = tracker.accumulated_ns;
                    let mut max_piece = tracker.max_piece_ns;
                    if tracker.running() {
                        let piece = (request.dump_time_ns - tracker.interval_start_ns).max(0);
                        ongoing += piece;
                        max_piece = max_piece.max(piece);
                    }
                    let value = match self.aggregation {
                        DurationAggregation::Summed => ongoing,
                        DurationAggregation::MaxSparse => max_piece,
                    };
                    if value > 0 {
                        buckets.push(DurationBucketReport {
                            start_elapsed_ns: core.current_bucket_start_ns,
                            end_elapsed_ns: request.dump_time_ns,
                            bucket_num: None,
                            partial: true,
                            duration_ns: value,
                            condition_true_ns: has_condition
                                .then(|| core.condition_timer.peek(request.dump_time_ns)),
                        });
                    }
                }
            }
            if !buckets.is_empty() {
                series.push(DurationSeries {
                    dimensions: key.what.values().iter().map(|fv| fv.value.clone()).collect(),
                    state_values: key.state_values.clone(),
                    buckets,
                });
            }
        }

        if request.erase_data {
            self.past.clear();
        }
        MetricReportData::Duration(series)
    }

    pub(crate) fn clear_current(&mut self) {
        self.trackers.clear();
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
            .chain(self.trackers.keys())
            .map(|k| 16 + 24 * (k.what.values().len() + k.state_values.values().len()))
            .sum();
        let bucket_bytes: usize = self.past.values().map(|v| v.len() * 56).sum();
        key_bytes + bucket_bytes + self.trackers.len() * 40
    }
}

fn pause(tracker: &mut DurationTracker, key: &MetricKey, ts: i64, core: &mut MetricCore) {
    if tracker.running() {
        tracker.close_piece(ts);
        core.slice_outbox.push(SliceTransition {
            key: key.clone(),
            started: false,
            ts_ns: ts,
            ongoing_ns: tracker.accumulated_ns,
        });
    }
    tracker.paused = true;
}

fn resume(tracker: &mut DurationTracker, key: &MetricKey, ts: i64, core: &mut MetricCore) {
    if tracker.paused && tracker.active_count > 0 {
        tracker.interval_start_ns = ts;
        core.slice_outbox.push(SliceTransition {
            key: key.clone(),
            started: true,
            ts_ns: ts,
            ongoing_ns: tracker.accumulated_ns,
        });
    }
    tracker.paused = false;
}
