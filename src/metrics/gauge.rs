//! Gauge metric producer.
//!
//! Samples atom field snapshots per metric-key per bucket. FIRST_N
//! keeps a prefix of matched events in arrival order; RANDOM_ONE keeps
//! a single snapshot chosen by a reservoir rule (the k-th candidate
//! replaces the held one with probability 1/k, so every candidate is
//! retained with probability 1/k overall). Pull-based gauges request a
//! snapshot on bucket boundaries and on condition true-edges.

use super::bucket::BucketBounds;
use super::{roll_buckets, MetricCore};
use crate::condition::{Condition, ConditionState};
use crate::core::config::GaugeSampling;
use crate::core::types::{Event, FieldPath, FieldValue};
use crate::dimension::MetricKey;
use crate::external::{StateCache, StatsPuller};
use crate::report::{DumpRequest, GaugeAtomReport, GaugeBucketReport, GaugeSeries, MetricReportData};
use ahash::AHashMap;
use rand::Rng;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct GaugeAtomData {
    elapsed_ns: i64,
    values: Vec<FieldValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct GaugeSlot {
    atoms: Vec<GaugeAtomData>,
    /// Candidates seen this bucket, for the reservoir rule.
    candidates: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct GaugeBucketData {
    bounds: BucketBounds,
    atoms: Vec<GaugeAtomData>,
}

/// Samples atom snapshots per metric-key per bucket.
pub struct GaugeMetric {
    /// Fields captured per snapshot; empty captures every field.
    pub fields: Vec<FieldPath>,
    /// Sampling strategy.
    pub sampling: GaugeSampling,
    /// Atom pulled on boundaries and true-edges, if pull-based.
    pub pull_atom_id: Option<u32>,
    puller: Arc<dyn StatsPuller>,
    current: AHashMap<MetricKey, GaugeSlot>,
    past: AHashMap<MetricKey, Vec<GaugeBucketData>>,
    last_condition_true: bool,
}

impl std::fmt::Debug for GaugeMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeMetric")
            .field("fields", &self.fields)
            .field("sampling", &self.sampling)
            .field("pull_atom_id", &self.pull_atom_id)
            .field("current_keys", &self.current.len())
            .field("past_keys", &self.past.len())
            .finish_non_exhaustive()
    }
}

impl GaugeMetric {
    /// Producer with the given snapshot fields and sampling strategy.
    pub fn new(
        fields: Vec<FieldPath>,
        sampling: GaugeSampling,
        pull_atom_id: Option<u32>,
        puller: Arc<dyn StatsPuller>,
    ) -> Self {
        GaugeMetric {
            fields,
            sampling,
            pull_atom_id,
            puller,
            current: AHashMap::new(),
            past: AHashMap::new(),
            last_condition_true: false,
        }
    }

    /// Snapshot the captured fields of an event, verbatim.
    fn snapshot(&self, event: &Event) -> Vec<FieldValue> {
        if self.fields.is_empty() {
            return event.values.clone();
        }
        event
            .values
            .iter()
            .filter(|fv| self.fields.iter().any(|spec| spec.same_field(&fv.path)))
            .cloned()
            .collect()
    }

    pub(crate) fn on_matched(
        &mut self,
        core: &mut MetricCore,
        event: &Event,
        conditions: &[Condition],
        states: &StateCache,
    ) {
        // A bucket roll already happened in the caller; pull-based
        // gauges snapshot the new bucket here.
        if core.bucket_size_ns != super::INFINITE_BUCKET_NS
            && self.pull_atom_id.is_some()
            && event.elapsed_ns >= core.current_bucket_start_ns
            && self.current.is_empty()
            && core.is_active
        {
            self.pull_into_bucket(core, states);
        }
        if self.sampling == GaugeSampling::ConditionChangeToTrue {
            // Snapshots are taken on condition edges, not per event.
            return;
        }
        if !core.event_passes_gates(event, conditions) {
            return;
        }
        let key = core.metric_key(&event.values, states);
        if !self.admit(core, &key) {
            return;
        }
        let atom = GaugeAtomData {
            elapsed_ns: event.elapsed_ns,
            values: self.snapshot(event),
        };
        self.sample_in(core, key, atom);
    }

    /// The unsliced condition flipped; pull-based and edge-sampled
    /// gauges snapshot on the true edge.
    pub(crate) fn on_condition_edge(
        &mut self,
        core: &mut MetricCore,
        state: ConditionState,
        _ts: i64,
    ) {
        let now_true = state.is_true();
        let rising = now_true && !self.last_condition_true;
        self.last_condition_true = now_true;
        if rising && self.pull_atom_id.is_some() && core.is_active {
            self.pull_into_bucket(core, &StateCache::new());
        }
    }

    fn pull_into_bucket(&mut self, core: &mut MetricCore, states: &StateCache) {
        let Some(atom_id) = self.pull_atom_id else {
            return;
        };
        match self.puller.pull(atom_id, &[]) {
            Ok(events) => {
                for event in events {
                    if event.tag_id != atom_id {
                        continue;
                    }
                    if !core.passes_sampling(&event.values) {
                        continue;
                    }
                    let key = core.metric_key(&event.values, states);
                    if !self.admit(core, &key) {
                        continue;
                    }
                    let atom = GaugeAtomData {
                        elapsed_ns: event.elapsed_ns,
                        values: self.snapshot(&event),
                    };
                    self.sample_in(core, key, atom);
                }
            }
            Err(error) => {
                tracing::warn!(metric_id = core.metric_id, atom_id, %error, "gauge pull failed");
                core.diagnostics.note_pull_failure();
            }
        }
    }

    fn admit(&mut self, core: &mut MetricCore, key: &MetricKey) -> bool {
        let exists = self.current.contains_key(key) || self.past.contains_key(key);
        exists || core.guardrail.admit_new_key(self.current.len() + self.past.len())
    }

    fn sample_in(&mut self, core: &mut MetricCore, key: MetricKey, atom: GaugeAtomData) {
        let slot = self.current.entry(key).or_default();
        match self.sampling {
            GaugeSampling::FirstN { samples } => {
                if slot.atoms.len() < samples {
                    slot.atoms.push(atom);
                }
            }
            GaugeSampling::RandomOne => {
                slot.candidates += 1;
                if core.rng.gen_range(0..slot.candidates) == 0 {
                    slot.atoms.clear();
                    slot.atoms.push(atom);
                }
            }
            GaugeSampling::ConditionChangeToTrue => {
                slot.atoms.push(atom);
            }
        }
    }

    pub(crate) fn flush_if_needed(&mut self, core: &mut MetricCore, ts: i64) {
        roll_buckets(core, ts, |_core, bounds, _condition_true_ns, first| {
            if first {
                self.seal(bounds);
            }
        });
    }

    pub(crate) fn split_bucket(&mut self, core: &mut MetricCore, ts: i64) {
        super::split_bucket(core, ts, |_core, bounds, _condition_true_ns, _first| {
            self.seal(bounds);
        });
    }

    fn seal(&mut self, bounds: BucketBounds) {
        for (key, slot) in self.current.drain() {
            if slot.atoms.is_empty() {
                continue;
            }
            self.past
                .entry(key)
                .or_default()
                .push(GaugeBucketData { bounds, atoms: slot.atoms });
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

        let mut series = Vec::with_capacity(keys.len());
        for key in keys {
            let mut buckets: Vec<GaugeBucketReport> = self
                .past
                .get(&key)
                .map(|data| data.iter().map(report_bucket).collect())
                .unwrap_or_default();
            if request.include_current_partial_bucket {
                if let Some(slot) = self.current.get(&key) {
                    if !slot.atoms.is_empty() {
                        buckets.push(GaugeBucketReport {
                            start_elapsed_ns: core.current_bucket_start_ns,
                            end_elapsed_ns: request.dump_time_ns,
                            bucket_num: None,
                            partial: true,
                            atoms: slot.atoms.iter().map(report_atom).collect(),
                        });
                    }
                }
            }
            if !buckets.is_empty() {
                series.push(GaugeSeries {
                    dimensions: key.what.values().iter().map(|fv| fv.value.clone()).collect(),
                    state_values: key.state_values.clone(),
                    buckets,
                });
            }
        }

        if request.erase_data {
            self.past.clear();
        }
        MetricReportData::Gauge(series)
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
        let atom_bytes = |atoms: &[GaugeAtomData]| -> usize {
            atoms.iter().map(|a| 16 + 32 * a.values.len()).sum::<usize>()
        };
        let past_bytes: usize = self
            .past
            .values()
            .map(|buckets| buckets.iter().map(|b| 32 + atom_bytes(&b.atoms)).sum::<usize>())
            .sum();
        let current_bytes: usize = self.current.values().map(|s| atom_bytes(&s.atoms)).sum();
        past_bytes + current_bytes
    }
}

fn report_bucket(data: &GaugeBucketData) -> GaugeBucketReport {
    GaugeBucketReport {
        start_elapsed_ns: data.bounds.start_ns,
        end_elapsed_ns: data.bounds.end_ns,
        bucket_num: data.bounds.bucket_num,
        partial: data.bounds.partial,
        atoms: data.atoms.iter().map(report_atom).collect(),
    }
}

fn report_atom(atom: &GaugeAtomData) -> GaugeAtomReport {
    GaugeAtomReport {
        elapsed_ns: atom.elapsed_ns,
        values: atom.values.clone(),
    }
}
