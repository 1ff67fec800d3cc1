//! Metric producers and their shared plumbing.
//!
//! Metrics are a closed sum over five producer kinds — count, duration,
//! value, gauge, event — dispatched on tag. [`MetricCore`] carries
//! everything common: the bucket cursor, condition cache, links,
//! activation map, sampling gates, guardrails, and the outboxes the
//! dispatcher drains to feed alert trackers.

pub mod activation;
pub mod bucket;
pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod value;

pub use activation::{ActivationMap, ActivationSnapshot, ActivationState};
pub use bucket::{BucketBounds, ConditionTimer, DimensionGuardrail, INFINITE_BUCKET_NS};
pub use count::CountMetric;
pub use duration::DurationMetric;
pub use event::EventMetric;
pub use gauge::GaugeMetric;
pub use value::ValueMetric;

use crate::condition::{wizard, Condition, ConditionState};
use crate::core::diagnostics::EngineDiagnostics;
use crate::core::types::{Event, FieldPath, FieldValue};
use crate::dimension::{filter_values, link_key, DimensionKey, FieldLink, LinkTarget, MetricKey};
use crate::external::StateCache;
use crate::report::{DumpRequest, MetricReport, MetricReportData};
use crate::sampling::{roll_percentage, DimensionalSampler};
use rand::rngs::StdRng;
use std::sync::Arc;

/// A bucket a producer just sealed, drained by the dispatcher to feed
/// alert trackers.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedBucket {
    /// The metric key the bucket belongs to.
    pub key: MetricKey,
    /// Bucket number when full-sized.
    pub bucket_num: Option<u64>,
    /// The sealed value (count, duration ns, or value cast to integer).
    pub value: i64,
    /// Bucket end, elapsed nanoseconds.
    pub end_ns: i64,
}

/// A duration slice starting or stopping, drained by the dispatcher so
/// alert trackers can schedule anomaly alarms.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceTransition {
    /// The tracker's metric key.
    pub key: MetricKey,
    /// True on start, false on stop or pause.
    pub started: bool,
    /// When the transition happened.
    pub ts_ns: i64,
    /// Duration already accumulated in the current bucket.
    pub ongoing_ns: i64,
}

/// State shared by every producer kind.
#[derive(Debug)]
pub struct MetricCore {
    /// Metric id.
    pub metric_id: i64,
    /// Time base bucket numbers are relative to.
    pub time_base_ns: i64,
    /// Bucket width ([`INFINITE_BUCKET_NS`] = one bucket forever).
    pub bucket_size_ns: i64,
    /// Start of the still-open bucket.
    pub current_bucket_start_ns: i64,
    /// Index of the gating condition, if any.
    pub condition_index: Option<usize>,
    /// Cached overall state of the gating condition.
    pub condition: ConditionState,
    /// Whether the gating condition is queried per slice.
    pub condition_sliced: bool,
    /// Links from "what" fields to condition dimensions.
    pub condition_links: Vec<FieldLink>,
    /// Links from "what" fields to state primary fields.
    pub state_links: Vec<FieldLink>,
    /// State atoms slicing this metric's output.
    pub slice_by_state: Vec<u32>,
    /// Dimensions extracted from matched events.
    pub dimensions_in_what: Vec<FieldPath>,
    /// Activation records.
    pub activations: ActivationMap,
    /// OR over activations, or true when there are none.
    pub is_active: bool,
    /// Split the open bucket on app-upgrade notifications.
    pub split_on_app_upgrade: bool,
    /// Skip zero/empty buckets for skipped boundaries.
    pub omit_empty_buckets: bool,
    /// Probabilistic sampling percentage.
    pub sampling_percentage: Option<u8>,
    /// Dimensional sharding.
    pub dimensional_sampler: Option<DimensionalSampler>,
    /// The single condition link covers every dimension of the sliced
    /// condition, enabling delta-driven tracker updates.
    pub has_links_to_all_condition_dimensions: bool,
    /// Seeded RNG for sampling rolls and gauge reservoirs.
    pub rng: StdRng,
    /// Dimension guardrail.
    pub guardrail: DimensionGuardrail,
    /// Tracks condition-true time per bucket.
    pub condition_timer: ConditionTimer,
    /// Shared diagnostic counters.
    pub diagnostics: Arc<EngineDiagnostics>,
    /// Buckets sealed since the dispatcher last drained.
    pub sealed_outbox: Vec<SealedBucket>,
    /// Duration slice transitions since the dispatcher last drained.
    pub slice_outbox: Vec<SliceTransition>,
}

impl MetricCore {
    /// End of the still-open bucket.
    pub fn current_bucket_end_ns(&self) -> i64 {
        bucket::bucket_end_ns(self.time_base_ns, self.bucket_size_ns, self.current_bucket_start_ns)
    }

    /// Combined gate: activation, condition, then sampling.
    pub fn event_passes_gates(&mut self, event: &Event, conditions: &[Condition]) -> bool {
        if !self.is_active {
            return false;
        }
        if !self.condition_met(event, conditions) {
            return false;
        }
        self.passes_sampling(&event.values)
    }

    /// Whether the gating condition holds for this event, querying the
    /// wizard with the event's condition-link dimensions when sliced.
    pub fn condition_met(&self, event: &Event, conditions: &[Condition]) -> bool {
        match self.condition_index {
            None => true,
            Some(index) => {
                if !self.condition_sliced {
                    self.condition.is_true()
                } else {
                    let key = self.condition_link_key(&event.values);
                    wizard::query(conditions, index, &key).is_true()
                }
            }
        }
    }

    /// The key addressing the gating condition's slices, built from the
    /// metric's condition links.
    pub fn condition_link_key(&self, values: &[FieldValue]) -> DimensionKey {
        let mut key = DimensionKey::empty();
        for link in &self.condition_links {
            if matches!(link.target, LinkTarget::Condition { .. }) {
                for fv in link_key(link, values).values() {
                    key.push(fv.clone());
                }
            }
        }
        key
    }

    /// Sampling gates, applied after activation and condition checks.
    pub fn passes_sampling(&mut self, values: &[FieldValue]) -> bool {
        if let Some(percentage) = self.sampling_percentage {
            if !roll_percentage(&mut self.rng, percentage) {
                return false;
            }
        }
        if let Some(sampler) = &self.dimensional_sampler {
            if !sampler.keep(values) {
                return false;
            }
        }
        true
    }

    /// The metric key for a matched event: what-key plus state values.
    pub fn metric_key(&self, values: &[FieldValue], states: &StateCache) -> MetricKey {
        let what = filter_values(&self.dimensions_in_what, values);
        let mut state_values = DimensionKey::empty();
        for &atom in &self.slice_by_state {
            let link = self.state_links.iter().find(
                |l| matches!(l.target, LinkTarget::State { state_atom_id } if state_atom_id == atom),
            );
            if let Some(link) = link {
                let primary = link_key(link, values);
                state_values.push(states.value_or_unknown(atom, &primary));
            }
        }
        MetricKey { what, state_values }
    }

    /// The condition the timer tracks: active and condition-true.
    fn timer_condition(&self) -> bool {
        self.is_active
            && match self.condition_index {
                None => true,
                Some(_) => self.condition.is_true(),
            }
    }

    /// Re-anchor the condition timer after an activation or condition
    /// edge at `ts`.
    pub fn refresh_condition_timer(&mut self, ts: i64) {
        let timer_condition = self.timer_condition();
        self.condition_timer.on_condition_changed(timer_condition, ts);
    }
}

/// Roll completed buckets forward until `ts` falls inside the open
/// bucket. `seal` runs once per crossed boundary with the bucket
/// bounds, the condition-true time it accumulated, and whether this is
/// the first (data-bearing) boundary of the flush.
pub(crate) fn roll_buckets(
    core: &mut MetricCore,
    ts: i64,
    mut seal: impl FnMut(&mut MetricCore, BucketBounds, i64, bool),
) {
    if core.bucket_size_ns == INFINITE_BUCKET_NS {
        return;
    }
    let mut first = true;
    while ts >= core.current_bucket_end_ns() {
        let end = core.current_bucket_end_ns();
        let start = core.current_bucket_start_ns;
        let bounds = if end - start == core.bucket_size_ns {
            BucketBounds::full(core.time_base_ns, core.bucket_size_ns, start)
        } else {
            BucketBounds::partial(start, end)
        };
        let condition_true_ns = core.condition_timer.seal_bucket(end);
        seal(core, bounds, condition_true_ns, first);
        core.current_bucket_start_ns = end;
        first = false;
    }
}

/// Seal the open bucket early at `ts` with explicit bounds (config
/// update, app upgrade, engine init). The caller rolls completed
/// buckets first.
pub(crate) fn split_bucket(
    core: &mut MetricCore,
    ts: i64,
    mut seal: impl FnMut(&mut MetricCore, BucketBounds, i64, bool),
) {
    if ts <= core.current_bucket_start_ns {
        return;
    }
    let bounds = BucketBounds::partial(core.current_bucket_start_ns, ts);
    let condition_true_ns = core.condition_timer.seal_bucket(ts);
    seal(core, bounds, condition_true_ns, true);
    core.current_bucket_start_ns = ts;
}

/// A compiled metric: shared core plus the producer variant.
#[derive(Debug)]
pub struct Metric {
    /// Shared producer state.
    pub core: MetricCore,
    /// The producer variant.
    pub kind: MetricKind,
}

/// Producer variants.
#[derive(Debug)]
pub enum MetricKind {
    /// Count matched events.
    Count(CountMetric),
    /// Accumulate predicate-true time.
    Duration(DurationMetric),
    /// Aggregate a numeric field.
    Value(ValueMetric),
    /// Sample atom snapshots.
    Gauge(GaugeMetric),
    /// Retain matched events.
    Event(EventMetric),
}

impl Metric {
    /// Whether the metric currently processes events.
    pub fn is_active(&self) -> bool {
        self.core.is_active
    }

    /// Whether the metric carries activation records.
    pub fn has_activations(&self) -> bool {
        !self.core.activations.is_empty()
    }

    /// Expire elapsed activations as of `ts`.
    pub fn flush_if_expire(&mut self, ts: i64) {
        if self.core.activations.is_empty() {
            return;
        }
        if self.core.activations.flush_expired(ts) {
            self.refresh_active(ts);
        }
    }

    /// Trigger the activation keyed on `matcher_index`.
    pub fn activate(&mut self, matcher_index: usize, ts: i64) {
        self.core.activations.activate(matcher_index, ts);
        self.refresh_active(ts);
    }

    /// Cancel activations linked to a deactivation matcher. Data already
    /// aggregated stays in place; accumulation stops until re-activation.
    pub fn cancel_activation(&mut self, deactivation_matcher_index: usize, ts: i64) {
        if self.core.activations.cancel(deactivation_matcher_index) {
            self.refresh_active(ts);
        }
    }

    fn refresh_active(&mut self, ts: i64) {
        let was_active = self.core.is_active;
        self.core.is_active = self.core.activations.is_active();
        if was_active != self.core.is_active {
            self.core.refresh_condition_timer(ts);
            if let MetricKind::Duration(duration) = &mut self.kind {
                duration.on_gate_changed(&mut self.core, ts);
            }
        }
    }

    /// Roll completed buckets forward to `ts`.
    pub fn flush_if_needed(&mut self, ts: i64) {
        match &mut self.kind {
            MetricKind::Count(m) => m.flush_if_needed(&mut self.core, ts),
            MetricKind::Duration(m) => m.flush_if_needed(&mut self.core, ts),
            MetricKind::Value(m) => m.flush_if_needed(&mut self.core, ts),
            MetricKind::Gauge(m) => m.flush_if_needed(&mut self.core, ts),
            MetricKind::Event(_) => {}
        }
    }

    /// A matched event (or its transformation) reached this metric.
    pub fn on_matched(
        &mut self,
        matcher_index: usize,
        event: &Event,
        conditions: &[Condition],
        states: &StateCache,
    ) {
        if event.elapsed_ns < self.core.current_bucket_start_ns {
            self.core.diagnostics.note_event_late();
            return;
        }
        self.flush_if_needed(event.elapsed_ns);
        match &mut self.kind {
            MetricKind::Count(m) => m.on_matched(&mut self.core, event, conditions, states),
            MetricKind::Duration(m) => {
                m.on_matched(&mut self.core, matcher_index, event, conditions, states)
            }
            MetricKind::Value(m) => m.on_matched(&mut self.core, event, conditions, states),
            MetricKind::Gauge(m) => m.on_matched(&mut self.core, event, conditions, states),
            MetricKind::Event(m) => m.on_matched(&mut self.core, event, conditions),
        }
    }

    /// The unsliced gating condition changed.
    pub fn on_condition_changed(&mut self, state: ConditionState, ts: i64) {
        self.flush_if_needed(ts);
        self.core.condition = state;
        self.core.refresh_condition_timer(ts);
        match &mut self.kind {
            MetricKind::Duration(m) => m.on_gate_changed(&mut self.core, ts),
            MetricKind::Value(m) => m.on_condition_edge(&mut self.core, state, ts),
            MetricKind::Gauge(m) => m.on_condition_edge(&mut self.core, state, ts),
            _ => {}
        }
    }

    /// A sliced condition this metric links to may have changed.
    pub fn on_sliced_condition_may_change(&mut self, ts: i64, conditions: &[Condition]) {
        self.flush_if_needed(ts);
        if let MetricKind::Duration(m) = &mut self.kind {
            m.on_sliced_condition_may_change(&mut self.core, ts, conditions);
        }
    }

    /// App upgrade: split the open bucket so data before and after the
    /// upgrade land in separate partial buckets.
    pub fn notify_app_upgrade(&mut self, ts: i64) {
        if !self.core.split_on_app_upgrade {
            return;
        }
        self.split_partial(ts);
    }

    /// Engine init completed: same split as an app upgrade.
    pub fn on_init_complete(&mut self, ts: i64) {
        self.split_partial(ts);
    }

    fn split_partial(&mut self, ts: i64) {
        self.flush_if_needed(ts);
        match &mut self.kind {
            MetricKind::Count(m) => m.split_bucket(&mut self.core, ts),
            MetricKind::Duration(m) => m.split_bucket(&mut self.core, ts),
            MetricKind::Value(m) => m.split_bucket(&mut self.core, ts),
            MetricKind::Gauge(m) => m.split_bucket(&mut self.core, ts),
            MetricKind::Event(_) => {}
        }
    }

    /// Discard all data without reporting.
    pub fn drop_data(&mut self, ts: i64) {
        self.flush_if_needed(ts);
        self.clear_past_buckets();
        match &mut self.kind {
            MetricKind::Count(m) => m.clear_current(),
            MetricKind::Duration(m) => m.clear_current(),
            MetricKind::Value(m) => m.clear_current(),
            MetricKind::Gauge(m) => m.clear_current(),
            MetricKind::Event(m) => m.clear(),
        }
    }

    /// Drop sealed buckets (after they were reported, or for a
    /// no-report metric).
    pub fn clear_past_buckets(&mut self) {
        match &mut self.kind {
            MetricKind::Count(m) => m.clear_past(),
            MetricKind::Duration(m) => m.clear_past(),
            MetricKind::Value(m) => m.clear_past(),
            MetricKind::Gauge(m) => m.clear_past(),
            MetricKind::Event(m) => m.clear(),
        }
    }

    /// Drop the single oldest sealed bucket; returns false when there
    /// is nothing left to drop.
    pub fn drop_oldest_bucket(&mut self) -> bool {
        let dropped = match &mut self.kind {
            MetricKind::Count(m) => m.drop_oldest(),
            MetricKind::Duration(m) => m.drop_oldest(),
            MetricKind::Value(m) => m.drop_oldest(),
            MetricKind::Gauge(m) => m.drop_oldest(),
            MetricKind::Event(m) => m.drop_oldest(),
        };
        if dropped {
            self.core.diagnostics.note_bucket_dropped_for_memory();
        }
        dropped
    }

    /// Rough byte estimate of the retained data.
    pub fn byte_size(&self) -> usize {
        match &self.kind {
            MetricKind::Count(m) => m.byte_size(),
            MetricKind::Duration(m) => m.byte_size(),
            MetricKind::Value(m) => m.byte_size(),
            MetricKind::Gauge(m) => m.byte_size(),
            MetricKind::Event(m) => m.byte_size(),
        }
    }

    /// Produce this metric's report.
    pub fn dump(&mut self, request: &DumpRequest) -> MetricReport {
        self.flush_if_needed(request.dump_time_ns);
        let data: MetricReportData = match &mut self.kind {
            MetricKind::Count(m) => m.dump(&self.core, request),
            MetricKind::Duration(m) => m.dump(&self.core, request),
            MetricKind::Value(m) => m.dump(&self.core, request),
            MetricKind::Gauge(m) => m.dump(&self.core, request),
            MetricKind::Event(m) => m.dump(request),
        };
        MetricReport {
            metric_id: self.core.metric_id,
            is_active: self.core.is_active,
            dimension_guardrail_hit: self.core.guardrail.hit,
            time_base_ns: self.core.time_base_ns,
            bucket_size_ns: self.core.bucket_size_ns,
            dimension_path_in_what: self.core.dimensions_in_what.clone(),
            data,
        }
    }

    /// Drain buckets sealed since the last drain.
    pub fn drain_sealed(&mut self) -> Vec<SealedBucket> {
        std::mem::take(&mut self.core.sealed_outbox)
    }

    /// Drain duration slice transitions since the last drain.
    pub fn drain_slice_transitions(&mut self) -> Vec<SliceTransition> {
        std::mem::take(&mut self.core.slice_outbox)
    }

    /// Persistable activation state with remaining TTLs.
    pub fn write_active_state(&self, now_ns: i64) -> Vec<ActivationSnapshot> {
        self.core.activations.write_state(now_ns)
    }

    /// Restore persisted activation state.
    pub fn load_active_state(&mut self, snapshots: &[ActivationSnapshot], now_ns: i64) {
        self.core.activations.load_state(snapshots, now_ns);
        self.core.is_active = self.core.activations.is_active();
    }
}
