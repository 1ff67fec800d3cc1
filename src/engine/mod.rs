//! The per-configuration evaluation graph and its dispatcher.
//!
//! A [`MetricsManager`] owns four ordered component vectors — matchers,
//! conditions, metrics, alerts — plus the index tables that encode the
//! dataflow edges between them. Components reference each other by
//! position, never by owning pointer, so cycles are impossible and
//! configuration updates are a table rebuild.
//!
//! Everything here runs on one logical task: event ingestion, condition
//! evaluation, metric updates, and report generation for a given
//! configuration must be serialized by the caller. The only structure
//! shared with collaborator callbacks is the allowed-log-sources set,
//! which sits behind a read-write lock because writes are rare.

mod build;
mod update;

pub use build::{
    MAX_ALERTS_PER_CONFIG, MAX_CONDITIONS_PER_CONFIG, MAX_LOG_SOURCES_PER_CONFIG,
    MAX_MATCHERS_PER_CONFIG, MAX_METRICS_PER_CONFIG,
};

use crate::alerts::AlertMetadata;
use crate::condition::{evaluate_condition, ConditionState};
use crate::core::config::{ConfigKey, EngineConfig};
use crate::core::diagnostics::{DiagnosticsSnapshot, EngineDiagnostics};
use crate::core::error::{InvalidConfigReason, Result};
use crate::core::types::{Event, Value};
use crate::dimension::DimensionKey;
use crate::external::{Collaborators, StateCache};
use crate::matcher::{evaluate_matcher, MatchingState};
use crate::metrics::ActivationSnapshot;
use crate::report::{ConfigReport, DumpRequest};
use ahash::AHashSet;
use build::{build_graph, BuiltGraph};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

/// Events from these uids are accepted regardless of the allowed-source
/// set: root, and the system service range.
pub const fn is_system_uid(uid: i32) -> bool {
    uid == 0 || (uid >= 1000 && uid < 2000)
}

/// Opaque persisted metadata at the core boundary: alert refractory
/// periods, round-tripped for load-after-reboot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetadata {
    /// Which configuration this metadata belongs to.
    pub config_key: ConfigKey,
    /// Per-alert refractory state.
    pub alerts: Vec<AlertMetadata>,
}

impl EngineMetadata {
    /// Serialize for persistence.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize persisted metadata.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Persisted activation state of a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveConfigState {
    /// Which configuration this state belongs to.
    pub config_key: ConfigKey,
    /// Activation snapshots per metric with activations.
    pub metrics: Vec<ActiveMetricState>,
}

/// Activation snapshots of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMetricState {
    /// Metric id.
    pub metric_id: i64,
    /// Its activation records.
    pub activations: Vec<ActivationSnapshot>,
}

/// Owning root of one configuration's evaluation graph.
pub struct MetricsManager {
    config_key: ConfigKey,
    config: EngineConfig,
    time_base_ns: i64,
    ttl_ns: i64,
    ttl_end_ns: i64,
    last_report_time_ns: i64,
    last_report_wall_ns: i64,
    invalid_reason: Option<InvalidConfigReason>,
    graph: BuiltGraph,
    no_report_metric_ids: AHashSet<i64>,
    allowlisted_atom_ids: AHashSet<u32>,
    allowed_packages: Vec<String>,
    allowed_config_uids: Vec<i32>,
    allowed_sources: Arc<RwLock<AHashSet<i32>>>,
    states: StateCache,
    collaborators: Collaborators,
    diagnostics: Arc<EngineDiagnostics>,
    max_metrics_bytes: usize,
    trigger_bytes: usize,
    is_always_active: bool,
    is_active: bool,
}

impl std::fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsManager")
            .field("config_key", &self.config_key)
            .field("invalid_reason", &self.invalid_reason)
            .field("metrics", &self.graph.metrics.len())
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

impl MetricsManager {
    /// Compile a configuration. An invalid configuration produces a
    /// manager in a permanently invalid state that drops events and
    /// refuses reports; inspect [`invalid_config_reason`]
    /// (Self::invalid_config_reason).
    pub fn new(
        config_key: ConfigKey,
        config: EngineConfig,
        time_base_ns: i64,
        current_time_ns: i64,
        collaborators: Collaborators,
    ) -> Self {
        let diagnostics = Arc::new(EngineDiagnostics::new());
        let (graph, invalid_reason) =
            match build_graph(&config, time_base_ns, current_time_ns, &collaborators, &diagnostics)
            {
                Ok(graph) => (graph, None),
                Err(reason) => {
                    tracing::error!(%config_key, %reason, "rejecting configuration");
                    (BuiltGraph::default(), Some(reason))
                }
            };

        let mut manager = MetricsManager {
            config_key,
            time_base_ns,
            ttl_ns: config.ttl_ns(),
            ttl_end_ns: -1,
            last_report_time_ns: current_time_ns,
            last_report_wall_ns: wall_clock_ns(),
            invalid_reason,
            graph,
            no_report_metric_ids: config.no_report_metric_ids.iter().copied().collect(),
            allowlisted_atom_ids: config.allowlisted_atom_ids.iter().copied().collect(),
            allowed_packages: config.allowed_log_sources.clone(),
            allowed_config_uids: config.allowed_source_uids.clone(),
            allowed_sources: Arc::new(RwLock::new(AHashSet::new())),
            states: StateCache::new(),
            collaborators,
            diagnostics,
            max_metrics_bytes: config.max_metrics_bytes(),
            trigger_bytes: config.trigger_bytes(),
            is_always_active: false,
            is_active: false,
            config,
        };
        manager.refresh_ttl(time_base_ns);
        manager.init_allowed_sources();
        manager.init_active_status();
        manager
    }

    /// Why the configuration was rejected, if it was.
    pub fn invalid_config_reason(&self) -> Option<&InvalidConfigReason> {
        self.invalid_reason.as_ref()
    }

    /// Whether the configuration compiled.
    pub fn is_config_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }

    /// Whether any metric currently processes events.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// The configuration identity.
    pub fn config_key(&self) -> ConfigKey {
        self.config_key
    }

    /// Snapshot of the diagnostic counters.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Wall-clock time of the last erasing report, nanoseconds since
    /// the UNIX epoch.
    pub fn last_report_wall_ns(&self) -> i64 {
        self.last_report_wall_ns
    }

    /// Every metric id in the configuration.
    pub fn all_metric_ids(&self) -> Vec<i64> {
        self.graph.metrics.iter().map(|m| m.core.metric_id).collect()
    }

    /// Every atom id any matcher is interested in.
    pub fn interesting_atom_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.graph.tag_to_matchers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ---- TTL ----

    /// Re-anchor the TTL window at `now_ns`.
    pub fn refresh_ttl(&mut self, now_ns: i64) {
        self.ttl_end_ns = if self.ttl_ns > 0 { now_ns + self.ttl_ns } else { -1 };
    }

    /// Whether the configuration is still within its TTL.
    pub fn is_in_ttl(&self, now_ns: i64) -> bool {
        self.ttl_end_ns <= 0 || now_ns < self.ttl_end_ns
    }

    /// When the TTL elapses, or -1 without one.
    pub fn ttl_end_ns(&self) -> i64 {
        self.ttl_end_ns
    }

    // ---- allowed log sources ----

    fn init_allowed_sources(&self) {
        let mut sources: AHashSet<i32> = self.allowed_config_uids.iter().copied().collect();
        for package in &self.allowed_packages {
            sources.extend(self.collaborators.uid_map.app_uids(package));
        }
        *self.allowed_sources.write() = sources;
    }

    fn check_credentials(&self, event: &Event) -> bool {
        if self.allowlisted_atom_ids.contains(&event.tag_id) {
            return true;
        }
        if is_system_uid(event.uid) {
            return true;
        }
        self.allowed_sources.read().contains(&event.uid)
    }

    fn init_active_status(&mut self) {
        self.is_always_active = self.graph.metrics_with_activation.len()
            != self.graph.metrics.len()
            || self.graph.metrics.is_empty();
        let mut active = self.is_always_active;
        for &index in &self.graph.metrics_with_activation {
            active |= self.graph.metrics[index].is_active();
        }
        self.is_active = active;
    }

    // ---- dispatch ----

    /// Consume one event. Never fails; uninteresting or uncredentialed
    /// events are dropped and counted.
    pub fn on_event(&mut self, event: &Event) {
        if self.invalid_reason.is_some() {
            return;
        }
        if !self.check_credentials(event) {
            self.diagnostics.note_event_rejected_credentials();
            return;
        }
        self.diagnostics.note_event_processed();
        let ts = event.elapsed_ns;

        let mut is_active = self.is_always_active;

        // Refresh activation expirations as of this event, remembering
        // which activation-carrying metrics are still active.
        let mut active_indices: AHashSet<usize> = AHashSet::new();
        let with_activation = self.graph.metrics_with_activation.clone();
        for &index in &with_activation {
            let metric = &mut self.graph.metrics[index];
            metric.flush_if_expire(ts);
            if metric.is_active() {
                active_indices.insert(index);
            }
        }
        self.is_active = is_active || !active_indices.is_empty();

        let Some(candidates) = self.graph.tag_to_matchers.get(&event.tag_id).cloned() else {
            return;
        };

        let matcher_count = self.graph.matchers.len();
        let mut matcher_cache = vec![MatchingState::NotComputed; matcher_count];
        let mut transformations: Vec<Option<Event>> = vec![None; matcher_count];
        for &index in &candidates {
            evaluate_matcher(
                index,
                &self.graph.matchers,
                event,
                &mut matcher_cache,
                &mut transformations,
            );
        }
        for state in &matcher_cache {
            if state.is_matched() {
                self.diagnostics.note_matcher_hit();
            }
        }

        // Deactivation precedes activation: an event doing both leaves
        // the metric active.
        let deactivation_edges: Vec<(usize, Vec<usize>)> = self
            .graph
            .deactivation_to_metrics
            .iter()
            .filter(|(matcher, _)| matcher_cache[**matcher].is_matched())
            .map(|(m, metrics)| (*m, metrics.clone()))
            .collect();
        let mut canceled: AHashSet<usize> = AHashSet::new();
        for (matcher_index, metric_list) in deactivation_edges {
            for metric_index in metric_list {
                self.graph.metrics[metric_index].cancel_activation(matcher_index, ts);
                canceled.insert(metric_index);
            }
        }
        for &metric_index in &canceled {
            let metric = &mut self.graph.metrics[metric_index];
            metric.flush_if_expire(ts);
            if !metric.is_active() {
                active_indices.remove(&metric_index);
            }
        }
        is_active |= !active_indices.is_empty();

        let activation_edges: Vec<(usize, Vec<usize>)> = self
            .graph
            .activation_to_metrics
            .iter()
            .filter(|(matcher, _)| matcher_cache[**matcher].is_matched())
            .map(|(m, metrics)| (*m, metrics.clone()))
            .collect();
        for (matcher_index, metric_list) in activation_edges {
            for metric_index in metric_list {
                self.graph.metrics[metric_index].activate(matcher_index, ts);
                is_active |= self.graph.metrics[metric_index].is_active();
            }
        }
        self.is_active = is_active;

        // Re-evaluate only conditions whose input matchers matched,
        // in index order (dependencies are topological).
        let condition_count = self.graph.conditions.len();
        let mut to_evaluate = vec![false; condition_count];
        let mut condition_event_source: Vec<Option<usize>> = vec![None; condition_count];
        for (&matcher_index, condition_list) in &self.graph.matcher_to_conditions {
            if matcher_cache[matcher_index].is_matched() {
                for &condition_index in condition_list {
                    to_evaluate[condition_index] = true;
                    if transformations[matcher_index].is_some() {
                        condition_event_source[condition_index] = Some(matcher_index);
                    }
                }
            }
        }
        let mut condition_cache = vec![ConditionState::NotEvaluated; condition_count];
        let mut changed_cache = vec![false; condition_count];
        for index in 0..condition_count {
            if !to_evaluate[index] {
                continue;
            }
            let condition_event = condition_event_source[index]
                .and_then(|m| transformations[m].as_ref())
                .unwrap_or(event);
            evaluate_condition(
                index,
                &mut self.graph.conditions,
                condition_event,
                &matcher_cache,
                &mut condition_cache,
                &mut changed_cache,
            );
            if changed_cache[index] {
                self.diagnostics.note_condition_changed();
            }
        }

        // Changed conditions notify their metrics.
        for index in 0..condition_count {
            if !changed_cache[index] {
                continue;
            }
            let Some(metric_list) = self.graph.condition_to_metrics.get(&index).cloned() else {
                continue;
            };
            let graph = &mut self.graph;
            for metric_index in metric_list {
                if graph.metrics[metric_index].core.condition_sliced {
                    graph.metrics[metric_index]
                        .on_sliced_condition_may_change(ts, &graph.conditions);
                } else {
                    graph.metrics[metric_index].on_condition_changed(condition_cache[index], ts);
                }
            }
        }

        // Matched matchers deliver the event (or its transformation).
        for matcher_index in 0..matcher_count {
            if !matcher_cache[matcher_index].is_matched() {
                continue;
            }
            let Some(metric_list) = self.graph.matcher_to_metrics.get(&matcher_index).cloned()
            else {
                continue;
            };
            let metric_event = transformations[matcher_index].as_ref().unwrap_or(event);
            let graph = &mut self.graph;
            for metric_index in metric_list {
                graph.metrics[metric_index].on_matched(
                    matcher_index,
                    metric_event,
                    &graph.conditions,
                    &self.states,
                );
            }
        }

        self.dispatch_producer_outboxes();
    }

    /// A sliced-state atom changed. The host delivers this before the
    /// triggering log event.
    pub fn on_state_changed(&mut self, state_atom_id: u32, primary_key: DimensionKey, value: Value) {
        self.states.update(state_atom_id, primary_key, value);
    }

    /// Anomaly alarms fired; route the tokens to the alert trackers.
    pub fn on_anomaly_alarm_fired(&mut self, ts_ns: i64, tokens: &[u64]) {
        for alert in &mut self.graph.alerts {
            for &token in tokens {
                alert.on_alarm_fired(ts_ns, token);
            }
        }
    }

    fn dispatch_producer_outboxes(&mut self) {
        for metric_index in 0..self.graph.metrics.len() {
            let sealed = self.graph.metrics[metric_index].drain_sealed();
            let transitions = self.graph.metrics[metric_index].drain_slice_transitions();
            if sealed.is_empty() && transitions.is_empty() {
                continue;
            }
            let Some(alert_list) = self.graph.metric_to_alerts.get(&metric_index).cloned() else {
                continue;
            };
            for alert_index in alert_list {
                let alert = &mut self.graph.alerts[alert_index];
                for bucket in &sealed {
                    alert.on_bucket_sealed(bucket);
                }
                for transition in &transitions {
                    alert.on_slice_transition(transition);
                }
            }
        }
    }

    // ---- host notifications ----

    /// An app was upgraded: split open buckets and refresh sources.
    pub fn notify_app_upgrade(&mut self, ts: i64, package: &str) {
        for metric in &mut self.graph.metrics {
            metric.notify_app_upgrade(ts);
        }
        if self.allowed_packages.iter().any(|p| p == package) {
            self.init_allowed_sources();
        }
        self.dispatch_producer_outboxes();
    }

    /// An app was removed: same bookkeeping as an upgrade.
    pub fn notify_app_removed(&mut self, ts: i64, package: &str) {
        self.notify_app_upgrade(ts, package);
    }

    /// A fresh uid snapshot arrived. Buckets are left alone; only the
    /// allowed-source set is rebuilt.
    pub fn on_uid_map_received(&mut self) {
        if self.allowed_packages.is_empty() {
            return;
        }
        self.init_allowed_sources();
    }

    /// The host finished initializing: split open buckets so data from
    /// before and after land separately.
    pub fn on_init_complete(&mut self, ts: i64) {
        for metric in &mut self.graph.metrics {
            metric.on_init_complete(ts);
        }
        self.dispatch_producer_outboxes();
    }

    /// Discard all gathered data without reporting it.
    pub fn drop_data(&mut self, ts: i64) {
        for metric in &mut self.graph.metrics {
            metric.drop_data(ts);
        }
    }

    // ---- reporting ----

    /// Total byte estimate across producers, feeding the memory cap.
    pub fn byte_size(&self) -> usize {
        self.graph.metrics.iter().map(|m| m.byte_size()).sum()
    }

    /// Whether the soft byte threshold is crossed; the host uses this
    /// to trigger an early report.
    pub fn should_trigger_report(&self) -> bool {
        self.byte_size() > self.trigger_bytes
    }

    /// Produce a report. Returns `None` for an invalid configuration.
    pub fn dump_report(&mut self, request: &DumpRequest) -> Option<ConfigReport> {
        if self.invalid_reason.is_some() {
            return None;
        }

        // Enforce the hard byte cap by dropping oldest buckets first.
        let mut truncated = false;
        while self.byte_size() > self.max_metrics_bytes {
            let mut dropped = false;
            for metric in &mut self.graph.metrics {
                if metric.drop_oldest_bucket() {
                    dropped = true;
                    break;
                }
            }
            if !dropped {
                break;
            }
            truncated = true;
        }

        let mut reports = Vec::new();
        for metric in &mut self.graph.metrics {
            if self.no_report_metric_ids.contains(&metric.core.metric_id) {
                metric.flush_if_needed(request.dump_time_ns);
                metric.clear_past_buckets();
                continue;
            }
            reports.push(metric.dump(request));
        }
        // Flushing inside the dump may have sealed buckets.
        self.dispatch_producer_outboxes();

        let estimated_bytes = self.byte_size();
        let report = ConfigReport {
            config_key: self.config_key,
            last_report_time_ns: self.last_report_time_ns,
            dump_time_ns: request.dump_time_ns,
            truncated_for_memory: truncated,
            estimated_bytes,
            metrics: reports,
        };

        // Timestamps only advance when data was actually cleared, so
        // repeated non-erasing dumps stay aligned.
        if request.erase_data {
            self.last_report_time_ns = request.dump_time_ns;
            self.last_report_wall_ns = wall_clock_ns();
        }
        self.diagnostics.note_report_generated();
        Some(report)
    }

    // ---- configuration update ----

    /// Replace the configuration. On an invalid new configuration the
    /// update is aborted and the previous configuration stays in place.
    /// Components whose definitions are unchanged keep their runtime
    /// state (buckets, slices, activations).
    pub fn update_config(&mut self, config: EngineConfig, current_time_ns: i64) -> bool {
        let mut new_graph = match build_graph(
            &config,
            self.time_base_ns,
            current_time_ns,
            &self.collaborators,
            &self.diagnostics,
        ) {
            Ok(graph) => graph,
            Err(reason) => {
                tracing::error!(config_key = %self.config_key, %reason, "rejecting config update");
                self.diagnostics.note_config_update_rejected();
                return false;
            }
        };

        update::preserve_components(
            &self.config,
            &config,
            &mut self.graph,
            &mut new_graph,
            current_time_ns,
        );

        self.graph = new_graph;
        self.no_report_metric_ids = config.no_report_metric_ids.iter().copied().collect();
        self.allowlisted_atom_ids = config.allowlisted_atom_ids.iter().copied().collect();
        self.allowed_packages = config.allowed_log_sources.clone();
        self.allowed_config_uids = config.allowed_source_uids.clone();
        self.max_metrics_bytes = config.max_metrics_bytes();
        self.trigger_bytes = config.trigger_bytes();
        self.ttl_ns = config.ttl_ns();
        self.config = config;
        self.refresh_ttl(current_time_ns);
        self.init_allowed_sources();
        self.init_active_status();
        true
    }

    // ---- persistence ----

    /// Persistable alert metadata.
    pub fn write_metadata(&self) -> EngineMetadata {
        EngineMetadata {
            config_key: self.config_key,
            alerts: self
                .graph
                .alerts
                .iter()
                .filter_map(|alert| alert.write_metadata())
                .collect(),
        }
    }

    /// Restore persisted alert metadata.
    pub fn load_metadata(&mut self, metadata: &EngineMetadata) {
        for alert_metadata in &metadata.alerts {
            if let Some(alert) = self
                .graph
                .alerts
                .iter_mut()
                .find(|a| a.config.id == alert_metadata.alert_id)
            {
                alert.load_metadata(alert_metadata);
            }
        }
    }

    /// Persistable activation state with remaining TTLs.
    pub fn write_active_state(&self, now_ns: i64) -> ActiveConfigState {
        ActiveConfigState {
            config_key: self.config_key,
            metrics: self
                .graph
                .metrics_with_activation
                .iter()
                .map(|&index| {
                    let metric = &self.graph.metrics[index];
                    ActiveMetricState {
                        metric_id: metric.core.metric_id,
                        activations: metric.write_active_state(now_ns),
                    }
                })
                .collect(),
        }
    }

    /// Restore persisted activation state.
    pub fn load_active_state(&mut self, state: &ActiveConfigState, now_ns: i64) {
        for metric_state in &state.metrics {
            if let Some(&index) = self.graph.metric_index_by_id.get(&metric_state.metric_id) {
                self.graph.metrics[index].load_active_state(&metric_state.activations, now_ns);
            }
        }
        self.init_active_status();
    }

    // ---- debugging ----

    /// Human-readable dump of allowed sources and per-metric state.
    pub fn dump_states(&self, out: &mut String) {
        let _ = writeln!(out, "ConfigKey {}, allowed sources:", self.config_key);
        let mut uids: Vec<i32> = self.allowed_sources.read().iter().copied().collect();
        uids.sort_unstable();
        for uid in uids {
            let _ = write!(out, "{} ", uid);
        }
        let _ = writeln!(out);
        for metric in &self.graph.metrics {
            let _ = writeln!(
                out,
                "metric {}: active={} bytes={}",
                metric.core.metric_id,
                metric.is_active(),
                metric.byte_size()
            );
        }
    }
}

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
