//! Alert (anomaly) trackers.
//!
//! An alert watches one metric: sealed bucket values enter a rolling
//! window of `num_buckets`, and when the windowed sum for a key crosses
//! the trigger threshold outside its refractory period, the alert
//! fires. Duration alerts additionally schedule an anomaly alarm at the
//! projected crossing instant when a slice starts, through the
//! [`AlarmMonitor`] collaborator. Refractory ends persist across
//! reboots with one-second precision.

use crate::core::config::{AlertConfig, NS_PER_SEC};
use crate::core::diagnostics::EngineDiagnostics;
use crate::dimension::MetricKey;
use crate::external::AlarmMonitor;
use crate::metrics::{SealedBucket, SliceTransition};
use ahash::AHashMap;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Window {
    /// (bucket number, value) pairs inside the rolling window.
    buckets: VecDeque<(u64, i64)>,
    sum: i64,
}

/// Persisted alert state: refractory period ends per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    /// Alert id.
    pub alert_id: i64,
    /// Refractory end times, seconds of elapsed time, per key.
    pub refractory_ends_sec: Vec<(MetricKey, i64)>,
}

/// Tracks one alert over its metric's sealed buckets.
pub struct AlertTracker {
    /// The alert definition.
    pub config: AlertConfig,
    /// Index of the watched metric.
    pub metric_index: usize,
    windows: AHashMap<MetricKey, Window>,
    refractory_ends_sec: BTreeMap<MetricKey, i64>,
    pending_alarms: AHashMap<u64, MetricKey>,
    alarms: Arc<dyn AlarmMonitor>,
    diagnostics: Arc<EngineDiagnostics>,
    firings: u64,
}

impl std::fmt::Debug for AlertTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertTracker")
            .field("config", &self.config)
            .field("metric_index", &self.metric_index)
            .field("firings", &self.firings)
            .finish_non_exhaustive()
    }
}

impl AlertTracker {
    /// Tracker for one alert.
    pub fn new(
        config: AlertConfig,
        metric_index: usize,
        alarms: Arc<dyn AlarmMonitor>,
        diagnostics: Arc<EngineDiagnostics>,
    ) -> Self {
        AlertTracker {
            config,
            metric_index,
            windows: AHashMap::new(),
            refractory_ends_sec: BTreeMap::new(),
            pending_alarms: AHashMap::new(),
            alarms,
            diagnostics,
            firings: 0,
        }
    }

    /// Times this alert fired since construction.
    pub fn firings(&self) -> u64 {
        self.firings
    }

    /// Feed one sealed bucket of the watched metric.
    pub fn on_bucket_sealed(&mut self, sealed: &SealedBucket) {
        let window = self.windows.entry(sealed.key.clone()).or_default();
        if let Some(bucket_num) = sealed.bucket_num {
            window.buckets.push_back((bucket_num, sealed.value));
            window.sum += sealed.value;
            let horizon = bucket_num.saturating_sub(u64::from(self.config.num_buckets) - 1);
            while let Some(&(num, value)) = window.buckets.front() {
                if num < horizon {
                    window.buckets.pop_front();
                    window.sum -= value;
                } else {
                    break;
                }
            }
        } else {
            // Partial buckets contribute to the sum without advancing
            // the window.
            window.sum += sealed.value;
            window.buckets.push_back((window.buckets.back().map_or(0, |b| b.0), sealed.value));
        }
        if window.sum > self.config.trigger_if_sum_gt {
            let key = sealed.key.clone();
            self.declare(sealed.end_ns, &key);
        }
    }

    /// A duration slice started or stopped: (re)schedule or cancel the
    /// anomaly alarm at the projected threshold crossing.
    pub fn on_slice_transition(&mut self, transition: &SliceTransition) {
        let token = self.token_for(&transition.key);
        if transition.started {
            let window_sum =
                self.windows.get(&transition.key).map_or(0, |w| w.sum);
            let remaining =
                self.config.trigger_if_sum_gt - window_sum - transition.ongoing_ns;
            if remaining <= 0 {
                let key = transition.key.clone();
                self.declare(transition.ts_ns, &key);
            } else {
                self.pending_alarms.insert(token, transition.key.clone());
                self.alarms.schedule(transition.ts_ns + remaining, token);
            }
        } else if self.pending_alarms.remove(&token).is_some() {
            self.alarms.cancel(token);
        }
    }

    /// An anomaly alarm fired. Returns true when this tracker owned the
    /// token and declared.
    pub fn on_alarm_fired(&mut self, ts_ns: i64, token: u64) -> bool {
        let Some(key) = self.pending_alarms.remove(&token) else {
            return false;
        };
        self.declare(ts_ns, &key);
        true
    }

    fn declare(&mut self, ts_ns: i64, key: &MetricKey) {
        let ts_sec = ts_ns / NS_PER_SEC;
        if let Some(&ends) = self.refractory_ends_sec.get(key) {
            if ts_sec < ends {
                return;
            }
        }
        self.refractory_ends_sec
            .insert(key.clone(), ts_sec + i64::from(self.config.refractory_period_secs));
        self.firings += 1;
        self.diagnostics.note_alert_fired();
        let token = self.token_for(key);
        if self.pending_alarms.remove(&token).is_some() {
            self.alarms.cancel(token);
        }
        tracing::info!(alert_id = self.config.id, %key, "alert fired");
    }

    fn token_for(&self, key: &MetricKey) -> u64 {
        let mut hasher = FxHasher::default();
        self.config.id.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Persistable refractory state; empty when nothing fired.
    pub fn write_metadata(&self) -> Option<AlertMetadata> {
        if self.refractory_ends_sec.is_empty() {
            return None;
        }
        Some(AlertMetadata {
            alert_id: self.config.id,
            refractory_ends_sec: self
                .refractory_ends_sec
                .iter()
                .map(|(key, &ends)| (key.clone(), ends))
                .collect(),
        })
    }

    /// Restore persisted refractory state.
    pub fn load_metadata(&mut self, metadata: &AlertMetadata) {
        for (key, ends) in &metadata.refractory_ends_sec {
            self.refractory_ends_sec.insert(key.clone(), *ends);
        }
    }
}
