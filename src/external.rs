//! Collaborator interfaces at the core boundary.
//!
//! The engine consumes events and emits report structures; everything
//! else — package/uid translation, pull-based data sourcing, alarm
//! scheduling, state sourcing — lives behind these traits. Callbacks
//! from collaborators must be serialized onto the dispatcher task by
//! the host; the core owns no threads.

use crate::core::error::Result;
use crate::core::types::{Event, FieldPath, FieldValue, Value};
use crate::dimension::DimensionKey;
use ahash::AHashMap;
use std::sync::Arc;

/// Sentinel for a state whose value has not been observed yet.
pub const STATE_UNKNOWN: i32 = -1;

/// Translates package names to uids.
pub trait UidMap: Send + Sync {
    /// Uids currently assigned to a package, empty when unknown.
    fn app_uids(&self, package: &str) -> Vec<i32>;
}

/// Pull-based data source for gauge and value metrics.
pub trait StatsPuller: Send + Sync {
    /// Produce a snapshot of the given atom. The engine treats an error
    /// as a failed pull and marks the affected bucket.
    fn pull(&self, atom_id: u32, uids: &[i32]) -> Result<Vec<Event>>;
}

/// Alarm scheduling for duration anomaly detection.
pub trait AlarmMonitor: Send + Sync {
    /// Schedule an alarm; the host fires it back into the engine.
    fn schedule(&self, fire_at_ns: i64, token: u64);
    /// Cancel a previously scheduled alarm.
    fn cancel(&self, token: u64);
}

/// Everything the engine calls out to, bundled for construction.
#[derive(Clone)]
pub struct Collaborators {
    /// Package-to-uid translation.
    pub uid_map: Arc<dyn UidMap>,
    /// Pull source.
    pub puller: Arc<dyn StatsPuller>,
    /// Alarm scheduling.
    pub alarms: Arc<dyn AlarmMonitor>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            uid_map: Arc::new(NoopUidMap),
            puller: Arc::new(NoopPuller),
            alarms: Arc::new(NoopAlarms),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// UidMap that knows no packages.
#[derive(Debug, Default)]
pub struct NoopUidMap;

impl UidMap for NoopUidMap {
    fn app_uids(&self, _package: &str) -> Vec<i32> {
        Vec::new()
    }
}

/// Puller that returns no data.
#[derive(Debug, Default)]
pub struct NoopPuller;

impl StatsPuller for NoopPuller {
    fn pull(&self, _atom_id: u32, _uids: &[i32]) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

/// AlarmMonitor that ignores everything.
#[derive(Debug, Default)]
pub struct NoopAlarms;

impl AlarmMonitor for NoopAlarms {
    fn schedule(&self, _fire_at_ns: i64, _token: u64) {}
    fn cancel(&self, _token: u64) {}
}

/// Last-known values of sliced-state atoms, keyed by their primary
/// dimensions. The host feeds state-change events in before the log
/// event that references them.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: AHashMap<u32, AHashMap<DimensionKey, Value>>,
}

impl StateCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state change.
    pub fn update(&mut self, state_atom_id: u32, primary_key: DimensionKey, value: Value) {
        self.entries.entry(state_atom_id).or_default().insert(primary_key, value);
    }

    /// Current value of a state atom at a primary key, if observed.
    pub fn get(&self, state_atom_id: u32, primary_key: &DimensionKey) -> Option<&Value> {
        self.entries.get(&state_atom_id)?.get(primary_key)
    }

    /// Current value, or the unknown-state sentinel as a field-value
    /// suitable for inclusion in a state-values key.
    pub fn value_or_unknown(&self, state_atom_id: u32, primary_key: &DimensionKey) -> FieldValue {
        let value = self
            .get(state_atom_id, primary_key)
            .cloned()
            .unwrap_or(Value::Int(STATE_UNKNOWN));
        FieldValue::new(FieldPath::leaf(state_atom_id, 0), value)
    }
}
