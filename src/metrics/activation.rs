//! Metric activation state machine.
//!
//! Each metric may carry activation records keyed by the matcher index
//! that triggers them. A record holds a TTL (0 = always-on once
//! triggered) and moves through `{not_set, active, expired}`; a metric
//! with no records is always active, otherwise it is active while any
//! record is. Cancellation mid-bucket leaves already-aggregated data in
//! place and simply stops new accumulation until re-activation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of one activation record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationState {
    /// Never triggered, or canceled.
    #[default]
    NotSet,
    /// Triggered and within its TTL.
    Active,
    /// TTL elapsed; eligible for re-activation.
    Expired,
}

/// One activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Time-to-live in nanoseconds; 0 keeps the activation on forever.
    pub ttl_ns: i64,
    /// When the activation last triggered.
    pub start_ns: i64,
    /// Current state.
    pub state: ActivationState,
}

impl Activation {
    fn new(ttl_ns: i64) -> Self {
        Activation {
            ttl_ns,
            start_ns: 0,
            state: ActivationState::NotSet,
        }
    }
}

/// Persisted view of one activation, with remaining TTL so reboot
/// restores in-flight activations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationSnapshot {
    /// Matcher index the record is keyed on.
    pub matcher_index: usize,
    /// State at persist time.
    pub state: ActivationState,
    /// Nanoseconds of TTL left at persist time (0 for sticky records).
    pub remaining_ttl_ns: i64,
}

/// All activation records of one metric plus the cancellation edges.
#[derive(Debug, Clone, Default)]
pub struct ActivationMap {
    /// Records keyed by activation matcher index. Ordered so persisted
    /// state is deterministic.
    records: BTreeMap<usize, Activation>,
    /// Deactivation matcher index to the activations it cancels.
    cancellations: BTreeMap<usize, Vec<usize>>,
}

impl ActivationMap {
    /// Empty map: the owning metric is always active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activation record.
    pub fn add_activation(&mut self, matcher_index: usize, ttl_ns: i64) {
        self.records.insert(matcher_index, Activation::new(ttl_ns));
    }

    /// Register a cancellation edge.
    pub fn add_cancellation(&mut self, deactivation_matcher_index: usize, activation_matcher_index: usize) {
        self.cancellations
            .entry(deactivation_matcher_index)
            .or_default()
            .push(activation_matcher_index);
    }

    /// True when no records exist.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A metric is active when it has no activations, or any is active.
    pub fn is_active(&self) -> bool {
        self.records.is_empty()
            || self.records.values().any(|a| a.state == ActivationState::Active)
    }

    /// Expire records whose TTL has elapsed as of `ts`. Returns true
    /// when any record expired.
    pub fn flush_expired(&mut self, ts: i64) -> bool {
        let mut changed = false;
        for activation in self.records.values_mut() {
            if activation.state == ActivationState::Active
                && activation.ttl_ns > 0
                && activation.start_ns + activation.ttl_ns <= ts
            {
                activation.state = ActivationState::Expired;
                changed = true;
            }
        }
        changed
    }

    /// Trigger the record keyed on `matcher_index` at `ts`. Re-triggering
    /// an active record refreshes its TTL window.
    pub fn activate(&mut self, matcher_index: usize, ts: i64) {
        if let Some(activation) = self.records.get_mut(&matcher_index) {
            activation.state = ActivationState::Active;
            activation.start_ns = ts;
        }
    }

    /// Cancel every activation linked to the deactivation matcher.
    /// Returns true when any record was active.
    pub fn cancel(&mut self, deactivation_matcher_index: usize) -> bool {
        let mut changed = false;
        if let Some(targets) = self.cancellations.get(&deactivation_matcher_index).cloned() {
            for target in targets {
                if let Some(activation) = self.records.get_mut(&target) {
                    if activation.state == ActivationState::Active {
                        changed = true;
                    }
                    activation.state = ActivationState::NotSet;
                }
            }
        }
        changed
    }

    /// Persistable snapshot with remaining TTLs as of `now_ns`.
    pub fn write_state(&self, now_ns: i64) -> Vec<ActivationSnapshot> {
        self.records
            .iter()
            .map(|(&matcher_index, activation)| {
                let remaining = if activation.state == ActivationState::Active && activation.ttl_ns > 0 {
                    (activation.start_ns + activation.ttl_ns - now_ns).max(0)
                } else {
                    0
                };
                ActivationSnapshot {
                    matcher_index,
                    state: activation.state,
                    remaining_ttl_ns: remaining,
                }
            })
            .collect()
    }

    /// Restore a persisted snapshot as of `now_ns`. Records with an
    /// elapsed remaining TTL come back expired.
    pub fn load_state(&mut self, snapshots: &[ActivationSnapshot], now_ns: i64) {
        for snapshot in snapshots {
            if let Some(activation) = self.records.get_mut(&snapshot.matcher_index) {
                activation.state = snapshot.state;
                if snapshot.state == ActivationState::Active {
                    if activation.ttl_ns > 0 && snapshot.remaining_ttl_ns <= 0 {
                        activation.state = ActivationState::Expired;
                    } else {
                        // Re-anchor so the remaining TTL plays out from now.
                        activation.start_ns =
                            now_ns - (activation.ttl_ns - snapshot.remaining_ttl_ns).max(0);
                    }
                }
            }
        }
    }
}
