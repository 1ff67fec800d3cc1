//! Engine-wide diagnostic counters.
//!
//! Failures never abort the dispatcher; they surface here and in report
//! flags. Counters are atomics so collaborator callbacks on other
//! threads can read a consistent snapshot without locking.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing one MetricsManager's behavior.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    events_processed: AtomicU64,
    events_rejected_credentials: AtomicU64,
    events_late: AtomicU64,
    matcher_hits: AtomicU64,
    condition_changes: AtomicU64,
    soft_guardrail_hits: AtomicU64,
    hard_guardrail_hits: AtomicU64,
    buckets_dropped_for_memory: AtomicU64,
    pull_failures: AtomicU64,
    alerts_fired: AtomicU64,
    reports_generated: AtomicU64,
    config_updates_rejected: AtomicU64,
}

impl EngineDiagnostics {
    /// Fresh counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn note_event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_event_rejected_credentials(&self) {
        self.events_rejected_credentials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_event_late(&self) {
        self.events_late.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_matcher_hit(&self) {
        self.matcher_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_condition_changed(&self) {
        self.condition_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_soft_guardrail_hit(&self) {
        self.soft_guardrail_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_hard_guardrail_hit(&self) {
        self.hard_guardrail_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_bucket_dropped_for_memory(&self) {
        self.buckets_dropped_for_memory.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_pull_failure(&self) {
        self.pull_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_alert_fired(&self) {
        self.alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_report_generated(&self) {
        self.reports_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_config_update_rejected(&self) {
        self.config_updates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_rejected_credentials: self.events_rejected_credentials.load(Ordering::Relaxed),
            events_late: self.events_late.load(Ordering::Relaxed),
            matcher_hits: self.matcher_hits.load(Ordering::Relaxed),
            condition_changes: self.condition_changes.load(Ordering::Relaxed),
            soft_guardrail_hits: self.soft_guardrail_hits.load(Ordering::Relaxed),
            hard_guardrail_hits: self.hard_guardrail_hits.load(Ordering::Relaxed),
            buckets_dropped_for_memory: self.buckets_dropped_for_memory.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            reports_generated: self.reports_generated.load(Ordering::Relaxed),
            config_updates_rejected: self.config_updates_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Frozen view of [`EngineDiagnostics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Events that passed the credential check.
    pub events_processed: u64,
    /// Events rejected for uncredentialed sources.
    pub events_rejected_credentials: u64,
    /// Events dropped for arriving behind a metric's clock.
    pub events_late: u64,
    /// Matcher evaluations that matched.
    pub matcher_hits: u64,
    /// Condition transitions observed.
    pub condition_changes: u64,
    /// Soft dimension guardrail warnings.
    pub soft_guardrail_hits: u64,
    /// Hard dimension guardrail drops.
    pub hard_guardrail_hits: u64,
    /// Buckets discarded to honor the byte cap.
    pub buckets_dropped_for_memory: u64,
    /// Failed pulls.
    pub pull_failures: u64,
    /// Alert firings.
    pub alerts_fired: u64,
    /// Reports produced.
    pub reports_generated: u64,
    /// Configuration updates rejected as invalid.
    pub config_updates_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let diag = EngineDiagnostics::new();
        diag.note_event_processed();
        diag.note_event_processed();
        diag.note_matcher_hit();
        diag.note_hard_guardrail_hit();

        let snap = diag.snapshot();
        assert_eq!(snap.events_processed, 2);
        assert_eq!(snap.matcher_hits, 1);
        assert_eq!(snap.hard_guardrail_hits, 1);
        assert_eq!(snap.alerts_fired, 0);
    }
}
