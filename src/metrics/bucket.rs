//! Shared bucket machinery: boundary math, condition timers, and the
//! dimension guardrail.

use crate::core::diagnostics::EngineDiagnostics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bucket width meaning "one bucket forever".
pub const INFINITE_BUCKET_NS: i64 = i64::MAX;

/// Default soft dimension guardrail.
pub const DEFAULT_SOFT_DIMENSION_LIMIT: usize = 500;

/// Default hard dimension guardrail.
pub const DEFAULT_HARD_DIMENSION_LIMIT: usize = 800;

/// End of the bucket containing `ts`:
/// `floor((ts - time_base) / width + 1) * width + time_base`.
pub fn bucket_end_ns(time_base_ns: i64, bucket_size_ns: i64, ts: i64) -> i64 {
    if bucket_size_ns == INFINITE_BUCKET_NS {
        return INFINITE_BUCKET_NS;
    }
    ((ts - time_base_ns) / bucket_size_ns + 1) * bucket_size_ns + time_base_ns
}

/// Bucket number of the bucket starting at `start_ns`, when aligned.
pub fn bucket_number(time_base_ns: i64, bucket_size_ns: i64, start_ns: i64) -> Option<u64> {
    if bucket_size_ns == INFINITE_BUCKET_NS {
        return None;
    }
    let offset = start_ns - time_base_ns;
    if offset >= 0 && offset % bucket_size_ns == 0 {
        Some((offset / bucket_size_ns) as u64)
    } else {
        None
    }
}

/// The interval a sealed bucket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBounds {
    /// Inclusive start, elapsed nanoseconds.
    pub start_ns: i64,
    /// Exclusive end, elapsed nanoseconds.
    pub end_ns: i64,
    /// Bucket number when the bucket is full-sized and aligned.
    pub bucket_num: Option<u64>,
    /// Set for partial buckets (config update, app upgrade, dump).
    pub partial: bool,
}

impl BucketBounds {
    /// Bounds of a full bucket starting at `start_ns`.
    pub fn full(time_base_ns: i64, bucket_size_ns: i64, start_ns: i64) -> Self {
        BucketBounds {
            start_ns,
            end_ns: start_ns.saturating_add(bucket_size_ns),
            bucket_num: bucket_number(time_base_ns, bucket_size_ns, start_ns),
            partial: false,
        }
    }

    /// Bounds of a partial bucket with explicit timestamps.
    pub fn partial(start_ns: i64, end_ns: i64) -> Self {
        BucketBounds {
            start_ns,
            end_ns,
            bucket_num: None,
            partial: true,
        }
    }
}

/// Tracks how long the metric's external condition has been true within
/// the current bucket. The accumulated time is reported alongside the
/// bucket payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionTimer {
    condition: bool,
    last_update_ns: i64,
    accumulated_ns: i64,
}

impl ConditionTimer {
    /// Timer starting at a bucket boundary with the given condition.
    pub fn new(condition: bool, bucket_start_ns: i64) -> Self {
        ConditionTimer {
            condition,
            last_update_ns: bucket_start_ns,
            accumulated_ns: 0,
        }
    }

    /// Record a condition edge at `ts`.
    pub fn on_condition_changed(&mut self, condition: bool, ts: i64) {
        if condition == self.condition {
            return;
        }
        if self.condition {
            self.accumulated_ns += ts.saturating_sub(self.last_update_ns).max(0);
        }
        self.condition = condition;
        self.last_update_ns = ts;
    }

    /// Seal the current bucket at `bucket_end_ns`, returning the
    /// condition-true nanoseconds it accumulated. The timer continues
    /// into the next bucket with the same condition.
    pub fn seal_bucket(&mut self, bucket_end_ns: i64) -> i64 {
        let mut total = self.accumulated_ns;
        if self.condition {
            total += bucket_end_ns.saturating_sub(self.last_update_ns).max(0);
            self.last_update_ns = bucket_end_ns;
        }
        self.accumulated_ns = 0;
        total
    }

    /// Snapshot of the accumulated condition-true time up to `ts`
    /// without sealing.
    pub fn peek(&self, ts: i64) -> i64 {
        let mut total = self.accumulated_ns;
        if self.condition {
            total += ts.saturating_sub(self.last_update_ns).max(0);
        }
        total
    }
}

/// Per-metric dimension guardrail: soft limit warns, hard limit drops
/// new keys and flags the report.
#[derive(Debug, Clone)]
pub struct DimensionGuardrail {
    /// Dimension count that triggers a warning.
    pub soft_limit: usize,
    /// Dimension count beyond which new keys are dropped.
    pub hard_limit: usize,
    /// Whether the hard limit was ever hit.
    pub hit: bool,
    metric_id: i64,
    diagnostics: Arc<EngineDiagnostics>,
}

impl DimensionGuardrail {
    /// Guardrail for one metric.
    pub fn new(
        metric_id: i64,
        soft_limit: Option<usize>,
        hard_limit: Option<usize>,
        diagnostics: Arc<EngineDiagnostics>,
    ) -> Self {
        let soft = soft_limit.unwrap_or(DEFAULT_SOFT_DIMENSION_LIMIT);
        let hard = hard_limit.unwrap_or(DEFAULT_HARD_DIMENSION_LIMIT).max(soft);
        DimensionGuardrail {
            soft_limit: soft,
            hard_limit: hard,
            hit: false,
            metric_id,
            diagnostics,
        }
    }

    /// Decide whether a new key may be admitted given the current
    /// tracked-key count. Existing keys always pass.
    pub fn admit_new_key(&mut self, tracked_keys: usize) -> bool {
        if tracked_keys >= self.hard_limit {
            if !self.hit {
                tracing::warn!(
                    metric_id = self.metric_id,
                    limit = self.hard_limit,
                    "dimension hard limit reached, dropping new keys"
                );
            }
            self.hit = true;
            self.diagnostics.note_hard_guardrail_hit();
            return false;
        }
        if tracked_keys >= self.soft_limit {
            tracing::warn!(
                metric_id = self.metric_id,
                tracked = tracked_keys,
                limit = self.soft_limit,
                "dimension soft limit exceeded"
            );
            self.diagnostics.note_soft_guardrail_hit();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: i64 = 10_000_000_000;
    const FIVE_MIN: i64 = 5 * 60 * 1_000_000_000;

    #[test]
    fn test_bucket_end_math() {
        assert_eq!(bucket_end_ns(BASE, FIVE_MIN, BASE), BASE + FIVE_MIN);
        assert_eq!(bucket_end_ns(BASE, FIVE_MIN, BASE + 1), BASE + FIVE_MIN);
        assert_eq!(bucket_end_ns(BASE, FIVE_MIN, BASE + FIVE_MIN), BASE + 2 * FIVE_MIN);
        assert_eq!(bucket_end_ns(BASE, INFINITE_BUCKET_NS, BASE + 1), INFINITE_BUCKET_NS);
    }

    #[test]
    fn test_bucket_number() {
        assert_eq!(bucket_number(BASE, FIVE_MIN, BASE), Some(0));
        assert_eq!(bucket_number(BASE, FIVE_MIN, BASE + 2 * FIVE_MIN), Some(2));
        assert_eq!(bucket_number(BASE, FIVE_MIN, BASE + 1), None);
    }

    #[test]
    fn test_condition_timer_accumulates_true_time() {
        let mut timer = ConditionTimer::new(false, 0);
        timer.on_condition_changed(true, 100);
        timer.on_condition_changed(false, 250);
        timer.on_condition_changed(true, 300);
        // Sealed at 400: 150 from the first interval, 100 ongoing.
        assert_eq!(timer.seal_bucket(400), 250);
        // Next bucket: the ongoing interval continues from the boundary.
        assert_eq!(timer.seal_bucket(500), 100);
    }

    #[test]
    fn test_condition_timer_duplicate_edges_ignored() {
        let mut timer = ConditionTimer::new(true, 0);
        timer.on_condition_changed(true, 50);
        assert_eq!(timer.peek(100), 100);
    }

    #[test]
    fn test_guardrail_soft_then_hard() {
        let diag = Arc::new(EngineDiagnostics::new());
        let mut guardrail = DimensionGuardrail::new(1, Some(2), Some(3), Arc::clone(&diag));

        assert!(guardrail.admit_new_key(0));
        assert!(guardrail.admit_new_key(2)); // soft exceeded, still admitted
        assert!(!guardrail.admit_new_key(3)); // hard: dropped
        assert!(guardrail.hit);
        let snap = diag.snapshot();
        assert_eq!(snap.soft_guardrail_hits, 1);
        assert_eq!(snap.hard_guardrail_hits, 1);
    }

    #[test]
    fn test_guardrail_hard_never_below_soft() {
        let diag = Arc::new(EngineDiagnostics::new());
        let guardrail = DimensionGuardrail::new(1, Some(10), Some(5), diag);
        assert_eq!(guardrail.hard_limit, 10);
    }
}
