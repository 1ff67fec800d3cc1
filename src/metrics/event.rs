//! Event metric producer.
//!
//! Retains every matched event, subject to sampling and deduplication:
//! identical field-value tuples collapse to a single entry carrying the
//! list of timestamps. Event metrics have no bucket machinery; entries
//! span the report period.

use super::MetricCore;
use crate::condition::Condition;
use crate::core::types::{Event, FieldValue};
use crate::report::{DumpRequest, EventEntry, MetricReportData};
use ahash::AHashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EventTuple {
    tag_id: u32,
    values: Vec<FieldValue>,
}

/// Retains matched events, deduplicated by field-value tuple.
#[derive(Debug, Default)]
pub struct EventMetric {
    entries: AHashMap<EventTuple, Vec<i64>>,
}

impl EventMetric {
    /// Empty producer.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_matched(
        &mut self,
        core: &mut MetricCore,
        event: &Event,
        conditions: &[Condition],
    ) {
        if !core.event_passes_gates(event, conditions) {
            return;
        }
        let tuple = EventTuple {
            tag_id: event.tag_id,
            values: event.values.clone(),
        };
        if !self.entries.contains_key(&tuple)
            && !core.guardrail.admit_new_key(self.entries.len())
        {
            return;
        }
        self.entries.entry(tuple).or_default().push(event.elapsed_ns);
    }

    pub(crate) fn dump(&mut self, request: &DumpRequest) -> MetricReportData {
        let mut tuples: Vec<&EventTuple> = self.entries.keys().collect();
        tuples.sort();
        let entries = tuples
            .into_iter()
            .map(|tuple| EventEntry {
                tag_id: tuple.tag_id,
                values: tuple.values.clone(),
                timestamps: self.entries[tuple].clone(),
            })
            .collect();
        if request.erase_data {
            self.entries.clear();
        }
        MetricReportData::Event(entries)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn drop_oldest(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .filter_map(|(tuple, timestamps)| timestamps.first().map(|&ts| (ts, tuple.clone())))
            .min();
        let Some((_, tuple)) = oldest else {
            return false;
        };
        self.entries.remove(&tuple);
        true
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(tuple, timestamps)| 16 + 32 * tuple.values.len() + 8 * timestamps.len())
            .sum()
    }
}
