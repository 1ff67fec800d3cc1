//! Condition (predicate) layer.
//!
//! A simple condition is a two-matcher state machine — start turns it
//! true, stop turns it false, stop-all clears every slice — optionally
//! sliced by dimensions into a map of tri-state slices. A combination
//! condition is a boolean formula over earlier conditions. The
//! dispatcher re-evaluates only conditions whose input matchers matched,
//! and conditions expose the set of slices that just transitioned so
//! metrics can update only affected trackers.

pub mod wizard;

use crate::core::types::{Event, FieldPath};
use crate::dimension::{filter_values, DimensionKey};
use crate::matcher::{LogicalOperation, MatchingState};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Tri-state condition value, plus a per-event cache sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionState {
    /// The condition is false.
    False,
    /// The condition is true.
    True,
    /// No history observed yet.
    #[default]
    Unknown,
    /// Cache slot not filled for this event.
    NotEvaluated,
}

impl ConditionState {
    /// True when the state is [`ConditionState::True`].
    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }

    /// Tri-state AND: false dominates, then unknown.
    pub fn and(self, other: ConditionState) -> ConditionState {
        use ConditionState::*;
        match (self, other) {
            (False, _) | (_, False) => False,
            (True, True) => True,
            _ => Unknown,
        }
    }

    /// Tri-state OR: true dominates, then unknown.
    pub fn or(self, other: ConditionState) -> ConditionState {
        use ConditionState::*;
        match (self, other) {
            (True, _) | (_, True) => True,
            (False, False) => False,
            _ => Unknown,
        }
    }

    /// Tri-state NOT: unknown stays unknown.
    pub fn negate(self) -> ConditionState {
        use ConditionState::*;
        match self {
            True => False,
            False => True,
            other => other,
        }
    }
}

impl From<bool> for ConditionState {
    fn from(value: bool) -> Self {
        if value {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }
}

/// Simple condition: per-slice start/stop state machine.
#[derive(Debug, Clone)]
pub struct SimpleCondition {
    /// Matcher index that turns a slice true.
    pub start_index: Option<usize>,
    /// Matcher index that turns a slice false.
    pub stop_index: Option<usize>,
    /// Matcher index that turns every slice false.
    pub stop_all_index: Option<usize>,
    /// Count outstanding starts; when disabled the count saturates at 1.
    pub count_nesting: bool,
    /// Value before any history is observed.
    pub initial_value: ConditionState,
    /// Dimensions slicing this condition's state; empty means unsliced.
    pub dimensions: Vec<FieldPath>,
    /// Outstanding start counts per slice; a slice is true while present.
    slices: AHashMap<DimensionKey, u32>,
    /// Whether any event has reached this condition yet.
    evaluated: bool,
    changed_to_true: Vec<DimensionKey>,
    changed_to_false: Vec<DimensionKey>,
}

impl SimpleCondition {
    /// Build a simple condition with empty history.
    pub fn new(
        start_index: Option<usize>,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        count_nesting: bool,
        initial_value: ConditionState,
        dimensions: Vec<FieldPath>,
    ) -> Self {
        let mut slices = AHashMap::new();
        if initial_value == ConditionState::True {
            slices.insert(DimensionKey::empty(), 1);
        }
        SimpleCondition {
            start_index,
            stop_index,
            stop_all_index,
            count_nesting,
            initial_value,
            dimensions,
            slices,
            evaluated: false,
            changed_to_true: Vec::new(),
            changed_to_false: Vec::new(),
        }
    }

    /// True when this condition is sliced by dimensions.
    pub fn is_sliced(&self) -> bool {
        !self.dimensions.is_empty()
    }

    /// Tri-state value of one slice.
    pub fn slice_state(&self, key: &DimensionKey) -> ConditionState {
        if self.slices.contains_key(key) {
            ConditionState::True
        } else if !self.evaluated && self.initial_value == ConditionState::Unknown {
            ConditionState::Unknown
        } else {
            ConditionState::False
        }
    }

    /// Value the condition holds before any history is observed.
    pub fn initial_state(&self) -> ConditionState {
        self.initial_value
    }

    /// Slices that flipped to true on the last evaluation.
    pub fn changed_to_true(&self) -> &[DimensionKey] {
        &self.changed_to_true
    }

    /// Slices that flipped to false on the last evaluation.
    pub fn changed_to_false(&self) -> &[DimensionKey] {
        &self.changed_to_false
    }

    /// Number of currently-true slices.
    pub fn true_slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Extract the runtime state for a configuration update.
    pub(crate) fn take_runtime(&mut self) -> (AHashMap<DimensionKey, u32>, bool) {
        (std::mem::take(&mut self.slices), self.evaluated)
    }

    /// Adopt runtime state preserved across a configuration update.
    pub(crate) fn adopt_runtime(&mut self, runtime: (AHashMap<DimensionKey, u32>, bool)) {
        self.slices = runtime.0;
        self.evaluated = runtime.1;
    }

    fn evaluate(&mut self, event: &Event, matcher_cache: &[MatchingState]) -> ConditionState {
        let started = self.start_index.is_some_and(|i| matcher_cache[i].is_matched());
        let stopped = self.stop_index.is_some_and(|i| matcher_cache[i].is_matched());
        let stop_all = self.stop_all_index.is_some_and(|i| matcher_cache[i].is_matched());

        self.changed_to_true.clear();
        self.changed_to_false.clear();
        self.evaluated = true;

        if stop_all {
            self.changed_to_false.extend(self.slices.drain().map(|(k, _)| k));
        } else {
            let key = filter_values(&self.dimensions, &event.values);
            if started {
                let count = self.slices.entry(key.clone()).or_insert(0);
                let was_zero = *count == 0;
                *count = if self.count_nesting { count.saturating_add(1) } else { 1 };
                if was_zero {
                    self.changed_to_true.push(key.clone());
                }
            }
            if stopped {
                if let Some(count) = self.slices.get_mut(&key) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.slices.remove(&key);
                        self.changed_to_false.push(key);
                    }
                }
            }
        }

        if self.slices.is_empty() {
            ConditionState::False
        } else {
            ConditionState::True
        }
    }
}

/// Boolean formula over earlier condition indices.
#[derive(Debug, Clone)]
pub struct CombinationCondition {
    /// AND / OR / NOT.
    pub operation: LogicalOperation,
    /// Input condition indices, all strictly smaller than this one's.
    pub children: Vec<usize>,
}

impl CombinationCondition {
    fn combine(&self, states: impl Iterator<Item = ConditionState>) -> ConditionState {
        match self.operation {
            LogicalOperation::And => {
                states.fold(ConditionState::True, ConditionState::and)
            }
            LogicalOperation::Or => {
                states.fold(ConditionState::False, ConditionState::or)
            }
            LogicalOperation::Not => {
                // Arity validated at build time.
                states
                    .into_iter()
                    .next()
                    .unwrap_or(ConditionState::Unknown)
                    .negate()
            }
        }
    }
}

/// A compiled condition with its configuration id and current state.
#[derive(Debug, Clone)]
pub struct Condition {
    /// Configuration id of this predicate.
    pub id: i64,
    /// Current overall state.
    pub state: ConditionState,
    /// The condition body.
    pub kind: ConditionKind,
}

/// Condition variants.
#[derive(Debug, Clone)]
pub enum ConditionKind {
    /// Two-matcher state machine.
    Simple(SimpleCondition),
    /// Boolean formula over other conditions.
    Combination(CombinationCondition),
}

impl Condition {
    /// True when this condition maintains per-dimension slices.
    pub fn is_sliced(&self, all: &[Condition]) -> bool {
        match &self.kind {
            ConditionKind::Simple(simple) => simple.is_sliced(),
            ConditionKind::Combination(combo) => {
                combo.children.iter().any(|&child| all[child].is_sliced(all))
            }
        }
    }
}

/// Matcher indices feeding a condition, transitively through
/// combinations. Used to decide which conditions an event can affect.
pub fn input_matchers(conditions: &[Condition], index: usize) -> Vec<usize> {
    let mut out = Vec::new();
    collect_input_matchers(conditions, index, &mut out);
    out
}

fn collect_input_matchers(conditions: &[Condition], index: usize, out: &mut Vec<usize>) {
    match &conditions[index].kind {
        ConditionKind::Simple(simple) => {
            for idx in [simple.start_index, simple.stop_index, simple.stop_all_index]
                .into_iter()
                .flatten()
            {
                if !out.contains(&idx) {
                    out.push(idx);
                }
            }
        }
        ConditionKind::Combination(combo) => {
            for &child in &combo.children {
                collect_input_matchers(conditions, child, out);
            }
        }
    }
}

/// Evaluate every condition bottom-up against empty history, seeding
/// the initial condition cache. Lets metrics created mid-stream compute
/// their first bucket correctly.
pub fn initialize_states(conditions: &mut [Condition]) {
    for index in 0..conditions.len() {
        let (earlier, rest) = conditions.split_at_mut(index);
        let condition = &mut rest[0];
        condition.state = match &condition.kind {
            ConditionKind::Simple(simple) => simple.initial_state(),
            ConditionKind::Combination(combo) => {
                combo.combine(combo.children.iter().map(|&child| earlier[child].state))
            }
        };
    }
}

/// Re-evaluate one condition for an event.
///
/// Combination children read this event's cache slot when it was filled
/// earlier in index order, falling back to the stored state; the
/// topological ordering invariant guarantees children precede parents.
pub fn evaluate_condition(
    index: usize,
    conditions: &mut [Condition],
    event: &Event,
    matcher_cache: &[MatchingState],
    condition_cache: &mut [ConditionState],
    changed_cache: &mut [bool],
) {
    let (earlier, rest) = conditions.split_at_mut(index);
    let condition = &mut rest[0];
    let old_state = condition.state;

    let (new_state, slices_changed) = match &mut condition.kind {
        ConditionKind::Simple(simple) => {
            let state = simple.evaluate(event, matcher_cache);
            let slices_changed =
                !simple.changed_to_true.is_empty() || !simple.changed_to_false.is_empty();
            (state, slices_changed)
        }
        ConditionKind::Combination(combo) => {
            let state = combo.combine(combo.children.iter().map(|&child| {
                if condition_cache[child] != ConditionState::NotEvaluated {
                    condition_cache[child]
                } else {
                    earlier[child].state
                }
            }));
            // A combination may need re-notification when a sliced child
            // moved even if the overall formula did not.
            let slices_changed = combo.children.iter().any(|&child| changed_cache[child]);
            (state, slices_changed)
        }
    };

    condition.state = new_state;
    condition_cache[index] = new_state;
    changed_cache[index] = new_state != old_state || slices_changed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldPath;

    const START: usize = 0;
    const STOP: usize = 1;
    const STOP_ALL: usize = 2;

    fn cache_for(matched: &[usize]) -> Vec<MatchingState> {
        let mut cache = vec![MatchingState::NotMatched; 3];
        for &i in matched {
            cache[i] = MatchingState::Matched;
        }
        cache
    }

    fn simple_condition(nesting: bool, dimensions: Vec<FieldPath>) -> Condition {
        Condition {
            id: 100,
            state: ConditionState::False,
            kind: ConditionKind::Simple(SimpleCondition::new(
                Some(START),
                Some(STOP),
                Some(STOP_ALL),
                nesting,
                ConditionState::False,
                dimensions,
            )),
        }
    }

    fn evaluate(conditions: &mut [Condition], event: &Event, matched: &[usize]) -> (ConditionState, bool) {
        let mut condition_cache = vec![ConditionState::NotEvaluated; conditions.len()];
        let mut changed_cache = vec![false; conditions.len()];
        for i in 0..conditions.len() {
            evaluate_condition(
                i,
                conditions,
                event,
                &cache_for(matched),
                &mut condition_cache,
                &mut changed_cache,
            );
        }
        (condition_cache[0], changed_cache[0])
    }

    #[test]
    fn test_tri_state_algebra() {
        use ConditionState::*;
        assert_eq!(True.and(Unknown), Unknown);
        assert_eq!(False.and(Unknown), False);
        assert_eq!(True.or(Unknown), True);
        assert_eq!(False.or(Unknown), Unknown);
        assert_eq!(Unknown.negate(), Unknown);
        assert_eq!(True.negate(), False);
    }

    #[test]
    fn test_start_stop_transitions() {
        let mut conditions = vec![simple_condition(true, vec![])];
        let event = Event::builder(1).at(10).build();

        let (state, changed) = evaluate(&mut conditions, &event, &[START]);
        assert_eq!(state, ConditionState::True);
        assert!(changed);

        let (state, changed) = evaluate(&mut conditions, &event, &[STOP]);
        assert_eq!(state, ConditionState::False);
        assert!(changed);
    }

    #[test]
    fn test_nesting_counts_outstanding_starts() {
        let mut conditions = vec![simple_condition(true, vec![])];
        let event = Event::builder(1).build();

        evaluate(&mut conditions, &event, &[START]);
        evaluate(&mut conditions, &event, &[START]);
        let (state, _) = evaluate(&mut conditions, &event, &[STOP]);
        // One stop of two starts keeps the condition true.
        assert_eq!(state, ConditionState::True);
        let (state, _) = evaluate(&mut conditions, &event, &[STOP]);
        assert_eq!(state, ConditionState::False);
    }

    #[test]
    fn test_no_nesting_saturates_at_one() {
        let mut conditions = vec![simple_condition(false, vec![])];
        let event = Event::builder(1).build();

        evaluate(&mut conditions, &event, &[START]);
        evaluate(&mut conditions, &event, &[START]);
        let (state, _) = evaluate(&mut conditions, &event, &[STOP]);
        assert_eq!(state, ConditionState::False);
    }

    #[test]
    fn test_sliced_condition_tracks_keys_independently() {
        let dims = vec![FieldPath::leaf(1, 1)];
        let mut conditions = vec![simple_condition(true, dims)];

        let uid7 = Event::builder(1).int_field(1, 7).build();
        let uid8 = Event::builder(1).int_field(1, 8).build();

        evaluate(&mut conditions, &uid7, &[START]);
        evaluate(&mut conditions, &uid8, &[START]);
        evaluate(&mut conditions, &uid7, &[STOP]);

        let ConditionKind::Simple(simple) = &conditions[0].kind else {
            unreachable!()
        };
        let key7 = filter_values(&[FieldPath::leaf(1, 1)], &uid7.values);
        let key8 = filter_values(&[FieldPath::leaf(1, 1)], &uid8.values);
        assert_eq!(simple.slice_state(&key7), ConditionState::False);
        assert_eq!(simple.slice_state(&key8), ConditionState::True);
        assert_eq!(simple.changed_to_false(), &[key7]);
    }

    #[test]
    fn test_stop_all_clears_every_slice() {
        let dims = vec![FieldPath::leaf(1, 1)];
        let mut conditions = vec![simple_condition(true, dims)];

        let uid7 = Event::builder(1).int_field(1, 7).build();
        let uid8 = Event::builder(1).int_field(1, 8).build();
        evaluate(&mut conditions, &uid7, &[START]);
        evaluate(&mut conditions, &uid8, &[START]);

        let (state, _) = evaluate(&mut conditions, &uid7, &[STOP_ALL]);
        assert_eq!(state, ConditionState::False);
        let ConditionKind::Simple(simple) = &conditions[0].kind else {
            unreachable!()
        };
        assert_eq!(simple.true_slice_count(), 0);
        assert_eq!(simple.changed_to_false().len(), 2);
    }

    #[test]
    fn test_combination_formula_and_initial_cache() {
        let mut conditions = vec![
            simple_condition(true, vec![]),
            Condition {
                id: 200,
                state: ConditionState::Unknown,
                kind: ConditionKind::Combination(CombinationCondition {
                    operation: LogicalOperation::Not,
                    children: vec![0],
                }),
            },
        ];
        initialize_states(&mut conditions);
        assert_eq!(conditions[0].state, ConditionState::False);
        assert_eq!(conditions[1].state, ConditionState::True);

        let event = Event::builder(1).build();
        let mut condition_cache = vec![ConditionState::NotEvaluated; 2];
        let mut changed_cache = vec![false; 2];
        for i in 0..2 {
            evaluate_condition(
                i,
                &mut conditions,
                &event,
                &cache_for(&[START]),
                &mut condition_cache,
                &mut changed_cache,
            );
        }
        assert_eq!(conditions[0].state, ConditionState::True);
        assert_eq!(conditions[1].state, ConditionState::False);
        assert!(changed_cache[1]);
    }

    #[test]
    fn test_input_matchers_transitive() {
        let conditions = vec![
            simple_condition(true, vec![]),
            Condition {
                id: 200,
                state: ConditionState::Unknown,
                kind: ConditionKind::Combination(CombinationCondition {
                    operation: LogicalOperation::Not,
                    children: vec![0],
                }),
            },
        ];
        let mut inputs = input_matchers(&conditions, 1);
        inputs.sort_unstable();
        assert_eq!(inputs, vec![START, STOP, STOP_ALL]);
    }
}
