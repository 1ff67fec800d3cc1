//! Sliced-condition queries over the condition vector.
//!
//! Rather than a separate object graph, the wizard is a set of
//! stateless functions over `&[Condition]`. Metrics use it to ask
//! "what is the state of condition C at slice K?", to read the slice
//! delta sets from the last evaluation, and to detect when a single
//! condition link covers every dimension of the sliced condition (which
//! enables walking only the trackers in a delta set).

use super::{Condition, ConditionKind, ConditionState};
use crate::core::types::FieldPath;
use crate::dimension::DimensionKey;

/// Overall state of a condition.
pub fn query_overall(conditions: &[Condition], index: usize) -> ConditionState {
    conditions[index].state
}

/// State of a condition at one slice.
///
/// For a simple sliced condition the slice map is consulted directly;
/// for a combination the key is substituted into every sliced child and
/// the formula recomputed for just that slice. Unsliced conditions
/// answer with their overall state regardless of the key.
pub fn query(conditions: &[Condition], index: usize, key: &DimensionKey) -> ConditionState {
    match &conditions[index].kind {
        ConditionKind::Simple(simple) => {
            if simple.is_sliced() {
                simple.slice_state(key)
            } else {
                conditions[index].state
            }
        }
        ConditionKind::Combination(combo) => {
            let mut states = combo
                .children
                .iter()
                .map(|&child| query(conditions, child, key));
            match combo.operation {
                crate::matcher::LogicalOperation::And => {
                    states.fold(ConditionState::True, ConditionState::and)
                }
                crate::matcher::LogicalOperation::Or => {
                    states.fold(ConditionState::False, ConditionState::or)
                }
                crate::matcher::LogicalOperation::Not => {
                    states.next().unwrap_or(ConditionState::Unknown).negate()
                }
            }
        }
    }
}

/// Slices that flipped to true during the last evaluation.
pub fn changed_to_true(conditions: &[Condition], index: usize) -> Vec<DimensionKey> {
    let mut out = Vec::new();
    collect_deltas(conditions, index, true, &mut out);
    out
}

/// Slices that flipped to false during the last evaluation.
pub fn changed_to_false(conditions: &[Condition], index: usize) -> Vec<DimensionKey> {
    let mut out = Vec::new();
    collect_deltas(conditions, index, false, &mut out);
    out
}

fn collect_deltas(conditions: &[Condition], index: usize, to_true: bool, out: &mut Vec<DimensionKey>) {
    match &conditions[index].kind {
        ConditionKind::Simple(simple) => {
            let deltas = if to_true {
                simple.changed_to_true()
            } else {
                simple.changed_to_false()
            };
            for key in deltas {
                if !out.contains(key) {
                    out.push(key.clone());
                }
            }
        }
        ConditionKind::Combination(combo) => {
            for &child in &combo.children {
                collect_deltas(conditions, child, to_true, out);
            }
        }
    }
}

/// True when the condition's sliced output dimensions are exactly the
/// given link target fields. When this holds for a metric's single
/// condition link, its delta sets address the metric's trackers
/// directly (the fan-out optimization).
pub fn equal_output_dimensions(
    conditions: &[Condition],
    index: usize,
    link_fields: &[FieldPath],
) -> bool {
    match &conditions[index].kind {
        ConditionKind::Simple(simple) => {
            simple.is_sliced()
                && simple.dimensions.len() == link_fields.len()
                && simple
                    .dimensions
                    .iter()
                    .zip(link_fields.iter())
                    .all(|(a, b)| a.without_flags().collapsed() == b.without_flags().collapsed())
        }
        ConditionKind::Combination(combo) => {
            // Only meaningful when exactly one child is sliced.
            let sliced: Vec<usize> = combo
                .children
                .iter()
                .copied()
                .filter(|&child| conditions[child].is_sliced(conditions))
                .collect();
            sliced.len() == 1 && equal_output_dimensions(conditions, sliced[0], link_fields)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{evaluate_condition, CombinationCondition, SimpleCondition};
    use crate::core::types::Event;
    use crate::dimension::filter_values;
    use crate::matcher::{LogicalOperation, MatchingState};

    fn sliced_by_uid(start: usize, stop: usize) -> Condition {
        Condition {
            id: 1,
            state: ConditionState::False,
            kind: ConditionKind::Simple(SimpleCondition::new(
                Some(start),
                Some(stop),
                None,
                true,
                ConditionState::False,
                vec![FieldPath::leaf(9, 1)],
            )),
        }
    }

    fn feed(conditions: &mut [Condition], event: &Event, matched: usize, total: usize) {
        let mut matcher_cache = vec![MatchingState::NotMatched; total];
        matcher_cache[matched] = MatchingState::Matched;
        let mut condition_cache = vec![ConditionState::NotEvaluated; conditions.len()];
        let mut changed_cache = vec![false; conditions.len()];
        for i in 0..conditions.len() {
            evaluate_condition(i, conditions, event, &matcher_cache, &mut condition_cache, &mut changed_cache);
        }
    }

    #[test]
    fn test_query_per_slice() {
        let mut conditions = vec![sliced_by_uid(0, 1)];
        let uid7 = Event::builder(9).int_field(1, 7).build();
        feed(&mut conditions, &uid7, 0, 2);

        let key7 = filter_values(&[FieldPath::leaf(9, 1)], &uid7.values);
        let key8 = filter_values(
            &[FieldPath::leaf(9, 1)],
            &Event::builder(9).int_field(1, 8).build().values,
        );
        assert_eq!(query(&conditions, 0, &key7), ConditionState::True);
        assert_eq!(query(&conditions, 0, &key8), ConditionState::False);
    }

    #[test]
    fn test_combination_query_substitutes_key() {
        // NOT over a sliced condition: key true below means false above.
        let mut conditions = vec![
            sliced_by_uid(0, 1),
            Condition {
                id: 2,
                state: ConditionState::Unknown,
                kind: ConditionKind::Combination(CombinationCondition {
                    operation: LogicalOperation::Not,
                    children: vec![0],
                }),
            },
        ];
        let uid7 = Event::builder(9).int_field(1, 7).build();
        feed(&mut conditions, &uid7, 0, 2);

        let key7 = filter_values(&[FieldPath::leaf(9, 1)], &uid7.values);
        assert_eq!(query(&conditions, 1, &key7), ConditionState::False);
    }

    #[test]
    fn test_delta_sets_surface_through_combination() {
        let mut conditions = vec![
            sliced_by_uid(0, 1),
            Condition {
                id: 2,
                state: ConditionState::Unknown,
                kind: ConditionKind::Combination(CombinationCondition {
                    operation: LogicalOperation::Or,
                    children: vec![0],
                }),
            },
        ];
        let uid7 = Event::builder(9).int_field(1, 7).build();
        feed(&mut conditions, &uid7, 0, 2);

        let deltas = changed_to_true(&conditions, 1);
        let key7 = filter_values(&[FieldPath::leaf(9, 1)], &uid7.values);
        assert_eq!(deltas, vec![key7]);
        assert!(changed_to_false(&conditions, 1).is_empty());
    }

    #[test]
    fn test_equal_output_dimensions() {
        let conditions = vec![sliced_by_uid(0, 1)];
        assert!(equal_output_dimensions(&conditions, 0, &[FieldPath::leaf(9, 1)]));
        assert!(!equal_output_dimensions(&conditions, 0, &[FieldPath::leaf(9, 2)]));
        assert!(!equal_output_dimensions(
            &conditions,
            0,
            &[FieldPath::leaf(9, 1), FieldPath::leaf(9, 2)]
        ));
    }
}
