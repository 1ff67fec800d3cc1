//! Atom matcher layer.
//!
//! Matchers filter and transform incoming events. A simple matcher
//! holds an atom-id filter plus optional field-value predicates and may
//! rewrite fields to produce a transformed event; a combination matcher
//! is a logical expression over earlier matchers. The dispatcher
//! memoizes results in a per-event cache so each matcher is computed at
//! most once per event.

use crate::core::types::{Event, FieldPath, FieldValue, Position, Value};
use serde::{Deserialize, Serialize};

/// Per-event memoized matcher result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchingState {
    /// Not evaluated yet for this event.
    #[default]
    NotComputed,
    /// The matcher matched.
    Matched,
    /// The matcher did not match.
    NotMatched,
}

impl MatchingState {
    /// True when the state is [`MatchingState::Matched`].
    pub fn is_matched(self) -> bool {
        self == MatchingState::Matched
    }
}

/// Logical operation of a combination matcher or predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperation {
    /// All inputs must hold; short-circuits on the first miss.
    And,
    /// At least one input must hold; short-circuits on the first hit.
    Or,
    /// Negates its single input.
    Not,
}

/// Comparison applied to the payload at a field path.
///
/// Numeric order comparisons widen integral payloads via
/// [`Value::as_long`]; a payload that does not widen never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueComparison {
    /// Payload equals the literal.
    Equals(Value),
    /// Integral payload strictly below the bound.
    LessThan(i64),
    /// Integral payload strictly above the bound.
    GreaterThan(i64),
    /// Integral payload within `[low, high]`, both inclusive.
    InRange {
        /// Inclusive lower bound.
        low: i64,
        /// Inclusive upper bound.
        high: i64,
    },
    /// Payload equals the payload at another field path of the same event.
    EqualsField(FieldPath),
}

/// One field predicate of a simple matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    /// Field the predicate inspects; the position flags decide which
    /// occurrences of a repeated field must satisfy it (ANY is legal
    /// here, unlike in dimension derivation).
    pub field: FieldPath,
    /// The comparison.
    pub comparison: ValueComparison,
}

/// A field rewrite producing a transformed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    /// Field to rewrite; every occurrence is affected.
    pub field: FieldPath,
    /// Constant that replaces the original payload.
    pub replacement: Value,
}

/// Matcher over a single atom id.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleMatcher {
    /// Atom id this matcher fires on.
    pub atom_id: u32,
    /// Field predicates, all of which must hold.
    pub field_matchers: Vec<FieldValueMatcher>,
    /// Field rewrites applied when the matcher matches.
    pub transforms: Vec<FieldTransform>,
}

/// Logical expression over earlier matcher indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinationMatcher {
    /// AND / OR / NOT.
    pub operation: LogicalOperation,
    /// Input matcher indices, all strictly smaller than this matcher's.
    pub children: Vec<usize>,
}

/// A compiled matcher with its configuration id.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomMatcher {
    /// Configuration id of this matcher.
    pub id: i64,
    /// The matcher body.
    pub kind: MatcherKind,
}

/// Matcher variants.
#[derive(Debug, Clone, PartialEq)]
pub enum MatcherKind {
    /// Single-atom filter.
    Simple(SimpleMatcher),
    /// Logical expression over other matchers.
    Combination(CombinationMatcher),
}

impl AtomMatcher {
    /// Collect the atom ids this matcher can fire on.
    pub fn atom_ids(&self, all: &[AtomMatcher]) -> Vec<u32> {
        match &self.kind {
            MatcherKind::Simple(simple) => vec![simple.atom_id],
            MatcherKind::Combination(combo) => {
                let mut ids = Vec::new();
                for &child in &combo.children {
                    for id in all[child].atom_ids(all) {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                ids
            }
        }
    }
}

impl SimpleMatcher {
    /// The event matches iff its atom id equals ours and every field
    /// predicate holds.
    pub fn matches(&self, event: &Event) -> bool {
        if event.tag_id != self.atom_id {
            return false;
        }
        self.field_matchers.iter().all(|fm| field_predicate_holds(fm, &event.values))
    }

    /// Produce a copy of the event with designated fields rewritten, or
    /// `None` when this matcher specifies no transformation.
    pub fn transform(&self, event: &Event) -> Option<Event> {
        if self.transforms.is_empty() {
            return None;
        }
        let mut transformed = event.clone();
        for transform in &self.transforms {
            for fv in &mut transformed.values {
                if transform.field.same_field(&fv.path) {
                    fv.value = transform.replacement.clone();
                }
            }
        }
        Some(transformed)
    }
}

fn comparison_holds(comparison: &ValueComparison, value: &Value, values: &[FieldValue]) -> bool {
    match comparison {
        ValueComparison::Equals(literal) => value == literal,
        ValueComparison::LessThan(bound) => value.as_long().is_some_and(|v| v < *bound),
        ValueComparison::GreaterThan(bound) => value.as_long().is_some_and(|v| v > *bound),
        ValueComparison::InRange { low, high } => {
            value.as_long().is_some_and(|v| v >= *low && v <= *high)
        }
        ValueComparison::EqualsField(other_path) => {
            crate::dimension::extract_value(other_path, values)
                .is_some_and(|other| other.value == *value)
        }
    }
}

fn field_predicate_holds(fm: &FieldValueMatcher, values: &[FieldValue]) -> bool {
    let candidates: Vec<&FieldValue> =
        values.iter().filter(|fv| fm.field.same_field(&fv.path)).collect();
    if candidates.is_empty() {
        return false;
    }
    match fm.field.position() {
        Position::Any => {
            candidates.iter().any(|fv| comparison_holds(&fm.comparison, &fv.value, values))
        }
        Position::All => {
            candidates.iter().all(|fv| comparison_holds(&fm.comparison, &fv.value, values))
        }
        Position::First => comparison_holds(&fm.comparison, &candidates[0].value, values),
        Position::Last => {
            comparison_holds(&fm.comparison, &candidates[candidates.len() - 1].value, values)
        }
    }
}

/// Evaluate one matcher against an event, memoizing into `cache` and
/// recording any transformed event into `transforms`.
///
/// Combination inputs are evaluated recursively; already-computed slots
/// are reused, so each matcher is computed at most once per event.
pub fn evaluate_matcher(
    index: usize,
    matchers: &[AtomMatcher],
    event: &Event,
    cache: &mut [MatchingState],
    transforms: &mut [Option<Event>],
) {
    if cache[index] != MatchingState::NotComputed {
        return;
    }
    let state = match &matchers[index].kind {
        MatcherKind::Simple(simple) => {
            if simple.matches(event) {
                transforms[index] = simple.transform(event);
                MatchingState::Matched
            } else {
                MatchingState::NotMatched
            }
        }
        MatcherKind::Combination(combo) => {
            evaluate_combination(combo, matchers, event, cache, transforms)
        }
    };
    cache[index] = state;
}

fn evaluate_combination(
    combo: &CombinationMatcher,
    matchers: &[AtomMatcher],
    event: &Event,
    cache: &mut [MatchingState],
    transforms: &mut [Option<Event>],
) -> MatchingState {
    match combo.operation {
        LogicalOperation::And => {
            for &child in &combo.children {
                evaluate_matcher(child, matchers, event, cache, transforms);
                if cache[child] == MatchingState::NotMatched {
                    return MatchingState::NotMatched;
                }
            }
            MatchingState::Matched
        }
        LogicalOperation::Or => {
            for &child in &combo.children {
                evaluate_matcher(child, matchers, event, cache, transforms);
                if cache[child] == MatchingState::Matched {
                    return MatchingState::Matched;
                }
            }
            MatchingState::NotMatched
        }
        LogicalOperation::Not => {
            let child = combo.children[0];
            evaluate_matcher(child, matchers, event, cache, transforms);
            if cache[child] == MatchingState::Matched {
                MatchingState::NotMatched
            } else {
                MatchingState::Matched
            }
        }
    }
}
