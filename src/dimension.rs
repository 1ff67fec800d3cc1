//! Dimension keys and field extraction.
//!
//! A dimension key is an ordered sequence of field-values used as a map
//! key; hashing is structural over the sequence and equality is
//! value-wise including the field path. Metrics key their buckets on a
//! [`MetricKey`]: the pair of a what-key (from `dimensions_in_what`) and
//! a state-values-key (from the sliced state atoms).
//!
//! Extraction collapses FIRST/LAST/ALL positions so that keys derived
//! from different positions of the same logical field map to one
//! dimension.

use crate::core::types::{FieldPath, FieldValue, Position};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered sequence of field-values used as a map key.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DimensionKey(Vec<FieldValue>);

impl DimensionKey {
    /// Key over the given values.
    pub fn new(values: Vec<FieldValue>) -> Self {
        DimensionKey(values)
    }

    /// The empty key, used by unsliced trackers.
    pub fn empty() -> Self {
        DimensionKey(Vec::new())
    }

    /// The field-values making up this key.
    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }

    /// True when the key carries no values.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one value.
    pub fn push(&mut self, value: FieldValue) {
        self.0.push(value);
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, fv) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", fv)?;
        }
        write!(f, "}}")
    }
}

/// The pair of keys a metric partitions its buckets on.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MetricKey {
    /// Key drawn from the metric's `dimensions_in_what`.
    pub what: DimensionKey,
    /// Key drawn from the sliced state atoms.
    pub state_values: DimensionKey,
}

impl MetricKey {
    /// Key with no state values.
    pub fn what_only(what: DimensionKey) -> Self {
        MetricKey {
            what,
            state_values: DimensionKey::empty(),
        }
    }

    /// True when a state-values key is present.
    pub fn has_state_values(&self) -> bool {
        !self.state_values.is_empty()
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_state_values() {
            write!(f, "{}|{}", self.what, self.state_values)
        } else {
            write!(f, "{}", self.what)
        }
    }
}

/// What a field link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkTarget {
    /// Link into a predicate's dimensions.
    Condition {
        /// Target predicate id.
        predicate_id: i64,
    },
    /// Link into a state atom's primary fields.
    State {
        /// Target state atom id.
        state_atom_id: u32,
    },
}

/// Maps fields of a metric's "what" atom to fields of a condition or a
/// state atom, so that dimension keys derived from either side align.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLink {
    /// Which side the link targets.
    pub target: LinkTarget,
    /// Fields extracted from the matched event.
    pub fields_in_what: Vec<FieldPath>,
    /// Corresponding fields on the target side, same length and order.
    pub fields_in_target: Vec<FieldPath>,
}

/// Extract the single value a non-ALL spec selects, with its position
/// collapsed. Returns `None` when the event has no such field.
pub fn extract_value(spec: &FieldPath, values: &[FieldValue]) -> Option<FieldValue> {
    let mut found: Option<&FieldValue> = None;
    for fv in values {
        if !spec.same_field(&fv.path) {
            continue;
        }
        match spec.position() {
            Position::First => {
                found = Some(fv);
                break;
            }
            // Last occurrence wins; keep scanning.
            _ => found = Some(fv),
        }
    }
    found.map(|fv| FieldValue::new(fv.path.collapsed().without_flags(), fv.value.clone()))
}

/// Build a dimension key by running each spec over the event values.
///
/// FIRST/LAST select one occurrence, ALL expands over every occurrence;
/// positions in the output are collapsed. Specs that match nothing
/// contribute nothing: a partially-populated key is still a valid key.
pub fn filter_values(specs: &[FieldPath], values: &[FieldValue]) -> DimensionKey {
    let mut key = DimensionKey::empty();
    for spec in specs {
        match spec.position() {
            Position::All => {
                for fv in values {
                    if spec.same_field(&fv.path) {
                        key.push(FieldValue::new(
                            fv.path.collapsed().without_flags(),
                            fv.value.clone(),
                        ));
                    }
                }
            }
            _ => {
                if let Some(fv) = extract_value(spec, values) {
                    key.push(fv);
                }
            }
        }
    }
    key
}

/// Build the key that addresses the link's target from a matched event.
///
/// Values are extracted via `fields_in_what` and re-addressed to the
/// corresponding `fields_in_target` path, so the result compares equal
/// to keys the target derived from its own events.
pub fn link_key(link: &FieldLink, values: &[FieldValue]) -> DimensionKey {
    let mut key = DimensionKey::empty();
    for (what, target) in link.fields_in_what.iter().zip(link.fields_in_target.iter()) {
        if let Some(fv) = extract_value(what, values) {
            key.push(FieldValue::new(target.without_flags().collapsed(), fv.value));
        }
    }
    key
}

/// Build a link key from an already-extracted what-key instead of raw
/// event values. Used when only the tracker key is still available.
pub fn link_key_from_dimension(link: &FieldLink, what_key: &DimensionKey) -> DimensionKey {
    link_key(link, what_key.values())
}

/// True when any spec uses position ANY, which is illegal in dimension
/// derivation (but legal in matcher predicates).
pub fn contains_any_position(specs: &[FieldPath]) -> bool {
    specs.iter().any(|spec| spec.any)
}
