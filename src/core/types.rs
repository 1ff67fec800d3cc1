//! Core event (atom) model: field paths, typed values, and events.
//!
//! Everything that flows through the engine is an [`Event`]: a tagged,
//! immutable record with an ordered list of typed field-values. Field
//! paths are the sole mechanism for addressing a sub-field inside an
//! atom; dimension keys, matcher predicates, and link specifications all
//! speak in terms of [`FieldPath`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Maximum nesting depth of a field path.
pub const MAX_FIELD_DEPTH: usize = 5;

/// Position byte value marking a collapsed position.
///
/// When a dimension key is derived from the FIRST/LAST/ALL position of a
/// repeated field, the concrete position is replaced by this marker so
/// that keys derived from different positions of the same logical field
/// compare equal.
pub const POSITION_COLLAPSED: u8 = 0x80;

/// How a path selects among repeated occurrences of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// First occurrence in event order.
    First,
    /// Last occurrence in event order.
    Last,
    /// Every occurrence.
    All,
    /// Any occurrence (matcher predicates only; illegal in dimensions).
    Any,
}

/// Address of a (sub-)field inside an atom.
///
/// `positions[d]` is the 1-based index of the repeated container at
/// depth `d` (0 when the level is not repeated). Event field-values
/// carry concrete positions; extraction specs carry the `last`/`all`/
/// `any` flags instead (no flag means FIRST).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FieldPath {
    /// Atom type this path belongs to.
    pub atom_tag: u32,
    /// Nesting depth below the atom root (0 = top-level field).
    #[serde(default)]
    pub depth: u8,
    /// Position per depth, 1-based; 0 for non-repeated levels.
    #[serde(default)]
    pub positions: [u8; MAX_FIELD_DEPTH],
    /// Leaf field number.
    pub field_number: u32,
    /// Select the last occurrence of a repeated field.
    #[serde(default)]
    pub last: bool,
    /// Select all occurrences of a repeated field.
    #[serde(default)]
    pub all: bool,
    /// Match any occurrence (predicates only).
    #[serde(default)]
    pub any: bool,
}

impl FieldPath {
    /// Path to a top-level scalar field.
    pub fn leaf(atom_tag: u32, field_number: u32) -> Self {
        FieldPath {
            atom_tag,
            field_number,
            ..Default::default()
        }
    }

    /// Path to one occurrence of a repeated field, one level deep.
    pub fn repeated(atom_tag: u32, field_number: u32, position: u8) -> Self {
        let mut positions = [0u8; MAX_FIELD_DEPTH];
        positions[0] = position;
        FieldPath {
            atom_tag,
            depth: 1,
            positions,
            field_number,
            ..Default::default()
        }
    }

    /// Turn this path into an extraction spec with the given position.
    pub fn with_position(mut self, position: Position) -> Self {
        self.last = false;
        self.all = false;
        self.any = false;
        match position {
            Position::First => {}
            Position::Last => self.last = true,
            Position::All => self.all = true,
            Position::Any => self.any = true,
        }
        self
    }

    /// The position selector encoded in this path's flag bits.
    pub fn position(&self) -> Position {
        if self.any {
            Position::Any
        } else if self.all {
            Position::All
        } else if self.last {
            Position::Last
        } else {
            Position::First
        }
    }

    /// True when both paths address the same logical field, ignoring
    /// concrete positions and position flags.
    pub fn same_field(&self, other: &FieldPath) -> bool {
        self.atom_tag == other.atom_tag
            && self.depth == other.depth
            && self.field_number == other.field_number
    }

    /// Replace the deepest concrete position with [`POSITION_COLLAPSED`].
    ///
    /// Keys derived from different positions of one logical field must
    /// collapse to a single dimension.
    pub fn collapse_position(&mut self) {
        if self.depth > 0 {
            self.positions[self.depth as usize - 1] = POSITION_COLLAPSED;
        }
    }

    /// Consuming variant of [`collapse_position`](Self::collapse_position).
    pub fn collapsed(mut self) -> Self {
        self.collapse_position();
        self
    }

    /// Strip position flags, producing a concrete path shape.
    pub fn without_flags(mut self) -> Self {
        self.last = false;
        self.all = false;
        self.any = false;
        self
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.atom_tag)?;
        for d in 0..self.depth as usize {
            write!(f, "[{}]", self.positions[d])?;
        }
        write!(f, "#{}", self.field_number)
    }
}

/// Typed payload of a field-value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Widen to `i64` when the payload is integral.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Widen to `f64` when the payload is numeric.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Long(_) => 1,
            Value::Float(_) => 2,
            Value::Double(_) => 3,
            Value::Str(_) => 4,
            Value::Bool(_) => 5,
            Value::Bytes(_) => 6,
        }
    }
}

// Values are map keys (dimension keys hash structurally), so equality and
// hashing must be total. Floats compare and hash by bit pattern.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.discriminant());
        match self {
            Value::Int(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Bool(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.discriminant().cmp(&other.discriminant()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// A typed payload at a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldValue {
    /// Where this value sits inside the atom.
    pub path: FieldPath,
    /// The payload.
    pub value: Value,
}

impl FieldValue {
    /// Construct a field-value.
    pub fn new(path: FieldPath, value: Value) -> Self {
        FieldValue { path, value }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.path, self.value)
    }
}

/// A structured event (atom): the unit of ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Atom type.
    pub tag_id: u32,
    /// Source uid.
    pub uid: i32,
    /// Elapsed-realtime timestamp in nanoseconds.
    pub elapsed_ns: i64,
    /// Ordered, typed field-values.
    pub values: Vec<FieldValue>,
}

impl Event {
    /// Start building an event of the given atom type.
    pub fn builder(tag_id: u32) -> EventBuilder {
        EventBuilder {
            tag_id,
            uid: 0,
            elapsed_ns: 0,
            values: Vec::new(),
        }
    }

    /// Convenience lookup of a top-level field's value.
    pub fn field(&self, field_number: u32) -> Option<&Value> {
        self.values
            .iter()
            .find(|fv| fv.path.depth == 0 && fv.path.field_number == field_number)
            .map(|fv| &fv.value)
    }
}

/// Builder for [`Event`], used heavily by tests and pull adapters.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    tag_id: u32,
    uid: i32,
    elapsed_ns: i64,
    values: Vec<FieldValue>,
}

impl EventBuilder {
    /// Set the source uid.
    pub fn uid(mut self, uid: i32) -> Self {
        self.uid = uid;
        self
    }

    /// Set the elapsed-realtime timestamp.
    pub fn at(mut self, elapsed_ns: i64) -> Self {
        self.elapsed_ns = elapsed_ns;
        self
    }

    /// Append a top-level int field.
    pub fn int_field(self, field_number: u32, value: i32) -> Self {
        let path = FieldPath::leaf(self.tag_id, field_number);
        self.field_value(path, Value::Int(value))
    }

    /// Append a top-level long field.
    pub fn long_field(self, field_number: u32, value: i64) -> Self {
        let path = FieldPath::leaf(self.tag_id, field_number);
        self.field_value(path, Value::Long(value))
    }

    /// Append a top-level double field.
    pub fn double_field(self, field_number: u32, value: f64) -> Self {
        let path = FieldPath::leaf(self.tag_id, field_number);
        self.field_value(path, Value::Double(value))
    }

    /// Append a top-level string field.
    pub fn string_field(self, field_number: u32, value: impl Into<String>) -> Self {
        let path = FieldPath::leaf(self.tag_id, field_number);
        self.field_value(path, Value::Str(value.into()))
    }

    /// Append a top-level bool field.
    pub fn bool_field(self, field_number: u32, value: bool) -> Self {
        let path = FieldPath::leaf(self.tag_id, field_number);
        self.field_value(path, Value::Bool(value))
    }

    /// Append one occurrence of a repeated int field.
    pub fn repeated_int_field(self, field_number: u32, position: u8, value: i32) -> Self {
        let path = FieldPath::repeated(self.tag_id, field_number, position);
        self.field_value(path, Value::Int(value))
    }

    /// Append an arbitrary field-value.
    pub fn field_value(mut self, path: FieldPath, value: Value) -> Self {
        self.values.push(FieldValue::new(path, value));
        self
    }

    /// Finish building.
    pub fn build(self) -> Event {
        Event {
            tag_id: self.tag_id,
            uid: self.uid,
            elapsed_ns: self.elapsed_ns,
            values: self.values,
        }
    }
}
