//! Event sampling: probabilistic gates and dimensional sharding.
//!
//! Two orthogonal mechanisms gate events before they reach bucket
//! update logic:
//!
//! - **Probabilistic sampling**: a seeded RNG roll against a
//!   `sampling_percentage` in `[1, 100]`. The engine uses
//!   [`rand::rngs::StdRng`]; fixing the configuration's sampling seed
//!   makes decisions reproducible.
//! - **Dimensional sampling**: a stable 64-bit FxHash over the values
//!   of one field, combined with a process-wide shard offset. The same
//!   dimension is consistently present or absent across all metrics,
//!   independent of event order.

use crate::core::types::{FieldPath, FieldValue};
use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Process-wide shard offset for dimensional sampling.
static SHARD_OFFSET: OnceLock<i32> = OnceLock::new();

/// Set the process-wide shard offset. The first call wins; later calls
/// are ignored and return false.
pub fn set_shard_offset(offset: i32) -> bool {
    SHARD_OFFSET.set(offset).is_ok()
}

/// The process-wide shard offset, zero until set.
pub fn shard_offset() -> i32 {
    SHARD_OFFSET.get().copied().unwrap_or(0)
}

/// Stable 64-bit hash over a sequence of field-values.
///
/// FxHash is not cryptographic but is deterministic for a given build,
/// which is what consistent shard membership needs.
pub fn dimension_hash(values: &[FieldValue]) -> u64 {
    let mut hasher = FxHasher::default();
    for fv in values {
        fv.hash(&mut hasher);
    }
    hasher.finish()
}

/// Probabilistic retention roll.
///
/// Percentages outside `[1, 100]` are validated away at build time;
/// 100 always keeps.
#[inline]
pub fn roll_percentage(rng: &mut StdRng, percentage: u8) -> bool {
    rng.gen_range(0u32..100) < u32::from(percentage)
}

/// Dimensional sharding: keep an event iff its sampled field's hash,
/// offset by the process-wide shard offset, lands on shard zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionalSampler {
    /// Field whose values shard the dimension space.
    pub sampled_field: FieldPath,
    /// Number of shards.
    pub shard_count: u32,
}

impl DimensionalSampler {
    /// Decide retention for an event's values.
    ///
    /// Events missing the sampled field are kept: sampling partitions
    /// dimensions, and an event with no dimension value has nothing to
    /// partition on.
    pub fn keep(&self, values: &[FieldValue]) -> bool {
        let Some(fv) = crate::dimension::extract_value(&self.sampled_field, values) else {
            return true;
        };
        let hash = dimension_hash(std::slice::from_ref(&fv));
        let shifted = hash.wrapping_add(shard_offset() as i64 as u64);
        shifted % u64::from(self.shard_count) == 0
    }
}
