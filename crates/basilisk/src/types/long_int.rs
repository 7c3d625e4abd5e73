//! Arbitrary-precision integer payload.
//!
//! Machine-word arithmetic promotes silently into `LongInt` on overflow, and
//! `LongInt` results that fit an `i64` demote back on allocation, so guests
//! only ever observe one integer type. Size estimates for pow/shift/multiply
//! are analytic so the accountant can veto oversized results before any limb
//! is allocated.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::{
    heap::{Heap, HeapData},
    exc::RunResult,
    resource::ResourceTracker,
    value::Value,
};

/// A guest integer outside the `i64` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LongInt(BigInt);

impl LongInt {
    #[must_use]
    pub fn new(value: BigInt) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn inner(&self) -> &BigInt {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> BigInt {
        self.0
    }

    /// Payload bytes for the accountant: one byte per 8 bits plus overhead.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        (self.0.bits() as usize) / 8 + size_of::<Self>()
    }

    /// Converts into a value, demoting to an immediate `Int` when it fits.
    pub fn into_value(self, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Value> {
        if let Some(small) = self.0.to_i64() {
            return Ok(Value::Int(small));
        }
        let id = heap.alloc(HeapData::LongInt(self))?;
        Ok(Value::Ref(id))
    }
}

impl From<i64> for LongInt {
    fn from(value: i64) -> Self {
        Self(BigInt::from(value))
    }
}

impl From<BigInt> for LongInt {
    fn from(value: BigInt) -> Self {
        Self(value)
    }
}

/// Projected result size in bytes of `base ** exp` for integer operands.
#[must_use]
pub(crate) fn pow_size_estimate(base_bits: u64, exp: u64) -> usize {
    usize::try_from(base_bits.saturating_mul(exp) / 8 + 16).unwrap_or(usize::MAX)
}

/// Projected result size in bytes of `value << shift`.
#[must_use]
pub(crate) fn shl_size_estimate(bits: u64, shift: u64) -> usize {
    usize::try_from((bits.saturating_add(shift)) / 8 + 16).unwrap_or(usize::MAX)
}

/// Projected result size in bytes of `a * b` for integer operands.
#[must_use]
pub(crate) fn mul_size_estimate(bits_a: u64, bits_b: u64) -> usize {
    usize::try_from(bits_a.saturating_add(bits_b) / 8 + 16).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_estimates_scale_with_operands() {
        // 2**1_000_000 needs ~125KB of digits.
        let est = pow_size_estimate(2, 1_000_000);
        assert!(est > 100_000);
        assert!(shl_size_estimate(64, 8_000_000) > 1_000_000);
        assert!(mul_size_estimate(64, 64) < 100);
    }
}
