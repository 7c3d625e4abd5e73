//! Immutable sequence payload.
//!
//! Tuples are overwhelmingly short (argument packs, dict items, key pairs),
//! so elements stay inline up to three entries.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::value::Value;

/// A guest tuple. Elements are owned references.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Tuple(SmallVec<[Value; 3]>);

impl Tuple {
    #[must_use]
    pub fn new(elements: Vec<Value>) -> Self {
        Self(SmallVec::from_vec(elements))
    }

    #[must_use]
    pub fn elements(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Transfers the elements out (for teardown and conversions).
    #[must_use]
    pub fn into_elements(self) -> SmallVec<[Value; 3]> {
        self.0
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.0.capacity() * size_of::<Value>()
    }
}
