//! Mutable sequence payload.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A guest list. Elements are owned references.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct List(Vec<Value>);

impl List {
    #[must_use]
    pub fn new(elements: Vec<Value>) -> Self {
        Self(elements)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    #[must_use]
    pub fn elements(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn elements_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.0.push(value);
    }

    #[must_use]
    pub fn into_elements(self) -> Vec<Value> {
        self.0
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.0.capacity() * size_of::<Value>()
    }
}
