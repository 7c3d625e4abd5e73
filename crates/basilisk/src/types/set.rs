//! Set payload (used for both `set` and `frozenset`).
//!
//! Elements keep insertion order in a dense vector; a hash table maps element
//! hashes to positions. Iteration order is therefore stable across runs
//! without exposing hash order, which the determinism guarantee requires.

use hashbrown::HashTable;
use serde::{Deserialize, Serialize};

use crate::{heap::Heap, intern::Interns, resource::ResourceTracker, value::Value};

#[derive(Debug, Serialize, Deserialize)]
struct SetEntry {
    hash: u64,
    value: Value,
}

/// A guest set. Elements are owned references.
#[derive(Debug, Default)]
pub(crate) struct Set {
    index: HashTable<usize>,
    entries: Vec<SetEntry>,
}

impl Set {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, value: &Value, hash: u64, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<usize> {
        self.index
            .find(hash, |&i| {
                self.entries[i].hash == hash && Value::keys_equal(&self.entries[i].value, value, heap, interns)
            })
            .copied()
    }

    /// Whether the set contains `value`.
    #[must_use]
    pub fn contains(&self, value: &Value, hash: u64, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
        self.find(value, hash, heap, interns).is_some()
    }

    /// Adds an element, taking ownership. Returns the incoming value for the
    /// caller to drop when it was already present.
    pub fn add(
        &mut self,
        value: Value,
        hash: u64,
        heap: &Heap<impl ResourceTracker>,
        interns: &Interns,
    ) -> Option<Value> {
        if self.find(&value, hash, heap, interns).is_some() {
            return Some(value);
        }
        let slot = self.entries.len();
        self.entries.push(SetEntry { hash, value });
        self.index.insert_unique(hash, slot, |&i| self.entries[i].hash);
        None
    }

    /// Removes an element, returning it when present.
    pub fn remove(
        &mut self,
        value: &Value,
        hash: u64,
        heap: &Heap<impl ResourceTracker>,
        interns: &Interns,
    ) -> Option<Value> {
        let i = self.find(value, hash, heap, interns)?;
        let entry = self.entries.remove(i);
        self.rebuild_index();
        Some(entry.value)
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.index.insert_unique(entry.hash, i, |&j| self.entries[j].hash);
        }
    }

    /// Element at insertion position `index`.
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.entries.get(index).map(|e| &e.value)
    }

    /// Iterates elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|e| &e.value)
    }

    /// Iterates `(hash, element)` pairs, for clones and unions.
    pub(crate) fn raw_iter(&self) -> impl Iterator<Item = (u64, &Value)> {
        self.entries.iter().map(|e| (e.hash, &e.value))
    }

    /// Takes all elements out for teardown, leaving the set empty.
    pub fn drain_values(&mut self) -> Vec<Value> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_iter().map(|e| e.value).collect()
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.entries.capacity() * size_of::<SetEntry>()
    }
}

impl Serialize for Set {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Set {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<SetEntry>::deserialize(deserializer)?;
        let mut set = Self {
            index: HashTable::with_capacity(entries.len()),
            entries,
        };
        set.rebuild_index();
        Ok(set)
    }
}
