//! Insertion-ordered mapping payload.
//!
//! Storage follows the split design of modern guest dicts: a dense entry
//! vector preserves insertion order while a hash table maps key hashes to
//! entry indices. Key hashes are computed by the caller (the VM owns hashing
//! because instance keys may cache guest-computed hashes); entries remember
//! their hash so lookups and rebuilds never re-hash.
//!
//! Removal keeps order by shifting entries and rebuilding the index table;
//! dict mutation is far rarer than lookup in real scripts, so the rebuild
//! cost sits on the right side.

use hashbrown::HashTable;
use serde::{Deserialize, Serialize};

use crate::{
    heap::Heap,
    intern::Interns,
    resource::ResourceTracker,
    value::Value,
};

#[derive(Debug, Serialize, Deserialize)]
struct DictEntry {
    hash: u64,
    key: Value,
    value: Value,
}

/// A guest dict. Keys and values are owned references.
#[derive(Debug, Default)]
pub(crate) struct Dict {
    index: HashTable<usize>,
    entries: Vec<DictEntry>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashTable::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the entry matching `key`, if present.
    fn find(&self, key: &Value, hash: u64, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<usize> {
        self.index
            .find(hash, |&i| {
                self.entries[i].hash == hash && Value::keys_equal(&self.entries[i].key, key, heap, interns)
            })
            .copied()
    }

    /// Looks up a value by key.
    #[must_use]
    pub fn get(&self, key: &Value, hash: u64, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<&Value> {
        self.find(key, hash, heap, interns).map(|i| &self.entries[i].value)
    }

    /// Inserts or replaces, taking ownership of `key` and `value`.
    ///
    /// When the key already exists the stored key is kept (first-insertion
    /// identity, matching guest semantics) and the incoming key reference is
    /// dropped; the previous value is returned for the caller to drop.
    pub fn insert(
        &mut self,
        key: Value,
        hash: u64,
        value: Value,
        heap: &mut Heap<impl ResourceTracker>,
        interns: &Interns,
    ) -> Option<Value> {
        if let Some(i) = self.find(&key, hash, heap, interns) {
            key.drop_with_heap(heap);
            let old = std::mem::replace(&mut self.entries[i].value, value);
            return Some(old);
        }
        let slot = self.entries.len();
        self.entries.push(DictEntry { hash, key, value });
        self.index.insert_unique(hash, slot, |&i| self.entries[i].hash);
        None
    }

    /// Removes an entry, returning its value. The stored key is dropped.
    pub fn remove(
        &mut self,
        key: &Value,
        hash: u64,
        heap: &mut Heap<impl ResourceTracker>,
        interns: &Interns,
    ) -> Option<Value> {
        let i = self.find(key, hash, heap, interns)?;
        let entry = self.entries.remove(i);
        entry.key.drop_with_heap(heap);
        self.rebuild_index();
        Some(entry.value)
    }

    /// Removes and returns the most recently inserted pair.
    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        let entry = self.entries.pop()?;
        self.rebuild_index();
        Some((entry.key, entry.value))
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.index.insert_unique(entry.hash, i, |&j| self.entries[j].hash);
        }
    }

    /// Entry pair at insertion position `index`.
    #[must_use]
    pub fn pair_at(&self, index: usize) -> Option<(&Value, &Value)> {
        self.entries.get(index).map(|e| (&e.key, &e.value))
    }

    /// Iterates pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|e| (&e.key, &e.value))
    }

    /// Iterates `(hash, key, value)` triples, for clones and merges.
    pub(crate) fn raw_iter(&self) -> impl Iterator<Item = (u64, &Value, &Value)> {
        self.entries.iter().map(|e| (e.hash, &e.key, &e.value))
    }

    /// Takes all entries out for teardown, leaving the dict empty.
    pub fn drain_pairs(&mut self) -> Vec<(Value, Value)> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect()
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.entries.capacity() * size_of::<DictEntry>()
    }
}

impl Serialize for Dict {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Dict {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<DictEntry>::deserialize(deserializer)?;
        let mut dict = Self {
            index: HashTable::with_capacity(entries.len()),
            entries,
        };
        dict.rebuild_index();
        Ok(dict)
    }
}
