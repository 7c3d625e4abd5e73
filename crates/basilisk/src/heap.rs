//! The reference-counted heap arena.
//!
//! Every heap value lives in a slot holding its payload, a strong count, and
//! a unique id. Slots are recycled through a free list; the unique id lets
//! weak observers detect reuse. Reference counting is explicit: creation
//! returns a strong reference, `inc_ref` clones it, `dec_ref` releases it
//! and, on reaching zero, transitively releases children with an explicit
//! work list (never native recursion, so deep structures cannot overflow).
//!
//! Cycles are legal in the guest object model and a pure counted heap leaks
//! them; [`Heap::collect_cycles`] is the on-demand tracing pass, run from
//! the `collect_cycles` builtin and at interpreter teardown — never
//! automatically between instructions.

use std::{cell::Cell, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{
    exc::ExcPayload,
    intern::Interns,
    resource::{ResourceError, ResourceTracker},
    types::{
        Bytes, ClassObject, Closure, Coroutine, Dict, Generator, HashPolicy, Instance, IterState, List, LongInt,
        BoundMethod, Range, Set, Slice, Str, Tuple, Type,
    },
    task::GatherHandle,
    value::{HashAttempt, Value},
    guest_hash,
};

/// Index of a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0
    }

    /// Rebuilds an id from a stored slot index (weak-link resolution).
    #[inline]
    #[must_use]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

/// Payload of one heap slot.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum HeapData {
    Str(Str),
    Bytes(Bytes),
    ByteArray(Bytes),
    LongInt(LongInt),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    Set(Set),
    FrozenSet(Set),
    Range(Range),
    Slice(Slice),
    /// A closure cell; `Value::Undefined` before first assignment.
    Cell(Value),
    Closure(Closure),
    BoundMethod(BoundMethod),
    Class(ClassObject),
    Instance(Instance),
    /// A builtin exception instance (`ValueError("x")`).
    Exception(ExcPayload),
    Generator(Generator),
    Coroutine(Coroutine),
    Iter(IterState),
    Gather(GatherHandle),
    /// Placeholder while a payload is temporarily taken out by
    /// [`Heap::with_entry_mut`]. Never observable between instructions.
    InFlight,
}

impl HeapData {
    /// The builtin type tag.
    #[must_use]
    pub fn type_of(&self) -> Type {
        match self {
            Self::Str(_) => Type::Str,
            Self::Bytes(_) => Type::Bytes,
            Self::ByteArray(_) => Type::ByteArray,
            Self::LongInt(_) => Type::Int,
            Self::Tuple(_) => Type::Tuple,
            Self::List(_) => Type::List,
            Self::Dict(_) => Type::Dict,
            Self::Set(_) => Type::Set,
            Self::FrozenSet(_) => Type::FrozenSet,
            Self::Range(_) => Type::Range,
            Self::Slice(_) => Type::Slice,
            Self::Cell(_) => Type::Cell,
            Self::Closure(_) => Type::Function,
            Self::BoundMethod(_) => Type::Method,
            Self::Class(_) => Type::Type,
            Self::Instance(_) => Type::Object,
            Self::Exception(_) => Type::Exception,
            Self::Generator(_) => Type::Generator,
            Self::Coroutine(_) | Self::Gather(_) => Type::Coroutine,
            Self::Iter(_) => Type::Object,
            Self::InFlight => Type::Object,
        }
    }

    /// Static variant name for heap statistics.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Bytes(_) => "Bytes",
            Self::ByteArray(_) => "ByteArray",
            Self::LongInt(_) => "LongInt",
            Self::Tuple(_) => "Tuple",
            Self::List(_) => "List",
            Self::Dict(_) => "Dict",
            Self::Set(_) => "Set",
            Self::FrozenSet(_) => "FrozenSet",
            Self::Range(_) => "Range",
            Self::Slice(_) => "Slice",
            Self::Cell(_) => "Cell",
            Self::Closure(_) => "Closure",
            Self::BoundMethod(_) => "BoundMethod",
            Self::Class(_) => "Class",
            Self::Instance(_) => "Instance",
            Self::Exception(_) => "Exception",
            Self::Generator(_) => "Generator",
            Self::Coroutine(_) => "Coroutine",
            Self::Iter(_) => "Iter",
            Self::Gather(_) => "Gather",
            Self::InFlight => "InFlight",
        }
    }

    /// Approximate payload bytes for the accountant.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        match self {
            Self::Str(s) => s.estimate_size(),
            Self::Bytes(b) | Self::ByteArray(b) => b.estimate_size(),
            Self::LongInt(li) => li.estimate_size(),
            Self::Tuple(t) => t.estimate_size(),
            Self::List(l) => l.estimate_size(),
            Self::Dict(d) => d.estimate_size(),
            Self::Set(s) | Self::FrozenSet(s) => s.estimate_size(),
            Self::Range(_) | Self::Slice(_) | Self::Cell(_) => size_of::<Self>(),
            Self::Closure(c) => c.estimate_size(),
            Self::BoundMethod(m) => m.estimate_size(),
            Self::Class(c) => c.estimate_size(),
            Self::Instance(i) => i.estimate_size(),
            Self::Exception(_) => size_of::<Self>() + size_of::<ExcPayload>(),
            Self::Generator(g) => g.estimate_size(),
            Self::Coroutine(c) => c.estimate_size(),
            Self::Iter(i) => i.estimate_size(),
            Self::Gather(g) => g.estimate_size(),
            Self::InFlight => 0,
        }
    }

    /// Calls `visit` for every strong heap reference this payload holds.
    pub fn visit_children(&self, visit: &mut dyn FnMut(HeapId)) {
        fn visit_value(v: &Value, visit: &mut dyn FnMut(HeapId)) {
            if let Value::Ref(id) = v {
                visit(*id);
            }
        }
        match self {
            Self::Str(_) | Self::Bytes(_) | Self::ByteArray(_) | Self::LongInt(_) | Self::Range(_) => {}
            Self::Exception(_) | Self::InFlight => {}
            Self::Tuple(t) => t.elements().iter().for_each(|v| visit_value(v, &mut *visit)),
            Self::List(l) => l.elements().iter().for_each(|v| visit_value(v, &mut *visit)),
            Self::Dict(d) => {
                for (k, v) in d.iter() {
                    visit_value(k, &mut *visit);
                    visit_value(v, &mut *visit);
                }
            }
            Self::Set(s) | Self::FrozenSet(s) => s.iter().for_each(|v| visit_value(v, &mut *visit)),
            Self::Slice(s) => {
                visit_value(&s.start, &mut *visit);
                visit_value(&s.stop, &mut *visit);
                visit_value(&s.step, &mut *visit);
            }
            Self::Cell(v) => visit_value(v, &mut *visit),
            Self::Closure(c) => {
                c.defaults.iter().for_each(|v| visit_value(v, &mut *visit));
                c.kw_defaults.iter().for_each(|v| visit_value(v, &mut *visit));
                c.cells.iter().copied().for_each(|id| visit(id));
            }
            Self::BoundMethod(m) => {
                visit_value(&m.callable, &mut *visit);
                visit_value(&m.receiver, &mut *visit);
            }
            Self::Class(c) => {
                for (_, v) in c.namespace_iter() {
                    visit_value(v, &mut *visit);
                }
                c.bases.iter().copied().for_each(|id| visit(id));
                c.mro.iter().copied().for_each(|id| visit(id));
            }
            Self::Instance(i) => {
                visit(i.class_id);
                for (_, v) in i.attrs_iter() {
                    visit_value(v, &mut *visit);
                }
            }
            Self::Generator(g) => {
                if let Some(result) = &g.result {
                    visit_value(result, &mut *visit);
                }
                if let Some(frame) = &g.frame {
                    frame.locals.iter().for_each(|v| visit_value(v, &mut *visit));
                    frame.stack.iter().for_each(|v| visit_value(v, &mut *visit));
                    frame.cells.iter().copied().for_each(|id| visit(id));
                }
            }
            Self::Coroutine(c) => {
                if let Some(frame) = &c.frame {
                    frame.locals.iter().for_each(|v| visit_value(v, &mut *visit));
                    frame.stack.iter().for_each(|v| visit_value(v, &mut *visit));
                    frame.cells.iter().copied().for_each(|id| visit(id));
                }
            }
            Self::Iter(state) => match state {
                IterState::List { list, .. } => visit(*list),
                IterState::Tuple { tuple, .. } => visit(*tuple),
                IterState::Str { source, .. } | IterState::Bytes { source, .. } => visit_value(source, &mut *visit),
                IterState::Range { .. } => {}
                IterState::DictKeys { dict, .. }
                | IterState::DictValues { dict, .. }
                | IterState::DictItems { dict, .. } => visit(*dict),
                IterState::Set { set, .. } => visit(*set),
                IterState::Zip { iters } => iters.iter().for_each(|v| visit_value(v, &mut *visit)),
                IterState::Enumerate { inner, .. } => visit_value(inner, &mut *visit),
                IterState::Reversed { source, .. } => visit_value(source, &mut *visit),
                IterState::Map { func, inner } | IterState::Filter { func, inner } => {
                    visit_value(func, &mut *visit);
                    visit_value(inner, &mut *visit);
                }
                IterState::SeqProto { obj, .. } => visit_value(obj, &mut *visit),
            },
            Self::Gather(g) => g.children.iter().for_each(|v| visit_value(v, &mut *visit)),
        }
    }

    /// Consumes the payload, pushing every strong child reference into
    /// `sink` for the free cascade.
    fn into_child_ids(self, sink: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::Bytes(_) | Self::ByteArray(_) | Self::LongInt(_) | Self::Range(_) => {}
            Self::Exception(_) | Self::InFlight => {}
            Self::Tuple(t) => t.into_elements().into_iter().for_each(|v| v.dissolve(sink)),
            Self::List(l) => l.into_elements().into_iter().for_each(|v| v.dissolve(sink)),
            Self::Dict(mut d) => {
                for (k, v) in d.drain_pairs() {
                    k.dissolve(sink);
                    v.dissolve(sink);
                }
            }
            Self::Set(mut s) | Self::FrozenSet(mut s) => {
                s.drain_values().into_iter().for_each(|v| v.dissolve(sink));
            }
            Self::Slice(s) => {
                s.start.dissolve(sink);
                s.stop.dissolve(sink);
                s.step.dissolve(sink);
            }
            Self::Cell(v) => v.dissolve(sink),
            Self::Closure(c) => {
                c.defaults.into_iter().for_each(|v| v.dissolve(sink));
                c.kw_defaults.into_iter().for_each(|v| v.dissolve(sink));
                sink.extend(c.cells);
            }
            Self::BoundMethod(m) => {
                m.callable.dissolve(sink);
                m.receiver.dissolve(sink);
            }
            Self::Class(mut c) => {
                let names: Vec<String> = c.namespace_iter().map(|(n, _)| n.to_owned()).collect();
                for name in names {
                    if let Some(v) = c.remove_local(&name) {
                        v.dissolve(sink);
                    }
                }
                sink.extend(c.bases.iter().copied());
                sink.extend(c.mro.iter().copied());
            }
            Self::Instance(mut i) => {
                sink.push(i.class_id);
                let names: Vec<String> = i.attrs_iter().map(|(n, _)| n.to_owned()).collect();
                for name in names {
                    if let Some(v) = i.remove_attr(&name) {
                        v.dissolve(sink);
                    }
                }
            }
            Self::Generator(g) => {
                if let Some(result) = g.result {
                    result.dissolve(sink);
                }
                if let Some(frame) = g.frame {
                    frame.locals.into_iter().for_each(|v| v.dissolve(sink));
                    frame.stack.into_iter().for_each(|v| v.dissolve(sink));
                    sink.extend(frame.cells);
                }
            }
            Self::Coroutine(c) => {
                if let Some(frame) = c.frame {
                    frame.locals.into_iter().for_each(|v| v.dissolve(sink));
                    frame.stack.into_iter().for_each(|v| v.dissolve(sink));
                    sink.extend(frame.cells);
                }
            }
            Self::Iter(state) => match state {
                IterState::List { list, .. } => sink.push(list),
                IterState::Tuple { tuple, .. } => sink.push(tuple),
                IterState::Str { source, .. } | IterState::Bytes { source, .. } => source.dissolve(sink),
                IterState::Range { .. } => {}
                IterState::DictKeys { dict, .. }
                | IterState::DictValues { dict, .. }
                | IterState::DictItems { dict, .. } => sink.push(dict),
                IterState::Set { set, .. } => sink.push(set),
                IterState::Zip { iters } => iters.into_iter().for_each(|v| v.dissolve(sink)),
                IterState::Enumerate { inner, .. } => inner.dissolve(sink),
                IterState::Reversed { source, .. } => source.dissolve(sink),
                IterState::Map { func, inner } | IterState::Filter { func, inner } => {
                    func.dissolve(sink);
                    inner.dissolve(sink);
                }
                IterState::SeqProto { obj, .. } => obj.dissolve(sink),
            },
            Self::Gather(g) => g.children.into_iter().for_each(|v| v.dissolve(sink)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HeapEntry {
    data: HeapData,
    strong: Cell<u32>,
    /// Unique per allocation; weak observers compare it to detect slot reuse.
    uid: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum Slot {
    Free,
    Live(HeapEntry),
}

/// Point-in-time summary of heap contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    /// Live object counts keyed by payload variant name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
}

impl HeapStats {
    /// Growth from `self` (before) to `after`.
    #[must_use]
    pub fn diff(&self, after: &Self) -> HeapDiff {
        let mut objects_by_type_delta = BTreeMap::new();
        for (&name, &count) in &self.objects_by_type {
            let after_count = after.objects_by_type.get(name).copied().unwrap_or(0);
            objects_by_type_delta.insert(name, after_count as isize - count as isize);
        }
        for (&name, &count) in &after.objects_by_type {
            objects_by_type_delta.entry(name).or_insert(count as isize);
        }
        objects_by_type_delta.retain(|_, delta| *delta != 0);
        HeapDiff {
            live_objects_delta: after.live_objects as isize - self.live_objects as isize,
            objects_by_type_delta,
        }
    }
}

/// Difference between two heap snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    pub live_objects_delta: isize,
    /// Non-zero per-type deltas only.
    pub objects_by_type_delta: BTreeMap<&'static str, isize>,
}

impl HeapDiff {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0 && self.objects_by_type_delta.is_empty()
    }
}

/// The arena.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: serde::de::DeserializeOwned"))]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Slot>,
    free_list: Vec<HeapId>,
    tracker: T,
    next_uid: u64,
}

impl<T: ResourceTracker> Heap<T> {
    #[must_use]
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::with_capacity(64),
            free_list: Vec::new(),
            tracker,
            next_uid: 1,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates a slot, consulting the accountant first.
    pub fn alloc(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        let uid = self.next_uid;
        self.next_uid += 1;
        let entry = HeapEntry {
            data,
            strong: Cell::new(1),
            uid,
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Slot::Live(entry);
            Ok(id)
        } else {
            self.entries.push(Slot::Live(entry));
            Ok(HeapId(self.entries.len() - 1))
        }
    }

    /// Accounts container growth against the memory budget.
    pub fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.tracker.on_container_insert()
    }

    fn entry(&self, id: HeapId) -> &HeapEntry {
        match &self.entries[id.index()] {
            Slot::Live(entry) => entry,
            Slot::Free => panic!("access to freed heap slot {id:?}"),
        }
    }

    /// Whether the slot is live (for weak observation).
    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        matches!(self.entries.get(id.index()), Some(Slot::Live(_)))
    }

    /// The slot's allocation uid (for stale-reference detection).
    #[must_use]
    pub fn uid_of(&self, id: HeapId) -> u64 {
        self.entry(id).uid
    }

    /// A fresh unique id (class identity, weak observation).
    pub fn fresh_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    /// Borrows a payload.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entry(id).data
    }

    /// Borrows a payload mutably.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        match &mut self.entries[id.index()] {
            Slot::Live(entry) => &mut entry.data,
            Slot::Free => panic!("access to freed heap slot {id:?}"),
        }
    }

    /// Temporarily takes a payload out so `f` can operate on it and the
    /// heap at once. The caller must hold a strong reference to `id`.
    pub fn with_entry_mut<R>(&mut self, id: HeapId, f: impl FnOnce(&mut HeapData, &mut Self) -> R) -> R {
        let mut data = std::mem::replace(self.get_mut(id), HeapData::InFlight);
        let result = f(&mut data, self);
        *self.get_mut(id) = data;
        result
    }

    /// Adds a strong reference.
    pub fn inc_ref(&self, id: HeapId) {
        let strong = &self.entry(id).strong;
        strong.set(strong.get() + 1);
    }

    /// Current strong count, for tests and diagnostics.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> u32 {
        self.entry(id).strong.get()
    }

    /// Releases a strong reference; frees on zero, cascading through an
    /// explicit work list.
    pub fn dec_ref(&mut self, id: HeapId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let strong = {
                let entry = self.entry(id);
                let strong = entry.strong.get();
                debug_assert!(strong > 0, "dec_ref on zero-count slot {id:?}");
                entry.strong.set(strong - 1);
                strong - 1
            };
            if strong > 0 {
                continue;
            }
            let slot = std::mem::replace(&mut self.entries[id.index()], Slot::Free);
            let Slot::Live(entry) = slot else {
                unreachable!("slot checked live above");
            };
            let size = entry.data.estimate_size();
            self.tracker.on_free(|| size);
            entry.data.into_child_ids(&mut pending);
            self.free_list.push(id);
        }
    }

    /// Resolves the hash policy of an instance without calling guest code.
    #[must_use]
    pub fn instance_hash_policy(&self, id: HeapId, interns: &Interns) -> HashAttempt {
        let HeapData::Instance(instance) = self.get(id) else {
            return HashAttempt::Unhashable(self.get(id).type_of().name().to_owned());
        };
        let HeapData::Class(class) = self.get(instance.class_id) else {
            return HashAttempt::Ready(identity_hash(id));
        };
        match class.hash_policy {
            HashPolicy::Identity => HashAttempt::Ready(identity_hash(id)),
            HashPolicy::Defined => HashAttempt::NeedDunder(id),
            HashPolicy::Unhashable => HashAttempt::Unhashable(interns.get_str(class.name_id).to_owned()),
        }
    }

    /// On-demand mark-sweep over the arena.
    ///
    /// `roots` are every strong reference held outside the heap (frames,
    /// globals, in-flight exceptions). Unreachable slots are freed even when
    /// their counts are non-zero — that is exactly the cycle case. Returns
    /// the number of freed slots.
    pub fn collect_cycles(&mut self, roots: impl IntoIterator<Item = HeapId>) -> usize {
        let mut reachable = vec![false; self.entries.len()];
        let mut work: Vec<HeapId> = roots.into_iter().collect();
        while let Some(id) = work.pop() {
            if id.index() >= reachable.len() || reachable[id.index()] {
                continue;
            }
            if !self.is_live(id) {
                continue;
            }
            reachable[id.index()] = true;
            self.get(id).visit_children(&mut |child| work.push(child));
        }

        let mut freed = 0;
        for index in 0..self.entries.len() {
            if reachable[index] || !matches!(self.entries[index], Slot::Live(_)) {
                continue;
            }
            let slot = std::mem::replace(&mut self.entries[index], Slot::Free);
            let Slot::Live(entry) = slot else {
                unreachable!("slot checked live above");
            };
            let size = entry.data.estimate_size();
            self.tracker.on_free(|| size);
            // Children inside the dead region are freed wholesale; children
            // that survive lose one reference.
            let mut children = Vec::new();
            entry.data.into_child_ids(&mut children);
            for child in children {
                if child.index() < reachable.len() && reachable[child.index()] && self.is_live(child) {
                    self.dec_ref(child);
                }
            }
            self.free_list.push(HeapId(index));
            freed += 1;
        }
        freed
    }

    /// Snapshot of live contents.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live_objects = 0;
        for slot in &self.entries {
            if let Slot::Live(entry) = slot {
                live_objects += 1;
                *objects_by_type.entry(entry.data.variant_name()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_type,
        }
    }

    /// Number of live slots.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }
}

/// Identity hash for instances without a guest `__hash__`.
#[must_use]
fn identity_hash(id: HeapId) -> u64 {
    let signed = guest_hash::hash_i64(0x5157_0000 + id.index() as i64);
    u64::from_ne_bytes(signed.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    #[test]
    fn alloc_and_free_recycles_slots() {
        let mut heap = heap();
        let a = heap.alloc(HeapData::Str(Str::from("x"))).unwrap();
        assert_eq!(heap.refcount(a), 1);
        let uid_a = heap.uid_of(a);
        heap.dec_ref(a);
        assert!(!heap.is_live(a));

        let b = heap.alloc(HeapData::Str(Str::from("y"))).unwrap();
        // Slot reused, uid fresh.
        assert_eq!(a, b);
        assert_ne!(uid_a, heap.uid_of(b));
    }

    #[test]
    fn dropping_a_container_releases_children() {
        let mut heap = heap();
        let child = heap.alloc(HeapData::Str(Str::from("inner"))).unwrap();
        let list = heap
            .alloc(HeapData::List(List::new(vec![Value::Ref(child)])))
            .unwrap();
        assert_eq!(heap.refcount(child), 1);
        heap.dec_ref(list);
        assert!(!heap.is_live(child));
    }

    #[test]
    fn deep_nesting_frees_iteratively() {
        let mut heap = heap();
        let mut innermost = heap.alloc(HeapData::List(List::new(vec![]))).unwrap();
        for _ in 0..10_000 {
            innermost = heap
                .alloc(HeapData::List(List::new(vec![Value::Ref(innermost)])))
                .unwrap();
        }
        heap.dec_ref(innermost);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn cycles_survive_refcounting_and_fall_to_the_collector() {
        let mut heap = heap();
        let list = heap.alloc(HeapData::List(List::new(vec![]))).unwrap();
        // list.append(list)
        heap.inc_ref(list);
        if let HeapData::List(l) = heap.get_mut(list) {
            l.push(Value::Ref(list));
        }
        heap.dec_ref(list);
        // The cycle keeps the slot alive with count 1.
        assert!(heap.is_live(list));
        let freed = heap.collect_cycles([]);
        assert_eq!(freed, 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn collector_spares_rooted_values_and_decrements_survivors() {
        let mut heap = heap();
        let shared = heap.alloc(HeapData::Str(Str::from("kept"))).unwrap();
        // A cyclic list also referencing `shared`.
        heap.inc_ref(shared);
        let cyclic = heap
            .alloc(HeapData::List(List::new(vec![Value::Ref(shared)])))
            .unwrap();
        heap.inc_ref(cyclic);
        if let HeapData::List(l) = heap.get_mut(cyclic) {
            l.push(Value::Ref(cyclic));
        }
        heap.dec_ref(cyclic);

        let freed = heap.collect_cycles([shared]);
        assert_eq!(freed, 1);
        assert!(heap.is_live(shared));
        assert_eq!(heap.refcount(shared), 1);
    }

    #[test]
    fn stats_diff_tracks_growth() {
        let mut heap = heap();
        let before = heap.stats();
        let _a = heap.alloc(HeapData::Str(Str::from("x"))).unwrap();
        let _b = heap.alloc(HeapData::List(List::new(vec![]))).unwrap();
        let after = heap.stats();
        let diff = before.diff(&after);
        assert_eq!(diff.live_objects_delta, 2);
        assert_eq!(diff.objects_by_type_delta.get("Str"), Some(&1));
        assert!(!diff.is_empty());
    }
}
