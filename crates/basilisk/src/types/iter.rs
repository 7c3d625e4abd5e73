//! Iterator-view payloads.
//!
//! Each variant records just enough position state to advance
//! deterministically. Advancing lives in the VM (`vm/iterops.rs`) because an
//! advance may call guest code (`__next__`, a `map` function); the payloads
//! here are the parked state between steps.

use serde::{Deserialize, Serialize};

use crate::{heap::HeapId, types::Range, value::Value};

/// State of a builtin iterator view.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum IterState {
    /// List iterator; observes mutation (grows and shrinks) like the guest.
    List { list: HeapId, index: usize },
    /// Tuple iterator.
    Tuple { tuple: HeapId, index: usize },
    /// String iterator yielding one-character strings. Owns the source.
    Str { source: Value, index: usize },
    /// Bytes iterator yielding ints. Owns the source.
    Bytes { source: Value, index: usize },
    /// Range iterator; the range is copied inline.
    Range { range: Range, index: usize },
    /// Dict key iterator; `expect_len` detects mutation during iteration.
    DictKeys { dict: HeapId, index: usize, expect_len: usize },
    /// Dict value iterator.
    DictValues { dict: HeapId, index: usize, expect_len: usize },
    /// Dict item iterator yielding `(key, value)` tuples.
    DictItems { dict: HeapId, index: usize, expect_len: usize },
    /// Set iterator (insertion order).
    Set { set: HeapId, index: usize, expect_len: usize },
    /// `zip(...)`: owns one sub-iterator per argument.
    Zip { iters: Vec<Value> },
    /// `enumerate(...)`: owns the inner iterator.
    Enumerate { inner: Value, count: i64 },
    /// `reversed(seq)` over an indexable builtin sequence. `remaining` is
    /// the count of elements not yet yielded.
    Reversed { source: Value, remaining: usize },
    /// `map(func, it)`: owns the function and the inner iterator.
    Map { func: Value, inner: Value },
    /// `filter(func_or_none, it)`.
    Filter { func: Value, inner: Value },
    /// Sequential-integer `__getitem__` adaptor for objects with no
    /// `__iter__`.
    SeqProto { obj: Value, index: i64 },
}

impl IterState {
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>()
            + match self {
                Self::Zip { iters } => iters.capacity() * size_of::<Value>(),
                _ => 0,
            }
    }
}
