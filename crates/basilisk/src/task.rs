//! Async primitives: external-call correlation ids and `gather` state.
//!
//! The host acts as the event loop. External function calls return control
//! to the host tagged with a [`CallId`]; the host resumes with a value (or
//! defers, leaving an unresolved external future the guest can await later).
//! `gather` drives child awaitables in declaration order, parking any child
//! that blocks on an unresolved future and surfacing the pending ids.

use serde::{Deserialize, Serialize};

use crate::{frame::Frame, value::Value};

/// Correlates an external function call with its eventual result.
///
/// Sequential and unique within one run, even for synchronously resolved
/// calls, so out-of-order async resolution can never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct CallId(u32);

impl CallId {
    #[inline]
    #[must_use]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Heap payload produced by `gather(...)`: the awaitable bundle.
///
/// Single-shot like a coroutine — awaiting a handle twice raises the
/// runtime kind.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct GatherHandle {
    /// Child awaitables in declaration order. Owned references.
    pub children: Vec<Value>,
    /// Set once the handle has been awaited.
    pub driven: bool,
}

impl GatherHandle {
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.children.capacity() * size_of::<Value>()
    }
}

/// Execution status of one `gather` child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ChildStatus {
    /// Not yet started.
    Pending,
    /// Frames currently on the VM stack.
    Running,
    /// Parked, waiting on an unresolved external future.
    Blocked(CallId),
    /// Finished; its result is recorded.
    Done,
}

/// Parked state of one `gather` child task.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct GatherChild {
    /// The child's awaitable, consumed when the child starts.
    pub awaitable: Option<Value>,
    /// Parked frames (innermost last) while blocked.
    pub frames: Vec<Frame>,
    pub status: ChildStatus,
    /// The completed child's result.
    pub result: Option<Value>,
}

impl GatherChild {
    #[must_use]
    pub fn new(awaitable: Value) -> Self {
        Self {
            awaitable: Some(awaitable),
            frames: Vec::new(),
            status: ChildStatus::Pending,
            result: None,
        }
    }
}

/// The VM's active `gather`: children plus the frame-stack barrier marking
/// where the running child's frames begin.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ActiveGather {
    pub children: Vec<GatherChild>,
    /// Index of the child whose frames are currently on the VM stack, if
    /// any.
    pub running: Option<usize>,
    /// Frame-stack depth of the awaiting frame; child frames sit above it.
    pub barrier: usize,
}

impl ActiveGather {
    /// Ids of every blocked child's pending call, in declaration order.
    #[must_use]
    pub fn pending_call_ids(&self) -> Vec<CallId> {
        self.children
            .iter()
            .filter_map(|c| match c.status {
                ChildStatus::Blocked(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Whether every child has completed.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.children.iter().all(|c| c.status == ChildStatus::Done)
    }
}
