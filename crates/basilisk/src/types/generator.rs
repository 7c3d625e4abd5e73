//! Generators and coroutines: frozen frames on the heap.
//!
//! A generator owns its execution state as a parked [`Frame`]. Resuming
//! moves the frame onto the VM's frame stack; yielding moves it back. A
//! coroutine is the same machinery with single-shot semantics: awaiting an
//! already-driven coroutine raises the runtime kind.
//!
//! Invariant: a parked frame always carries a neutral return ctx (the
//! resumer installs the real one), so heap traversal of a parked frame
//! never has ctx-owned values to visit.

use serde::{Deserialize, Serialize};

use crate::{frame::Frame, intern::FunctionId};

/// Lifecycle of a suspendable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum GeneratorState {
    /// Created; the body has not started.
    Created,
    /// Parked at a `yield` (or, for coroutines, created-and-startable).
    Suspended,
    /// Currently on the VM frame stack.
    Running,
    /// Completed or closed; resuming raises exhaustion.
    Done,
}

/// A guest generator.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Generator {
    pub func_id: FunctionId,
    pub state: GeneratorState,
    /// The parked frame. `None` while running (the VM holds it) or done.
    pub frame: Option<Frame>,
    /// The body's `return` value, consumed by `yield from` delegation.
    pub result: Option<crate::value::Value>,
}

impl Generator {
    #[must_use]
    pub fn new(func_id: FunctionId, frame: Frame) -> Self {
        Self {
            func_id,
            state: GeneratorState::Created,
            frame: Some(frame),
            result: None,
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>()
            + self
                .frame
                .as_ref()
                .map_or(0, |f| (f.locals.capacity() + f.stack.capacity()) * size_of::<crate::value::Value>())
    }
}

/// A guest coroutine (the result of calling an async function).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Coroutine {
    pub func_id: FunctionId,
    pub state: GeneratorState,
    /// The parked frame; consumed when the coroutine is first awaited.
    pub frame: Option<Frame>,
}

impl Coroutine {
    #[must_use]
    pub fn new(func_id: FunctionId, frame: Frame) -> Self {
        Self {
            func_id,
            state: GeneratorState::Created,
            frame: Some(frame),
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>()
            + self
                .frame
                .as_ref()
                .map_or(0, |f| (f.locals.capacity() + f.stack.capacity()) * size_of::<crate::value::Value>())
    }
}
