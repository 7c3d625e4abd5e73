//! Call frames.
//!
//! A frame is an owned, movable record: code reference, instruction pointer,
//! local slots, captured cells, and its own operand stack. Guest calls never
//! use the native call stack — the VM keeps an explicit `Vec<Frame>` — so
//! deep recursion, generator freezing, and external-call suspension all move
//! the same structure around.
//!
//! Every pushed frame carries a [`ReturnCtx`] telling the VM what to do with
//! the value the frame returns. This is how dunder calls into guest code
//! stay uniform: a `__next__` frame driven by `ForIter` returns into a
//! different context than an `__init__` frame, but both are ordinary frames.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    heap::HeapId,
    intern::{FunctionId, StringId},
    value::Value,
};

/// Positional-argument vector for calls.
///
/// Almost every guest call passes a handful of arguments; the inline
/// capacity keeps the hot call path free of heap traffic.
pub(crate) type CallArgs = SmallVec<[Value; 4]>;

/// Which code object a frame executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum CodeRef {
    /// The module-level code of the running script.
    Module,
    /// A function-table entry.
    Function(FunctionId),
}

/// A queued dunder call to try when the current one returns the
/// not-implemented sentinel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PendingCall {
    /// Callable to invoke next (owned reference).
    pub callable: Value,
    /// Arguments, owned.
    pub args: CallArgs,
    /// Whether the result's truthiness is complemented (default `__ne__`).
    pub negate: bool,
}

/// What happens when every candidate in a dunder chain returned the
/// not-implemented sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum ChainFallback {
    /// `unsupported operand type(s) for X: 'a' and 'b'`.
    BinaryTypeError {
        symbol: String,
        left_type: String,
        right_type: String,
    },
    /// `'<' not supported between instances of 'a' and 'b'`.
    CompareTypeError {
        symbol: String,
        left_type: String,
        right_type: String,
    },
    /// Equality defaults to identity; `negate` for `!=`.
    IdentityEq { same: bool, negate: bool },
}

/// Deferred class-creation data carried by a class-body frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClassCtx {
    pub name_id: StringId,
    /// Direct bases as written: guest classes, builtin exception classes,
    /// or `object`. Owned references.
    pub bases: Vec<Value>,
    pub func_id: FunctionId,
}

/// Disposition of a frame's return value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ReturnCtx {
    /// Top-level frame: the return value is the program result.
    Module,
    /// Plain call: push the value on the caller's stack.
    Push,
    /// Call for effect: drop the value.
    Discard,
    /// `__init__` frame: require `None`, then push the instance.
    FinishInit { instance: Value },
    /// Guest `__new__` frame: when the result is an instance of the class,
    /// continue into `__init__` with the saved arguments; a foreign result
    /// skips `__init__` entirely.
    FinishNew { class_id: HeapId, init_args: Vec<Value> },
    /// Guest `__getattribute__` frame: an attribute-error kind escaping it
    /// falls back to `__getattr__` when defined; other errors propagate.
    GetAttributeResult { obj: Value, name: StringId },
    /// Class-body frame: extract the namespace into a class object.
    FinishClass(Box<ClassCtx>),
    /// Operator dispatch: on the not-implemented sentinel, try the next
    /// candidate; exhausted, apply the fallback.
    DunderChain {
        rest: Vec<PendingCall>,
        fallback: ChainFallback,
        /// Complement the truthiness of a real result (default `__ne__`).
        negate: bool,
    },
    /// `__bool__` frame: require an actual bool.
    StrictBool { negate: bool },
    /// `__len__` frame: require a non-negative int; push bool or int.
    LenResult { for_bool: bool, negate: bool },
    /// `__str__`/`__repr__` frame: require a str.
    StrictStr,
    /// `__contains__` frame: coerce by truthiness.
    CoerceBool { negate: bool },
    /// `__iter__` frame issued by membership fallback: the returned
    /// iterator continues the scan for `needle`.
    MembershipIter { needle: Value, negate: bool },
    /// `__hash__` frame: require an int, cache it on the instance. When
    /// `push` is false the current instruction re-executes with the cache
    /// warm (the VM rewound `ip` before pushing this frame).
    HashResult { target: HeapId, push: bool },
    /// A guest `__next__` frame (or a `map` function application): the
    /// return value is the next iteration element. A `StopIteration`
    /// escaping the frame means exhaustion, resolved per the delivery.
    NextResult { delivery: Delivery },
    /// A guest `__getitem__` frame from the sequence-protocol adaptor: the
    /// return value is the element; an escaping index-error kind means
    /// exhaustion.
    SeqProtoNext { delivery: Delivery },
    /// A `filter` predicate frame: truthy keeps `item` (delivered), falsy
    /// drops it and advances `iter` again.
    FilterDecision {
        item: Value,
        iter: Value,
        delivery: Delivery,
    },
    /// Root frame of a `gather` child task.
    TaskRoot { child_index: usize },
}

/// Where an iteration element produced by a guest frame goes.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Delivery {
    /// `ForIter` drives the loop: push the element and continue; on
    /// exhaustion pop the caller's iterator and jump to `end_target`.
    ForIter { end_target: u32 },
    /// `next(...)` semantics: push the element; exhaustion re-raises
    /// `StopIteration`.
    Push,
    /// Membership scan: compare the element to `needle` and either finish
    /// with a bool or advance `iter` again. The ctx owns the iterator.
    Membership {
        iter: Value,
        needle: Value,
        negate: bool,
    },
    /// `yield from` delegation: re-surface the element as a yield of the
    /// enclosing generator (parked at the `YieldFrom` instruction).
    ForwardYield,
    /// Materialization (`list(...)`/`tuple(...)` over a generator): append
    /// the element to `list` and advance `iter` again.
    Collect {
        iter: Value,
        list: HeapId,
        as_tuple: bool,
    },
}

/// One call-frame record.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub code_ref: CodeRef,
    /// Index of the next instruction to execute.
    pub ip: usize,
    /// Local slots; `Value::Undefined` marks unbound.
    pub locals: Vec<Value>,
    /// Own cells first, then captured free cells. Strong references.
    pub cells: Vec<HeapId>,
    /// This frame's operand stack.
    pub stack: Vec<Value>,
    pub ret: ReturnCtx,
    /// The generator/coroutine heap slot this frame belongs to, when it was
    /// resumed out of one. Owning while the frame runs: the VM increments
    /// the slot on resume and releases it on park or return.
    pub generator: Option<HeapId>,
    /// Whether resuming must push `None` first (the frame is parked right
    /// after a `Yield`, whose expression value arrives on resume).
    #[serde(default)]
    pub resume_with_none: bool,
}

impl Frame {
    /// Frame for module-level code.
    #[must_use]
    pub fn module(max_stack: usize) -> Self {
        Self {
            code_ref: CodeRef::Module,
            ip: 0,
            locals: Vec::new(),
            cells: Vec::new(),
            stack: Vec::with_capacity(max_stack),
            ret: ReturnCtx::Module,
            generator: None,
            resume_with_none: false,
        }
    }

    /// Frame for a function call with pre-bound locals.
    #[must_use]
    pub fn function(func_id: FunctionId, locals: Vec<Value>, cells: Vec<HeapId>, max_stack: usize, ret: ReturnCtx) -> Self {
        Self {
            code_ref: CodeRef::Function(func_id),
            ip: 0,
            locals,
            cells,
            stack: Vec::with_capacity(max_stack),
            ret,
            generator: None,
            resume_with_none: false,
        }
    }
}
