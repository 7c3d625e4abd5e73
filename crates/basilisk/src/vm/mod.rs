//! The dispatcher: a tight fetch/execute loop over explicit frames.
//!
//! Guest calls push [`Frame`]s onto `frames`; returns pop them and route the
//! returned value through the popped frame's [`ReturnCtx`]. The loop only
//! ever returns to the host on module completion, an uncaught error, or an
//! external-call suspension.
//!
//! Every instruction is atomic with respect to interruption: the wall-clock
//! check and the host cancellation flag are polled between instructions,
//! never inside one.

mod attr;
mod binary;
mod builtin_calls;
mod call;
mod collections;
mod iterops;
mod unwind;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use ahash::AHashMap;

use crate::{
    code::{BinOp, CmpOp, Code, Instr, Opcode, UnaryOp},
    exc::{ExcKind, ExcPayload, RunError, RunResult},
    frame::{CallArgs, CodeRef, Delivery, Frame, ReturnCtx},
    heap::{Heap, HeapData, HeapId},
    intern::{ExtFunctionId, Interns},
    io::PrintWriter,
    resource::ResourceTracker,
    task::{ActiveGather, CallId, ChildStatus, GatherChild},
    types::{Dict, GeneratorState, List, Set, Slice, Tuple},
    value::{HashAttempt, Value},
};

/// Why the dispatcher returned to the host.
#[derive(Debug)]
pub(crate) enum FrameExit {
    /// The module frame returned; the value is the program result.
    Return(Value),
    /// Suspended at an external function call site.
    ExternalCall {
        ext_id: ExtFunctionId,
        args: CallArgs,
        kwargs: Vec<(String, Value)>,
        call_id: CallId,
    },
    /// Every runnable task is blocked on unresolved external futures.
    ResolveFutures(Vec<CallId>),
}

/// Result injected for a deferred external call.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum FutureOutcome {
    Value(Value),
    Error(ExcPayload),
}

/// Serializable VM execution state, parked between host exchanges.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct VmState {
    pub frames: Vec<Frame>,
    /// Currently-handled exceptions with the frame depth they entered at.
    pub handled: Vec<(ExcPayload, usize)>,
    pub next_call_id: u32,
    pub gather: Option<ActiveGather>,
    /// Results for deferred calls, keyed by raw call id.
    pub resolved: AHashMap<u32, FutureOutcome>,
    pub instruction_ip: usize,
}

/// The dispatcher.
pub(crate) struct Vm<'a, T: ResourceTracker, P: PrintWriter> {
    pub(crate) frames: Vec<Frame>,
    pub(crate) handled: Vec<(ExcPayload, usize)>,
    pub(crate) next_call_id: u32,
    pub(crate) gather: Option<ActiveGather>,
    pub(crate) resolved: AHashMap<u32, FutureOutcome>,
    pub(crate) instruction_ip: usize,
    pub(crate) heap: &'a mut Heap<T>,
    pub(crate) globals: &'a mut Vec<Value>,
    pub(crate) interns: &'a Interns,
    pub(crate) module_code: &'a Code,
    pub(crate) print: &'a mut P,
    /// Host-refused primitive names (wall-clock blocking and friends).
    pub(crate) refused: &'a [String],
    pub(crate) cancel: Option<&'a AtomicBool>,
}

/// Runs `$expr`; on error, dispatches to the exception engine and either
/// continues the loop (caught) or propagates (uncaught).
macro_rules! vm_try {
    ($self:expr, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => {
                $self.handle_error(err)?;
                continue;
            }
        }
    };
}

/// Raises an error from inside the dispatch loop: dispatch, then continue
/// (caught) or propagate (uncaught). Diverges, so it fits any expression
/// position.
macro_rules! vm_bail {
    ($self:expr, $err:expr) => {{
        $self.handle_error($err)?;
        continue;
    }};
}

impl<'a, T: ResourceTracker, P: PrintWriter> Vm<'a, T, P> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        state: VmState,
        heap: &'a mut Heap<T>,
        globals: &'a mut Vec<Value>,
        interns: &'a Interns,
        module_code: &'a Code,
        print: &'a mut P,
        refused: &'a [String],
        cancel: Option<&'a AtomicBool>,
    ) -> Self {
        Self {
            frames: state.frames,
            handled: state.handled,
            next_call_id: state.next_call_id,
            gather: state.gather,
            resolved: state.resolved,
            instruction_ip: state.instruction_ip,
            heap,
            globals,
            interns,
            module_code,
            print,
            refused,
            cancel,
        }
    }

    /// Parks the execution state for a host exchange.
    pub fn into_state(self) -> VmState {
        VmState {
            frames: self.frames,
            handled: self.handled,
            next_call_id: self.next_call_id,
            gather: self.gather,
            resolved: self.resolved,
            instruction_ip: self.instruction_ip,
        }
    }

    // ------------------------------------------------------------------
    // Small accessors
    // ------------------------------------------------------------------

    pub(crate) fn code_for(&self, code_ref: CodeRef) -> &'a Code {
        match code_ref {
            CodeRef::Module => self.module_code,
            CodeRef::Function(fid) => &self.interns.get_function(fid).code,
        }
    }

    pub(crate) fn current_code(&self) -> &'a Code {
        self.code_for(self.frames.last().expect("frame stack empty").code_ref)
    }

    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("frame stack empty")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack empty")
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.frame_mut().stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.frame_mut().stack.pop().expect("operand stack underflow")
    }

    pub(crate) fn peek(&self) -> &Value {
        self.frame().stack.last().expect("operand stack underflow")
    }

    /// Pops `n` values preserving push order.
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let stack = &mut self.frame_mut().stack;
        debug_assert!(stack.len() >= n, "operand stack underflow");
        stack.split_off(stack.len() - n)
    }

    /// Pops `n` call arguments preserving push order, without a heap
    /// allocation for the common small arities.
    pub(crate) fn pop_args(&mut self, n: usize) -> CallArgs {
        let stack = &mut self.frame_mut().stack;
        debug_assert!(stack.len() >= n, "operand stack underflow");
        let start = stack.len() - n;
        stack.drain(start..).collect()
    }

    /// Resets the instruction pointer to the current instruction so it
    /// re-executes after an interposed dunder frame returns.
    pub(crate) fn rewind(&mut self) {
        let ip = self.instruction_ip;
        self.frame_mut().ip = ip;
    }

    pub(crate) fn allocate_call_id(&mut self) -> CallId {
        let id = CallId::new(self.next_call_id);
        self.next_call_id += 1;
        id
    }

    /// Interned text lookup shorthand.
    pub(crate) fn text(&self, id: crate::intern::StringId) -> &'a str {
        self.interns.get_str(id)
    }

    pub(crate) fn drop_values(&mut self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            value.drop_with_heap(self.heap);
        }
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Executes until completion, an uncaught error, or a suspension.
    pub fn run(&mut self) -> Result<FrameExit, RunError> {
        // A resume may land with every gather task blocked; unblock first.
        if self.gather.is_some()
            && let Some(exit) = self.gather_reschedule()?
        {
            return Ok(exit);
        }

        loop {
            if let Err(breach) = self.heap.tracker_mut().check_time() {
                self.handle_error(RunError::from(breach))?;
                continue;
            }
            if let Some(cancel) = self.cancel
                && cancel.swap(false, Ordering::Relaxed)
            {
                let err = RunError::from(ExcPayload::with_message(ExcKind::CancelledError, "cancelled by host"));
                self.handle_error(err)?;
                continue;
            }

            let code = self.current_code();
            let frame = self.frames.last_mut().expect("frame stack empty");
            if frame.ip >= code.len() {
                return Err(RunError::internal("execution fell off the end of a code object"));
            }
            let Instr { op, arg } = code.instr(frame.ip);
            self.instruction_ip = frame.ip;
            frame.ip += 1;

            match op {
                // ---- stack shuffling ----
                Opcode::Pop => {
                    let value = self.pop();
                    value.drop_with_heap(self.heap);
                }
                Opcode::Dup => {
                    let copy = self.peek().clone_with_heap(self.heap);
                    self.push(copy);
                }
                Opcode::Rot2 => {
                    let stack = &mut self.frame_mut().stack;
                    let len = stack.len();
                    stack.swap(len - 1, len - 2);
                }
                Opcode::Rot3 => {
                    let stack = &mut self.frame_mut().stack;
                    let len = stack.len();
                    stack[len - 3..].rotate_right(1);
                }

                // ---- constants & names ----
                Opcode::LoadConst => {
                    let constant = code.constant(arg);
                    if let Value::InternLongInt(li) = constant {
                        let big = self.interns.get_long_int(*li).clone();
                        let value = vm_try!(self, crate::types::LongInt::new(big).into_value(self.heap));
                        self.push(value);
                    } else {
                        let value = constant.shallow_copy();
                        self.push(value);
                    }
                }
                Opcode::LoadLocal => {
                    let slot = arg as usize;
                    if matches!(self.frame().locals[slot], Value::Undefined) {
                        let name = self.text(code.local_name(arg)).to_owned();
                        vm_bail!(self, ExcKind::unbound_local(&name));
                    }
                    let value = self.frame().locals[slot].clone_with_heap(self.heap);
                    self.push(value);
                }
                Opcode::StoreLocal => {
                    let value = self.pop();
                    let old = std::mem::replace(&mut self.frame_mut().locals[arg as usize], value);
                    old.drop_with_heap(self.heap);
                }
                Opcode::DeleteLocal => {
                    let old = std::mem::replace(&mut self.frame_mut().locals[arg as usize], Value::Undefined);
                    if matches!(old, Value::Undefined) {
                        let name = self.text(code.local_name(arg)).to_owned();
                        vm_bail!(self, ExcKind::unbound_local(&name));
                    }
                    old.drop_with_heap(self.heap);
                }
                Opcode::LoadGlobal => {
                    let slot = arg as usize;
                    if matches!(self.globals[slot], Value::Undefined) {
                        let name = self.text(self.module_code.global_name(arg)).to_owned();
                        vm_bail!(self, ExcKind::name_error(&name));
                    }
                    let value = self.globals[slot].clone_with_heap(self.heap);
                    self.push(value);
                }
                Opcode::StoreGlobal => {
                    let value = self.pop();
                    let old = std::mem::replace(&mut self.globals[arg as usize], value);
                    old.drop_with_heap(self.heap);
                }
                Opcode::DeleteGlobal => {
                    let old = std::mem::replace(&mut self.globals[arg as usize], Value::Undefined);
                    if matches!(old, Value::Undefined) {
                        let name = self.text(self.module_code.global_name(arg)).to_owned();
                        vm_bail!(self, ExcKind::name_error(&name));
                    }
                    old.drop_with_heap(self.heap);
                }
                Opcode::LoadCell => {
                    let cell_id = self.frame().cells[arg as usize];
                    let value = match self.heap.get(cell_id) {
                        HeapData::Cell(v) => v.shallow_copy(),
                        _ => vm_bail!(self, RunError::internal("cell slot does not hold a cell")),
                    };
                    if matches!(value, Value::Undefined) {
                        let err = ExcPayload::with_message(
                            ExcKind::NameError,
                            "cannot access free variable before assignment",
                        );
                        vm_bail!(self, RunError::from(err));
                    }
                    if let Value::Ref(id) = &value {
                        self.heap.inc_ref(*id);
                    }
                    self.push(value);
                }
                Opcode::StoreCell => {
                    let value = self.pop();
                    let cell_id = self.frame().cells[arg as usize];
                    let old = match self.heap.get_mut(cell_id) {
                        HeapData::Cell(slot) => std::mem::replace(slot, value),
                        _ => vm_bail!(self, RunError::internal("cell slot does not hold a cell")),
                    };
                    old.drop_with_heap(self.heap);
                }
                Opcode::LoadCellRef => {
                    let cell_id = self.frame().cells[arg as usize];
                    self.heap.inc_ref(cell_id);
                    self.push(Value::Ref(cell_id));
                }

                // ---- containers ----
                Opcode::BuildList => {
                    let elements = self.pop_n(arg as usize);
                    let id = vm_try!(
                        self,
                        self.heap.alloc(HeapData::List(List::new(elements))).map_err(RunError::from)
                    );
                    self.push(Value::Ref(id));
                }
                Opcode::BuildTuple => {
                    let elements = self.pop_n(arg as usize);
                    let id = vm_try!(
                        self,
                        self.heap.alloc(HeapData::Tuple(Tuple::new(elements))).map_err(RunError::from)
                    );
                    self.push(Value::Ref(id));
                }
                Opcode::BuildSet => {
                    let n = arg as usize;
                    if !vm_try!(self, self.keys_hashable_at(n)) {
                        continue;
                    }
                    let elements = self.pop_n(n);
                    let set = vm_try!(self, self.build_set_from(elements));
                    let id = vm_try!(self, self.heap.alloc(HeapData::Set(set)).map_err(RunError::from));
                    self.push(Value::Ref(id));
                }
                Opcode::BuildDict => {
                    let n = arg as usize;
                    if !vm_try!(self, self.dict_keys_hashable(n)) {
                        continue;
                    }
                    let pairs = self.pop_n(n * 2);
                    let dict = vm_try!(self, self.build_dict_from(pairs));
                    let id = vm_try!(self, self.heap.alloc(HeapData::Dict(dict)).map_err(RunError::from));
                    self.push(Value::Ref(id));
                }
                Opcode::BuildSlice => {
                    let mut parts = self.pop_n(arg as usize);
                    let (start, stop, step) = if arg == 2 {
                        let stop = parts.pop().expect("two slice parts");
                        let start = parts.pop().expect("two slice parts");
                        (start, stop, Value::None)
                    } else {
                        let step = parts.pop().expect("three slice parts");
                        let stop = parts.pop().expect("three slice parts");
                        let start = parts.pop().expect("three slice parts");
                        (start, stop, step)
                    };
                    let id = vm_try!(
                        self,
                        self.heap
                            .alloc(HeapData::Slice(Slice { start, stop, step }))
                            .map_err(RunError::from)
                    );
                    self.push(Value::Ref(id));
                }
                Opcode::ListAppend => {
                    let value = self.pop();
                    vm_try!(self, self.heap.on_container_insert().map_err(RunError::from));
                    let target = vm_try!(self, self.ref_at_depth(arg as usize, "ListAppend"));
                    match self.heap.get_mut(target) {
                        HeapData::List(list) => list.push(value),
                        _ => {
                            value.drop_with_heap(self.heap);
                            vm_bail!(self, RunError::internal("ListAppend target is not a list"));
                        }
                    }
                }
                Opcode::SetAdd => {
                    if !vm_try!(self, self.keys_hashable_at(1)) {
                        continue;
                    }
                    let value = self.pop();
                    vm_try!(self, self.heap.on_container_insert().map_err(RunError::from));
                    let hash = match self.hash_ready(&value) {
                        Ok(hash) => hash,
                        Err(err) => {
                            value.drop_with_heap(self.heap);
                            vm_bail!(self, err)
                        }
                    };
                    let target = vm_try!(self, self.ref_at_depth(arg as usize, "SetAdd"));
                    let duplicate = self.heap.with_entry_mut(target, |data, heap| match data {
                        HeapData::Set(set) => Ok(set.add(value, hash, heap, self.interns)),
                        _ => Err(RunError::internal("SetAdd target is not a set")),
                    });
                    if let Some(dup) = vm_try!(self, duplicate) {
                        dup.drop_with_heap(self.heap);
                    }
                }
                Opcode::MapAdd => {
                    // Stack: [dict, ..., key, value]; the key sits one below
                    // the top.
                    if !vm_try!(self, self.keys_hashable_at_depth(1)) {
                        continue;
                    }
                    let value = self.pop();
                    let key = self.pop();
                    vm_try!(self, self.heap.on_container_insert().map_err(RunError::from));
                    let hash = match self.hash_ready(&key) {
                        Ok(hash) => hash,
                        Err(err) => {
                            key.drop_with_heap(self.heap);
                            value.drop_with_heap(self.heap);
                            vm_bail!(self, err)
                        }
                    };
                    let target = vm_try!(self, self.ref_at_depth(arg as usize, "MapAdd"));
                    let old = self.heap.with_entry_mut(target, |data, heap| match data {
                        HeapData::Dict(dict) => Ok(dict.insert(key, hash, value, heap, self.interns)),
                        _ => Err(RunError::internal("MapAdd target is not a dict")),
                    });
                    if let Some(old) = vm_try!(self, old) {
                        old.drop_with_heap(self.heap);
                    }
                }
                Opcode::ListExtend => {
                    vm_try!(self, self.list_extend_op());
                }
                Opcode::DictUpdate => {
                    let mapping = self.pop();
                    vm_try!(self, self.dict_update_from(mapping));
                }
                Opcode::Subscr => {
                    vm_try!(self, self.subscr_get());
                }
                Opcode::StoreSubscr => {
                    vm_try!(self, self.subscr_set());
                }
                Opcode::DeleteSubscr => {
                    vm_try!(self, self.subscr_del());
                }
                Opcode::UnpackSequence => {
                    vm_try!(self, self.unpack_sequence(arg as usize));
                }

                // ---- operators ----
                Opcode::Binary => {
                    vm_try!(self, self.binary_op(BinOp::from_arg(arg), false));
                }
                Opcode::Inplace => {
                    vm_try!(self, self.binary_op(BinOp::from_arg(arg), true));
                }
                Opcode::Unary => {
                    vm_try!(self, self.unary_op(UnaryOp::from_arg(arg)));
                }
                Opcode::Compare => {
                    vm_try!(self, self.compare_op(CmpOp::from_arg(arg)));
                }

                // ---- control flow ----
                Opcode::Jump => {
                    self.frame_mut().ip = arg as usize;
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let value = self.pop();
                    let truth = match value.truthy(self.heap, self.interns) {
                        Some(truth) => {
                            value.drop_with_heap(self.heap);
                            truth
                        }
                        None => {
                            // Instance truthiness runs through its dunder;
                            // the re-executed branch pops a plain bool.
                            self.rewind();
                            vm_try!(self, self.instance_truthiness(value));
                            continue;
                        }
                    };
                    if truth == (op == Opcode::JumpIfTrue) {
                        self.frame_mut().ip = arg as usize;
                    }
                }
                Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {
                    let truth = match self.peek().truthy(self.heap, self.interns) {
                        Some(truth) => truth,
                        None => {
                            let value = self.pop();
                            self.rewind();
                            vm_try!(self, self.instance_truthiness(value));
                            continue;
                        }
                    };
                    if truth == (op == Opcode::JumpIfTrueOrPop) {
                        self.frame_mut().ip = arg as usize;
                    } else {
                        let value = self.pop();
                        value.drop_with_heap(self.heap);
                    }
                }
                Opcode::GetIter => {
                    vm_try!(self, self.get_iter_op());
                }
                Opcode::ForIter => {
                    vm_try!(self, self.for_iter_op(arg));
                }

                // ---- calls & frames ----
                Opcode::MakeFunction => {
                    vm_try!(self, self.make_function(arg));
                }
                Opcode::Call => {
                    let args = self.pop_args(arg as usize);
                    let callable = self.pop();
                    if let Some(exit) = vm_try!(self, self.call_value(callable, args, Vec::new(), ReturnCtx::Push)) {
                        return Ok(exit);
                    }
                }
                Opcode::CallKw => {
                    if let Some(exit) = vm_try!(self, self.call_kw_op(arg)) {
                        return Ok(exit);
                    }
                }
                Opcode::CallEx => {
                    let kwargs_dict = if arg & 1 == 1 { Some(self.pop()) } else { None };
                    let args_iterable = self.pop();
                    let callable = self.pop();
                    if let Some(exit) = vm_try!(self, self.call_ex(callable, args_iterable, kwargs_dict)) {
                        return Ok(exit);
                    }
                }
                Opcode::LoadAttr => {
                    vm_try!(self, self.load_attr_op(arg));
                }
                Opcode::StoreAttr => {
                    vm_try!(self, self.store_attr_op(arg));
                }
                Opcode::DeleteAttr => {
                    vm_try!(self, self.delete_attr_op(arg));
                }
                Opcode::LoadMethod => {
                    vm_try!(self, self.load_method(arg));
                }
                Opcode::CallMethod => {
                    // Stack: [self_or_undefined, callable, args...].
                    let args = self.pop_args(arg as usize);
                    let callable = self.pop();
                    let self_slot = self.pop();
                    let args = if matches!(self_slot, Value::Undefined) {
                        args
                    } else {
                        let mut full = CallArgs::with_capacity(args.len() + 1);
                        full.push(self_slot);
                        full.extend(args);
                        full
                    };
                    if let Some(exit) = vm_try!(self, self.call_value(callable, args, Vec::new(), ReturnCtx::Push)) {
                        return Ok(exit);
                    }
                }
                Opcode::Return => {
                    let value = self.pop();
                    if let Some(exit) = vm_try!(self, self.return_from_frame(value)) {
                        return Ok(exit);
                    }
                }
                Opcode::Yield => {
                    vm_try!(self, self.yield_op());
                }
                Opcode::YieldFrom => {
                    vm_try!(self, self.yield_from_op());
                }
                Opcode::Await => {
                    if let Some(exit) = vm_try!(self, self.await_op()) {
                        return Ok(exit);
                    }
                }

                // ---- exceptions ----
                Opcode::Raise => {
                    let err = self.make_raise(arg);
                    vm_bail!(self, err);
                }
                Opcode::Reraise => {
                    let value = self.pop();
                    let err = self.reraise_value(value);
                    vm_bail!(self, err);
                }
                Opcode::ClearExc => {
                    self.handled.pop();
                }
                Opcode::CheckExcMatch => {
                    vm_try!(self, self.check_exc_match());
                }
                Opcode::ExceptStarMatch => {
                    vm_try!(self, self.except_star_match());
                }
                Opcode::ReraiseStar => {
                    let rest = self.pop();
                    if matches!(rest, Value::None) {
                        continue;
                    }
                    let err = self.reraise_value(rest);
                    vm_bail!(self, err);
                }

                // ---- classes ----
                Opcode::BuildClass => {
                    vm_try!(self, self.build_class(arg));
                }
            }
        }
    }

    /// The heap id at stack depth `depth` below the top, or an internal
    /// error named after the instruction.
    fn ref_at_depth(&self, depth: usize, what: &str) -> RunResult<HeapId> {
        let stack = &self.frame().stack;
        match stack.get(stack.len() - 1 - depth) {
            Some(Value::Ref(id)) => Ok(*id),
            _ => Err(RunError::internal(format!("{what} target is not heap-allocated"))),
        }
    }

    // ------------------------------------------------------------------
    // Hashing support (instance keys may need a guest `__hash__` call)
    // ------------------------------------------------------------------

    /// Hash of a key whose hashability was already ensured.
    pub(crate) fn hash_ready(&mut self, key: &Value) -> RunResult<u64> {
        match key.hash_key(self.heap, self.interns) {
            HashAttempt::Ready(hash) => Ok(hash),
            HashAttempt::NeedDunder(_) => Err(RunError::internal("key hash not pre-computed")),
            HashAttempt::Unhashable(type_name) => Err(ExcKind::type_error(format!("unhashable type: '{type_name}'"))),
        }
    }

    /// Ensures the top `n` stack values hash without guest code.
    ///
    /// When one needs a guest `__hash__`, rewinds the instruction, pushes
    /// the dunder frame, and returns `false`; the instruction re-executes
    /// with the hash cached.
    pub(crate) fn keys_hashable_at(&mut self, n: usize) -> RunResult<bool> {
        for depth in 0..n {
            if !self.keys_hashable_at_depth(depth)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Ensures the stack value at `depth` (0 = top) hashes without guest
    /// code, arranging the `__hash__` call otherwise.
    pub(crate) fn keys_hashable_at_depth(&mut self, depth: usize) -> RunResult<bool> {
        let stack = &self.frame().stack;
        let value = &stack[stack.len() - 1 - depth];
        match value.hash_key(self.heap, self.interns) {
            HashAttempt::Ready(_) => Ok(true),
            HashAttempt::Unhashable(type_name) => Err(ExcKind::type_error(format!("unhashable type: '{type_name}'"))),
            HashAttempt::NeedDunder(instance_id) => {
                self.rewind();
                self.call_instance_hash(instance_id, false)?;
                Ok(false)
            }
        }
    }

    /// Ensures every key position of a pending `BuildDict` hashes.
    fn dict_keys_hashable(&mut self, pairs: usize) -> RunResult<bool> {
        for pair in 0..pairs {
            // Values sit above their keys: key depth is 2*pair+1.
            if !self.keys_hashable_at_depth(pair * 2 + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Builds a set from elements whose hashability was ensured.
    fn build_set_from(&mut self, elements: Vec<Value>) -> RunResult<Set> {
        let mut set = Set::new();
        let mut elements = elements.into_iter();
        while let Some(element) = elements.next() {
            match self.hash_ready(&element) {
                Ok(hash) => {
                    if let Some(dup) = set.add(element, hash, self.heap, self.interns) {
                        dup.drop_with_heap(self.heap);
                    }
                }
                Err(err) => {
                    element.drop_with_heap(self.heap);
                    for rest in elements {
                        rest.drop_with_heap(self.heap);
                    }
                    for v in set.drain_values() {
                        v.drop_with_heap(self.heap);
                    }
                    return Err(err);
                }
            }
        }
        Ok(set)
    }

    /// Builds a dict from a flat `[k0, v0, k1, v1, ...]` vector in source
    /// order.
    pub(crate) fn build_dict_from(&mut self, pairs: Vec<Value>) -> RunResult<Dict> {
        let mut dict = Dict::with_capacity(pairs.len() / 2);
        let mut pairs = pairs.into_iter();
        while let Some(key) = pairs.next() {
            let value = pairs.next().expect("pairs come in twos");
            match self.hash_ready(&key) {
                Ok(hash) => {
                    if let Some(old) = dict.insert(key, hash, value, self.heap, self.interns) {
                        old.drop_with_heap(self.heap);
                    }
                }
                Err(err) => {
                    key.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    for rest in pairs {
                        rest.drop_with_heap(self.heap);
                    }
                    for (k, v) in dict.drain_pairs() {
                        k.drop_with_heap(self.heap);
                        v.drop_with_heap(self.heap);
                    }
                    return Err(err);
                }
            }
        }
        Ok(dict)
    }

    // ------------------------------------------------------------------
    // Frame return plumbing
    // ------------------------------------------------------------------

    /// Pops the current frame and routes `value` through its return ctx.
    ///
    /// Returns `Some(exit)` when the module frame finished.
    pub(crate) fn return_from_frame(&mut self, value: Value) -> RunResult<Option<FrameExit>> {
        let mut frame = self.frames.pop().expect("return with no frame");
        self.prune_handled();

        // A returning generator/coroutine body is exhausted.
        if let Some(gen_id) = frame.generator.take() {
            let ret = std::mem::replace(&mut frame.ret, ReturnCtx::Discard);
            self.dispose_frame_shell(frame);
            let outcome = self.generator_returned(gen_id, value, ret);
            self.heap.dec_ref(gen_id);
            return outcome;
        }

        let ret = std::mem::replace(&mut frame.ret, ReturnCtx::Discard);
        if let ReturnCtx::FinishClass(ctx) = ret {
            return self.finish_class(*ctx, frame, value).map(|()| None);
        }
        self.dispose_frame_shell(frame);
        self.apply_return_ctx(ret, value)
    }

    /// Routes a produced value through a return ctx (shared by normal
    /// returns and generator yields).
    pub(crate) fn apply_return_ctx(&mut self, ret: ReturnCtx, value: Value) -> RunResult<Option<FrameExit>> {
        match ret {
            ReturnCtx::Module => {
                debug_assert!(self.frames.is_empty());
                Ok(Some(FrameExit::Return(value)))
            }
            ReturnCtx::Push => {
                self.push(value);
                Ok(None)
            }
            ReturnCtx::Discard => {
                value.drop_with_heap(self.heap);
                Ok(None)
            }
            ReturnCtx::FinishInit { instance } => {
                if !matches!(value, Value::None) {
                    let type_name = value.type_name(self.heap, self.interns).into_owned();
                    value.drop_with_heap(self.heap);
                    instance.drop_with_heap(self.heap);
                    return Err(ExcKind::type_error(format!(
                        "__init__() should return None, not '{type_name}'"
                    )));
                }
                value.drop_with_heap(self.heap);
                self.push(instance);
                Ok(None)
            }
            ReturnCtx::FinishNew { class_id, init_args } => self.finish_new(class_id, init_args, value).map(|()| None),
            ReturnCtx::FinishClass(ctx) => {
                let name = self.text(ctx.name_id).to_owned();
                self.dispose_ctx(ReturnCtx::FinishClass(ctx));
                value.drop_with_heap(self.heap);
                Err(RunError::internal(format!(
                    "class body for '{name}' returned through the generic path"
                )))
            }
            ReturnCtx::DunderChain { rest, fallback, negate } => {
                self.dunder_chain_step(rest, fallback, negate, value).map(|()| None)
            }
            ReturnCtx::StrictBool { negate } => {
                let Value::Bool(b) = value else {
                    let type_name = value.type_name(self.heap, self.interns).into_owned();
                    value.drop_with_heap(self.heap);
                    return Err(ExcKind::type_error(format!(
                        "__bool__ should return bool, returned {type_name}"
                    )));
                };
                self.push(Value::Bool(b != negate));
                Ok(None)
            }
            ReturnCtx::LenResult { for_bool, negate } => {
                let Some(len) = crate::value::as_index(&value, self.heap) else {
                    let type_name = value.type_name(self.heap, self.interns).into_owned();
                    value.drop_with_heap(self.heap);
                    return Err(ExcKind::type_error(format!(
                        "'{type_name}' object cannot be interpreted as an integer"
                    )));
                };
                value.drop_with_heap(self.heap);
                if len < 0 {
                    return Err(ExcKind::value_error("__len__() should return >= 0"));
                }
                if for_bool {
                    self.push(Value::Bool((len != 0) != negate));
                } else {
                    self.push(Value::Int(len));
                }
                Ok(None)
            }
            ReturnCtx::StrictStr => {
                if crate::value::str_content(&value, self.heap, self.interns).is_none() {
                    let type_name = value.type_name(self.heap, self.interns).into_owned();
                    value.drop_with_heap(self.heap);
                    return Err(ExcKind::type_error(format!(
                        "__str__ returned non-string (type {type_name})"
                    )));
                }
                self.push(value);
                Ok(None)
            }
            ReturnCtx::CoerceBool { negate } => {
                let truth = value.truthy(self.heap, self.interns).unwrap_or(true);
                value.drop_with_heap(self.heap);
                self.push(Value::Bool(truth != negate));
                Ok(None)
            }
            ReturnCtx::MembershipIter { needle, negate } => {
                self.membership_advance(value, needle, negate).map(|()| None)
            }
            ReturnCtx::HashResult { target, push } => {
                let Some(raw) = crate::value::as_index(&value, self.heap) else {
                    let type_name = value.type_name(self.heap, self.interns).into_owned();
                    value.drop_with_heap(self.heap);
                    return Err(ExcKind::type_error(format!(
                        "__hash__ method should return an integer, not {type_name}"
                    )));
                };
                value.drop_with_heap(self.heap);
                let hashed = crate::guest_hash::hash_i64(raw);
                if let HeapData::Instance(instance) = self.heap.get_mut(target) {
                    instance.cached_hash = Some(hashed);
                }
                if push {
                    self.push(Value::Int(hashed));
                }
                Ok(None)
            }
            ReturnCtx::NextResult { delivery } | ReturnCtx::SeqProtoNext { delivery } => {
                self.deliver_value(delivery, value).map(|()| None)
            }
            ReturnCtx::FilterDecision { item, iter, delivery } => {
                let keep = value.truthy(self.heap, self.interns).unwrap_or(true);
                value.drop_with_heap(self.heap);
                if keep {
                    iter.drop_with_heap(self.heap);
                    self.deliver_value(delivery, item).map(|()| None)
                } else {
                    item.drop_with_heap(self.heap);
                    self.advance_with_delivery(iter, delivery).map(|()| None)
                }
            }
            ReturnCtx::GetAttributeResult { obj, name: _ } => {
                obj.drop_with_heap(self.heap);
                self.push(value);
                Ok(None)
            }
            ReturnCtx::TaskRoot { child_index } => self.gather_child_done(child_index, value),
        }
    }

    /// Drops the residue of a popped frame (locals, stack, cells).
    pub(crate) fn dispose_frame_shell(&mut self, frame: Frame) {
        for value in frame.locals {
            value.drop_with_heap(self.heap);
        }
        for value in frame.stack {
            value.drop_with_heap(self.heap);
        }
        for cell in frame.cells {
            self.heap.dec_ref(cell);
        }
    }

    /// Drops the values a return ctx owns (used during unwinding).
    pub(crate) fn dispose_ctx(&mut self, ret: ReturnCtx) {
        match ret {
            ReturnCtx::Module
            | ReturnCtx::Push
            | ReturnCtx::Discard
            | ReturnCtx::StrictBool { .. }
            | ReturnCtx::LenResult { .. }
            | ReturnCtx::StrictStr
            | ReturnCtx::CoerceBool { .. }
            | ReturnCtx::HashResult { .. }
            | ReturnCtx::TaskRoot { .. } => {}
            ReturnCtx::FinishInit { instance } => instance.drop_with_heap(self.heap),
            ReturnCtx::FinishNew { init_args, .. } => self.drop_values(init_args),
            ReturnCtx::FinishClass(ctx) => self.drop_values(ctx.bases),
            ReturnCtx::DunderChain { rest, .. } => {
                for pending in rest {
                    pending.callable.drop_with_heap(self.heap);
                    self.drop_values(pending.args);
                }
            }
            ReturnCtx::NextResult { delivery } | ReturnCtx::SeqProtoNext { delivery } => {
                self.dispose_delivery(delivery);
            }
            ReturnCtx::FilterDecision { item, iter, delivery } => {
                item.drop_with_heap(self.heap);
                iter.drop_with_heap(self.heap);
                self.dispose_delivery(delivery);
            }
            ReturnCtx::GetAttributeResult { obj, .. } => obj.drop_with_heap(self.heap),
            ReturnCtx::MembershipIter { needle, .. } => needle.drop_with_heap(self.heap),
        }
    }

    pub(crate) fn dispose_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Membership { iter, needle, .. } => {
                iter.drop_with_heap(self.heap);
                needle.drop_with_heap(self.heap);
            }
            Delivery::Collect { iter, list, .. } => {
                iter.drop_with_heap(self.heap);
                self.heap.dec_ref(list);
            }
            Delivery::ForIter { .. } | Delivery::Push | Delivery::ForwardYield => {}
        }
    }

    /// Drops handled-exception contexts that belong to frames already gone.
    pub(crate) fn prune_handled(&mut self) {
        let depth = self.frames.len();
        while matches!(self.handled.last(), Some((_, d)) if *d > depth) {
            self.handled.pop();
        }
    }

    // ------------------------------------------------------------------
    // Generators, yield, await
    // ------------------------------------------------------------------

    /// Handles `Yield`: parks the generator frame and surfaces the value.
    fn yield_op(&mut self) -> RunResult<()> {
        let Some(gen_id) = self.frame().generator else {
            return Err(RunError::internal("Yield outside a generator frame"));
        };
        let value = self.pop();
        let mut frame = self.frames.pop().expect("frame checked above");
        // Parked frames always carry a neutral ctx; the resume ctx decides
        // where the yielded value goes.
        let ret = std::mem::replace(&mut frame.ret, ReturnCtx::Discard);
        frame.generator = None;
        frame.resume_with_none = true;
        self.park_generator_frame(gen_id, frame, GeneratorState::Suspended);
        self.heap.dec_ref(gen_id);
        match self.apply_return_ctx(ret, value)? {
            None => Ok(()),
            Some(_) => Err(RunError::internal("yield delivered to the module frame")),
        }
    }

    /// Parks a frame back into its generator/coroutine slot.
    pub(crate) fn park_generator_frame(&mut self, gen_id: HeapId, frame: Frame, state: GeneratorState) {
        if !self.heap.is_live(gen_id) {
            self.dispose_frame_shell(frame);
            return;
        }
        match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => {
                generator.frame = Some(frame);
                generator.state = state;
            }
            HeapData::Coroutine(coroutine) => {
                coroutine.frame = Some(frame);
                coroutine.state = state;
            }
            _ => self.dispose_frame_shell(frame),
        }
    }

    /// A generator/coroutine body returned `value`.
    fn generator_returned(&mut self, gen_id: HeapId, value: Value, ret: ReturnCtx) -> RunResult<Option<FrameExit>> {
        if !self.heap.is_live(gen_id) {
            value.drop_with_heap(self.heap);
            self.dispose_ctx(ret);
            return Err(RunError::internal("generator slot lost during execution"));
        }
        match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => {
                generator.state = GeneratorState::Done;
                generator.frame = None;
                let old = generator.result.replace(value);
                if let Some(old) = old {
                    old.drop_with_heap(self.heap);
                }
                match ret {
                    ReturnCtx::NextResult { delivery } => {
                        self.deliver_exhausted(delivery)?;
                        Ok(None)
                    }
                    other => {
                        self.dispose_ctx(other);
                        Err(ExcKind::stop_iteration())
                    }
                }
            }
            HeapData::Coroutine(coroutine) => {
                coroutine.state = GeneratorState::Done;
                coroutine.frame = None;
                self.apply_return_ctx(ret, value)
            }
            _ => {
                value.drop_with_heap(self.heap);
                self.dispose_ctx(ret);
                Err(RunError::internal("generator slot lost during execution"))
            }
        }
    }

    /// Resumes a suspended generator with the given resume ctx.
    pub(crate) fn resume_generator(&mut self, gen_id: HeapId, ret: ReturnCtx) -> RunResult<()> {
        let frame = match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => match generator.state {
                GeneratorState::Created | GeneratorState::Suspended => {
                    generator.state = GeneratorState::Running;
                    generator.frame.take()
                }
                GeneratorState::Running => {
                    self.dispose_ctx(ret);
                    return Err(ExcKind::value_error("generator already executing"));
                }
                GeneratorState::Done => None,
            },
            _ => {
                self.dispose_ctx(ret);
                return Err(RunError::internal("resume target is not a generator"));
            }
        };
        match frame {
            Some(mut frame) => {
                if let Err(breach) = self.heap.tracker().check_recursion_depth(self.frames.len()) {
                    self.park_generator_frame(gen_id, frame, GeneratorState::Suspended);
                    self.dispose_ctx(ret);
                    return Err(RunError::from(breach));
                }
                frame.ret = ret;
                frame.generator = Some(gen_id);
                self.heap.inc_ref(gen_id);
                if std::mem::take(&mut frame.resume_with_none) {
                    frame.stack.push(Value::None);
                }
                self.frames.push(frame);
                Ok(())
            }
            None => match ret {
                ReturnCtx::NextResult { delivery } => self.deliver_exhausted(delivery),
                other => {
                    self.dispose_ctx(other);
                    Err(ExcKind::stop_iteration())
                }
            },
        }
    }

    /// Delivers an iteration element per its delivery mode.
    pub(crate) fn deliver_value(&mut self, delivery: Delivery, value: Value) -> RunResult<()> {
        match delivery {
            Delivery::ForIter { .. } | Delivery::Push => {
                self.push(value);
                Ok(())
            }
            Delivery::Membership { iter, needle, negate } => {
                let found = binary::deep_eq(&value, &needle, self.heap, self.interns);
                value.drop_with_heap(self.heap);
                if found {
                    iter.drop_with_heap(self.heap);
                    needle.drop_with_heap(self.heap);
                    self.push(Value::Bool(!negate));
                    Ok(())
                } else {
                    self.membership_advance(iter, needle, negate)
                }
            }
            Delivery::ForwardYield => self.forward_yield(value),
            Delivery::Collect { iter, list, as_tuple } => {
                self.heap.on_container_insert().map_err(RunError::from)?;
                match self.heap.get_mut(list) {
                    HeapData::List(target) => target.push(value),
                    _ => {
                        value.drop_with_heap(self.heap);
                        return Err(RunError::internal("collect target is not a list"));
                    }
                }
                self.advance_with_delivery(
                    iter.clone_with_heap(self.heap),
                    Delivery::Collect { iter, list, as_tuple },
                )
            }
        }
    }

    /// Resolves iteration exhaustion per the delivery mode.
    pub(crate) fn deliver_exhausted(&mut self, delivery: Delivery) -> RunResult<()> {
        match delivery {
            Delivery::ForIter { end_target } => {
                let iterator = self.pop();
                iterator.drop_with_heap(self.heap);
                self.frame_mut().ip = end_target as usize;
                Ok(())
            }
            Delivery::Push => Err(ExcKind::stop_iteration()),
            Delivery::Membership { iter, needle, negate } => {
                iter.drop_with_heap(self.heap);
                needle.drop_with_heap(self.heap);
                self.push(Value::Bool(negate));
                Ok(())
            }
            // The parked YieldFrom re-executes and collects the
            // sub-generator's result.
            Delivery::ForwardYield => Ok(()),
            Delivery::Collect { iter, list, as_tuple } => {
                iter.drop_with_heap(self.heap);
                if as_tuple {
                    let elements = match self.heap.get_mut(list) {
                        HeapData::List(target) => std::mem::take(target.elements_mut()),
                        _ => return Err(RunError::internal("collect target is not a list")),
                    };
                    self.heap.dec_ref(list);
                    let id = self
                        .heap
                        .alloc(HeapData::Tuple(Tuple::new(elements)))
                        .map_err(RunError::from)?;
                    self.push(Value::Ref(id));
                } else {
                    self.push(Value::Ref(list));
                }
                Ok(())
            }
        }
    }

    /// Surfaces `value` as a yield of the current (generator) frame, which
    /// is already parked at its `YieldFrom` instruction.
    fn forward_yield(&mut self, value: Value) -> RunResult<()> {
        let Some(gen_id) = self.frame().generator else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("yield from outside a generator frame"));
        };
        let mut frame = self.frames.pop().expect("frame checked above");
        let ret = std::mem::replace(&mut frame.ret, ReturnCtx::Discard);
        frame.generator = None;
        // The frame re-executes YieldFrom on resume; no send value.
        frame.resume_with_none = false;
        self.park_generator_frame(gen_id, frame, GeneratorState::Suspended);
        self.heap.dec_ref(gen_id);
        match self.apply_return_ctx(ret, value)? {
            None => Ok(()),
            Some(_) => Err(RunError::internal("yield delivered to the module frame")),
        }
    }

    // ------------------------------------------------------------------
    // Gather scheduling
    // ------------------------------------------------------------------

    /// Completed gather child `child_index` with `value`.
    fn gather_child_done(&mut self, child_index: usize, value: Value) -> RunResult<Option<FrameExit>> {
        let Some(gather) = &mut self.gather else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("gather child finished without an active gather"));
        };
        let child = &mut gather.children[child_index];
        child.status = ChildStatus::Done;
        child.result = Some(value);
        gather.running = None;
        self.gather_reschedule()
    }

    /// Starts or resumes the next runnable gather child; finishes the
    /// gather when every child is done.
    ///
    /// Returns `Some(ResolveFutures)` when every remaining child is
    /// blocked.
    pub(crate) fn gather_reschedule(&mut self) -> RunResult<Option<FrameExit>> {
        loop {
            {
                let Some(gather) = &self.gather else {
                    return Ok(None);
                };
                if gather.running.is_some() {
                    return Ok(None);
                }
            }

            if self.gather.as_ref().is_some_and(ActiveGather::all_done) {
                let gather = self.gather.take().expect("presence checked");
                let mut results = Vec::with_capacity(gather.children.len());
                for child in gather.children {
                    results.push(child.result.unwrap_or(Value::None));
                }
                let id = self
                    .heap
                    .alloc(HeapData::List(List::new(results)))
                    .map_err(RunError::from)?;
                self.push(Value::Ref(id));
                return Ok(None);
            }

            // Resume the first blocked child whose future resolved.
            let resumable = {
                let gather = self.gather.as_ref().expect("presence checked");
                gather.children.iter().position(|child| {
                    matches!(child.status, ChildStatus::Blocked(call_id)
                        if self.resolved.contains_key(&call_id.raw()))
                })
            };
            if let Some(index) = resumable {
                let gather = self.gather.as_mut().expect("presence checked");
                gather.children[index].status = ChildStatus::Running;
                gather.running = Some(index);
                let frames = std::mem::take(&mut gather.children[index].frames);
                self.frames.extend(frames);
                // The reinstated frame re-executes its Await, which now
                // finds the resolved future.
                return Ok(None);
            }

            // Start the first pending child.
            let pending_child = {
                let gather = self.gather.as_mut().expect("presence checked");
                gather.children.iter_mut().enumerate().find_map(|(index, child)| {
                    (child.status == ChildStatus::Pending)
                        .then(|| (index, child.awaitable.take().expect("pending child has awaitable")))
                })
            };
            if let Some((index, awaitable)) = pending_child {
                {
                    let gather = self.gather.as_mut().expect("presence checked");
                    gather.children[index].status = ChildStatus::Running;
                    gather.running = Some(index);
                }
                if self.start_gather_child(index, awaitable)? {
                    return Ok(None);
                }
                continue;
            }

            // Everyone is blocked.
            let pending = self.gather.as_ref().expect("presence checked").pending_call_ids();
            if pending.is_empty() {
                return Err(RunError::internal("gather deadlocked with no pending calls"));
            }
            return Ok(Some(FrameExit::ResolveFutures(pending)));
        }
    }

    /// Starts one gather child. Returns `true` when frames were pushed,
    /// `false` when the child resolved without running.
    fn start_gather_child(&mut self, index: usize, awaitable: Value) -> RunResult<bool> {
        match &awaitable {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Coroutine(_)) => {
                let id = *id;
                match self.start_coroutine(id, ReturnCtx::TaskRoot { child_index: index }) {
                    Ok(()) => {
                        awaitable.drop_with_heap(self.heap);
                        Ok(true)
                    }
                    Err(err) => {
                        awaitable.drop_with_heap(self.heap);
                        self.abort_gather();
                        Err(err)
                    }
                }
            }
            Value::ExternalFuture(call_id) => {
                let call_id = *call_id;
                if let Some(outcome) = self.take_resolved(call_id) {
                    match outcome {
                        FutureOutcome::Value(value) => {
                            let gather = self.gather.as_mut().expect("gather active");
                            gather.children[index].status = ChildStatus::Done;
                            gather.children[index].result = Some(value);
                            gather.running = None;
                            Ok(false)
                        }
                        FutureOutcome::Error(payload) => {
                            // A failed child aborts the whole gather; the
                            // error propagates from the await site.
                            self.abort_gather();
                            Err(RunError::Exc(Box::new(payload.into_raise())))
                        }
                    }
                } else {
                    let gather = self.gather.as_mut().expect("gather active");
                    gather.children[index].status = ChildStatus::Blocked(call_id);
                    gather.running = None;
                    Ok(false)
                }
            }
            _ => {
                let type_name = awaitable.type_name(self.heap, self.interns).into_owned();
                awaitable.drop_with_heap(self.heap);
                self.abort_gather();
                Err(ExcKind::type_error(format!(
                    "gather expects coroutines or futures, got '{type_name}'"
                )))
            }
        }
    }

    /// Takes the resolved outcome of a call id, if present.
    pub(crate) fn take_resolved(&mut self, call_id: CallId) -> Option<FutureOutcome> {
        self.resolved.remove(&call_id.raw())
    }

    /// Starts a coroutine's frame with the given return ctx.
    pub(crate) fn start_coroutine(&mut self, id: HeapId, ret: ReturnCtx) -> RunResult<()> {
        let frame = match self.heap.get_mut(id) {
            HeapData::Coroutine(coroutine) => match coroutine.state {
                GeneratorState::Created => {
                    coroutine.state = GeneratorState::Running;
                    coroutine.frame.take()
                }
                _ => None,
            },
            _ => None,
        };
        let Some(mut frame) = frame else {
            self.dispose_ctx(ret);
            return Err(ExcKind::runtime_error("cannot reuse already awaited coroutine"));
        };
        if let Err(breach) = self.heap.tracker().check_recursion_depth(self.frames.len()) {
            self.park_generator_frame(id, frame, GeneratorState::Created);
            self.dispose_ctx(ret);
            return Err(RunError::from(breach));
        }
        frame.ret = ret;
        frame.generator = Some(id);
        self.heap.inc_ref(id);
        self.frames.push(frame);
        Ok(())
    }

    /// Handles `Await`.
    fn await_op(&mut self) -> RunResult<Option<FrameExit>> {
        enum AwaitKind {
            Future(CallId),
            Coroutine(HeapId),
            Gather(HeapId),
            Bad,
        }
        let kind = match self.peek() {
            Value::ExternalFuture(call_id) => AwaitKind::Future(*call_id),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Coroutine(_) => AwaitKind::Coroutine(*id),
                HeapData::Gather(_) => AwaitKind::Gather(*id),
                _ => AwaitKind::Bad,
            },
            _ => AwaitKind::Bad,
        };

        match kind {
            AwaitKind::Future(call_id) => {
                if let Some(outcome) = self.take_resolved(call_id) {
                    let future = self.pop();
                    future.drop_with_heap(self.heap);
                    match outcome {
                        FutureOutcome::Value(value) => {
                            self.push(value);
                            Ok(None)
                        }
                        FutureOutcome::Error(payload) => Err(RunError::Exc(Box::new(payload.into_raise()))),
                    }
                } else if self
                    .gather
                    .as_ref()
                    .is_some_and(|gather| self.frames.len() > gather.barrier)
                {
                    // Inside a gather child: park it and move on. The frame
                    // re-executes this Await on resume.
                    self.rewind();
                    let gather = self.gather.as_mut().expect("presence checked");
                    let barrier = gather.barrier;
                    let index = gather.running.take().expect("a gather child is running");
                    let parked = self.frames.split_off(barrier);
                    let gather = self.gather.as_mut().expect("presence checked");
                    gather.children[index].frames = parked;
                    gather.children[index].status = ChildStatus::Blocked(call_id);
                    self.gather_reschedule()
                } else {
                    // Top-level await on an unresolved future: suspend.
                    self.rewind();
                    Ok(Some(FrameExit::ResolveFutures(vec![call_id])))
                }
            }
            AwaitKind::Coroutine(id) => {
                let awaitable = self.pop();
                self.start_coroutine(id, ReturnCtx::Push)?;
                awaitable.drop_with_heap(self.heap);
                Ok(None)
            }
            AwaitKind::Gather(id) => {
                let awaitable = self.pop();
                let result = self.activate_gather(id);
                awaitable.drop_with_heap(self.heap);
                result
            }
            AwaitKind::Bad => self.await_type_error(),
        }
    }

    fn await_type_error(&mut self) -> RunResult<Option<FrameExit>> {
        let awaitable = self.pop();
        let type_name = awaitable.type_name(self.heap, self.interns).into_owned();
        awaitable.drop_with_heap(self.heap);
        Err(ExcKind::type_error(format!(
            "object {type_name} can't be used in 'await' expression"
        )))
    }

    /// Drives a gather handle: declaration-order stepping of its children.
    fn activate_gather(&mut self, handle_id: HeapId) -> RunResult<Option<FrameExit>> {
        if self.gather.is_some() {
            return Err(ExcKind::runtime_error("nested gather is not supported"));
        }
        let children = match self.heap.get_mut(handle_id) {
            HeapData::Gather(handle) => {
                if handle.driven {
                    return Err(ExcKind::runtime_error("cannot reuse an already awaited gather"));
                }
                handle.driven = true;
                std::mem::take(&mut handle.children)
            }
            _ => return Err(RunError::internal("gather handle lost")),
        };
        self.gather = Some(ActiveGather {
            children: children.into_iter().map(GatherChild::new).collect(),
            running: None,
            barrier: self.frames.len(),
        });
        self.gather_reschedule()
    }

    /// Aborts the active gather during unwinding (a child failed).
    pub(crate) fn abort_gather(&mut self) {
        let Some(gather) = self.gather.take() else {
            return;
        };
        for child in gather.children {
            if let Some(awaitable) = child.awaitable {
                awaitable.drop_with_heap(self.heap);
            }
            if let Some(result) = child.result {
                result.drop_with_heap(self.heap);
            }
            for mut frame in child.frames {
                let ret = std::mem::replace(&mut frame.ret, ReturnCtx::Discard);
                self.dispose_ctx(ret);
                if let Some(gen_id) = frame.generator.take() {
                    self.heap.dec_ref(gen_id);
                }
                self.dispose_frame_shell(frame);
            }
        }
    }
}
