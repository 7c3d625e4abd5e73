//! Calls: guest functions, builtins, classes, and the external bridge.
//!
//! One entry point, [`Vm::call_value`], fans out by callable shape. Guest
//! calls bind arguments into a fresh frame; builtin calls execute
//! synchronously and route their result through the pending return ctx;
//! external calls suspend the dispatcher with a host request.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use smallvec::smallvec;

use crate::{
    builtins::{Builtin, BuiltinFn},
    exc::{ExcKind, ExcPayload, RunError, RunResult},
    frame::{CallArgs, ClassCtx, Frame, ReturnCtx},
    heap::{HeapData, HeapId},
    intern::{FunctionId, StaticStr},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{ClassObject, Closure, Coroutine, Dict, Generator, HashPolicy, Instance, LongInt, Str, Tuple, Type,
        compute_c3_mro},
    value::{Value, str_content, write_repr, write_str},
};

use super::{FrameExit, Vm};

/// Shape of a callable, resolved before dispatch to keep heap borrows
/// short.
enum CallableKind {
    Function(FunctionId),
    Closure(HeapId),
    BoundMethod(HeapId),
    Class(HeapId),
    Instance(HeapId),
    Builtin(Builtin),
    External(crate::intern::ExtFunctionId),
    NotCallable,
}

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    fn callable_kind(&self, callable: &Value) -> CallableKind {
        match callable {
            Value::Function(fid) => CallableKind::Function(*fid),
            Value::Builtin(b) => CallableKind::Builtin(*b),
            Value::ExtFunction(id) => CallableKind::External(*id),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Closure(_) => CallableKind::Closure(*id),
                HeapData::BoundMethod(_) => CallableKind::BoundMethod(*id),
                HeapData::Class(_) => CallableKind::Class(*id),
                HeapData::Instance(_) => CallableKind::Instance(*id),
                _ => CallableKind::NotCallable,
            },
            _ => CallableKind::NotCallable,
        }
    }

    /// Calls `callable` with the given arguments; the produced value flows
    /// through `ctx`.
    ///
    /// Returns `Some(exit)` only for external-call suspension.
    pub(crate) fn call_value(
        &mut self,
        callable: Value,
        mut pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        ctx: ReturnCtx,
    ) -> RunResult<Option<FrameExit>> {
        match self.callable_kind(&callable) {
            CallableKind::Function(fid) => {
                callable.drop_with_heap(self.heap);
                self.call_guest_function(fid, pos, kwargs, &[], &[], &[], ctx)?;
                Ok(None)
            }
            CallableKind::Closure(id) => {
                // Unaccounted working copies: `bind_args` clones the
                // defaults it actually uses, so these never own references.
                let (fid, defaults, kw_defaults, cells) = match self.heap.get(id) {
                    HeapData::Closure(closure) => (
                        closure.func_id,
                        closure.defaults.iter().map(Value::shallow_copy).collect::<Vec<_>>(),
                        closure.kw_defaults.iter().map(Value::shallow_copy).collect::<Vec<_>>(),
                        closure.cells.clone(),
                    ),
                    _ => return Err(RunError::internal("closure vanished during call")),
                };
                let result = self.call_guest_function(fid, pos, kwargs, &defaults, &kw_defaults, &cells, ctx);
                #[cfg(feature = "ref-count-panic")]
                {
                    std::mem::forget(defaults);
                    std::mem::forget(kw_defaults);
                }
                callable.drop_with_heap(self.heap);
                result?;
                Ok(None)
            }
            CallableKind::BoundMethod(id) => {
                let (inner, receiver) = match self.heap.get(id) {
                    HeapData::BoundMethod(method) => {
                        (method.callable.clone_with_heap(self.heap), {
                            let r = method.receiver.shallow_copy();
                            if let Value::Ref(rid) = &r {
                                self.heap.inc_ref(*rid);
                            }
                            r
                        })
                    }
                    _ => return Err(RunError::internal("bound method vanished during call")),
                };
                callable.drop_with_heap(self.heap);
                let mut full = CallArgs::with_capacity(pos.len() + 1);
                full.push(receiver);
                full.append(&mut pos);
                self.call_value(inner, full, kwargs, ctx)
            }
            CallableKind::Class(id) => {
                let result = self.call_class(id, pos, kwargs, ctx);
                callable.drop_with_heap(self.heap);
                result?;
                Ok(None)
            }
            CallableKind::Instance(id) => {
                // The type-level __call__ only; an instance attribute named
                // __call__ is never consulted.
                let Some(method) = self.class_dunder(id, StaticStr::Call) else {
                    let type_name = callable.type_name(self.heap, self.interns).into_owned();
                    callable.drop_with_heap(self.heap);
                    self.drop_values(pos);
                    self.drop_kwargs(kwargs);
                    return Err(ExcKind::type_error(format!("'{type_name}' object is not callable")));
                };
                let mut full = CallArgs::with_capacity(pos.len() + 1);
                full.push(callable);
                full.append(&mut pos);
                self.call_value(method, full, kwargs, ctx)
            }
            CallableKind::Builtin(builtin) => {
                callable.drop_with_heap(self.heap);
                match builtin {
                    Builtin::Fn(f) => self.call_builtin_fn(f, pos, kwargs, ctx),
                    Builtin::Type(t) => self.call_builtin_type(t, pos, kwargs, ctx).map(|()| None),
                    Builtin::Method(m) => self.call_builtin_method(m, pos, kwargs, ctx).map(|()| None),
                    Builtin::Exc(kind) => self.call_exc_constructor(kind, pos, kwargs, ctx).map(|()| None),
                }
            }
            CallableKind::External(ext_id) => {
                callable.drop_with_heap(self.heap);
                if !matches!(ctx, ReturnCtx::Push) {
                    self.dispose_ctx(ctx);
                    self.drop_values(pos);
                    self.drop_kwargs(kwargs);
                    return Err(RunError::internal("external call outside an expression position"));
                }
                let call_id = self.allocate_call_id();
                Ok(Some(FrameExit::ExternalCall {
                    ext_id,
                    args: pos,
                    kwargs,
                    call_id,
                }))
            }
            CallableKind::NotCallable => {
                let type_name = callable.type_name(self.heap, self.interns).into_owned();
                callable.drop_with_heap(self.heap);
                self.drop_values(pos);
                self.drop_kwargs(kwargs);
                Err(ExcKind::type_error(format!("'{type_name}' object is not callable")))
            }
        }
    }

    /// Guest call in a dunder position: suspension is not possible there.
    pub(crate) fn push_call_frame(&mut self, callable: Value, args: CallArgs, ctx: ReturnCtx) -> RunResult<()> {
        match self.call_value(callable, args, Vec::new(), ctx)? {
            None => Ok(()),
            Some(_) => Err(RunError::internal("external suspension in a protocol position")),
        }
    }

    pub(crate) fn drop_kwargs(&mut self, kwargs: Vec<(String, Value)>) {
        for (_, value) in kwargs {
            value.drop_with_heap(self.heap);
        }
    }

    /// Handles the `CallKw` opcode.
    pub(crate) fn call_kw_op(&mut self, arg: u32) -> RunResult<Option<FrameExit>> {
        let npos = (arg & 0xFFFF) as usize;
        let nkw = (arg >> 16) as usize;
        let mut kw_flat = self.pop_n(nkw * 2);
        let args = self.pop_args(npos);
        let callable = self.pop();
        let mut kwargs = Vec::with_capacity(nkw);
        let mut bad_key = false;
        while !kw_flat.is_empty() {
            let value = kw_flat.pop().expect("kw pair count checked");
            let key = kw_flat.pop().expect("kw pair count checked");
            let name = str_content(&key, self.heap, self.interns).map(str::to_owned);
            key.drop_with_heap(self.heap);
            match name {
                Some(name) => kwargs.push((name, value)),
                None => {
                    value.drop_with_heap(self.heap);
                    bad_key = true;
                }
            }
        }
        if bad_key {
            self.drop_values(args);
            callable.drop_with_heap(self.heap);
            self.drop_kwargs(kwargs);
            return Err(ExcKind::type_error("keywords must be strings"));
        }
        kwargs.reverse();
        self.call_value(callable, args, kwargs, ReturnCtx::Push)
    }

    /// Handles the `CallEx` opcode (`f(*args, **kwargs)`).
    pub(crate) fn call_ex(
        &mut self,
        callable: Value,
        args_iterable: Value,
        kwargs_dict: Option<Value>,
    ) -> RunResult<Option<FrameExit>> {
        let pos = match self.collect_sync_iterable(&args_iterable)? {
            Some(elements) => {
                args_iterable.drop_with_heap(self.heap);
                CallArgs::from_vec(elements)
            }
            None => {
                let type_name = args_iterable.type_name(self.heap, self.interns).into_owned();
                args_iterable.drop_with_heap(self.heap);
                callable.drop_with_heap(self.heap);
                if let Some(kw) = kwargs_dict {
                    kw.drop_with_heap(self.heap);
                }
                return Err(ExcKind::type_error(format!(
                    "argument after * must be an iterable, not {type_name}"
                )));
            }
        };
        let mut kwargs = Vec::new();
        if let Some(kw_value) = kwargs_dict {
            let pairs: Option<Vec<(String, Value)>> = match &kw_value {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Dict(d) => {
                        let mut out = Vec::with_capacity(d.len());
                        let mut ok = true;
                        for (key, value) in d.iter() {
                            match str_content(key, self.heap, self.interns) {
                                Some(name) => out.push((name.to_owned(), value.shallow_copy())),
                                None => {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        ok.then_some(out)
                    }
                    _ => None,
                },
                _ => None,
            };
            match pairs {
                Some(pairs) => {
                    for (_, value) in &pairs {
                        if let Value::Ref(id) = value {
                            self.heap.inc_ref(*id);
                        }
                    }
                    kw_value.drop_with_heap(self.heap);
                    kwargs = pairs;
                }
                None => {
                    kw_value.drop_with_heap(self.heap);
                    callable.drop_with_heap(self.heap);
                    self.drop_values(pos);
                    return Err(ExcKind::type_error("argument after ** must be a mapping with string keys"));
                }
            }
        }
        self.call_value(callable, pos, kwargs, ReturnCtx::Push)
    }

    /// Handles `MakeFunction`.
    pub(crate) fn make_function(&mut self, arg: u32) -> RunResult<()> {
        let fid = FunctionId::from_raw(arg);
        let def = self.interns.get_function(fid);
        let free_count = usize::from(def.code.free_count());
        let num_defaults = usize::from(def.params.num_defaults);
        let num_kw_defaults = usize::from(def.params.num_kw_defaults);

        let cells: Vec<HeapId> = if free_count > 0 {
            let mut cell_values = self.pop_n(free_count);
            let mut cells = Vec::with_capacity(free_count);
            for value in cell_values.drain(..) {
                match value {
                    Value::Ref(id) => cells.push(id),
                    other => {
                        other.drop_with_heap(self.heap);
                        return Err(RunError::internal("MakeFunction expected cell references"));
                    }
                }
            }
            cells
        } else {
            Vec::new()
        };
        let kw_defaults = self.pop_n(num_kw_defaults);
        let defaults = self.pop_n(num_defaults);

        if cells.is_empty() && defaults.is_empty() && kw_defaults.is_empty() {
            self.push(Value::Function(fid));
            return Ok(());
        }
        let closure = Closure {
            func_id: fid,
            defaults,
            kw_defaults,
            cells,
        };
        let id = self.heap.alloc(HeapData::Closure(closure)).map_err(RunError::from)?;
        self.push(Value::Ref(id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Guest-function calls
    // ------------------------------------------------------------------

    /// Binds arguments and pushes (or parks) the function's frame.
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn call_guest_function(
        &mut self,
        fid: FunctionId,
        pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        defaults: &[Value],
        kw_defaults: &[Value],
        cells: &[HeapId],
        ctx: ReturnCtx,
    ) -> RunResult<()> {
        let locals = match self.bind_args(fid, pos, kwargs, defaults, kw_defaults) {
            Ok(locals) => locals,
            Err(err) => {
                self.dispose_ctx(ctx);
                return Err(err);
            }
        };
        let def = self.interns.get_function(fid);
        let own_cells = usize::from(def.code.cell_count());
        let max_stack = def.code.max_stack();
        let is_generator = def.is_generator;
        let is_async = def.is_async;

        // Own cells are freshly allocated; free cells come from the
        // closure.
        let mut frame_cells = Vec::with_capacity(own_cells + cells.len());
        for _ in 0..own_cells {
            let id = self.heap.alloc(HeapData::Cell(Value::Undefined)).map_err(RunError::from)?;
            frame_cells.push(id);
        }
        for &cell in cells {
            self.heap.inc_ref(cell);
            frame_cells.push(cell);
        }

        let frame = Frame::function(fid, locals, frame_cells, max_stack, ReturnCtx::Discard);

        if is_generator {
            let generator = Generator::new(fid, frame);
            let id = self.heap.alloc(HeapData::Generator(generator)).map_err(RunError::from)?;
            return self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ());
        }
        if is_async {
            let coroutine = Coroutine::new(fid, frame);
            let id = self.heap.alloc(HeapData::Coroutine(coroutine)).map_err(RunError::from)?;
            return self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ());
        }

        if let Err(breach) = self.heap.tracker().check_recursion_depth(self.frames.len()) {
            self.dispose_frame_shell(frame);
            self.dispose_ctx(ctx);
            return Err(RunError::from(breach));
        }
        let mut frame = frame;
        frame.ret = ctx;
        self.frames.push(frame);
        Ok(())
    }

    /// Binds call arguments into the function's local-slot layout.
    fn bind_args(
        &mut self,
        fid: FunctionId,
        pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        defaults: &[Value],
        kw_defaults: &[Value],
    ) -> RunResult<Vec<Value>> {
        let def = self.interns.get_function(fid);
        let spec = &def.params;
        let func_name = self.text(def.qualname_id);
        let npos = spec.positional.len();
        let varargs_slot = spec.varargs.then_some(npos);
        let kw_start = npos + usize::from(spec.varargs);
        let varkw_slot = spec.varkw.then_some(kw_start + spec.kw_only.len());
        let local_count = def.code.local_count();

        let mut locals: Vec<Value> = Vec::with_capacity(local_count);
        locals.resize_with(local_count, || Value::Undefined);
        let mut extra_pos: Vec<Value> = Vec::new();

        let mut fail = |vm: &mut Self, locals: Vec<Value>, extra: Vec<Value>, err: RunError| -> RunResult<Vec<Value>> {
            for value in locals {
                value.drop_with_heap(vm.heap);
            }
            for value in extra {
                value.drop_with_heap(vm.heap);
            }
            Err(err)
        };

        let nargs = pos.len();
        for (i, value) in pos.into_iter().enumerate() {
            if i < npos {
                locals[i] = value;
            } else if varargs_slot.is_some() {
                extra_pos.push(value);
            } else {
                value.drop_with_heap(self.heap);
                let err = ExcKind::type_error(format!(
                    "{func_name}() takes {npos} positional argument{} but {nargs} were given",
                    if npos == 1 { "" } else { "s" }
                ));
                return fail(self, locals, extra_pos, err);
            }
        }
        if let Some(slot) = varargs_slot {
            let id = self
                .heap
                .alloc(HeapData::Tuple(Tuple::new(std::mem::take(&mut extra_pos))))
                .map_err(RunError::from)?;
            locals[slot] = Value::Ref(id);
        }

        let mut varkw_pairs: Vec<(String, Value)> = Vec::new();
        for (name, value) in kwargs {
            let spec = &self.interns.get_function(fid).params;
            let positional_slot = spec
                .positional
                .iter()
                .position(|&param| self.text(param) == name)
                .filter(|&i| i >= usize::from(spec.pos_only));
            let kw_only_slot = spec
                .kw_only
                .iter()
                .position(|&param| self.text(param) == name)
                .map(|i| kw_start + i);
            match positional_slot.or(kw_only_slot) {
                Some(slot) => {
                    if !matches!(locals[slot], Value::Undefined) {
                        value.drop_with_heap(self.heap);
                        let err = ExcKind::type_error(format!(
                            "{func_name}() got multiple values for argument '{name}'"
                        ));
                        let extra = varkw_pairs.into_iter().map(|(_, v)| v).collect();
                        return fail(self, locals, extra, err);
                    }
                    locals[slot] = value;
                }
                None if varkw_slot.is_some() => varkw_pairs.push((name, value)),
                None => {
                    value.drop_with_heap(self.heap);
                    let err = ExcKind::type_error(format!(
                        "{func_name}() got an unexpected keyword argument '{name}'"
                    ));
                    let extra = varkw_pairs.into_iter().map(|(_, v)| v).collect();
                    return fail(self, locals, extra, err);
                }
            }
        }
        if let Some(slot) = varkw_slot {
            let mut dict = Dict::with_capacity(varkw_pairs.len());
            for (name, value) in varkw_pairs {
                let key_id = self.heap.alloc(HeapData::Str(Str::new(name))).map_err(RunError::from)?;
                let key = Value::Ref(key_id);
                let hash = self.hash_ready(&key)?;
                if let Some(old) = dict.insert(key, hash, value, self.heap, self.interns) {
                    old.drop_with_heap(self.heap);
                }
            }
            let id = self.heap.alloc(HeapData::Dict(dict)).map_err(RunError::from)?;
            locals[slot] = Value::Ref(id);
        }

        // Defaults fill trailing unbound parameters.
        let spec = &self.interns.get_function(fid).params;
        let first_default = npos - defaults.len().min(npos);
        for (offset, default) in defaults.iter().enumerate() {
            let slot = first_default + offset;
            if matches!(locals[slot], Value::Undefined) {
                locals[slot] = default.clone_with_heap(self.heap);
            }
        }
        let first_kw_default = spec.kw_only.len() - kw_defaults.len().min(spec.kw_only.len());
        for (offset, default) in kw_defaults.iter().enumerate() {
            let slot = kw_start + first_kw_default + offset;
            if matches!(locals[slot], Value::Undefined) {
                locals[slot] = default.clone_with_heap(self.heap);
            }
        }

        // Every parameter slot must be bound now.
        let spec = &self.interns.get_function(fid).params;
        let mut missing: Vec<String> = Vec::new();
        for (i, &param) in spec.positional.iter().enumerate() {
            if matches!(locals[i], Value::Undefined) {
                missing.push(format!("'{}'", self.text(param)));
            }
        }
        for (i, &param) in spec.kw_only.iter().enumerate() {
            if matches!(locals[kw_start + i], Value::Undefined) {
                missing.push(format!("'{}'", self.text(param)));
            }
        }
        if !missing.is_empty() {
            let err = ExcKind::type_error(format!(
                "{func_name}() missing {} required argument{}: {}",
                missing.len(),
                if missing.len() == 1 { "" } else { "s" },
                missing.join(", ")
            ));
            return fail(self, locals, Vec::new(), err);
        }

        Ok(locals)
    }

    // ------------------------------------------------------------------
    // Class instantiation
    // ------------------------------------------------------------------

    fn call_class(
        &mut self,
        class_id: HeapId,
        pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        ctx: ReturnCtx,
    ) -> RunResult<()> {
        let (exc_kind, class_name) = match self.heap.get(class_id) {
            HeapData::Class(class) => (class.exc_kind, self.text(class.name_id).to_owned()),
            _ => return Err(RunError::internal("class vanished during instantiation")),
        };

        let has_init = self.lookup_on_class_mro(class_id, self.text(StaticStr::Init.into())).is_some();
        let has_new = self.lookup_on_class_mro(class_id, self.text(StaticStr::New.into())).is_some();

        // Exception classes without a custom __init__ build their payload
        // directly.
        if let Some(kind) = exc_kind
            && !has_init
            && !has_new
        {
            self.drop_kwargs(kwargs);
            let message = self.exc_message_from_args(pos)?;
            let mut payload = ExcPayload::new(kind);
            payload.class_name = Some(class_name);
            payload.message = message;
            payload.class_slot = Some((class_id.index(), self.heap.uid_of(class_id)));
            let id = self.heap.alloc(HeapData::Exception(payload)).map_err(RunError::from)?;
            return self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ());
        }

        if !matches!(ctx, ReturnCtx::Push) {
            self.dispose_ctx(ctx);
            self.drop_values(pos);
            self.drop_kwargs(kwargs);
            return Err(RunError::internal("class instantiation outside an expression position"));
        }

        if has_new {
            let method = self
                .lookup_on_class_mro(class_id, self.text(StaticStr::New.into()))
                .map(|m| m.clone_with_heap(self.heap))
                .expect("presence checked");
            let init_args: Vec<Value> = pos.iter().map(|v| v.clone_with_heap(self.heap)).collect();
            self.heap.inc_ref(class_id);
            let mut full = CallArgs::with_capacity(pos.len() + 1);
            full.push(Value::Ref(class_id));
            full.extend(pos);
            self.drop_kwargs(kwargs);
            return self.push_call_frame(method, full, ReturnCtx::FinishNew { class_id, init_args });
        }

        // Default __new__: allocate the instance.
        self.heap.inc_ref(class_id);
        let instance = Instance::new(class_id);
        let instance_id = self.heap.alloc(HeapData::Instance(instance)).map_err(RunError::from)?;
        let instance_value = Value::Ref(instance_id);

        if has_init {
            let method = self
                .lookup_on_class_mro(class_id, self.text(StaticStr::Init.into()))
                .map(|m| m.clone_with_heap(self.heap))
                .expect("presence checked");
            let receiver = instance_value.clone_with_heap(self.heap);
            let mut full = CallArgs::with_capacity(pos.len() + 1);
            full.push(receiver);
            full.extend(pos);
            match self.call_value(method, full, kwargs, ReturnCtx::FinishInit { instance: instance_value })? {
                None => Ok(()),
                Some(_) => Err(RunError::internal("external suspension inside __init__ dispatch")),
            }
        } else if pos.is_empty() && kwargs.is_empty() {
            self.push(instance_value);
            Ok(())
        } else {
            self.drop_values(pos);
            self.drop_kwargs(kwargs);
            instance_value.drop_with_heap(self.heap);
            Err(ExcKind::type_error(format!("{class_name}() takes no arguments")))
        }
    }

    /// Resolves a guest `__new__` result: continue into `__init__` when the
    /// result is an instance of the requested class, otherwise skip it.
    pub(crate) fn finish_new(&mut self, class_id: HeapId, init_args: Vec<Value>, value: Value) -> RunResult<()> {
        let is_ours = match &value {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Instance(instance) => {
                    instance.class_id == class_id
                        || match self.heap.get(instance.class_id) {
                            HeapData::Class(c) => c.mro.contains(&class_id),
                            _ => false,
                        }
                }
                _ => false,
            },
            _ => false,
        };
        self.heap.dec_ref(class_id);
        if !is_ours {
            // A foreign instance skips __init__ by specification.
            self.drop_values(init_args);
            self.push(value);
            return Ok(());
        }
        let has_init = self.lookup_on_class_mro(class_id, self.text(StaticStr::Init.into())).is_some();
        if !has_init {
            self.drop_values(init_args);
            self.push(value);
            return Ok(());
        }
        let method = self
            .lookup_on_class_mro(class_id, self.text(StaticStr::Init.into()))
            .map(|m| m.clone_with_heap(self.heap))
            .expect("presence checked");
        let receiver = value.clone_with_heap(self.heap);
        let mut full = CallArgs::with_capacity(init_args.len() + 1);
        full.push(receiver);
        full.extend(init_args);
        self.push_call_frame(method, full, ReturnCtx::FinishInit { instance: value })
    }

    fn exc_message_from_args(&mut self, pos: CallArgs) -> RunResult<Option<String>> {
        let mut pos = pos;
        match pos.len() {
            0 => Ok(None),
            _ => {
                let first = pos.remove(0);
                self.drop_values(pos);
                let mut message = String::new();
                write_str(&mut message, &first, self.heap, self.interns);
                first.drop_with_heap(self.heap);
                Ok(Some(message))
            }
        }
    }

    // ------------------------------------------------------------------
    // Class creation (`BuildClass` + class-body completion)
    // ------------------------------------------------------------------

    /// Handles `BuildClass`: stack is `[body_fn, name, base0..baseN]`.
    pub(crate) fn build_class(&mut self, nbases: u32) -> RunResult<()> {
        let bases = self.pop_n(nbases as usize);
        let name = self.pop();
        let body = self.pop();

        let Value::InternStr(name_id) = name else {
            name.drop_with_heap(self.heap);
            body.drop_with_heap(self.heap);
            self.drop_values(bases);
            return Err(RunError::internal("class name must be an interned string"));
        };
        let Value::Function(func_id) = body else {
            body.drop_with_heap(self.heap);
            self.drop_values(bases);
            return Err(RunError::internal("class body must be a plain function"));
        };

        let def = self.interns.get_function(func_id);
        let local_count = def.code.local_count();
        let max_stack = def.code.max_stack();
        if let Err(breach) = self.heap.tracker().check_recursion_depth(self.frames.len()) {
            self.drop_values(bases);
            return Err(RunError::from(breach));
        }
        let mut locals = Vec::with_capacity(local_count);
        locals.resize_with(local_count, || Value::Undefined);
        let frame = Frame::function(
            func_id,
            locals,
            Vec::new(),
            max_stack,
            ReturnCtx::FinishClass(Box::new(ClassCtx { name_id, bases, func_id })),
        );
        self.frames.push(frame);
        Ok(())
    }

    /// Builds the class object from a completed class-body frame.
    pub(crate) fn finish_class(&mut self, ctx: ClassCtx, frame: Frame, body_result: Value) -> RunResult<()> {
        body_result.drop_with_heap(self.heap);

        // Partition the written bases.
        let mut base_ids: Vec<HeapId> = Vec::new();
        let mut exc_kind: Option<ExcKind> = None;
        for base in &ctx.bases {
            match base {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Class(base_class) => {
                        if exc_kind.is_none() {
                            exc_kind = base_class.exc_kind;
                        }
                        base_ids.push(*id);
                    }
                    _ => {
                        let type_name = base.type_name(self.heap, self.interns).into_owned();
                        self.abandon_class(ctx, frame);
                        return Err(ExcKind::type_error(format!(
                            "cannot create a subclass of '{type_name}'"
                        )));
                    }
                },
                Value::Builtin(Builtin::Exc(kind)) => {
                    if exc_kind.is_none() {
                        exc_kind = Some(*kind);
                    }
                }
                Value::Builtin(Builtin::Type(Type::Object)) => {}
                other => {
                    let type_name = other.type_name(self.heap, self.interns).into_owned();
                    self.abandon_class(ctx, frame);
                    return Err(ExcKind::type_error(format!(
                        "cannot create a subclass of '{type_name}'"
                    )));
                }
            }
        }

        // C3-linearize the ancestors.
        let base_mros: Vec<Vec<HeapId>> = base_ids
            .iter()
            .map(|&base| match self.heap.get(base) {
                HeapData::Class(c) => {
                    let mut linearization = Vec::with_capacity(c.mro.len() + 1);
                    linearization.push(base);
                    linearization.extend(c.mro.iter().copied());
                    linearization
                }
                _ => vec![base],
            })
            .collect();
        let Some(mro) = compute_c3_mro(&base_ids, &base_mros) else {
            self.abandon_class(ctx, frame);
            return Err(ExcKind::type_error(
                "Cannot create a consistent method resolution order (MRO) for bases",
            ));
        };

        let uid = self.heap.fresh_uid();
        let mut class = ClassObject::new(ctx.name_id, uid, base_ids.clone(), mro.clone());
        class.exc_kind = exc_kind;

        // Extract the class namespace from the body frame's locals.
        let code = self.code_for(frame.code_ref);
        let local_names = code.local_names().to_vec();
        let Frame { locals, stack, cells, .. } = frame;
        for value in stack {
            value.drop_with_heap(self.heap);
        }
        for cell in cells {
            self.heap.dec_ref(cell);
        }
        let mut set_name_hooks: Vec<(String, Value)> = Vec::new();
        for (slot, value) in locals.into_iter().enumerate() {
            if matches!(value, Value::Undefined) {
                continue;
            }
            let name = self.text(local_names[slot]).to_owned();
            // Descriptor values with a __set_name__ get a hook call after
            // the class is linked.
            if let Value::Ref(id) = &value
                && matches!(self.heap.get(*id), HeapData::Instance(_))
                && self.class_dunder(*id, StaticStr::SetName).is_some()
            {
                set_name_hooks.push((name.clone(), value.clone_with_heap(self.heap)));
            }
            if let Some(old) = class.set_local(name, value) {
                old.drop_with_heap(self.heap);
            }
        }

        // Hash policy: explicit __hash__ (None or callable) wins, then the
        // eq-without-hash rule, then inheritance.
        let own_hash = class.get_local(self.text(StaticStr::Hash.into()));
        let own_eq = class.get_local(self.text(StaticStr::Eq.into())).is_some();
        class.hash_policy = match own_hash {
            Some(Value::None) => HashPolicy::Unhashable,
            Some(_) => HashPolicy::Defined,
            None if own_eq => HashPolicy::Unhashable,
            None => {
                let mut inherited = HashPolicy::Identity;
                for &ancestor in &mro {
                    if let HeapData::Class(ancestor_class) = self.heap.get(ancestor) {
                        if ancestor_class.hash_policy != HashPolicy::Identity {
                            inherited = ancestor_class.hash_policy;
                            break;
                        }
                        // An ancestor redefining equality without hashing
                        // also poisons the subclass.
                    }
                }
                inherited
            }
        };

        // Slots declaration, when present.
        let slot_names: Option<Vec<String>> = class
            .get_local(self.text(StaticStr::Slots.into()))
            .and_then(|v| self.slot_names_of(v));
        class.slots = slot_names;

        // The stored MRO and bases own their references.
        for &ancestor in &mro {
            self.heap.inc_ref(ancestor);
        }
        // `ctx.bases` ownership transfers to `class.bases` for heap
        // classes; immediates need no accounting.
        let mut retained = 0usize;
        for base in ctx.bases {
            match base {
                Value::Ref(_) => {
                    // The id was copied into class.bases above.
                    #[cfg(feature = "ref-count-panic")]
                    std::mem::forget(base);
                    retained += 1;
                }
                other => other.drop_with_heap(self.heap),
            }
        }
        debug_assert_eq!(retained, base_ids.len());

        let class_id = self.heap.alloc(HeapData::Class(class)).map_err(RunError::from)?;
        let class_value = Value::Ref(class_id);

        // Deliver the class, then queue the post-creation hooks. Frames run
        // last-pushed-first, so __init_subclass__ goes in before the
        // __set_name__ hooks.
        self.push(class_value);

        if let Some(hook) = self
            .lookup_inherited_only(class_id, self.text(StaticStr::InitSubclass.into()))
        {
            let receiver = Value::Ref(class_id);
            self.heap.inc_ref(class_id);
            self.push_call_frame(hook, smallvec![receiver], ReturnCtx::Discard)?;
        }
        for (attr_name, descriptor) in set_name_hooks.into_iter().rev() {
            let Some(method) = (match &descriptor {
                Value::Ref(id) => self.class_dunder(*id, StaticStr::SetName),
                _ => None,
            }) else {
                descriptor.drop_with_heap(self.heap);
                continue;
            };
            let owner = Value::Ref(class_id);
            self.heap.inc_ref(class_id);
            let name_id = self.heap.alloc(HeapData::Str(Str::new(attr_name))).map_err(RunError::from)?;
            self.push_call_frame(method, smallvec![descriptor, owner, Value::Ref(name_id)], ReturnCtx::Discard)?;
        }
        Ok(())
    }

    /// Looks a name up on ancestors only (for `__init_subclass__`, which
    /// must not fire for the class defining it).
    fn lookup_inherited_only(&self, class_id: HeapId, name: &str) -> Option<Value> {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            return None;
        };
        for &ancestor in &class.mro {
            if let HeapData::Class(ancestor_class) = self.heap.get(ancestor)
                && let Some(value) = ancestor_class.get_local(name)
            {
                return Some(value.clone_with_heap(self.heap));
            }
        }
        None
    }

    fn slot_names_of(&self, value: &Value) -> Option<Vec<String>> {
        match value {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(t) => t
                    .elements()
                    .iter()
                    .map(|v| str_content(v, self.heap, self.interns).map(str::to_owned))
                    .collect(),
                HeapData::List(l) => l
                    .elements()
                    .iter()
                    .map(|v| str_content(v, self.heap, self.interns).map(str::to_owned))
                    .collect(),
                HeapData::Str(s) => Some(vec![s.as_str().to_owned()]),
                _ => None,
            },
            Value::InternStr(sid) => Some(vec![self.interns.get_str(*sid).to_owned()]),
            _ => None,
        }
    }

    fn abandon_class(&mut self, ctx: ClassCtx, frame: Frame) {
        self.drop_values(ctx.bases);
        self.dispose_frame_shell(frame);
    }

    // ------------------------------------------------------------------
    // Instance protocol helpers
    // ------------------------------------------------------------------

    /// Pushes a guest `__hash__` frame for an instance.
    pub(crate) fn call_instance_hash(&mut self, instance_id: HeapId, push: bool) -> RunResult<()> {
        let Some(method) = self.class_dunder(instance_id, StaticStr::Hash) else {
            return Err(RunError::internal("hash dunder requested without a definition"));
        };
        self.heap.inc_ref(instance_id);
        self.push_call_frame(
            method,
            smallvec![Value::Ref(instance_id)],
            ReturnCtx::HashResult {
                target: instance_id,
                push,
            },
        )
    }

    /// Truthiness of an instance via `__bool__`/`__len__`; the caller has
    /// rewound so the branch re-executes over the pushed bool.
    pub(crate) fn instance_truthiness(&mut self, value: Value) -> RunResult<()> {
        let Some(class_id) = self.instance_class(&value) else {
            value.drop_with_heap(self.heap);
            self.push(Value::Bool(true));
            return Ok(());
        };
        if let Some(method) = self.lookup_on_class_mro(class_id, self.text(StaticStr::Bool.into())) {
            let callable = method.clone_with_heap(self.heap);
            return self.push_call_frame(callable, smallvec![value], ReturnCtx::StrictBool { negate: false });
        }
        if let Some(method) = self.lookup_on_class_mro(class_id, self.text(StaticStr::Len.into())) {
            let callable = method.clone_with_heap(self.heap);
            return self.push_call_frame(
                callable,
                smallvec![value],
                ReturnCtx::LenResult {
                    for_bool: true,
                    negate: false,
                },
            );
        }
        value.drop_with_heap(self.heap);
        self.push(Value::Bool(true));
        Ok(())
    }

    /// Applies a builtin callable synchronously (map/filter helpers).
    pub(crate) fn call_builtin_sync(&mut self, func: &Value, args: CallArgs) -> RunResult<Value> {
        let Value::Builtin(builtin) = func else {
            self.drop_values(args);
            return Err(ExcKind::type_error("expected a builtin callable"));
        };
        match builtin {
            Builtin::Fn(BuiltinFn::Len) => {
                let mut args = args;
                let value = args.pop().ok_or_else(|| ExcKind::type_error("len() takes one argument"))?;
                let len = value.py_len(self.heap, self.interns);
                let type_name = value.type_name(self.heap, self.interns).into_owned();
                value.drop_with_heap(self.heap);
                len.map(|l| Value::Int(l as i64))
                    .ok_or_else(|| ExcKind::type_error(format!("object of type '{type_name}' has no len()")))
            }
            Builtin::Fn(BuiltinFn::Repr) => {
                let mut args = args;
                let value = args.pop().ok_or_else(|| ExcKind::type_error("repr() takes one argument"))?;
                let mut out = String::new();
                write_repr(&mut out, &value, self.heap, self.interns, &mut Vec::new());
                value.drop_with_heap(self.heap);
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            Builtin::Fn(BuiltinFn::Abs) => {
                let mut args = args;
                let value = args.pop().ok_or_else(|| ExcKind::type_error("abs() takes one argument"))?;
                self.abs_value(value)
            }
            Builtin::Type(t) => {
                // Constructors usable in sync positions (str/int/float/bool).
                let t = *t;
                self.sync_constructor(t, args)
            }
            _ => {
                self.drop_values(args);
                Err(ExcKind::type_error("builtin is not usable in this position"))
            }
        }
    }

    pub(super) fn abs_value(&mut self, value: Value) -> RunResult<Value> {
        use crate::value::Numeric;
        let result = match Numeric::of(&value, self.heap) {
            Some(Numeric::Int(x)) => match x.checked_abs() {
                Some(v) => Some(Value::Int(v)),
                None => Some(LongInt::new(-BigInt::from(x)).into_value(self.heap)?),
            },
            Some(Numeric::Float(x)) => Some(Value::Float(x.abs())),
            Some(Numeric::Big(big)) => {
                let magnitude = num_traits::Signed::abs(big);
                Some(LongInt::new(magnitude).into_value(self.heap)?)
            }
            None => None,
        };
        let type_name = value.type_name(self.heap, self.interns).into_owned();
        value.drop_with_heap(self.heap);
        result.ok_or_else(|| ExcKind::type_error(format!("bad operand type for abs(): '{type_name}'")))
    }

    fn sync_constructor(&mut self, t: Type, mut args: CallArgs) -> RunResult<Value> {
        match t {
            Type::Str => {
                let out = match args.pop() {
                    Some(value) => {
                        self.drop_values(args);
                        let mut out = String::new();
                        write_str(&mut out, &value, self.heap, self.interns);
                        value.drop_with_heap(self.heap);
                        out
                    }
                    None => String::new(),
                };
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            Type::Int => {
                let value = args.pop().unwrap_or(Value::Int(0));
                self.drop_values(args);
                self.int_of(value)
            }
            Type::Float => {
                let value = args.pop().unwrap_or(Value::Float(0.0));
                self.drop_values(args);
                self.float_of(value)
            }
            Type::Bool => {
                let value = args.pop().unwrap_or(Value::Bool(false));
                self.drop_values(args);
                let truth = value.truthy(self.heap, self.interns).unwrap_or(true);
                value.drop_with_heap(self.heap);
                Ok(Value::Bool(truth))
            }
            _ => {
                self.drop_values(args);
                Err(ExcKind::type_error("constructor is not usable in this position"))
            }
        }
    }

    pub(crate) fn int_of(&mut self, value: Value) -> RunResult<Value> {
        let result = match &value {
            Value::Bool(b) => Some(Value::Int(i64::from(*b))),
            Value::Int(i) => Some(Value::Int(*i)),
            Value::Float(x) => {
                let truncated = x.trunc();
                if truncated.is_finite() {
                    if truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64 {
                        Some(Value::Int(truncated as i64))
                    } else {
                        Some(LongInt::new(BigInt::from(truncated as i128)).into_value(self.heap)?)
                    }
                } else {
                    value.drop_with_heap(self.heap);
                    return Err(ExcKind::value_error("cannot convert float infinity or NaN to integer"));
                }
            }
            _ => {
                if let Some(text) = str_content(&value, self.heap, self.interns) {
                    let trimmed = text.trim();
                    match trimmed.parse::<i64>() {
                        Ok(i) => Some(Value::Int(i)),
                        Err(_) => match trimmed.parse::<BigInt>() {
                            Ok(big) => Some(LongInt::new(big).into_value(self.heap)?),
                            Err(_) => None,
                        },
                    }
                } else if let Value::Ref(id) = &value {
                    match self.heap.get(*id) {
                        HeapData::LongInt(li) => {
                            let clone = li.clone();
                            Some(clone.into_value(self.heap)?)
                        }
                        _ => None,
                    }
                } else {
                    None
                }
            }
        };
        match result {
            Some(out) => {
                value.drop_with_heap(self.heap);
                Ok(out)
            }
            None => {
                let mut repr = String::new();
                write_repr(&mut repr, &value, self.heap, self.interns, &mut Vec::new());
                let type_name = value.type_name(self.heap, self.interns).into_owned();
                value.drop_with_heap(self.heap);
                Err(ExcKind::value_error(format!(
                    "invalid literal for int() with base 10: {repr} (type {type_name})"
                )))
            }
        }
    }

    pub(crate) fn float_of(&mut self, value: Value) -> RunResult<Value> {
        let result = match &value {
            Value::Bool(b) => Some(Value::Float(f64::from(u8::from(*b)))),
            Value::Int(i) => Some(Value::Float(*i as f64)),
            Value::Float(x) => Some(Value::Float(*x)),
            _ => {
                if let Some(text) = str_content(&value, self.heap, self.interns) {
                    text.trim().parse::<f64>().ok().map(Value::Float)
                } else if let Value::Ref(id) = &value {
                    match self.heap.get(*id) {
                        HeapData::LongInt(li) => li.inner().to_f64().map(Value::Float),
                        _ => None,
                    }
                } else {
                    None
                }
            }
        };
        match result {
            Some(out) => {
                value.drop_with_heap(self.heap);
                Ok(out)
            }
            None => {
                let type_name = value.type_name(self.heap, self.interns).into_owned();
                value.drop_with_heap(self.heap);
                Err(ExcKind::type_error(format!(
                    "float() argument must be a string or a real number, not '{type_name}'"
                )))
            }
        }
    }
}

