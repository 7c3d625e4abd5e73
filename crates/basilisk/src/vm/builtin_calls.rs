//! Execution of the builtin callables: functions, type constructors,
//! builtin-type methods, and exception constructors.
//!
//! Builtins run synchronously; a handful interpose a guest frame (`len` on
//! an instance, `hash` with a guest `__hash__`, `str` with `__str__`) by
//! pushing it with the appropriate return ctx.

use std::borrow::Cow;

use smallvec::smallvec;

use crate::{
    builtins::{Builtin, BuiltinFn, BuiltinMethod},
    exc::{ExcKind, ExcPayload, RunError, RunResult},
    frame::{CallArgs, Delivery, ReturnCtx},
    heap::{HeapData, HeapId},
    intern::StaticStr,
    io::PrintWriter,
    resource::ResourceTracker,
    task::GatherHandle,
    types::{Bytes, Dict, IterState, List, Range, Set, Slice, Str, Tuple, Type},
    value::{HashAttempt, Value, as_index, str_content, write_repr, write_str},
};

use super::{FrameExit, FutureOutcome, Vm};

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Runs a builtin function; the result flows through `ctx`.
    pub(crate) fn call_builtin_fn(
        &mut self,
        f: BuiltinFn,
        mut pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        ctx: ReturnCtx,
    ) -> RunResult<Option<FrameExit>> {
        match f {
            BuiltinFn::Print => {
                let result = self.builtin_print(pos, kwargs);
                result?;
                self.apply_return_ctx(ctx, Value::None)
            }
            BuiltinFn::Len => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "len")?;
                if let Some(len) = value.py_len(self.heap, self.interns) {
                    value.drop_with_heap(self.heap);
                    return self.apply_return_ctx(ctx, Value::Int(len as i64));
                }
                if let Some(class_id) = self.instance_class(&value)
                    && let Some(method) = self
                        .lookup_on_class_mro(class_id, self.text(StaticStr::Len.into()))
                        .map(|m| m.clone_with_heap(self.heap))
                {
                    self.dispose_ctx(ctx);
                    self.push_call_frame(
                        method,
                        smallvec![value],
                        ReturnCtx::LenResult {
                            for_bool: false,
                            negate: false,
                        },
                    )?;
                    return Ok(None);
                }
                let type_name = value.type_name(self.heap, self.interns).into_owned();
                value.drop_with_heap(self.heap);
                self.dispose_ctx(ctx);
                Err(ExcKind::type_error(format!("object of type '{type_name}' has no len()")))
            }
            BuiltinFn::Repr => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "repr")?;
                if let Some(class_id) = self.instance_class(&value)
                    && let Some(method) = self
                        .lookup_on_class_mro(class_id, self.text(StaticStr::Repr.into()))
                        .map(|m| m.clone_with_heap(self.heap))
                {
                    self.dispose_ctx(ctx);
                    self.push_call_frame(method, smallvec![value], ReturnCtx::StrictStr)?;
                    return Ok(None);
                }
                let mut out = String::new();
                write_repr(&mut out, &value, self.heap, self.interns, &mut Vec::new());
                value.drop_with_heap(self.heap);
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id))
            }
            BuiltinFn::Hash => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "hash")?;
                match value.hash_key(self.heap, self.interns) {
                    HashAttempt::Ready(hash) => {
                        value.drop_with_heap(self.heap);
                        self.apply_return_ctx(ctx, Value::Int(i64::from_ne_bytes(hash.to_ne_bytes())))
                    }
                    HashAttempt::Unhashable(type_name) => {
                        value.drop_with_heap(self.heap);
                        self.dispose_ctx(ctx);
                        Err(ExcKind::type_error(format!("unhashable type: '{type_name}'")))
                    }
                    HashAttempt::NeedDunder(instance_id) => {
                        value.drop_with_heap(self.heap);
                        self.dispose_ctx(ctx);
                        self.call_instance_hash(instance_id, true)?;
                        Ok(None)
                    }
                }
            }
            BuiltinFn::Iter => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "iter")?;
                self.dispose_ctx(ctx);
                if let Some(iterator) = self.get_iter(value)? {
                    self.push(iterator);
                }
                Ok(None)
            }
            BuiltinFn::Next => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "next")?;
                self.dispose_ctx(ctx);
                self.advance_with_delivery(value, Delivery::Push)?;
                Ok(None)
            }
            BuiltinFn::Isinstance => {
                self.drop_kwargs(kwargs);
                let (value, classinfo) = take_pair(self, pos, "isinstance")?;
                let verdict = self.isinstance_check(&value, &classinfo)?;
                value.drop_with_heap(self.heap);
                classinfo.drop_with_heap(self.heap);
                self.apply_return_ctx(ctx, Value::Bool(verdict))
            }
            BuiltinFn::Issubclass => {
                self.drop_kwargs(kwargs);
                let (sub, classinfo) = take_pair(self, pos, "issubclass")?;
                let verdict = self.issubclass_check(&sub, &classinfo)?;
                sub.drop_with_heap(self.heap);
                classinfo.drop_with_heap(self.heap);
                self.apply_return_ctx(ctx, Value::Bool(verdict))
            }
            BuiltinFn::Callable => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "callable")?;
                let verdict = match &value {
                    Value::Function(_) | Value::ExtFunction(_) | Value::Builtin(_) => true,
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Closure(_) | HeapData::BoundMethod(_) | HeapData::Class(_) => true,
                        HeapData::Instance(instance) => {
                            let class_id = instance.class_id;
                            self.lookup_on_class_mro(class_id, self.text(StaticStr::Call.into())).is_some()
                        }
                        _ => false,
                    },
                    _ => false,
                };
                value.drop_with_heap(self.heap);
                self.apply_return_ctx(ctx, Value::Bool(verdict))
            }
            BuiltinFn::Getattr => {
                self.drop_kwargs(kwargs);
                let (obj, name) = take_pair(self, pos, "getattr")?;
                let Some(attr) = str_content(&name, self.heap, self.interns).map(str::to_owned) else {
                    obj.drop_with_heap(self.heap);
                    name.drop_with_heap(self.heap);
                    self.dispose_ctx(ctx);
                    return Err(ExcKind::type_error("attribute name must be string"));
                };
                name.drop_with_heap(self.heap);
                self.dispose_ctx(ctx);
                self.load_attr_named(obj, &attr)?;
                Ok(None)
            }
            BuiltinFn::Setattr => {
                self.drop_kwargs(kwargs);
                let (obj, name, value) = take_triple(self, pos, "setattr")?;
                let Some(attr) = str_content(&name, self.heap, self.interns).map(str::to_owned) else {
                    self.drop_values(vec![obj, name, value]);
                    self.dispose_ctx(ctx);
                    return Err(ExcKind::type_error("attribute name must be string"));
                };
                name.drop_with_heap(self.heap);
                self.store_attr_named(obj, &attr, value)?;
                self.apply_return_ctx(ctx, Value::None)
            }
            BuiltinFn::Hasattr => {
                self.drop_kwargs(kwargs);
                let (obj, name) = take_pair(self, pos, "hasattr")?;
                let Some(attr) = str_content(&name, self.heap, self.interns).map(str::to_owned) else {
                    obj.drop_with_heap(self.heap);
                    name.drop_with_heap(self.heap);
                    self.dispose_ctx(ctx);
                    return Err(ExcKind::type_error("attribute name must be string"));
                };
                let verdict = self.has_attr_static(&obj, &attr);
                obj.drop_with_heap(self.heap);
                name.drop_with_heap(self.heap);
                self.apply_return_ctx(ctx, Value::Bool(verdict))
            }
            BuiltinFn::Abs => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "abs")?;
                let result = self.abs_value(value)?;
                self.apply_return_ctx(ctx, result)
            }
            BuiltinFn::Zip => {
                self.drop_kwargs(kwargs);
                let mut iters = Vec::with_capacity(pos.len());
                let mut sources = pos.drain(..);
                for source in sources.by_ref() {
                    match self.get_iter(source)? {
                        Some(iterator) => iters.push(iterator),
                        None => {
                            // A guest __iter__ frame cannot thread through a
                            // zip construction.
                            self.drop_values(iters);
                            for rest in sources {
                                rest.drop_with_heap(self.heap);
                            }
                            self.dispose_ctx(ctx);
                            return Err(ExcKind::type_error(
                                "zip over guest-defined iterables is not supported",
                            ));
                        }
                    }
                }
                let view = self.alloc_iter_view(IterState::Zip { iters })?;
                self.apply_return_ctx(ctx, view)
            }
            BuiltinFn::Enumerate => {
                self.drop_kwargs(kwargs);
                let mut pos = pos;
                let start = if pos.len() == 2 {
                    let start_value = pos.pop().expect("length checked");
                    let start = as_index(&start_value, self.heap).unwrap_or(0);
                    start_value.drop_with_heap(self.heap);
                    start
                } else {
                    0
                };
                let source = take_single(self, pos, "enumerate")?;
                match self.get_iter(source)? {
                    Some(inner) => {
                        let view = self.alloc_iter_view(IterState::Enumerate { inner, count: start })?;
                        self.apply_return_ctx(ctx, view)
                    }
                    None => {
                        self.dispose_ctx(ctx);
                        Err(ExcKind::type_error(
                            "enumerate over guest-defined iterables is not supported",
                        ))
                    }
                }
            }
            BuiltinFn::Reversed => {
                self.drop_kwargs(kwargs);
                let source = take_single(self, pos, "reversed")?;
                let Some(remaining) = self.reversible_len(&source) else {
                    let type_name = source.type_name(self.heap, self.interns).into_owned();
                    source.drop_with_heap(self.heap);
                    self.dispose_ctx(ctx);
                    return Err(ExcKind::type_error(format!("'{type_name}' object is not reversible")));
                };
                let view = self.alloc_iter_view(IterState::Reversed { source, remaining })?;
                self.apply_return_ctx(ctx, view)
            }
            BuiltinFn::Map => {
                self.drop_kwargs(kwargs);
                let (func, source) = take_pair(self, pos, "map")?;
                match self.get_iter(source)? {
                    Some(inner) => {
                        let view = self.alloc_iter_view(IterState::Map { func, inner })?;
                        self.apply_return_ctx(ctx, view)
                    }
                    None => {
                        func.drop_with_heap(self.heap);
                        self.dispose_ctx(ctx);
                        Err(ExcKind::type_error("map over guest-defined iterables is not supported"))
                    }
                }
            }
            BuiltinFn::Filter => {
                self.drop_kwargs(kwargs);
                let (func, source) = take_pair(self, pos, "filter")?;
                match self.get_iter(source)? {
                    Some(inner) => {
                        let view = self.alloc_iter_view(IterState::Filter { func, inner })?;
                        self.apply_return_ctx(ctx, view)
                    }
                    None => {
                        func.drop_with_heap(self.heap);
                        self.dispose_ctx(ctx);
                        Err(ExcKind::type_error(
                            "filter over guest-defined iterables is not supported",
                        ))
                    }
                }
            }
            BuiltinFn::Gather => {
                self.drop_kwargs(kwargs);
                let handle = GatherHandle {
                    children: pos.into_vec(),
                    driven: false,
                };
                let id = self.heap.alloc(HeapData::Gather(handle)).map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id))
            }
            BuiltinFn::AsyncSleep => {
                // Cooperative zero-delay suspension: a pre-resolved future.
                self.drop_kwargs(kwargs);
                self.drop_values(pos);
                let call_id = self.allocate_call_id();
                self.resolved.insert(call_id.raw(), FutureOutcome::Value(Value::None));
                self.apply_return_ctx(ctx, Value::ExternalFuture(call_id))
            }
            BuiltinFn::Sleep => {
                self.drop_kwargs(kwargs);
                self.drop_values(pos);
                if self.refused.iter().any(|name| name == "sleep") {
                    self.dispose_ctx(ctx);
                    return Err(ExcKind::runtime_error("sleep is not allowed in the sandbox"));
                }
                // A host that unblocks it gets a no-op.
                self.apply_return_ctx(ctx, Value::None)
            }
            BuiltinFn::CollectCycles => {
                self.drop_kwargs(kwargs);
                self.drop_values(pos);
                let roots = self.gc_roots();
                let freed = self.heap.collect_cycles(roots);
                self.apply_return_ctx(ctx, Value::Int(freed as i64))
            }
        }
    }

    fn builtin_print(&mut self, pos: CallArgs, kwargs: Vec<(String, Value)>) -> RunResult<()> {
        let mut sep: Cow<'static, str> = Cow::Borrowed(" ");
        let mut end: Cow<'static, str> = Cow::Borrowed("\n");
        for (name, value) in kwargs {
            let text = str_content(&value, self.heap, self.interns).map(str::to_owned);
            match (name.as_str(), text) {
                ("sep", Some(text)) => sep = Cow::Owned(text),
                ("end", Some(text)) => end = Cow::Owned(text),
                _ => {
                    let err = ExcKind::type_error(format!("print() got an unexpected keyword argument '{name}'"));
                    value.drop_with_heap(self.heap);
                    return Err(err);
                }
            }
            value.drop_with_heap(self.heap);
        }
        for (index, value) in pos.iter().enumerate() {
            if index > 0 {
                for ch in sep.chars() {
                    self.print.write_sep(ch);
                }
            }
            let mut out = String::new();
            write_str(&mut out, value, self.heap, self.interns);
            self.print.write_chunk(Cow::Owned(out));
        }
        for ch in end.chars() {
            self.print.write_sep(ch);
        }
        self.drop_values(pos);
        Ok(())
    }

    /// Strong references held outside the heap, for the cycle collector.
    pub(crate) fn gc_roots(&self) -> Vec<HeapId> {
        let mut roots = Vec::new();
        fn visit(value: &Value, roots: &mut Vec<HeapId>) {
            if let Value::Ref(id) = value {
                roots.push(*id);
            }
        }
        for value in self.globals.iter() {
            visit(value, &mut roots);
        }
        for frame in &self.frames {
            frame.locals.iter().for_each(|v| visit(v, &mut roots));
            frame.stack.iter().for_each(|v| visit(v, &mut roots));
            roots.extend(frame.cells.iter().copied());
            if let Some(gen_id) = frame.generator {
                roots.push(gen_id);
            }
        }
        if let Some(gather) = &self.gather {
            for child in &gather.children {
                if let Some(awaitable) = &child.awaitable {
                    visit(awaitable, &mut roots);
                }
                if let Some(result) = &child.result {
                    visit(result, &mut roots);
                }
                for frame in &child.frames {
                    frame.locals.iter().for_each(|v| visit(v, &mut roots));
                    frame.stack.iter().for_each(|v| visit(v, &mut roots));
                    roots.extend(frame.cells.iter().copied());
                    if let Some(gen_id) = frame.generator {
                        roots.push(gen_id);
                    }
                }
            }
        }
        for (_, outcome) in &self.resolved {
            if let FutureOutcome::Value(value) = outcome {
                visit(value, &mut roots);
            }
        }
        roots
    }

    /// `isinstance(value, classinfo)`.
    pub(crate) fn isinstance_check(&self, value: &Value, classinfo: &Value) -> RunResult<bool> {
        if let Value::Ref(id) = classinfo
            && let HeapData::Tuple(t) = self.heap.get(*id)
        {
            for member in t.elements() {
                if self.isinstance_check(value, member)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        match classinfo {
            Value::Builtin(Builtin::Type(t)) => Ok(self.value_is_of_type(value, *t)),
            Value::Builtin(Builtin::Exc(kind)) => Ok(match value {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Exception(payload) => payload.kind.is_caught_by(*kind),
                    _ => false,
                },
                _ => false,
            }),
            Value::Ref(class_id) if matches!(self.heap.get(*class_id), HeapData::Class(_)) => {
                let class_id = *class_id;
                Ok(match value {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Instance(instance) => {
                            instance.class_id == class_id
                                || match self.heap.get(instance.class_id) {
                                    HeapData::Class(c) => c.mro.contains(&class_id),
                                    _ => false,
                                }
                        }
                        HeapData::Exception(payload) => payload
                            .class_slot
                            .is_some_and(|(slot, uid)| slot == class_id.index() && self.heap.uid_of(class_id) == uid),
                        _ => false,
                    },
                    _ => false,
                })
            }
            _ => Err(ExcKind::type_error(
                "isinstance() arg 2 must be a type or tuple of types",
            )),
        }
    }

    fn value_is_of_type(&self, value: &Value, t: Type) -> bool {
        let actual = value.type_of(self.heap);
        if actual == t {
            return true;
        }
        // Bool is a subtype of int for isinstance purposes.
        matches!((actual, t), (Type::Bool, Type::Int)) || t == Type::Object
    }

    /// `issubclass(sub, classinfo)`.
    pub(crate) fn issubclass_check(&self, sub: &Value, classinfo: &Value) -> RunResult<bool> {
        if let Value::Ref(id) = classinfo
            && let HeapData::Tuple(t) = self.heap.get(*id)
        {
            for member in t.elements() {
                if self.issubclass_check(sub, member)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        match (sub, classinfo) {
            (Value::Builtin(Builtin::Exc(a)), Value::Builtin(Builtin::Exc(b))) => Ok(a.is_caught_by(*b)),
            (Value::Builtin(Builtin::Type(a)), Value::Builtin(Builtin::Type(b))) => {
                Ok(a == b || matches!((a, b), (Type::Bool, Type::Int)) || *b == Type::Object)
            }
            (Value::Ref(a), Value::Ref(b)) => {
                let (a, b) = (*a, *b);
                match (self.heap.get(a), self.heap.get(b)) {
                    (HeapData::Class(_), HeapData::Class(_)) => Ok(a == b || self.is_strict_subclass(a, b)),
                    _ => Err(ExcKind::type_error("issubclass() arg 1 must be a class")),
                }
            }
            (Value::Ref(a), Value::Builtin(Builtin::Exc(kind))) => match self.heap.get(*a) {
                HeapData::Class(class) => Ok(class.exc_kind.is_some_and(|k| k.is_caught_by(*kind))),
                _ => Err(ExcKind::type_error("issubclass() arg 1 must be a class")),
            },
            _ => Err(ExcKind::type_error("issubclass() arg 1 must be a class")),
        }
    }

    // ------------------------------------------------------------------
    // Type constructors
    // ------------------------------------------------------------------

    /// Runs a builtin type constructor; the result flows through `ctx`.
    pub(crate) fn call_builtin_type(
        &mut self,
        t: Type,
        mut pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        ctx: ReturnCtx,
    ) -> RunResult<()> {
        match t {
            Type::Bool => {
                self.drop_kwargs(kwargs);
                let value = pos.pop().unwrap_or(Value::Bool(false));
                self.drop_values(pos);
                match value.truthy(self.heap, self.interns) {
                    Some(truth) => {
                        value.drop_with_heap(self.heap);
                        self.apply_return_ctx(ctx, Value::Bool(truth)).map(|_| ())
                    }
                    None => {
                        self.dispose_ctx(ctx);
                        self.instance_truthiness_direct(value)
                    }
                }
            }
            Type::Int => {
                self.drop_kwargs(kwargs);
                let value = pos.pop().unwrap_or(Value::Int(0));
                self.drop_values(pos);
                let result = self.int_of(value);
                match result {
                    Ok(out) => self.apply_return_ctx(ctx, out).map(|_| ()),
                    Err(err) => {
                        self.dispose_ctx(ctx);
                        Err(err)
                    }
                }
            }
            Type::Float => {
                self.drop_kwargs(kwargs);
                let value = pos.pop().unwrap_or(Value::Float(0.0));
                self.drop_values(pos);
                let result = self.float_of(value);
                match result {
                    Ok(out) => self.apply_return_ctx(ctx, out).map(|_| ()),
                    Err(err) => {
                        self.dispose_ctx(ctx);
                        Err(err)
                    }
                }
            }
            Type::Str => {
                self.drop_kwargs(kwargs);
                match pos.len() {
                    0 => {
                        let id = self.heap.alloc(HeapData::Str(Str::default())).map_err(RunError::from)?;
                        self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
                    }
                    _ => {
                        let value = pos.remove(0);
                        self.drop_values(pos);
                        if let Some(class_id) = self.instance_class(&value)
                            && let Some(method) = self
                                .lookup_on_class_mro(class_id, self.text(StaticStr::Str.into()))
                                .or_else(|| self.lookup_on_class_mro(class_id, self.text(StaticStr::Repr.into())))
                                .map(|m| m.clone_with_heap(self.heap))
                        {
                            self.dispose_ctx(ctx);
                            return self.push_call_frame(method, smallvec![value], ReturnCtx::StrictStr);
                        }
                        let mut out = String::new();
                        write_str(&mut out, &value, self.heap, self.interns);
                        value.drop_with_heap(self.heap);
                        let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                        self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
                    }
                }
            }
            Type::Bytes | Type::ByteArray => {
                self.drop_kwargs(kwargs);
                let data = match pos.len() {
                    0 => Vec::new(),
                    _ => {
                        let value = pos.remove(0);
                        self.drop_values(pos);
                        let data = self.bytes_from_value(&value)?;
                        value.drop_with_heap(self.heap);
                        data
                    }
                };
                let payload = if t == Type::Bytes {
                    HeapData::Bytes(Bytes::new(data))
                } else {
                    HeapData::ByteArray(Bytes::new(data))
                };
                let id = self.heap.alloc(payload).map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
            }
            Type::Tuple | Type::List => {
                self.drop_kwargs(kwargs);
                let as_tuple = t == Type::Tuple;
                match pos.len() {
                    0 => {
                        let payload = if as_tuple {
                            HeapData::Tuple(Tuple::default())
                        } else {
                            HeapData::List(List::default())
                        };
                        let id = self.heap.alloc(payload).map_err(RunError::from)?;
                        self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
                    }
                    _ => {
                        let source = pos.remove(0);
                        self.drop_values(pos);
                        if let Some(elements) = self.collect_sync_iterable(&source)? {
                            source.drop_with_heap(self.heap);
                            let payload = if as_tuple {
                                HeapData::Tuple(Tuple::new(elements))
                            } else {
                                HeapData::List(List::new(elements))
                            };
                            let id = self.heap.alloc(payload).map_err(RunError::from)?;
                            return self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ());
                        }
                        // Generator (or other steppable) sources stream into
                        // an accumulator list.
                        if !matches!(ctx, ReturnCtx::Push) {
                            let type_name = source.type_name(self.heap, self.interns).into_owned();
                            source.drop_with_heap(self.heap);
                            self.dispose_ctx(ctx);
                            return Err(ExcKind::type_error(format!(
                                "'{type_name}' object is not iterable here"
                            )));
                        }
                        let accumulator = self
                            .heap
                            .alloc(HeapData::List(List::default()))
                            .map_err(RunError::from)?;
                        let iter = source.clone_with_heap(self.heap);
                        let delivery = Delivery::Collect {
                            iter: source,
                            list: accumulator,
                            as_tuple,
                        };
                        self.advance_with_delivery(iter, delivery)
                    }
                }
            }
            Type::Dict => {
                let mut dict = Dict::with_capacity(kwargs.len());
                if let Some(source) = pos.pop() {
                    self.drop_values(pos);
                    let pairs: Option<Vec<(u64, Value, Value)>> = match &source {
                        Value::Ref(id) => match self.heap.get(*id) {
                            HeapData::Dict(d) => Some(
                                d.raw_iter()
                                    .map(|(h, k, v)| (h, k.shallow_copy(), v.shallow_copy()))
                                    .collect(),
                            ),
                            _ => None,
                        },
                        _ => None,
                    };
                    let Some(pairs) = pairs else {
                        source.drop_with_heap(self.heap);
                        self.drop_kwargs(kwargs);
                        self.dispose_ctx(ctx);
                        return Err(ExcKind::type_error("dict() argument must be a mapping"));
                    };
                    for (hash, key, value) in pairs {
                        if let Value::Ref(id) = &key {
                            self.heap.inc_ref(*id);
                        }
                        if let Value::Ref(id) = &value {
                            self.heap.inc_ref(*id);
                        }
                        if let Some(old) = dict.insert(key, hash, value, self.heap, self.interns) {
                            old.drop_with_heap(self.heap);
                        }
                    }
                    source.drop_with_heap(self.heap);
                }
                for (name, value) in kwargs {
                    let key_id = self.heap.alloc(HeapData::Str(Str::new(name))).map_err(RunError::from)?;
                    let key = Value::Ref(key_id);
                    let hash = self.hash_ready(&key)?;
                    if let Some(old) = dict.insert(key, hash, value, self.heap, self.interns) {
                        old.drop_with_heap(self.heap);
                    }
                }
                let id = self.heap.alloc(HeapData::Dict(dict)).map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
            }
            Type::Set | Type::FrozenSet => {
                self.drop_kwargs(kwargs);
                let frozen = t == Type::FrozenSet;
                let elements = match pos.pop() {
                    Some(source) => {
                        self.drop_values(pos);
                        match self.collect_sync_iterable(&source)? {
                            Some(elements) => {
                                source.drop_with_heap(self.heap);
                                elements
                            }
                            None => {
                                let type_name = source.type_name(self.heap, self.interns).into_owned();
                                source.drop_with_heap(self.heap);
                                self.dispose_ctx(ctx);
                                return Err(ExcKind::type_error(format!(
                                    "'{type_name}' object is not iterable here"
                                )));
                            }
                        }
                    }
                    None => Vec::new(),
                };
                let mut set = Set::new();
                for element in elements {
                    match element.hash_key(self.heap, self.interns) {
                        HashAttempt::Ready(hash) => {
                            if let Some(dup) = set.add(element, hash, self.heap, self.interns) {
                                dup.drop_with_heap(self.heap);
                            }
                        }
                        HashAttempt::Unhashable(type_name) => {
                            element.drop_with_heap(self.heap);
                            for v in set.drain_values() {
                                v.drop_with_heap(self.heap);
                            }
                            self.dispose_ctx(ctx);
                            return Err(ExcKind::type_error(format!("unhashable type: '{type_name}'")));
                        }
                        HashAttempt::NeedDunder(_) => {
                            element.drop_with_heap(self.heap);
                            for v in set.drain_values() {
                                v.drop_with_heap(self.heap);
                            }
                            self.dispose_ctx(ctx);
                            return Err(ExcKind::type_error(
                                "set() over instances with guest __hash__ is not supported here",
                            ));
                        }
                    }
                }
                let payload = if frozen {
                    HeapData::FrozenSet(set)
                } else {
                    HeapData::Set(set)
                };
                let id = self.heap.alloc(payload).map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
            }
            Type::Range => {
                self.drop_kwargs(kwargs);
                let mut parts = Vec::with_capacity(pos.len());
                for value in &pos {
                    match as_index(value, self.heap) {
                        Some(i) => parts.push(i),
                        None => {
                            let type_name = value.type_name(self.heap, self.interns).into_owned();
                            self.drop_values(pos);
                            self.dispose_ctx(ctx);
                            return Err(ExcKind::type_error(format!(
                                "'{type_name}' object cannot be interpreted as an integer"
                            )));
                        }
                    }
                }
                self.drop_values(pos);
                let range = match parts.as_slice() {
                    [stop] => Range { start: 0, stop: *stop, step: 1 },
                    [start, stop] => Range { start: *start, stop: *stop, step: 1 },
                    [start, stop, step] => Range { start: *start, stop: *stop, step: *step },
                    _ => {
                        self.dispose_ctx(ctx);
                        return Err(ExcKind::type_error("range expected 1 to 3 arguments"));
                    }
                };
                if range.step == 0 {
                    self.dispose_ctx(ctx);
                    return Err(ExcKind::value_error("range() arg 3 must not be zero"));
                }
                let id = self.heap.alloc(HeapData::Range(range)).map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
            }
            Type::Slice => {
                self.drop_kwargs(kwargs);
                let (start, stop, step) = match pos.len() {
                    1 => {
                        let stop = pos.pop().expect("length checked");
                        (Value::None, stop, Value::None)
                    }
                    2 => {
                        let stop = pos.pop().expect("length checked");
                        let start = pos.pop().expect("length checked");
                        (start, stop, Value::None)
                    }
                    3 => {
                        let step = pos.pop().expect("length checked");
                        let stop = pos.pop().expect("length checked");
                        let start = pos.pop().expect("length checked");
                        (start, stop, step)
                    }
                    _ => {
                        self.drop_values(pos);
                        self.dispose_ctx(ctx);
                        return Err(ExcKind::type_error("slice expected 1 to 3 arguments"));
                    }
                };
                let id = self
                    .heap
                    .alloc(HeapData::Slice(Slice { start, stop, step }))
                    .map_err(RunError::from)?;
                self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
            }
            Type::Type => {
                self.drop_kwargs(kwargs);
                let value = take_single(self, pos, "type")?;
                let result = self.type_of_value(&value);
                value.drop_with_heap(self.heap);
                self.apply_return_ctx(ctx, result).map(|_| ())
            }
            Type::Object => {
                self.drop_kwargs(kwargs);
                self.drop_values(pos);
                self.dispose_ctx(ctx);
                Err(ExcKind::type_error("object() is not constructible in the sandbox"))
            }
            _ => {
                self.drop_kwargs(kwargs);
                self.drop_values(pos);
                self.dispose_ctx(ctx);
                Err(ExcKind::type_error(format!("cannot construct '{}' values", t.name())))
            }
        }
    }

    /// `type(x)` as a value.
    fn type_of_value(&mut self, value: &Value) -> Value {
        if let Value::Ref(id) = value {
            match self.heap.get(*id) {
                HeapData::Instance(instance) => {
                    let class_id = instance.class_id;
                    self.heap.inc_ref(class_id);
                    return Value::Ref(class_id);
                }
                HeapData::Exception(payload) => {
                    if let Some((slot, uid)) = payload.class_slot {
                        let class_id = crate::heap::HeapId::from_index(slot);
                        if self.heap.is_live(class_id) && self.heap.uid_of(class_id) == uid {
                            self.heap.inc_ref(class_id);
                            return Value::Ref(class_id);
                        }
                    }
                    return Value::Builtin(Builtin::Exc(payload.kind));
                }
                _ => {}
            }
        }
        Value::Builtin(Builtin::Type(value.type_of(self.heap)))
    }

    fn bytes_from_value(&mut self, value: &Value) -> RunResult<Vec<u8>> {
        if let Some(count) = as_index(value, self.heap) {
            let count = usize::try_from(count)
                .map_err(|_| ExcKind::value_error("negative count"))?;
            self.heap
                .tracker()
                .check_large_result(count)
                .map_err(RunError::from)?;
            return Ok(vec![0; count]);
        }
        if let Some(data) = crate::value::bytes_content(value, self.heap, self.interns) {
            return Ok(data.to_vec());
        }
        if let Value::Ref(id) = value
            && let HeapData::List(l) = self.heap.get(*id)
        {
            let mut out = Vec::with_capacity(l.len());
            for element in l.elements() {
                match as_index(element, self.heap) {
                    Some(byte) if (0..=255).contains(&byte) => out.push(byte as u8),
                    _ => return Err(ExcKind::value_error("bytes must be in range(0, 256)")),
                }
            }
            return Ok(out);
        }
        Err(ExcKind::type_error("cannot convert argument to bytes"))
    }

    /// `bool(instance)` without a rewind: the ctx was already disposed, so
    /// the frame result lands on the stack as a plain bool.
    fn instance_truthiness_direct(&mut self, value: Value) -> RunResult<()> {
        let Some(class_id) = self.instance_class(&value) else {
            value.drop_with_heap(self.heap);
            self.push(Value::Bool(true));
            return Ok(());
        };
        if let Some(method) = self
            .lookup_on_class_mro(class_id, self.text(StaticStr::Bool.into()))
            .map(|m| m.clone_with_heap(self.heap))
        {
            return self.push_call_frame(method, smallvec![value], ReturnCtx::StrictBool { negate: false });
        }
        if let Some(method) = self
            .lookup_on_class_mro(class_id, self.text(StaticStr::Len.into()))
            .map(|m| m.clone_with_heap(self.heap))
        {
            return self.push_call_frame(
                method,
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

    // ------------------------------------------------------------------
    // Builtin-type methods
    // ------------------------------------------------------------------

    /// Runs a builtin-type method; `pos[0]` is the receiver.
    pub(crate) fn call_builtin_method(
        &mut self,
        m: BuiltinMethod,
        mut pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        ctx: ReturnCtx,
    ) -> RunResult<()> {
        self.drop_kwargs(kwargs);
        if pos.is_empty() {
            self.dispose_ctx(ctx);
            return Err(RunError::internal("builtin method called without a receiver"));
        }
        let receiver = pos.remove(0);
        let result = self.run_builtin_method(m, &receiver, pos);
        receiver.drop_with_heap(self.heap);
        match result {
            Ok(value) => self.apply_return_ctx(ctx, value).map(|_| ()),
            Err(err) => {
                self.dispose_ctx(ctx);
                Err(err)
            }
        }
    }

    fn run_builtin_method(&mut self, m: BuiltinMethod, receiver: &Value, mut args: CallArgs) -> RunResult<Value> {
        let receiver_id = match receiver {
            Value::Ref(id) => Some(*id),
            _ => None,
        };
        match m {
            BuiltinMethod::ListAppend => {
                let value = take_single(self, args, "append")?;
                self.heap.on_container_insert().map_err(RunError::from)?;
                let Some(id) = receiver_id else {
                    value.drop_with_heap(self.heap);
                    return Err(RunError::internal("append on a non-list"));
                };
                match self.heap.get_mut(id) {
                    HeapData::List(l) => {
                        l.push(value);
                        Ok(Value::None)
                    }
                    _ => {
                        value.drop_with_heap(self.heap);
                        Err(RunError::internal("append on a non-list"))
                    }
                }
            }
            BuiltinMethod::ListPop => {
                let index = args.pop();
                self.drop_values(args);
                let raw = match &index {
                    Some(value) => as_index(value, self.heap).unwrap_or(-1),
                    None => -1,
                };
                if let Some(value) = index {
                    value.drop_with_heap(self.heap);
                }
                let Some(id) = receiver_id else {
                    return Err(RunError::internal("pop on a non-list"));
                };
                let popped = match self.heap.get_mut(id) {
                    HeapData::List(l) => {
                        let len = l.len();
                        let position = if raw < 0 { raw + len as i64 } else { raw };
                        if len == 0 {
                            None
                        } else if (0..len as i64).contains(&position) {
                            Some(l.elements_mut().remove(position as usize))
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                popped.ok_or_else(|| ExcKind::index_error("pop index out of range"))
            }
            BuiltinMethod::ListExtend => {
                let source = take_single(self, args, "extend")?;
                let elements = match self.collect_sync_iterable(&source)? {
                    Some(elements) => {
                        source.drop_with_heap(self.heap);
                        elements
                    }
                    None => {
                        let type_name = source.type_name(self.heap, self.interns).into_owned();
                        source.drop_with_heap(self.heap);
                        return Err(ExcKind::type_error(format!("'{type_name}' object is not iterable")));
                    }
                };
                let Some(id) = receiver_id else {
                    self.drop_values(elements);
                    return Err(RunError::internal("extend on a non-list"));
                };
                match self.heap.get_mut(id) {
                    HeapData::List(l) => {
                        l.elements_mut().extend(elements);
                        Ok(Value::None)
                    }
                    _ => {
                        self.drop_values(elements);
                        Err(RunError::internal("extend on a non-list"))
                    }
                }
            }
            BuiltinMethod::ListClear => {
                self.drop_values(args);
                let Some(id) = receiver_id else {
                    return Err(RunError::internal("clear on a non-list"));
                };
                let drained = match self.heap.get_mut(id) {
                    HeapData::List(l) => std::mem::take(l.elements_mut()),
                    _ => Vec::new(),
                };
                self.drop_values(drained);
                Ok(Value::None)
            }
            BuiltinMethod::DictGet | BuiltinMethod::DictPop => {
                let default = if args.len() == 2 { args.pop() } else { None };
                let key = take_single(self, args, m.name())?;
                let Some(id) = receiver_id else {
                    key.drop_with_heap(self.heap);
                    if let Some(d) = default {
                        d.drop_with_heap(self.heap);
                    }
                    return Err(RunError::internal("dict method on a non-dict"));
                };
                let hash = match key.hash_key(self.heap, self.interns) {
                    HashAttempt::Ready(hash) => hash,
                    _ => {
                        key.drop_with_heap(self.heap);
                        if let Some(d) = default {
                            d.drop_with_heap(self.heap);
                        }
                        return Err(ExcKind::type_error("unhashable or guest-hashed key"));
                    }
                };
                let found = if m == BuiltinMethod::DictGet {
                    let found = match self.heap.get(id) {
                        HeapData::Dict(d) => d.get(&key, hash, self.heap, self.interns).map(Value::shallow_copy),
                        _ => None,
                    };
                    if let Some(value) = &found
                        && let Value::Ref(vid) = value
                    {
                        self.heap.inc_ref(*vid);
                    }
                    found
                } else {
                    self.heap.with_entry_mut(id, |data, heap| match data {
                        HeapData::Dict(d) => d.remove(&key, hash, heap, self.interns),
                        _ => None,
                    })
                };
                let missing_key_repr = if found.is_none() && default.is_none() && m == BuiltinMethod::DictPop {
                    let mut repr = String::new();
                    write_repr(&mut repr, &key, self.heap, self.interns, &mut Vec::new());
                    Some(repr)
                } else {
                    None
                };
                key.drop_with_heap(self.heap);
                match found {
                    Some(value) => {
                        if let Some(d) = default {
                            d.drop_with_heap(self.heap);
                        }
                        Ok(value)
                    }
                    None => match default {
                        Some(d) => Ok(d),
                        None if m == BuiltinMethod::DictGet => Ok(Value::None),
                        None => Err(ExcKind::key_error(missing_key_repr.unwrap_or_default())),
                    },
                }
            }
            BuiltinMethod::DictKeys | BuiltinMethod::DictValues | BuiltinMethod::DictItems => {
                self.drop_values(args);
                let Some(id) = receiver_id else {
                    return Err(RunError::internal("dict view on a non-dict"));
                };
                let pairs: Vec<(Value, Value)> = match self.heap.get(id) {
                    HeapData::Dict(d) => d.iter().map(|(k, v)| (k.shallow_copy(), v.shallow_copy())).collect(),
                    _ => Vec::new(),
                };
                let mut out = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    match m {
                        BuiltinMethod::DictKeys => {
                            if let Value::Ref(kid) = &key {
                                self.heap.inc_ref(*kid);
                            }
                            out.push(key);
                        }
                        BuiltinMethod::DictValues => {
                            if let Value::Ref(vid) = &value {
                                self.heap.inc_ref(*vid);
                            }
                            out.push(value);
                        }
                        _ => {
                            if let Value::Ref(kid) = &key {
                                self.heap.inc_ref(*kid);
                            }
                            if let Value::Ref(vid) = &value {
                                self.heap.inc_ref(*vid);
                            }
                            let tuple = self
                                .heap
                                .alloc(HeapData::Tuple(Tuple::new(vec![key, value])))
                                .map_err(RunError::from)?;
                            out.push(Value::Ref(tuple));
                        }
                    }
                }
                let id = self.heap.alloc(HeapData::List(List::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            BuiltinMethod::DictClear => {
                self.drop_values(args);
                let Some(id) = receiver_id else {
                    return Err(RunError::internal("clear on a non-dict"));
                };
                let pairs = match self.heap.get_mut(id) {
                    HeapData::Dict(d) => d.drain_pairs(),
                    _ => Vec::new(),
                };
                for (key, value) in pairs {
                    key.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                }
                Ok(Value::None)
            }
            BuiltinMethod::SetAdd | BuiltinMethod::SetRemove | BuiltinMethod::SetDiscard => {
                let value = take_single(self, args, m.name())?;
                let Some(id) = receiver_id else {
                    value.drop_with_heap(self.heap);
                    return Err(RunError::internal("set method on a non-set"));
                };
                let hash = match value.hash_key(self.heap, self.interns) {
                    HashAttempt::Ready(hash) => hash,
                    _ => {
                        value.drop_with_heap(self.heap);
                        return Err(ExcKind::type_error("unhashable or guest-hashed element"));
                    }
                };
                if m == BuiltinMethod::SetAdd {
                    self.heap.on_container_insert().map_err(RunError::from)?;
                    let dup = self.heap.with_entry_mut(id, |data, heap| match data {
                        HeapData::Set(s) => s.add(value, hash, heap, self.interns),
                        _ => Some(value),
                    });
                    if let Some(dup) = dup {
                        dup.drop_with_heap(self.heap);
                    }
                    Ok(Value::None)
                } else {
                    let removed = self.heap.with_entry_mut(id, |data, heap| match data {
                        HeapData::Set(s) => s.remove(&value, hash, heap, self.interns),
                        _ => None,
                    });
                    let missing = removed.is_none();
                    if let Some(removed) = removed {
                        removed.drop_with_heap(self.heap);
                    }
                    let repr = if missing && m == BuiltinMethod::SetRemove {
                        let mut repr = String::new();
                        write_repr(&mut repr, &value, self.heap, self.interns, &mut Vec::new());
                        Some(repr)
                    } else {
                        None
                    };
                    value.drop_with_heap(self.heap);
                    if let Some(repr) = repr {
                        return Err(ExcKind::key_error(repr));
                    }
                    Ok(Value::None)
                }
            }
            BuiltinMethod::SetClear => {
                self.drop_values(args);
                let Some(id) = receiver_id else {
                    return Err(RunError::internal("clear on a non-set"));
                };
                let drained = match self.heap.get_mut(id) {
                    HeapData::Set(s) => s.drain_values(),
                    _ => Vec::new(),
                };
                self.drop_values(drained);
                Ok(Value::None)
            }
            BuiltinMethod::StrUpper
            | BuiltinMethod::StrLower
            | BuiltinMethod::StrStrip
            | BuiltinMethod::StrSplit
            | BuiltinMethod::StrJoin
            | BuiltinMethod::StrStartswith
            | BuiltinMethod::StrEndswith
            | BuiltinMethod::StrReplace => self.run_str_method(m, receiver, args),
        }
    }

    fn run_str_method(&mut self, m: BuiltinMethod, receiver: &Value, mut args: CallArgs) -> RunResult<Value> {
        let text = str_content(receiver, self.heap, self.interns)
            .ok_or_else(|| RunError::internal("string method on a non-string"))?
            .to_owned();
        match m {
            BuiltinMethod::StrUpper | BuiltinMethod::StrLower => {
                self.drop_values(args);
                let out = if m == BuiltinMethod::StrUpper {
                    text.to_uppercase()
                } else {
                    text.to_lowercase()
                };
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            BuiltinMethod::StrStrip => {
                let chars = args.pop();
                self.drop_values(args);
                let out = match &chars {
                    Some(value) => {
                        let set = str_content(value, self.heap, self.interns)
                            .ok_or_else(|| ExcKind::type_error("strip arg must be str or None"))?;
                        let set: Vec<char> = set.chars().collect();
                        text.trim_matches(|c| set.contains(&c)).to_owned()
                    }
                    None => text.trim().to_owned(),
                };
                if let Some(value) = chars {
                    value.drop_with_heap(self.heap);
                }
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            BuiltinMethod::StrSplit => {
                let sep = args.pop();
                self.drop_values(args);
                let parts: Result<Vec<String>, RunError> = match &sep {
                    Some(value) => match str_content(value, self.heap, self.interns) {
                        Some(sep_text) if sep_text.is_empty() => Err(ExcKind::value_error("empty separator")),
                        Some(sep_text) => Ok(text.split(sep_text).map(str::to_owned).collect()),
                        None => Err(ExcKind::type_error("sep must be a string")),
                    },
                    None => Ok(text.split_whitespace().map(str::to_owned).collect()),
                };
                if let Some(value) = sep {
                    value.drop_with_heap(self.heap);
                }
                let parts = parts?;
                let mut elements = Vec::with_capacity(parts.len());
                for part in parts {
                    let id = self.heap.alloc(HeapData::Str(Str::new(part))).map_err(RunError::from)?;
                    elements.push(Value::Ref(id));
                }
                let id = self.heap.alloc(HeapData::List(List::new(elements))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            BuiltinMethod::StrJoin => {
                let source = take_single(self, args, "join")?;
                let elements = match self.collect_sync_iterable(&source)? {
                    Some(elements) => {
                        source.drop_with_heap(self.heap);
                        elements
                    }
                    None => {
                        source.drop_with_heap(self.heap);
                        return Err(ExcKind::type_error("can only join an iterable"));
                    }
                };
                let mut out = String::new();
                for (i, element) in elements.iter().enumerate() {
                    let Some(part) = str_content(element, self.heap, self.interns) else {
                        let type_name = element.type_name(self.heap, self.interns).into_owned();
                        let err = ExcKind::type_error(format!(
                            "sequence item {i}: expected str instance, {type_name} found"
                        ));
                        self.drop_values(elements);
                        return Err(err);
                    };
                    if i > 0 {
                        out.push_str(&text);
                    }
                    out.push_str(part);
                }
                self.drop_values(elements);
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            BuiltinMethod::StrStartswith | BuiltinMethod::StrEndswith => {
                let probe = take_single(self, args, m.name())?;
                let verdict = {
                    let probe_text = str_content(&probe, self.heap, self.interns)
                        .ok_or_else(|| ExcKind::type_error("argument must be a string"))?;
                    if m == BuiltinMethod::StrStartswith {
                        text.starts_with(probe_text)
                    } else {
                        text.ends_with(probe_text)
                    }
                };
                probe.drop_with_heap(self.heap);
                Ok(Value::Bool(verdict))
            }
            BuiltinMethod::StrReplace => {
                let (from, to) = take_pair(self, args, "replace")?;
                let out = {
                    let from_text = str_content(&from, self.heap, self.interns)
                        .ok_or_else(|| ExcKind::type_error("replace arguments must be strings"))?;
                    let to_text = str_content(&to, self.heap, self.interns)
                        .ok_or_else(|| ExcKind::type_error("replace arguments must be strings"))?;
                    text.replace(from_text, to_text)
                };
                from.drop_with_heap(self.heap);
                to.drop_with_heap(self.heap);
                let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                Ok(Value::Ref(id))
            }
            _ => unreachable!("non-string method routed to run_str_method"),
        }
    }

    // ------------------------------------------------------------------
    // Exception constructors
    // ------------------------------------------------------------------

    /// `ValueError("msg")` and friends; `ExceptionGroup(msg, [excs])`.
    pub(crate) fn call_exc_constructor(
        &mut self,
        kind: ExcKind,
        mut pos: CallArgs,
        kwargs: Vec<(String, Value)>,
        ctx: ReturnCtx,
    ) -> RunResult<()> {
        self.drop_kwargs(kwargs);
        let payload = if kind == ExcKind::ExceptionGroup {
            if pos.len() != 2 {
                self.drop_values(pos);
                self.dispose_ctx(ctx);
                return Err(ExcKind::type_error("ExceptionGroup() takes exactly 2 arguments"));
            }
            let members_value = pos.pop().expect("length checked");
            let message_value = pos.pop().expect("length checked");
            let message = str_content(&message_value, self.heap, self.interns).map(str::to_owned);
            message_value.drop_with_heap(self.heap);
            let Some(message) = message else {
                members_value.drop_with_heap(self.heap);
                self.dispose_ctx(ctx);
                return Err(ExcKind::type_error("ExceptionGroup() argument 1 must be str"));
            };
            let members = self.exc_group_members(&members_value);
            members_value.drop_with_heap(self.heap);
            let Some(members) = members else {
                self.dispose_ctx(ctx);
                return Err(ExcKind::type_error(
                    "ExceptionGroup() argument 2 must be a sequence of exceptions",
                ));
            };
            if members.is_empty() {
                self.dispose_ctx(ctx);
                return Err(ExcKind::value_error(
                    "second argument (exceptions) must be a non-empty sequence",
                ));
            }
            ExcPayload::group(message, members)
        } else {
            let message = match pos.len() {
                0 => None,
                _ => {
                    let first = pos.remove(0);
                    self.drop_values(std::mem::take(&mut pos));
                    let mut message = String::new();
                    write_str(&mut message, &first, self.heap, self.interns);
                    first.drop_with_heap(self.heap);
                    Some(message)
                }
            };
            let mut payload = ExcPayload::new(kind);
            payload.message = message;
            payload
        };
        let id = self.heap.alloc(HeapData::Exception(payload)).map_err(RunError::from)?;
        self.apply_return_ctx(ctx, Value::Ref(id)).map(|_| ())
    }

    fn exc_group_members(&self, value: &Value) -> Option<Vec<ExcPayload>> {
        let Value::Ref(id) = value else { return None };
        let elements: &[Value] = match self.heap.get(*id) {
            HeapData::List(l) => l.elements(),
            HeapData::Tuple(t) => t.elements(),
            _ => return None,
        };
        let mut members = Vec::with_capacity(elements.len());
        for element in elements {
            let Value::Ref(eid) = element else { return None };
            let HeapData::Exception(payload) = self.heap.get(*eid) else {
                return None;
            };
            members.push(payload.clone());
        }
        Some(members)
    }
}

fn take_single<T: ResourceTracker, P: PrintWriter>(
    vm: &mut Vm<'_, T, P>,
    mut pos: CallArgs,
    name: &str,
) -> RunResult<Value> {
    if pos.len() != 1 {
        let got = pos.len();
        vm.drop_values(pos);
        return Err(ExcKind::type_error(format!(
            "{name}() takes exactly one argument ({got} given)"
        )));
    }
    Ok(pos.pop().expect("length checked"))
}

fn take_pair<T: ResourceTracker, P: PrintWriter>(
    vm: &mut Vm<'_, T, P>,
    mut pos: CallArgs,
    name: &str,
) -> RunResult<(Value, Value)> {
    if pos.len() != 2 {
        let got = pos.len();
        vm.drop_values(pos);
        return Err(ExcKind::type_error(format!("{name}() takes exactly 2 arguments ({got} given)")));
    }
    let second = pos.pop().expect("length checked");
    let first = pos.pop().expect("length checked");
    Ok((first, second))
}

fn take_triple<T: ResourceTracker, P: PrintWriter>(
    vm: &mut Vm<'_, T, P>,
    mut pos: CallArgs,
    name: &str,
) -> RunResult<(Value, Value, Value)> {
    if pos.len() != 3 {
        let got = pos.len();
        vm.drop_values(pos);
        return Err(ExcKind::type_error(format!("{name}() takes exactly 3 arguments ({got} given)")));
    }
    let third = pos.pop().expect("length checked");
    let second = pos.pop().expect("length checked");
    let first = pos.pop().expect("length checked");
    Ok((first, second, third))
}
