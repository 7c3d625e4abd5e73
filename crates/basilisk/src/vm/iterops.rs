//! Iterator creation and stepping.
//!
//! `get_iter` builds the iterator for a value (`__iter__`, with the
//! sequential `__getitem__` adaptor as fallback); `iter_step` advances one
//! element. A step over builtin state is synchronous; a step that must run
//! guest code (`__next__`, a `map` function, a sequence-protocol
//! `__getitem__`) surfaces as [`IterStep::NeedCall`] and the caller decides
//! the frame's return ctx from the [`IterCallKind`] plus its delivery.

use crate::{
    exc::{ExcKind, RunError, RunResult},
    frame::{CallArgs, Delivery, ReturnCtx},
    heap::{HeapData, HeapId},
    intern::StaticStr,
    io::PrintWriter,
    resource::ResourceTracker,
    types::{GeneratorState, IterState, Str, Tuple},
    value::Value,
};

use smallvec::smallvec;

use super::Vm;

/// One advancement of an iterator.
#[derive(Debug)]
pub(crate) enum IterStep {
    /// The next element.
    Value(Value),
    /// The iterator is exhausted.
    Exhausted,
    /// Guest code must run to produce (or vet) the element.
    NeedCall(Value, CallArgs, IterCallKind),
    /// The iterator is a generator whose frame must resume.
    ResumeGen(HeapId),
}

/// Why a guest frame is entered during iteration.
#[derive(Debug)]
pub(crate) enum IterCallKind {
    /// A `__next__` call; the return value is the element.
    Next,
    /// A sequence-protocol `__getitem__` probe.
    SeqGetItem,
    /// A `map` function application; the return value is the element.
    MapApply,
    /// A `filter` predicate; truthiness decides whether `item` survives.
    FilterCheck { item: Value },
}

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Builds the return ctx for a guest call issued during iteration.
    pub(crate) fn ctx_for_iter_call(&mut self, kind: IterCallKind, iter: &Value, delivery: Delivery) -> ReturnCtx {
        match kind {
            IterCallKind::Next => ReturnCtx::NextResult { delivery },
            IterCallKind::SeqGetItem => ReturnCtx::SeqProtoNext { delivery },
            IterCallKind::MapApply => ReturnCtx::NextResult { delivery },
            IterCallKind::FilterCheck { item } => ReturnCtx::FilterDecision {
                item,
                iter: iter.clone_with_heap(self.heap),
                delivery,
            },
        }
    }

    /// Handles the `GetIter` opcode.
    pub(crate) fn get_iter_op(&mut self) -> RunResult<()> {
        let value = self.pop();
        match self.get_iter(value)? {
            Some(iterator) => {
                self.push(iterator);
                Ok(())
            }
            // A guest `__iter__` frame was pushed; its return lands on the
            // stack where the iterator belongs.
            None => Ok(()),
        }
    }

    /// Builds an iterator for `value`, consuming it.
    ///
    /// Returns `None` when a guest `__iter__` frame was pushed instead.
    pub(crate) fn get_iter(&mut self, value: Value) -> RunResult<Option<Value>> {
        let state = match &value {
            Value::InternStr(_) => Some(IterState::Str { source: Value::None, index: 0 }),
            Value::InternBytes(_) => Some(IterState::Bytes { source: Value::None, index: 0 }),
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::List(_) => Some(IterState::List { list: id, index: 0 }),
                    HeapData::Tuple(_) => Some(IterState::Tuple { tuple: id, index: 0 }),
                    HeapData::Str(_) => Some(IterState::Str { source: Value::None, index: 0 }),
                    HeapData::Bytes(_) | HeapData::ByteArray(_) => {
                        Some(IterState::Bytes { source: Value::None, index: 0 })
                    }
                    HeapData::Range(r) => Some(IterState::Range { range: *r, index: 0 }),
                    HeapData::Dict(d) => {
                        let expect_len = d.len();
                        Some(IterState::DictKeys { dict: id, index: 0, expect_len })
                    }
                    HeapData::Set(s) | HeapData::FrozenSet(s) => {
                        let expect_len = s.len();
                        Some(IterState::Set { set: id, index: 0, expect_len })
                    }
                    // Generators and existing iterators are their own
                    // iterator.
                    HeapData::Generator(_) | HeapData::Iter(_) => return Ok(Some(value)),
                    HeapData::Instance(_) => None,
                    _ => {
                        return self.not_iterable(value);
                    }
                }
            }
            _ => return self.not_iterable(value),
        };

        match state {
            Some(mut state) => {
                // Container-backed states hold the container reference the
                // incoming value owned; string/bytes states own the value
                // itself.
                match &mut state {
                    IterState::Str { source, .. } | IterState::Bytes { source, .. } => {
                        *source = value;
                    }
                    IterState::Range { .. } => value.drop_with_heap(self.heap),
                    // The id inside the state takes over the reference that
                    // `value` held.
                    _ => {
                        #[cfg(feature = "ref-count-panic")]
                        std::mem::forget(value);
                        #[cfg(not(feature = "ref-count-panic"))]
                        let _ = value;
                    }
                }
                let id = self.heap.alloc(HeapData::Iter(state)).map_err(RunError::from)?;
                Ok(Some(Value::Ref(id)))
            }
            None => {
                // Instance: `__iter__`, else the `__getitem__` adaptor.
                let Value::Ref(instance_id) = &value else {
                    return self.not_iterable(value);
                };
                let instance_id = *instance_id;
                if let Some(method) = self.class_dunder(instance_id, StaticStr::Iter) {
                    self.push_call_frame(method, smallvec![value], ReturnCtx::Push)?;
                    return Ok(None);
                }
                if self.class_dunder(instance_id, StaticStr::GetItem).is_some() {
                    let state = IterState::SeqProto { obj: value, index: 0 };
                    let id = self.heap.alloc(HeapData::Iter(state)).map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                self.not_iterable(value)
            }
        }
    }

    fn not_iterable(&mut self, value: Value) -> RunResult<Option<Value>> {
        let type_name = value.type_name(self.heap, self.interns).into_owned();
        value.drop_with_heap(self.heap);
        Err(ExcKind::type_error(format!("'{type_name}' object is not iterable")))
    }

    /// Handles the `ForIter` opcode: advance the iterator at top of stack.
    pub(crate) fn for_iter_op(&mut self, end_target: u32) -> RunResult<()> {
        let iter = self.peek().clone_with_heap(self.heap);
        let step = self.iter_step(&iter);
        match step {
            Ok(IterStep::Value(value)) => {
                iter.drop_with_heap(self.heap);
                self.push(value);
                Ok(())
            }
            Ok(IterStep::Exhausted) => {
                iter.drop_with_heap(self.heap);
                self.deliver_exhausted(Delivery::ForIter { end_target })
            }
            Ok(IterStep::NeedCall(callable, args, kind)) => {
                let ctx = self.ctx_for_iter_call(kind, &iter, Delivery::ForIter { end_target });
                iter.drop_with_heap(self.heap);
                self.push_call_frame(callable, args, ctx)
            }
            Ok(IterStep::ResumeGen(gen_id)) => {
                iter.drop_with_heap(self.heap);
                self.resume_generator(
                    gen_id,
                    ReturnCtx::NextResult {
                        delivery: Delivery::ForIter { end_target },
                    },
                )
            }
            Err(err) => {
                iter.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// Continues a membership scan over an owned iterator.
    pub(crate) fn membership_advance(&mut self, iter: Value, needle: Value, negate: bool) -> RunResult<()> {
        loop {
            match self.iter_step(&iter) {
                Ok(IterStep::Value(element)) => {
                    let found = super::binary::deep_eq(&element, &needle, self.heap, self.interns);
                    element.drop_with_heap(self.heap);
                    if found {
                        iter.drop_with_heap(self.heap);
                        needle.drop_with_heap(self.heap);
                        self.push(Value::Bool(!negate));
                        return Ok(());
                    }
                }
                Ok(IterStep::Exhausted) => {
                    iter.drop_with_heap(self.heap);
                    needle.drop_with_heap(self.heap);
                    self.push(Value::Bool(negate));
                    return Ok(());
                }
                Ok(IterStep::NeedCall(callable, args, kind)) => {
                    let delivery = Delivery::Membership { iter, needle, negate };
                    let iter_hint = match &delivery {
                        Delivery::Membership { iter, .. } => iter.clone_with_heap(self.heap),
                        _ => unreachable!("just constructed"),
                    };
                    let ctx = self.ctx_for_iter_call(kind, &iter_hint, delivery);
                    iter_hint.drop_with_heap(self.heap);
                    return self.push_call_frame(callable, args, ctx);
                }
                Ok(IterStep::ResumeGen(gen_id)) => {
                    return self.resume_generator(
                        gen_id,
                        ReturnCtx::NextResult {
                            delivery: Delivery::Membership { iter, needle, negate },
                        },
                    );
                }
                Err(err) => {
                    iter.drop_with_heap(self.heap);
                    needle.drop_with_heap(self.heap);
                    return Err(err);
                }
            }
        }
    }

    /// Advances `iter` one element, delivering per `delivery`. Consumes
    /// `iter`; membership deliveries own their own iterator reference.
    pub(crate) fn advance_with_delivery(&mut self, iter: Value, delivery: Delivery) -> RunResult<()> {
        if let Delivery::Membership { iter: scan_iter, needle, negate } = delivery {
            iter.drop_with_heap(self.heap);
            return self.membership_advance(scan_iter, needle, negate);
        }
        match self.iter_step(&iter) {
            Ok(IterStep::Value(value)) => {
                iter.drop_with_heap(self.heap);
                self.deliver_value(delivery, value)
            }
            Ok(IterStep::Exhausted) => {
                iter.drop_with_heap(self.heap);
                self.deliver_exhausted(delivery)
            }
            Ok(IterStep::NeedCall(callable, args, kind)) => {
                let ctx = self.ctx_for_iter_call(kind, &iter, delivery);
                iter.drop_with_heap(self.heap);
                self.push_call_frame(callable, args, ctx)
            }
            Ok(IterStep::ResumeGen(gen_id)) => {
                iter.drop_with_heap(self.heap);
                self.resume_generator(gen_id, ReturnCtx::NextResult { delivery })
            }
            Err(err) => {
                iter.drop_with_heap(self.heap);
                self.dispose_delivery(delivery);
                Err(err)
            }
        }
    }

    /// Advances an iterator value one element.
    pub(crate) fn iter_step(&mut self, iter: &Value) -> RunResult<IterStep> {
        let Value::Ref(iter_id) = iter else {
            return self.not_an_iterator(iter);
        };
        let iter_id = *iter_id;
        match self.heap.get(iter_id) {
            HeapData::Iter(_) => self.builtin_iter_step(iter_id),
            HeapData::Generator(generator) => match generator.state {
                GeneratorState::Done => Ok(IterStep::Exhausted),
                GeneratorState::Running => Err(ExcKind::value_error("generator already executing")),
                _ => Ok(IterStep::ResumeGen(iter_id)),
            },
            HeapData::Instance(_) => {
                if let Some(method) = self.class_dunder(iter_id, StaticStr::Next) {
                    let receiver = iter.clone_with_heap(self.heap);
                    Ok(IterStep::NeedCall(method, smallvec![receiver], IterCallKind::Next))
                } else {
                    self.not_an_iterator(iter)
                }
            }
            _ => self.not_an_iterator(iter),
        }
    }

    fn not_an_iterator(&mut self, iter: &Value) -> RunResult<IterStep> {
        let type_name = iter.type_name(self.heap, self.interns).into_owned();
        Err(ExcKind::type_error(format!("'{type_name}' object is not an iterator")))
    }

    /// Steps a heap `IterState`. Two-phase: read the position, produce the
    /// element, then bump the position.
    fn builtin_iter_step(&mut self, iter_id: HeapId) -> RunResult<IterStep> {
        // Snapshot the state shape without holding the borrow.
        enum Plan {
            List(HeapId, usize),
            Tuple(HeapId, usize),
            Str(Value, usize),
            Bytes(Value, usize),
            Range(crate::types::Range, usize),
            Dict { dict: HeapId, index: usize, expect_len: usize, mode: u8 },
            Set { set: HeapId, index: usize, expect_len: usize },
            Zip(Vec<Value>),
            Enumerate(Value, i64),
            Reversed(Value, usize),
            Map(Value, Value),
            Filter(Value, Value),
            SeqProto(Value, i64),
        }

        let plan = match self.heap.get(iter_id) {
            HeapData::Iter(state) => match state {
                IterState::List { list, index } => Plan::List(*list, *index),
                IterState::Tuple { tuple, index } => Plan::Tuple(*tuple, *index),
                IterState::Str { source, index } => Plan::Str(source.shallow_copy(), *index),
                IterState::Bytes { source, index } => Plan::Bytes(source.shallow_copy(), *index),
                IterState::Range { range, index } => Plan::Range(*range, *index),
                IterState::DictKeys { dict, index, expect_len } => {
                    Plan::Dict { dict: *dict, index: *index, expect_len: *expect_len, mode: 0 }
                }
                IterState::DictValues { dict, index, expect_len } => {
                    Plan::Dict { dict: *dict, index: *index, expect_len: *expect_len, mode: 1 }
                }
                IterState::DictItems { dict, index, expect_len } => {
                    Plan::Dict { dict: *dict, index: *index, expect_len: *expect_len, mode: 2 }
                }
                IterState::Set { set, index, expect_len } => {
                    Plan::Set { set: *set, index: *index, expect_len: *expect_len }
                }
                IterState::Zip { iters } => Plan::Zip(iters.iter().map(Value::shallow_copy).collect()),
                IterState::Enumerate { inner, count } => Plan::Enumerate(inner.shallow_copy(), *count),
                IterState::Reversed { source, remaining } => Plan::Reversed(source.shallow_copy(), *remaining),
                IterState::Map { func, inner } => Plan::Map(func.shallow_copy(), inner.shallow_copy()),
                IterState::Filter { func, inner } => Plan::Filter(func.shallow_copy(), inner.shallow_copy()),
                IterState::SeqProto { obj, index } => Plan::SeqProto(obj.shallow_copy(), *index),
            },
            _ => return Err(RunError::internal("iterator slot lost")),
        };

        match plan {
            Plan::List(list, index) => {
                let element = match self.heap.get(list) {
                    HeapData::List(l) => l.elements().get(index).map(Value::shallow_copy),
                    _ => return Err(RunError::internal("list iterator over non-list")),
                };
                match element {
                    Some(element) => {
                        if let Value::Ref(id) = &element {
                            self.heap.inc_ref(*id);
                        }
                        self.bump_index(iter_id);
                        Ok(IterStep::Value(element))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Tuple(tuple, index) => {
                let element = match self.heap.get(tuple) {
                    HeapData::Tuple(t) => t.elements().get(index).map(Value::shallow_copy),
                    _ => return Err(RunError::internal("tuple iterator over non-tuple")),
                };
                match element {
                    Some(element) => {
                        if let Value::Ref(id) = &element {
                            self.heap.inc_ref(*id);
                        }
                        self.bump_index(iter_id);
                        Ok(IterStep::Value(element))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Str(source, index) => {
                let ch = crate::value::str_content(&source, self.heap, self.interns)
                    .and_then(|text| text.chars().nth(index));
                match ch {
                    Some(ch) => {
                        let id = self
                            .heap
                            .alloc(HeapData::Str(Str::new(ch.to_string())))
                            .map_err(RunError::from)?;
                        self.bump_index(iter_id);
                        Ok(IterStep::Value(Value::Ref(id)))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Bytes(source, index) => {
                let byte = crate::value::bytes_content(&source, self.heap, self.interns)
                    .or_else(|| match &source {
                        Value::Ref(id) => match self.heap.get(*id) {
                            HeapData::ByteArray(b) => Some(b.as_slice()),
                            _ => None,
                        },
                        _ => None,
                    })
                    .and_then(|data| data.get(index).copied());
                match byte {
                    Some(byte) => {
                        self.bump_index(iter_id);
                        Ok(IterStep::Value(Value::Int(i64::from(byte))))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Range(range, index) => match range.get(index) {
                Some(element) => {
                    self.bump_index(iter_id);
                    Ok(IterStep::Value(Value::Int(element)))
                }
                None => Ok(IterStep::Exhausted),
            },
            Plan::Dict { dict, index, expect_len, mode } => {
                let pair = match self.heap.get(dict) {
                    HeapData::Dict(d) => {
                        if d.len() != expect_len {
                            return Err(ExcKind::runtime_error("dictionary changed size during iteration"));
                        }
                        d.pair_at(index).map(|(k, v)| (k.shallow_copy(), v.shallow_copy()))
                    }
                    _ => return Err(RunError::internal("dict iterator over non-dict")),
                };
                match pair {
                    Some((key, value)) => {
                        let element = match mode {
                            0 => {
                                if let Value::Ref(id) = &key {
                                    self.heap.inc_ref(*id);
                                }
                                key
                            }
                            1 => {
                                if let Value::Ref(id) = &value {
                                    self.heap.inc_ref(*id);
                                }
                                value
                            }
                            _ => {
                                if let Value::Ref(id) = &key {
                                    self.heap.inc_ref(*id);
                                }
                                if let Value::Ref(id) = &value {
                                    self.heap.inc_ref(*id);
                                }
                                let id = self
                                    .heap
                                    .alloc(HeapData::Tuple(Tuple::new(vec![key, value])))
                                    .map_err(RunError::from)?;
                                Value::Ref(id)
                            }
                        };
                        self.bump_index(iter_id);
                        Ok(IterStep::Value(element))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Set { set, index, expect_len } => {
                let element = match self.heap.get(set) {
                    HeapData::Set(s) | HeapData::FrozenSet(s) => {
                        if s.len() != expect_len {
                            return Err(ExcKind::runtime_error("set changed size during iteration"));
                        }
                        s.value_at(index).map(Value::shallow_copy)
                    }
                    _ => return Err(RunError::internal("set iterator over non-set")),
                };
                match element {
                    Some(element) => {
                        if let Value::Ref(id) = &element {
                            self.heap.inc_ref(*id);
                        }
                        self.bump_index(iter_id);
                        Ok(IterStep::Value(element))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Zip(inners) => {
                let mut elements = Vec::with_capacity(inners.len());
                for inner in &inners {
                    match self.iter_step(inner)? {
                        IterStep::Value(element) => elements.push(element),
                        IterStep::Exhausted => {
                            self.drop_values(elements);
                            return Ok(IterStep::Exhausted);
                        }
                        other => {
                            self.drop_values(elements);
                            self.dispose_iter_step(other);
                            return Err(ExcKind::type_error(
                                "zip over guest-defined iterators is not supported",
                            ));
                        }
                    }
                }
                let id = self
                    .heap
                    .alloc(HeapData::Tuple(Tuple::new(elements)))
                    .map_err(RunError::from)?;
                Ok(IterStep::Value(Value::Ref(id)))
            }
            Plan::Enumerate(inner, count) => match self.iter_step(&inner)? {
                IterStep::Value(element) => {
                    let id = self
                        .heap
                        .alloc(HeapData::Tuple(Tuple::new(vec![Value::Int(count), element])))
                        .map_err(RunError::from)?;
                    self.bump_enumerate(iter_id);
                    Ok(IterStep::Value(Value::Ref(id)))
                }
                IterStep::Exhausted => Ok(IterStep::Exhausted),
                other => {
                    self.dispose_iter_step(other);
                    Err(ExcKind::type_error(
                        "enumerate over guest-defined iterators is not supported",
                    ))
                }
            },
            Plan::Reversed(source, remaining) => {
                if remaining == 0 {
                    return Ok(IterStep::Exhausted);
                }
                let index = remaining - 1;
                let element = self.index_sequence(&source, index)?;
                match element {
                    Some(element) => {
                        self.bump_reversed(iter_id);
                        Ok(IterStep::Value(element))
                    }
                    None => Ok(IterStep::Exhausted),
                }
            }
            Plan::Map(func, inner) => match self.iter_step(&inner)? {
                IterStep::Value(element) => {
                    if self.is_guest_callable(&func) {
                        let callable = func.clone_with_heap(self.heap);
                        Ok(IterStep::NeedCall(callable, smallvec![element], IterCallKind::MapApply))
                    } else {
                        let mapped = self.call_builtin_sync(&func, smallvec![element])?;
                        Ok(IterStep::Value(mapped))
                    }
                }
                IterStep::Exhausted => Ok(IterStep::Exhausted),
                other => {
                    self.dispose_iter_step(other);
                    Err(ExcKind::type_error("map over guest-defined iterators is not supported"))
                }
            },
            Plan::Filter(func, inner) => loop {
                match self.iter_step(&inner)? {
                    IterStep::Value(element) => {
                        if matches!(func, Value::None) {
                            let keep = element.truthy(self.heap, self.interns).unwrap_or(true);
                            if keep {
                                return Ok(IterStep::Value(element));
                            }
                            element.drop_with_heap(self.heap);
                        } else if self.is_guest_callable(&func) {
                            let callable = func.clone_with_heap(self.heap);
                            let probe = element.clone_with_heap(self.heap);
                            return Ok(IterStep::NeedCall(
                                callable,
                                smallvec![probe],
                                IterCallKind::FilterCheck { item: element },
                            ));
                        } else {
                            let verdict = self.call_builtin_sync(&func, smallvec![element.clone_with_heap(self.heap)])?;
                            let keep = verdict.truthy(self.heap, self.interns).unwrap_or(true);
                            verdict.drop_with_heap(self.heap);
                            if keep {
                                return Ok(IterStep::Value(element));
                            }
                            element.drop_with_heap(self.heap);
                        }
                    }
                    IterStep::Exhausted => return Ok(IterStep::Exhausted),
                    other => {
                        self.dispose_iter_step(other);
                        return Err(ExcKind::type_error(
                            "filter over guest-defined iterators is not supported",
                        ));
                    }
                }
            },
            Plan::SeqProto(obj, index) => {
                let Value::Ref(obj_id) = &obj else {
                    return Err(RunError::internal("sequence-protocol adaptor over immediate"));
                };
                let Some(method) = self.class_dunder(*obj_id, StaticStr::GetItem) else {
                    return Err(ExcKind::type_error("object lost its __getitem__ during iteration"));
                };
                let receiver = obj.clone_with_heap(self.heap);
                self.bump_seq_proto(iter_id);
                Ok(IterStep::NeedCall(
                    method,
                    smallvec![receiver, Value::Int(index)],
                    IterCallKind::SeqGetItem,
                ))
            }
        }
    }

    /// Drops whatever an abandoned step carried.
    fn dispose_iter_step(&mut self, step: IterStep) {
        if let IterStep::NeedCall(callable, args, kind) = step {
            callable.drop_with_heap(self.heap);
            self.drop_values(args);
            if let IterCallKind::FilterCheck { item } = kind {
                item.drop_with_heap(self.heap);
            }
        }
    }

    /// Fetches element `index` of a builtin sequence for `reversed`.
    fn index_sequence(&mut self, source: &Value, index: usize) -> RunResult<Option<Value>> {
        match source {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(l) => Ok(l.elements().get(index).map(|v| {
                    let v = v.shallow_copy();
                    if let Value::Ref(id) = &v {
                        self.heap.inc_ref(*id);
                    }
                    v
                })),
                HeapData::Tuple(t) => Ok(t.elements().get(index).map(|v| {
                    let v = v.shallow_copy();
                    if let Value::Ref(id) = &v {
                        self.heap.inc_ref(*id);
                    }
                    v
                })),
                HeapData::Range(r) => Ok(r.get(index).map(Value::Int)),
                HeapData::Str(s) => match s.char_at(index) {
                    Some(ch) => {
                        let id = self
                            .heap
                            .alloc(HeapData::Str(Str::new(ch.to_string())))
                            .map_err(RunError::from)?;
                        Ok(Some(Value::Ref(id)))
                    }
                    None => Ok(None),
                },
                _ => Err(ExcKind::type_error("object is not reversible")),
            },
            Value::InternStr(sid) => {
                let ch = self.interns.get_str(*sid).chars().nth(index);
                match ch {
                    Some(ch) => {
                        let id = self
                            .heap
                            .alloc(HeapData::Str(Str::new(ch.to_string())))
                            .map_err(RunError::from)?;
                        Ok(Some(Value::Ref(id)))
                    }
                    None => Ok(None),
                }
            }
            _ => Err(ExcKind::type_error("object is not reversible")),
        }
    }

    fn bump_index(&mut self, iter_id: HeapId) {
        if let HeapData::Iter(state) = self.heap.get_mut(iter_id) {
            match state {
                IterState::List { index, .. }
                | IterState::Tuple { index, .. }
                | IterState::Str { index, .. }
                | IterState::Bytes { index, .. }
                | IterState::Range { index, .. }
                | IterState::DictKeys { index, .. }
                | IterState::DictValues { index, .. }
                | IterState::DictItems { index, .. }
                | IterState::Set { index, .. } => *index += 1,
                _ => {}
            }
        }
    }

    fn bump_enumerate(&mut self, iter_id: HeapId) {
        if let HeapData::Iter(IterState::Enumerate { count, .. }) = self.heap.get_mut(iter_id) {
            *count += 1;
        }
    }

    fn bump_reversed(&mut self, iter_id: HeapId) {
        if let HeapData::Iter(IterState::Reversed { remaining, .. }) = self.heap.get_mut(iter_id) {
            *remaining = remaining.saturating_sub(1);
        }
    }

    fn bump_seq_proto(&mut self, iter_id: HeapId) {
        if let HeapData::Iter(IterState::SeqProto { index, .. }) = self.heap.get_mut(iter_id) {
            *index += 1;
        }
    }

    /// Handles `YieldFrom` delegation in the current generator frame.
    pub(crate) fn yield_from_op(&mut self) -> RunResult<()> {
        if self.frame().generator.is_none() {
            return Err(RunError::internal("YieldFrom outside a generator frame"));
        }
        // The frame re-executes this instruction after each delegated
        // yield; advancing past it happens only on exhaustion.
        self.rewind();

        let sub = self.peek().clone_with_heap(self.heap);

        // A finished sub-generator hands its return value to the delegator.
        if let Value::Ref(id) = &sub
            && let HeapData::Generator(generator) = self.heap.get_mut(*id)
            && generator.state == GeneratorState::Done
        {
            let result = generator.result.take().unwrap_or(Value::None);
            sub.drop_with_heap(self.heap);
            let it = self.pop();
            it.drop_with_heap(self.heap);
            self.frame_mut().ip = self.instruction_ip + 1;
            self.push(result);
            return Ok(());
        }

        match self.iter_step(&sub) {
            Ok(IterStep::Value(value)) => {
                sub.drop_with_heap(self.heap);
                self.deliver_value(Delivery::ForwardYield, value)
            }
            Ok(IterStep::Exhausted) => {
                sub.drop_with_heap(self.heap);
                let it = self.pop();
                it.drop_with_heap(self.heap);
                self.frame_mut().ip = self.instruction_ip + 1;
                self.push(Value::None);
                Ok(())
            }
            Ok(IterStep::ResumeGen(gen_id)) => {
                sub.drop_with_heap(self.heap);
                self.resume_generator(
                    gen_id,
                    ReturnCtx::NextResult {
                        delivery: Delivery::ForwardYield,
                    },
                )
            }
            Ok(step @ IterStep::NeedCall(..)) => {
                sub.drop_with_heap(self.heap);
                self.dispose_iter_step(step);
                Err(ExcKind::type_error(
                    "yield from over guest-defined iterators is not supported",
                ))
            }
            Err(err) => {
                sub.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// Handles `ListExtend`.
    pub(crate) fn list_extend_op(&mut self) -> RunResult<()> {
        let iterable = self.pop();
        let elements = match self.collect_sync_iterable(&iterable)? {
            Some(elements) => {
                iterable.drop_with_heap(self.heap);
                elements
            }
            None => {
                let type_name = iterable.type_name(self.heap, self.interns).into_owned();
                iterable.drop_with_heap(self.heap);
                return Err(ExcKind::type_error(format!(
                    "Value after * must be an iterable, not {type_name}"
                )));
            }
        };
        let Value::Ref(list_id) = self.peek() else {
            self.drop_values(elements);
            return Err(RunError::internal("ListExtend target is not a list"));
        };
        let list_id = *list_id;
        match self.heap.get_mut(list_id) {
            HeapData::List(list) => {
                list.elements_mut().extend(elements);
                Ok(())
            }
            _ => {
                self.drop_values(elements);
                Err(RunError::internal("ListExtend target is not a list"))
            }
        }
    }

    /// Clones the elements of a synchronously iterable builtin value.
    ///
    /// Returns `None` when the value needs guest-driven iteration.
    pub(crate) fn collect_sync_iterable(&mut self, value: &Value) -> RunResult<Option<Vec<Value>>> {
        let elements: Vec<Value> = match value {
            Value::InternStr(sid) => {
                let chars: Vec<String> = self.interns.get_str(*sid).chars().map(|c| c.to_string()).collect();
                let mut out = Vec::with_capacity(chars.len());
                for ch in chars {
                    let id = self.heap.alloc(HeapData::Str(Str::new(ch))).map_err(RunError::from)?;
                    out.push(Value::Ref(id));
                }
                out
            }
            Value::InternBytes(bid) => self
                .interns
                .get_bytes(*bid)
                .iter()
                .map(|&b| Value::Int(i64::from(b)))
                .collect(),
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::List(l) => l.elements().iter().map(Value::shallow_copy).collect(),
                    HeapData::Tuple(t) => t.elements().iter().map(Value::shallow_copy).collect(),
                    HeapData::Dict(d) => d.iter().map(|(k, _)| k.shallow_copy()).collect(),
                    HeapData::Set(s) | HeapData::FrozenSet(s) => s.iter().map(Value::shallow_copy).collect(),
                    HeapData::Range(r) => {
                        let estimated = r.len().saturating_mul(size_of::<Value>());
                        self.heap
                            .tracker()
                            .check_large_result(estimated)
                            .map_err(RunError::from)?;
                        (0..r.len()).map(|i| Value::Int(r.get(i).expect("index in range"))).collect()
                    }
                    HeapData::Str(s) => {
                        let chars: Vec<String> = s.as_str().chars().map(|c| c.to_string()).collect();
                        let mut out = Vec::with_capacity(chars.len());
                        for ch in chars {
                            let id = self.heap.alloc(HeapData::Str(Str::new(ch))).map_err(RunError::from)?;
                            out.push(Value::Ref(id));
                        }
                        out
                    }
                    HeapData::Bytes(b) | HeapData::ByteArray(b) => {
                        b.as_slice().iter().map(|&x| Value::Int(i64::from(x))).collect()
                    }
                    _ => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        // The shallow copies above share references; account for them.
        for element in &elements {
            if let Value::Ref(id) = element {
                self.heap.inc_ref(*id);
            }
        }
        Ok(Some(elements))
    }

    /// Allocates a `zip`/`enumerate`/`reversed`/`map`/`filter` view.
    pub(crate) fn alloc_iter_view(&mut self, state: IterState) -> RunResult<Value> {
        let id = self.heap.alloc(HeapData::Iter(state)).map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }

    /// Whether calling this value runs guest code (needs a frame).
    pub(crate) fn is_guest_callable(&self, value: &Value) -> bool {
        match value {
            Value::Function(_) => true,
            Value::Ref(id) => matches!(
                self.heap.get(*id),
                HeapData::Closure(_) | HeapData::BoundMethod(_) | HeapData::Class(_) | HeapData::Instance(_)
            ),
            _ => false,
        }
    }

    /// `reversed(seq)` length, for the view's countdown.
    pub(crate) fn reversible_len(&self, value: &Value) -> Option<usize> {
        match value {
            Value::InternStr(sid) => Some(self.interns.get_str(*sid).chars().count()),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(l) => Some(l.len()),
                HeapData::Tuple(t) => Some(t.len()),
                HeapData::Range(r) => Some(r.len()),
                HeapData::Str(s) => Some(s.char_len()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Resolves a dunder on an instance's class MRO, returning a callable
    /// (unbound; the caller passes the receiver explicitly). `None` when the
    /// value is not an instance or the class does not define it.
    pub(crate) fn class_dunder(&self, instance_id: HeapId, name: StaticStr) -> Option<Value> {
        let HeapData::Instance(instance) = self.heap.get(instance_id) else {
            return None;
        };
        let method = self.lookup_on_class_mro(instance.class_id, self.text(name.into()))?;
        Some(method.clone_with_heap(self.heap))
    }

    /// Scans a class MRO for a name, returning a borrowed value.
    pub(crate) fn lookup_on_class_mro(&self, class_id: HeapId, name: &str) -> Option<&Value> {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            return None;
        };
        if let Some(value) = class.get_local(name) {
            return Some(value);
        }
        for &ancestor in &class.mro {
            if ancestor == class_id {
                continue;
            }
            if let HeapData::Class(ancestor_class) = self.heap.get(ancestor)
                && let Some(value) = ancestor_class.get_local(name)
            {
                return Some(value);
            }
        }
        None
    }
}
