//! Raise, unwind, handler matching, and `except*` splitting.
//!
//! [`Vm::handle_error`] is the single funnel: every raised [`RunError`]
//! passes through it. Catchable errors search the exception tables frame by
//! frame, restoring the recorded operand depth before control transfers;
//! uncatchable ones (resource breaches) transfer only through finally-kind
//! entries, so cleanup runs while the error keeps propagating to the host.
//! While unwinding, the popped frame's return ctx gets a say:
//! `StopIteration` escaping a `__next__` frame is iteration exhaustion, an
//! index-error kind ends a sequence-protocol scan, and an attribute-error
//! kind escaping `__getattribute__` falls back to `__getattr__`.

use crate::{
    exc::{ExcKind, ExcPayload, ExcRaise, RawFrame, RunError, RunResult},
    frame::{ReturnCtx},
    heap::{HeapData, HeapId},
    intern::{StaticStr, StringId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::GeneratorState,
    value::Value,
};

use smallvec::smallvec;

use super::Vm;

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Traceback link for the frame at `frame_index`, faulting at `ip`.
    fn raw_frame_at(&self, frame_index: usize, ip: usize) -> RawFrame {
        let frame = &self.frames[frame_index];
        let code = self.code_for(frame.code_ref);
        let func_id: StringId = match frame.code_ref {
            crate::frame::CodeRef::Module => StaticStr::Module.into(),
            crate::frame::CodeRef::Function(_) => code.qualname_id(),
        };
        RawFrame {
            source_id: code.source_id(),
            line: code.line_for(u32::try_from(ip).unwrap_or(u32::MAX)),
            func_id,
        }
    }

    /// Drops the guest instance an in-flight error carries, if any.
    pub(crate) fn discard_error(&mut self, error: RunError) {
        if let Some(raise) = error.into_raise()
            && let Some(original) = raise.original
        {
            original.drop_with_heap(self.heap);
        }
    }

    /// Materializes the exception value a handler receives, transferring
    /// the original guest instance when one exists.
    fn exception_value(&mut self, raise: &mut ExcRaise) -> RunResult<Value> {
        if let Some(original) = raise.original.take() {
            return Ok(original);
        }
        let id = self
            .heap
            .alloc(HeapData::Exception(raise.exc.clone()))
            .map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }

    /// Dispatches a raised error: `Ok(())` when a handler caught it (the
    /// dispatcher continues), `Err` when it must surface to the host.
    pub(crate) fn handle_error(&mut self, mut error: RunError) -> Result<(), RunError> {
        if matches!(error, RunError::Internal(_)) {
            return Err(error);
        }

        // The raising frame heads the traceback.
        if let RunError::Exc(raise) | RunError::Uncatchable(raise) = &mut error
            && raise.exc.frames.is_empty()
            && !self.frames.is_empty()
        {
            let link = self.raw_frame_at(self.frames.len() - 1, self.instruction_ip);
            raise.exc.push_frame(link);
        }

        let mut first = true;
        loop {
            if self.frames.is_empty() {
                return Err(error);
            }

            // Search this frame's exception table. Catchable errors may
            // transfer to any handler; uncatchable ones (resource breaches)
            // never match `except` but still run every covering `finally`
            // before continuing to unwind.
            {
                let frame_index = self.frames.len() - 1;
                let fault_ip = if first {
                    self.instruction_ip
                } else {
                    self.frames[frame_index].ip.saturating_sub(1)
                };
                let code = self.code_for(self.frames[frame_index].code_ref);
                let ip = u32::try_from(fault_ip).unwrap_or(u32::MAX);
                let entry = match &error {
                    RunError::Exc(_) => code.find_handler(ip),
                    RunError::Uncatchable(_) => code.find_finally_handler(ip),
                    RunError::Internal(_) => None,
                };
                if let Some(entry) = entry {
                    let mut raise = match error {
                        RunError::Exc(raise) | RunError::Uncatchable(raise) => raise,
                        RunError::Internal(_) => unreachable!("internal errors never match handlers"),
                    };
                    // Restore the recorded operand depth.
                    let excess: Vec<Value> = {
                        let frame = self.frames.last_mut().expect("frame present");
                        let keep = usize::from(entry.stack_depth);
                        frame.stack.split_off(keep.min(frame.stack.len()))
                    };
                    self.drop_values(excess);

                    let exc_value = self.exception_value(&mut raise)?;
                    self.handled.push((raise.exc, self.frames.len()));
                    self.push(exc_value);
                    self.frame_mut().ip = entry.handler as usize;
                    return Ok(());
                }
            }

            // No handler here: record the caller link and pop the frame.
            let frame_index = self.frames.len() - 1;
            if !first {
                let fault_ip = self.frames[frame_index].ip.saturating_sub(1);
                let link = self.raw_frame_at(frame_index, fault_ip);
                if let RunError::Exc(raise) | RunError::Uncatchable(raise) = &mut error {
                    raise.exc.push_frame(link);
                }
            }
            first = false;

            let mut frame = self.frames.pop().expect("frame present");
            let generator = frame.generator.take();
            let ret = std::mem::replace(&mut frame.ret, ReturnCtx::Discard);

            // A generator body the error escapes is finished; PEP 479
            // converts an escaping StopIteration into the runtime kind.
            if let Some(gen_id) = generator {
                self.finish_generator_on_error(gen_id);
                if error.kind() == Some(ExcKind::StopIteration) && matches!(error, RunError::Exc(_)) {
                    let RunError::Exc(old_raise) = error else {
                        unreachable!("kind implies catchable");
                    };
                    if let Some(original) = old_raise.original {
                        original.drop_with_heap(self.heap);
                    }
                    let mut payload = ExcPayload::with_message(ExcKind::RuntimeError, "generator raised StopIteration");
                    payload.cause = Some(Box::new(old_raise.exc));
                    payload.suppress_context = true;
                    error = RunError::Exc(Box::new(payload.into_raise()));
                }
            }

            // Return-ctx interception.
            match ret {
                ReturnCtx::NextResult { delivery }
                    if generator.is_none()
                        && error.is_stop_iteration() =>
                {
                    self.discard_error(error);
                    self.dispose_frame_shell(frame);
                    return match self.deliver_exhausted(delivery) {
                        Ok(()) => Ok(()),
                        Err(err) => self.handle_error(err),
                    };
                }
                ReturnCtx::SeqProtoNext { delivery }
                    if error.kind() == Some(ExcKind::IndexError) && matches!(error, RunError::Exc(_)) =>
                {
                    self.discard_error(error);
                    self.dispose_frame_shell(frame);
                    if let Some(gen_id) = generator {
                        self.heap.dec_ref(gen_id);
                    }
                    return match self.deliver_exhausted(delivery) {
                        Ok(()) => Ok(()),
                        Err(err) => self.handle_error(err),
                    };
                }
                ReturnCtx::GetAttributeResult { obj, name }
                    if error.kind() == Some(ExcKind::AttributeError) && matches!(error, RunError::Exc(_)) =>
                {
                    self.dispose_frame_shell(frame);
                    if let Some(gen_id) = generator {
                        self.heap.dec_ref(gen_id);
                    }
                    let class_id = self.instance_class(&obj);
                    let hook = class_id.and_then(|cid| {
                        self.lookup_on_class_mro(cid, self.text(StaticStr::GetAttrHook.into()))
                            .map(|m| m.clone_with_heap(self.heap))
                    });
                    match hook {
                        Some(hook) => {
                            self.discard_error(error);
                            let attr = self.text(name).to_owned();
                            let name_value = match self.alloc_str(&attr) {
                                Ok(v) => v,
                                Err(err) => {
                                    obj.drop_with_heap(self.heap);
                                    hook.drop_with_heap(self.heap);
                                    return self.handle_error(err);
                                }
                            };
                            return match self.push_call_frame(hook, smallvec![obj, name_value], ReturnCtx::Push) {
                                Ok(()) => Ok(()),
                                Err(err) => self.handle_error(err),
                            };
                        }
                        None => {
                            obj.drop_with_heap(self.heap);
                            // The original attribute error keeps unwinding.
                        }
                    }
                }
                ReturnCtx::TaskRoot { .. } => {
                    // A gather child failed uncaught: the whole gather
                    // aborts and the error continues from the await site.
                    self.abort_gather();
                }
                other => self.dispose_ctx(other),
            }

            if let Some(gen_id) = generator {
                self.heap.dec_ref(gen_id);
            }
            self.dispose_frame_shell(frame);
            self.prune_handled();
        }
    }

    fn finish_generator_on_error(&mut self, gen_id: HeapId) {
        if !self.heap.is_live(gen_id) {
            return;
        }
        match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => {
                generator.state = GeneratorState::Done;
                generator.frame = None;
            }
            HeapData::Coroutine(coroutine) => {
                coroutine.state = GeneratorState::Done;
                coroutine.frame = None;
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Raise forms
    // ------------------------------------------------------------------

    /// Builds the error for a `Raise` instruction (`arg` = operand count).
    pub(crate) fn make_raise(&mut self, arg: u32) -> RunError {
        match arg {
            0 => match self.handled.last() {
                Some((payload, _)) => {
                    // A bare raise re-raises the handled exception without
                    // re-chaining it onto itself.
                    let raise = Box::new(payload.clone().into_raise());
                    if raise.exc.uncatchable {
                        RunError::Uncatchable(raise)
                    } else {
                        RunError::Exc(raise)
                    }
                }
                None => ExcKind::runtime_error("No active exception to re-raise"),
            },
            1 => {
                let exc = self.pop();
                self.raise_from_value(exc, None)
            }
            _ => {
                let cause = self.pop();
                let exc = self.pop();
                self.raise_from_value(exc, Some(cause))
            }
        }
    }

    /// Re-raises an exception value, traceback and uncatchability
    /// preserved (the `Reraise` ending a finally-kind handler must not
    /// launder a resource breach into something `except` can swallow).
    pub(crate) fn reraise_value(&mut self, value: Value) -> RunError {
        match self.payload_of_exc_value(&value) {
            Some(payload) => {
                let uncatchable = payload.uncatchable;
                let raise = Box::new(ExcRaise {
                    exc: payload,
                    original: Some(value),
                });
                if uncatchable {
                    RunError::Uncatchable(raise)
                } else {
                    RunError::Exc(raise)
                }
            }
            None => {
                value.drop_with_heap(self.heap);
                ExcKind::type_error("exceptions must derive from BaseException")
            }
        }
    }

    /// Converts a raised value (+ optional `from` cause) into an error.
    fn raise_from_value(&mut self, exc: Value, cause: Option<Value>) -> RunError {
        let mut payload = match self.payload_of_raisable(&exc) {
            Some(payload) => payload,
            None => {
                exc.drop_with_heap(self.heap);
                if let Some(cause) = cause {
                    cause.drop_with_heap(self.heap);
                }
                return ExcKind::type_error("exceptions must derive from BaseException");
            }
        };

        // Implicit context from the exception being handled.
        if let Some((handled, _)) = self.handled.last() {
            payload.chain_context(handled);
        }

        // Explicit cause.
        if let Some(cause_value) = cause {
            match &cause_value {
                Value::None => {
                    payload.cause = None;
                    payload.suppress_context = true;
                    cause_value.drop_with_heap(self.heap);
                }
                _ => match self.payload_of_raisable(&cause_value) {
                    Some(cause_payload) => {
                        payload.cause = Some(Box::new(cause_payload));
                        payload.suppress_context = true;
                        cause_value.drop_with_heap(self.heap);
                    }
                    None => {
                        cause_value.drop_with_heap(self.heap);
                        exc.drop_with_heap(self.heap);
                        return ExcKind::type_error("exception causes must derive from BaseException");
                    }
                },
            }
        }

        let original = match &exc {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Exception(_) | HeapData::Instance(_)) => {
                Some(exc)
            }
            _ => {
                exc.drop_with_heap(self.heap);
                None
            }
        };
        let uncatchable = payload.uncatchable;
        let raise = Box::new(ExcRaise {
            exc: payload,
            original,
        });
        if uncatchable {
            RunError::Uncatchable(raise)
        } else {
            RunError::Exc(raise)
        }
    }

    /// Payload for a value that may be raised: an exception instance, an
    /// exception class, or a guest exception class/instance.
    fn payload_of_raisable(&self, value: &Value) -> Option<ExcPayload> {
        match value {
            Value::Builtin(crate::builtins::Builtin::Exc(kind)) => Some(ExcPayload::new(*kind)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Exception(payload) => Some(payload.clone()),
                HeapData::Class(class) => class.exc_kind.map(|kind| {
                    let mut payload = ExcPayload::new(kind);
                    payload.class_name = Some(self.text(class.name_id).to_owned());
                    payload.class_slot = Some((id.index(), self.heap.uid_of(*id)));
                    payload
                }),
                HeapData::Instance(instance) => match self.heap.get(instance.class_id) {
                    HeapData::Class(class) => class.exc_kind.map(|kind| {
                        let mut payload = ExcPayload::new(kind);
                        payload.class_name = Some(self.text(class.name_id).to_owned());
                        payload.class_slot =
                            Some((instance.class_id.index(), self.heap.uid_of(instance.class_id)));
                        // A guest __init__ conventionally stores `message`.
                        if let Some(message) = instance
                            .get_attr("message")
                            .and_then(|v| crate::value::str_content(v, self.heap, self.interns))
                        {
                            payload.message = Some(message.to_owned());
                        }
                        payload
                    }),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        }
    }

    /// Payload of an already-materialized exception value.
    fn payload_of_exc_value(&self, value: &Value) -> Option<ExcPayload> {
        match value {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Exception(payload) => Some(payload.clone()),
                HeapData::Instance(_) => self.payload_of_raisable(value),
                _ => None,
            },
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Handler matching
    // ------------------------------------------------------------------

    /// Handles `CheckExcMatch`: pops a type (or tuple), peeks the exception
    /// below, pushes the match verdict.
    pub(crate) fn check_exc_match(&mut self) -> RunResult<()> {
        let match_type = self.pop();
        let exc_payload = match self.payload_of_exc_value(self.frame().stack.last().expect("exception on stack")) {
            Some(payload) => payload,
            None => {
                match_type.drop_with_heap(self.heap);
                return Err(RunError::internal("CheckExcMatch without an exception on the stack"));
            }
        };
        let verdict = self.exc_matches(&exc_payload, &match_type)?;
        match_type.drop_with_heap(self.heap);
        self.push(Value::Bool(verdict));
        Ok(())
    }

    /// Whether a payload matches a handler type (or tuple of types).
    pub(crate) fn exc_matches(&self, payload: &ExcPayload, match_type: &Value) -> RunResult<bool> {
        match match_type {
            Value::Builtin(crate::builtins::Builtin::Exc(kind)) => Ok(payload.kind.is_caught_by(*kind)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(t) => {
                    for member in t.elements() {
                        if self.exc_matches(payload, member)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                HeapData::Class(handler_class) => {
                    let Some(handler_kind) = handler_class.exc_kind else {
                        return Err(ExcKind::type_error(
                            "catching classes that do not inherit from BaseException is not allowed",
                        ));
                    };
                    // A guest handler class matches when the raised class
                    // is it or one of its subclasses.
                    if let Some((slot, uid)) = payload.class_slot {
                        let raised_class = HeapId::from_index(slot);
                        if self.heap.is_live(raised_class) && self.heap.uid_of(raised_class) == uid {
                            if raised_class == *id {
                                return Ok(true);
                            }
                            if let HeapData::Class(raised) = self.heap.get(raised_class) {
                                return Ok(raised.mro.contains(id));
                            }
                        }
                        Ok(false)
                    } else {
                        // A builtin-raised exception never matches a guest
                        // subclass, only the builtin kinds above it.
                        let _ = handler_kind;
                        Ok(false)
                    }
                }
                _ => Err(ExcKind::type_error(
                    "catching classes that do not inherit from BaseException is not allowed",
                )),
            },
            _ => Err(ExcKind::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Exception groups (`except*`)
    // ------------------------------------------------------------------

    /// Handles `ExceptStarMatch`: pops a type, pops the remaining group;
    /// pushes the non-matching rest (or `None`) then the matching
    /// sub-group (or `None`).
    pub(crate) fn except_star_match(&mut self) -> RunResult<()> {
        let match_type = self.pop();
        let rest_value = self.pop();
        let payload = match self.payload_of_exc_value(&rest_value) {
            Some(payload) => payload,
            None => {
                match_type.drop_with_heap(self.heap);
                rest_value.drop_with_heap(self.heap);
                return Err(RunError::internal("ExceptStarMatch without an exception"));
            }
        };
        rest_value.drop_with_heap(self.heap);

        // A lone exception behaves as a single-member group.
        let (message, members) = if payload.kind == ExcKind::ExceptionGroup {
            (payload.message.clone().unwrap_or_default(), payload.group.clone())
        } else {
            (String::new(), vec![payload.clone()])
        };

        let mut matched: Vec<ExcPayload> = Vec::new();
        let mut remaining: Vec<ExcPayload> = Vec::new();
        for member in members {
            if self.exc_matches(&member, &match_type)? {
                matched.push(member);
            } else {
                remaining.push(member);
            }
        }
        match_type.drop_with_heap(self.heap);

        let rest = match remaining.len() {
            0 => Value::None,
            _ => {
                let rest_payload = ExcPayload::group(message.clone(), remaining);
                let id = self.heap.alloc(HeapData::Exception(rest_payload)).map_err(RunError::from)?;
                Value::Ref(id)
            }
        };
        let matched_value = match matched.len() {
            0 => Value::None,
            _ => {
                let matched_payload = ExcPayload::group(message, matched);
                let id = self
                    .heap
                    .alloc(HeapData::Exception(matched_payload))
                    .map_err(RunError::from)?;
                Value::Ref(id)
            }
        };
        self.push(rest);
        self.push(matched_value);
        Ok(())
    }
}
