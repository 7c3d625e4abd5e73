//! The attribute protocol.
//!
//! Reads on instances walk, in order: a `__getattribute__` override on the
//! type (which then owns the whole read), data descriptors on the MRO, the
//! instance dict, class-level values and non-data descriptors, and finally
//! `__getattr__`. Only the attribute-error kind escaping `__getattribute__`
//! triggers the `__getattr__` fallback; any other error propagates.
//!
//! Operator dunders never take this path: the dispatcher looks them up on
//! the type directly.

use crate::{
    builtins::{Builtin, BuiltinMethod},
    exc::{ExcKind, RunError, RunResult},
    frame::ReturnCtx,
    heap::{HeapData, HeapId},
    intern::{StaticStr, StringId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{BoundMethod, Str, Tuple},
    value::Value,
};

use smallvec::smallvec;

use super::Vm;

/// What a class-level hit looks like.
enum ClassAttr {
    /// A plain function: binds to the instance on access.
    Method(Value),
    /// A data descriptor instance (`__get__` + `__set__`).
    DataDescriptor(Value),
    /// A non-data descriptor instance (`__get__` only).
    NonDataDescriptor(Value),
    /// Any other value: returned as-is.
    Plain(Value),
}

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Handles `LoadAttr`.
    pub(crate) fn load_attr_op(&mut self, arg: u32) -> RunResult<()> {
        let name_id = StringId::from_raw(arg);
        let obj = self.pop();
        let name = self.text(name_id).to_owned();
        self.load_attr_named(obj, &name)
    }

    /// Generic attribute read; consumes `obj` and pushes the result (or a
    /// frame producing it).
    pub(crate) fn load_attr_named(&mut self, obj: Value, name: &str) -> RunResult<()> {
        match &obj {
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Instance(_) => self.instance_load_attr(obj, id, name),
                    HeapData::Class(_) => self.class_load_attr(obj, id, name),
                    HeapData::Exception(_) => self.exception_load_attr(obj, id, name),
                    _ => self.builtin_load_attr(obj, name),
                }
            }
            _ => self.builtin_load_attr(obj, name),
        }
    }

    fn instance_load_attr(&mut self, obj: Value, instance_id: HeapId, name: &str) -> RunResult<()> {
        let class_id = match self.heap.get(instance_id) {
            HeapData::Instance(instance) => instance.class_id,
            _ => return Err(RunError::internal("instance vanished during attribute read")),
        };

        // A __getattribute__ override owns the read entirely.
        if let Some(hook) = self
            .lookup_on_class_mro(class_id, self.text(StaticStr::GetAttribute.into()))
            .map(|m| m.clone_with_heap(self.heap))
        {
            let receiver = obj.clone_with_heap(self.heap);
            let name_value = self.alloc_str(name)?;
            let name_for_fallback = self.interns.lookup(name).unwrap_or(StaticStr::GetAttrHook.into());
            return self.push_call_frame(
                hook,
                smallvec![receiver, name_value],
                ReturnCtx::GetAttributeResult {
                    obj,
                    name: name_for_fallback,
                },
            );
        }

        // One MRO scan decides the shape; data descriptors shadow the
        // instance dict, everything else yields to it.
        let shape = self.class_attr_shape(class_id, name);

        if let Some(ClassAttr::DataDescriptor(descriptor)) = shape {
            let getter = self
                .descriptor_get(&descriptor)
                .expect("data descriptors define __get__");
            self.heap.inc_ref(class_id);
            return self.push_call_frame(getter, smallvec![descriptor, obj, Value::Ref(class_id)], ReturnCtx::Push);
        }

        // Instance dict.
        let hit = match self.heap.get(instance_id) {
            HeapData::Instance(instance) => instance.get_attr(name).map(Value::shallow_copy),
            _ => None,
        };
        if let Some(value) = hit {
            if let Value::Ref(vid) = &value {
                self.heap.inc_ref(*vid);
            }
            self.dispose_class_attr(shape);
            obj.drop_with_heap(self.heap);
            self.push(value);
            return Ok(());
        }

        // Class-level values.
        match shape {
            Some(ClassAttr::Method(function)) => {
                let method = BoundMethod {
                    callable: function,
                    receiver: obj,
                };
                let id = self.heap.alloc(HeapData::BoundMethod(method)).map_err(RunError::from)?;
                self.push(Value::Ref(id));
                Ok(())
            }
            Some(ClassAttr::NonDataDescriptor(descriptor)) => {
                let getter = self
                    .descriptor_get(&descriptor)
                    .expect("non-data descriptors define __get__");
                self.heap.inc_ref(class_id);
                self.push_call_frame(getter, smallvec![descriptor, obj, Value::Ref(class_id)], ReturnCtx::Push)
            }
            Some(ClassAttr::DataDescriptor(_)) => unreachable!("data descriptors returned above"),
            Some(ClassAttr::Plain(value)) => {
                obj.drop_with_heap(self.heap);
                self.push(value);
                Ok(())
            }
            None => self.getattr_fallback(obj, class_id, name),
        }
    }

    fn dispose_class_attr(&mut self, shape: Option<ClassAttr>) {
        if let Some(
            ClassAttr::Method(value)
            | ClassAttr::DataDescriptor(value)
            | ClassAttr::NonDataDescriptor(value)
            | ClassAttr::Plain(value),
        ) = shape
        {
            value.drop_with_heap(self.heap);
        }
    }

    /// The `__getattr__` fallback, shared with the `__getattribute__`
    /// attribute-error path.
    pub(crate) fn getattr_fallback(&mut self, obj: Value, class_id: HeapId, name: &str) -> RunResult<()> {
        if let Some(hook) = self
            .lookup_on_class_mro(class_id, self.text(StaticStr::GetAttrHook.into()))
            .map(|m| m.clone_with_heap(self.heap))
        {
            let name_value = self.alloc_str(name)?;
            return self.push_call_frame(hook, smallvec![obj, name_value], ReturnCtx::Push);
        }
        let type_name = obj.type_name(self.heap, self.interns).into_owned();
        obj.drop_with_heap(self.heap);
        Err(ExcKind::attribute_error(type_name, name))
    }

    /// Shape of a class-level attribute hit, with an owned value.
    fn class_attr_shape(&mut self, class_id: HeapId, name: &str) -> Option<ClassAttr> {
        let raw = self.lookup_on_class_mro(class_id, name)?.shallow_copy();
        if let Value::Ref(id) = &raw {
            self.heap.inc_ref(*id);
        }
        match &raw {
            Value::Function(_) => Some(ClassAttr::Method(raw)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Closure(_) => Some(ClassAttr::Method(raw)),
                HeapData::Instance(instance) => {
                    let descriptor_class = instance.class_id;
                    let has_get = self
                        .lookup_on_class_mro(descriptor_class, self.text(StaticStr::Get.into()))
                        .is_some();
                    let has_set = self
                        .lookup_on_class_mro(descriptor_class, self.text(StaticStr::Set.into()))
                        .is_some()
                        || self
                            .lookup_on_class_mro(descriptor_class, self.text(StaticStr::Delete.into()))
                            .is_some();
                    match (has_get, has_set) {
                        (true, true) => Some(ClassAttr::DataDescriptor(raw)),
                        (true, false) => Some(ClassAttr::NonDataDescriptor(raw)),
                        _ => Some(ClassAttr::Plain(raw)),
                    }
                }
                _ => Some(ClassAttr::Plain(raw)),
            },
            _ => Some(ClassAttr::Plain(raw)),
        }
    }

    fn descriptor_get(&mut self, descriptor: &Value) -> Option<Value> {
        let Value::Ref(id) = descriptor else { return None };
        self.class_dunder(*id, StaticStr::Get)
    }

    fn class_load_attr(&mut self, obj: Value, class_id: HeapId, name: &str) -> RunResult<()> {
        // Introspection surface first.
        match name {
            "__name__" => {
                let class_name = match self.heap.get(class_id) {
                    HeapData::Class(c) => self.text(c.name_id).to_owned(),
                    _ => String::new(),
                };
                obj.drop_with_heap(self.heap);
                let value = self.alloc_str(&class_name)?;
                self.push(value);
                return Ok(());
            }
            "__mro__" => {
                let mut entries = vec![class_id];
                if let HeapData::Class(c) = self.heap.get(class_id) {
                    entries.extend(c.mro.iter().copied());
                }
                for &entry in &entries {
                    self.heap.inc_ref(entry);
                }
                let elements = entries.into_iter().map(Value::Ref).collect();
                obj.drop_with_heap(self.heap);
                let id = self
                    .heap
                    .alloc(HeapData::Tuple(Tuple::new(elements)))
                    .map_err(RunError::from)?;
                self.push(Value::Ref(id));
                return Ok(());
            }
            "__bases__" => {
                let bases: Vec<HeapId> = match self.heap.get(class_id) {
                    HeapData::Class(c) => c.bases.clone(),
                    _ => Vec::new(),
                };
                for &base in &bases {
                    self.heap.inc_ref(base);
                }
                let elements = bases.into_iter().map(Value::Ref).collect();
                obj.drop_with_heap(self.heap);
                let id = self
                    .heap
                    .alloc(HeapData::Tuple(Tuple::new(elements)))
                    .map_err(RunError::from)?;
                self.push(Value::Ref(id));
                return Ok(());
            }
            _ => {}
        }

        let hit = self.lookup_on_class_mro(class_id, name).map(Value::shallow_copy);
        match hit {
            Some(value) => {
                if let Value::Ref(vid) = &value {
                    self.heap.inc_ref(*vid);
                }
                obj.drop_with_heap(self.heap);
                self.push(value);
                Ok(())
            }
            None => {
                let class_name = match self.heap.get(class_id) {
                    HeapData::Class(c) => self.text(c.name_id).to_owned(),
                    _ => "type".to_owned(),
                };
                obj.drop_with_heap(self.heap);
                Err(ExcKind::attribute_error(format!("type[{class_name}]"), name))
            }
        }
    }

    fn exception_load_attr(&mut self, obj: Value, exc_id: HeapId, name: &str) -> RunResult<()> {
        match name {
            "args" => {
                let message = match self.heap.get(exc_id) {
                    HeapData::Exception(payload) => payload.message.clone(),
                    _ => None,
                };
                obj.drop_with_heap(self.heap);
                let elements = match message {
                    Some(message) => vec![self.alloc_str(&message)?],
                    None => Vec::new(),
                };
                let id = self
                    .heap
                    .alloc(HeapData::Tuple(Tuple::new(elements)))
                    .map_err(RunError::from)?;
                self.push(Value::Ref(id));
                Ok(())
            }
            _ => {
                let type_name = obj.type_name(self.heap, self.interns).into_owned();
                obj.drop_with_heap(self.heap);
                Err(ExcKind::attribute_error(type_name, name))
            }
        }
    }

    fn builtin_load_attr(&mut self, obj: Value, name: &str) -> RunResult<()> {
        let receiver_type = obj.type_of(self.heap);
        if let Some(method) = BuiltinMethod::resolve(receiver_type, name) {
            let bound = BoundMethod {
                callable: Value::Builtin(Builtin::Method(method)),
                receiver: obj,
            };
            let id = self.heap.alloc(HeapData::BoundMethod(bound)).map_err(RunError::from)?;
            self.push(Value::Ref(id));
            return Ok(());
        }
        let type_name = obj.type_name(self.heap, self.interns).into_owned();
        obj.drop_with_heap(self.heap);
        Err(ExcKind::attribute_error(type_name, name))
    }

    /// Handles `StoreAttr`. Stack (push order): value, object.
    pub(crate) fn store_attr_op(&mut self, arg: u32) -> RunResult<()> {
        let name_id = StringId::from_raw(arg);
        let obj = self.pop();
        let value = self.pop();
        let name = self.text(name_id).to_owned();
        self.store_attr_named(obj, &name, value)
    }

    /// Generic attribute write; consumes `obj` and `value`.
    pub(crate) fn store_attr_named(&mut self, obj: Value, name: &str, value: Value) -> RunResult<()> {
        match &obj {
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Instance(_) => self.instance_store_attr(obj, id, name, value),
                    HeapData::Class(_) => {
                        let old = match self.heap.get_mut(id) {
                            HeapData::Class(class) => class.set_local(name.to_owned(), value),
                            _ => Some(value),
                        };
                        if let Some(old) = old {
                            old.drop_with_heap(self.heap);
                        }
                        obj.drop_with_heap(self.heap);
                        Ok(())
                    }
                    _ => self.attr_write_error(obj, value, name),
                }
            }
            _ => self.attr_write_error(obj, value, name),
        }
    }

    fn instance_store_attr(&mut self, obj: Value, instance_id: HeapId, name: &str, value: Value) -> RunResult<()> {
        let class_id = match self.heap.get(instance_id) {
            HeapData::Instance(instance) => instance.class_id,
            _ => return Err(RunError::internal("instance vanished during attribute write")),
        };

        // A __setattr__ override owns the write.
        if let Some(hook) = self
            .lookup_on_class_mro(class_id, self.text(StaticStr::SetAttrHook.into()))
            .map(|m| m.clone_with_heap(self.heap))
        {
            let name_value = self.alloc_str(name)?;
            return self.push_call_frame(hook, smallvec![obj, name_value, value], ReturnCtx::Discard);
        }

        // A data descriptor's __set__ shadows the instance dict.
        match self.class_attr_shape(class_id, name) {
            Some(ClassAttr::DataDescriptor(descriptor)) => {
                if let Some(setter) = {
                    let Value::Ref(desc_id) = &descriptor else { unreachable!("descriptor is heap value") };
                    self.class_dunder(*desc_id, StaticStr::Set)
                } {
                    return self.push_call_frame(setter, smallvec![descriptor, obj, value], ReturnCtx::Discard);
                }
                descriptor.drop_with_heap(self.heap);
            }
            other => self.dispose_class_attr(other),
        }

        // Slots restriction when declared.
        let slots_ok = match self.heap.get(class_id) {
            HeapData::Class(class) => class
                .slots
                .as_ref()
                .is_none_or(|slots| slots.iter().any(|slot| slot == name)),
            _ => true,
        };
        if !slots_ok {
            let type_name = obj.type_name(self.heap, self.interns).into_owned();
            obj.drop_with_heap(self.heap);
            value.drop_with_heap(self.heap);
            return Err(ExcKind::attribute_error(type_name, name));
        }

        let old = match self.heap.get_mut(instance_id) {
            HeapData::Instance(instance) => instance.set_attr(name.to_owned(), value),
            _ => Some(value),
        };
        if let Some(old) = old {
            old.drop_with_heap(self.heap);
        }
        obj.drop_with_heap(self.heap);
        Ok(())
    }

    fn attr_write_error(&mut self, obj: Value, value: Value, name: &str) -> RunResult<()> {
        let type_name = obj.type_name(self.heap, self.interns).into_owned();
        obj.drop_with_heap(self.heap);
        value.drop_with_heap(self.heap);
        Err(ExcKind::attribute_error(type_name, name))
    }

    /// Handles `DeleteAttr`.
    pub(crate) fn delete_attr_op(&mut self, arg: u32) -> RunResult<()> {
        let name_id = StringId::from_raw(arg);
        let obj = self.pop();
        let name = self.text(name_id).to_owned();
        match &obj {
            Value::Ref(id) => {
                let id = *id;
                let removed = match self.heap.get_mut(id) {
                    HeapData::Instance(instance) => Some(instance.remove_attr(&name)),
                    HeapData::Class(class) => Some(class.remove_local(&name)),
                    _ => None,
                };
                match removed {
                    Some(Some(old)) => {
                        old.drop_with_heap(self.heap);
                        obj.drop_with_heap(self.heap);
                        Ok(())
                    }
                    Some(None) | None => {
                        let type_name = obj.type_name(self.heap, self.interns).into_owned();
                        obj.drop_with_heap(self.heap);
                        Err(ExcKind::attribute_error(type_name, &name))
                    }
                }
            }
            _ => {
                let type_name = obj.type_name(self.heap, self.interns).into_owned();
                obj.drop_with_heap(self.heap);
                Err(ExcKind::attribute_error(type_name, &name))
            }
        }
    }

    /// Handles `LoadMethod`: the optimized attribute-then-call sequence.
    ///
    /// Pushes `[receiver, function]` when the attribute is a plain
    /// class-level function (skipping the bound-method allocation), or
    /// `[undefined, callable]` through the generic read otherwise.
    pub(crate) fn load_method(&mut self, arg: u32) -> RunResult<()> {
        let name_id = StringId::from_raw(arg);
        let obj = self.pop();
        let name = self.text(name_id).to_owned();

        // Fast path: a plain class-level function, no instance-dict shadow
        // and no read hooks.
        if let Value::Ref(id) = &obj {
            let id = *id;
            if let HeapData::Instance(instance) = self.heap.get(id) {
                let class_id = instance.class_id;
                let shadowed = instance.get_attr(&name).is_some();
                let hooked = self
                    .lookup_on_class_mro(class_id, self.text(StaticStr::GetAttribute.into()))
                    .is_some();
                if !shadowed && !hooked {
                    let method = self.lookup_on_class_mro(class_id, &name).map(Value::shallow_copy);
                    if let Some(method) = method {
                        let is_plain_function = match &method {
                            Value::Function(_) => true,
                            Value::Ref(mid) => matches!(self.heap.get(*mid), HeapData::Closure(_)),
                            _ => false,
                        };
                        if is_plain_function {
                            if let Value::Ref(mid) = &method {
                                self.heap.inc_ref(*mid);
                            }
                            self.push(obj);
                            self.push(method);
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Generic path: the self slot stays undefined and the full
        // attribute read lands the callable on top (directly, or later via
        // an interposed frame's Push ctx).
        self.push(Value::Undefined);
        self.load_attr_named(obj, &name)
    }

    /// Checks attribute presence without running guest hooks.
    pub(crate) fn has_attr_static(&self, obj: &Value, name: &str) -> bool {
        match obj {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Instance(instance) => {
                    instance.get_attr(name).is_some() || self.lookup_on_class_mro(instance.class_id, name).is_some()
                }
                HeapData::Class(_) => self.lookup_on_class_mro(*id, name).is_some(),
                HeapData::Exception(_) => name == "args",
                _ => BuiltinMethod::resolve(obj.type_of(self.heap), name).is_some(),
            },
            _ => BuiltinMethod::resolve(obj.type_of(self.heap), name).is_some(),
        }
    }

    pub(crate) fn alloc_str(&mut self, text: &str) -> RunResult<Value> {
        if let Some(id) = self.interns.lookup(text) {
            return Ok(Value::InternStr(id));
        }
        let id = self
            .heap
            .alloc(HeapData::Str(Str::from(text)))
            .map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }
}
