//! Container instructions: subscripting, unpacking, and merges.

use crate::{
    exc::{ExcKind, RunError, RunResult},
    frame::ReturnCtx,
    heap::{HeapData, HeapId},
    intern::StaticStr,
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Bytes, List, Slice, Str, Tuple},
    value::{HashAttempt, Value, as_index, write_repr},
};

use smallvec::smallvec;

use super::Vm;

/// What a `Subscr`-family instruction found on the stack.
enum SubscrKind {
    Dict,
    List,
    Tuple,
    Str,
    Bytes { mutable: bool },
    Range(crate::types::Range),
    Instance,
    Class,
    Other,
}

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    fn subscr_kind(&self, container: &Value) -> SubscrKind {
        match container {
            Value::InternStr(_) => SubscrKind::Str,
            Value::InternBytes(_) => SubscrKind::Bytes { mutable: false },
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Dict(_) => SubscrKind::Dict,
                HeapData::List(_) => SubscrKind::List,
                HeapData::Tuple(_) => SubscrKind::Tuple,
                HeapData::Str(_) => SubscrKind::Str,
                HeapData::Bytes(_) => SubscrKind::Bytes { mutable: false },
                HeapData::ByteArray(_) => SubscrKind::Bytes { mutable: true },
                HeapData::Range(r) => SubscrKind::Range(*r),
                HeapData::Instance(_) => SubscrKind::Instance,
                HeapData::Class(_) => SubscrKind::Class,
                _ => SubscrKind::Other,
            },
            _ => SubscrKind::Other,
        }
    }

    /// `container[index]`.
    pub(crate) fn subscr_get(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();
        match self.subscr_kind(&container) {
            SubscrKind::Dict => self.dict_get_item(container, index),
            SubscrKind::List | SubscrKind::Tuple => self.sequence_get_item(container, index),
            SubscrKind::Str => self.str_get_item(container, index),
            SubscrKind::Bytes { .. } => self.bytes_get_item(container, index),
            SubscrKind::Range(r) => {
                let result = match as_index(&index, self.heap) {
                    Some(i) => {
                        let len = r.len();
                        let i = if i < 0 { i + len as i64 } else { i };
                        usize::try_from(i).ok().and_then(|i| r.get(i)).map(Value::Int)
                    }
                    None => None,
                };
                index.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                match result {
                    Some(value) => {
                        self.push(value);
                        Ok(())
                    }
                    None => Err(ExcKind::index_error("range object index out of range")),
                }
            }
            SubscrKind::Instance => {
                let Value::Ref(id) = &container else { unreachable!("instance kind implies ref") };
                let Some(method) = self.class_dunder(*id, StaticStr::GetItem) else {
                    return self.not_subscriptable(container, index);
                };
                self.push_call_frame(method, smallvec![container, index], ReturnCtx::Push)
            }
            SubscrKind::Class => {
                let Value::Ref(id) = &container else { unreachable!("class kind implies ref") };
                let method = self
                    .lookup_on_class_mro(*id, self.text(StaticStr::ClassGetItem.into()))
                    .map(|m| m.clone_with_heap(self.heap));
                match method {
                    Some(method) => self.push_call_frame(method, smallvec![container, index], ReturnCtx::Push),
                    None => self.not_subscriptable(container, index),
                }
            }
            SubscrKind::Other => self.not_subscriptable(container, index),
        }
    }

    fn not_subscriptable(&mut self, container: Value, index: Value) -> RunResult<()> {
        let type_name = container.type_name(self.heap, self.interns).into_owned();
        container.drop_with_heap(self.heap);
        index.drop_with_heap(self.heap);
        Err(ExcKind::type_error(format!("'{type_name}' object is not subscriptable")))
    }

    fn dict_get_item(&mut self, container: Value, key: Value) -> RunResult<()> {
        let Value::Ref(dict_id) = &container else {
            return self.not_subscriptable(container, key);
        };
        let dict_id = *dict_id;
        match key.hash_key(self.heap, self.interns) {
            HashAttempt::Ready(hash) => {
                let found = match self.heap.get(dict_id) {
                    HeapData::Dict(d) => d.get(&key, hash, self.heap, self.interns).map(Value::shallow_copy),
                    _ => None,
                };
                match found {
                    Some(value) => {
                        if let Value::Ref(id) = &value {
                            self.heap.inc_ref(*id);
                        }
                        key.drop_with_heap(self.heap);
                        container.drop_with_heap(self.heap);
                        self.push(value);
                        Ok(())
                    }
                    None => {
                        let mut repr = String::new();
                        write_repr(&mut repr, &key, self.heap, self.interns, &mut Vec::new());
                        key.drop_with_heap(self.heap);
                        container.drop_with_heap(self.heap);
                        Err(ExcKind::key_error(repr))
                    }
                }
            }
            HashAttempt::Unhashable(type_name) => {
                key.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                Err(ExcKind::type_error(format!("unhashable type: '{type_name}'")))
            }
            HashAttempt::NeedDunder(instance_id) => {
                // Put the operands back and re-execute once the hash is
                // cached.
                self.push(container);
                self.push(key);
                self.rewind();
                self.call_instance_hash(instance_id, false)
            }
        }
    }

    fn sequence_get_item(&mut self, container: Value, index: Value) -> RunResult<()> {
        let Value::Ref(seq_id) = &container else {
            return self.not_subscriptable(container, index);
        };
        let seq_id = *seq_id;

        if let Some(slice_parts) = self.slice_parts(&index)? {
            let result = self.slice_sequence(seq_id, slice_parts)?;
            index.drop_with_heap(self.heap);
            container.drop_with_heap(self.heap);
            self.push(result);
            return Ok(());
        }

        let Some(raw) = as_index(&index, self.heap) else {
            let container_type = container.type_name(self.heap, self.interns).into_owned();
            let index_type = index.type_name(self.heap, self.interns).into_owned();
            index.drop_with_heap(self.heap);
            container.drop_with_heap(self.heap);
            return Err(ExcKind::type_error(format!(
                "{container_type} indices must be integers or slices, not {index_type}"
            )));
        };
        let (len, type_name) = match self.heap.get(seq_id) {
            HeapData::List(l) => (l.len(), "list"),
            HeapData::Tuple(t) => (t.len(), "tuple"),
            _ => (0, "object"),
        };
        let Some(position) = normalize_index(raw, len) else {
            index.drop_with_heap(self.heap);
            container.drop_with_heap(self.heap);
            return Err(ExcKind::index_error(format!("{type_name} index out of range")));
        };
        let element = match self.heap.get(seq_id) {
            HeapData::List(l) => l.elements()[position].shallow_copy(),
            HeapData::Tuple(t) => t.elements()[position].shallow_copy(),
            _ => Value::None,
        };
        if let Value::Ref(id) = &element {
            self.heap.inc_ref(*id);
        }
        index.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        self.push(element);
        Ok(())
    }

    fn str_get_item(&mut self, container: Value, index: Value) -> RunResult<()> {
        if let Some(slice_parts) = self.slice_parts(&index)? {
            let text = crate::value::str_content(&container, self.heap, self.interns)
                .expect("str kind implies string content")
                .to_owned();
            let chars: Vec<char> = text.chars().collect();
            let sliced: String = slice_indices_iter(slice_parts, chars.len())
                .filter_map(|i| chars.get(i).copied())
                .collect();
            index.drop_with_heap(self.heap);
            container.drop_with_heap(self.heap);
            let id = self.heap.alloc(HeapData::Str(Str::new(sliced))).map_err(RunError::from)?;
            self.push(Value::Ref(id));
            return Ok(());
        }
        let raw = as_index(&index, self.heap);
        let ch = {
            let text = crate::value::str_content(&container, self.heap, self.interns)
                .expect("str kind implies string content");
            raw.and_then(|raw| {
                let len = text.chars().count();
                normalize_index(raw, len).and_then(|i| text.chars().nth(i))
            })
        };
        index.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        match (raw, ch) {
            (Some(_), Some(ch)) => {
                let id = self
                    .heap
                    .alloc(HeapData::Str(Str::new(ch.to_string())))
                    .map_err(RunError::from)?;
                self.push(Value::Ref(id));
                Ok(())
            }
            (Some(_), None) => Err(ExcKind::index_error("string index out of range")),
            (None, _) => Err(ExcKind::type_error("string indices must be integers")),
        }
    }

    fn bytes_get_item(&mut self, container: Value, index: Value) -> RunResult<()> {
        if let Some(slice_parts) = self.slice_parts(&index)? {
            let data = self
                .bytes_slice_of(&container)
                .expect("bytes kind implies byte content")
                .to_vec();
            let sliced: Vec<u8> = slice_indices_iter(slice_parts, data.len())
                .filter_map(|i| data.get(i).copied())
                .collect();
            index.drop_with_heap(self.heap);
            container.drop_with_heap(self.heap);
            let id = self
                .heap
                .alloc(HeapData::Bytes(Bytes::new(sliced)))
                .map_err(RunError::from)?;
            self.push(Value::Ref(id));
            return Ok(());
        }
        let byte = {
            let data = self.bytes_slice_of(&container).expect("bytes kind implies byte content");
            as_index(&index, self.heap).and_then(|raw| normalize_index(raw, data.len()).map(|i| data[i]))
        };
        index.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        match byte {
            Some(byte) => {
                self.push(Value::Int(i64::from(byte)));
                Ok(())
            }
            None => Err(ExcKind::index_error("index out of range")),
        }
    }

    fn bytes_slice_of(&self, value: &Value) -> Option<&[u8]> {
        match value {
            Value::InternBytes(id) => Some(self.interns.get_bytes(*id)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Bytes(b) | HeapData::ByteArray(b) => Some(b.as_slice()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Extracts `(start, stop, step)` options when `index` is a slice.
    fn slice_parts(&self, index: &Value) -> RunResult<Option<(Option<i64>, Option<i64>, Option<i64>)>> {
        let Value::Ref(id) = index else { return Ok(None) };
        let HeapData::Slice(slice) = self.heap.get(*id) else {
            return Ok(None);
        };
        let part = |v: &Value| -> RunResult<Option<i64>> {
            match v {
                Value::None => Ok(None),
                other => match as_index(other, self.heap) {
                    Some(i) => Ok(Some(i)),
                    None => Err(ExcKind::type_error(
                        "slice indices must be integers or None",
                    )),
                },
            }
        };
        Ok(Some((part(&slice.start)?, part(&slice.stop)?, part(&slice.step)?)))
    }

    fn slice_sequence(
        &mut self,
        seq_id: HeapId,
        parts: (Option<i64>, Option<i64>, Option<i64>),
    ) -> RunResult<Value> {
        let (len, as_tuple) = match self.heap.get(seq_id) {
            HeapData::List(l) => (l.len(), false),
            HeapData::Tuple(t) => (t.len(), true),
            _ => return Err(RunError::internal("slice over a non-sequence")),
        };
        let positions: Vec<usize> = slice_indices_iter(parts, len).collect();
        let mut elements = Vec::with_capacity(positions.len());
        for position in positions {
            let element = match self.heap.get(seq_id) {
                HeapData::List(l) => l.elements()[position].shallow_copy(),
                HeapData::Tuple(t) => t.elements()[position].shallow_copy(),
                _ => Value::None,
            };
            if let Value::Ref(id) = &element {
                self.heap.inc_ref(*id);
            }
            elements.push(element);
        }
        let data = if as_tuple {
            HeapData::Tuple(Tuple::new(elements))
        } else {
            HeapData::List(List::new(elements))
        };
        let id = self.heap.alloc(data).map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }

    /// `container[index] = value`. Stack (push order): value, container,
    /// index.
    pub(crate) fn subscr_set(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();
        let value = self.pop();
        match self.subscr_kind(&container) {
            SubscrKind::Dict => {
                let Value::Ref(dict_id) = &container else { unreachable!("dict kind implies ref") };
                let dict_id = *dict_id;
                match container_key_hash(self, &index)? {
                    KeyHash::Ready(hash) => {
                        self.heap.on_container_insert().map_err(RunError::from)?;
                        let old = self.heap.with_entry_mut(dict_id, |data, heap| match data {
                            HeapData::Dict(dict) => Ok(dict.insert(index, hash, value, heap, self.interns)),
                            _ => Err(RunError::internal("dict store over a non-dict")),
                        });
                        container.drop_with_heap(self.heap);
                        if let Some(old) = old? {
                            old.drop_with_heap(self.heap);
                        }
                        Ok(())
                    }
                    KeyHash::NeedDunder(instance_id) => {
                        // Guest __hash__ needed: restore the operands on the
                        // current frame, then interpose the dunder frame.
                        self.push(value);
                        self.push(container);
                        self.push(index);
                        self.rewind();
                        self.call_instance_hash(instance_id, false)
                    }
                }
            }
            SubscrKind::List => {
                let Value::Ref(list_id) = &container else { unreachable!("list kind implies ref") };
                let list_id = *list_id;
                let Some(raw) = as_index(&index, self.heap) else {
                    let index_type = index.type_name(self.heap, self.interns).into_owned();
                    self.drop_values(vec![value, container, index]);
                    return Err(ExcKind::type_error(format!(
                        "list indices must be integers or slices, not {index_type}"
                    )));
                };
                let len = match self.heap.get(list_id) {
                    HeapData::List(l) => l.len(),
                    _ => 0,
                };
                let Some(position) = normalize_index(raw, len) else {
                    self.drop_values(vec![value, container, index]);
                    return Err(ExcKind::index_error("list assignment index out of range"));
                };
                let old = match self.heap.get_mut(list_id) {
                    HeapData::List(l) => std::mem::replace(&mut l.elements_mut()[position], value),
                    _ => value,
                };
                old.drop_with_heap(self.heap);
                index.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                Ok(())
            }
            SubscrKind::Bytes { mutable: true } => {
                let Value::Ref(bytes_id) = &container else { unreachable!("bytes kind implies ref") };
                let bytes_id = *bytes_id;
                let raw = as_index(&index, self.heap);
                let byte = as_index(&value, self.heap);
                let (Some(raw), Some(byte)) = (raw, byte) else {
                    self.drop_values(vec![value, container, index]);
                    return Err(ExcKind::type_error("bytearray assignment requires integers"));
                };
                if !(0..=255).contains(&byte) {
                    self.drop_values(vec![value, container, index]);
                    return Err(ExcKind::value_error("byte must be in range(0, 256)"));
                }
                let done = match self.heap.get_mut(bytes_id) {
                    HeapData::ByteArray(b) => {
                        let len = b.len();
                        match normalize_index(raw, len) {
                            Some(position) => {
                                b.as_mut_vec()[position] = byte as u8;
                                true
                            }
                            None => false,
                        }
                    }
                    _ => false,
                };
                self.drop_values(vec![value, container, index]);
                if done {
                    Ok(())
                } else {
                    Err(ExcKind::index_error("bytearray index out of range"))
                }
            }
            SubscrKind::Instance => {
                let Value::Ref(id) = &container else { unreachable!("instance kind implies ref") };
                let Some(method) = self.class_dunder(*id, StaticStr::SetItem) else {
                    let type_name = container.type_name(self.heap, self.interns).into_owned();
                    self.drop_values(vec![value, container, index]);
                    return Err(ExcKind::type_error(format!(
                        "'{type_name}' object does not support item assignment"
                    )));
                };
                self.push_call_frame(method, smallvec![container, index, value], ReturnCtx::Discard)
            }
            _ => {
                let type_name = container.type_name(self.heap, self.interns).into_owned();
                self.drop_values(vec![value, container, index]);
                Err(ExcKind::type_error(format!(
                    "'{type_name}' object does not support item assignment"
                )))
            }
        }
    }

    /// `del container[index]`.
    pub(crate) fn subscr_del(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();
        match self.subscr_kind(&container) {
            SubscrKind::Dict => {
                let Value::Ref(dict_id) = &container else { unreachable!("dict kind implies ref") };
                let dict_id = *dict_id;
                match container_key_hash(self, &index)? {
                    KeyHash::Ready(hash) => {
                        let removed = self.heap.with_entry_mut(dict_id, |data, heap| match data {
                            HeapData::Dict(dict) => Ok(dict.remove(&index, hash, heap, self.interns)),
                            _ => Err(RunError::internal("dict delete over a non-dict")),
                        })?;
                        match removed {
                            Some(old) => {
                                old.drop_with_heap(self.heap);
                                index.drop_with_heap(self.heap);
                                container.drop_with_heap(self.heap);
                                Ok(())
                            }
                            None => {
                                let mut repr = String::new();
                                write_repr(&mut repr, &index, self.heap, self.interns, &mut Vec::new());
                                index.drop_with_heap(self.heap);
                                container.drop_with_heap(self.heap);
                                Err(ExcKind::key_error(repr))
                            }
                        }
                    }
                    KeyHash::NeedDunder(instance_id) => {
                        self.push(container);
                        self.push(index);
                        self.rewind();
                        self.call_instance_hash(instance_id, false)
                    }
                }
            }
            SubscrKind::List => {
                let Value::Ref(list_id) = &container else { unreachable!("list kind implies ref") };
                let list_id = *list_id;
                let raw = as_index(&index, self.heap);
                let removed = match (raw, self.heap.get_mut(list_id)) {
                    (Some(raw), HeapData::List(l)) => {
                        let len = l.len();
                        normalize_index(raw, len).map(|position| l.elements_mut().remove(position))
                    }
                    _ => None,
                };
                index.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                match removed {
                    Some(old) => {
                        old.drop_with_heap(self.heap);
                        Ok(())
                    }
                    None => Err(ExcKind::index_error("list assignment index out of range")),
                }
            }
            SubscrKind::Instance => {
                let Value::Ref(id) = &container else { unreachable!("instance kind implies ref") };
                let Some(method) = self.class_dunder(*id, StaticStr::DelItem) else {
                    let type_name = container.type_name(self.heap, self.interns).into_owned();
                    self.drop_values(vec![container, index]);
                    return Err(ExcKind::type_error(format!(
                        "'{type_name}' object does not support item deletion"
                    )));
                };
                self.push_call_frame(method, smallvec![container, index], ReturnCtx::Discard)
            }
            _ => {
                let type_name = container.type_name(self.heap, self.interns).into_owned();
                self.drop_values(vec![container, index]);
                Err(ExcKind::type_error(format!(
                    "'{type_name}' object does not support item deletion"
                )))
            }
        }
    }

    /// `UnpackSequence`: explode an iterable into exactly `n` stack values.
    pub(crate) fn unpack_sequence(&mut self, n: usize) -> RunResult<()> {
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
                    "cannot unpack non-iterable {type_name} object"
                )));
            }
        };
        if elements.len() != n {
            let got = elements.len();
            self.drop_values(elements);
            return Err(if got < n {
                ExcKind::value_error(format!("not enough values to unpack (expected {n}, got {got})"))
            } else {
                ExcKind::value_error(format!("too many values to unpack (expected {n})"))
            });
        }
        // First element must end on top.
        for element in elements.into_iter().rev() {
            self.push(element);
        }
        Ok(())
    }

    /// `DictUpdate`: merge the popped mapping into the dict at top of
    /// stack.
    pub(crate) fn dict_update_from(&mut self, mapping: Value) -> RunResult<()> {
        let pairs: Vec<(u64, Value, Value)> = match &mapping {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Dict(d) => d
                    .raw_iter()
                    .map(|(h, k, v)| (h, k.shallow_copy(), v.shallow_copy()))
                    .collect(),
                _ => {
                    let type_name = mapping.type_name(self.heap, self.interns).into_owned();
                    mapping.drop_with_heap(self.heap);
                    return Err(ExcKind::type_error(format!("'{type_name}' object is not a mapping")));
                }
            },
            _ => {
                let type_name = mapping.type_name(self.heap, self.interns).into_owned();
                mapping.drop_with_heap(self.heap);
                return Err(ExcKind::type_error(format!("'{type_name}' object is not a mapping")));
            }
        };
        for (_, key, value) in &pairs {
            if let Value::Ref(id) = key {
                self.heap.inc_ref(*id);
            }
            if let Value::Ref(id) = value {
                self.heap.inc_ref(*id);
            }
        }
        mapping.drop_with_heap(self.heap);
        let Value::Ref(target) = self.peek() else {
            for (_, k, v) in pairs {
                k.drop_with_heap(self.heap);
                v.drop_with_heap(self.heap);
            }
            return Err(RunError::internal("DictUpdate target is not a dict"));
        };
        let target = *target;
        for (hash, key, value) in pairs {
            self.heap.on_container_insert().map_err(RunError::from)?;
            let old = self.heap.with_entry_mut(target, |data, heap| match data {
                HeapData::Dict(dict) => Ok(dict.insert(key, hash, value, heap, self.interns)),
                _ => Err(RunError::internal("DictUpdate target is not a dict")),
            })?;
            if let Some(old) = old {
                old.drop_with_heap(self.heap);
            }
        }
        Ok(())
    }
}

/// A key hash for container stores.
enum KeyHash {
    Ready(u64),
    /// A guest `__hash__` is required; the caller restores its operands,
    /// rewinds, and interposes the dunder frame.
    NeedDunder(HeapId),
}

fn container_key_hash<T: ResourceTracker, P: PrintWriter>(
    vm: &mut Vm<'_, T, P>,
    key: &Value,
) -> RunResult<KeyHash> {
    match key.hash_key(vm.heap, vm.interns) {
        HashAttempt::Ready(hash) => Ok(KeyHash::Ready(hash)),
        HashAttempt::Unhashable(type_name) => Err(ExcKind::type_error(format!("unhashable type: '{type_name}'"))),
        HashAttempt::NeedDunder(instance_id) => Ok(KeyHash::NeedDunder(instance_id)),
    }
}

/// Maps a possibly negative index into `0..len`.
fn normalize_index(raw: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if raw < 0 { raw + len } else { raw };
    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

/// Iterator over the positions a slice selects.
fn slice_indices_iter(
    parts: (Option<i64>, Option<i64>, Option<i64>),
    len: usize,
) -> impl Iterator<Item = usize> {
    let (start, stop, step) = parts;
    let resolved = Slice::indices(start, stop, step, len);
    SliceIter {
        current: resolved.map(|(s, _, _)| s).unwrap_or(0),
        stop: resolved.map(|(_, e, _)| e).unwrap_or(0),
        step: resolved.map(|(_, _, st)| st).unwrap_or(1),
        done: resolved.is_none(),
    }
}

struct SliceIter {
    current: i64,
    stop: i64,
    step: i64,
    done: bool,
}

impl Iterator for SliceIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.done {
            return None;
        }
        let at_end = if self.step > 0 {
            self.current >= self.stop
        } else {
            self.current <= self.stop
        };
        if at_end {
            return None;
        }
        let item = usize::try_from(self.current).ok()?;
        self.current += self.step;
        Some(item)
    }
}
