//! Runtime values.
//!
//! `Value` is a hybrid: small immediates (ints, floats, singletons, interned
//! literals, builtin handles) live inline; everything else is `Ref(HeapId)`
//! into the reference-counted arena.
//!
//! `Clone` is deliberately not derived. Copying a `Ref` without adjusting
//! its count would corrupt the heap, so the only sanctioned paths are
//! [`Value::clone_with_heap`] and [`Value::drop_with_heap`]. The
//! `ref-count-panic` feature adds a `Drop` guard that catches any `Ref`
//! dropped outside those paths during tests.

use std::borrow::Cow;

use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

use crate::{
    builtins::Builtin,
    guest_hash,
    heap::{Heap, HeapData, HeapId},
    intern::{BytesId, ExtFunctionId, FunctionId, Interns, LongIntId, StringId},
    resource::ResourceTracker,
    task::CallId,
    types::{Type, write_bytes_repr, write_str_repr},
};

/// A guest value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Value {
    /// An unbound local/global slot. Never observable from guest code.
    Undefined,
    None,
    Ellipsis,
    /// The not-implemented sentinel returned by binary dunders to request
    /// the fallback path.
    NotImplemented,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Interned string literal from the constant pool.
    InternStr(StringId),
    /// Interned bytes literal.
    InternBytes(BytesId),
    /// Interned big-integer literal; materialized to the heap on load.
    InternLongInt(LongIntId),
    /// A builtin function, type, or exception class.
    Builtin(Builtin),
    /// A guest function with no defaults and no captured cells.
    Function(FunctionId),
    /// A declared external (host) function.
    ExtFunction(ExtFunctionId),
    /// The pending result of a deferred external call.
    ExternalFuture(CallId),
    /// A heap-allocated value.
    Ref(HeapId),
    /// Tombstone left by `drop_with_heap` under the refcount guard.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without drop_with_heap - refcount bug");
        }
    }
}

/// Outcome of attempting to hash a value for dict/set use.
pub(crate) enum HashAttempt {
    /// Hash computed (bit-cast of the signed guest hash).
    Ready(u64),
    /// An instance whose class defines a guest `__hash__`; the VM must call
    /// it and cache the result on the instance.
    NeedDunder(HeapId),
    /// Unhashable; the payload is the type name for the error message.
    Unhashable(String),
}

impl Value {
    /// Whether this value may appear in a constant pool.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        !matches!(self, Self::Ref(_) | Self::Undefined)
    }

    /// Copies the value, accounting the reference for heap values.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        if let Self::Ref(id) = self {
            heap.inc_ref(*id);
        }
        self.shallow_copy()
    }

    /// Raw bit copy without refcount adjustment.
    ///
    /// Callers must either own the extra reference some other way or be
    /// copying an immediate.
    #[must_use]
    pub(crate) fn shallow_copy(&self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::None => Self::None,
            Self::Ellipsis => Self::Ellipsis,
            Self::NotImplemented => Self::NotImplemented,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(x) => Self::Float(*x),
            Self::InternStr(id) => Self::InternStr(*id),
            Self::InternBytes(id) => Self::InternBytes(*id),
            Self::InternLongInt(id) => Self::InternLongInt(*id),
            Self::Builtin(b) => Self::Builtin(*b),
            Self::Function(id) => Self::Function(*id),
            Self::ExtFunction(id) => Self::ExtFunction(*id),
            Self::ExternalFuture(id) => Self::ExternalFuture(*id),
            Self::Ref(id) => Self::Ref(*id),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("copy of dereferenced value"),
        }
    }

    /// Releases the value, decrementing the heap count for `Ref`s.
    pub fn drop_with_heap(self, heap: &mut Heap<impl ResourceTracker>) {
        if let Self::Ref(id) = &self {
            heap.dec_ref(*id);
        }
        #[cfg(feature = "ref-count-panic")]
        std::mem::forget(self);
    }

    /// Consumes the value during a heap free, routing any child reference
    /// into `sink` instead of the tracker (the cascade handles it).
    pub(crate) fn dissolve(self, sink: &mut Vec<HeapId>) {
        if let Self::Ref(id) = &self {
            sink.push(*id);
        }
        #[cfg(feature = "ref-count-panic")]
        std::mem::forget(self);
    }

    /// The builtin type tag of this value.
    #[must_use]
    pub fn type_of(&self, heap: &Heap<impl ResourceTracker>) -> Type {
        match self {
            Self::Undefined => Type::Object,
            Self::None => Type::NoneType,
            Self::Ellipsis => Type::Ellipsis,
            Self::NotImplemented => Type::NotImplementedType,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) | Self::InternLongInt(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::InternStr(_) => Type::Str,
            Self::InternBytes(_) => Type::Bytes,
            Self::Builtin(Builtin::Fn(_)) => Type::BuiltinFunction,
            Self::Builtin(Builtin::Type(_) | Builtin::Exc(_)) => Type::Type,
            Self::Function(_) => Type::Function,
            Self::ExtFunction(_) => Type::Function,
            Self::ExternalFuture(_) => Type::Coroutine,
            Self::Ref(id) => heap.get(*id).type_of(),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("type_of on dereferenced value"),
        }
    }

    /// The guest-visible type name, naming the class for instances.
    #[must_use]
    pub fn type_name<'a>(&self, heap: &'a Heap<impl ResourceTracker>, interns: &'a Interns) -> Cow<'a, str> {
        if let Self::Ref(id) = self {
            match heap.get(*id) {
                HeapData::Instance(instance) => {
                    if let HeapData::Class(class) = heap.get(instance.class_id) {
                        return Cow::Borrowed(interns.get_str(class.name_id));
                    }
                }
                HeapData::Class(class) => return Cow::Borrowed(interns.get_str(class.name_id)),
                HeapData::Exception(payload) => return Cow::Owned(payload.type_name().to_owned()),
                _ => {}
            }
        }
        Cow::Borrowed(self.type_of(heap).name())
    }

    /// Truthiness, when decidable without guest code.
    ///
    /// `None` means the value is an instance whose `__bool__`/`__len__`
    /// must be consulted by the VM.
    #[must_use]
    pub fn truthy(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<bool> {
        match self {
            Self::None => Some(false),
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Float(x) => Some(*x != 0.0),
            Self::InternStr(id) => Some(!interns.get_str(*id).is_empty()),
            Self::InternBytes(id) => Some(!interns.get_bytes(*id).is_empty()),
            // Interned long ints exceed i64, so they are never zero.
            Self::InternLongInt(_) => Some(true),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(!s.as_str().is_empty()),
                HeapData::Bytes(b) | HeapData::ByteArray(b) => Some(!b.is_empty()),
                HeapData::LongInt(li) => Some(!li.inner().is_zero()),
                HeapData::List(l) => Some(!l.is_empty()),
                HeapData::Tuple(t) => Some(!t.is_empty()),
                HeapData::Dict(d) => Some(!d.is_empty()),
                HeapData::Set(s) | HeapData::FrozenSet(s) => Some(!s.is_empty()),
                HeapData::Range(r) => Some(r.len() > 0),
                HeapData::Instance(_) => None,
                _ => Some(true),
            },
            _ => Some(true),
        }
    }

    /// Length, for values with a builtin length.
    #[must_use]
    pub fn py_len(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<usize> {
        match self {
            Self::InternStr(id) => Some(interns.get_str(*id).chars().count()),
            Self::InternBytes(id) => Some(interns.get_bytes(*id).len()),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.char_len()),
                HeapData::Bytes(b) | HeapData::ByteArray(b) => Some(b.len()),
                HeapData::List(l) => Some(l.len()),
                HeapData::Tuple(t) => Some(t.len()),
                HeapData::Dict(d) => Some(d.len()),
                HeapData::Set(s) | HeapData::FrozenSet(s) => Some(s.len()),
                HeapData::Range(r) => Some(r.len()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Structural key equality for dict/set storage.
    ///
    /// Matches guest `==` for hashable builtins (numbers cross-type,
    /// strings, bytes, tuples, singletons) and falls back to identity for
    /// everything else. Never calls guest code: instance keys with guest
    /// `__eq__` compare by identity here.
    #[must_use]
    pub fn keys_equal(a: &Self, b: &Self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
        if let (Self::Ref(x), Self::Ref(y)) = (a, b)
            && x == y
        {
            return true;
        }
        // Numbers compare across int/float/bool/long-int.
        if let (Some(x), Some(y)) = (Numeric::of(a, heap), Numeric::of(b, heap)) {
            return Numeric::eq(&x, &y);
        }
        match (a, b) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) | (Self::NotImplemented, Self::NotImplemented) => {
                true
            }
            (Self::Builtin(x), Self::Builtin(y)) => x == y,
            (Self::Function(x), Self::Function(y)) => x == y,
            (Self::ExtFunction(x), Self::ExtFunction(y)) => x == y,
            _ => {
                if let (Some(x), Some(y)) = (str_content(a, heap, interns), str_content(b, heap, interns)) {
                    return x == y;
                }
                if let (Some(x), Some(y)) = (bytes_content(a, heap, interns), bytes_content(b, heap, interns)) {
                    return x == y;
                }
                if let (Self::Ref(x), Self::Ref(y)) = (a, b)
                    && let (HeapData::Tuple(tx), HeapData::Tuple(ty)) = (heap.get(*x), heap.get(*y))
                {
                    return tx.len() == ty.len()
                        && tx
                            .elements()
                            .iter()
                            .zip(ty.elements())
                            .all(|(ea, eb)| Self::keys_equal(ea, eb, heap, interns));
                }
                false
            }
        }
    }

    /// Attempts to hash the value for dict/set use.
    #[must_use]
    pub fn hash_key(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> HashAttempt {
        let signed = match self {
            Self::None => guest_hash::hash_i64(0x6eb5_1d3c),
            Self::Ellipsis => guest_hash::hash_i64(0x2a1e_77b9),
            Self::NotImplemented => guest_hash::hash_i64(0x51c3_08aa),
            Self::Bool(b) => guest_hash::hash_i64(i64::from(*b)),
            Self::Int(i) => guest_hash::hash_i64(*i),
            Self::Float(x) => guest_hash::hash_f64(*x),
            Self::InternStr(id) => guest_hash::hash_str(interns.get_str(*id)),
            Self::InternBytes(id) => guest_hash::hash_bytes(interns.get_bytes(*id)),
            Self::InternLongInt(id) => guest_hash::hash_bigint(interns.get_long_int(*id)),
            Self::Builtin(b) => guest_hash::hash_str(b.name()),
            Self::Function(id) => guest_hash::hash_i64(0x7000 + id.index() as i64),
            Self::ExtFunction(id) => guest_hash::hash_i64(0x8000 + id.index() as i64),
            Self::ExternalFuture(id) => guest_hash::hash_i64(0x9000 + i64::from(id.raw())),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => guest_hash::hash_str(s.as_str()),
                HeapData::Bytes(b) => guest_hash::hash_bytes(b.as_slice()),
                HeapData::LongInt(li) => guest_hash::hash_bigint(li.inner()),
                HeapData::Tuple(t) => {
                    let mut lanes = Vec::with_capacity(t.len());
                    for element in t.elements() {
                        match element.hash_key(heap, interns) {
                            HashAttempt::Ready(h) => lanes.push(i64::from_ne_bytes(h.to_ne_bytes())),
                            other => return other,
                        }
                    }
                    guest_hash::combine_tuple(&lanes)
                }
                HeapData::FrozenSet(s) => {
                    // Order-independent: XOR the element hashes.
                    let mut acc: i64 = 0x1f5e_3a77;
                    for element in s.iter() {
                        match element.hash_key(heap, interns) {
                            HashAttempt::Ready(h) => acc ^= i64::from_ne_bytes(h.to_ne_bytes()),
                            other => return other,
                        }
                    }
                    guest_hash::hash_i64(acc)
                }
                HeapData::Range(r) => guest_hash::combine_tuple(&[
                    guest_hash::hash_i64(r.start),
                    guest_hash::hash_i64(r.stop),
                    guest_hash::hash_i64(r.step),
                ]),
                HeapData::Instance(instance) => {
                    if let Some(cached) = instance.cached_hash {
                        return HashAttempt::Ready(u64::from_ne_bytes(cached.to_ne_bytes()));
                    }
                    return heap.instance_hash_policy(*id, interns);
                }
                HeapData::Class(_) | HeapData::Closure(_) | HeapData::BoundMethod(_) => {
                    guest_hash::hash_i64(0xA000 + id.index() as i64)
                }
                HeapData::Exception(_) | HeapData::Generator(_) | HeapData::Coroutine(_) => {
                    guest_hash::hash_i64(0xB000 + id.index() as i64)
                }
                _ => {
                    return HashAttempt::Unhashable(self.type_name(heap, interns).into_owned());
                }
            },
            Self::Undefined => return HashAttempt::Unhashable("undefined".to_owned()),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("hash of dereferenced value"),
        };
        HashAttempt::Ready(u64::from_ne_bytes(signed.to_ne_bytes()))
    }
}

/// Numeric view over int/bool/float/long-int values.
pub(crate) enum Numeric<'a> {
    Int(i64),
    Float(f64),
    Big(&'a num_bigint::BigInt),
}

impl<'a> Numeric<'a> {
    /// Extracts a numeric view, when the value is a number.
    #[must_use]
    pub fn of(value: &Value, heap: &'a Heap<impl ResourceTracker>) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Int(i64::from(*b))),
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Float(x) => Some(Self::Float(*x)),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::LongInt(li) => Some(Self::Big(li.inner())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Cross-type numeric equality.
    #[must_use]
    pub fn eq(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (Self::Int(x), Self::Int(y)) => x == y,
            (Self::Float(x), Self::Float(y)) => x == y,
            (Self::Int(x), Self::Float(y)) | (Self::Float(y), Self::Int(x)) => (*x as f64) == *y,
            (Self::Big(x), Self::Big(y)) => x == y,
            (Self::Big(x), Self::Int(y)) | (Self::Int(y), Self::Big(x)) => **x == num_bigint::BigInt::from(*y),
            (Self::Big(x), Self::Float(y)) | (Self::Float(y), Self::Big(x)) => {
                x.to_f64().is_some_and(|xf| xf == *y)
            }
        }
    }

    /// Cross-type numeric ordering; `None` for NaN comparisons.
    #[must_use]
    pub fn cmp(a: &Self, b: &Self) -> Option<std::cmp::Ordering> {
        match (a, b) {
            (Self::Int(x), Self::Int(y)) => Some(x.cmp(y)),
            (Self::Float(x), Self::Float(y)) => x.partial_cmp(y),
            (Self::Int(x), Self::Float(y)) => (*x as f64).partial_cmp(y),
            (Self::Float(x), Self::Int(y)) => x.partial_cmp(&(*y as f64)),
            (Self::Big(x), Self::Big(y)) => Some(x.cmp(y)),
            (Self::Big(x), Self::Int(y)) => Some((*x).cmp(&num_bigint::BigInt::from(*y))),
            (Self::Int(x), Self::Big(y)) => Some(num_bigint::BigInt::from(*x).cmp(y)),
            (Self::Big(x), Self::Float(y)) => x.to_f64().and_then(|xf| xf.partial_cmp(y)),
            (Self::Float(x), Self::Big(y)) => y.to_f64().and_then(|yf| x.partial_cmp(&yf)),
        }
    }
}

/// Borrowed string content of a value, when it is a string.
#[must_use]
pub(crate) fn str_content<'a>(
    value: &Value,
    heap: &'a Heap<impl ResourceTracker>,
    interns: &'a Interns,
) -> Option<&'a str> {
    match value {
        Value::InternStr(id) => Some(interns.get_str(*id)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Some(s.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Borrowed bytes content of a value, when it is bytes (not bytearray).
#[must_use]
pub(crate) fn bytes_content<'a>(
    value: &Value,
    heap: &'a Heap<impl ResourceTracker>,
    interns: &'a Interns,
) -> Option<&'a [u8]> {
    match value {
        Value::InternBytes(id) => Some(interns.get_bytes(*id)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Bytes(b) => Some(b.as_slice()),
            _ => None,
        },
        _ => None,
    }
}

/// Formats a float the way the guest prints it: shortest roundtrip, always
/// with a decimal point or exponent.
#[must_use]
pub(crate) fn fmt_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    let mut buffer = ryu::Buffer::new();
    let text = buffer.format(value);
    text.to_owned()
}

/// Renders `repr(value)` into `out`, without entering guest code.
///
/// Instances render as `<Name object>` regardless of a guest `__repr__`;
/// the VM routes top-level repr/str of instances through the dunder and
/// only container elements take this default. `seen` guards cycles.
pub(crate) fn write_repr(
    out: &mut String,
    value: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    seen: &mut Vec<HeapId>,
) {
    use std::fmt::Write;
    match value {
        Value::Undefined => out.push_str("<undefined>"),
        Value::None => out.push_str("None"),
        Value::Ellipsis => out.push_str("Ellipsis"),
        Value::NotImplemented => out.push_str("NotImplemented"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(x) => out.push_str(&fmt_float(*x)),
        Value::InternStr(id) => write_str_repr(out, interns.get_str(*id)),
        Value::InternBytes(id) => write_bytes_repr(out, interns.get_bytes(*id), false),
        Value::InternLongInt(id) => {
            let _ = write!(out, "{}", interns.get_long_int(*id));
        }
        Value::Builtin(b) => match b {
            Builtin::Fn(f) => {
                let _ = write!(out, "<built-in function {}>", f.name());
            }
            Builtin::Type(t) => {
                let _ = write!(out, "<class '{}'>", t.name());
            }
            Builtin::Exc(k) => {
                let _ = write!(out, "<class '{}'>", <&'static str>::from(*k));
            }
        },
        Value::Function(id) => {
            let _ = write!(out, "<function {}>", interns.get_str(interns.get_function(*id).qualname_id));
        }
        Value::ExtFunction(id) => {
            let _ = write!(out, "<external function {}>", interns.get_ext_name(*id));
        }
        Value::ExternalFuture(_) => out.push_str("<external future>"),
        Value::Ref(id) => write_heap_repr(out, *id, heap, interns, seen),
        #[cfg(feature = "ref-count-panic")]
        Value::Dereferenced => out.push_str("<dereferenced>"),
    }
}

fn write_heap_repr(
    out: &mut String,
    id: HeapId,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    seen: &mut Vec<HeapId>,
) {
    use std::fmt::Write;
    if seen.contains(&id) {
        // Self-referential containers render the way the guest does.
        out.push_str(match heap.get(id) {
            HeapData::List(_) => "[...]",
            HeapData::Dict(_) => "{...}",
            HeapData::Set(_) | HeapData::FrozenSet(_) => "{...}",
            HeapData::Tuple(_) => "(...)",
            _ => "...",
        });
        return;
    }
    seen.push(id);
    match heap.get(id) {
        HeapData::Str(s) => write_str_repr(out, s.as_str()),
        HeapData::Bytes(b) => write_bytes_repr(out, b.as_slice(), false),
        HeapData::ByteArray(b) => write_bytes_repr(out, b.as_slice(), true),
        HeapData::LongInt(li) => {
            let _ = write!(out, "{}", li.inner());
        }
        HeapData::Tuple(t) => {
            out.push('(');
            for (i, element) in t.elements().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, element, heap, interns, seen);
            }
            if t.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        HeapData::List(l) => {
            out.push('[');
            for (i, element) in l.elements().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, element, heap, interns, seen);
            }
            out.push(']');
        }
        HeapData::Dict(d) => {
            out.push('{');
            for (i, (key, dict_value)) in d.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, key, heap, interns, seen);
                out.push_str(": ");
                write_repr(out, dict_value, heap, interns, seen);
            }
            out.push('}');
        }
        HeapData::Set(s) => {
            if s.is_empty() {
                out.push_str("set()");
            } else {
                out.push('{');
                for (i, element) in s.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_repr(out, element, heap, interns, seen);
                }
                out.push('}');
            }
        }
        HeapData::FrozenSet(s) => {
            out.push_str("frozenset(");
            if !s.is_empty() {
                out.push('{');
                for (i, element) in s.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_repr(out, element, heap, interns, seen);
                }
                out.push('}');
            }
            out.push(')');
        }
        HeapData::Range(r) => {
            if r.step == 1 {
                let _ = write!(out, "range({}, {})", r.start, r.stop);
            } else {
                let _ = write!(out, "range({}, {}, {})", r.start, r.stop, r.step);
            }
        }
        HeapData::Slice(s) => {
            out.push_str("slice(");
            write_repr(out, &s.start, heap, interns, seen);
            out.push_str(", ");
            write_repr(out, &s.stop, heap, interns, seen);
            out.push_str(", ");
            write_repr(out, &s.step, heap, interns, seen);
            out.push(')');
        }
        HeapData::Cell(_) => out.push_str("<cell>"),
        HeapData::Closure(c) => {
            let _ = write!(
                out,
                "<function {}>",
                interns.get_str(interns.get_function(c.func_id).qualname_id)
            );
        }
        HeapData::BoundMethod(m) => {
            out.push_str("<bound method ");
            write_repr(out, &m.callable, heap, interns, seen);
            out.push('>');
        }
        HeapData::Class(c) => {
            let _ = write!(out, "<class '{}'>", interns.get_str(c.name_id));
        }
        HeapData::Instance(instance) => {
            let name = match heap.get(instance.class_id) {
                HeapData::Class(c) => interns.get_str(c.name_id),
                _ => "object",
            };
            let _ = write!(out, "<{name} object>");
        }
        HeapData::Exception(payload) => {
            let _ = write!(out, "{}(", payload.type_name());
            if let Some(msg) = &payload.message {
                write_str_repr(out, msg);
            }
            out.push(')');
        }
        HeapData::Generator(g) => {
            let _ = write!(
                out,
                "<generator object {}>",
                interns.get_str(interns.get_function(g.func_id).qualname_id)
            );
        }
        HeapData::Coroutine(c) => {
            let _ = write!(
                out,
                "<coroutine object {}>",
                interns.get_str(interns.get_function(c.func_id).qualname_id)
            );
        }
        HeapData::Iter(_) => out.push_str("<iterator>"),
        HeapData::Gather(_) => out.push_str("<gather>"),
        HeapData::InFlight => out.push_str("<in-flight>"),
    }
    seen.pop();
}

/// Renders `str(value)`: like repr except strings stay unquoted and
/// exceptions show their message.
pub(crate) fn write_str(
    out: &mut String,
    value: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
) {
    match value {
        Value::InternStr(id) => out.push_str(interns.get_str(*id)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => out.push_str(s.as_str()),
            HeapData::Exception(payload) => {
                if let Some(msg) = &payload.message {
                    out.push_str(msg);
                }
            }
            _ => write_repr(out, value, heap, interns, &mut Vec::new()),
        },
        _ => write_repr(out, value, heap, interns, &mut Vec::new()),
    }
}

/// Signed magnitude check used by index coercion.
#[must_use]
pub(crate) fn as_index(value: &Value, heap: &Heap<impl ResourceTracker>) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Int(i) => Some(*i),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::LongInt(li) => li.inner().to_i64(),
            _ => None,
        },
        _ => None,
    }
}

