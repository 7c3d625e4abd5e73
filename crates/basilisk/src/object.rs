//! The host-facing value type.
//!
//! [`Object`] owns all its data and needs no heap, so hosts can freely
//! clone, store, and serialize it. Inputs convert into runtime values at
//! the start of a run; results convert back at the end (or at an
//! external-call boundary).

use indexmap::IndexMap;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::{
    exc::ExcKind,
    exception::Exception,
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    types::{Bytes, Dict, List, Set, Str, Tuple},
    value::{HashAttempt, Value, fmt_float},
};

/// A guest value crossing the host boundary.
///
/// Most variants convert both ways. `Repr` is output-only: it stands in for
/// values with no host-side representation (functions, classes, iterators),
/// carrying their rendered form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    /// An integer outside the `i64` range.
    BigInt(BigInt),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    /// Insertion-ordered pairs.
    Dict(Vec<(Object, Object)>),
    Set(Vec<Object>),
    /// An exception value (caught or returned).
    Exception {
        type_name: String,
        message: Option<String>,
    },
    /// Output-only: the repr of a value with no direct mapping.
    Repr(String),
}

impl Object {
    /// Converts a host object into a runtime value, allocating as needed.
    pub(crate) fn to_value(
        &self,
        heap: &mut Heap<impl ResourceTracker>,
        interns: &Interns,
    ) -> Result<Value, Exception> {
        let alloc_err = |_| Exception::new(ExcKind::MemoryError, Some("input exceeds the memory limit".to_owned()));
        match self {
            Self::None => Ok(Value::None),
            Self::Ellipsis => Ok(Value::Ellipsis),
            Self::Bool(b) => Ok(Value::Bool(*b)),
            Self::Int(i) => Ok(Value::Int(*i)),
            Self::BigInt(big) => {
                let id = heap
                    .alloc(HeapData::LongInt(crate::types::LongInt::new(big.clone())))
                    .map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Float(x) => Ok(Value::Float(*x)),
            Self::String(s) => {
                let id = heap.alloc(HeapData::Str(Str::new(s.clone()))).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Bytes(data) => {
                let id = heap.alloc(HeapData::Bytes(Bytes::new(data.clone()))).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::List(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(element.to_value(heap, interns)?);
                }
                let id = heap.alloc(HeapData::List(List::new(values))).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Tuple(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(element.to_value(heap, interns)?);
                }
                let id = heap.alloc(HeapData::Tuple(Tuple::new(values))).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Dict(pairs) => {
                let mut dict = Dict::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = key.to_value(heap, interns)?;
                    let value = value.to_value(heap, interns)?;
                    let HashAttempt::Ready(hash) = key.hash_key(heap, interns) else {
                        key.drop_with_heap(heap);
                        value.drop_with_heap(heap);
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            Some("unhashable dict key in input".to_owned()),
                        ));
                    };
                    if let Some(old) = dict.insert(key, hash, value, heap, interns) {
                        old.drop_with_heap(heap);
                    }
                }
                let id = heap.alloc(HeapData::Dict(dict)).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Set(elements) => {
                let mut set = Set::new();
                for element in elements {
                    let value = element.to_value(heap, interns)?;
                    let HashAttempt::Ready(hash) = value.hash_key(heap, interns) else {
                        value.drop_with_heap(heap);
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            Some("unhashable set element in input".to_owned()),
                        ));
                    };
                    if let Some(dup) = set.add(value, hash, heap, interns) {
                        dup.drop_with_heap(heap);
                    }
                }
                let id = heap.alloc(HeapData::Set(set)).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Exception { type_name, message } => {
                let kind = type_name.parse::<ExcKind>().unwrap_or(ExcKind::Exception);
                let mut payload = crate::exc::ExcPayload::new(kind);
                if kind.to_string() != *type_name {
                    payload.class_name = Some(type_name.clone());
                }
                payload.message = message.clone();
                let id = heap.alloc(HeapData::Exception(payload)).map_err(alloc_err)?;
                Ok(Value::Ref(id))
            }
            Self::Repr(_) => Err(Exception::new(
                ExcKind::TypeError,
                Some("Repr objects cannot be used as inputs".to_owned()),
            )),
        }
    }

    /// Converts a runtime value into a host object (borrowing only).
    pub(crate) fn from_value(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Self {
        match value {
            Value::Undefined => Self::Repr("<undefined>".to_owned()),
            Value::None => Self::None,
            Value::Ellipsis => Self::Ellipsis,
            Value::NotImplemented => Self::Repr("NotImplemented".to_owned()),
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(x) => Self::Float(*x),
            Value::InternStr(id) => Self::String(interns.get_str(*id).to_owned()),
            Value::InternBytes(id) => Self::Bytes(interns.get_bytes(*id).to_vec()),
            Value::InternLongInt(id) => Self::BigInt(interns.get_long_int(*id).clone()),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::String(s.as_str().to_owned()),
                HeapData::Bytes(b) | HeapData::ByteArray(b) => Self::Bytes(b.as_slice().to_vec()),
                HeapData::LongInt(li) => Self::BigInt(li.inner().clone()),
                HeapData::List(l) => Self::List(
                    l.elements()
                        .iter()
                        .map(|e| Self::from_value(e, heap, interns))
                        .collect(),
                ),
                HeapData::Tuple(t) => Self::Tuple(
                    t.elements()
                        .iter()
                        .map(|e| Self::from_value(e, heap, interns))
                        .collect(),
                ),
                HeapData::Dict(d) => Self::Dict(
                    d.iter()
                        .map(|(k, v)| (Self::from_value(k, heap, interns), Self::from_value(v, heap, interns)))
                        .collect(),
                ),
                HeapData::Set(s) | HeapData::FrozenSet(s) => {
                    Self::Set(s.iter().map(|e| Self::from_value(e, heap, interns)).collect())
                }
                HeapData::Exception(payload) => Self::Exception {
                    type_name: payload.type_name().to_owned(),
                    message: payload.message.clone(),
                },
                _ => {
                    let mut out = String::new();
                    crate::value::write_repr(&mut out, value, heap, interns, &mut Vec::new());
                    Self::Repr(out)
                }
            },
            _ => {
                let mut out = String::new();
                crate::value::write_repr(&mut out, value, heap, interns, &mut Vec::new());
                Self::Repr(out)
            }
        }
    }

    /// Convenience constructor for string objects.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Convenience constructor for dict objects from an ordered map.
    #[must_use]
    pub fn dict(map: IndexMap<String, Object>) -> Self {
        Self::Dict(map.into_iter().map(|(k, v)| (Self::String(k), v)).collect())
    }
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Ellipsis => write!(f, "Ellipsis"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::BigInt(big) => write!(f, "{big}"),
            Self::Float(x) => write!(f, "{}", fmt_float(*x)),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(data) => {
                let mut out = String::new();
                crate::types::write_bytes_repr(&mut out, data, false);
                write!(f, "{out}")
            }
            Self::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            }
            Self::Tuple(elements) => {
                write!(f, "(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                if elements.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            Self::Set(elements) => {
                if elements.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "}}")
            }
            Self::Exception { type_name, message } => match message {
                Some(message) => write!(f, "{type_name}: {message}"),
                None => write!(f, "{type_name}"),
            },
            Self::Repr(repr) => write!(f, "{repr}"),
        }
    }
}
