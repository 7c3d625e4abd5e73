//! Builtin guest types and their payloads.
//!
//! Each payload struct stores the data of one heap-allocated guest value.
//! Dispatch over payloads happens in `heap.rs` (`HeapData`) and the VM; the
//! modules here hold the type-specific behavior.

pub(crate) mod bytes;
pub(crate) mod class;
pub(crate) mod dict;
pub(crate) mod function;
pub(crate) mod generator;
pub(crate) mod iter;
pub(crate) mod list;
pub(crate) mod long_int;
pub(crate) mod range;
pub(crate) mod set;
pub(crate) mod str;
pub(crate) mod tuple;

pub(crate) use bytes::{Bytes, write_bytes_repr};
pub(crate) use class::{ClassObject, HashPolicy, Instance, compute_c3_mro};
pub(crate) use dict::Dict;
pub(crate) use function::{BoundMethod, Closure};
pub(crate) use generator::{Coroutine, Generator, GeneratorState};
pub(crate) use iter::IterState;
pub(crate) use list::List;
pub(crate) use long_int::LongInt;
pub(crate) use range::{Range, Slice};
pub(crate) use set::Set;
pub(crate) use str::{Str, write_str_repr};
pub(crate) use tuple::Tuple;

/// Tags for the builtin types.
///
/// Guest-defined classes are not tags; their type identity is the class
/// object itself. `Type` covers everything with engine-defined behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Type {
    NoneType,
    Ellipsis,
    NotImplementedType,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    ByteArray,
    Tuple,
    List,
    Dict,
    Set,
    FrozenSet,
    Range,
    Slice,
    Function,
    BuiltinFunction,
    Method,
    /// The metatype of builtin types and guest classes.
    Type,
    Object,
    Generator,
    Coroutine,
    Cell,
    Exception,
}

impl Type {
    /// The guest-visible type name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NoneType => "NoneType",
            Self::Ellipsis => "ellipsis",
            Self::NotImplementedType => "NotImplementedType",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::ByteArray => "bytearray",
            Self::Tuple => "tuple",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::FrozenSet => "frozenset",
            Self::Range => "range",
            Self::Slice => "slice",
            Self::Function => "function",
            Self::BuiltinFunction => "builtin_function_or_method",
            Self::Method => "method",
            Self::Type => "type",
            Self::Object => "object",
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::Cell => "cell",
            Self::Exception => "Exception",
        }
    }

}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
