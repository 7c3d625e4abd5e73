//! Builtin callables the engine itself provides.
//!
//! Only what the engine's own semantics need ships here: core conversions,
//! the iteration protocol, introspection used by the object model, the
//! deterministic async primitives, and exception constructors. The broader
//! standard library is a plug-in concern and intentionally absent.
//!
//! Builtins are immediate values (`Value::Builtin`), so loading one never
//! allocates. The runner seeds module globals by name from this registry.

use strum::IntoStaticStr;

use crate::{exc::ExcKind, types::Type};

/// Builtin functions (the non-type, non-exception callables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum BuiltinFn {
    Print,
    Len,
    Repr,
    Hash,
    Iter,
    Next,
    Isinstance,
    Issubclass,
    Callable,
    Getattr,
    Setattr,
    Hasattr,
    Abs,
    Zip,
    Enumerate,
    Reversed,
    Map,
    Filter,
    /// Deterministic fan-out over awaitables.
    Gather,
    /// Cooperative zero-delay suspension point; always legal.
    AsyncSleep,
    /// Wall-clock blocking sleep; refused by default host policy.
    Sleep,
    /// On-demand cycle collection hook.
    CollectCycles,
}

impl BuiltinFn {
    /// The guest-visible name (snake_case of the variant).
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Methods on builtin types, dispatched by attribute access.
///
/// Bound through `BoundMethod` values: `lst.append` resolves to a bound
/// method whose callable is `Builtin::Method(BuiltinMethod::ListAppend)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum BuiltinMethod {
    ListAppend,
    ListPop,
    ListExtend,
    ListClear,
    DictGet,
    DictKeys,
    DictValues,
    DictItems,
    DictPop,
    DictClear,
    SetAdd,
    SetRemove,
    SetDiscard,
    SetClear,
    StrUpper,
    StrLower,
    StrStrip,
    StrSplit,
    StrJoin,
    StrStartswith,
    StrEndswith,
    StrReplace,
}

impl BuiltinMethod {
    /// Resolves `receiver_type.name` to a builtin method.
    #[must_use]
    pub fn resolve(receiver: Type, name: &str) -> Option<Self> {
        let method = match (receiver, name) {
            (Type::List, "append") => Self::ListAppend,
            (Type::List, "pop") => Self::ListPop,
            (Type::List, "extend") => Self::ListExtend,
            (Type::List, "clear") => Self::ListClear,
            (Type::Dict, "get") => Self::DictGet,
            (Type::Dict, "keys") => Self::DictKeys,
            (Type::Dict, "values") => Self::DictValues,
            (Type::Dict, "items") => Self::DictItems,
            (Type::Dict, "pop") => Self::DictPop,
            (Type::Dict, "clear") => Self::DictClear,
            (Type::Set, "add") => Self::SetAdd,
            (Type::Set, "remove") => Self::SetRemove,
            (Type::Set, "discard") => Self::SetDiscard,
            (Type::Set, "clear") => Self::SetClear,
            (Type::Str, "upper") => Self::StrUpper,
            (Type::Str, "lower") => Self::StrLower,
            (Type::Str, "strip") => Self::StrStrip,
            (Type::Str, "split") => Self::StrSplit,
            (Type::Str, "join") => Self::StrJoin,
            (Type::Str, "startswith") => Self::StrStartswith,
            (Type::Str, "endswith") => Self::StrEndswith,
            (Type::Str, "replace") => Self::StrReplace,
            _ => return None,
        };
        Some(method)
    }

    /// The guest-visible method name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ListAppend => "append",
            Self::ListPop | Self::DictPop => "pop",
            Self::ListExtend => "extend",
            Self::ListClear | Self::DictClear | Self::SetClear => "clear",
            Self::DictGet => "get",
            Self::DictKeys => "keys",
            Self::DictValues => "values",
            Self::DictItems => "items",
            Self::SetAdd => "add",
            Self::SetRemove => "remove",
            Self::SetDiscard => "discard",
            Self::StrUpper => "upper",
            Self::StrLower => "lower",
            Self::StrStrip => "strip",
            Self::StrSplit => "split",
            Self::StrJoin => "join",
            Self::StrStartswith => "startswith",
            Self::StrEndswith => "endswith",
            Self::StrReplace => "replace",
        }
    }
}

/// Any builtin value: a function, a constructible type, a method on a
/// builtin type, or an exception class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum Builtin {
    Fn(BuiltinFn),
    Type(Type),
    Method(BuiltinMethod),
    Exc(ExcKind),
}

impl Builtin {
    /// The guest-visible name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Fn(f) => f.name(),
            Self::Type(t) => t.name(),
            Self::Method(m) => m.name(),
            Self::Exc(k) => k.into(),
        }
    }
}

/// All function builtins, for global seeding.
const FN_REGISTRY: &[BuiltinFn] = &[
    BuiltinFn::Print,
    BuiltinFn::Len,
    BuiltinFn::Repr,
    BuiltinFn::Hash,
    BuiltinFn::Iter,
    BuiltinFn::Next,
    BuiltinFn::Isinstance,
    BuiltinFn::Issubclass,
    BuiltinFn::Callable,
    BuiltinFn::Getattr,
    BuiltinFn::Setattr,
    BuiltinFn::Hasattr,
    BuiltinFn::Abs,
    BuiltinFn::Zip,
    BuiltinFn::Enumerate,
    BuiltinFn::Reversed,
    BuiltinFn::Map,
    BuiltinFn::Filter,
    BuiltinFn::Gather,
    BuiltinFn::AsyncSleep,
    BuiltinFn::Sleep,
    BuiltinFn::CollectCycles,
];

/// Constructible builtin types, for global seeding.
const TYPE_REGISTRY: &[Type] = &[
    Type::Bool,
    Type::Int,
    Type::Float,
    Type::Str,
    Type::Bytes,
    Type::ByteArray,
    Type::Tuple,
    Type::List,
    Type::Dict,
    Type::Set,
    Type::FrozenSet,
    Type::Range,
    Type::Slice,
    Type::Object,
    Type::Type,
];

/// Exception classes reachable by name from guest code.
const EXC_REGISTRY: &[ExcKind] = &[
    ExcKind::BaseException,
    ExcKind::Exception,
    ExcKind::ExceptionGroup,
    ExcKind::GeneratorExit,
    ExcKind::CancelledError,
    ExcKind::ArithmeticError,
    ExcKind::ZeroDivisionError,
    ExcKind::OverflowError,
    ExcKind::FloatingPointError,
    ExcKind::LookupError,
    ExcKind::IndexError,
    ExcKind::KeyError,
    ExcKind::RuntimeError,
    ExcKind::RecursionError,
    ExcKind::NotImplementedError,
    ExcKind::NameError,
    ExcKind::UnboundLocalError,
    ExcKind::ValueError,
    ExcKind::UnicodeDecodeError,
    ExcKind::AttributeError,
    ExcKind::TypeError,
    ExcKind::StopIteration,
    ExcKind::StopAsyncIteration,
    ExcKind::AssertionError,
    ExcKind::MemoryError,
    ExcKind::TimeoutError,
    ExcKind::SyntaxError,
];

/// Resolves a global name to a builtin, for namespace seeding.
#[must_use]
pub(crate) fn builtin_by_name(name: &str) -> Option<Builtin> {
    FN_REGISTRY
        .iter()
        .copied()
        .find(|f| f.name() == name)
        .map(Builtin::Fn)
        .or_else(|| {
            TYPE_REGISTRY
                .iter()
                .copied()
                .find(|t| t.name() == name)
                .map(Builtin::Type)
        })
        .or_else(|| {
            EXC_REGISTRY
                .iter()
                .copied()
                .find(|k| <&'static str>::from(*k) == name)
                .map(Builtin::Exc)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_to_the_expected_category() {
        assert_eq!(builtin_by_name("print"), Some(Builtin::Fn(BuiltinFn::Print)));
        assert_eq!(builtin_by_name("list"), Some(Builtin::Type(Type::List)));
        assert_eq!(builtin_by_name("range"), Some(Builtin::Type(Type::Range)));
        assert_eq!(
            builtin_by_name("ZeroDivisionError"),
            Some(Builtin::Exc(ExcKind::ZeroDivisionError))
        );
        assert_eq!(builtin_by_name("no_such_builtin"), None);
    }

    #[test]
    fn snake_case_names_match_guest_spelling() {
        assert_eq!(BuiltinFn::Isinstance.name(), "isinstance");
        assert_eq!(BuiltinFn::CollectCycles.name(), "collect_cycles");
        assert_eq!(BuiltinFn::AsyncSleep.name(), "async_sleep");
    }
}
