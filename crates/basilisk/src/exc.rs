//! Internal exception representation: kinds, payloads, and the error type
//! that flows through the dispatcher.
//!
//! A raised exception travels as a [`RunError`] until either an exception
//! table entry catches it or it escapes the outermost frame and is converted
//! to the public [`crate::Exception`]. The payload carries everything needed
//! for deterministic rendering: message, chaining slots (`cause`, `context`,
//! `suppress_context`), group members for `except*`, and the traceback
//! frames collected innermost-first while unwinding.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{intern::StringId, value::Value};

/// Result type for operations that can raise a guest exception.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Builtin exception kinds distinguished by the engine.
///
/// The string form of each variant is its guest-visible class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcKind {
    /// Root of the hierarchy; matches every exception.
    BaseException,
    /// Root of the catchable hierarchy.
    Exception,
    /// Aggregate raised and split by `except*`.
    ExceptionGroup,
    /// Raised into a generator being closed. Derives `BaseException`.
    GeneratorExit,
    /// Host-signaled cancellation. Derives `BaseException` so that a bare
    /// `except Exception` cannot swallow it.
    CancelledError,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    FloatingPointError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    RecursionError,
    NotImplementedError,

    // --- NameError hierarchy ---
    NameError,
    UnboundLocalError,

    // --- ValueError hierarchy ---
    ValueError,
    UnicodeDecodeError,

    // --- standalone kinds ---
    AttributeError,
    TypeError,
    StopIteration,
    StopAsyncIteration,
    AssertionError,
    MemoryError,
    TimeoutError,
    SyntaxError,
}

impl ExcKind {
    /// Whether an exception of kind `self` is caught by a handler naming
    /// `handler`.
    #[must_use]
    pub fn is_caught_by(self, handler: Self) -> bool {
        if self == handler {
            return true;
        }
        match handler {
            Self::BaseException => true,
            Self::Exception => !matches!(self, Self::BaseException | Self::GeneratorExit | Self::CancelledError),
            Self::ArithmeticError => matches!(
                self,
                Self::ZeroDivisionError | Self::OverflowError | Self::FloatingPointError
            ),
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            Self::RuntimeError => matches!(self, Self::RecursionError | Self::NotImplementedError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            Self::ValueError => matches!(self, Self::UnicodeDecodeError),
            _ => false,
        }
    }

    /// Shorthand: a type error with a formatted message.
    #[must_use]
    pub(crate) fn type_error(msg: impl Into<String>) -> RunError {
        ExcPayload::with_message(Self::TypeError, msg).into()
    }

    /// Shorthand: a value error with a formatted message.
    #[must_use]
    pub(crate) fn value_error(msg: impl Into<String>) -> RunError {
        ExcPayload::with_message(Self::ValueError, msg).into()
    }

    /// Shorthand: a runtime error with a formatted message.
    #[must_use]
    pub(crate) fn runtime_error(msg: impl Into<String>) -> RunError {
        ExcPayload::with_message(Self::RuntimeError, msg).into()
    }

    /// Shorthand: `'X' object has no attribute 'y'`.
    #[must_use]
    pub(crate) fn attribute_error(type_name: impl std::fmt::Display, attr: &str) -> RunError {
        ExcPayload::with_message(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    /// Shorthand: division or modulo by zero.
    #[must_use]
    pub(crate) fn zero_division(msg: &str) -> RunError {
        ExcPayload::with_message(Self::ZeroDivisionError, msg).into()
    }

    /// Shorthand: a bare `StopIteration` signalling exhaustion.
    #[must_use]
    pub(crate) fn stop_iteration() -> RunError {
        ExcPayload::new(Self::StopIteration).into()
    }

    /// Shorthand: an index error with a message.
    #[must_use]
    pub(crate) fn index_error(msg: impl Into<String>) -> RunError {
        ExcPayload::with_message(Self::IndexError, msg).into()
    }

    /// Shorthand: a key error whose message is the missing key's repr.
    #[must_use]
    pub(crate) fn key_error(key_repr: impl Into<String>) -> RunError {
        ExcPayload::with_message(Self::KeyError, key_repr).into()
    }

    /// Shorthand: `name 'x' is not defined`.
    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        ExcPayload::with_message(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    /// Shorthand: unbound local access.
    #[must_use]
    pub(crate) fn unbound_local(name: &str) -> RunError {
        ExcPayload::with_message(
            Self::UnboundLocalError,
            format!("cannot access local variable '{name}' where it is not associated with a value"),
        )
        .into()
    }
}

/// One traceback link: where an exception passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RawFrame {
    /// Source identifier of the frame's code object.
    pub source_id: StringId,
    /// 1-based source line of the faulting/calling instruction.
    pub line: u32,
    /// Function qualified name, or `<module>` for top level.
    pub func_id: StringId,
}

/// The owned data of a raised exception.
///
/// Cloneable and heap-free: guest-defined exception instances keep their
/// identity through [`ExcRaise::original`] instead, so re-raising after a
/// catch observes the same object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExcPayload {
    pub kind: ExcKind,
    /// Class name when raised from a guest-defined exception class.
    pub class_name: Option<String>,
    /// Weak link to the guest exception class: `(slot index, slot uid)`.
    ///
    /// Used by handler matching to honor guest class hierarchies. Weak on
    /// purpose: a payload must stay heap-free, and a stale link (slot
    /// reused) simply stops matching.
    #[serde(default)]
    pub class_slot: Option<(usize, u64)>,
    pub message: Option<String>,
    /// Member exceptions when `kind` is `ExceptionGroup`.
    pub group: Vec<ExcPayload>,
    /// Explicit `raise ... from` cause.
    pub cause: Option<Box<ExcPayload>>,
    /// Implicit during-handling context.
    pub context: Option<Box<ExcPayload>>,
    /// Set by `raise ... from`, suppressing the implicit context line.
    pub suppress_context: bool,
    /// Traceback frames, innermost first.
    pub frames: Vec<RawFrame>,
    /// Resource breaches carry this flag: `finally` handlers still run, but
    /// `except` handlers never match and re-raising keeps the flag.
    #[serde(default)]
    pub uncatchable: bool,
}

impl ExcPayload {
    /// A bare exception of the given kind.
    #[must_use]
    pub fn new(kind: ExcKind) -> Self {
        Self {
            kind,
            class_name: None,
            class_slot: None,
            message: None,
            group: Vec::new(),
            cause: None,
            context: None,
            suppress_context: false,
            frames: Vec::new(),
            uncatchable: false,
        }
    }

    /// An exception with a message.
    #[must_use]
    pub fn with_message(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(kind)
        }
    }

    /// An exception group with members.
    #[must_use]
    pub fn group(message: impl Into<String>, members: Vec<Self>) -> Self {
        Self {
            message: Some(message.into()),
            group: members,
            ..Self::new(ExcKind::ExceptionGroup)
        }
    }

    /// The guest-visible class name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.class_name.as_deref().unwrap_or_else(|| self.kind.into())
    }

    /// Records the currently-handled exception as implicit context.
    ///
    /// No-op when a context is already chained or when the context would be
    /// this very exception (a bare re-raise is not "during handling").
    pub fn chain_context(&mut self, context: &Self) {
        if self.context.is_none() && !self.same_exception(context) {
            self.context = Some(Box::new(context.clone()));
        }
    }

    /// Structural identity check used to avoid self-chaining.
    fn same_exception(&self, other: &Self) -> bool {
        self.kind == other.kind && self.class_name == other.class_name && self.message == other.message
    }

    /// Appends a traceback frame (innermost-first order).
    pub fn push_frame(&mut self, frame: RawFrame) {
        self.frames.push(frame);
    }

    /// Wraps into a raise record with no guest instance attached.
    #[must_use]
    pub fn into_raise(self) -> ExcRaise {
        ExcRaise {
            exc: self,
            original: None,
        }
    }
}

/// A payload in flight, optionally carrying the guest exception instance it
/// was raised from so catch-and-re-raise preserves identity.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ExcRaise {
    pub exc: ExcPayload,
    /// The guest instance (owned reference) when the exception originated
    /// from a heap value. Must be dropped through the heap.
    pub original: Option<Value>,
}

/// Error type flowing through the dispatcher.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RunError {
    /// A catchable guest exception.
    Exc(Box<ExcRaise>),
    /// An exception that unwinds for traceback purposes but cannot be
    /// caught (memory/time breaches, cancellation).
    Uncatchable(Box<ExcRaise>),
    /// An engine invariant violation; never surfaced as a guest exception.
    Internal(String),
}

impl RunError {
    /// An internal engine error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The exception kind, when this is a guest exception.
    #[must_use]
    pub fn kind(&self) -> Option<ExcKind> {
        match self {
            Self::Exc(raise) | Self::Uncatchable(raise) => Some(raise.exc.kind),
            Self::Internal(_) => None,
        }
    }

    /// Whether this is a (catchable) `StopIteration`.
    #[must_use]
    pub fn is_stop_iteration(&self) -> bool {
        matches!(self, Self::Exc(raise) if raise.exc.kind == ExcKind::StopIteration)
    }

    /// Unwraps the raise record, transferring ownership of any attached
    /// guest instance to the caller.
    #[must_use]
    pub fn into_raise(self) -> Option<Box<ExcRaise>> {
        match self {
            Self::Exc(raise) | Self::Uncatchable(raise) => Some(raise),
            Self::Internal(_) => None,
        }
    }
}

impl From<ExcPayload> for RunError {
    fn from(payload: ExcPayload) -> Self {
        Self::Exc(Box::new(payload.into_raise()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_matching() {
        assert!(ExcKind::ZeroDivisionError.is_caught_by(ExcKind::ArithmeticError));
        assert!(ExcKind::ZeroDivisionError.is_caught_by(ExcKind::Exception));
        assert!(ExcKind::ZeroDivisionError.is_caught_by(ExcKind::BaseException));
        assert!(!ExcKind::ZeroDivisionError.is_caught_by(ExcKind::LookupError));
        assert!(ExcKind::KeyError.is_caught_by(ExcKind::LookupError));
        assert!(ExcKind::RecursionError.is_caught_by(ExcKind::RuntimeError));
        assert!(ExcKind::UnboundLocalError.is_caught_by(ExcKind::NameError));
    }

    #[test]
    fn cancellation_escapes_plain_exception_handlers() {
        assert!(!ExcKind::CancelledError.is_caught_by(ExcKind::Exception));
        assert!(ExcKind::CancelledError.is_caught_by(ExcKind::BaseException));
        assert!(!ExcKind::GeneratorExit.is_caught_by(ExcKind::Exception));
    }

    #[test]
    fn context_chains_once_and_never_to_itself() {
        let outer = ExcPayload::with_message(ExcKind::ValueError, "outer");
        let mut inner = ExcPayload::with_message(ExcKind::TypeError, "inner");
        inner.chain_context(&outer);
        assert_eq!(inner.context.as_deref().unwrap().message.as_deref(), Some("outer"));

        let frozen = inner.context.clone();
        inner.chain_context(&ExcPayload::new(ExcKind::KeyError));
        assert_eq!(inner.context, frozen);

        let mut same = ExcPayload::with_message(ExcKind::TypeError, "x");
        let twin = same.clone();
        same.chain_context(&twin);
        assert!(same.context.is_none());
    }

    #[test]
    fn kind_names_render_like_guest_classes() {
        assert_eq!(ExcKind::ZeroDivisionError.to_string(), "ZeroDivisionError");
        assert_eq!(
            ExcPayload::new(ExcKind::TypeError).type_name(),
            "TypeError"
        );
        let mut custom = ExcPayload::new(ExcKind::Exception);
        custom.class_name = Some("MyError".to_owned());
        assert_eq!(custom.type_name(), "MyError");
    }
}
