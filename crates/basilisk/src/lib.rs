#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at call sites")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the guest language")]
#![expect(clippy::too_many_lines, reason = "the dispatcher match is one deliberate unit")]
#![expect(clippy::missing_panics_doc, reason = "internal invariants are documented inline")]
#![expect(clippy::must_use_candidate, reason = "builder-style APIs are used for effect")]

mod builtins;
mod code;
mod exc;
mod exception;
mod frame;
mod guest_hash;
mod heap;
mod intern;
mod io;
mod object;
mod resource;
mod runner;
mod task;
mod types;
mod value;
mod vm;

pub use crate::{
    code::{BinOp, BuildError, CmpOp, Code, CodeBuilder, ExcTableEntry, FunctionDef, HandlerKind, Instr, Label,
        Opcode, ParamSpec, UnaryOp},
    exception::{ExcKind, Exception, StackFrame},
    heap::{HeapDiff, HeapStats},
    intern::{BytesId, ExtFunctionId, FunctionId, LongIntId, StringId},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LARGE_RESULT_THRESHOLD, LimitedTracker, NoLimitTracker, ResourceError,
        ResourceLimits, ResourceTracker,
    },
    runner::{CancelToken, HostPolicy, Program, ProgramBuilder, RunProgress, Runner, Snapshot},
};
