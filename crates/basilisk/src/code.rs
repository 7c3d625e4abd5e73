//! The compiled-artifact contract: instructions, code objects, and the
//! builder a compiler front-end uses to produce them.
//!
//! The engine never parses source text. A front-end (an external collaborator
//! to this crate) lowers a script into one module-level [`Code`] plus a
//! function table, all expressed through [`CodeBuilder`]. Instructions are
//! fixed width: a one-byte tag logically, stored as `(Opcode, u32)` pairs so
//! jump targets are plain instruction indices and resuming a paused frame
//! needs no decoding state.
//!
//! # Conventions the engine relies on
//!
//! - Module-level code addresses variables exclusively through
//!   `LoadGlobal`/`StoreGlobal`; function code uses local slots plus global
//!   slots resolved at compile time.
//! - Parameters occupy the first local slots in declaration order
//!   (positional, `*args`, keyword-only, `**kwargs`). A parameter that is
//!   also captured by an inner function is copied into its cell by an
//!   explicit `LoadLocal` + `StoreCell` prologue emitted by the front-end.
//! - Exception-table entries are listed innermost-first; handler code must
//!   sit outside the `start..end` range it protects.

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::{
    intern::{StringId, StaticStr},
    value::Value,
};

/// One VM instruction: an opcode tag plus a fixed-width operand slot.
///
/// Operands index the code object's tables (constants, locals, globals,
/// cells, interned names) or hold an instruction index for jumps. Opcodes
/// without an operand leave it zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    pub op: Opcode,
    pub arg: u32,
}

/// The opcode catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum Opcode {
    // --- stack shuffling ---
    /// Pops and discards the top of stack.
    Pop,
    /// Duplicates the top of stack.
    Dup,
    /// Swaps the top two stack entries.
    Rot2,
    /// Rotates the top three entries: `[a, b, c]` becomes `[c, a, b]`.
    Rot3,

    // --- constants & names ---
    /// Pushes constant `arg` from the constant pool.
    LoadConst,
    /// Pushes local slot `arg`; unbound slots raise the unbound-local kind.
    LoadLocal,
    /// Pops into local slot `arg`.
    StoreLocal,
    /// Unbinds local slot `arg`.
    DeleteLocal,
    /// Pushes global slot `arg`; unbound slots raise the name kind.
    LoadGlobal,
    /// Pops into global slot `arg`.
    StoreGlobal,
    /// Unbinds global slot `arg`.
    DeleteGlobal,
    /// Pushes the value held by cell `arg`.
    LoadCell,
    /// Pops into cell `arg`.
    StoreCell,
    /// Pushes a reference to cell `arg` itself (for `MakeFunction` capture).
    LoadCellRef,

    // --- containers ---
    /// Pops `arg` values, pushes a list.
    BuildList,
    /// Pops `arg` values, pushes a tuple.
    BuildTuple,
    /// Pops `arg` key/value pairs (key pushed before value), pushes a dict.
    BuildDict,
    /// Pops `arg` values, pushes a set.
    BuildSet,
    /// Pops `arg` (2 or 3) values, pushes a slice object.
    BuildSlice,
    /// Pops a value and appends it to the list `arg` entries below the top.
    ListAppend,
    /// Pops a value and adds it to the set `arg` entries below the top.
    SetAdd,
    /// Pops value then key, inserts into the dict `arg` entries below the top.
    MapAdd,
    /// Pops an iterable, extends the list beneath it.
    ListExtend,
    /// Pops a mapping, merges it into the dict beneath it.
    DictUpdate,
    /// Pops index then container, pushes `container[index]`.
    Subscr,
    /// Pops index, container, value; performs `container[index] = value`.
    StoreSubscr,
    /// Pops index then container; performs `del container[index]`.
    DeleteSubscr,
    /// Pops an iterable and pushes its `arg` elements, last element deepest.
    UnpackSequence,

    // --- operators ---
    /// Binary operator; `arg` is a [`BinOp`] discriminant.
    Binary,
    /// In-place operator; `arg` is a [`BinOp`] discriminant.
    Inplace,
    /// Unary operator; `arg` is a [`UnaryOp`] discriminant.
    Unary,
    /// Comparison; `arg` is a [`CmpOp`] discriminant.
    Compare,

    // --- control flow ---
    /// Unconditional jump to instruction `arg`.
    Jump,
    /// Pops; jumps to `arg` when truthy.
    JumpIfTrue,
    /// Pops; jumps to `arg` when falsy.
    JumpIfFalse,
    /// Peeks; jumps when truthy keeping the value, else pops it.
    JumpIfTrueOrPop,
    /// Peeks; jumps when falsy keeping the value, else pops it.
    ///
    /// This is the chained-comparison short-circuit: `a < b < c` compares
    /// `a < b`, branches on the peeked result, and only pops it when the
    /// chain continues.
    JumpIfFalseOrPop,
    /// Pops a value and pushes an iterator over it (`__iter__`, with the
    /// sequential `__getitem__` adaptor as fallback).
    GetIter,
    /// Advances the iterator at top of stack. Pushes the next value, or on
    /// exhaustion pops the iterator and jumps to instruction `arg`.
    ForIter,

    // --- calls & frames ---
    /// Creates a function object for function-table entry `arg`.
    ///
    /// Pops, in push order: positional then keyword-only default values (as
    /// declared by the function's parameter spec), then one cell reference
    /// per free variable.
    MakeFunction,
    /// Calls with `arg` positional arguments: `[callable, a0..aN]`.
    Call,
    /// Calls with keywords. Low 16 bits of `arg` = positional count, high 16
    /// bits = keyword count; stack is `[callable, pos.., key0, val0, ..]`
    /// with keys as string values.
    CallKw,
    /// Call with unpacking: `[callable, args_iterable, kwargs_dict?]`;
    /// `arg & 1` signals the kwargs dict is present.
    CallEx,
    /// Pops an object and pushes `object.name`; `arg` is the interned
    /// attribute name.
    LoadAttr,
    /// Pops an object then the value below it; performs `object.name =
    /// value`. Stack (push order): value, object.
    StoreAttr,
    /// Pops an object; performs `del object.name`.
    DeleteAttr,
    /// Pushes `receiver.name` prepared for an immediate call: either
    /// `[receiver, function]` when the attribute is a plain class-level
    /// function, or `[undefined, callable]` otherwise. `arg` is the
    /// interned attribute name.
    LoadMethod,
    /// Calls the method pair pushed by `LoadMethod` with `arg` positional
    /// arguments above it.
    CallMethod,
    /// Returns the top of stack from the current frame.
    Return,
    /// Suspends the current generator frame, surfacing the popped value.
    Yield,
    /// Delegates to the iterator at top of stack, yielding each of its
    /// values; pushes the sub-iterator's return value when exhausted.
    YieldFrom,
    /// Pops an awaitable and drives it (coroutine, external future, or a
    /// value with `__await__`).
    Await,

    // --- exceptions ---
    /// Raises: `arg` = 0 re-raises the active exception, 1 pops the
    /// exception value, 2 pops cause then exception (`raise X from Y`).
    Raise,
    /// Re-raises the exception value at top of stack preserving its
    /// traceback. Terminates a finally-kind handler.
    Reraise,
    /// Pops the innermost handled-exception context at normal handler exit.
    ClearExc,
    /// Pops a type (or tuple of types); peeks the exception below; pushes
    /// whether the exception matches.
    CheckExcMatch,
    /// `except*` matching. Pops a type, pops the remaining group; pushes the
    /// non-matching rest (or none) then the matching sub-group (or none).
    ExceptStarMatch,
    /// Pops an accumulated rest value; re-raises it as a group unless none.
    ReraiseStar,

    // --- classes ---
    /// Builds a class. Stack: `[body_function, name, base0..baseN]` with
    /// `arg` bases. Runs the body frame, then links the class.
    BuildClass,
}

macro_rules! operator_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $idx:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $idx),+
        }

        impl $name {
            /// Decodes an operand slot back into the operator.
            #[must_use]
            pub(crate) fn from_arg(arg: u32) -> Self {
                match arg {
                    $($idx => Self::$variant,)+
                    _ => panic!("invalid {} operand {arg}", stringify!($name)),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(v: $name) -> Self {
                v as Self
            }
        }
    };
}

operator_enum! {
    /// Sub-operator tag for `Binary` and `Inplace` instructions.
    BinOp {
        Add = 0,
        Sub = 1,
        Mul = 2,
        Div = 3,
        FloorDiv = 4,
        Mod = 5,
        Pow = 6,
        MatMul = 7,
        LShift = 8,
        RShift = 9,
        BitAnd = 10,
        BitOr = 11,
        BitXor = 12,
    }
}

impl BinOp {
    /// The infix symbol, used in type-error messages.
    #[must_use]
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::MatMul => "@",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
        }
    }

    /// Forward dunder name (`__add__`, ...).
    #[must_use]
    pub(crate) fn dunder(self) -> StaticStr {
        match self {
            Self::Add => StaticStr::Add,
            Self::Sub => StaticStr::Sub,
            Self::Mul => StaticStr::Mul,
            Self::Div => StaticStr::TrueDiv,
            Self::FloorDiv => StaticStr::FloorDiv,
            Self::Mod => StaticStr::Mod,
            Self::Pow => StaticStr::Pow,
            Self::MatMul => StaticStr::MatMul,
            Self::LShift => StaticStr::LShift,
            Self::RShift => StaticStr::RShift,
            Self::BitAnd => StaticStr::BitAnd,
            Self::BitOr => StaticStr::BitOr,
            Self::BitXor => StaticStr::BitXor,
        }
    }

    /// Reflected dunder name (`__radd__`, ...).
    #[must_use]
    pub(crate) fn reflected_dunder(self) -> StaticStr {
        match self {
            Self::Add => StaticStr::Radd,
            Self::Sub => StaticStr::Rsub,
            Self::Mul => StaticStr::Rmul,
            Self::Div => StaticStr::RtrueDiv,
            Self::FloorDiv => StaticStr::RfloorDiv,
            Self::Mod => StaticStr::Rmod,
            Self::Pow => StaticStr::Rpow,
            Self::MatMul => StaticStr::RmatMul,
            Self::LShift => StaticStr::RlShift,
            Self::RShift => StaticStr::RrShift,
            Self::BitAnd => StaticStr::RbitAnd,
            Self::BitOr => StaticStr::RbitOr,
            Self::BitXor => StaticStr::RbitXor,
        }
    }

    /// In-place dunder name (`__iadd__`, ...).
    #[must_use]
    pub(crate) fn inplace_dunder(self) -> StaticStr {
        match self {
            Self::Add => StaticStr::Iadd,
            Self::Sub => StaticStr::Isub,
            Self::Mul => StaticStr::Imul,
            Self::Div => StaticStr::ItrueDiv,
            Self::FloorDiv => StaticStr::IfloorDiv,
            Self::Mod => StaticStr::Imod,
            Self::Pow => StaticStr::Ipow,
            Self::MatMul => StaticStr::ImatMul,
            Self::LShift => StaticStr::IlShift,
            Self::RShift => StaticStr::IrShift,
            Self::BitAnd => StaticStr::IbitAnd,
            Self::BitOr => StaticStr::IbitOr,
            Self::BitXor => StaticStr::IbitXor,
        }
    }
}

operator_enum! {
    /// Sub-operator tag for `Unary` instructions.
    UnaryOp {
        Neg = 0,
        Pos = 1,
        Invert = 2,
        Not = 3,
    }
}

operator_enum! {
    /// Sub-operator tag for `Compare` instructions.
    CmpOp {
        Eq = 0,
        Ne = 1,
        Lt = 2,
        Le = 3,
        Gt = 4,
        Ge = 5,
        Is = 6,
        IsNot = 7,
        In = 8,
        NotIn = 9,
    }
}

impl CmpOp {
    /// The comparison dunder for rich comparisons; `None` for identity and
    /// membership forms, which never consult dunders directly.
    #[must_use]
    pub(crate) fn dunder(self) -> Option<StaticStr> {
        match self {
            Self::Eq => Some(StaticStr::Eq),
            Self::Ne => Some(StaticStr::Ne),
            Self::Lt => Some(StaticStr::Lt),
            Self::Le => Some(StaticStr::Le),
            Self::Gt => Some(StaticStr::Gt),
            Self::Ge => Some(StaticStr::Ge),
            Self::Is | Self::IsNot | Self::In | Self::NotIn => None,
        }
    }

    /// The paired operator tried on the right operand (`lt` pairs with `gt`,
    /// `eq` with `eq`).
    #[must_use]
    pub(crate) fn swapped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }

    /// The infix symbol, used in type-error messages.
    #[must_use]
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// Kind of an exception-table handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// `except ...:` — matches by type, swallows on match.
    Except,
    /// `except* ...:` — matches by partitioning an exception group.
    ExceptStar,
    /// `finally:` — always runs, then re-raises.
    Finally,
}

/// One exception-table entry: an instruction range and where abrupt exits
/// from it transfer control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcTableEntry {
    /// First covered instruction index (inclusive).
    pub start: u32,
    /// Last covered instruction index (exclusive).
    pub end: u32,
    /// Handler entry point.
    pub handler: u32,
    /// Operand-stack depth to restore before entering the handler.
    pub stack_depth: u16,
    /// Handler kind.
    pub kind: HandlerKind,
}

impl ExcTableEntry {
    /// Returns whether this entry covers the given instruction index.
    #[inline]
    #[must_use]
    pub fn covers(&self, ip: u32) -> bool {
        self.start <= ip && ip < self.end
    }
}

/// A compiled code object: the unit the dispatcher executes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Code {
    instrs: Vec<Instr>,
    consts: Vec<Value>,
    /// Local slot names, used for unbound-local and class-body extraction.
    local_names: Vec<StringId>,
    /// Global slot names (meaningful on module-level code; function code
    /// shares the module's slots).
    global_names: Vec<StringId>,
    /// Cells this code allocates at frame entry.
    cell_count: u16,
    /// Captured cells appended after the owned ones.
    free_count: u16,
    /// `(instruction index, source line)` pairs, ascending by index.
    line_table: Vec<(u32, u32)>,
    exception_table: Vec<ExcTableEntry>,
    /// Filename-like identifier for tracebacks.
    source_id: StringId,
    qualname_id: StringId,
    /// Operand-stack allocation hint (linear overapproximation).
    max_stack: u16,
    /// Source text, when the front-end attaches it for traceback rendering.
    source_text: Option<String>,
}

impl Code {
    #[inline]
    #[must_use]
    pub(crate) fn instr(&self, ip: usize) -> Instr {
        self.instrs[ip]
    }

    #[inline]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.instrs.len()
    }

    #[inline]
    #[must_use]
    pub(crate) fn constant(&self, idx: u32) -> &Value {
        &self.consts[idx as usize]
    }

    #[must_use]
    pub(crate) fn local_name(&self, slot: u32) -> StringId {
        self.local_names[slot as usize]
    }

    #[must_use]
    pub(crate) fn local_count(&self) -> usize {
        self.local_names.len()
    }

    #[must_use]
    pub(crate) fn local_names(&self) -> &[StringId] {
        &self.local_names
    }

    #[must_use]
    pub(crate) fn global_name(&self, slot: u32) -> StringId {
        self.global_names[slot as usize]
    }

    #[must_use]
    pub(crate) fn global_count(&self) -> usize {
        self.global_names.len()
    }

    #[must_use]
    pub(crate) fn cell_count(&self) -> u16 {
        self.cell_count
    }

    #[must_use]
    pub(crate) fn free_count(&self) -> u16 {
        self.free_count
    }

    #[must_use]
    pub(crate) fn source_id(&self) -> StringId {
        self.source_id
    }

    #[must_use]
    pub(crate) fn qualname_id(&self) -> StringId {
        self.qualname_id
    }

    #[must_use]
    pub(crate) fn max_stack(&self) -> usize {
        usize::from(self.max_stack)
    }

    /// Source line for an instruction index (last line-table entry at or
    /// before it).
    #[must_use]
    pub(crate) fn line_for(&self, ip: u32) -> u32 {
        match self.line_table.binary_search_by_key(&ip, |&(i, _)| i) {
            Ok(idx) => self.line_table[idx].1,
            Err(0) => 0,
            Err(idx) => self.line_table[idx - 1].1,
        }
    }

    /// Text of a 1-based source line, when source text was attached.
    #[must_use]
    pub(crate) fn source_line_text(&self, line: u32) -> Option<&str> {
        let text = self.source_text.as_deref()?;
        text.lines().nth(line.checked_sub(1)? as usize).map(str::trim)
    }

    /// Innermost exception-table entry covering `ip`.
    #[must_use]
    pub(crate) fn find_handler(&self, ip: u32) -> Option<ExcTableEntry> {
        self.exception_table.iter().copied().find(|e| e.covers(ip))
    }

    /// Innermost finally-kind entry covering `ip`.
    ///
    /// Uncatchable errors skip `except`/`except*` entries entirely but
    /// still transfer through every covering `finally`.
    #[must_use]
    pub(crate) fn find_finally_handler(&self, ip: u32) -> Option<ExcTableEntry> {
        self.exception_table
            .iter()
            .copied()
            .find(|e| e.covers(ip) && e.kind == HandlerKind::Finally)
    }
}

/// Parameter layout of a compiled function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Positional parameter names (positional-only first).
    pub positional: Vec<StringId>,
    /// How many leading `positional` entries are positional-only.
    pub pos_only: u16,
    /// Keyword-only parameter names.
    pub kw_only: Vec<StringId>,
    /// Trailing `positional` entries with default values.
    pub num_defaults: u16,
    /// Trailing `kw_only` entries with default values.
    pub num_kw_defaults: u16,
    /// Whether a `*args` slot follows the positional parameters.
    pub varargs: bool,
    /// Whether a `**kwargs` slot terminates the layout.
    pub varkw: bool,
}

impl ParamSpec {
    /// Total local slots the parameters occupy.
    #[must_use]
    pub(crate) fn slot_count(&self) -> usize {
        self.positional.len() + usize::from(self.varargs) + self.kw_only.len() + usize::from(self.varkw)
    }

    /// Values `MakeFunction` pops for defaults.
    #[must_use]
    pub(crate) fn default_count(&self) -> usize {
        usize::from(self.num_defaults) + usize::from(self.num_kw_defaults)
    }
}

/// A compiled guest function: code plus calling convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Qualified name for tracebacks and repr.
    pub qualname_id: StringId,
    pub code: Code,
    pub params: ParamSpec,
    /// Calling this function produces a generator instead of running it.
    pub is_generator: bool,
    /// Calling this function produces a coroutine awaiting execution.
    pub is_async: bool,
}

/// Structural violation detected while building a code object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// A label was referenced by a jump but never bound.
    UnboundLabel(usize),
    /// A jump target is outside the instruction range.
    TargetOutOfRange { instr: usize, target: u32 },
    /// An exception-table range is inverted or out of range.
    BadExceptionRange { start: u32, end: u32 },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnboundLabel(label) => write!(f, "jump label {label} was never bound"),
            Self::TargetOutOfRange { instr, target } => {
                write!(f, "instruction {instr} jumps to out-of-range target {target}")
            }
            Self::BadExceptionRange { start, end } => {
                write!(f, "exception table range {start}..{end} is invalid")
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Forward-reference label handed out by [`CodeBuilder::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Emits instructions and assembles a [`Code`] object.
///
/// Tracks source lines, patches forward jumps through labels, and keeps a
/// linear stack-depth estimate used as the frame's preallocation hint.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    instrs: Vec<Instr>,
    consts: Vec<Value>,
    local_names: Vec<StringId>,
    global_names: Vec<StringId>,
    cell_count: u16,
    free_count: u16,
    line_table: Vec<(u32, u32)>,
    exception_table: Vec<ExcTableEntry>,
    labels: Vec<Option<u32>>,
    /// `(instruction index, label)` pairs awaiting a bound target.
    patches: Vec<(usize, Label)>,
    /// `(exception-table index, label)` pairs awaiting a bound handler.
    handler_patches: Vec<(usize, Label)>,
    source_id: StringId,
    qualname_id: StringId,
    current_line: u32,
    depth: u16,
    max_depth: u16,
    source_text: Option<String>,
}

impl CodeBuilder {
    /// Creates a builder for a code object with the given identifiers.
    #[must_use]
    pub fn new(source_id: StringId, qualname_id: StringId) -> Self {
        Self {
            source_id,
            qualname_id,
            ..Self::default()
        }
    }

    /// Attaches source text so tracebacks can quote lines.
    pub fn attach_source(&mut self, text: impl Into<String>) {
        self.source_text = Some(text.into());
    }

    /// Sets the source line recorded for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Index of the next instruction to be emitted.
    #[must_use]
    pub fn here(&self) -> u32 {
        u32::try_from(self.instrs.len()).expect("instruction count exceeds u32")
    }

    /// Adds a constant, returning its pool index.
    pub(crate) fn add_const(&mut self, value: Value) -> u32 {
        debug_assert!(
            value.is_immediate(),
            "constant pool holds immediates only; containers are built by instructions"
        );
        let idx = u32::try_from(self.consts.len()).expect("constant pool exceeds u32");
        self.consts.push(value);
        idx
    }

    /// Constant-pool helpers for front-ends (the internal value type stays
    /// crate-private).
    pub fn const_none(&mut self) -> u32 {
        self.add_const(Value::None)
    }

    pub fn const_bool(&mut self, value: bool) -> u32 {
        self.add_const(Value::Bool(value))
    }

    pub fn const_int(&mut self, value: i64) -> u32 {
        self.add_const(Value::Int(value))
    }

    pub fn const_float(&mut self, value: f64) -> u32 {
        self.add_const(Value::Float(value))
    }

    pub fn const_str(&mut self, id: crate::intern::StringId) -> u32 {
        self.add_const(Value::InternStr(id))
    }

    pub fn const_bytes(&mut self, id: crate::intern::BytesId) -> u32 {
        self.add_const(Value::InternBytes(id))
    }

    pub fn const_big_int(&mut self, id: crate::intern::LongIntId) -> u32 {
        self.add_const(Value::InternLongInt(id))
    }

    /// Resolves a builtin by guest name into the pool; `None` when the name
    /// is not a builtin.
    pub fn const_builtin(&mut self, name: &str) -> Option<u32> {
        let builtin = crate::builtins::builtin_by_name(name)?;
        Some(self.add_const(Value::Builtin(builtin)))
    }

    /// Declares a local slot with a name, returning the slot index.
    pub fn add_local(&mut self, name: StringId) -> u32 {
        let idx = u32::try_from(self.local_names.len()).expect("local table exceeds u32");
        self.local_names.push(name);
        idx
    }

    /// Declares a global slot with a name, returning the slot index.
    pub fn add_global(&mut self, name: StringId) -> u32 {
        let idx = u32::try_from(self.global_names.len()).expect("global table exceeds u32");
        self.global_names.push(name);
        idx
    }

    /// Declares `own` cells allocated at frame entry and `free` captured ones.
    pub fn set_cells(&mut self, own: u16, free: u16) {
        self.cell_count = own;
        self.free_count = free;
    }

    /// Emits an instruction without an operand.
    pub fn emit(&mut self, op: Opcode) {
        self.emit_arg(op, 0);
    }

    /// Emits an instruction with an operand.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) {
        let index = self.here();
        match self.line_table.last() {
            Some(&(_, line)) if line == self.current_line => {}
            _ => self.line_table.push((index, self.current_line)),
        }
        self.instrs.push(Instr { op, arg });
        self.track_depth(op, arg);
    }

    /// Allocates a label for a forward jump target.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        let here = self.here();
        self.labels[label.0] = Some(here);
    }

    /// Emits a jump-family instruction targeting a label.
    pub fn emit_jump(&mut self, op: Opcode, label: Label) {
        debug_assert!(matches!(
            op,
            Opcode::Jump
                | Opcode::JumpIfTrue
                | Opcode::JumpIfFalse
                | Opcode::JumpIfTrueOrPop
                | Opcode::JumpIfFalseOrPop
                | Opcode::ForIter
        ));
        let at = self.instrs.len();
        self.emit_arg(op, u32::MAX);
        self.patches.push((at, label));
    }

    /// Records an exception-table entry covering `start..end`.
    ///
    /// Entries must be added innermost-first for nested ranges.
    pub fn add_handler(&mut self, start: u32, end: u32, handler: Label, stack_depth: u16, kind: HandlerKind) {
        let at = self.exception_table.len();
        self.exception_table.push(ExcTableEntry {
            start,
            end,
            handler: u32::MAX,
            stack_depth,
            kind,
        });
        self.handler_patches.push((at, handler));
    }

    fn track_depth(&mut self, op: Opcode, arg: u32) {
        let (pops, pushes) = stack_effect(op, arg);
        self.depth = self.depth.saturating_sub(pops);
        self.depth = self.depth.saturating_add(pushes);
        self.max_depth = self.max_depth.max(self.depth);
    }

    /// Validates structure and assembles the final [`Code`].
    pub fn build(mut self) -> Result<Code, BuildError> {
        for (at, label) in std::mem::take(&mut self.patches) {
            let target = self.labels[label.0].ok_or(BuildError::UnboundLabel(label.0))?;
            self.instrs[at].arg = target;
        }
        for (at, label) in std::mem::take(&mut self.handler_patches) {
            let target = self.labels[label.0].ok_or(BuildError::UnboundLabel(label.0))?;
            self.exception_table[at].handler = target;
        }
        let len = u32::try_from(self.instrs.len()).expect("instruction count exceeds u32");
        for (i, instr) in self.instrs.iter().enumerate() {
            if is_jump(instr.op) && instr.arg > len {
                return Err(BuildError::TargetOutOfRange {
                    instr: i,
                    target: instr.arg,
                });
            }
        }
        for entry in &self.exception_table {
            if entry.start > entry.end || entry.end > len || entry.handler > len {
                return Err(BuildError::BadExceptionRange {
                    start: entry.start,
                    end: entry.end,
                });
            }
        }
        Ok(Code {
            instrs: self.instrs,
            consts: self.consts,
            local_names: self.local_names,
            global_names: self.global_names,
            cell_count: self.cell_count,
            free_count: self.free_count,
            line_table: self.line_table,
            exception_table: self.exception_table,
            source_id: self.source_id,
            qualname_id: self.qualname_id,
            max_stack: self.max_depth,
            source_text: self.source_text,
        })
    }
}

fn is_jump(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Jump
            | Opcode::JumpIfTrue
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrueOrPop
            | Opcode::JumpIfFalseOrPop
            | Opcode::ForIter
    )
}

/// `(pops, pushes)` for the linear depth estimate.
///
/// Branch targets are not modeled; the estimate is an allocation hint, not a
/// verifier. Exception-handler entry depths come from the table.
fn stack_effect(op: Opcode, arg: u32) -> (u16, u16) {
    let n = u16::try_from(arg & 0xFFFF).unwrap_or(u16::MAX);
    match op {
        Opcode::Pop | Opcode::StoreLocal | Opcode::StoreGlobal | Opcode::StoreCell => (1, 0),
        Opcode::Dup => (0, 1),
        Opcode::Rot2 | Opcode::Rot3 => (0, 0),
        Opcode::LoadConst
        | Opcode::LoadLocal
        | Opcode::LoadGlobal
        | Opcode::LoadCell
        | Opcode::LoadCellRef => (0, 1),
        Opcode::DeleteLocal | Opcode::DeleteGlobal => (0, 0),
        Opcode::BuildList | Opcode::BuildTuple | Opcode::BuildSet | Opcode::BuildSlice => (n, 1),
        Opcode::BuildDict => (n.saturating_mul(2), 1),
        Opcode::ListAppend | Opcode::SetAdd => (1, 0),
        Opcode::MapAdd => (2, 0),
        Opcode::ListExtend | Opcode::DictUpdate => (1, 0),
        Opcode::Subscr => (2, 1),
        Opcode::StoreSubscr => (3, 0),
        Opcode::DeleteSubscr => (2, 0),
        Opcode::UnpackSequence => (1, n),
        Opcode::Binary | Opcode::Inplace | Opcode::Compare => (2, 1),
        Opcode::Unary => (1, 1),
        Opcode::Jump => (0, 0),
        Opcode::JumpIfTrue | Opcode::JumpIfFalse => (1, 0),
        // Conservatively keep the value for the depth estimate.
        Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => (0, 0),
        Opcode::GetIter => (1, 1),
        Opcode::ForIter => (0, 1),
        Opcode::MakeFunction => (0, 1),
        Opcode::Call => (n + 1, 1),
        Opcode::CallKw => {
            let pos = u16::try_from(arg & 0xFFFF).unwrap_or(u16::MAX);
            let kw = u16::try_from(arg >> 16).unwrap_or(u16::MAX);
            (pos + kw.saturating_mul(2) + 1, 1)
        }
        Opcode::CallEx => (2 + u16::from(arg & 1 == 1), 1),
        Opcode::LoadAttr => (1, 1),
        Opcode::StoreAttr => (2, 0),
        Opcode::DeleteAttr => (1, 0),
        Opcode::LoadMethod => (1, 2),
        Opcode::CallMethod => (n + 2, 1),
        Opcode::Return => (1, 0),
        Opcode::Yield | Opcode::YieldFrom => (1, 1),
        Opcode::Await => (1, 1),
        Opcode::Raise => (n, 0),
        Opcode::Reraise => (1, 0),
        Opcode::ClearExc => (0, 0),
        Opcode::CheckExcMatch => (1, 1),
        Opcode::ExceptStarMatch => (2, 2),
        Opcode::ReraiseStar => (1, 0),
        Opcode::BuildClass => (n + 2, 1),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::intern::Interns;

    #[test]
    fn forward_jumps_patch_to_bound_labels() {
        let mut interns = Interns::new();
        let src = interns.intern("test.py");
        let name = interns.intern("<module>");
        let mut b = CodeBuilder::new(src, name);
        let end = b.new_label();
        b.emit_jump(Opcode::Jump, end);
        b.emit(Opcode::Pop);
        b.bind(end);
        b.emit(Opcode::Return);
        let code = b.build().unwrap();
        assert_eq!(code.instr(0), Instr { op: Opcode::Jump, arg: 2 });
    }

    #[test]
    fn unbound_labels_fail_the_build() {
        let mut interns = Interns::new();
        let src = interns.intern("test.py");
        let mut b = CodeBuilder::new(src, src);
        let nowhere = b.new_label();
        b.emit_jump(Opcode::Jump, nowhere);
        assert_eq!(b.build().unwrap_err(), BuildError::UnboundLabel(0));
    }

    #[test]
    fn line_table_maps_instruction_ranges() {
        let mut interns = Interns::new();
        let src = interns.intern("test.py");
        let mut b = CodeBuilder::new(src, src);
        b.set_line(1);
        b.emit(Opcode::Dup);
        b.emit(Opcode::Pop);
        b.set_line(3);
        b.emit(Opcode::Return);
        let code = b.build().unwrap();
        assert_eq!(code.line_for(0), 1);
        assert_eq!(code.line_for(1), 1);
        assert_eq!(code.line_for(2), 3);
    }

    #[test]
    fn innermost_handler_wins() {
        let mut interns = Interns::new();
        let src = interns.intern("test.py");
        let mut b = CodeBuilder::new(src, src);
        for _ in 0..6 {
            b.emit(Opcode::Pop);
        }
        let inner = b.new_label();
        let outer = b.new_label();
        b.bind(inner);
        b.bind(outer);
        b.emit(Opcode::Return);
        b.add_handler(2, 4, inner, 0, HandlerKind::Except);
        b.add_handler(0, 6, outer, 0, HandlerKind::Finally);
        let code = b.build().unwrap();
        assert_eq!(code.find_handler(3).unwrap().kind, HandlerKind::Except);
        assert_eq!(code.find_handler(5).unwrap().kind, HandlerKind::Finally);
        assert!(code.find_handler(6).is_none());
    }

    #[test]
    fn source_lines_render_trimmed() {
        let mut interns = Interns::new();
        let src = interns.intern("test.py");
        let mut b = CodeBuilder::new(src, src);
        b.attach_source("x = 1\n    y = 2\n");
        b.emit(Opcode::Return);
        let code = b.build().unwrap();
        assert_eq!(code.source_line_text(2), Some("y = 2"));
        assert_eq!(code.source_line_text(9), None);
    }
}
