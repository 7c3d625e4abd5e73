//! Interned program data: strings, bytes, big-integer literals, and the
//! function table.
//!
//! Everything here is produced while building a [`crate::code::Code`] artifact
//! and is immutable during execution. The dispatcher borrows the table
//! shared, which is what lets frames reference code by id instead of by
//! lifetime-bound pointers.
//!
//! A fixed set of names the engine itself needs (dunder method names,
//! `<module>`, and friends) is pre-interned at construction, so engine code
//! can refer to them through [`StaticStr`] without lookups.

use ahash::RandomState;
use indexmap::IndexSet;
use num_bigint::BigInt;

use crate::code::FunctionDef;

/// Id of an interned string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw value for instruction operands.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuilds an id from an instruction operand.
    #[inline]
    #[must_use]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Id of an interned bytes literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BytesId(u32);

/// Id of an interned big-integer literal (a literal exceeding `i64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LongIntId(u32);

/// Id of a compiled guest function in the function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FunctionId(u32);

impl FunctionId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw value for instruction operands.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuilds an id from an instruction operand.
    #[inline]
    #[must_use]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Id of a declared external (host-provided) function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ExtFunctionId(u32);

impl ExtFunctionId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

macro_rules! static_strings {
    ($( $variant:ident => $text:literal ),+ $(,)?) => {
        /// Names the engine needs at fixed, known intern slots.
        ///
        /// The discriminant doubles as the [`StringId`] index, so conversion
        /// is free. New variants append; reordering breaks serialized code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub(crate) enum StaticStr {
            $($variant),+
        }

        impl StaticStr {
            const TEXTS: &'static [&'static str] = &[$($text),+];
        }
    };
}

static_strings! {
    Module => "<module>",
    Lambda => "<lambda>",
    Init => "__init__",
    New => "__new__",
    Call => "__call__",
    Hash => "__hash__",
    Eq => "__eq__",
    Ne => "__ne__",
    Lt => "__lt__",
    Le => "__le__",
    Gt => "__gt__",
    Ge => "__ge__",
    Bool => "__bool__",
    Len => "__len__",
    Str => "__str__",
    Repr => "__repr__",
    Iter => "__iter__",
    Next => "__next__",
    GetItem => "__getitem__",
    SetItem => "__setitem__",
    DelItem => "__delitem__",
    Contains => "__contains__",
    GetAttrHook => "__getattr__",
    GetAttribute => "__getattribute__",
    SetAttrHook => "__setattr__",
    Get => "__get__",
    Set => "__set__",
    Delete => "__delete__",
    SetName => "__set_name__",
    InitSubclass => "__init_subclass__",
    ClassGetItem => "__class_getitem__",
    Enter => "__enter__",
    Exit => "__exit__",
    Add => "__add__",
    Radd => "__radd__",
    Iadd => "__iadd__",
    Sub => "__sub__",
    Rsub => "__rsub__",
    Isub => "__isub__",
    Mul => "__mul__",
    Rmul => "__rmul__",
    Imul => "__imul__",
    TrueDiv => "__truediv__",
    RtrueDiv => "__rtruediv__",
    ItrueDiv => "__itruediv__",
    FloorDiv => "__floordiv__",
    RfloorDiv => "__rfloordiv__",
    IfloorDiv => "__ifloordiv__",
    Mod => "__mod__",
    Rmod => "__rmod__",
    Imod => "__imod__",
    Pow => "__pow__",
    Rpow => "__rpow__",
    Ipow => "__ipow__",
    MatMul => "__matmul__",
    RmatMul => "__rmatmul__",
    ImatMul => "__imatmul__",
    LShift => "__lshift__",
    RlShift => "__rlshift__",
    IlShift => "__ilshift__",
    RShift => "__rshift__",
    RrShift => "__rrshift__",
    IrShift => "__irshift__",
    BitAnd => "__and__",
    RbitAnd => "__rand__",
    IbitAnd => "__iand__",
    BitOr => "__or__",
    RbitOr => "__ror__",
    IbitOr => "__ior__",
    BitXor => "__xor__",
    RbitXor => "__rxor__",
    IbitXor => "__ixor__",
    Neg => "__neg__",
    Pos => "__pos__",
    Invert => "__invert__",
    Name => "__name__",
    Dict => "__dict__",
    Class => "__class__",
    Mro => "__mro__",
    Bases => "__bases__",
    Slots => "__slots__",
    Await => "__await__",
}

impl From<StaticStr> for StringId {
    #[inline]
    fn from(s: StaticStr) -> Self {
        Self(s as u32)
    }
}

/// Interned data shared by every run of one compiled program.
///
/// Mutated only while the program is being assembled; execution borrows it
/// immutably. Serializes as part of a dumped `Runner`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct Interns {
    /// Intern ids are insertion positions, so lookups can use a fast
    /// non-cryptographic hasher without affecting determinism.
    strings: IndexSet<String, RandomState>,
    bytes: Vec<Vec<u8>>,
    long_ints: Vec<BigInt>,
    functions: Vec<FunctionDef>,
    ext_functions: Vec<String>,
}

impl Interns {
    /// Creates a table with the static names pre-interned.
    #[must_use]
    pub fn new() -> Self {
        let mut strings =
            IndexSet::with_capacity_and_hasher(StaticStr::TEXTS.len() + 32, RandomState::default());
        for text in StaticStr::TEXTS {
            strings.insert((*text).to_owned());
        }
        Self {
            strings,
            bytes: Vec::new(),
            long_ints: Vec::new(),
            functions: Vec::new(),
            ext_functions: Vec::new(),
        }
    }

    /// Interns a string, returning its stable id.
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(index) = self.strings.get_index_of(text) {
            return StringId(u32::try_from(index).expect("intern table exceeds u32"));
        }
        let (index, _) = self.strings.insert_full(text.to_owned());
        StringId(u32::try_from(index).expect("intern table exceeds u32"))
    }

    /// Returns the text for an interned string id.
    #[must_use]
    pub fn get_str(&self, id: StringId) -> &str {
        self.strings
            .get_index(id.index())
            .expect("StringId from a foreign intern table")
    }

    /// Looks up an already-interned string without inserting.
    #[must_use]
    pub fn lookup(&self, text: &str) -> Option<StringId> {
        self.strings
            .get_index_of(text)
            .map(|i| StringId(u32::try_from(i).expect("intern table exceeds u32")))
    }

    /// Interns a bytes literal.
    pub fn intern_bytes(&mut self, data: Vec<u8>) -> BytesId {
        let id = BytesId(u32::try_from(self.bytes.len()).expect("bytes table exceeds u32"));
        self.bytes.push(data);
        id
    }

    /// Returns the content of an interned bytes literal.
    #[must_use]
    pub fn get_bytes(&self, id: BytesId) -> &[u8] {
        &self.bytes[id.0 as usize]
    }

    /// Interns a big-integer literal.
    pub fn intern_long_int(&mut self, value: BigInt) -> LongIntId {
        let id = LongIntId(u32::try_from(self.long_ints.len()).expect("long-int table exceeds u32"));
        self.long_ints.push(value);
        id
    }

    /// Returns an interned big-integer literal.
    #[must_use]
    pub fn get_long_int(&self, id: LongIntId) -> &BigInt {
        &self.long_ints[id.0 as usize]
    }

    /// Registers a compiled function, returning its table id.
    pub fn add_function(&mut self, def: FunctionDef) -> FunctionId {
        let id = FunctionId(u32::try_from(self.functions.len()).expect("function table exceeds u32"));
        self.functions.push(def);
        id
    }

    /// Returns a compiled function definition.
    #[must_use]
    pub fn get_function(&self, id: FunctionId) -> &FunctionDef {
        &self.functions[id.index()]
    }

    /// Declares an external host function name.
    pub fn add_ext_function(&mut self, name: String) -> ExtFunctionId {
        let id = ExtFunctionId(u32::try_from(self.ext_functions.len()).expect("extern table exceeds u32"));
        self.ext_functions.push(name);
        id
    }

    /// Returns the declared name of an external function.
    #[must_use]
    pub fn get_ext_name(&self, id: ExtFunctionId) -> &str {
        &self.ext_functions[id.index()]
    }

    /// Resolves a declared external function by name.
    #[must_use]
    pub fn lookup_ext(&self, name: &str) -> Option<ExtFunctionId> {
        self.ext_functions
            .iter()
            .position(|n| n == name)
            .map(|i| ExtFunctionId(u32::try_from(i).expect("extern table exceeds u32")))
    }

    /// Number of dynamically interned strings (excluding the static set).
    #[must_use]
    pub fn dynamic_string_count(&self) -> usize {
        self.strings.len() - StaticStr::TEXTS.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_names_occupy_their_discriminant_slots() {
        let interns = Interns::new();
        assert_eq!(interns.get_str(StaticStr::Module.into()), "<module>");
        assert_eq!(interns.get_str(StaticStr::Init.into()), "__init__");
        assert_eq!(interns.get_str(StaticStr::Radd.into()), "__radd__");
        assert_eq!(interns.get_str(StaticStr::Await.into()), "__await__");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("spam");
        let b = interns.intern("spam");
        assert_eq!(a, b);
        assert_eq!(interns.get_str(a), "spam");
        assert_eq!(interns.dynamic_string_count(), 1);
    }

    #[test]
    fn static_names_are_already_interned() {
        let mut interns = Interns::new();
        let id = interns.intern("__add__");
        assert_eq!(id, StringId::from(StaticStr::Add));
        assert_eq!(interns.dynamic_string_count(), 0);
    }
}
