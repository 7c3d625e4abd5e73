//! Function-shaped payloads: closures and bound methods.
//!
//! A plain function with no defaults and no captured cells stays immediate
//! (`Value::Function`); this module holds the heap-allocated shapes.

use serde::{Deserialize, Serialize};

use crate::{heap::HeapId, intern::FunctionId, value::Value};

/// A function object carrying defaults and/or captured cells.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Closure {
    pub func_id: FunctionId,
    /// Default values for trailing positional parameters, in declaration
    /// order. Owned references.
    pub defaults: Vec<Value>,
    /// Default values for trailing keyword-only parameters.
    pub kw_defaults: Vec<Value>,
    /// Captured cells for the function's free variables, in free-table
    /// order. Each id holds a strong reference.
    pub cells: Vec<HeapId>,
}

impl Closure {
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + (self.defaults.len() + self.kw_defaults.len()) * size_of::<Value>()
    }
}

/// A method bound to its receiver.
///
/// `callable` is the underlying function (immediate or closure); `receiver`
/// is inserted as the leading positional argument on call.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BoundMethod {
    pub callable: Value,
    pub receiver: Value,
}

impl BoundMethod {
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>()
    }
}
