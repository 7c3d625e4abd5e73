//! Operator dispatch: binary, in-place, unary, and comparison.
//!
//! Builtin operand pairs take a direct path; anything involving an instance
//! goes through the dunder chain with the guest language's ordering rules:
//! forward then reflected, except that a strict subclass on the right that
//! overrides the reflected method goes first. In-place operators try the
//! `__iop__` form before falling back to the full binary protocol.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use smallvec::smallvec;

use crate::{
    code::{BinOp, CmpOp, UnaryOp},
    exc::{ExcKind, RunError, RunResult},
    frame::{ChainFallback, PendingCall, ReturnCtx},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StaticStr},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{List, LongInt, Set, Str, Tuple, long_int},
    value::{Numeric, Value, bytes_content, str_content},
};

use super::Vm;

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Handles `Binary` and `Inplace` instructions.
    pub(crate) fn binary_op(&mut self, op: BinOp, inplace: bool) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        match self.binary_builtin(op, &lhs, &rhs) {
            Ok(Some(result)) => {
                lhs.drop_with_heap(self.heap);
                rhs.drop_with_heap(self.heap);
                self.push(result);
                Ok(())
            }
            Ok(None) => self.binary_dunder(op, inplace, lhs, rhs),
            Err(err) => {
                lhs.drop_with_heap(self.heap);
                rhs.drop_with_heap(self.heap);
                Err(err)
            }
        }
    }

    /// Builtin operand pairs; `None` routes to the dunder protocol.
    fn binary_builtin(&mut self, op: BinOp, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        // Numbers first: covers int/bool/float/long-int in any mix.
        if let (Some(a), Some(b)) = (Numeric::of(lhs, self.heap), Numeric::of(rhs, self.heap)) {
            let a = NumOperand::capture(&a);
            let b = NumOperand::capture(&b);
            return self.numeric_binary(op, a, b).map(Some);
        }

        match op {
            BinOp::Add => {
                let str_concat = match (
                    str_content(lhs, self.heap, self.interns),
                    str_content(rhs, self.heap, self.interns),
                ) {
                    (Some(a), Some(b)) => {
                        let projected = a.len() + b.len();
                        self.heap
                            .tracker()
                            .check_large_result(projected)
                            .map_err(RunError::from)?;
                        let mut out = String::with_capacity(projected);
                        out.push_str(a);
                        out.push_str(b);
                        Some(out)
                    }
                    _ => None,
                };
                if let Some(out) = str_concat {
                    let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                let bytes_concat = match (
                    bytes_content(lhs, self.heap, self.interns),
                    bytes_content(rhs, self.heap, self.interns),
                ) {
                    (Some(a), Some(b)) => {
                        let mut out = Vec::with_capacity(a.len() + b.len());
                        out.extend_from_slice(a);
                        out.extend_from_slice(b);
                        Some(out)
                    }
                    _ => None,
                };
                if let Some(out) = bytes_concat {
                    let id = self
                        .heap
                        .alloc(HeapData::Bytes(crate::types::Bytes::new(out)))
                        .map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                if let (Some(a), Some(b)) = (self.as_list(lhs), self.as_list(rhs)) {
                    let list_len = |id: HeapId| match self.heap.get(id) {
                        HeapData::List(list) => list.elements().len(),
                        _ => 0,
                    };
                    let mut elements = Vec::with_capacity(list_len(a) + list_len(b));
                    for source in [a, b] {
                        if let HeapData::List(list) = self.heap.get(source) {
                            elements.extend(list.elements().iter().map(Value::shallow_copy));
                        }
                    }
                    for element in &elements {
                        if let Value::Ref(id) = element {
                            self.heap.inc_ref(*id);
                        }
                    }
                    let id = self
                        .heap
                        .alloc(HeapData::List(List::new(elements)))
                        .map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                if let (Some(a), Some(b)) = (self.as_tuple(lhs), self.as_tuple(rhs)) {
                    let mut elements = Vec::new();
                    for source in [a, b] {
                        if let HeapData::Tuple(tuple) = self.heap.get(source) {
                            elements.extend(tuple.elements().iter().map(Value::shallow_copy));
                        }
                    }
                    for element in &elements {
                        if let Value::Ref(id) = element {
                            self.heap.inc_ref(*id);
                        }
                    }
                    let id = self
                        .heap
                        .alloc(HeapData::Tuple(Tuple::new(elements)))
                        .map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                Ok(None)
            }
            BinOp::Mul => {
                // Sequence repetition with a pre-checked projected size.
                let (seq, count) = if let Some(count) = crate::value::as_index(rhs, self.heap) {
                    (lhs, Some(count))
                } else if let Some(count) = crate::value::as_index(lhs, self.heap) {
                    (rhs, Some(count))
                } else {
                    (lhs, None)
                };
                let Some(count) = count else { return Ok(None) };
                let count = usize::try_from(count.max(0)).unwrap_or(0);
                let str_repeat = match str_content(seq, self.heap, self.interns) {
                    Some(text) => {
                        let projected = text.len().saturating_mul(count);
                        self.heap
                            .tracker()
                            .check_large_result(projected)
                            .map_err(RunError::from)?;
                        Some(text.repeat(count))
                    }
                    None => None,
                };
                if let Some(out) = str_repeat {
                    let id = self.heap.alloc(HeapData::Str(Str::new(out))).map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                let bytes_repeat = match bytes_content(seq, self.heap, self.interns) {
                    Some(data) => {
                        let projected = data.len().saturating_mul(count);
                        self.heap
                            .tracker()
                            .check_large_result(projected)
                            .map_err(RunError::from)?;
                        Some(data.repeat(count))
                    }
                    None => None,
                };
                if let Some(out) = bytes_repeat {
                    let id = self
                        .heap
                        .alloc(HeapData::Bytes(crate::types::Bytes::new(out)))
                        .map_err(RunError::from)?;
                    return Ok(Some(Value::Ref(id)));
                }
                if let Some(list_id) = self.as_list(seq) {
                    return self.repeat_elements(list_id, count, false).map(Some);
                }
                if let Some(tuple_id) = self.as_tuple(seq) {
                    return self.repeat_elements(tuple_id, count, true).map(Some);
                }
                Ok(None)
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Sub => {
                if let (Some(a), Some(b)) = (self.as_set(lhs), self.as_set(rhs)) {
                    return self.set_algebra(op, a, b).map(Some);
                }
                if op == BinOp::BitOr
                    && let (Some(a), Some(b)) = (self.as_dict(lhs), self.as_dict(rhs))
                {
                    return self.dict_merge(a, b).map(Some);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn as_list(&self, value: &Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::List(_)) => Some(*id),
            _ => None,
        }
    }

    fn as_tuple(&self, value: &Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Tuple(_)) => Some(*id),
            _ => None,
        }
    }

    fn as_set(&self, value: &Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Set(_) | HeapData::FrozenSet(_)) => Some(*id),
            _ => None,
        }
    }

    fn as_dict(&self, value: &Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Dict(_)) => Some(*id),
            _ => None,
        }
    }

    fn repeat_elements(&mut self, source: HeapId, count: usize, as_tuple: bool) -> RunResult<Value> {
        let len = match self.heap.get(source) {
            HeapData::List(l) => l.len(),
            HeapData::Tuple(t) => t.len(),
            _ => 0,
        };
        let projected = len.saturating_mul(count).saturating_mul(size_of::<Value>());
        self.heap
            .tracker()
            .check_large_result(projected)
            .map_err(RunError::from)?;
        let mut elements = Vec::with_capacity(len.saturating_mul(count));
        for _ in 0..count {
            let batch: Vec<Value> = match self.heap.get(source) {
                HeapData::List(l) => l.elements().iter().map(Value::shallow_copy).collect(),
                HeapData::Tuple(t) => t.elements().iter().map(Value::shallow_copy).collect(),
                _ => Vec::new(),
            };
            for element in &batch {
                if let Value::Ref(id) = element {
                    self.heap.inc_ref(*id);
                }
            }
            elements.extend(batch);
        }
        let data = if as_tuple {
            HeapData::Tuple(Tuple::new(elements))
        } else {
            HeapData::List(List::new(elements))
        };
        let id = self.heap.alloc(data).map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }

    fn set_algebra(&mut self, op: BinOp, a: HeapId, b: HeapId) -> RunResult<Value> {
        let a_members: Vec<(u64, Value)> = match self.heap.get(a) {
            HeapData::Set(s) | HeapData::FrozenSet(s) => {
                s.raw_iter().map(|(h, v)| (h, v.shallow_copy())).collect()
            }
            _ => Vec::new(),
        };
        let b_members: Vec<(u64, Value)> = match self.heap.get(b) {
            HeapData::Set(s) | HeapData::FrozenSet(s) => {
                s.raw_iter().map(|(h, v)| (h, v.shallow_copy())).collect()
            }
            _ => Vec::new(),
        };
        let b_contains = |heap: &Heap<T>, interns: &Interns, value: &Value, hash: u64| -> bool {
            match heap.get(b) {
                HeapData::Set(s) | HeapData::FrozenSet(s) => s.contains(value, hash, heap, interns),
                _ => false,
            }
        };
        let a_contains = |heap: &Heap<T>, interns: &Interns, value: &Value, hash: u64| -> bool {
            match heap.get(a) {
                HeapData::Set(s) | HeapData::FrozenSet(s) => s.contains(value, hash, heap, interns),
                _ => false,
            }
        };

        let mut result = Set::new();
        match op {
            BinOp::BitAnd => {
                for (hash, member) in a_members {
                    if b_contains(self.heap, self.interns, &member, hash) {
                        self.add_member(&mut result, member, hash);
                    }
                }
            }
            BinOp::BitOr => {
                for (hash, member) in a_members {
                    self.add_member(&mut result, member, hash);
                }
                for (hash, member) in b_members {
                    self.add_member(&mut result, member, hash);
                }
            }
            BinOp::BitXor => {
                for (hash, member) in a_members {
                    if !b_contains(self.heap, self.interns, &member, hash) {
                        self.add_member(&mut result, member, hash);
                    }
                }
                for (hash, member) in b_members {
                    if !a_contains(self.heap, self.interns, &member, hash) {
                        self.add_member(&mut result, member, hash);
                    }
                }
            }
            BinOp::Sub => {
                for (hash, member) in a_members {
                    if !b_contains(self.heap, self.interns, &member, hash) {
                        self.add_member(&mut result, member, hash);
                    }
                }
            }
            _ => unreachable!("set algebra limited to &, |, ^, -"),
        }
        let id = self.heap.alloc(HeapData::Set(result)).map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }

    fn add_member(&mut self, set: &mut Set, member: Value, hash: u64) {
        if let Value::Ref(id) = &member {
            self.heap.inc_ref(*id);
        }
        if let Some(dup) = set.add(member, hash, self.heap, self.interns) {
            dup.drop_with_heap(self.heap);
        }
    }

    fn dict_merge(&mut self, a: HeapId, b: HeapId) -> RunResult<Value> {
        let mut merged = crate::types::Dict::with_capacity(8);
        for source in [a, b] {
            let pairs: Vec<(u64, Value, Value)> = match self.heap.get(source) {
                HeapData::Dict(d) => d
                    .raw_iter()
                    .map(|(h, k, v)| (h, k.shallow_copy(), v.shallow_copy()))
                    .collect(),
                _ => Vec::new(),
            };
            for (hash, key, value) in pairs {
                if let Value::Ref(id) = &key {
                    self.heap.inc_ref(*id);
                }
                if let Value::Ref(id) = &value {
                    self.heap.inc_ref(*id);
                }
                if let Some(old) = merged.insert(key, hash, value, self.heap, self.interns) {
                    old.drop_with_heap(self.heap);
                }
            }
        }
        let id = self.heap.alloc(HeapData::Dict(merged)).map_err(RunError::from)?;
        Ok(Value::Ref(id))
    }

    // ------------------------------------------------------------------
    // Numeric tower
    // ------------------------------------------------------------------

    fn numeric_binary(&mut self, op: BinOp, a: NumOperand, b: NumOperand) -> RunResult<Value> {
        use NumOperand::{Big, Float, Int};

        // Floats contaminate: any float operand makes a float operation,
        // except for shifts and bitwise ops which require integers.
        let float_mode = matches!(a, Float(_)) || matches!(b, Float(_));
        if float_mode {
            let (x, y) = (a.to_f64(), b.to_f64());
            return match op {
                BinOp::Add => Ok(Value::Float(x + y)),
                BinOp::Sub => Ok(Value::Float(x - y)),
                BinOp::Mul => Ok(Value::Float(x * y)),
                BinOp::Div => {
                    if y == 0.0 {
                        Err(ExcKind::zero_division("float division by zero"))
                    } else {
                        Ok(Value::Float(x / y))
                    }
                }
                BinOp::FloorDiv => {
                    if y == 0.0 {
                        Err(ExcKind::zero_division("float floor division by zero"))
                    } else {
                        Ok(Value::Float((x / y).floor()))
                    }
                }
                BinOp::Mod => {
                    if y == 0.0 {
                        Err(ExcKind::zero_division("float modulo"))
                    } else {
                        let r = x % y;
                        let r = if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r };
                        Ok(Value::Float(r))
                    }
                }
                BinOp::Pow => Ok(Value::Float(x.powf(y))),
                BinOp::MatMul => Err(self.numeric_type_error(op, &a, &b)),
                BinOp::LShift | BinOp::RShift | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                    Err(self.numeric_type_error(op, &a, &b))
                }
            };
        }

        // Integer lane: i64 fast path with silent promotion.
        if let (Int(x), Int(y)) = (&a, &b) {
            let (x, y) = (*x, *y);
            match op {
                BinOp::Add => {
                    return match x.checked_add(y) {
                        Some(v) => Ok(Value::Int(v)),
                        None => LongInt::new(BigInt::from(x) + BigInt::from(y)).into_value(self.heap),
                    };
                }
                BinOp::Sub => {
                    return match x.checked_sub(y) {
                        Some(v) => Ok(Value::Int(v)),
                        None => LongInt::new(BigInt::from(x) - BigInt::from(y)).into_value(self.heap),
                    };
                }
                BinOp::Mul => {
                    return match x.checked_mul(y) {
                        Some(v) => Ok(Value::Int(v)),
                        None => LongInt::new(BigInt::from(x) * BigInt::from(y)).into_value(self.heap),
                    };
                }
                BinOp::Div => {
                    return if y == 0 {
                        Err(ExcKind::zero_division("division by zero"))
                    } else {
                        Ok(Value::Float(x as f64 / y as f64))
                    };
                }
                BinOp::FloorDiv => {
                    return if y == 0 {
                        Err(ExcKind::zero_division("integer division or modulo by zero"))
                    } else {
                        let q = x.wrapping_div(y);
                        let q = if x % y != 0 && (x < 0) != (y < 0) { q - 1 } else { q };
                        Ok(Value::Int(q))
                    };
                }
                BinOp::Mod => {
                    return if y == 0 {
                        Err(ExcKind::zero_division("integer division or modulo by zero"))
                    } else {
                        let r = x % y;
                        let r = if r != 0 && (r < 0) != (y < 0) { r + y } else { r };
                        Ok(Value::Int(r))
                    };
                }
                BinOp::BitAnd => return Ok(Value::Int(x & y)),
                BinOp::BitOr => return Ok(Value::Int(x | y)),
                BinOp::BitXor => return Ok(Value::Int(x ^ y)),
                BinOp::RShift => {
                    return if y < 0 {
                        Err(ExcKind::value_error("negative shift count"))
                    } else {
                        Ok(Value::Int(x >> y.min(63)))
                    };
                }
                _ => {}
            }
        }

        // Big lane: everything else integral.
        let (x, y) = (a.to_bigint(), b.to_bigint());
        match op {
            BinOp::Add => LongInt::new(x + y).into_value(self.heap),
            BinOp::Sub => LongInt::new(x - y).into_value(self.heap),
            BinOp::Mul => {
                self.heap
                    .tracker()
                    .check_large_result(long_int::mul_size_estimate(x.bits(), y.bits()))
                    .map_err(RunError::from)?;
                LongInt::new(x * y).into_value(self.heap)
            }
            BinOp::Div => {
                if y.is_zero() {
                    return Err(ExcKind::zero_division("division by zero"));
                }
                let (xf, yf) = (x.to_f64(), y.to_f64());
                match (xf, yf) {
                    (Some(xf), Some(yf)) => Ok(Value::Float(xf / yf)),
                    _ => Err(ExcKind::value_error("integer too large to convert to float")),
                }
            }
            BinOp::FloorDiv => {
                if y.is_zero() {
                    return Err(ExcKind::zero_division("integer division or modulo by zero"));
                }
                let q = num_integer::Integer::div_floor(&x, &y);
                LongInt::new(q).into_value(self.heap)
            }
            BinOp::Mod => {
                if y.is_zero() {
                    return Err(ExcKind::zero_division("integer division or modulo by zero"));
                }
                let r = num_integer::Integer::mod_floor(&x, &y);
                LongInt::new(r).into_value(self.heap)
            }
            BinOp::Pow => {
                let Some(exp) = y.to_i64() else {
                    return Err(ExcKind::value_error("exponent too large"));
                };
                if exp < 0 {
                    let Some(base) = x.to_f64() else {
                        return Err(ExcKind::value_error("integer too large to convert to float"));
                    };
                    if base == 0.0 {
                        return Err(ExcKind::zero_division("0.0 cannot be raised to a negative power"));
                    }
                    return Ok(Value::Float(base.powi(i32::try_from(exp).unwrap_or(i32::MIN))));
                }
                self.heap
                    .tracker()
                    .check_large_result(long_int::pow_size_estimate(x.bits().max(1), exp as u64))
                    .map_err(RunError::from)?;
                let result = x.pow(u32::try_from(exp).map_err(|_| ExcKind::value_error("exponent too large"))?);
                LongInt::new(result).into_value(self.heap)
            }
            BinOp::LShift => {
                let Some(shift) = y.to_i64() else {
                    return Err(ExcKind::value_error("shift count too large"));
                };
                if shift < 0 {
                    return Err(ExcKind::value_error("negative shift count"));
                }
                self.heap
                    .tracker()
                    .check_large_result(long_int::shl_size_estimate(x.bits(), shift as u64))
                    .map_err(RunError::from)?;
                LongInt::new(x << shift).into_value(self.heap)
            }
            BinOp::RShift => {
                let Some(shift) = y.to_i64() else {
                    return Err(ExcKind::value_error("shift count too large"));
                };
                if shift < 0 {
                    return Err(ExcKind::value_error("negative shift count"));
                }
                LongInt::new(x >> shift.min(u32::MAX.into())).into_value(self.heap)
            }
            BinOp::BitAnd => LongInt::new(x & y).into_value(self.heap),
            BinOp::BitOr => LongInt::new(x | y).into_value(self.heap),
            BinOp::BitXor => LongInt::new(x ^ y).into_value(self.heap),
            BinOp::MatMul => Err(self.numeric_type_error(op, &a, &b)),
        }
    }

    fn numeric_type_error(&self, op: BinOp, a: &NumOperand, b: &NumOperand) -> RunError {
        ExcKind::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))
    }

    // ------------------------------------------------------------------
    // Dunder dispatch
    // ------------------------------------------------------------------

    /// The class of an instance value, when it is one.
    pub(crate) fn instance_class(&self, value: &Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Instance(instance) => Some(instance.class_id),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether `sub` is a strict subclass of `base` (both heap classes).
    pub(crate) fn is_strict_subclass(&self, sub: HeapId, base: HeapId) -> bool {
        if sub == base {
            return false;
        }
        match self.heap.get(sub) {
            HeapData::Class(class) => class.mro.contains(&base),
            _ => false,
        }
    }

    /// Whether `sub`'s resolution of `name` actually overrides `base`'s.
    ///
    /// The reflected method only jumps the queue when the subclass
    /// redefines it; a merely inherited reflected slot resolves to the same
    /// function the base would use and keeps the forward-first order.
    fn overrides_dunder(&self, sub: HeapId, base: HeapId, name: &str) -> bool {
        let Some(sub_method) = self.lookup_on_class_mro(sub, name) else {
            return false;
        };
        match self.lookup_on_class_mro(base, name) {
            Some(base_method) => !values_identical(sub_method, base_method),
            None => true,
        }
    }

    /// Builds and launches the dunder chain for a binary/in-place operator.
    fn binary_dunder(&mut self, op: BinOp, inplace: bool, lhs: Value, rhs: Value) -> RunResult<()> {
        let lhs_class = self.instance_class(&lhs);
        let rhs_class = self.instance_class(&rhs);
        let left_type = lhs.type_name(self.heap, self.interns).into_owned();
        let right_type = rhs.type_name(self.heap, self.interns).into_owned();

        let mut chain: Vec<PendingCall> = Vec::new();
        let mut add_candidate = |vm: &mut Self, class: Option<HeapId>, name: StaticStr, recv: &Value, other: &Value| {
            if let Some(class_id) = class
                && let Some(method) = vm.lookup_on_class_mro(class_id, vm.interns.get_str(name.into()))
            {
                let callable = method.clone_with_heap(vm.heap);
                let args = smallvec![recv.clone_with_heap(vm.heap), other.clone_with_heap(vm.heap)];
                chain.push(PendingCall {
                    callable,
                    args,
                    negate: false,
                });
            }
        };

        if inplace {
            add_candidate(self, lhs_class, op.inplace_dunder(), &lhs, &rhs);
        }

        // The right operand's reflected method takes priority only when its
        // class is a strict subclass of the left's AND overrides the
        // reflected slot.
        let reflected_first = match (lhs_class, rhs_class) {
            (Some(l), Some(r)) => {
                self.is_strict_subclass(r, l)
                    && self.overrides_dunder(r, l, self.interns.get_str(op.reflected_dunder().into()))
            }
            _ => false,
        };
        let different_types = match (lhs_class, rhs_class) {
            (Some(l), Some(r)) => l != r,
            _ => true,
        };
        if reflected_first {
            add_candidate(self, rhs_class, op.reflected_dunder(), &rhs, &lhs);
            add_candidate(self, lhs_class, op.dunder(), &lhs, &rhs);
        } else {
            add_candidate(self, lhs_class, op.dunder(), &lhs, &rhs);
            if different_types {
                add_candidate(self, rhs_class, op.reflected_dunder(), &rhs, &lhs);
            }
        }

        lhs.drop_with_heap(self.heap);
        rhs.drop_with_heap(self.heap);

        let fallback = ChainFallback::BinaryTypeError {
            symbol: if inplace {
                format!("{}=", op.symbol())
            } else {
                op.symbol().to_owned()
            },
            left_type,
            right_type,
        };
        self.launch_chain(chain, fallback)
    }

    /// Launches the first chain candidate, or applies the fallback.
    pub(crate) fn launch_chain(&mut self, mut chain: Vec<PendingCall>, fallback: ChainFallback) -> RunResult<()> {
        if chain.is_empty() {
            return self.apply_chain_fallback(fallback);
        }
        let first = chain.remove(0);
        let negate = first.negate;
        self.push_call_frame(
            first.callable,
            first.args,
            ReturnCtx::DunderChain {
                rest: chain,
                fallback,
                negate,
            },
        )
    }

    fn apply_chain_fallback(&mut self, fallback: ChainFallback) -> RunResult<()> {
        match fallback {
            ChainFallback::BinaryTypeError {
                symbol,
                left_type,
                right_type,
            } => Err(ExcKind::type_error(format!(
                "unsupported operand type(s) for {symbol}: '{left_type}' and '{right_type}'"
            ))),
            ChainFallback::CompareTypeError {
                symbol,
                left_type,
                right_type,
            } => Err(ExcKind::type_error(format!(
                "'{symbol}' not supported between instances of '{left_type}' and '{right_type}'"
            ))),
            ChainFallback::IdentityEq { same, negate } => {
                self.push(Value::Bool(same != negate));
                Ok(())
            }
        }
    }

    /// A chain candidate returned: not-implemented tries the next one.
    pub(crate) fn dunder_chain_step(
        &mut self,
        rest: Vec<PendingCall>,
        fallback: ChainFallback,
        negate: bool,
        value: Value,
    ) -> RunResult<()> {
        if matches!(value, Value::NotImplemented) {
            return self.launch_chain(rest, fallback);
        }
        for pending in rest {
            pending.callable.drop_with_heap(self.heap);
            self.drop_values(pending.args);
        }
        if negate {
            let truth = value.truthy(self.heap, self.interns).unwrap_or(true);
            value.drop_with_heap(self.heap);
            self.push(Value::Bool(!truth));
        } else {
            self.push(value);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unary
    // ------------------------------------------------------------------

    pub(crate) fn unary_op(&mut self, op: UnaryOp) -> RunResult<()> {
        let value = self.pop();
        if op == UnaryOp::Not {
            return match value.truthy(self.heap, self.interns) {
                Some(truth) => {
                    value.drop_with_heap(self.heap);
                    self.push(Value::Bool(!truth));
                    Ok(())
                }
                None => self.instance_truthiness_negated(value),
            };
        }

        if let Some(numeric) = Numeric::of(&value, self.heap) {
            let operand = NumOperand::capture(&numeric);
            let result = match (op, operand) {
                (UnaryOp::Neg, NumOperand::Int(x)) => match x.checked_neg() {
                    Some(v) => Value::Int(v),
                    None => LongInt::new(-BigInt::from(x)).into_value(self.heap)?,
                },
                (UnaryOp::Neg, NumOperand::Float(x)) => Value::Float(-x),
                (UnaryOp::Neg, NumOperand::Big(x)) => LongInt::new(-x).into_value(self.heap)?,
                (UnaryOp::Pos, NumOperand::Int(x)) => Value::Int(x),
                (UnaryOp::Pos, NumOperand::Float(x)) => Value::Float(x),
                (UnaryOp::Pos, NumOperand::Big(x)) => LongInt::new(x).into_value(self.heap)?,
                (UnaryOp::Invert, NumOperand::Int(x)) => Value::Int(!x),
                (UnaryOp::Invert, NumOperand::Big(x)) => LongInt::new(!x).into_value(self.heap)?,
                (UnaryOp::Invert, NumOperand::Float(_)) => {
                    let err = ExcKind::type_error("bad operand type for unary ~: 'float'");
                    value.drop_with_heap(self.heap);
                    return Err(err);
                }
                (UnaryOp::Not, _) => unreachable!("handled above"),
            };
            value.drop_with_heap(self.heap);
            self.push(result);
            return Ok(());
        }

        // Instances dispatch to __neg__/__pos__/__invert__.
        if let Some(class_id) = self.instance_class(&value) {
            let name = match op {
                UnaryOp::Neg => StaticStr::Neg,
                UnaryOp::Pos => StaticStr::Pos,
                UnaryOp::Invert => StaticStr::Invert,
                UnaryOp::Not => unreachable!("handled above"),
            };
            if let Some(method) = self.lookup_on_class_mro(class_id, self.interns.get_str(name.into())) {
                let callable = method.clone_with_heap(self.heap);
                return self.push_call_frame(callable, smallvec![value], ReturnCtx::Push);
            }
        }

        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        };
        let type_name = value.type_name(self.heap, self.interns).into_owned();
        value.drop_with_heap(self.heap);
        Err(ExcKind::type_error(format!(
            "bad operand type for unary {symbol}: '{type_name}'"
        )))
    }

    /// `not instance` through `__bool__`/`__len__`.
    fn instance_truthiness_negated(&mut self, value: Value) -> RunResult<()> {
        let Some(class_id) = self.instance_class(&value) else {
            value.drop_with_heap(self.heap);
            self.push(Value::Bool(false));
            return Ok(());
        };
        if let Some(method) = self.lookup_on_class_mro(class_id, self.interns.get_str(StaticStr::Bool.into())) {
            let callable = method.clone_with_heap(self.heap);
            return self.push_call_frame(callable, smallvec![value], ReturnCtx::StrictBool { negate: true });
        }
        if let Some(method) = self.lookup_on_class_mro(class_id, self.interns.get_str(StaticStr::Len.into())) {
            let callable = method.clone_with_heap(self.heap);
            return self.push_call_frame(
                callable,
                smallvec![value],
                ReturnCtx::LenResult {
                    for_bool: true,
                    negate: true,
                },
            );
        }
        value.drop_with_heap(self.heap);
        self.push(Value::Bool(false));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Comparison
    // ------------------------------------------------------------------

    pub(crate) fn compare_op(&mut self, op: CmpOp) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();

        match op {
            CmpOp::Is | CmpOp::IsNot => {
                let same = values_identical(&lhs, &rhs);
                lhs.drop_with_heap(self.heap);
                rhs.drop_with_heap(self.heap);
                self.push(Value::Bool(same == (op == CmpOp::Is)));
                Ok(())
            }
            CmpOp::In | CmpOp::NotIn => self.membership_op(lhs, rhs, op == CmpOp::NotIn),
            _ => {
                match builtin_compare(op, &lhs, &rhs, self.heap, self.interns) {
                    Some(result) => {
                        lhs.drop_with_heap(self.heap);
                        rhs.drop_with_heap(self.heap);
                        self.push(Value::Bool(result));
                        Ok(())
                    }
                    None => self.compare_dunder(op, lhs, rhs),
                }
            }
        }
    }

    fn compare_dunder(&mut self, op: CmpOp, lhs: Value, rhs: Value) -> RunResult<()> {
        let lhs_class = self.instance_class(&lhs);
        let rhs_class = self.instance_class(&rhs);
        let left_type = lhs.type_name(self.heap, self.interns).into_owned();
        let right_type = rhs.type_name(self.heap, self.interns).into_owned();
        let same = values_identical(&lhs, &rhs);

        let mut chain: Vec<PendingCall> = Vec::new();
        // For a class that defines __eq__ but not __ne__, != falls back to
        // the complemented __eq__ result.
        let mut add_candidate =
            |vm: &mut Self, class: Option<HeapId>, cmp: CmpOp, recv: &Value, other: &Value| {
                let Some(class_id) = class else { return };
                let Some(dunder) = cmp.dunder() else { return };
                if let Some(method) = vm.lookup_on_class_mro(class_id, vm.interns.get_str(dunder.into())) {
                    let callable = method.clone_with_heap(vm.heap);
                    chain.push(PendingCall {
                        callable,
                        args: smallvec![recv.clone_with_heap(vm.heap), other.clone_with_heap(vm.heap)],
                        negate: false,
                    });
                } else if cmp == CmpOp::Ne
                    && let Some(method) = vm.lookup_on_class_mro(class_id, vm.interns.get_str(StaticStr::Eq.into()))
                {
                    let callable = method.clone_with_heap(vm.heap);
                    chain.push(PendingCall {
                        callable,
                        args: smallvec![recv.clone_with_heap(vm.heap), other.clone_with_heap(vm.heap)],
                        negate: true,
                    });
                }
            };

        let reflected_first = match (lhs_class, rhs_class) {
            (Some(l), Some(r)) => op.swapped().dunder().is_some_and(|reflected| {
                self.is_strict_subclass(r, l) && self.overrides_dunder(r, l, self.interns.get_str(reflected.into()))
            }),
            _ => false,
        };
        if reflected_first {
            add_candidate(self, rhs_class, op.swapped(), &rhs, &lhs);
            add_candidate(self, lhs_class, op, &lhs, &rhs);
        } else {
            add_candidate(self, lhs_class, op, &lhs, &rhs);
            add_candidate(self, rhs_class, op.swapped(), &rhs, &lhs);
        }

        lhs.drop_with_heap(self.heap);
        rhs.drop_with_heap(self.heap);

        let fallback = match op {
            CmpOp::Eq => ChainFallback::IdentityEq { same, negate: false },
            CmpOp::Ne => ChainFallback::IdentityEq { same, negate: true },
            _ => ChainFallback::CompareTypeError {
                symbol: op.symbol().to_owned(),
                left_type,
                right_type,
            },
        };
        self.launch_chain(chain, fallback)
    }

    /// `needle in container` with the full fallback chain.
    fn membership_op(&mut self, needle: Value, container: Value, negate: bool) -> RunResult<()> {
        // Substring search for string pairs.
        if let (Some(sub), Some(text)) = (
            str_content(&needle, self.heap, self.interns),
            str_content(&container, self.heap, self.interns),
        ) {
            let found = text.contains(sub);
            needle.drop_with_heap(self.heap);
            container.drop_with_heap(self.heap);
            self.push(Value::Bool(found != negate));
            return Ok(());
        }

        enum ContainerKind {
            Sequence,
            Hashed,
            Range(crate::types::Range),
            Instance,
            Iterator,
            Other,
        }
        let (id, kind) = match &container {
            Value::Ref(id) => {
                let kind = match self.heap.get(*id) {
                    HeapData::List(_) | HeapData::Tuple(_) => ContainerKind::Sequence,
                    HeapData::Dict(_) | HeapData::Set(_) | HeapData::FrozenSet(_) => ContainerKind::Hashed,
                    HeapData::Range(r) => ContainerKind::Range(*r),
                    HeapData::Instance(_) => ContainerKind::Instance,
                    HeapData::Generator(_) | HeapData::Iter(_) => ContainerKind::Iterator,
                    _ => ContainerKind::Other,
                };
                (*id, kind)
            }
            _ => return self.membership_type_error(needle, container),
        };

        match kind {
            ContainerKind::Sequence => {
                let elements: Vec<Value> = match self.heap.get(id) {
                    HeapData::List(l) => l.elements().iter().map(Value::shallow_copy).collect(),
                    HeapData::Tuple(t) => t.elements().iter().map(Value::shallow_copy).collect(),
                    _ => Vec::new(),
                };
                let found = elements
                    .iter()
                    .any(|element| deep_eq(element, &needle, self.heap, self.interns));
                needle.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                self.push(Value::Bool(found != negate));
                Ok(())
            }
            ContainerKind::Hashed => self.hashed_membership(needle, container, id, negate),
            ContainerKind::Range(r) => {
                let found = crate::value::as_index(&needle, self.heap).is_some_and(|v| r.contains(v));
                needle.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                self.push(Value::Bool(found != negate));
                Ok(())
            }
            ContainerKind::Instance => self.instance_membership(needle, container, id, negate),
            ContainerKind::Iterator => self.membership_advance(container, needle, negate),
            ContainerKind::Other => self.membership_type_error(needle, container),
        }
    }

    fn membership_type_error(&mut self, needle: Value, container: Value) -> RunResult<()> {
        let type_name = container.type_name(self.heap, self.interns).into_owned();
        needle.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        Err(ExcKind::type_error(format!(
            "argument of type '{type_name}' is not iterable"
        )))
    }

    /// Membership in dict/set keys, re-arranging a guest `__hash__` call
    /// through instruction re-execution when the needle needs one.
    fn hashed_membership(&mut self, needle: Value, container: Value, id: HeapId, negate: bool) -> RunResult<()> {
        match needle.hash_key(self.heap, self.interns) {
            crate::value::HashAttempt::Ready(hash) => {
                let found = match self.heap.get(id) {
                    HeapData::Dict(d) => d.get(&needle, hash, self.heap, self.interns).is_some(),
                    HeapData::Set(s) | HeapData::FrozenSet(s) => s.contains(&needle, hash, self.heap, self.interns),
                    _ => false,
                };
                needle.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                self.push(Value::Bool(found != negate));
                Ok(())
            }
            crate::value::HashAttempt::Unhashable(type_name) => {
                needle.drop_with_heap(self.heap);
                container.drop_with_heap(self.heap);
                Err(ExcKind::type_error(format!("unhashable type: '{type_name}'")))
            }
            crate::value::HashAttempt::NeedDunder(instance_id) => {
                // Restore the operands and re-execute once the hash is
                // cached on the instance.
                self.push(needle);
                self.push(container);
                self.rewind();
                self.call_instance_hash(instance_id, false)
            }
        }
    }

    /// Membership on an instance: `__contains__`, `__iter__`, then the
    /// sequence protocol.
    fn instance_membership(&mut self, needle: Value, container: Value, id: HeapId, negate: bool) -> RunResult<()> {
        if let Some(method) = self.class_dunder(id, StaticStr::Contains) {
            let args = smallvec![container, needle];
            return self.push_call_frame(method, args, ReturnCtx::CoerceBool { negate });
        }
        if let Some(method) = self.class_dunder(id, StaticStr::Iter) {
            return self.push_call_frame(method, smallvec![container], ReturnCtx::MembershipIter { needle, negate });
        }
        if self.class_dunder(id, StaticStr::GetItem).is_some() {
            let state = crate::types::IterState::SeqProto { obj: container, index: 0 };
            let iter = self.alloc_iter_view(state)?;
            return self.membership_advance(iter, needle, negate);
        }
        self.membership_type_error(needle, container)
    }
}

/// Captured numeric operand (clones big ints out of the heap).
enum NumOperand {
    Int(i64),
    Float(f64),
    Big(BigInt),
}

impl NumOperand {
    fn capture(n: &Numeric<'_>) -> Self {
        match n {
            Numeric::Int(x) => Self::Int(*x),
            Numeric::Float(x) => Self::Float(*x),
            Numeric::Big(x) => Self::Big((*x).clone()),
        }
    }

    fn to_f64(&self) -> f64 {
        match self {
            Self::Int(x) => *x as f64,
            Self::Float(x) => *x,
            Self::Big(x) => x.to_f64().unwrap_or(f64::INFINITY),
        }
    }

    fn to_bigint(&self) -> BigInt {
        match self {
            Self::Int(x) => BigInt::from(*x),
            Self::Big(x) => x.clone(),
            Self::Float(_) => unreachable!("float operands never reach the big lane"),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) | Self::Big(_) => "int",
            Self::Float(_) => "float",
        }
    }
}

/// Identity (`is`) semantics: slot identity for heap values, value identity
/// for immediates.
pub(crate) fn values_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Ref(x), Value::Ref(y)) => x == y,
        (Value::None, Value::None)
        | (Value::Ellipsis, Value::Ellipsis)
        | (Value::NotImplemented, Value::NotImplemented) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::InternStr(x), Value::InternStr(y)) => x == y,
        (Value::InternBytes(x), Value::InternBytes(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::ExtFunction(x), Value::ExtFunction(y)) => x == y,
        _ => false,
    }
}

/// Structural equality without guest code: numbers cross-type, strings,
/// bytes, sequences and mappings recursively; instances by identity.
pub(crate) fn deep_eq(a: &Value, b: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
    if values_identical(a, b) {
        return true;
    }
    if let (Some(x), Some(y)) = (Numeric::of(a, heap), Numeric::of(b, heap)) {
        return Numeric::eq(&x, &y);
    }
    if let (Some(x), Some(y)) = (str_content(a, heap, interns), str_content(b, heap, interns)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (bytes_content(a, heap, interns), bytes_content(b, heap, interns)) {
        return x == y;
    }
    if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
        match (heap.get(*x), heap.get(*y)) {
            (HeapData::List(la), HeapData::List(lb)) => {
                return la.len() == lb.len()
                    && la
                        .elements()
                        .iter()
                        .zip(lb.elements())
                        .all(|(ea, eb)| deep_eq(ea, eb, heap, interns));
            }
            (HeapData::Tuple(ta), HeapData::Tuple(tb)) => {
                return ta.len() == tb.len()
                    && ta
                        .elements()
                        .iter()
                        .zip(tb.elements())
                        .all(|(ea, eb)| deep_eq(ea, eb, heap, interns));
            }
            (HeapData::Dict(da), HeapData::Dict(db)) => {
                if da.len() != db.len() {
                    return false;
                }
                return da.raw_iter().all(|(hash, key, value)| {
                    db.get(key, hash, heap, interns)
                        .is_some_and(|other| deep_eq(value, other, heap, interns))
                });
            }
            (HeapData::Set(sa), HeapData::Set(sb))
            | (HeapData::FrozenSet(sa), HeapData::FrozenSet(sb))
            | (HeapData::Set(sa), HeapData::FrozenSet(sb))
            | (HeapData::FrozenSet(sa), HeapData::Set(sb)) => {
                return sa.len() == sb.len()
                    && sa.raw_iter().all(|(hash, member)| sb.contains(member, hash, heap, interns));
            }
            _ => {}
        }
    }
    false
}

/// Builtin rich comparison; `None` routes to the dunder protocol.
fn builtin_compare(
    op: CmpOp,
    lhs: &Value,
    rhs: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
) -> Option<bool> {
    // Instances always go through dunders.
    let is_instance = |v: &Value| {
        matches!(v, Value::Ref(id) if matches!(heap.get(*id), HeapData::Instance(_)))
    };
    if is_instance(lhs) || is_instance(rhs) {
        return None;
    }

    if let (Some(a), Some(b)) = (Numeric::of(lhs, heap), Numeric::of(rhs, heap)) {
        return Some(match op {
            CmpOp::Eq => Numeric::eq(&a, &b),
            CmpOp::Ne => !Numeric::eq(&a, &b),
            CmpOp::Lt => Numeric::cmp(&a, &b) == Some(Ordering::Less),
            CmpOp::Le => matches!(Numeric::cmp(&a, &b), Some(Ordering::Less | Ordering::Equal)),
            CmpOp::Gt => Numeric::cmp(&a, &b) == Some(Ordering::Greater),
            CmpOp::Ge => matches!(Numeric::cmp(&a, &b), Some(Ordering::Greater | Ordering::Equal)),
            _ => unreachable!("identity and membership handled earlier"),
        });
    }

    if let (Some(a), Some(b)) = (str_content(lhs, heap, interns), str_content(rhs, heap, interns)) {
        return Some(apply_ordering(op, a.cmp(b)));
    }
    if let (Some(a), Some(b)) = (bytes_content(lhs, heap, interns), bytes_content(rhs, heap, interns)) {
        return Some(apply_ordering(op, a.cmp(b)));
    }

    if let (Value::Ref(x), Value::Ref(y)) = (lhs, rhs) {
        match (heap.get(*x), heap.get(*y)) {
            (HeapData::List(_), HeapData::List(_)) | (HeapData::Tuple(_), HeapData::Tuple(_)) => {
                let ordering = deep_cmp(lhs, rhs, heap, interns)?;
                return Some(apply_ordering(op, ordering));
            }
            (HeapData::Set(sa), HeapData::Set(sb)) | (HeapData::FrozenSet(sa), HeapData::FrozenSet(sb)) => {
                let subset = sa.raw_iter().all(|(h, m)| sb.contains(m, h, heap, interns));
                let superset = sb.raw_iter().all(|(h, m)| sa.contains(m, h, heap, interns));
                return Some(match op {
                    CmpOp::Eq => subset && superset,
                    CmpOp::Ne => !(subset && superset),
                    CmpOp::Lt => subset && !superset,
                    CmpOp::Le => subset,
                    CmpOp::Gt => superset && !subset,
                    CmpOp::Ge => superset,
                    _ => unreachable!("identity and membership handled earlier"),
                });
            }
            (HeapData::Dict(_), HeapData::Dict(_)) if matches!(op, CmpOp::Eq | CmpOp::Ne) => {
                let equal = deep_eq(lhs, rhs, heap, interns);
                return Some((op == CmpOp::Eq) == equal);
            }
            _ => {}
        }
    }

    // Mixed builtin types: equality is decidable (false), ordering is not.
    match op {
        CmpOp::Eq => Some(deep_eq(lhs, rhs, heap, interns)),
        CmpOp::Ne => Some(!deep_eq(lhs, rhs, heap, interns)),
        _ => None,
    }
}

fn apply_ordering(op: CmpOp, ordering: Ordering) -> bool {
    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        _ => unreachable!("identity and membership handled earlier"),
    }
}

/// Lexicographic ordering over builtin sequences; `None` when elements are
/// not order-comparable without guest code.
fn deep_cmp(a: &Value, b: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (Numeric::of(a, heap), Numeric::of(b, heap)) {
        return Numeric::cmp(&x, &y);
    }
    if let (Some(x), Some(y)) = (str_content(a, heap, interns), str_content(b, heap, interns)) {
        return Some(x.cmp(y));
    }
    if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
        let (ea, eb) = match (heap.get(*x), heap.get(*y)) {
            (HeapData::List(la), HeapData::List(lb)) => (la.elements(), lb.elements()),
            (HeapData::Tuple(ta), HeapData::Tuple(tb)) => (ta.elements(), tb.elements()),
            _ => return None,
        };
        for (element_a, element_b) in ea.iter().zip(eb) {
            match deep_cmp(element_a, element_b, heap, interns)? {
                Ordering::Equal => {}
                other => return Some(other),
            }
        }
        return Some(ea.len().cmp(&eb.len()));
    }
    None
}

