//! Guest classes and instances.
//!
//! A class object owns its namespace (methods and class attributes), its
//! direct bases, and its full MRO computed by C3 linearization at class
//! creation. Instances hold a reference to their class plus an ordered
//! attribute map.
//!
//! # Hash policy
//!
//! A class is hashable by identity unless equality is redefined: defining
//! `__eq__` without `__hash__` makes the class (and its subclasses)
//! unhashable, and an explicit `__hash__ = None` does the same. The policy is
//! resolved once at class creation by scanning the MRO.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{exc::ExcKind, heap::HeapId, intern::StringId, value::Value};

/// How instances of a class hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum HashPolicy {
    /// Identity hashing inherited from `object`.
    Identity,
    /// A guest `__hash__` somewhere on the MRO.
    Defined,
    /// `__hash__` is `None` (explicitly, or implied by `__eq__` without
    /// `__hash__`): hashing raises the type kind.
    Unhashable,
}

/// A guest class object.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClassObject {
    pub name_id: StringId,
    /// Unique id assigned at creation; survives heap-slot reuse, so weak
    /// observers can detect staleness.
    pub uid: u64,
    /// Class attributes and methods, in definition order. Owned references.
    namespace: IndexMap<String, Value>,
    /// Direct bases, each holding a strong reference.
    pub bases: Vec<HeapId>,
    /// Linearized ancestors (this class itself excluded; the implicit
    /// `object` root is not stored). Entries hold strong references.
    pub mro: Vec<HeapId>,
    pub hash_policy: HashPolicy,
    /// The builtin exception kind this class derives from, when it is an
    /// exception class.
    pub exc_kind: Option<ExcKind>,
    /// Declared `__slots__` names; instances then reject other attributes.
    pub slots: Option<Vec<String>>,
}

impl ClassObject {
    /// Looks up a name in this class's own namespace only.
    #[must_use]
    pub fn get_local(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    /// Inserts a class attribute, returning any previous value for the
    /// caller to drop.
    pub fn set_local(&mut self, name: String, value: Value) -> Option<Value> {
        self.namespace.insert(name, value)
    }

    /// Removes a class attribute, returning it for the caller to drop.
    pub fn remove_local(&mut self, name: &str) -> Option<Value> {
        self.namespace.shift_remove(name)
    }

    /// Iterates the namespace in definition order.
    pub fn namespace_iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.namespace.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Builds a class with an empty namespace; the VM fills it from the
    /// class-body frame.
    #[must_use]
    pub fn new(name_id: StringId, uid: u64, bases: Vec<HeapId>, mro: Vec<HeapId>) -> Self {
        Self {
            name_id,
            uid,
            namespace: IndexMap::new(),
            bases,
            mro,
            hash_policy: HashPolicy::Identity,
            exc_kind: None,
            slots: None,
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.namespace.len() * (size_of::<Value>() + 24)
    }
}

/// A guest instance.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Instance {
    /// The instance's class; holds a strong reference.
    pub class_id: HeapId,
    /// Instance attributes in assignment order. Owned references.
    attrs: IndexMap<String, Value>,
    /// Guest-computed hash, cached after the first `__hash__` call so dict
    /// operations can re-execute without re-entering guest code.
    pub cached_hash: Option<i64>,
}

impl Instance {
    #[must_use]
    pub fn new(class_id: HeapId) -> Self {
        Self {
            class_id,
            attrs: IndexMap::new(),
            cached_hash: None,
        }
    }

    #[must_use]
    pub fn get_attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Sets an attribute, returning any previous value for the caller to drop.
    pub fn set_attr(&mut self, name: String, value: Value) -> Option<Value> {
        self.attrs.insert(name, value)
    }

    /// Removes an attribute, returning it for the caller to drop.
    pub fn remove_attr(&mut self, name: &str) -> Option<Value> {
        self.attrs.shift_remove(name)
    }

    pub fn attrs_iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        size_of::<Self>() + self.attrs.len() * (size_of::<Value>() + 24)
    }
}

/// C3 linearization over opaque class ids.
///
/// `bases` are the direct bases in declaration order and `base_mros` their
/// already-computed MROs (the implicit `object` root excluded everywhere).
/// Returns the merged order *excluding* the new class itself, or `None` when
/// no consistent order exists.
pub(crate) fn compute_c3_mro<T: Copy + Eq>(bases: &[T], base_mros: &[Vec<T>]) -> Option<Vec<T>> {
    debug_assert_eq!(bases.len(), base_mros.len());

    let mut sequences: Vec<Vec<T>> = base_mros.to_vec();
    sequences.push(bases.to_vec());

    let mut result = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Some(result);
        }

        // A head is a good candidate when it appears in no other sequence's
        // tail. Taking the first good head preserves local precedence order.
        let mut candidate = None;
        'heads: for seq in &sequences {
            let head = seq[0];
            for other in &sequences {
                if other[1..].contains(&head) {
                    continue 'heads;
                }
            }
            candidate = Some(head);
            break;
        }

        let head = candidate?;
        result.push(head);
        for seq in &mut sequences {
            seq.retain(|&c| c != head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_inheritance_is_linear() {
        // C(B), B(A): mro(C) = [B, A]
        let mro = compute_c3_mro(&[1u32], &[vec![1, 0]]).unwrap();
        assert_eq!(mro, vec![1, 0]);
    }

    #[test]
    fn diamond_resolves_depth_first_left_to_right() {
        // A=0; B(A)=1; C(A)=2; D(B, C)=3 -> mro(D) = [B, C, A]
        let mro = compute_c3_mro(&[1u32, 2], &[vec![1, 0], vec![2, 0]]).unwrap();
        assert_eq!(mro, vec![1, 2, 0]);
    }

    #[test]
    fn inconsistent_hierarchy_is_rejected() {
        // class X(A, B) and class Y(B, A); class Z(X, Y) has no C3 order.
        let x_mro = vec![10u32, 0, 1];
        let y_mro = vec![11u32, 1, 0];
        assert!(compute_c3_mro(&[10, 11], &[x_mro, y_mro]).is_none());
    }

    #[test]
    fn empty_bases_yield_empty_tail() {
        assert_eq!(compute_c3_mro::<u32>(&[], &[]).unwrap(), Vec::<u32>::new());
    }
}
