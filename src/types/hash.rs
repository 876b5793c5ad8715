//! Structural hashing: a name-independent hash over the type graph, used to
//! decide whether two types are interchangeable for address-based identity.
//!
//! The walk carries a visited set keyed on each type's dense arena index
//! (not its [`TypeId`], which can be negative and sparse) so cycles
//! terminate with a marker contribution instead of infinite recursion.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bit_set::BitSet;
use hashbrown::HashMap;

use crate::types::{ConstantValue, Type, TypeId, TypeKind};

/// Contributed in place of recursing back into a type already on the
/// current walk's path.
const CYCLE_MARKER: u64 = 0x6379_636c_6500_0000;
/// Contributed for a referent id that has not been observed yet (a
/// postponed edge). Once resolved the hash is recomputed and this
/// contribution disappears.
const UNRESOLVED_MARKER: u64 = 0x756e_7265_736f_6c76;

/// Computes the structural hash of the type at dense index `self_index`
/// within `types`, using `id_index` to resolve referent [`TypeId`]s to
/// dense indices. Both slices are only ever read here — the graph never
/// mutates type storage while a hash walk is in progress.
pub(crate) fn structural_hash(types: &[Type], id_index: &HashMap<TypeId, usize>, self_index: usize) -> u64 {
    let mut visited = BitSet::with_capacity(types.len());
    let mut hasher = DefaultHasher::new();
    walk(types, id_index, self_index, &mut visited, &mut hasher);
    hasher.finish()
}

fn walk(types: &[Type], id_index: &HashMap<TypeId, usize>, index: usize, visited: &mut BitSet, hasher: &mut DefaultHasher) {
    let ty = &types[index];
    std::mem::discriminant(&ty.kind).hash(hasher);
    ty.size.hash(hasher);
    visited.insert(index);

    let mut hash_referent = |hasher: &mut DefaultHasher, referent: TypeId, visited: &mut BitSet| {
        match id_index.get(&referent) {
            None => UNRESOLVED_MARKER.hash(hasher),
            Some(&idx) if visited.contains(idx) => CYCLE_MARKER.hash(hasher),
            Some(&idx) => walk(types, id_index, idx, visited, hasher),
        }
    };

    match &ty.kind {
        TypeKind::Int { bits, signed } => {
            bits.hash(hasher);
            signed.hash(hasher);
        }
        TypeKind::Bool { bits } => bits.hash(hasher),
        TypeKind::Float | TypeKind::Double | TypeKind::Void => {}
        TypeKind::Enum { underlying, variants } => {
            hash_referent(hasher, *underlying, visited);
            variants.len().hash(hasher);
            for (_, v) in variants {
                v.hash(hasher);
            }
        }
        TypeKind::Pointer { referent, extra_offset } => {
            extra_offset.hash(hasher);
            hash_referent(hasher, *referent, visited);
        }
        TypeKind::Array { referent, len } => {
            len.hash(hasher);
            hash_referent(hasher, *referent, visited);
        }
        TypeKind::Struct { members } | TypeKind::Union { members } => {
            members.len().hash(hasher);
            for m in members {
                m.offset.hash(hasher);
                m.bit_size.hash(hasher);
                m.bit_offset.hash(hasher);
                for c in &m.observed_constants {
                    match c {
                        ConstantValue::Int(i) => i.hash(hasher),
                        ConstantValue::Str(s) => s.hash(hasher),
                    }
                }
                hash_referent(hasher, m.referent, visited);
            }
        }
        TypeKind::Typedef { referent } | TypeKind::Const { referent } | TypeKind::Volatile { referent } => {
            hash_referent(hasher, *referent, visited);
        }
        TypeKind::FunctionPointer { return_ty, params } => {
            hash_referent(hasher, *return_ty, visited);
            params.len().hash(hasher);
            for p in params {
                hash_referent(hasher, *p, visited);
            }
        }
    }

    visited.remove(index);
}
