//! Storage and lookup surface for the type graph. Ingestion logic
//! (`add`/`resolve` and the synthetic `list_head` specialisation) lives in
//! `factory.rs`, which extends this same `impl TypeGraph` block.

use hashbrown::HashMap;

use crate::symbol::Symbol;
use crate::types::expr::{EvalFlags, ExprArena, ExprId, KnownVariables};
use crate::types::hash::structural_hash;
use crate::types::variable::Variable;
use crate::types::{Type, TypeId};

/// The canonical, name-independent representation of the kernel's type
/// universe, plus its global variables and their expression trees.
///
/// Types are stored by value in an append-only `Vec`; every cross
/// reference — a pointer's referent, a struct member's referent, a
/// variable's referent — is a [`TypeId`], resolved through `id_index` on
/// demand. This is the "store edges as identifiers/indices" design,
/// applied uniformly so the graph's cycles never require unsafe code or
/// reference counting.
#[derive(Default)]
pub struct TypeGraph {
    pub(crate) types: Vec<Type>,
    pub(crate) id_index: HashMap<TypeId, usize>,
    name_index: HashMap<Symbol, Vec<TypeId>>,
    hash_index: HashMap<u64, Vec<TypeId>>,
    pub(crate) variables: HashMap<Symbol, Variable>,
    pub(crate) exprs: ExprArena,
    /// Records referencing types awaiting a target id that has not been
    /// observed yet, keyed on that target id. Empty iff every non-null
    /// referent id that was ever added has since been observed (the
    /// resolution-completeness property).
    pub(crate) postponed: HashMap<TypeId, Vec<TypeId>>,
    pub(crate) next_synthetic_id: TypeId,
}

impl TypeGraph {
    #[must_use]
    pub fn new() -> Self {
        Self { next_synthetic_id: super::SYNTHETIC_ID_START, ..Self::default() }
    }

    #[must_use]
    pub fn find_by_id(&self, id: TypeId) -> Option<&Type> {
        self.id_index.get(&id).map(|&idx| &self.types[idx])
    }

    /// Returns every type installed under `name` (distinct types can share
    /// a source name across compile units in principle; callers that want
    /// "the" type for a name take the first hit, which is the
    /// first-installed one).
    #[must_use]
    pub fn find_by_name(&self, name: Symbol) -> &[TypeId] {
        self.name_index.get(&name).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn find_by_hash(&self, hash: u64) -> &[TypeId] {
        self.hash_index.get(&hash).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn variable(&self, name: Symbol) -> Option<&Variable> {
        self.variables.get(&name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    #[must_use]
    pub fn exprs(&self) -> &ExprArena {
        &self.exprs
    }

    /// Static evaluability flags for an expression installed in this
    /// graph's own arena, classifying a `VariableRef` to a variable this
    /// graph never installed as `UNDEFINED` (spec §3's "runtime-unknown
    /// variable" case) via this graph's variable table.
    #[must_use]
    pub fn expr_flags(&self, id: ExprId) -> EvalFlags {
        self.exprs.flags(id, self)
    }

    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Approximate heap footprint of the installed type table, in bytes.
    /// Only compiled in with the `memory` feature, for the same reason the
    /// upstream tool kept its own memory accounting behind a build flag:
    /// walking every type's `Vec<Member>` on a hot path is wasteful when
    /// nobody is asking.
    #[cfg(feature = "memory")]
    #[must_use]
    pub fn deep_size(&self) -> usize {
        use deepsize::DeepSizeOf;
        self.types.iter().map(DeepSizeOf::deep_size_of).sum()
    }

    /// Every installed type, in installation order. Used by the rule
    /// engine's check pass to build the `rules_per_type` index when a
    /// rule's filter carries neither a literal type name nor a type id.
    pub fn types(&self) -> impl Iterator<Item = &Type> {
        self.types.iter()
    }

    /// True iff every referent id that was ever added to the graph has
    /// since been observed — the resolution-completeness property.
    #[must_use]
    pub fn is_fully_resolved(&self) -> bool {
        self.postponed.is_empty()
    }

    pub(crate) fn index_of(&self, id: TypeId) -> Option<usize> {
        self.id_index.get(&id).copied()
    }

    /// Recomputes and re-files a type's structural hash under its dense
    /// arena index, moving it to the correct `hash_index` bucket.
    pub(crate) fn recompute_hash(&mut self, id: TypeId) {
        let Some(&idx) = self.id_index.get(&id) else { return };
        let old_hash = self.types[idx].hash;
        let new_hash = structural_hash(&self.types, &self.id_index, idx);
        if let Some(bucket) = self.hash_index.get_mut(&old_hash) {
            bucket.retain(|&x| x != id);
        }
        self.types[idx].hash = new_hash;
        self.hash_index.entry(new_hash).or_default().push(id);
    }

    pub(crate) fn insert_name_index(&mut self, name: Symbol, id: TypeId) {
        self.name_index.entry(name).or_default().push(id);
    }

    pub(crate) fn allocate_synthetic_id(&mut self) -> TypeId {
        let id = self.next_synthetic_id;
        self.next_synthetic_id -= 1;
        id
    }
}

impl KnownVariables for TypeGraph {
    fn is_known_variable(&self, var: Symbol) -> bool {
        self.variables.contains_key(&var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    fn leaf(id: TypeId, kind: TypeKind, size: u64) -> Type {
        Type { id, name: None, size, kind, hash: 0, compile_unit: None }
    }

    #[test]
    fn id_injectivity_across_positive_and_negative_ids() {
        let mut g = TypeGraph::new();
        let a = leaf(1, TypeKind::Void, 0);
        let b = leaf(-1, TypeKind::Void, 0);
        g.id_index.insert(1, 0);
        g.types.push(a);
        g.id_index.insert(-1, 1);
        g.types.push(b);
        assert_ne!(g.find_by_id(1).unwrap().id, g.find_by_id(-1).unwrap().id);
    }

    #[test]
    fn expr_flags_marks_reference_to_unknown_variable_undefined() {
        use crate::symbol::Interner;
        use crate::types::expr::{Expr, Transform};

        let mut g = TypeGraph::new();
        let mut interner = Interner::new();
        let known_name = interner.intern("init_task");
        let unknown_name = interner.intern("never_installed");
        g.variables.insert(known_name, Variable::new(known_name, 0, 1));

        let known_ref = g.exprs.alloc(Expr::VariableRef { var: known_name, transforms: Default::default() });
        let unknown_ref = g.exprs.alloc(Expr::VariableRef { var: unknown_name, transforms: Default::default() });

        assert!(!g.expr_flags(known_ref).contains(EvalFlags::UNDEFINED));
        assert!(g.expr_flags(unknown_ref).contains(EvalFlags::UNDEFINED));

        // A transform list doesn't shield an otherwise-unknown variable.
        let wrapped = g.exprs.alloc(Expr::VariableRef {
            var: unknown_name,
            transforms: smallvec::smallvec![Transform::Dereference],
        });
        assert!(g.expr_flags(wrapped).contains(EvalFlags::UNDEFINED));
    }

    #[test]
    fn recompute_hash_refiles_bucket() {
        let mut g = TypeGraph::new();
        g.types.push(leaf(1, TypeKind::Int { bits: 32, signed: true }, 4));
        g.id_index.insert(1, 0);
        g.recompute_hash(1);
        let h = g.types[0].hash;
        assert_eq!(g.find_by_hash(h), &[1]);
    }
}
