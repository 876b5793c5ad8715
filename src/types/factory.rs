//! Symbol-stream ingestion: turns a stream of debug records into a fully
//! resolved type graph, fabricating the synthetic `list_head`
//! specialisation along the way.

use tracing::{debug, warn};

use crate::error::{EngineError, TypeError};
use crate::symbol::{Interner, Symbol};
use crate::types::graph::TypeGraph;
use crate::types::{ConstantValue, Member, Type, TypeId, TypeKind};

/// One struct/union member as it appears in the symbol stream, before it is
/// bound into a [`Member`] with its non-owning `enclosing` back-edge filled
/// in.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub name: Option<String>,
    pub offset: u64,
    pub referent: TypeId,
    pub bit_size: Option<u32>,
    pub bit_offset: Option<u32>,
    pub observed_constants: Vec<ConstantValue>,
}

/// The aggregate-ness of a struct/union record; both carry identical
/// member shape and only differ in how the instance layer lays out their
/// members (every union member sits at offset 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Struct,
    Union,
}

/// The body of a debug record, one variant per [`TypeKind`] plus a
/// `Variable` record for globals. Referent ids are carried verbatim from
/// the stream even when the target hasn't been ingested yet — that's what
/// "may dangle" means; the id itself is always a fixed attribute.
#[derive(Debug, Clone)]
pub enum RecordBody {
    Int { bits: u8, signed: bool },
    Bool { bits: u8 },
    Float,
    Double,
    Enum { underlying: TypeId, variants: Vec<(String, i64)> },
    Pointer { referent: TypeId },
    Array { referent: TypeId, len: Option<u64> },
    Aggregate { kind: AggregateKind, members: Vec<MemberRecord> },
    Typedef { referent: TypeId },
    Const { referent: TypeId },
    Volatile { referent: TypeId },
    FunctionPointer { return_ty: TypeId, params: Vec<TypeId> },
    Void,
    Variable { referent: TypeId, address: u64 },
}

/// A single ingested debug record.
#[derive(Debug, Clone)]
pub struct DebugRecord {
    pub id: TypeId,
    pub name: Option<String>,
    pub size: u64,
    pub body: RecordBody,
    /// Source file this record's debug info was emitted from, if the
    /// symbol stream carries compile-unit attribution.
    pub compile_unit: Option<String>,
}

const LIST_HEAD_NAME: &str = "list_head";
const NEXT_NAME: &str = "next";
const PREV_NAME: &str = "prev";
const SIBLING_OVERRIDES: &[(&str, &str)] = &[("children", "sibling")];

fn direct_referents(kind: &TypeKind) -> Vec<TypeId> {
    match kind {
        TypeKind::Pointer { referent, .. }
        | TypeKind::Array { referent, .. }
        | TypeKind::Typedef { referent }
        | TypeKind::Const { referent }
        | TypeKind::Volatile { referent } => vec![*referent],
        TypeKind::Enum { underlying, .. } => vec![*underlying],
        TypeKind::Struct { members } | TypeKind::Union { members } => {
            members.iter().map(|m| m.referent).collect()
        }
        TypeKind::FunctionPointer { return_ty, params } => {
            let mut v = vec![*return_ty];
            v.extend(params.iter().copied());
            v
        }
        TypeKind::Int { .. } | TypeKind::Bool { .. } | TypeKind::Float | TypeKind::Double | TypeKind::Void => {
            Vec::new()
        }
    }
}

impl TypeGraph {
    /// Ingests one debug record, creating or updating a type or variable.
    /// Referencing records enqueue themselves onto the postponed index
    /// keyed by their unresolved target id; `add` also resolves any
    /// waiters blocked on the id this record installs.
    pub fn add(&mut self, record: DebugRecord, interner: &mut Interner) -> Result<(), EngineError> {
        let name_sym = record.name.as_deref().map(|n| interner.intern(n));
        let kind = match record.body {
            RecordBody::Variable { referent, address } => {
                let var_name = name_sym.ok_or_else(|| {
                    EngineError::Type(TypeError::MalformedSymbol("variable record missing name".into()))
                })?;
                let var = crate::types::Variable::new(var_name, address, referent);
                self.variables.insert(var_name, var);
                debug!(name = record.name.as_deref(), address, "ingested variable");
                return Ok(());
            }
            RecordBody::Int { bits, signed } => TypeKind::Int { bits, signed },
            RecordBody::Bool { bits } => TypeKind::Bool { bits },
            RecordBody::Float => TypeKind::Float,
            RecordBody::Double => TypeKind::Double,
            RecordBody::Void => TypeKind::Void,
            RecordBody::Enum { underlying, variants } => TypeKind::Enum {
                underlying,
                variants: variants.into_iter().map(|(n, v)| (interner.intern(&n), v)).collect(),
            },
            RecordBody::Pointer { referent } => TypeKind::Pointer { referent, extra_offset: 0 },
            RecordBody::Array { referent, len } => TypeKind::Array { referent, len },
            RecordBody::Typedef { referent } => TypeKind::Typedef { referent },
            RecordBody::Const { referent } => TypeKind::Const { referent },
            RecordBody::Volatile { referent } => TypeKind::Volatile { referent },
            RecordBody::FunctionPointer { return_ty, params } => TypeKind::FunctionPointer { return_ty, params },
            RecordBody::Aggregate { kind, members } => {
                let built = members
                    .into_iter()
                    .map(|m| Member {
                        name: m.name.as_deref().map(|n| interner.intern(n)),
                        offset: m.offset,
                        referent: m.referent,
                        bit_size: m.bit_size,
                        bit_offset: m.bit_offset,
                        observed_constants: m.observed_constants,
                        enclosing: record.id,
                    })
                    .collect();
                match kind {
                    AggregateKind::Struct => TypeKind::Struct { members: built },
                    AggregateKind::Union => TypeKind::Union { members: built },
                }
            }
        };
        let compile_unit = record.compile_unit.as_deref().map(|f| interner.intern(f));
        self.install(record.id, name_sym, record.size, kind, compile_unit, interner)
    }

    fn install(
        &mut self,
        id: TypeId,
        name: Option<Symbol>,
        size: u64,
        kind: TypeKind,
        compile_unit: Option<Symbol>,
        interner: &mut Interner,
    ) -> Result<(), EngineError> {
        let referents = direct_referents(&kind);
        if let Some(&existing) = self.id_index.get(&id) {
            self.types[existing] = Type { id, name, size, kind, hash: 0, compile_unit };
        } else {
            let idx = self.types.len();
            self.types.push(Type { id, name, size, kind, hash: 0, compile_unit });
            self.id_index.insert(id, idx);
        }
        if let Some(name) = name {
            self.insert_name_index(name, id);
        }
        self.recompute_hash(id);
        for referent in referents {
            if self.index_of(referent).is_none() {
                self.postponed.entry(referent).or_default().push(id);
            }
        }
        self.on_type_installed(id, interner);
        Ok(())
    }

    /// Runs the `list_head` specialisation check now that more of the
    /// graph's shape may be known, then binds every waiter blocked on
    /// `id` and recomputes their hashes.
    fn on_type_installed(&mut self, id: TypeId, interner: &mut Interner) {
        self.maybe_specialize_list_heads(id, interner);
        if let Some(waiters) = self.postponed.remove(&id) {
            for waiter in waiters {
                self.recompute_hash(waiter);
                self.maybe_specialize_list_heads(waiter, interner);
            }
        }
    }

    /// Finalises a symbol batch: anything still postponed is a warning,
    /// not a fatal error — the edge remains null (its referent id resolves
    /// to `None` via `find_by_id`) and traversal attempts surface
    /// `unresolved_type`.
    pub fn resolve(&mut self) {
        for (&target, waiters) in &self.postponed {
            warn!(target, waiters = waiters.len(), "referent id never observed after symbol batch");
        }
    }

    /// True for a struct whose shape is the generic two-pointer
    /// intrusive-list anchor: exactly two members named `next`/`prev`,
    /// both pointers, both the same size.
    fn is_generic_list_head(&self, id: TypeId, interner: &Interner) -> bool {
        let Some(ty) = self.find_by_id(id) else { return false };
        let TypeKind::Struct { members } = &ty.kind else { return false };
        if members.len() != 2 {
            return false;
        }
        let Some(next_sym) = interner.find(NEXT_NAME) else { return false };
        let Some(prev_sym) = interner.find(PREV_NAME) else { return false };
        let next = members.iter().find(|m| m.name == Some(next_sym));
        let prev = members.iter().find(|m| m.name == Some(prev_sym));
        let (Some(n), Some(p)) = (next, prev) else { return false };
        let n_ty = self.find_by_id(n.referent);
        let p_ty = self.find_by_id(p.referent);
        matches!(
            (n_ty.map(|t| &t.kind), p_ty.map(|t| &t.kind)),
            (Some(TypeKind::Pointer { .. }), Some(TypeKind::Pointer { .. }))
        ) && n_ty.map(|t| t.size) == p_ty.map(|t| t.size)
    }

    /// Scans `struct_id`'s members for any still pointing at a generic
    /// `list_head` and fabricates the specialised anchor described in the
    /// type graph design.
    fn maybe_specialize_list_heads(&mut self, struct_id: TypeId, interner: &mut Interner) {
        let Some(idx) = self.index_of(struct_id) else { return };
        let TypeKind::Struct { members } = &self.types[idx].kind else { return };
        let mut to_specialize = Vec::new();
        for (i, m) in members.iter().enumerate() {
            if self.is_generic_list_head(m.referent, interner) {
                to_specialize.push(i);
            }
        }
        for member_index in to_specialize {
            self.specialize_one(struct_id, member_index, interner);
        }
    }

    fn specialize_one(&mut self, struct_id: TypeId, member_index: usize, interner: &mut Interner) {
        let idx = self.index_of(struct_id).expect("checked by caller");
        let TypeKind::Struct { members } = &self.types[idx].kind else { return };
        let member = &members[member_index];
        let generic_id = member.referent;
        let member_name = member.name;
        let mut adjust_offset = member.offset;

        if_chain::if_chain! {
            if let Some(name_sym) = member_name;
            let name_str = interner.resolve(name_sym).to_string();
            if let Some(sibling_name) = Self::sibling_override(&name_str);
            if let Some(sibling_sym) = interner.find(sibling_name);
            if let Some(sibling) = members.iter().find(|m| m.name == Some(sibling_sym));
            then {
                adjust_offset = sibling.offset;
            }
        }

        let Some(generic_ty) = self.find_by_id(generic_id) else { return };
        let TypeKind::Struct { members: generic_members } = &generic_ty.kind else { return };
        let ptr_size = self.find_by_id(generic_members[0].referent).map_or(8, |t| t.size);

        let ptr_id = self.allocate_synthetic_id();
        let ptr_type = Type {
            id: ptr_id,
            name: None,
            size: ptr_size,
            kind: TypeKind::Pointer {
                referent: struct_id,
                extra_offset: -i64::try_from(adjust_offset).unwrap_or(0),
            },
            hash: 0,
            compile_unit: None,
        };
        let ptr_dense = self.types.len();
        self.types.push(ptr_type);
        self.id_index.insert(ptr_id, ptr_dense);
        self.recompute_hash(ptr_id);

        let list_head_id = self.allocate_synthetic_id();
        let list_head_name = interner.intern(LIST_HEAD_NAME);
        let next_sym = interner.intern(NEXT_NAME);
        let prev_sym = interner.intern(PREV_NAME);
        let synthetic_members = vec![
            Member {
                name: Some(next_sym),
                offset: 0,
                referent: ptr_id,
                bit_size: None,
                bit_offset: None,
                observed_constants: Vec::new(),
                enclosing: list_head_id,
            },
            Member {
                name: Some(prev_sym),
                offset: ptr_size,
                referent: ptr_id,
                bit_size: None,
                bit_offset: None,
                observed_constants: Vec::new(),
                enclosing: list_head_id,
            },
        ];
        let synthetic = Type {
            id: list_head_id,
            name: Some(list_head_name),
            size: ptr_size * 2,
            kind: TypeKind::Struct { members: synthetic_members },
            hash: 0,
            compile_unit: None,
        };
        let dense = self.types.len();
        self.types.push(synthetic);
        self.id_index.insert(list_head_id, dense);
        self.insert_name_index(list_head_name, list_head_id);
        self.recompute_hash(list_head_id);

        if let TypeKind::Struct { members } = &mut self.types[idx].kind {
            members[member_index].referent = list_head_id;
        }
        self.recompute_hash(struct_id);
    }

    pub(crate) fn sibling_override(name: &str) -> Option<&'static str> {
        SIBLING_OVERRIDES.iter().find(|(a, _)| *a == name).map(|(_, b)| *b)
    }
}
