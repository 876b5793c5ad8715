//! The instance layer: typed, address-bound views over the dump.
//!
//! An instance is a lightweight copy — {address, type, name path, optional
//! bit-field slice, origin tag} — never an owner of the dump or the type
//! graph. All operations here are pure reads against a borrowed
//! [`AddressSpace`] and [`TypeGraph`].

use arrayvec::ArrayVec;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::{EngineError, TypeError};
use crate::symbol::Symbol;
use crate::types::{Member, TypeGraph, TypeId, TypeKind};
use crate::vmem::AddressSpace;

/// How an instance came to exist. Carried for diagnostics and for the map
/// builder's dedup/scoring logic, which treats list-head and rule-rewritten
/// instances specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    Member,
    ArrayElem,
    Dereference,
    RuleEngine,
}

bitflags! {
    /// Controls what `dereference` is willing to step through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DerefMode: u8 {
        /// Typedef/const/volatile wrappers are transparent and unwrapped
        /// without consuming a step of `depth`.
        const LEXICAL = 0b01;
        /// Pointer referents are followed (reading the pointer's value and
        /// rebinding the instance at the target address).
        const POINTER = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub offset: u32,
    pub size: u32,
}

/// A value view into the dump at a fixed address under a fixed type.
#[derive(Debug, Clone)]
pub struct Instance {
    pub address: u64,
    pub type_id: TypeId,
    pub name_path: SmallVec<[Symbol; 4]>,
    pub bit_field: Option<BitField>,
    pub origin: Origin,
}

impl Instance {
    #[must_use]
    pub fn root(address: u64, type_id: TypeId, name: Symbol) -> Self {
        let mut name_path = SmallVec::new();
        name_path.push(name);
        Self { address, type_id, name_path, bit_field: None, origin: Origin::Manual }
    }

    fn with(&self, address: u64, type_id: TypeId, origin: Origin, extra_name: Option<Symbol>) -> Self {
        let mut name_path = self.name_path.clone();
        if let Some(n) = extra_name {
            name_path.push(n);
        }
        Self { address, type_id, name_path, bit_field: None, origin }
    }

    #[must_use]
    pub fn size(&self, graph: &TypeGraph) -> u64 {
        graph.find_by_id(self.type_id).map_or(0, |t| t.size)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    #[must_use]
    pub fn is_accessible(&self, graph: &TypeGraph, space: &dyn AddressSpace) -> bool {
        let size = self.size(graph);
        size > 0 && space.safe_seek(self.address) && space.safe_seek(self.address + size - 1)
    }

    fn resolved_kind<'g>(&self, graph: &'g TypeGraph) -> Result<&'g TypeKind, EngineError> {
        graph
            .find_by_id(self.type_id)
            .map(|t| &t.kind)
            .ok_or(EngineError::Type(TypeError::UnresolvedType(self.type_id)))
    }

    /// Looks up a member by name, returning an instance bound to the
    /// member's referent type at `self.address + member.offset`. Bit-field
    /// width/offset propagate onto the returned instance.
    pub fn member(&self, graph: &TypeGraph, name: Symbol) -> Result<Self, EngineError> {
        let members = self.members(graph)?;
        let member = members
            .iter()
            .find(|m| m.name == Some(name))
            .ok_or_else(|| EngineError::Type(TypeError::NoSuchMember(format!("{name:?}"))))?;
        Ok(self.bind_member(member, name))
    }

    /// Looks up a member by its ordinal position in the struct/union.
    pub fn member_at(&self, graph: &TypeGraph, index: usize) -> Result<Self, EngineError> {
        let members = self.members(graph)?;
        let member = members.get(index).ok_or(EngineError::Type(TypeError::MemberIndexOutOfRange(index)))?;
        let name = member.name.unwrap_or_default();
        Ok(self.bind_member(member, name))
    }

    fn members<'g>(&self, graph: &'g TypeGraph) -> Result<&'g [Member], EngineError> {
        match self.resolved_kind(graph)? {
            TypeKind::Struct { members } | TypeKind::Union { members } => Ok(members),
            other => Err(EngineError::Type(TypeError::NotAMember(other.kind_name()))),
        }
    }

    fn bind_member(&self, member: &Member, name: Symbol) -> Self {
        let mut instance = self.with(self.address + member.offset, member.referent, Origin::Member, Some(name));
        if member.bit_size.is_some() || member.bit_offset.is_some() {
            instance.bit_field =
                Some(BitField { offset: member.bit_offset.unwrap_or(0), size: member.bit_size.unwrap_or(0) });
        }
        instance
    }

    /// Follows `depth` pointer/lexical layers per `mode`. Typedef/const/
    /// volatile wrappers unwrap for free when `LEXICAL` is set; a pointer
    /// consumes one unit of `depth` and requires `POINTER`.
    pub fn dereference(
        &self,
        graph: &TypeGraph,
        space: &dyn AddressSpace,
        mode: DerefMode,
        mut depth: u32,
    ) -> Result<Self, EngineError> {
        let mut current = self.clone();
        loop {
            let kind = current.resolved_kind(graph)?;
            match kind {
                TypeKind::Typedef { referent } | TypeKind::Const { referent } | TypeKind::Volatile { referent }
                    if mode.contains(DerefMode::LEXICAL) =>
                {
                    let referent = *referent;
                    current = current.with(current.address, referent, Origin::Dereference, None);
                }
                TypeKind::Pointer { referent, extra_offset } if mode.contains(DerefMode::POINTER) && depth > 0 => {
                    let referent = *referent;
                    let extra_offset = *extra_offset;
                    let target = space.read_pointer(current.address).map_err(EngineError::MemoryAccess)?;
                    let adjusted = target.wrapping_add_signed(extra_offset);
                    depth -= 1;
                    current = current.with(adjusted, referent, Origin::Dereference, None);
                }
                _ => return Ok(current),
            }
        }
    }

    /// Returns the element instance for an array (or pointer-to-array,
    /// whose length is advisory only — the caller is trusted not to walk
    /// past what the backing allocation actually holds).
    pub fn array_elem(&self, graph: &TypeGraph, index: u64) -> Result<Self, EngineError> {
        let kind = self.resolved_kind(graph)?;
        let (referent, len) = match kind {
            TypeKind::Array { referent, len } => (*referent, *len),
            TypeKind::Pointer { referent, .. } => (*referent, None),
            other => return Err(EngineError::Type(TypeError::NotIndexable(other.kind_name()))),
        };
        if let Some(len) = len {
            if index >= len {
                return Err(EngineError::Type(TypeError::MemberIndexOutOfRange(index as usize)));
            }
        }
        let elem_size = graph.find_by_id(referent).map_or(1, |t| t.size.max(1));
        Ok(self.with(self.address + index * elem_size, referent, Origin::ArrayElem, None))
    }

    fn read_raw<'g>(&self, graph: &'g TypeGraph, space: &dyn AddressSpace) -> Result<(ArrayVec<u8, 16>, u64, &'g TypeKind), EngineError> {
        let kind = self.resolved_kind(graph)?;
        let size = self.size(graph).min(16).max(1);
        let mut buf = ArrayVec::from([0u8; 16]);
        space.read_bytes(self.address, &mut buf[..size as usize]).map_err(EngineError::MemoryAccess)?;
        buf.truncate(size as usize);
        Ok((buf, size, kind))
    }

    pub fn to_pointer(&self, graph: &TypeGraph, space: &dyn AddressSpace) -> Result<u64, EngineError> {
        match self.resolved_kind(graph)? {
            TypeKind::Pointer { .. } => space.read_pointer(self.address).map_err(EngineError::MemoryAccess),
            other => Err(EngineError::Type(TypeError::KindMismatch { requested: "pointer", actual: other.kind_name() })),
        }
    }

    pub fn to_integer(&self, graph: &TypeGraph, space: &dyn AddressSpace) -> Result<i128, EngineError> {
        let (buf, size, kind) = self.read_raw(graph, space)?;
        let signed = match kind {
            TypeKind::Int { signed, .. } => *signed,
            TypeKind::Bool { .. } | TypeKind::Enum { .. } => false,
            other => return Err(EngineError::Type(TypeError::KindMismatch { requested: "integer", actual: other.kind_name() })),
        };
        let mut value: u128 = 0;
        for i in (0..size as usize).rev() {
            value = (value << 8) | u128::from(buf[i]);
        }
        if signed && size < 16 {
            let sign_bit = 1u128 << (size * 8 - 1);
            if value & sign_bit != 0 {
                value |= !0u128 << (size * 8);
            }
        }
        Ok(value as i128)
    }

    pub fn to_float(&self, graph: &TypeGraph, space: &dyn AddressSpace) -> Result<f64, EngineError> {
        let (buf, _, kind) = self.read_raw(graph, space)?;
        match kind {
            TypeKind::Float => Ok(f64::from(f32::from_le_bytes(buf[..4].try_into().unwrap()))),
            TypeKind::Double => Ok(f64::from_le_bytes(buf[..8].try_into().unwrap())),
            other => Err(EngineError::Type(TypeError::KindMismatch { requested: "float", actual: other.kind_name() })),
        }
    }

    /// Reads a `char[N]` as a nul-terminated (or full-length) string.
    pub fn to_string(&self, graph: &TypeGraph, space: &dyn AddressSpace) -> Result<String, EngineError> {
        match self.resolved_kind(graph)? {
            TypeKind::Array { .. } => {
                let size = self.size(graph) as usize;
                let mut buf = vec![0u8; size];
                space.read_bytes(self.address, &mut buf).map_err(EngineError::MemoryAccess)?;
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
            }
            other => Err(EngineError::Type(TypeError::KindMismatch { requested: "char array", actual: other.kind_name() })),
        }
    }

    /// Whether `self` and `other`'s address ranges intersect — used by the
    /// rule engine to recognise a self-referential list anchor.
    #[must_use]
    pub fn overlaps(&self, graph: &TypeGraph, other: &Instance) -> bool {
        let a_size = self.size(graph).max(1);
        let b_size = other.size(graph).max(1);
        self.address < other.address + b_size && other.address <= self.address + a_size - 1
    }

    /// Answers "which field contains the byte at `self.address + delta`?" —
    /// used when a raw pointer target falls inside a struct rather than
    /// exactly on a member boundary.
    pub fn find_member_by_offset<'g>(&self, graph: &'g TypeGraph, delta: u64) -> Option<&'g Member> {
        let TypeKind::Struct { members } | TypeKind::Union { members } = &graph.find_by_id(self.type_id)?.kind else {
            return None;
        };
        members.iter().find(|m| {
            let msize = graph.find_by_id(m.referent).map_or(0, |t| t.size.max(1));
            delta >= m.offset && delta < m.offset + msize
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::SliceDump;
    use crate::memspec::{KernelVersion, MemSpecs};
    use crate::symbol::Interner;
    use crate::types::{AggregateKind, DebugRecord, MemberRecord, RecordBody};
    use crate::vmem::VirtualMemory;
    use std::sync::Arc;

    fn specs() -> Arc<MemSpecs> {
        Arc::new(MemSpecs {
            page_offset: 0,
            vmalloc_start: u64::MAX,
            vmalloc_end: u64::MAX,
            vmalloc_offset: 0,
            vmemmap_start: 0,
            vmemmap_end: 0,
            modules_vaddr: 0,
            modules_end: 0,
            start_kernel_map: 0,
            page_table_root: 0,
            high_memory: 0,
            vmalloc_early_reserve: 0,
            list_poison_1: 0,
            list_poison_2: 0,
            max_errno: 4095,
            sizeof_long: 8,
            sizeof_pointer: 8,
            arch: crate::config::Arch::X86_64,
            version: KernelVersion::default(),
            symbol_map: Default::default(),
        })
    }

    #[test]
    fn member_access_and_integer_decode() {
        let mut graph = TypeGraph::new();
        let mut interner = Interner::new();
        graph.add(DebugRecord { id: 1, name: Some("int".into()), size: 4, body: RecordBody::Int { bits: 32, signed: true }, compile_unit: None }, &mut interner).unwrap();
        graph
            .add(
                DebugRecord {
                    id: 2,
                    name: Some("pair".into()),
                    size: 8,
                    body: RecordBody::Aggregate {
                        kind: AggregateKind::Struct,
                        members: vec![
                            MemberRecord { name: Some("a".into()), offset: 0, referent: 1, bit_size: None, bit_offset: None, observed_constants: vec![] },
                            MemberRecord { name: Some("b".into()), offset: 4, referent: 1, bit_size: None, bit_offset: None, observed_constants: vec![] },
                        ],
                    },
                    compile_unit: None,
                },
                &mut interner,
            )
            .unwrap();

        let mut backing = vec![0u8; 16];
        backing[4..8].copy_from_slice(&7i32.to_le_bytes());
        let dump = SliceDump::new(backing);
        let space = VirtualMemory::new(dump, specs(), 16);

        let root_name = interner.intern("root");
        let root = Instance::root(0, 2, root_name);
        let b_sym = interner.intern("b");
        let b = root.member(&graph, b_sym).unwrap();
        assert_eq!(b.to_integer(&graph, &space).unwrap(), 7);
    }

    #[test]
    fn overlap_detects_self_referential_instance() {
        let graph = TypeGraph::new();
        let a = Instance { address: 100, type_id: 0, name_path: SmallVec::new(), bit_field: None, origin: Origin::Manual };
        let b = Instance { address: 104, type_id: 0, name_path: SmallVec::new(), bit_field: None, origin: Origin::Manual };
        assert!(a.overlaps(&graph, &b) == (a.size(&graph).max(1) > 4));
    }
}
