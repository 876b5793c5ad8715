//! Global variables: the engine's root set. The map builder starts every
//! traversal from these.

use smallvec::SmallVec;

use crate::symbol::Symbol;
use crate::types::{ExprId, TypeId};

/// A named global with a fixed virtual address.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: Symbol,
    pub address: u64,
    pub referent: TypeId,
    /// Expressions that, if evaluable, yield a sharper type for the
    /// runtime value currently stored at this address (rule-engine
    /// territory, not evaluated here).
    pub alt_referents: SmallVec<[ExprId; 1]>,
}

impl Variable {
    #[must_use]
    pub fn new(name: Symbol, address: u64, referent: TypeId) -> Self {
        Self { name, address, referent, alt_referents: SmallVec::new() }
    }
}
