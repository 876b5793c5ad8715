//! Reconstructs a live kernel object graph from a raw physical-memory dump
//! plus parsed debug symbols: a type graph keyed by structural hash, a
//! virtual-memory translator, a typed instance layer over the dump, a
//! priority-ordered rule engine for reinterpreting pointers, a slab-cache
//! catalog for validating allocator-owned objects, and a parallel
//! probability-ordered map builder tying them together.

pub mod config;
pub mod dump;
pub mod error;
pub mod eval;
pub mod instance;
pub mod map;
pub mod memspec;
pub mod rules;
pub mod slab;
pub mod symbol;
pub mod symbols;
pub mod types;
pub mod vmem;
pub mod xml;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::dump::Dump;
use crate::map::{MapBuilder, MemoryMap, RootVariable};
use crate::memspec::MemSpecs;
use crate::rules::RuleEngine;
use crate::slab::SlabCatalog;
use crate::symbol::Interner;
use crate::types::TypeGraph;
use crate::vmem::VirtualMemory;

/// The process's entire live state: interned strings, the type graph, the
/// address translator, the rule engine, and the slab catalog, plus the
/// configuration that shaped them. Nothing here is global — every caller
/// (including the map builder's worker pool) is handed a reference.
pub struct EngineContext<D: Dump> {
    pub config: EngineConfig,
    pub interner: Interner,
    pub types: TypeGraph,
    pub vmem: VirtualMemory<D>,
    pub rules: RuleEngine,
    pub slabs: SlabCatalog,
}

impl<D: Dump> EngineContext<D> {
    pub fn new(config: EngineConfig, dump: D, specs: MemSpecs) -> Self {
        let vmem = VirtualMemory::new(dump, Arc::new(specs), config.translation_cache_capacity);
        Self {
            interner: Interner::new(),
            types: TypeGraph::new(),
            rules: RuleEngine::new(),
            slabs: SlabCatalog::new(),
            vmem,
            config,
        }
    }

    /// Every global variable as a map-builder root, in no particular order
    /// (the builder's priority queue, not insertion order, decides the
    /// traversal sequence).
    #[must_use]
    pub fn roots(&self) -> Vec<RootVariable> {
        self.types
            .variables()
            .map(|var| RootVariable { name: var.name, address: var.address, type_id: var.referent })
            .collect()
    }

    /// Runs the map builder over every global variable, to the configured
    /// probability cutoff.
    pub fn build_map(&self) -> MemoryMap {
        let builder = MapBuilder::new(&self.types, &self.interner, &self.rules, &self.slabs, &self.vmem, &self.config);
        builder.build(&self.roots())
    }
}
