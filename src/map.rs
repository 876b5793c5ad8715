//! The map builder (spec §4.6): a parallel, probability-ordered traversal
//! of the live kernel object graph, seeded from the root set of global
//! variables and driven to a configurable probability cutoff.
//!
//! Grounded in `insightd/memorymapbuildersa.cpp`/`memorymapbuildercs.cpp`
//! from the original implementation for the worker-loop shape (pop highest
//! probability, dispatch by type kind, enqueue children) and in
//! `insightd/memorymap.cpp` for the range-indexed map and its deduplication
//! rule. The five coarse locks below follow spec §5's lock table one to
//! one; `std::thread::scope` plus `parking_lot::{Mutex, RwLock}` stand in
//! for the original's thread pool and read-write locks — the teacher's own
//! stack already reaches for `parking_lot` in `vmem.rs`'s translation
//! cache, so nothing new joins the dependency table here.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, instrument, trace, warn};

use crate::config::EngineConfig;
use crate::dump::Dump;
use crate::instance::{DerefMode, Instance, Origin};
use crate::rules::{MatchFlags, MatchOutcome, RuleEngine};
use crate::slab::SlabCatalog;
use crate::symbol::{Interner, Symbol};
use crate::types::{Member, TypeGraph, TypeId, TypeKind};
use crate::vmem::{AddressSpace, VirtualMemory};

/// A struct/union member is treated as list-head-like when it resolves to
/// this shape (spec §4.6 "list_head members"): two pointer members named
/// `next`/`prev`, the shape the synthetic specialisation and the real
/// kernel `struct list_head` both share.
const NEXT_NAME: &str = "next";
const PREV_NAME: &str = "prev";

/// Multiplier applied once per failed `next.prev == self` back-pointer
/// check, and once more for a rule-produced candidate whose own
/// list-head offset check fails (spec §4.6 "Probability score").
const LIST_HEAD_PENALTY: f32 = 0.8;
/// Multiplier applied to every rule-engine candidate other than the
/// winner, reflecting the uncertainty an ambiguous dispatch carries
/// (spec §4.6 "Apply the rule-engine penalty").
const RULE_ENGINE_CANDIDATE_PENALTY: f32 = 0.9;
/// Multiplier applied when a target address is not safe-seekable.
const UNREADABLE_PENALTY: f32 = 0.1;
/// Multiplier applied when a target address lies in user space.
const USER_SPACE_PENALTY: f32 = 0.95;

/// Hard ceiling on how many elements of one array member are enqueued, so a
/// corrupt or misread length field can't turn one member into an unbounded
/// fan-out.
const MAX_ARRAY_FANOUT: u64 = 4096;

/// One accepted node in the reconstructed object graph (spec §3 "Memory-map
/// node").
#[derive(Debug, Clone)]
pub struct MapNode {
    pub address: u64,
    pub size: u64,
    pub type_id: TypeId,
    pub hash: u64,
    pub probability: f32,
    /// Indices of every node that reached this one, including duplicate
    /// arrivals via different paths (spec §4.6 "Deduplication").
    pub parents: SmallVec<[usize; 2]>,
    pub children: Vec<usize>,
    pub origin: Origin,
    /// True once a second node has ever been recorded at the same address
    /// with a disagreeing type hash.
    pub conflict: bool,
}

/// Maps a virtual (or physical) range start to the node indices beginning
/// there, ordered for fast `lowerBound`/`upperBound`-style queries.
#[derive(Default)]
struct RangeIndex {
    starts: BTreeMap<u64, SmallVec<[usize; 2]>>,
}

impl RangeIndex {
    fn insert(&mut self, start: u64, node: usize) {
        self.starts.entry(start).or_default().push(node);
    }

    fn lower_bound(&self, addr: u64) -> Option<u64> {
        self.starts.range(addr..).next().map(|(&k, _)| k)
    }

    fn upper_bound(&self, addr: u64) -> Option<u64> {
        self.starts.range(..=addr).next_back().map(|(&k, _)| k)
    }

    fn objects_in_range(&self, lo: u64, hi: u64) -> Vec<usize> {
        self.starts.range(lo..hi).flat_map(|(_, v)| v.iter().copied()).collect()
    }
}

/// The range-indexed virtual/physical map plus the node arena accumulated
/// by a map-builder run.
#[derive(Default)]
pub struct MemoryMap {
    nodes: Vec<MapNode>,
    by_address: HashMap<u64, SmallVec<[usize; 2]>>,
    vrange: RangeIndex,
    prange: RangeIndex,
    /// Set when the builder stopped before the queue drained on its own —
    /// via cancellation or a verification failure — so the map is usable
    /// but not exhaustive.
    pub incomplete: bool,
}

impl MemoryMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> &MapNode {
        &self.nodes[idx]
    }

    #[must_use]
    pub fn nodes(&self) -> &[MapNode] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node indices at `address`, regardless of type — more than one
    /// entry iff they disagree (spec §4.6 "Deduplication").
    #[must_use]
    pub fn nodes_at(&self, address: u64) -> &[usize] {
        self.by_address.get(&address).map_or(&[], SmallVec::as_slice)
    }

    #[must_use]
    pub fn lower_bound(&self, addr: u64) -> Option<u64> {
        self.vrange.lower_bound(addr)
    }

    #[must_use]
    pub fn upper_bound(&self, addr: u64) -> Option<u64> {
        self.vrange.upper_bound(addr)
    }

    #[must_use]
    pub fn objects_in_range(&self, lo: u64, hi: u64) -> Vec<usize> {
        self.vrange.objects_in_range(lo, hi)
    }

    #[must_use]
    pub fn objects_in_physical_range(&self, lo: u64, hi: u64) -> Vec<usize> {
        self.prange.objects_in_range(lo, hi)
    }

    fn insert(&mut self, node: MapNode) -> usize {
        let idx = self.nodes.len();
        self.vrange.insert(node.address, idx);
        self.by_address.entry(node.address).or_default().push(idx);
        self.nodes.push(node);
        idx
    }

    fn insert_physical_range(&mut self, start: u64, node_idx: usize) {
        self.prange.insert(start, node_idx);
    }
}

/// A root of the traversal: a global variable's name, address and declared
/// type.
pub struct RootVariable {
    pub name: Symbol,
    pub address: u64,
    pub type_id: TypeId,
}

/// A node awaiting materialisation, carrying just enough context to resume
/// rule-engine member-path matching once it is popped. `path` resets to
/// empty at every pointer-chase boundary, since a rule's `member_path` is
/// relative to the typed object a traversal chain currently starts from,
/// not the whole history since the root variable.
struct PendingNode {
    address: u64,
    type_id: TypeId,
    parent: Option<usize>,
    variable_name: Option<Symbol>,
    path: SmallVec<[Symbol; 4]>,
    origin: Origin,
}

/// Total order over `f32` via `total_cmp`, plus an insertion sequence that
/// breaks ties deterministically (spec §5: "no order guarantee between
/// equal-probability nodes, but the set and each node's probability are
/// deterministic" — the sequence number only affects *which* equal-priority
/// node pops first, not the eventual node set).
struct QueueEntry {
    probability: f32,
    seq: u64,
    pending: PendingNode,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.probability.total_cmp(&other.probability) == Ordering::Equal && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.probability.total_cmp(&other.probability).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Everything the worker pool shares, each behind its own coarse lock
/// (spec §5 "Concurrency & Resource Model"):
///
/// - `queue` — the priority queue of pending nodes.
/// - `map` — the virtual/physical range-indexed node arena.
/// - `pointer_index` — an inverted index from a raw pointer target to the
///   node(s) whose member pointed at it.
/// - `type_instance_index` — every node index observed for a given type.
///
/// The type graph, rule engine, slab catalog and translator are read-only
/// after symbol load and need no lock at all.
struct SharedState<'a, D: Dump> {
    graph: &'a TypeGraph,
    interner: &'a Interner,
    rules: &'a RuleEngine,
    slabs: &'a SlabCatalog,
    vmem: &'a VirtualMemory<D>,
    config: &'a EngineConfig,

    queue: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    processed: AtomicU64,
    /// Cooperative cancellation, observed by the worker loop at its next
    /// pop (spec §5 "Cancellation").
    interrupted: AtomicBool,
    /// Set by a caller that has independently declared the dump's
    /// consistency compromised (e.g. a slab-catalog or checksum failure
    /// discovered outside this module); observed the same way as
    /// `interrupted`. Distinct flag so a log or report can tell the two
    /// stop reasons apart.
    verification_failed: AtomicBool,

    map: RwLock<MemoryMap>,
    pointer_index: Mutex<HashMap<u64, SmallVec<[usize; 2]>>>,
    type_instance_index: RwLock<HashMap<TypeId, Vec<usize>>>,
    max_object_size: AtomicU64,
}

impl<'a, D: Dump> SharedState<'a, D> {
    fn enqueue(&self, pending: PendingNode, probability: f32) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().push(QueueEntry { probability, seq, pending });
    }

    fn stopped(&self) -> bool {
        self.interrupted.load(AtomicOrdering::Relaxed) || self.verification_failed.load(AtomicOrdering::Relaxed)
    }
}

/// Drives one parallel map-builder run (spec §4.6/§5). Each run is
/// single-use: construct, call [`Self::build`] once, discard.
pub struct MapBuilder<'a, D: Dump> {
    shared: SharedState<'a, D>,
}

impl<'a, D: Dump> MapBuilder<'a, D> {
    pub fn new(
        graph: &'a TypeGraph,
        interner: &'a Interner,
        rules: &'a RuleEngine,
        slabs: &'a SlabCatalog,
        vmem: &'a VirtualMemory<D>,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            shared: SharedState {
                graph,
                interner,
                rules,
                slabs,
                vmem,
                config,
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                interrupted: AtomicBool::new(false),
                verification_failed: AtomicBool::new(false),
                map: RwLock::new(MemoryMap::new()),
                pointer_index: Mutex::new(HashMap::new()),
                type_instance_index: RwLock::new(HashMap::new()),
                max_object_size: AtomicU64::new(0),
            },
        }
    }

    /// Requests cooperative cancellation; safe to call from another thread
    /// while [`Self::build`] is running.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, AtomicOrdering::Relaxed);
    }

    /// Marks the run as having lost confidence in the dump's consistency;
    /// the worker pool drains to a stop exactly as on cancellation, but the
    /// resulting map reports the distinct reason via its `incomplete` flag
    /// and this flag's own accessor.
    pub fn declare_verification_failed(&self) {
        self.shared.verification_failed.store(true, AtomicOrdering::Relaxed);
    }

    #[must_use]
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(AtomicOrdering::Relaxed)
    }

    #[must_use]
    pub fn max_object_size(&self) -> u64 {
        self.shared.max_object_size.load(AtomicOrdering::Relaxed)
    }

    /// Seeds the queue with every root and runs the worker pool to
    /// completion, to the probability cutoff, or to cancellation.
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub fn build(&self, roots: &[RootVariable]) -> MemoryMap {
        for root in roots {
            self.shared.enqueue(
                PendingNode {
                    address: root.address,
                    type_id: root.type_id,
                    parent: None,
                    variable_name: Some(root.name),
                    path: SmallVec::new(),
                    origin: Origin::Manual,
                },
                1.0,
            );
        }

        let worker_count = self.shared.config.worker_threads;
        std::thread::scope(|scope| {
            for worker in 0..worker_count {
                let shared = &self.shared;
                scope.spawn(move || worker_loop(shared, worker));
            }
        });

        let mut map = self.shared.map.write();
        if self.shared.stopped() {
            map.incomplete = true;
        }
        std::mem::take(&mut *map)
    }
}

fn strip_lexical(graph: &TypeGraph, id: TypeId) -> TypeId {
    let mut current = id;
    while let Some(ty) = graph.find_by_id(current) {
        match &ty.kind {
            TypeKind::Typedef { referent } | TypeKind::Const { referent } | TypeKind::Volatile { referent } => {
                current = *referent;
            }
            _ => break,
        }
    }
    current
}

fn is_list_head_member(graph: &TypeGraph, interner: &Interner, type_id: TypeId) -> bool {
    let Some(ty) = graph.find_by_id(type_id) else { return false };
    let TypeKind::Struct { members } = &ty.kind else { return false };
    if members.len() != 2 {
        return false;
    }
    let Some(next_sym) = interner.find(NEXT_NAME) else { return false };
    let Some(prev_sym) = interner.find(PREV_NAME) else { return false };
    let is_pointer = |id: TypeId| matches!(graph.find_by_id(id).map(|t| &t.kind), Some(TypeKind::Pointer { .. }));
    members[0].name == Some(next_sym)
        && members[1].name == Some(prev_sym)
        && is_pointer(members[0].referent)
        && is_pointer(members[1].referent)
}

/// Reads the raw (un-adjusted) `next` pointer at `anchor` and the `prev`
/// field of whatever it points to, and checks that it folds back to
/// `anchor` — the structural invariant every non-corrupt doubly linked
/// list anchor satisfies, empty-list sentinels included.
fn verify_list_head_backpointer<D: Dump>(vmem: &VirtualMemory<D>, anchor: u64, ptr_size: u64) -> bool {
    let Ok(next) = vmem.read_pointer(anchor) else { return false };
    if next == 0 {
        return false;
    }
    let Ok(prev_of_next) = vmem.read_pointer(next + ptr_size) else { return false };
    prev_of_next == anchor
}

fn is_well_formed<D: Dump>(shared: &SharedState<D>, addr: u64) -> bool {
    if addr == 0 || addr == u64::MAX {
        return false;
    }
    let align = u64::from(shared.vmem.pointer_size());
    if addr % align != 0 {
        return false;
    }
    if !shared.vmem.safe_seek(addr) {
        return false;
    }
    if shared.config.kernel_only && !shared.vmem.specs().is_kernel_address(addr) {
        return false;
    }
    true
}

/// Probability score for a freshly materialised node (spec §4.6
/// "Probability score"): starts at 1.0, and is reduced for a user-space
/// address, an unreadable one, and once per embedded `list_head` member
/// whose own back-pointer invariant doesn't hold.
fn score<D: Dump>(shared: &SharedState<D>, instance: &Instance) -> f32 {
    let mut probability = 1.0f32;

    if !shared.vmem.specs().is_kernel_address(instance.address) {
        probability *= USER_SPACE_PENALTY;
    }
    if !instance.is_accessible(shared.graph, shared.vmem) {
        probability *= UNREADABLE_PENALTY;
    }

    let resolved = strip_lexical(shared.graph, instance.type_id);
    if let Some(ty) = shared.graph.find_by_id(resolved) {
        if let TypeKind::Struct { members } | TypeKind::Union { members } = &ty.kind {
            let ptr_size = u64::from(shared.vmem.pointer_size());
            for member in members {
                if is_list_head_member(shared.graph, shared.interner, member.referent) {
                    let anchor = instance.address + member.offset;
                    if !verify_list_head_backpointer(shared.vmem, anchor, ptr_size) {
                        probability *= LIST_HEAD_PENALTY;
                    }
                }
            }
        }
    }
    probability
}

fn build_name_path(variable_name: Option<Symbol>, path: &[Symbol]) -> SmallVec<[Symbol; 4]> {
    let mut v: SmallVec<[Symbol; 4]> = SmallVec::new();
    if let Some(name) = variable_name {
        v.push(name);
    }
    v.extend(path.iter().copied());
    v
}

/// Splits the byte range `[vaddr, vaddr+size)` into the one or more
/// physical extents it backs, chunked at whatever page boundaries the
/// translator reports (mirrors [`VirtualMemory::read_bytes`]'s chunking,
/// but records ranges instead of reading them).
fn physical_ranges<D: Dump>(shared: &SharedState<D>, vaddr: u64, size: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    while offset < size {
        let current = vaddr + offset;
        let Ok((paddr, page_size)) = shared.vmem.translate(current) else { break };
        let page_bytes = page_size.bytes();
        let until_page_end =
            if page_bytes == u64::MAX { size - offset } else { page_bytes - (current & (page_bytes - 1)) };
        let chunk = until_page_end.min(size - offset).max(1);
        out.push((paddr, chunk));
        offset += chunk;
    }
    out
}

fn worker_loop<D: Dump>(shared: &SharedState<D>, worker: usize) {
    loop {
        if shared.stopped() {
            break;
        }
        let Some(entry) = shared.queue.lock().pop() else { break };
        if entry.probability < shared.config.probability_cutoff {
            // Every remaining entry has probability <= this one (binary-heap
            // max property), so the queue is exhausted for this worker too.
            break;
        }
        shared.processed.fetch_add(1, AtomicOrdering::Relaxed);
        process_node(shared, entry.pending, entry.probability);
    }
    trace!(worker, "map builder worker exiting");
}

fn process_node<D: Dump>(shared: &SharedState<D>, pending: PendingNode, probability: f32) {
    let PendingNode { address, type_id, parent, variable_name, path, origin } = pending;

    let Some(ty) = shared.graph.find_by_id(type_id) else {
        warn!(type_id, "map builder node refers to an unresolved type, dropped");
        return;
    };
    let hash = ty.hash;
    let size = ty.size.max(1);

    let existing = {
        let map = shared.map.read();
        map.nodes_at(address).iter().copied().find(|&idx| map.node(idx).hash == hash)
    };
    if let Some(idx) = existing {
        if let Some(parent_idx) = parent {
            let mut map = shared.map.write();
            if !map.nodes[idx].parents.contains(&parent_idx) {
                map.nodes[idx].parents.push(parent_idx);
            }
            if !map.nodes[parent_idx].children.contains(&idx) {
                map.nodes[parent_idx].children.push(idx);
            }
        }
        return;
    }

    let node = MapNode {
        address,
        size,
        type_id,
        hash,
        probability,
        parents: parent.into_iter().collect(),
        children: Vec::new(),
        origin,
        conflict: false,
    };

    let idx = {
        let mut map = shared.map.write();
        let siblings: Vec<usize> = map.nodes_at(address).to_vec();
        let idx = map.insert(node);
        if !siblings.is_empty() {
            map.nodes[idx].conflict = true;
            for other in siblings {
                map.nodes[other].conflict = true;
            }
        }
        if let Some(parent_idx) = parent {
            map.nodes[parent_idx].children.push(idx);
        }
        for (pstart, _) in physical_ranges(shared, address, size) {
            map.insert_physical_range(pstart, idx);
        }
        idx
    };

    shared.type_instance_index.write().entry(type_id).or_default().push(idx);
    shared.max_object_size.fetch_max(size, AtomicOrdering::Relaxed);

    if let Some(slab_cache) = shared.slabs.cache_by_name(interned_name(shared.interner, ty.name)) {
        debug!(cache = %slab_cache.name, address, "node's type is also a known slab cache name");
    }
    let judged = shared.slabs.judge(shared.graph, address, type_id);
    trace!(address, ?judged, "slab catalog consulted (diagnostic only)");

    let instance =
        Instance { address, type_id, name_path: build_name_path(variable_name, &path), bit_field: None, origin };
    dispatch_children(shared, idx, &instance, variable_name, &path);
}

fn interned_name(interner: &Interner, name: Option<Symbol>) -> &str {
    name.map_or("", |n| interner.resolve(n))
}

fn dispatch_children<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    instance: &Instance,
    variable_name: Option<Symbol>,
    path: &[Symbol],
) {
    let resolved_id = strip_lexical(shared.graph, instance.type_id);
    let Some(ty) = shared.graph.find_by_id(resolved_id) else { return };
    match &ty.kind {
        TypeKind::Pointer { .. } => {
            let mut pointer_instance = instance.clone();
            pointer_instance.type_id = resolved_id;
            dispatch_pointer_member(shared, node_idx, &pointer_instance, &pointer_instance, variable_name, path, None);
        }
        TypeKind::Array { len, .. } => {
            if let Some(l) = len {
                if *l > MAX_ARRAY_FANOUT {
                    debug!(len = *l, cap = MAX_ARRAY_FANOUT, "array member fanout truncated");
                }
            }
            let bound = len.unwrap_or(0).min(MAX_ARRAY_FANOUT);
            for i in 0..bound {
                if let Ok(elem) = instance.array_elem(shared.graph, i) {
                    try_enqueue_child(shared, node_idx, &elem, Origin::ArrayElem);
                }
            }
        }
        TypeKind::Struct { members } | TypeKind::Union { members } => {
            dispatch_aggregate(shared, node_idx, instance, instance, variable_name, path, members);
        }
        _ => {}
    }
}

fn dispatch_aggregate<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    base: &Instance,
    current: &Instance,
    variable_name: Option<Symbol>,
    path: &[Symbol],
    members: &[Member],
) {
    for (i, member) in members.iter().enumerate() {
        let Ok(raw_member) = current.member_at(shared.graph, i) else { continue };
        let mut local_path: SmallVec<[Symbol; 4]> = path.iter().copied().collect();
        if let Some(name) = member.name {
            local_path.push(name);
        }

        let resolved_id = strip_lexical(shared.graph, member.referent);
        let Some(member_ty) = shared.graph.find_by_id(resolved_id) else { continue };
        let mut member_instance = raw_member;
        member_instance.type_id = resolved_id;

        if is_list_head_member(shared.graph, shared.interner, resolved_id) {
            dispatch_list_head(shared, node_idx, base, &member_instance, variable_name, &local_path);
            continue;
        }

        match &member_ty.kind {
            TypeKind::Struct { members: inner } | TypeKind::Union { members: inner } => {
                // Embedded aggregate: not a new node, the enclosing node
                // just grows more of its own field space (spec §4.6
                // "nested non-pointer structs inherit the enclosing node").
                dispatch_aggregate(shared, node_idx, base, &member_instance, variable_name, &local_path, inner);
            }
            TypeKind::Pointer { .. } => {
                dispatch_pointer_member(shared, node_idx, base, &member_instance, variable_name, &local_path, None);
            }
            TypeKind::Int { .. } if member_ty.size == u64::from(shared.vmem.pointer_size()) => {
                dispatch_rule_only_member(shared, node_idx, base, &member_instance, variable_name, &local_path);
            }
            _ => {}
        }
    }
}

/// Follows only `next` (spec §4.6: "prev is redundant, a consequence of the
/// doubly linked invariant"), after checking that invariant itself and
/// penalising both the rule-engine candidates and the generic dereference
/// when it fails.
fn dispatch_list_head<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    base: &Instance,
    list_head_instance: &Instance,
    variable_name: Option<Symbol>,
    local_path: &[Symbol],
) {
    let Ok(next_member) = list_head_instance.member_at(shared.graph, 0) else { return };
    let ptr_size = u64::from(shared.vmem.pointer_size());
    let backpointer_ok = verify_list_head_backpointer(shared.vmem, list_head_instance.address, ptr_size);
    let penalty = if backpointer_ok { None } else { Some(LIST_HEAD_PENALTY) };

    if let Some(outcome) = rule_dispatch(shared, base, variable_name, local_path) {
        enqueue_candidates(shared, node_idx, &outcome, penalty);
        return;
    }
    dispatch_pointer(shared, node_idx, &next_member, penalty);
}

fn rule_dispatch<D: Dump>(
    shared: &SharedState<D>,
    base: &Instance,
    variable_name: Option<Symbol>,
    path: &[Symbol],
) -> Option<MatchOutcome> {
    match shared.rules.dispatch(shared.graph, shared.interner, shared.vmem, base, variable_name, path) {
        Ok(outcome) if outcome.flags.contains(MatchFlags::MATCH) => Some(outcome),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "rule dispatch failed for a member path, falling back to generic interpretation");
            None
        }
    }
}

/// Enqueues every rule-produced instance (spec §4.6 "Candidates"): the
/// winner at full score, every other distinct candidate penalised for the
/// dispatch's own ambiguity, and an optional extra penalty (e.g. a failed
/// list-head back-pointer check) applied across the board.
fn enqueue_candidates<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    outcome: &MatchOutcome,
    extra_penalty: Option<f32>,
) {
    let winner_addr = outcome.instance.as_ref().map(|i| i.address);
    for candidate in &outcome.candidates {
        if !is_well_formed(shared, candidate.address) {
            continue;
        }
        let mut probability = score(shared, candidate);
        if Some(candidate.address) != winner_addr {
            probability *= RULE_ENGINE_CANDIDATE_PENALTY;
        }
        if let Some(p) = extra_penalty {
            probability *= p;
        }
        shared.enqueue(
            PendingNode {
                address: candidate.address,
                type_id: candidate.type_id,
                parent: Some(node_idx),
                variable_name: None,
                path: SmallVec::new(),
                origin: Origin::RuleEngine,
            },
            probability,
        );
    }
}

fn dispatch_pointer_member<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    base: &Instance,
    member_instance: &Instance,
    variable_name: Option<Symbol>,
    local_path: &[Symbol],
    extra_penalty: Option<f32>,
) {
    if let Some(outcome) = rule_dispatch(shared, base, variable_name, local_path) {
        enqueue_candidates(shared, node_idx, &outcome, extra_penalty);
        return;
    }
    dispatch_pointer(shared, node_idx, member_instance, extra_penalty);
}

/// A pointer-sized integer member (e.g. `unsigned long` used to stash an
/// address) has no type to bind an instance to on its own — it only
/// becomes a node when a rule rewrites it into one.
fn dispatch_rule_only_member<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    base: &Instance,
    member_instance: &Instance,
    variable_name: Option<Symbol>,
    local_path: &[Symbol],
) {
    if let Some(outcome) = rule_dispatch(shared, base, variable_name, local_path) {
        enqueue_candidates(shared, node_idx, &outcome, None);
    } else {
        trace!(address = member_instance.address, "pointer-sized integer member has no rule interpretation, skipped");
    }
}

/// Generic pointer dereference: records the raw target in the inverted
/// pointer index, then follows it (with the synthetic type's
/// `extra_offset`, if any) to enqueue the referent.
fn dispatch_pointer<D: Dump>(
    shared: &SharedState<D>,
    node_idx: usize,
    pointer_instance: &Instance,
    extra_penalty: Option<f32>,
) {
    let Ok(target) = pointer_instance.to_pointer(shared.graph, shared.vmem) else { return };
    if target != 0 {
        shared.pointer_index.lock().entry(target).or_default().push(node_idx);
    }
    if !is_well_formed(shared, target) {
        return;
    }
    let Ok(deref) = pointer_instance.dereference(shared.graph, shared.vmem, DerefMode::POINTER, 1) else { return };
    if !is_well_formed(shared, deref.address) {
        return;
    }
    let mut probability = score(shared, &deref);
    if let Some(p) = extra_penalty {
        probability *= p;
    }
    shared.enqueue(
        PendingNode {
            address: deref.address,
            type_id: deref.type_id,
            parent: Some(node_idx),
            variable_name: None,
            path: SmallVec::new(),
            origin: Origin::Dereference,
        },
        probability,
    );
}

fn try_enqueue_child<D: Dump>(shared: &SharedState<D>, node_idx: usize, instance: &Instance, origin: Origin) {
    if !is_well_formed(shared, instance.address) {
        return;
    }
    let probability = score(shared, instance);
    shared.enqueue(
        PendingNode {
            address: instance.address,
            type_id: instance.type_id,
            parent: Some(node_idx),
            variable_name: None,
            path: SmallVec::new(),
            origin,
        },
        probability,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arch;
    use crate::dump::SliceDump;
    use crate::memspec::{KernelVersion, MemSpecs};
    use crate::types::{AggregateKind, DebugRecord, MemberRecord, RecordBody};
    use std::sync::Arc;

    fn kernel_specs() -> Arc<MemSpecs> {
        Arc::new(MemSpecs {
            page_offset: 0xFFFF_8800_0000_0000,
            vmalloc_start: 0xFFFF_C900_0000_0000,
            vmalloc_end: 0xFFFF_E8FF_FFFF_FFFF,
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
            arch: Arch::X86_64,
            version: KernelVersion::default(),
            symbol_map: Default::default(),
        })
    }

    const LONG_ID: TypeId = 1;
    const PTR_TO_B_ID: TypeId = 2;
    const STRUCT_A_ID: TypeId = 10;
    const PTR_TO_A_ID: TypeId = 3;
    const STRUCT_B_ID: TypeId = 11;

    /// Builds two structs, A and B, each with a pointer member to the
    /// other, and backing memory wired so A's pointer points at B and B's
    /// points back at A (spec §8 scenario 6's circular chain).
    fn circular_a_b_graph(interner: &mut Interner) -> TypeGraph {
        let mut g = TypeGraph::new();
        g.add(
            DebugRecord { id: LONG_ID, name: Some("long".into()), size: 8, body: RecordBody::Int { bits: 64, signed: true }, compile_unit: None },
            interner,
        )
        .unwrap();
        g.add(DebugRecord { id: PTR_TO_B_ID, name: None, size: 8, body: RecordBody::Pointer { referent: STRUCT_B_ID }, compile_unit: None }, interner)
            .unwrap();
        g.add(DebugRecord { id: PTR_TO_A_ID, name: None, size: 8, body: RecordBody::Pointer { referent: STRUCT_A_ID }, compile_unit: None }, interner)
            .unwrap();
        g.add(
            DebugRecord {
                id: STRUCT_A_ID,
                name: Some("A".into()),
                size: 16,
                body: RecordBody::Aggregate {
                    kind: AggregateKind::Struct,
                    members: vec![
                        MemberRecord { name: Some("val".into()), offset: 0, referent: LONG_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                        MemberRecord { name: Some("b".into()), offset: 8, referent: PTR_TO_B_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                    ],
                },
                compile_unit: None,
            },
            interner,
        )
        .unwrap();
        g.add(
            DebugRecord {
                id: STRUCT_B_ID,
                name: Some("B".into()),
                size: 16,
                body: RecordBody::Aggregate {
                    kind: AggregateKind::Struct,
                    members: vec![
                        MemberRecord { name: Some("val".into()), offset: 0, referent: LONG_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                        MemberRecord { name: Some("a".into()), offset: 8, referent: PTR_TO_A_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                    ],
                },
                compile_unit: None,
            },
            interner,
        )
        .unwrap();
        g
    }

    fn circular_backing() -> Vec<u8> {
        // A at 0xFFFF_8800_0000_1000, B at 0xFFFF_8800_0000_2000, each
        // translating linearly to physical offset (vaddr - page_offset).
        let mut backing = vec![0u8; 0x3000];
        backing[0x1008..0x1010].copy_from_slice(&0xFFFF_8800_0000_2000u64.to_le_bytes());
        backing[0x2008..0x2010].copy_from_slice(&0xFFFF_8800_0000_1000u64.to_le_bytes());
        backing
    }

    #[test]
    fn circular_struct_chain_yields_exactly_two_nodes() {
        let mut interner = Interner::new();
        let graph = circular_a_b_graph(&mut interner);
        let rules = RuleEngine::new();
        let slabs = SlabCatalog::new();
        let dump = SliceDump::new(circular_backing());
        let vmem = VirtualMemory::new(dump, kernel_specs(), 64);
        let config = EngineConfig::default();

        let builder = MapBuilder::new(&graph, &interner, &rules, &slabs, &vmem, &config);
        let roots = vec![RootVariable { name: Symbol::default(), address: 0xFFFF_8800_0000_1000, type_id: STRUCT_A_ID }];
        let map = builder.build(&roots);

        assert_eq!(map.len(), 2, "A and B should each be a single node despite the cycle");
        assert!(!map.incomplete);

        let a_idx = map.nodes_at(0xFFFF_8800_0000_1000)[0];
        let b_idx = map.nodes_at(0xFFFF_8800_0000_2000)[0];
        assert!(map.node(a_idx).children.contains(&b_idx));
        assert!(map.node(b_idx).children.contains(&a_idx));
    }

    #[test]
    fn dedup_reuses_existing_node_for_repeated_address_and_hash() {
        let mut interner = Interner::new();
        let graph = circular_a_b_graph(&mut interner);
        let rules = RuleEngine::new();
        let slabs = SlabCatalog::new();
        let dump = SliceDump::new(circular_backing());
        let vmem = VirtualMemory::new(dump, kernel_specs(), 64);
        let config = EngineConfig::default();

        let builder = MapBuilder::new(&graph, &interner, &rules, &slabs, &vmem, &config);
        let roots = vec![
            RootVariable { name: Symbol::default(), address: 0xFFFF_8800_0000_1000, type_id: STRUCT_A_ID },
            RootVariable { name: Symbol::default(), address: 0xFFFF_8800_0000_1000, type_id: STRUCT_A_ID },
        ];
        let map = builder.build(&roots);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn cutoff_terminates_before_queue_is_empty() {
        let mut interner = Interner::new();
        let graph = circular_a_b_graph(&mut interner);
        let rules = RuleEngine::new();
        let slabs = SlabCatalog::new();
        let dump = SliceDump::new(circular_backing());
        let vmem = VirtualMemory::new(dump, kernel_specs(), 64);
        let config = EngineConfig::builder().probability_cutoff(1.1).worker_threads(1).build();

        let builder = MapBuilder::new(&graph, &interner, &rules, &slabs, &vmem, &config);
        let roots = vec![RootVariable { name: Symbol::default(), address: 0xFFFF_8800_0000_1000, type_id: STRUCT_A_ID }];
        let map = builder.build(&roots);
        assert_eq!(map.len(), 0, "root's initial probability of 1.0 never reaches a cutoff above 1.0");
    }

    #[test]
    fn well_formedness_rejects_null_and_misaligned_and_user_space() {
        let specs = kernel_specs();
        let dump = SliceDump::new(vec![0u8; 0x10000]);
        let vmem = VirtualMemory::new(dump, specs, 16);
        let graph = TypeGraph::new();
        let interner = Interner::new();
        let rules = RuleEngine::new();
        let slabs = SlabCatalog::new();
        let config = EngineConfig::default();
        let shared = MapBuilder::new(&graph, &interner, &rules, &slabs, &vmem, &config).shared;

        assert!(!is_well_formed(&shared, 0));
        assert!(!is_well_formed(&shared, u64::MAX));
        assert!(!is_well_formed(&shared, 0xFFFF_8800_0000_1001)); // misaligned
        assert!(!is_well_formed(&shared, 0x0000_7FFF_0000_0000)); // user space, kernel_only default
    }

    #[test]
    fn list_head_member_detection_requires_next_and_prev_pointers() {
        let mut interner = Interner::new();
        let mut graph = TypeGraph::new();
        // A genuine two-pointer list_head-shaped struct (id 5), whose
        // members point back at itself, mirroring the kernel's own anchor.
        graph.add(DebugRecord { id: 6, name: None, size: 8, body: RecordBody::Pointer { referent: 5 }, compile_unit: None }, &mut interner).unwrap();
        graph
            .add(
                DebugRecord {
                    id: 5,
                    name: Some("list_head".into()),
                    size: 16,
                    body: RecordBody::Aggregate {
                        kind: AggregateKind::Struct,
                        members: vec![
                            MemberRecord { name: Some("next".into()), offset: 0, referent: 6, bit_size: None, bit_offset: None, observed_constants: vec![] },
                            MemberRecord { name: Some("prev".into()), offset: 8, referent: 6, bit_size: None, bit_offset: None, observed_constants: vec![] },
                        ],
                    },
                    compile_unit: None,
                },
                &mut interner,
            )
            .unwrap();
        assert!(is_list_head_member(&graph, &interner, 5));
    }
}
