//! Black-box end-to-end coverage over the crate's public API, one test per
//! scenario the engine's design notes describe: a direct member read
//! through translated memory, a rule-specialised intrusive-list traversal,
//! slab-catalog validity judgements, rule-priority ambiguity resolution,
//! and probability-cutoff termination over a large candidate set. The
//! sixth scenario (a circular struct chain collapsing to two nodes) is
//! already covered by `map.rs`'s own unit tests, which sit closer to the
//! code they exercise.

use std::collections::HashSet;
use std::sync::Arc;

use vmicore::config::{Arch, EngineConfig};
use vmicore::dump::{Dump, SliceDump};
use vmicore::instance::{DerefMode, Instance};
use vmicore::map::{MapBuilder, RootVariable};
use vmicore::memspec::{KernelVersion, MemSpecs};
use vmicore::rules::{MatchFlags, RuleEngine};
use vmicore::slab::{SlabCatalog, Validity};
use vmicore::symbol::Interner;
use vmicore::types::{AggregateKind, DebugRecord, MemberRecord, RecordBody, TypeGraph};
use vmicore::vmem::VirtualMemory;
use vmicore::xml::parse_catalogue;

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

/// Scenario 1: a `char[16]` field read through the linear kernel window
/// comes back as the expected C string.
#[test]
fn init_task_comm_field_decodes_through_translated_memory() {
    let mut interner = Interner::new();
    let mut graph = TypeGraph::new();

    const CHAR_ID: i64 = 1;
    const COMM_ARRAY_ID: i64 = 2;
    const TASK_STRUCT_ID: i64 = 10;

    graph
        .add(DebugRecord { id: CHAR_ID, name: Some("char".into()), size: 1, body: RecordBody::Int { bits: 8, signed: true }, compile_unit: None }, &mut interner)
        .unwrap();
    graph
        .add(DebugRecord { id: COMM_ARRAY_ID, name: None, size: 16, body: RecordBody::Array { referent: CHAR_ID, len: Some(16) }, compile_unit: None }, &mut interner)
        .unwrap();
    graph
        .add(
            DebugRecord {
                id: TASK_STRUCT_ID,
                name: Some("task_struct".into()),
                size: 16,
                body: RecordBody::Aggregate {
                    kind: AggregateKind::Struct,
                    members: vec![MemberRecord {
                        name: Some("comm".into()),
                        offset: 0,
                        referent: COMM_ARRAY_ID,
                        bit_size: None,
                        bit_offset: None,
                        observed_constants: vec![],
                    }],
                },
                compile_unit: None,
            },
            &mut interner,
        )
        .unwrap();

    let init_task_addr = 0xFFFF_8800_0000_1000u64;
    let mut backing = vec![0u8; 0x2000];
    backing[0x1000..0x1007].copy_from_slice(b"swapper");
    backing[0x1007] = 0;

    let dump = SliceDump::new(backing);
    let space = VirtualMemory::new(dump, kernel_specs(), 16);

    let root = Instance::root(init_task_addr, TASK_STRUCT_ID, interner.intern("init_task"));
    let comm = root.member(&graph, interner.intern("comm")).unwrap();
    let text = comm.to_string(&graph, &space).unwrap();
    assert_eq!(text, "swapper");
}

/// Scenario 2: a `children` member whose referent is the generic
/// `list_head` anchor gets specialised into a synthetic pointer carrying
/// the back-adjustment offset (spec's macro `extra_offset` open question);
/// dereferencing it through a populated `next` pointer lands exactly on
/// the neighbouring object's base address, not on its embedded anchor.
#[test]
fn children_next_dereference_back_adjusts_to_sibling_base_address() {
    let mut interner = Interner::new();
    let mut graph = TypeGraph::new();

    const SELF_PTR_ID: i64 = 10;
    const LIST_HEAD_ID: i64 = 20;
    const VAL_ID: i64 = 1;
    const TASK_ID: i64 = 30;

    graph.add(DebugRecord { id: VAL_ID, name: Some("long".into()), size: 8, body: RecordBody::Int { bits: 64, signed: true }, compile_unit: None }, &mut interner).unwrap();
    // generic two-pointer list_head anchor: next/prev both point back at itself.
    graph.add(DebugRecord { id: SELF_PTR_ID, name: None, size: 8, body: RecordBody::Pointer { referent: LIST_HEAD_ID }, compile_unit: None }, &mut interner).unwrap();
    graph
        .add(
            DebugRecord {
                id: LIST_HEAD_ID,
                name: Some("list_head".into()),
                size: 16,
                body: RecordBody::Aggregate {
                    kind: AggregateKind::Struct,
                    members: vec![
                        MemberRecord { name: Some("next".into()), offset: 0, referent: SELF_PTR_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                        MemberRecord { name: Some("prev".into()), offset: 8, referent: SELF_PTR_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                    ],
                },
                compile_unit: None,
            },
            &mut interner,
        )
        .unwrap();
    // task: a value field plus a `children` list anchor at offset 8.
    graph
        .add(
            DebugRecord {
                id: TASK_ID,
                name: Some("task".into()),
                size: 24,
                body: RecordBody::Aggregate {
                    kind: AggregateKind::Struct,
                    members: vec![
                        MemberRecord { name: Some("val".into()), offset: 0, referent: VAL_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                        MemberRecord { name: Some("children".into()), offset: 8, referent: LIST_HEAD_ID, bit_size: None, bit_offset: None, observed_constants: vec![] },
                    ],
                },
                compile_unit: None,
            },
            &mut interner,
        )
        .unwrap();

    let children_member = graph
        .find_by_id(TASK_ID)
        .and_then(|t| match &t.kind {
            vmicore::types::TypeKind::Struct { members } => members.iter().find(|m| m.name == Some(interner.find("children").unwrap())),
            _ => None,
        })
        .expect("children member");
    assert!(children_member.referent < 0, "children should now point at a synthesised anchor type");

    let parent = 0xFFFF_8800_0000_1000u64;
    let child = 0xFFFF_8800_0000_2000u64;

    let mut backing = vec![0u8; 0x3000];
    // parent.children.next points at the child's own `children` field, the
    // kernel's own intrusive-list convention (anchors point at anchors).
    backing[0x1008..0x1010].copy_from_slice(&(child + 8).to_le_bytes());
    backing[0x2000..0x2008].copy_from_slice(&99i64.to_le_bytes());

    let dump = SliceDump::new(backing);
    let space = VirtualMemory::new(dump, kernel_specs(), 16);

    let root = Instance::root(parent, TASK_ID, interner.intern("task"));
    let children = root.member(&graph, interner.intern("children")).unwrap();
    let next = children.member(&graph, interner.intern("next")).unwrap();
    let neighbour = next.dereference(&graph, &space, DerefMode::POINTER, 1).unwrap();

    assert_eq!(neighbour.address, child, "back-adjustment must land on the sibling's base, not its anchor field");
    assert_eq!(neighbour.type_id, TASK_ID);

    let val = neighbour.member(&graph, interner.intern("val")).unwrap();
    assert_eq!(val.to_integer(&graph, &space).unwrap(), 99);
}

/// Scenario 3: slab-catalog validity judgements across the full range the
/// design notes describe: an exact match at an object's base, a member
/// embedded at its declared offset, a type mismatch at a bound offset, an
/// address outside every known object, and a cache whose type never
/// bound.
#[test]
fn slab_catalog_reports_every_validity_judgement() {
    let mut interner = Interner::new();
    let mut graph = TypeGraph::new();

    const COUNT_ID: i64 = 1;
    const UNRELATED_ID: i64 = 2;
    const TASK_STRUCT_ID: i64 = 10;

    graph.add(DebugRecord { id: COUNT_ID, name: Some("count".into()), size: 4, body: RecordBody::Int { bits: 32, signed: true }, compile_unit: None }, &mut interner).unwrap();
    graph.add(DebugRecord { id: UNRELATED_ID, name: Some("unrelated".into()), size: 8, body: RecordBody::Int { bits: 64, signed: false }, compile_unit: None }, &mut interner).unwrap();
    graph
        .add(
            DebugRecord {
                id: TASK_STRUCT_ID,
                name: Some("task_struct".into()),
                size: 128,
                body: RecordBody::Aggregate {
                    kind: AggregateKind::Struct,
                    members: vec![MemberRecord {
                        name: Some("count".into()),
                        offset: 16,
                        referent: COUNT_ID,
                        bit_size: None,
                        bit_offset: None,
                        observed_constants: vec![],
                    }],
                },
                compile_unit: None,
            },
            &mut interner,
        )
        .unwrap();

    let listing = "\
        # cache name, object base address\n\
        task_struct 0x1000\n\
        unbound_cache 0x7000\n";
    let mut catalog = SlabCatalog::parse(listing);
    catalog.set_object_size("task_struct", 128);
    catalog.set_object_size("unbound_cache", 64);
    catalog.bind_types(&graph, &interner);

    assert_eq!(catalog.judge(&graph, 0x1000, TASK_STRUCT_ID), Validity::Valid);
    assert_eq!(catalog.judge(&graph, 0x1000 + 16, COUNT_ID), Validity::Embedded);
    assert_eq!(catalog.judge(&graph, 0x1000 + 16, UNRELATED_ID), Validity::Conflict);
    assert_eq!(catalog.judge(&graph, 0x9000, TASK_STRUCT_ID), Validity::NotFound);
    assert_eq!(catalog.judge(&graph, 0x7000, TASK_STRUCT_ID), Validity::NoSlabType);
}

/// Scenario 4: two equal-priority rules matching the same type produce an
/// ambiguous outcome; adding a strictly higher-priority rule and
/// re-checking resolves it to a clean, unambiguous match.
#[test]
fn equal_priority_rules_resolve_once_a_higher_priority_rule_is_added() {
    let mut interner = Interner::new();
    let mut graph = TypeGraph::new();
    graph.add(DebugRecord { id: 1, name: Some("widget".into()), size: 8, body: RecordBody::Int { bits: 64, signed: true }, compile_unit: None }, &mut interner).unwrap();

    let two_rules_xml = r#"<typeknowledge architecture="x86_64">
        <rule priority="5">
            <name>first</name>
            <filter><type_name>widget</type_name></filter>
            <action type="expression"><srcType>widget</srcType><targetType>widget</targetType><expression>100</expression></action>
        </rule>
        <rule priority="5">
            <name>second</name>
            <filter><type_name>widget</type_name></filter>
            <action type="expression"><srcType>widget</srcType><targetType>widget</targetType><expression>200</expression></action>
        </rule>
    </typeknowledge>"#;
    let (_, rules) = parse_catalogue(two_rules_xml, &mut graph, &mut interner).unwrap();
    assert_eq!(rules.len(), 2);

    let mut engine = RuleEngine::new();
    for rule in rules {
        engine.add_rule(rule);
    }
    let specs = kernel_specs();
    assert!(engine.check(&graph, &interner, &specs).is_empty());

    let dump = SliceDump::new(vec![0u8; 64]);
    let space = VirtualMemory::new(dump, specs.clone(), 16);
    let base = Instance::root(0x1000, 1, interner.intern("w"));
    let outcome = engine.dispatch(&graph, &interner, &space, &base, None, &[]).unwrap();
    assert!(outcome.flags.contains(MatchFlags::MATCH));
    assert!(outcome.flags.contains(MatchFlags::AMBIGUOUS));

    let tiebreaker_xml = r#"<typeknowledge architecture="x86_64">
        <rule priority="10">
            <name>tiebreaker</name>
            <filter><type_name>widget</type_name></filter>
            <action type="expression"><srcType>widget</srcType><targetType>widget</targetType><expression>300</expression></action>
        </rule>
    </typeknowledge>"#;
    let (_, mut extra) = parse_catalogue(tiebreaker_xml, &mut graph, &mut interner).unwrap();
    engine.add_rule(extra.remove(0));
    assert!(engine.check(&graph, &interner, &specs).is_empty());

    let outcome = engine.dispatch(&graph, &interner, &space, &base, None, &[]).unwrap();
    assert!(outcome.flags.contains(MatchFlags::MATCH));
    assert!(!outcome.flags.contains(MatchFlags::AMBIGUOUS));
    assert_eq!(outcome.instance.unwrap().address, 300);
}

/// A `Dump` whose backing storage is unbounded but carries explicit
/// unreadable byte offsets ("holes"), used to give a large contiguous
/// array of same-sized elements two cleanly separated probability classes
/// without fighting the geometry of a single truncated buffer: every
/// element's first byte is readable (so well-formedness's single-byte
/// check passes and every element gets enqueued), but half the elements
/// have their last byte punched out (so only those fail the two-sided
/// `is_accessible` check the scoring pass applies).
struct PatchyDump {
    len: u64,
    holes: HashSet<u64>,
}

impl Dump for PatchyDump {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<bool> {
        let Some(end) = offset.checked_add(buf.len() as u64) else { return Ok(false) };
        if end > self.len {
            return Ok(false);
        }
        for i in 0..buf.len() as u64 {
            if self.holes.contains(&(offset + i)) {
                return Ok(false);
            }
        }
        buf.fill(0);
        Ok(true)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Scenario 5: a probability cutoff stops the builder from draining a
/// large reachable set once the priority queue starts popping entries
/// below the configured threshold, rather than exhausting every candidate.
#[test]
fn probability_cutoff_admits_only_the_high_confidence_half_of_a_large_array() {
    let mut interner = Interner::new();
    let mut graph = TypeGraph::new();

    const LEAF_ID: i64 = 1;
    const ARRAY_ID: i64 = 2;
    const ELEM_SIZE: u64 = 8;
    const COUNT: u64 = 2000;

    graph.add(DebugRecord { id: LEAF_ID, name: Some("long".into()), size: ELEM_SIZE, body: RecordBody::Int { bits: 64, signed: true }, compile_unit: None }, &mut interner).unwrap();
    graph
        .add(DebugRecord { id: ARRAY_ID, name: Some("objects".into()), size: ELEM_SIZE * COUNT, body: RecordBody::Array { referent: LEAF_ID, len: Some(COUNT) }, compile_unit: None }, &mut interner)
        .unwrap();

    let base = 0xFFFF_8800_0001_0000u64;
    let half = COUNT / 2;
    let mut holes = HashSet::new();
    for i in half..COUNT {
        let elem_addr = base + i * ELEM_SIZE;
        holes.insert(elem_addr + ELEM_SIZE - 1);
    }
    let dump = PatchyDump { len: base + COUNT * ELEM_SIZE + 16, holes };
    let specs = kernel_specs();
    let vmem = VirtualMemory::new(dump, specs, 64);

    let rules = RuleEngine::new();
    let slabs = SlabCatalog::new();
    let config = EngineConfig::builder().worker_threads(1).probability_cutoff(0.5).build();

    let builder = MapBuilder::new(&graph, &interner, &rules, &slabs, &vmem, &config);
    let roots = vec![RootVariable { name: interner.intern("objects"), address: base, type_id: ARRAY_ID }];
    let map = builder.build(&roots);

    // the array node itself plus exactly the accessible half of elements.
    assert_eq!(map.len() as u64, 1 + half);
    for i in 0..half {
        assert!(!map.nodes_at(base + i * ELEM_SIZE).is_empty());
    }
    for i in half..COUNT {
        assert!(map.nodes_at(base + i * ELEM_SIZE).is_empty(), "element {i} fell below the cutoff and must not appear in the map");
    }
}
