//! Standalone driver: loads a memory specification, ingests a symbol
//! stream, checks any rule catalogues, optionally binds a slab listing,
//! and runs the map builder to its configured cutoff.
//!
//! A thin assembly of the library's pieces — every real decision lives in
//! `vmicore`, not here.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, info, warn};

use vmicore::config::EngineConfig;
use vmicore::dump::FileDump;
use vmicore::error::EngineError;
use vmicore::memspec::MemSpecs;
use vmicore::slab::SlabCatalog;
use vmicore::symbol::Interner;
use vmicore::symbols::ingest_symbol_stream;
use vmicore::types::TypeGraph;
use vmicore::xml::parse_catalogue;

/// Builds a memory map from a physical dump, a memory specification, and a
/// symbol stream.
#[derive(Parser)]
#[command(name = "vmi-build", version, about = "Reconstruct a kernel object map from a memory dump")]
struct Cli {
    /// Raw physical memory dump.
    #[arg(long)]
    dump: PathBuf,

    /// Memory specification (`key = value` text).
    #[arg(long)]
    memspec: PathBuf,

    /// Ingested debug-symbol stream, in the engine's wire format.
    #[arg(long)]
    symbols: PathBuf,

    /// Rule-catalogue XML file; may be given more than once, in priority order.
    #[arg(long = "rules")]
    rule_catalogues: Vec<PathBuf>,

    /// Slab-cache text listing to bind against the loaded types.
    #[arg(long)]
    slabs: Option<PathBuf>,

    /// Stop accepting nodes once their probability falls below this.
    #[arg(long, default_value_t = 0.1)]
    probability_cutoff: f32,

    /// Worker thread count for the map builder.
    #[arg(long, default_value_t = 8)]
    worker_threads: usize,

    /// Accept only kernel-half addresses as traversal candidates.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    kernel_only: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vmi-build: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), EngineError> {
    let memspec_text = fs::read_to_string(&cli.memspec)?;
    let specs = MemSpecs::parse(&memspec_text)?;
    info!(arch = ?specs.arch, "loaded memory specification");

    let mut interner = Interner::new();
    let mut graph = TypeGraph::new();

    let symbol_file = fs::File::open(&cli.symbols)?;
    let header = ingest_symbol_stream(std::io::BufReader::new(symbol_file), &mut graph, &mut interner)?;
    info!(major = header.major, minor = header.minor, types = graph.type_count(), "ingested symbol stream");
    if !graph.is_fully_resolved() {
        warn!("type graph has postponed referents after ingestion; some nodes may stay unresolved");
    }

    let mut rules = vmicore::rules::RuleEngine::new();
    for path in &cli.rule_catalogues {
        let xml = fs::read_to_string(path)?;
        let (_meta, catalogue_rules) = parse_catalogue(&xml, &mut graph, &mut interner)?;
        debug!(path = %path.display(), rules = catalogue_rules.len(), "loaded rule catalogue");
        for rule in catalogue_rules {
            rules.add_rule(rule);
        }
    }
    for dropped in rules.check(&graph, &interner, &specs) {
        warn!(%dropped, "rule dropped during check");
    }
    info!(active = rules.active_count(), total = rules.rule_count(), "rule engine checked");

    let mut slabs = SlabCatalog::new();
    if let Some(path) = &cli.slabs {
        let text = fs::read_to_string(path)?;
        slabs = SlabCatalog::parse(&text);
        slabs.bind_types(&graph, &interner);
        info!(caches = slabs.cache_count(), "bound slab catalog");
    }

    let config = EngineConfig::builder()
        .worker_threads(cli.worker_threads)
        .probability_cutoff(cli.probability_cutoff)
        .arch(specs.arch)
        .kernel_only(cli.kernel_only)
        .build();

    let dump = FileDump::open(&cli.dump)?;
    let vmem = vmicore::vmem::VirtualMemory::new(dump, std::sync::Arc::new(specs), config.translation_cache_capacity);

    let roots: Vec<vmicore::map::RootVariable> = graph
        .variables()
        .map(|var| vmicore::map::RootVariable { name: var.name, address: var.address, type_id: var.referent })
        .collect();
    info!(roots = roots.len(), "starting map builder");

    let builder = vmicore::map::MapBuilder::new(&graph, &interner, &rules, &slabs, &vmem, &config);
    let map = builder.build(&roots);

    println!("nodes: {}", map.len());
    println!("incomplete: {}", map.incomplete);
    let conflicts = map.nodes().iter().filter(|n| n.conflict).count();
    println!("conflicting nodes: {conflicts}");

    Ok(())
}
