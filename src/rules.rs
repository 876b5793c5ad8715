//! The type-rule engine (spec §4.4): a priority-ordered filter+action rule
//! set that overrides generic pointer interpretation with expert knowledge.
//!
//! Grounded in `insightd/typeruleengine.cpp` and `libinsight/typefilter.cpp`
//! from the original implementation: the `match` dispatch loop below
//! mirrors `TypeRuleEngine::match` one for one, including the "ambiguous
//! once, then only higher-priority rules can still matter" short-circuit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use glob::Pattern as GlobPattern;
use hashbrown::HashMap;
use regex::Regex;
use tracing::warn;

use crate::config::Arch;
use crate::error::{EngineError, RuleError};
use crate::eval::{self, VariableResolver, SELF_SYMBOL};
use crate::instance::Instance;
use crate::memspec::MemSpecs;
use crate::symbol::{Interner, Symbol};
use crate::types::{ExprId, TypeGraph, TypeId, TypeKind};
use crate::vmem::AddressSpace;

/// A glob/regex/literal match against a name (type name, member name,
/// compile-unit name, or variable name).
#[derive(Debug, Clone)]
pub enum NamePattern {
    Literal(String),
    Glob(GlobPattern),
    Regex(Regex),
    Any,
}

impl NamePattern {
    #[must_use]
    pub fn matches(&self, s: &str) -> bool {
        match self {
            NamePattern::Literal(lit) => lit == s,
            NamePattern::Glob(g) => g.matches(s),
            NamePattern::Regex(r) => r.is_match(s),
            NamePattern::Any => true,
        }
    }
}

bitflags! {
    /// A mask over the type-kind tags, matching the filter's "data-type"
    /// predicate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataTypeMask: u32 {
        const INT              = 1 << 0;
        const BOOL              = 1 << 1;
        const FLOAT              = 1 << 2;
        const DOUBLE             = 1 << 3;
        const ENUM               = 1 << 4;
        const POINTER            = 1 << 5;
        const ARRAY              = 1 << 6;
        const STRUCT             = 1 << 7;
        const UNION              = 1 << 8;
        const TYPEDEF            = 1 << 9;
        const CONST              = 1 << 10;
        const VOLATILE           = 1 << 11;
        const FUNCTION_POINTER   = 1 << 12;
        const VOID               = 1 << 13;
    }
}

impl DataTypeMask {
    #[must_use]
    pub fn matches_kind(self, kind: &TypeKind) -> bool {
        let bit = match kind {
            TypeKind::Int { .. } => Self::INT,
            TypeKind::Bool { .. } => Self::BOOL,
            TypeKind::Float => Self::FLOAT,
            TypeKind::Double => Self::DOUBLE,
            TypeKind::Enum { .. } => Self::ENUM,
            TypeKind::Pointer { .. } => Self::POINTER,
            TypeKind::Array { .. } => Self::ARRAY,
            TypeKind::Struct { .. } => Self::STRUCT,
            TypeKind::Union { .. } => Self::UNION,
            TypeKind::Typedef { .. } => Self::TYPEDEF,
            TypeKind::Const { .. } => Self::CONST,
            TypeKind::Volatile { .. } => Self::VOLATILE,
            TypeKind::FunctionPointer { .. } => Self::FUNCTION_POINTER,
            TypeKind::Void => Self::VOID,
        };
        self.contains(bit)
    }
}

/// One step of a filter's member-access path: a field-name pattern plus an
/// optional nested filter constraining the type reached after that step.
#[derive(Debug, Clone)]
pub struct MemberPathStep {
    pub field: NamePattern,
    pub inner: Option<Box<Filter>>,
}

/// Combinable predicates over an instance (or the variable it came from).
/// A filter matches when every predicate that is set matches.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub type_name: Option<NamePattern>,
    pub type_id: Option<TypeId>,
    pub data_type: Option<DataTypeMask>,
    pub size: Option<u64>,
    pub compile_unit: Option<NamePattern>,
    pub variable_name: Option<NamePattern>,
    pub member_path: Vec<MemberPathStep>,
}

/// Strips typedef/const/volatile wrappers, since lexical types are
/// transparent to the rule engine's type-directed predicates.
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

impl Filter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.type_name.is_none()
            && self.type_id.is_none()
            && self.data_type.is_none()
            && self.size.is_none()
            && self.compile_unit.is_none()
            && self.variable_name.is_none()
            && self.member_path.is_empty()
    }

    /// Matches the type-directed predicates (name/id/data-type/size/
    /// compile-unit) against `type_id`, walking through lexical wrappers
    /// first so a filter on `struct X` also fires on `const X`.
    #[must_use]
    pub fn matches_type(&self, graph: &TypeGraph, interner: &Interner, type_id: TypeId) -> bool {
        let concrete = strip_lexical(graph, type_id);
        let Some(ty) = graph.find_by_id(concrete) else { return false };
        if let Some(pat) = &self.type_name {
            match ty.name {
                Some(n) if pat.matches(interner.resolve(n)) => {}
                _ => return false,
            }
        }
        if let Some(id) = self.type_id {
            if concrete != id {
                return false;
            }
        }
        if let Some(mask) = self.data_type {
            if !mask.matches_kind(&ty.kind) {
                return false;
            }
        }
        if let Some(size) = self.size {
            if ty.size != size {
                return false;
            }
        }
        if let Some(pat) = &self.compile_unit {
            match ty.compile_unit {
                Some(cu) if pat.matches(interner.resolve(cu)) => {}
                _ => return false,
            }
        }
        true
    }

    #[must_use]
    pub fn matches_variable(&self, interner: &Interner, variable_name: Option<Symbol>) -> bool {
        match (&self.variable_name, variable_name) {
            (None, _) => true,
            (Some(pat), Some(v)) => pat.matches(interner.resolve(v)),
            (Some(_), None) => false,
        }
    }
}

/// Restricts a rule to a subset of OS/architecture/kernel-version
/// combinations.
#[derive(Debug, Clone, Default)]
pub struct OsFilter {
    pub sysname: Option<NamePattern>,
    pub arch: Option<Arch>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
}

fn parse_dotted_version(v: &str) -> Vec<u64> {
    v.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty()).filter_map(|s| s.parse().ok()).collect()
}

fn version_at_least(version: &[u64], bound: &[u64]) -> bool {
    for i in 0..bound.len().max(version.len()) {
        let v = version.get(i).copied().unwrap_or(0);
        let b = bound.get(i).copied().unwrap_or(0);
        if v != b {
            return v > b;
        }
    }
    true
}

fn version_at_most(version: &[u64], bound: &[u64]) -> bool {
    for i in 0..bound.len().max(version.len()) {
        let v = version.get(i).copied().unwrap_or(0);
        let b = bound.get(i).copied().unwrap_or(0);
        if v != b {
            return v < b;
        }
    }
    true
}

impl OsFilter {
    #[must_use]
    pub fn matches(&self, specs: &MemSpecs) -> bool {
        if let Some(pat) = &self.sysname {
            if !pat.matches(&specs.version.sysname) {
                return false;
            }
        }
        if let Some(arch) = self.arch {
            if arch != specs.arch {
                return false;
            }
        }
        let release = parse_dotted_version(&specs.version.release);
        if let Some(min) = &self.min_version {
            if !version_at_least(&release, &parse_dotted_version(min)) {
                return false;
            }
        }
        if let Some(max) = &self.max_version {
            if !version_at_most(&release, &parse_dotted_version(max)) {
                return false;
            }
        }
        true
    }
}

/// What happens when a rule's filter matches.
#[derive(Debug, Clone)]
pub enum Action {
    /// Evaluates `expr` against the matched instance (bound to
    /// [`SELF_SYMBOL`]), coerces the numeric result to an address, and
    /// re-binds it as `target_type`.
    Expression { source_type: String, target_type: String, expr: ExprId },
    /// A script body evaluated in-process by the script host.
    InlineScript(String),
    /// A named function inside an external script file.
    ScriptFunction { file: String, function: String },
}

/// Expert knowledge: a filter plus the action to take when it matches.
#[derive(Debug, Clone)]
pub struct TypeRule {
    pub name: String,
    pub description: String,
    pub os_filter: Option<OsFilter>,
    pub filter: Filter,
    pub action: Action,
    pub priority: i32,
    pub source_file: String,
    pub source_line: u32,
}

bitflags! {
    /// The dispatch result bitmask from spec §4.4.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MatchFlags: u8 {
        const MATCH            = 1 << 0;
        const DEFER             = 1 << 1;
        const AMBIGUOUS          = 1 << 2;
        const DEFAULT_HANDLER    = 1 << 3;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub flags: MatchFlags,
    pub instance: Option<Instance>,
    /// Every instance a matching rule produced, winner included — the map
    /// builder's source for the sibling interpretations an ambiguous match
    /// enqueues alongside the winner (spec §4.6 "Candidates").
    pub candidates: Vec<Instance>,
}

impl MatchOutcome {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

/// Feeds an instance into a sandboxed scripting runtime and reads one back.
/// The expression action variant evaluates in-process (`eval` module);
/// script actions delegate here instead. Kept as a pluggable trait object
/// per the design notes rather than a concrete scripting dependency, since
/// scripting DSL semantics are explicitly out of scope.
pub trait ScriptHost: Send + Sync {
    fn evaluate(&self, rule_name: &str, instance: &Instance, members: &[Symbol]) -> Result<(Instance, bool), EngineError>;
}

struct ActiveRule {
    rule_index: usize,
    resolved_target: TypeId,
}

/// The checked, dispatch-ready rule set. `hit_counters` is the one piece of
/// confined mutable state the rule engine owns after symbol load — see the
/// design notes on global mutable state.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<TypeRule>,
    active: Vec<ActiveRule>,
    rules_per_type: HashMap<TypeId, Vec<usize>>,
    hit_counters: Vec<AtomicU64>,
    script_host: Option<Arc<dyn ScriptHost>>,
}

fn lexical_variants(graph: &TypeGraph, target: TypeId) -> Vec<TypeId> {
    let mut out = vec![target];
    for ty in graph.types() {
        if ty.id == target {
            continue;
        }
        if ty.kind.is_lexical() && strip_lexical(graph, ty.id) == target {
            out.push(ty.id);
        }
    }
    out
}

impl RuleEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_script_host(&mut self, host: Arc<dyn ScriptHost>) {
        self.script_host = Some(host);
    }

    /// Loads one rule, unchecked — `check` decides whether it becomes
    /// active.
    pub fn add_rule(&mut self, rule: TypeRule) {
        self.rules.push(rule);
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn hit_count(&self, active_index: usize) -> u64 {
        self.hit_counters.get(active_index).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Runs the one-time rule check (spec §4.4 "Rule checking"): drops
    /// rules whose OS filter excludes the current specs, drops filterless
    /// rules with a warning, resolves each action's source/target type
    /// strings, and builds `rules_per_type`. Returns the non-fatal errors
    /// for rules that were dropped.
    pub fn check(&mut self, graph: &TypeGraph, interner: &Interner, specs: &MemSpecs) -> Vec<RuleError> {
        self.active.clear();
        self.rules_per_type.clear();
        let mut errors = Vec::new();

        for (rule_index, rule) in self.rules.iter().enumerate() {
            if let Some(os) = &rule.os_filter {
                if !os.matches(specs) {
                    continue;
                }
            }
            if rule.filter.is_empty() {
                warn!(rule = %rule.name, "rule has no instance filter and was dropped");
                errors.push(RuleError::MissingFilter(rule.name.clone()));
                continue;
            }

            let resolved_target = match &rule.action {
                Action::Expression { target_type, .. } => match self.resolve_type_name(graph, interner, target_type) {
                    Some(id) => id,
                    None => {
                        warn!(rule = %rule.name, target = %target_type, "rule references unknown target type");
                        errors.push(RuleError::UnknownType(rule.name.clone(), target_type.clone()));
                        continue;
                    }
                },
                _ => 0,
            };
            if let Action::Expression { source_type, .. } = &rule.action {
                if self.resolve_type_name(graph, interner, source_type).is_none() {
                    warn!(rule = %rule.name, source = %source_type, "rule references unknown source type");
                    errors.push(RuleError::UnknownType(rule.name.clone(), source_type.clone()));
                    continue;
                }
            }

            let active_index = self.active.len();
            self.active.push(ActiveRule { rule_index, resolved_target });

            let mut hits = 0usize;
            if let Some(NamePattern::Literal(name)) = &rule.filter.type_name {
                if let Some(sym) = interner.find(name) {
                    for &id in graph.find_by_name(sym) {
                        for variant in lexical_variants(graph, id) {
                            self.rules_per_type.entry(variant).or_default().push(active_index);
                            hits += 1;
                        }
                    }
                }
            } else if let Some(id) = rule.filter.type_id {
                for variant in lexical_variants(graph, id) {
                    self.rules_per_type.entry(variant).or_default().push(active_index);
                    hits += 1;
                }
            } else {
                for ty in graph.types() {
                    if rule.filter.matches_type(graph, interner, ty.id) {
                        self.rules_per_type.entry(ty.id).or_default().push(active_index);
                        hits += 1;
                    }
                }
            }

            if hits == 0 {
                warn!(rule = %rule.name, "rule does not match any type");
            }
        }
        self.hit_counters = (0..self.active.len()).map(|_| AtomicU64::new(0)).collect();
        errors
    }

    /// Resolves a type name string to a [`TypeId`], falling back to
    /// id-based binding (`#123`) when the string is a bare numeric id —
    /// the "ambiguous name" escape hatch spec §4.4 step 3 describes.
    fn resolve_type_name(&self, graph: &TypeGraph, interner: &Interner, name: &str) -> Option<TypeId> {
        if let Some(raw) = name.strip_prefix('#') {
            if let Ok(id) = raw.parse::<TypeId>() {
                return graph.find_by_id(id).map(|t| t.id);
            }
        }
        let sym = interner.find(name)?;
        graph.find_by_name(sym).first().copied()
    }

    /// Given the instance an access path starts from and the chain of
    /// field names accessed so far, returns the dispatch result: the
    /// winning (possibly rule-rewritten) instance, or a `defer`/`ambiguous`
    /// signal. Mirrors `TypeRuleEngine::match`.
    pub fn dispatch(
        &self,
        graph: &TypeGraph,
        interner: &Interner,
        space: &dyn AddressSpace,
        base: &Instance,
        variable_name: Option<Symbol>,
        path_names: &[Symbol],
    ) -> Result<MatchOutcome, EngineError> {
        let Some(candidates) = self.rules_per_type.get(&base.type_id) else {
            return Ok(MatchOutcome::none());
        };

        let mut ret = MatchFlags::empty();
        let mut prio = i32::MIN;
        let mut best: Option<Instance> = None;
        let mut candidates: Vec<Instance> = Vec::new();

        for &active_index in candidates {
            let active = &self.active[active_index];
            let rule = &self.rules[active.rule_index];

            if ret.contains(MatchFlags::MATCH | MatchFlags::AMBIGUOUS) && rule.priority <= prio {
                continue;
            }
            if ret.contains(MatchFlags::MATCH) && rule.priority < prio {
                continue;
            }
            if !rule.filter.matches_variable(interner, variable_name) {
                continue;
            }

            let rule_path_len = rule.filter.member_path.len();
            if rule_path_len > path_names.len() {
                ret |= MatchFlags::DEFER;
                continue;
            }
            if rule_path_len < path_names.len() {
                continue;
            }
            if !rule.filter.matches_type(graph, interner, base.type_id) {
                continue;
            }

            let Some(target) = self.walk_member_path(graph, interner, base, &rule.filter.member_path, path_names)? else {
                continue;
            };

            let (produced, matched) = self.fire(active, rule, graph, interner, space, &target)?;
            if !matched {
                continue;
            }
            let produced = resolve_self_reference(graph, produced, &target);
            self.hit_counters[active_index].fetch_add(1, Ordering::Relaxed);
            candidates.push(produced.clone());

            let already_matched = ret.contains(MatchFlags::MATCH);
            ret |= MatchFlags::MATCH;
            if rule.priority > prio {
                ret.remove(MatchFlags::AMBIGUOUS | MatchFlags::DEFAULT_HANDLER);
                prio = rule.priority;
                best = Some(produced);
            } else if already_matched {
                if let Some(existing) = &best {
                    let same = existing.address == produced.address
                        && graph.find_by_id(existing.type_id).map(|t| t.hash)
                            == graph.find_by_id(produced.type_id).map(|t| t.hash);
                    if !same {
                        ret |= MatchFlags::AMBIGUOUS;
                    }
                }
            } else {
                prio = rule.priority;
                best = Some(produced);
            }
        }

        Ok(MatchOutcome { flags: ret, instance: best, candidates })
    }

    /// Walks `base` through `path_names`, checking each rule-path step's
    /// field-name pattern (and optional inner filter) as it goes. Returns
    /// `None` on the first step that doesn't satisfy its pattern — a
    /// no-match, not an error.
    fn walk_member_path(
        &self,
        graph: &TypeGraph,
        interner: &Interner,
        base: &Instance,
        rule_path: &[MemberPathStep],
        path_names: &[Symbol],
    ) -> Result<Option<Instance>, EngineError> {
        let mut current = base.clone();
        for (step, &name) in rule_path.iter().zip(path_names) {
            if !step.field.matches(interner.resolve(name)) {
                return Ok(None);
            }
            current = current.member(graph, name)?;
            if let Some(inner) = &step.inner {
                if !inner.matches_type(graph, interner, current.type_id) {
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }

    fn fire(
        &self,
        active: &ActiveRule,
        rule: &TypeRule,
        graph: &TypeGraph,
        interner: &Interner,
        space: &dyn AddressSpace,
        target: &Instance,
    ) -> Result<(Instance, bool), EngineError> {
        match &rule.action {
            Action::Expression { expr, .. } => {
                let resolver = RuleResolver { graph, interner, base: target.clone() };
                match eval::evaluate(graph.exprs(), graph, space, &resolver, *expr) {
                    Ok(addr) => {
                        let name = target.name_path.last().copied().unwrap_or_default();
                        let mut instance = Instance::root(addr as u64, active.resolved_target, name);
                        instance.origin = crate::instance::Origin::RuleEngine;
                        Ok((instance, true))
                    }
                    Err(_) => Ok((target.clone(), false)),
                }
            }
            Action::InlineScript(_) | Action::ScriptFunction { .. } => {
                let Some(host) = &self.script_host else { return Ok((target.clone(), false)) };
                let members: Vec<Symbol> = target.name_path.iter().copied().collect();
                match host.evaluate(&rule.name, target, &members) {
                    Ok((instance, matched)) => Ok((instance, matched)),
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "script action failed at runtime");
                        Ok((target.clone(), false))
                    }
                }
            }
        }
    }
}

struct RuleResolver<'a> {
    graph: &'a TypeGraph,
    interner: &'a Interner,
    base: Instance,
}

impl VariableResolver for RuleResolver<'_> {
    fn resolve(&self, name: Symbol) -> Option<Instance> {
        if self.interner.resolve(name) == SELF_SYMBOL {
            return Some(self.base.clone());
        }
        let var = self.graph.variable(name)?;
        Some(Instance::root(var.address, var.referent, name))
    }
}

/// Recognises a self-referential list anchor: an expression action that
/// rewrote an instance to somewhere overlapping its own source — the
/// empty-list sentinel case — and resolves it to the member at that
/// address instead, turning the sentinel into a correctly typed container
/// hop rather than an alias of the source.
fn resolve_self_reference(graph: &TypeGraph, produced: Instance, source: &Instance) -> Instance {
    if !produced.overlaps(graph, source) {
        return produced;
    }
    let delta = produced.address.saturating_sub(source.address);
    if let Some(member) = source.find_member_by_offset(graph, delta) {
        let name = member.name.unwrap_or_default();
        return Instance::root(produced.address, member.referent, name);
    }
    produced
}
