//! The engine's error universe.
//!
//! Four outward-facing kinds, mirroring the error handling design: a failed
//! address translation, an operation that doesn't apply to an instance's
//! kind, a rule that failed its static check, and an always-recovered
//! expression evaluation failure. A fifth `Fatal` wraps the handful of
//! conditions that abort the current command outright.

use crate::types::TypeId;

/// Errors surfaced across the public API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A page walk or a raw dump read failed.
    #[error("memory access failed: {0}")]
    MemoryAccess(#[from] MemoryAccessError),

    /// An operation is inapplicable for the instance's type kind.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// A rule failed its static check.
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// An expression could not be evaluated. Internal callers recover from
    /// this by lowering a probability score; it is never constructed at a
    /// public boundary, but kept uniform with the rest of the error chain
    /// so `evaluate` can be threaded with `?` like everything else.
    #[error("expression could not be evaluated: {0}")]
    ExpressionEval(String),

    /// Aborts the current command; any map built so far is kept, marked
    /// incomplete.
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),

    /// Wraps an I/O failure reading a dump, symbol stream, rule catalogue,
    /// or slab file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum MemoryAccessError {
    #[error("page table entry at level {level} for address {vaddr:#x} is not present")]
    NotPresent { vaddr: u64, level: u8 },
    #[error("address {vaddr:#x} is outside the kernel half of the address space")]
    OutsideKernelSpace { vaddr: u64 },
    #[error("read of {len} bytes at offset {offset:#x} exceeds the backing device")]
    ReadBeyondDevice { offset: u64, len: usize },
    #[error("no page-table root configured for this architecture")]
    NoPageTableRoot,
}

#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("type {0:?} is unresolved (referent id never observed)")]
    UnresolvedType(TypeId),
    #[error("member access is not applicable to type kind {0}")]
    NotAMember(&'static str),
    #[error("dereference is not applicable to type kind {0}")]
    NotDereferenceable(&'static str),
    #[error("array indexing is not applicable to type kind {0}")]
    NotIndexable(&'static str),
    #[error("no member named {0:?} on this struct/union")]
    NoSuchMember(String),
    #[error("member index {0} is out of range")]
    MemberIndexOutOfRange(usize),
    #[error("requested decode kind {requested} does not match the instance's actual kind {actual}")]
    KindMismatch { requested: &'static str, actual: &'static str },
    #[error("ingested symbol record is missing required fixed attributes: {0}")]
    MalformedSymbol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule {0:?} has no instance filter and was dropped")]
    MissingFilter(String),
    #[error("rule {0:?} references unknown type {1:?}")]
    UnknownType(String, String),
    #[error("rule {0:?} expression does not type-check against its declared source")]
    ExpressionTypeMismatch(String),
    #[error("malformed rule catalogue: {0}")]
    MalformedCatalogue(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("dump header is truncated")]
    TruncatedHeader,
    #[error("symbol stream version {major}.{minor} is incompatible with this engine")]
    IncompatibleSymbolVersion { major: u16, minor: u16 },
    #[error("no page table root address was configured")]
    MissingPageTableRoot,
    #[error("memory specification is missing required key {0:?}")]
    IncompleteSpecs(&'static str),
}
