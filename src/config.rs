//! Engine-wide configuration.
//!
//! Collects the knobs that the original tool scattered across command-line
//! flags and a process-wide shell object into one explicit, passed-around
//! value (Design Notes §9: confine mutable state, thread configuration
//! through rather than reaching for a global).

use std::path::PathBuf;

use crate::error::{EngineError, FatalError};

/// Target CPU architecture, one of the two supported by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86Pae,
    X86_64,
}

impl Arch {
    #[must_use]
    pub fn pointer_size(self) -> u32 {
        match self {
            Arch::X86 | Arch::X86Pae => 4,
            Arch::X86_64 => 8,
        }
    }

    #[must_use]
    pub fn pointer_align(self) -> u64 {
        u64::from(self.pointer_size())
    }
}

/// Engine-wide configuration, built once at startup and shared read-only
/// across the worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker thread count for the map builder. Bounded to `MAX_BUILDER_THREADS`.
    pub worker_threads: usize,
    /// Nodes whose probability falls below this are never popped.
    pub probability_cutoff: f32,
    /// Architecture the loaded memory specs describe.
    pub arch: Arch,
    /// Capacity of the virtual-memory translation cache, in page entries.
    pub translation_cache_capacity: usize,
    /// Paths to rule-catalogue XML files to load, in priority order.
    pub rule_catalogues: Vec<PathBuf>,
    /// Path to the slab-cache text listing, if any.
    pub slab_input: Option<PathBuf>,
    /// Whether a child node's probability change is back-propagated to its
    /// ancestors. Off by default per the open design question; this is a
    /// deliberate knob, not a forgotten feature.
    pub propagate_probability: bool,
    /// When set, only addresses above the kernel/user split are accepted
    /// by the map builder's well-formedness filter.
    pub kernel_only: bool,
}

pub const MAX_BUILDER_THREADS: usize = 8;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: MAX_BUILDER_THREADS,
            probability_cutoff: 0.1,
            arch: Arch::X86_64,
            translation_cache_capacity: 4096,
            rule_catalogues: Vec::new(),
            slab_input: None,
            propagate_probability: false,
            kernel_only: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder-style construction, in the idiom of the teacher's own
/// explicit-field compiler settings.
#[derive(Default)]
pub struct EngineConfigBuilder {
    cfg: EngineConfig,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.cfg.worker_threads = n.min(MAX_BUILDER_THREADS).max(1);
        self
    }

    #[must_use]
    pub fn probability_cutoff(mut self, p: f32) -> Self {
        self.cfg.probability_cutoff = p.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn arch(mut self, arch: Arch) -> Self {
        self.cfg.arch = arch;
        self
    }

    #[must_use]
    pub fn translation_cache_capacity(mut self, n: usize) -> Self {
        self.cfg.translation_cache_capacity = n;
        self
    }

    #[must_use]
    pub fn rule_catalogue(mut self, path: impl Into<PathBuf>) -> Self {
        self.cfg.rule_catalogues.push(path.into());
        self
    }

    #[must_use]
    pub fn slab_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.cfg.slab_input = Some(path.into());
        self
    }

    #[must_use]
    pub fn propagate_probability(mut self, yes: bool) -> Self {
        self.cfg.propagate_probability = yes;
        self
    }

    #[must_use]
    pub fn kernel_only(mut self, yes: bool) -> Self {
        self.cfg.kernel_only = yes;
        self
    }

    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.cfg
    }
}

/// Parses a minimal `key = value` configuration file, the same shape the
/// memory-spec and slab readers use, for the standalone driver binary.
pub fn parse_key_value(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (k, v) = l.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

pub fn require_key<'a>(
    pairs: &'a [(String, String)],
    key: &'static str,
) -> Result<&'a str, EngineError> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .ok_or(EngineError::Fatal(FatalError::IncompleteSpecs(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_worker_threads() {
        let cfg = EngineConfig::builder().worker_threads(99).build();
        assert_eq!(cfg.worker_threads, MAX_BUILDER_THREADS);
        let cfg = EngineConfig::builder().worker_threads(0).build();
        assert_eq!(cfg.worker_threads, 1);
    }

    #[test]
    fn key_value_parsing_skips_comments() {
        let parsed = parse_key_value("# comment\narch = x86_64\n\npage_offset=0xffff880000000000\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("arch".into(), "x86_64".into()));
    }
}
