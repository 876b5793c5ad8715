//! Memory specification: the fixed offsets and locations describing how a
//! particular kernel build lays out virtual memory.

use hashbrown::HashMap;

use crate::config::{parse_key_value, Arch};
use crate::error::{EngineError, FatalError};

/// The kernel version quadruple, `struct new_utsname` in Linux terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelVersion {
    pub sysname: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

/// All fields required to translate addresses for one kernel build.
#[derive(Debug, Clone)]
pub struct MemSpecs {
    pub page_offset: u64,
    pub vmalloc_start: u64,
    pub vmalloc_end: u64,
    pub vmalloc_offset: u64,
    pub vmemmap_start: u64,
    pub vmemmap_end: u64,
    pub modules_vaddr: u64,
    pub modules_end: u64,
    pub start_kernel_map: u64,
    /// `init_level4_pgt` on x86_64, `swapper_pg_dir` on 32-bit.
    pub page_table_root: u64,
    pub high_memory: u64,
    pub vmalloc_early_reserve: u64,
    pub list_poison_1: u64,
    pub list_poison_2: u64,
    pub max_errno: i32,
    pub sizeof_long: u32,
    pub sizeof_pointer: u32,
    pub arch: Arch,
    pub version: KernelVersion,
    /// Name -> virtual address, as provided by the symbol map.
    pub symbol_map: HashMap<String, u64>,
}

const REQUIRED_KEYS: &[&str] = &[
    "page_offset",
    "vmalloc_start",
    "vmalloc_end",
    "vmalloc_offset",
    "vmemmap_start",
    "vmemmap_end",
    "modules_vaddr",
    "modules_end",
    "start_kernel_map",
    "arch",
];

fn parse_hex_or_dec(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl MemSpecs {
    /// Parses a `key = value` memory specification. Missing required keys
    /// fail with `incomplete_specs`; everything else defaults to zero so
    /// readers tolerate specs written for an earlier engine version.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let pairs = parse_key_value(text);
        for key in REQUIRED_KEYS {
            if !pairs.iter().any(|(k, _)| k == key) {
                return Err(EngineError::Fatal(FatalError::IncompleteSpecs(key)));
            }
        }
        let get_hex = |key: &'static str| -> Result<u64, EngineError> {
            let raw = pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .ok_or(EngineError::Fatal(FatalError::IncompleteSpecs(key)))?;
            parse_hex_or_dec(raw).ok_or(EngineError::Fatal(FatalError::IncompleteSpecs(key)))
        };
        let get_opt_hex = |key: &'static str| -> u64 {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| parse_hex_or_dec(v))
                .unwrap_or(0)
        };
        let arch_str = pairs
            .iter()
            .find(|(k, _)| k == "arch")
            .map(|(_, v)| v.as_str())
            .unwrap_or("x86_64");
        let arch = match arch_str {
            "x86" => Arch::X86,
            "x86-PAE" | "x86_pae" => Arch::X86Pae,
            _ => Arch::X86_64,
        };
        let mut symbol_map = HashMap::new();
        for (k, v) in &pairs {
            if let Some(name) = k.strip_prefix("symbol.") {
                if let Some(addr) = parse_hex_or_dec(v) {
                    symbol_map.insert(name.to_string(), addr);
                }
            }
        }
        let get_str = |key: &'static str| -> String {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        Ok(Self {
            page_offset: get_hex("page_offset")?,
            vmalloc_start: get_hex("vmalloc_start")?,
            vmalloc_end: get_hex("vmalloc_end")?,
            vmalloc_offset: get_opt_hex("vmalloc_offset"),
            vmemmap_start: get_hex("vmemmap_start")?,
            vmemmap_end: get_hex("vmemmap_end")?,
            modules_vaddr: get_hex("modules_vaddr")?,
            modules_end: get_hex("modules_end")?,
            start_kernel_map: get_hex("start_kernel_map")?,
            page_table_root: get_opt_hex("init_level4_pgt").max(get_opt_hex("swapper_pg_dir")),
            high_memory: get_opt_hex("high_memory"),
            vmalloc_early_reserve: get_opt_hex("vmalloc_early_reserve"),
            list_poison_1: get_opt_hex("list_poison_1"),
            list_poison_2: get_opt_hex("list_poison_2"),
            max_errno: i32::try_from(get_opt_hex("max_errno")).unwrap_or(4095),
            sizeof_long: u32::try_from(get_opt_hex("sizeof_long")).unwrap_or(8),
            sizeof_pointer: u32::try_from(get_opt_hex("sizeof_pointer")).unwrap_or(8),
            arch,
            version: KernelVersion {
                sysname: get_str("sysname"),
                release: get_str("release"),
                version: get_str("version"),
                machine: get_str("machine"),
            },
            symbol_map,
        })
    }

    /// The address of the last byte of the virtual address space.
    #[must_use]
    pub fn vaddr_space_end(&self) -> u64 {
        match self.arch {
            Arch::X86 | Arch::X86Pae => 0xFFFF_FFFF,
            Arch::X86_64 => u64::MAX,
        }
    }

    /// Whether `vaddr` lies in the kernel half of the address space.
    #[must_use]
    pub fn is_kernel_address(&self, vaddr: u64) -> bool {
        match self.arch {
            Arch::X86 | Arch::X86Pae => vaddr >= self.page_offset,
            Arch::X86_64 => vaddr >= 0xFFFF_8000_0000_0000,
        }
    }
}
