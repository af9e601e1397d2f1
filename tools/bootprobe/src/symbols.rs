//! Kernel symbol table: name → address for breakpoints, address → name for
//! reporting where the target halted.

use std::collections::HashMap;
use std::path::Path;

use bootprobe_elf::{ElfError, ElfFile};

/// One code symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    addr: u64,
    size: u64,
    /// Demangled name without the trailing hash.
    name: String,
}

/// Symbols extracted from a kernel ELF.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Raw and demangled names to address.
    by_name: HashMap<String, u64>,
    /// Sorted by address.
    entries: Vec<Entry>,
}

impl SymbolTable {
    /// Read and index the symbols of the ELF file at `path`.
    pub fn load(path: &Path) -> Result<Self, String> {
        let data = std::fs::read(path).map_err(|e| e.to_string())?;
        let table = Self::from_elf(&data).map_err(|e| e.to_string())?;
        if table.is_empty() {
            return Err("image has no symbol table (stripped?)".into());
        }
        Ok(table)
    }

    /// Index the function symbols of an in-memory ELF image.
    pub fn from_elf(data: &[u8]) -> Result<Self, ElfError> {
        let elf = ElfFile::parse(data)?;
        let mut table = Self::default();
        for sym in elf.function_symbols() {
            let demangled = format!("{:#}", rustc_demangle::demangle(sym.name));
            table.by_name.entry(sym.name.to_owned()).or_insert(sym.value);
            table.by_name.entry(demangled.clone()).or_insert(sym.value);
            table.entries.push(Entry {
                addr: sym.value,
                size: sym.size,
                name: demangled,
            });
        }
        table.entries.sort_by_key(|e| e.addr);
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a breakpoint location to an address.
    ///
    /// Accepts, in order: a `0x`-prefixed address, an exact raw or demangled
    /// name, or a final path segment (`switch_context` for
    /// `kernel::sched::switch_context`) when exactly one symbol ends with it.
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        if let Some(hex) = symbol.strip_prefix("0x") {
            return u64::from_str_radix(hex, 16).ok();
        }
        if let Some(&addr) = self.by_name.get(symbol) {
            return Some(addr);
        }

        let suffix = format!("::{symbol}");
        let mut matches = self.entries.iter().filter(|e| e.name.ends_with(&suffix));
        let first = matches.next()?;
        if matches.any(|e| e.addr != first.addr) {
            return None;
        }
        Some(first.addr)
    }

    /// The name of the function containing `addr`, if any.
    pub fn name_at(&self, addr: u64) -> Option<&str> {
        self.entry_at(addr).map(|e| e.name.as_str())
    }

    /// `name+0xoff` or the bare address, for log lines. The offset is from
    /// the containing entry; instances of one generic share a name.
    pub fn describe(&self, addr: u64) -> String {
        match self.entry_at(addr) {
            Some(entry) if entry.addr == addr => format!("{} ({addr:#x})", entry.name),
            Some(entry) => format!("{}+{:#x} ({addr:#x})", entry.name, addr - entry.addr),
            None => format!("{addr:#x}"),
        }
    }

    fn entry_at(&self, addr: u64) -> Option<&Entry> {
        let idx = self.entries.partition_point(|e| e.addr <= addr);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        let offset = addr - entry.addr;
        if entry.size > 0 && offset >= entry.size {
            return None;
        }
        Some(entry)
    }
}
