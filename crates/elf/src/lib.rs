//! Minimal ELF64 symbol-table reader for bootprobe.
//!
//! Parses just enough of an ELF64 image (file header, section headers,
//! `.symtab` and its linked string table) to map kernel symbol names to
//! addresses. All field extraction is bounds-checked; malformed input yields
//! [`ElfError`] or an empty iterator, never a panic.
//!
//! # Usage
//!
//! ```
//! use bootprobe_elf::ElfFile;
//!
//! fn find(data: &[u8], name: &str) -> Option<u64> {
//!     let elf = ElfFile::parse(data).ok()?;
//!     elf.function_symbols().find(|s| s.name == name).map(|s| s.value)
//! }
//! ```

#![forbid(unsafe_code)]

pub mod header;
pub mod section;
#[cfg(any(test, feature = "test-util"))]
pub mod synth;

pub use header::{ElfError, ElfHeader};
pub use section::{
    NamedSymbol, SHN_UNDEF, SHT_STRTAB, SHT_SYMTAB, STT_FUNC, STT_NOTYPE, SectionHeader,
    StringTable, Symbol,
};

/// A parsed ELF64 image borrowing the raw file bytes.
#[derive(Debug, Clone, Copy)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: ElfHeader,
}

impl<'a> ElfFile<'a> {
    /// Parse and validate the file header of an ELF64 image.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if the magic, class, encoding or type is not
    /// supported, or the section header table lies outside `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = ElfHeader::parse(data)?;
        Ok(Self { data, header })
    }

    /// The parsed file header.
    #[must_use]
    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    /// The raw bytes this image was parsed from.
    #[must_use]
    pub fn raw_data(&self) -> &'a [u8] {
        self.data
    }
}
