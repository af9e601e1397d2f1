//! Section headers, string tables and symbol tables.

use crate::ElfFile;
use crate::header::{SHDR_SIZE, read_u16, read_u32, read_u64};

/// Section type: symbol table.
pub const SHT_SYMTAB: u32 = 2;

/// Section type: string table.
pub const SHT_STRTAB: u32 = 3;

/// Symbol type: unspecified (labels defined in assembly).
pub const STT_NOTYPE: u8 = 0;

/// Symbol type: function.
pub const STT_FUNC: u8 = 2;

/// Section index of undefined symbols.
pub const SHN_UNDEF: u16 = 0;

const SYM_SIZE: usize = 24;

/// One section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Offset of the name in the section-name string table.
    pub name: u32,
    /// `sh_type`.
    pub kind: u32,
    /// File offset of the section contents.
    pub offset: u64,
    /// Size of the section contents.
    pub size: u64,
    /// `sh_link`; for symbol tables, the index of the name string table.
    pub link: u32,
}

impl SectionHeader {
    fn parse(data: &[u8], off: usize) -> Option<Self> {
        Some(Self {
            name: read_u32(data, off)?,
            kind: read_u32(data, off + 4)?,
            offset: read_u64(data, off + 24)?,
            size: read_u64(data, off + 32)?,
            link: read_u32(data, off + 40)?,
        })
    }
}

/// One symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Offset of the name in the linked string table.
    pub name: u32,
    /// Packed type and binding.
    pub info: u8,
    /// Defining section index.
    pub shndx: u16,
    /// Symbol value; the virtual address for defined code symbols.
    pub value: u64,
    /// Size in bytes (0 when unknown).
    pub size: u64,
}

impl Symbol {
    fn parse(data: &[u8], off: usize) -> Option<Self> {
        Some(Self {
            name: read_u32(data, off)?,
            info: *data.get(off + 4)?,
            shndx: read_u16(data, off + 6)?,
            value: read_u64(data, off + 8)?,
            size: read_u64(data, off + 16)?,
        })
    }

    /// Symbol type (low nibble of `st_info`).
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.info & 0xf
    }

    /// Whether the symbol is defined in this image at a non-zero address.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF && self.value != 0
    }
}

/// A NUL-separated string table.
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a> {
    data: &'a [u8],
}

impl<'a> StringTable<'a> {
    /// Wrap raw string table contents.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// The string starting at `offset`, if terminated and valid UTF-8.
    #[must_use]
    pub fn get(&self, offset: u32) -> Option<&'a str> {
        let rest = self.data.get(offset as usize..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&rest[..end]).ok()
    }
}

/// A defined code symbol with its name resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedSymbol<'a> {
    /// Raw (possibly mangled) symbol name.
    pub name: &'a str,
    /// Virtual address.
    pub value: u64,
    /// Size in bytes (0 when unknown).
    pub size: u64,
}

impl<'a> ElfFile<'a> {
    /// Iterate over all section headers.
    pub fn sections(&self) -> impl Iterator<Item = SectionHeader> + use<'a> {
        let data = self.raw_data();
        let header = *self.header();
        (0..usize::from(header.shnum)).map_while(move |index| {
            let off = usize::try_from(header.shoff).ok()?
                + index * usize::from(header.shentsize).max(SHDR_SIZE);
            SectionHeader::parse(data, off)
        })
    }

    /// The section at `index`, if present.
    #[must_use]
    pub fn section(&self, index: usize) -> Option<SectionHeader> {
        self.sections().nth(index)
    }

    /// The first section of the given type.
    #[must_use]
    pub fn find_section_by_type(&self, kind: u32) -> Option<SectionHeader> {
        self.sections().find(|s| s.kind == kind)
    }

    /// The contents of a section, if they lie within the file.
    #[must_use]
    pub fn section_data(&self, section: &SectionHeader) -> Option<&'a [u8]> {
        let start = usize::try_from(section.offset).ok()?;
        let len = usize::try_from(section.size).ok()?;
        self.raw_data().get(start..start.checked_add(len)?)
    }

    /// The string table a symbol table links to.
    #[must_use]
    pub fn linked_strtab(&self, symtab: &SectionHeader) -> Option<StringTable<'a>> {
        let strtab = self.section(symtab.link as usize)?;
        if strtab.kind != SHT_STRTAB {
            return None;
        }
        Some(StringTable::new(self.section_data(&strtab)?))
    }

    /// Iterate over the raw entries of a symbol table section.
    pub fn symbols(&self, symtab: &SectionHeader) -> impl Iterator<Item = Symbol> + use<'a> {
        let table = self.section_data(symtab).unwrap_or_default();
        table
            .chunks_exact(SYM_SIZE)
            .filter_map(|entry| Symbol::parse(entry, 0))
    }

    /// Iterate over defined function and untyped symbols of `.symtab` with
    /// their names resolved.
    ///
    /// Untyped symbols are included because entry points written in assembly
    /// (`global_asm!` labels) carry `STT_NOTYPE`. Yields nothing for stripped
    /// images.
    pub fn function_symbols(&self) -> impl Iterator<Item = NamedSymbol<'a>> + use<'a> {
        let found = self
            .find_section_by_type(SHT_SYMTAB)
            .and_then(|symtab| Some((symtab, self.linked_strtab(&symtab)?)));
        let elf = *self;
        found.into_iter().flat_map(move |(symtab, strtab)| {
            elf.symbols(&symtab).filter_map(move |sym| {
                if !sym.is_defined() || !matches!(sym.kind(), STT_FUNC | STT_NOTYPE) {
                    return None;
                }
                let name = strtab.get(sym.name).filter(|n| !n.is_empty())?;
                Some(NamedSymbol {
                    name,
                    value: sym.value,
                    size: sym.size,
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SymtabImage;

    fn image() -> Vec<u8> {
        SymtabImage::new()
            .function("boot_complete", 0xffff_8000_0010_2000, 0x10)
            .function("_ZN6kernel5sched14switch_context17h0123456789abcdefE", 0xffff_8000_0010_3000, 0x80)
            .build()
    }

    #[test]
    fn sections_are_listed_in_order() {
        let data = image();
        let elf = ElfFile::parse(&data).unwrap();
        let kinds: Vec<u32> = elf.sections().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![0, SHT_STRTAB, SHT_SYMTAB, SHT_STRTAB]);
    }

    #[test]
    fn symbol_table_found_by_type() {
        let data = image();
        let elf = ElfFile::parse(&data).unwrap();
        let symtab = elf.find_section_by_type(SHT_SYMTAB).unwrap();
        assert_eq!(elf.linked_strtab(&symtab).and_then(|t| t.get(1)), Some("boot_complete"));
        let stripped = SymtabImage::new().stripped().build();
        assert!(ElfFile::parse(&stripped).unwrap().find_section_by_type(SHT_SYMTAB).is_none());
    }

    #[test]
    fn function_symbols_resolve_names() {
        let data = image();
        let elf = ElfFile::parse(&data).unwrap();
        let syms: Vec<_> = elf.function_symbols().collect();
        assert_eq!(syms.len(), 2);
        assert_eq!(syms[0].name, "boot_complete");
        assert_eq!(syms[0].value, 0xffff_8000_0010_2000);
        assert_eq!(syms[0].size, 0x10);
    }

    #[test]
    fn null_symbol_is_skipped() {
        let data = image();
        let elf = ElfFile::parse(&data).unwrap();
        let symtab = elf.find_section_by_type(SHT_SYMTAB).unwrap();
        // The null entry is present in the raw table but never named.
        assert_eq!(elf.symbols(&symtab).count(), 3);
        assert!(elf.function_symbols().all(|s| !s.name.is_empty()));
    }

    #[test]
    fn stripped_image_has_no_symbols() {
        let data = SymtabImage::new().stripped().build();
        let elf = ElfFile::parse(&data).unwrap();
        assert_eq!(elf.function_symbols().count(), 0);
    }

    #[test]
    fn string_table_requires_terminator() {
        let table = StringTable::new(b"\0abc");
        assert_eq!(table.get(0), Some(""));
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(64), None);
    }
}
