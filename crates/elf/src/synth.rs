//! Writer for tiny symbol-only ELF64 images.
//!
//! Produces an `ET_EXEC` x86-64 image with no program headers and the
//! sections `NULL`, `.strtab`, `.symtab`, `.shstrtab`. Only meant for tests
//! that need a kernel-shaped symbol table without a toolchain.

use crate::header::{EHDR_SIZE, SHDR_SIZE};
use crate::section::{SHT_STRTAB, SHT_SYMTAB, STT_FUNC};

const STB_GLOBAL: u8 = 1;
const EM_X86_64: u16 = 62;

/// Builder for a synthetic image.
#[derive(Debug, Default, Clone)]
pub struct SymtabImage {
    functions: Vec<(String, u64, u64)>,
    stripped: bool,
}

impl SymtabImage {
    /// An image with an empty symbol table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global function symbol.
    #[must_use]
    pub fn function(mut self, name: &str, addr: u64, size: u64) -> Self {
        self.functions.push((name.to_owned(), addr, size));
        self
    }

    /// Omit `.symtab` and `.strtab` entirely.
    #[must_use]
    pub fn stripped(mut self) -> Self {
        self.stripped = true;
        self
    }

    /// Serialize the image.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 24];
        for (name, addr, size) in &self.functions {
            let name_off = u32::try_from(strtab.len()).unwrap_or(0);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);

            let mut sym = [0u8; 24];
            sym[0..4].copy_from_slice(&name_off.to_le_bytes());
            sym[4] = (STB_GLOBAL << 4) | STT_FUNC;
            sym[6..8].copy_from_slice(&1u16.to_le_bytes());
            sym[8..16].copy_from_slice(&addr.to_le_bytes());
            sym[16..24].copy_from_slice(&size.to_le_bytes());
            symtab.extend_from_slice(&sym);
        }

        // ".strtab" at 1, ".symtab" at 9, ".shstrtab" at 17.
        let shstrtab: &[u8] = b"\0.strtab\0.symtab\0.shstrtab\0";

        // (name, type, contents, link)
        let empty: &[u8] = &[];
        let sections: Vec<(u32, u32, &[u8], u32)> = if self.stripped {
            vec![(0, 0, empty, 0), (17, SHT_STRTAB, shstrtab, 0)]
        } else {
            vec![
                (0, 0, empty, 0),
                (1, SHT_STRTAB, strtab.as_slice(), 0),
                (9, SHT_SYMTAB, symtab.as_slice(), 1),
                (17, SHT_STRTAB, shstrtab, 0),
            ]
        };

        let mut out = vec![0u8; EHDR_SIZE];
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&2u16.to_le_bytes());
        out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&0x0010_0000u64.to_le_bytes());
        out[40..48].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out[60..62].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        out[62..64].copy_from_slice(&((sections.len() - 1) as u16).to_le_bytes());

        let mut data_off = (EHDR_SIZE + sections.len() * SHDR_SIZE) as u64;
        for &(name, kind, contents, link) in &sections {
            let mut shdr = [0u8; SHDR_SIZE];
            shdr[0..4].copy_from_slice(&name.to_le_bytes());
            shdr[4..8].copy_from_slice(&kind.to_le_bytes());
            if kind != 0 {
                shdr[24..32].copy_from_slice(&data_off.to_le_bytes());
                shdr[32..40].copy_from_slice(&(contents.len() as u64).to_le_bytes());
            }
            shdr[40..44].copy_from_slice(&link.to_le_bytes());
            if kind == SHT_SYMTAB {
                shdr[56..64].copy_from_slice(&24u64.to_le_bytes());
            }
            out.extend_from_slice(&shdr);
            data_off += contents.len() as u64;
        }
        for &(_, _, contents, _) in &sections {
            out.extend_from_slice(contents);
        }
        out
    }
}
