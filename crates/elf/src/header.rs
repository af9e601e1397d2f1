//! ELF64 file header.

use core::fmt;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

/// Size of the ELF64 file header.
pub(crate) const EHDR_SIZE: usize = 64;

/// Size of one ELF64 section header.
pub(crate) const SHDR_SIZE: usize = 64;

/// Read `N` bytes at `off`, or `None` when out of bounds.
fn bytes<const N: usize>(data: &[u8], off: usize) -> Option<[u8; N]> {
    data.get(off..off.checked_add(N)?)?.try_into().ok()
}

pub(crate) fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    bytes(data, off).map(u16::from_le_bytes)
}

pub(crate) fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    bytes(data, off).map(u32::from_le_bytes)
}

pub(crate) fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    bytes(data, off).map(u64::from_le_bytes)
}

/// Reasons an image is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Missing `\x7fELF` magic.
    BadMagic,
    /// Not a 64-bit image.
    UnsupportedClass,
    /// Not little-endian.
    UnsupportedEncoding,
    /// Neither an executable nor a position-independent executable.
    UnsupportedType,
    /// Shorter than the file header.
    Truncated,
    /// The section header table does not fit in the file.
    InvalidOffset,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BadMagic => "not an ELF file (bad magic)",
            Self::UnsupportedClass => "unsupported ELF class (expected ELF64)",
            Self::UnsupportedEncoding => "unsupported ELF encoding (expected little-endian)",
            Self::UnsupportedType => "unsupported ELF type (expected ET_EXEC or ET_DYN)",
            Self::Truncated => "ELF data truncated",
            Self::InvalidOffset => "section header table out of bounds",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ElfError {}

/// The fields of the ELF64 file header that symbol lookup needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// `e_type`.
    pub kind: u16,
    /// `e_machine`.
    pub machine: u16,
    /// `e_entry`.
    pub entry: u64,
    /// `e_shoff`.
    pub shoff: u64,
    /// `e_shentsize`.
    pub shentsize: u16,
    /// `e_shnum`.
    pub shnum: u16,
    /// `e_shstrndx`.
    pub shstrndx: u16,
}

impl ElfHeader {
    /// Parse and validate the file header.
    ///
    /// # Errors
    ///
    /// See [`ElfError`].
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::UnsupportedClass);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEncoding);
        }

        // Length was checked above, so these reads cannot miss.
        let field16 = |off| read_u16(data, off).ok_or(ElfError::Truncated);
        let field64 = |off| read_u64(data, off).ok_or(ElfError::Truncated);

        let kind = field16(16)?;
        if kind != ET_EXEC && kind != ET_DYN {
            return Err(ElfError::UnsupportedType);
        }

        let header = Self {
            kind,
            machine: field16(18)?,
            entry: field64(24)?,
            shoff: field64(40)?,
            shentsize: field16(58)?,
            shnum: field16(60)?,
            shstrndx: field16(62)?,
        };

        if header.shnum > 0 {
            if usize::from(header.shentsize) < SHDR_SIZE {
                return Err(ElfError::InvalidOffset);
            }
            let end = u64::from(header.shnum)
                .checked_mul(u64::from(header.shentsize))
                .and_then(|len| header.shoff.checked_add(len))
                .ok_or(ElfError::InvalidOffset)?;
            if end > data.len() as u64 {
                return Err(ElfError::InvalidOffset);
            }
        }

        Ok(header)
    }
}
