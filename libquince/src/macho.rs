//! Type aliases onto the `object` crate's raw Mach-O definitions plus small
//! helpers over them. We only deal with 64-bit little-endian objects; both
//! supported cputypes are little-endian, so the endianness is fixed here the
//! same way it is for the rest of the crate.

use crate::error::Result;
use anyhow::anyhow;
use object::LittleEndian;

pub(crate) type MachHeader = object::macho::MachHeader64<LittleEndian>;
pub(crate) type Section = object::macho::Section64<LittleEndian>;
pub(crate) type Nlist = object::macho::Nlist64<LittleEndian>;
pub(crate) type Reloc = object::macho::Relocation<LittleEndian>;
pub(crate) type DataInCodeEntry = object::macho::DataInCodeEntry<LittleEndian>;

/// Builds an owned symbol record. The splitter synthesizes these for
/// sections without a leading symbol, and the linker for its own atoms.
pub(crate) fn make_nlist(n_strx: u32, n_type: u8, n_sect: u8, n_desc: u16, n_value: u64) -> Nlist {
    Nlist {
        n_strx: object::U32::new(LittleEndian, n_strx),
        n_type,
        n_sect,
        n_desc: object::U16::new(LittleEndian, n_desc),
        n_value: object::U64Bytes::new(LittleEndian, n_value),
    }
}

/// Predicates over symbol records, mirroring the n_type bitfield. Stabs are
/// never "defined" or "undefined" for our purposes, whatever their type bits
/// happen to look like.
pub(crate) trait NlistExt {
    fn is_stab(&self) -> bool;
    fn sect(&self) -> bool;
    fn ext(&self) -> bool;
    fn undf(&self) -> bool;
    fn value(&self) -> u64;
}

impl NlistExt for Nlist {
    fn is_stab(&self) -> bool {
        self.n_type & object::macho::N_STAB != 0
    }

    fn sect(&self) -> bool {
        !self.is_stab() && self.n_type & object::macho::N_TYPE == object::macho::N_SECT
    }

    fn ext(&self) -> bool {
        !self.is_stab() && self.n_type & object::macho::N_EXT != 0
    }

    fn undf(&self) -> bool {
        !self.is_stab() && self.n_type & object::macho::N_TYPE == object::macho::N_UNDF
    }

    fn value(&self) -> u64 {
        self.n_value.get(LittleEndian)
    }
}

pub(crate) fn section_type(flags: u32) -> u32 {
    flags & object::macho::SECTION_TYPE
}

pub(crate) fn is_zerofill(sect: &Section) -> bool {
    matches!(
        section_type(sect.flags.get(LittleEndian)),
        object::macho::S_ZEROFILL | object::macho::S_THREAD_LOCAL_ZEROFILL
    )
}

pub(crate) fn sect_name(sect: &Section) -> &[u8] {
    trim_name(&sect.sectname)
}

pub(crate) fn seg_name(sect: &Section) -> &[u8] {
    trim_name(&sect.segname)
}

fn trim_name(name: &[u8; 16]) -> &[u8] {
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..len]
}

/// Pads a segment or section name out to the fixed 16-byte on-disk form.
pub(crate) fn pad_name(name: &[u8]) -> [u8; 16] {
    debug_assert!(name.len() <= 16);
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}

/// The NUL-terminated string at `offset` in a string table. Offset 0 is the
/// conventional empty name.
pub(crate) fn string_at(strtab: &[u8], offset: u32) -> &[u8] {
    let rest = strtab.get(offset as usize..).unwrap_or(&[]);
    let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    &rest[..len]
}

/// Casts `count` records of `T` out of `data` starting at `offset`.
pub(crate) fn pod_slice<T: object::pod::Pod>(
    data: &[u8],
    offset: u64,
    count: usize,
) -> Result<&[T]> {
    let bytes = data
        .get(offset as usize..)
        .ok_or_else(|| anyhow!("file offset 0x{offset:x} out of bounds"))?;
    let (slice, _) = object::pod::slice_from_bytes(bytes, count)
        .map_err(|()| anyhow!("malformed record table at file offset 0x{offset:x}"))?;
    Ok(slice)
}

pub(crate) fn align_forward(value: u64, align_pow2: u32) -> u64 {
    let align = 1u64 << align_pow2;
    (value + align - 1) & !(align - 1)
}
