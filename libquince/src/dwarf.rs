//! Best-effort DWARF consumption. We only pull out what stab emission needs:
//! the compile unit's name and directory, and the PC ranges of its functions.
//! Anything malformed is reported and skipped; objects without debug info are
//! common and fine.

use crate::error::Result;
use gimli::{AttributeValue, EndianSlice};

/// The `__DWARF,__debug_*` section contents of one object, zero-copy.
#[derive(Default, Clone, Copy)]
pub(crate) struct DwarfSections<'data> {
    pub(crate) debug_info: &'data [u8],
    pub(crate) debug_abbrev: &'data [u8],
    pub(crate) debug_str: &'data [u8],
    pub(crate) debug_line: &'data [u8],
    pub(crate) debug_ranges: &'data [u8],
    pub(crate) debug_loc: &'data [u8],
}

impl<'data> DwarfSections<'data> {
    fn slice(&self, id: gimli::SectionId) -> &'data [u8] {
        match id {
            gimli::SectionId::DebugInfo => self.debug_info,
            gimli::SectionId::DebugAbbrev => self.debug_abbrev,
            gimli::SectionId::DebugStr => self.debug_str,
            gimli::SectionId::DebugLine => self.debug_line,
            gimli::SectionId::DebugRanges => self.debug_ranges,
            gimli::SectionId::DebugLoc => self.debug_loc,
            _ => &[],
        }
    }
}

/// What stab emission downstream needs to know about an object's compile
/// unit.
#[derive(Debug, Clone, Copy)]
pub struct CompileUnitInfo<'a> {
    pub name: Option<&'a str>,
    pub comp_dir: Option<&'a str>,
    /// The object file's stat mtime, emitted in the OSO stab.
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FunctionRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

pub(crate) struct DebugInfo {
    pub(crate) compile_unit_name: Option<String>,
    pub(crate) compile_unit_dir: Option<String>,
    pub(crate) mtime: u64,
    /// Subprogram PC ranges, sorted by start address.
    funcs: Vec<FunctionRange>,
}

impl DebugInfo {
    pub(crate) fn parse(sections: &DwarfSections<'_>, mtime: u64) -> Result<Option<DebugInfo>> {
        if sections.debug_info.is_empty() {
            return Ok(None);
        }
        let dwarf = gimli::Dwarf::load(|id| {
            Ok::<_, gimli::Error>(EndianSlice::new(sections.slice(id), gimli::LittleEndian))
        })?;

        let mut compile_unit_name = None;
        let mut compile_unit_dir = None;
        let mut funcs = Vec::new();

        let mut units = dwarf.units();
        if let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                match entry.tag() {
                    gimli::DW_TAG_compile_unit => {
                        if let Some(value) = entry.attr_value(gimli::DW_AT_name)? {
                            let s = dwarf.attr_string(&unit, value)?;
                            compile_unit_name = Some(s.to_string_lossy().into_owned());
                        }
                        if let Some(value) = entry.attr_value(gimli::DW_AT_comp_dir)? {
                            let s = dwarf.attr_string(&unit, value)?;
                            compile_unit_dir = Some(s.to_string_lossy().into_owned());
                        }
                    }
                    gimli::DW_TAG_subprogram => {
                        let Some(AttributeValue::Addr(start)) =
                            entry.attr_value(gimli::DW_AT_low_pc)?
                        else {
                            continue;
                        };
                        let end = match entry.attr_value(gimli::DW_AT_high_pc)? {
                            Some(AttributeValue::Addr(addr)) => addr,
                            Some(other) => match other.udata_value() {
                                Some(size) => start + size,
                                None => continue,
                            },
                            None => continue,
                        };
                        funcs.push(FunctionRange { start, end });
                    }
                    _ => {}
                }
            }
        }

        funcs.sort_by_key(|f| f.start);
        Ok(Some(DebugInfo {
            compile_unit_name,
            compile_unit_dir,
            mtime,
            funcs,
        }))
    }

    /// The function whose PC range covers `addr`, if any.
    pub(crate) fn function_covering(&self, addr: u64) -> Option<FunctionRange> {
        let idx = self.funcs.partition_point(|f| f.start <= addr);
        let candidate = self.funcs.get(idx.checked_sub(1)?)?;
        (addr < candidate.end).then_some(*candidate)
    }
}
