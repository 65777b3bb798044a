//! Parsing of one relocatable object and the splitter that cleaves its
//! sections into atoms. When `MH_SUBSECTIONS_VIA_SYMBOLS` permits it, every
//! run of symbols sharing an address becomes its own atom; otherwise a
//! section travels as a single atom.

use crate::arch::Architecture;
use crate::atom::{Atom, AtomId, Dice, InnerSymbol, Stab};
use crate::dwarf::{DebugInfo, DwarfSections};
use crate::error::{LinkError, Result};
use crate::layout::MatchingSection;
use crate::macho::{
    is_zerofill, make_nlist, pod_slice, sect_name, seg_name, string_at, DataInCodeEntry,
    MachHeader, Nlist, NlistExt as _, Reloc, Section,
};
use crate::reloc::RelocContext;
use crate::Linker;
use anyhow::{anyhow, Context as _};
use hashbrown::HashMap;
use itertools::Itertools as _;
use object::read::macho::{LoadCommandVariant, MachHeader as _, Segment as _};
use object::LittleEndian;

pub(crate) struct Object<'data> {
    pub(crate) name: String,
    pub(crate) data: &'data [u8],
    pub(crate) header_flags: u32,
    pub(crate) sections: Vec<Section>,
    pub(crate) text_section_index: Option<usize>,
    /// Owned so synthesized section symbols can be appended and addresses
    /// assigned in place.
    pub(crate) symtab: Vec<Nlist>,
    pub(crate) strtab: &'data [u8],
    pub(crate) data_in_code: &'data [DataInCodeEntry],
    pub(crate) debug_info: Option<DebugInfo>,
    /// Symbol indices ordered defined-first-by-address. Compensates for
    /// compilers that emit unsorted symbol tables; stabs are left out.
    pub(crate) sorted_symbols: Vec<u32>,
    /// How many leading entries of `sorted_symbols` are defined.
    pub(crate) num_sorted_defined: usize,
    /// 1-based input section ordinal -> synthesized section symbol.
    pub(crate) sections_as_symbols: HashMap<u8, u32>,
    pub(crate) atom_by_index_table: HashMap<u32, AtomId>,
    pub(crate) managed_atoms: Vec<AtomId>,
}

impl<'data> Object<'data> {
    pub(crate) fn parse(
        name: String,
        mtime: u64,
        file_data: &'data [u8],
        file_offset: u64,
        target: Architecture,
    ) -> Result<Object<'data>> {
        // For members of universal wrappers, slice at the member offset so
        // every recorded file offset is relative to the object's own start.
        let data = file_data
            .get(file_offset as usize..)
            .ok_or_else(|| anyhow!("{name}: file offset 0x{file_offset:x} out of bounds"))?;

        let header =
            MachHeader::parse(data, 0).map_err(|_| anyhow!(LinkError::NotObject).context(name.clone()))?;
        let endian = header.endian()?;
        if header.filetype(endian) != object::macho::MH_OBJECT {
            return Err(anyhow!(LinkError::NotObject).context(name));
        }
        let arch = Architecture::try_from(header.cputype(endian)).context(name.clone())?;
        if arch != target {
            return Err(anyhow!(LinkError::MismatchedCpuArchitecture {
                expected: target,
                found: arch,
            })
            .context(name));
        }

        let mut sections = Vec::new();
        let mut text_section_index = None;
        let mut symtab = Vec::new();
        let mut strtab: &[u8] = &[];
        let mut data_in_code: &[DataInCodeEntry] = &[];
        let mut iundefsym = None;
        let mut dwarf = DwarfSections::default();

        let mut commands = header.load_commands(endian, data, 0)?;
        while let Some(command) = commands.next()? {
            match command.variant()? {
                LoadCommandVariant::Segment64(segment, section_data) => {
                    for sect in segment.sections(endian, section_data)? {
                        let index = sections.len();
                        sections.push(*sect);
                        match (seg_name(sect), sect_name(sect)) {
                            (b"__TEXT", b"__text") => text_section_index = Some(index),
                            (b"__DWARF", dbg_name) => {
                                let bytes = section_bytes(data, sect)?;
                                match dbg_name {
                                    b"__debug_info" => dwarf.debug_info = bytes,
                                    b"__debug_abbrev" => dwarf.debug_abbrev = bytes,
                                    b"__debug_str" => dwarf.debug_str = bytes,
                                    b"__debug_line" => dwarf.debug_line = bytes,
                                    b"__debug_ranges" => dwarf.debug_ranges = bytes,
                                    b"__debug_loc" => dwarf.debug_loc = bytes,
                                    _ => {}
                                }
                            }
                            _ => {}
                        }
                    }
                }
                LoadCommandVariant::Symtab(cmd) => {
                    let nsyms = cmd.nsyms.get(endian) as usize;
                    let syms: &[Nlist] = pod_slice(data, cmd.symoff.get(endian).into(), nsyms)
                        .context("reading symbol table")?;
                    symtab = syms.to_vec();
                    let stroff = cmd.stroff.get(endian) as usize;
                    let strsize = cmd.strsize.get(endian) as usize;
                    strtab = data
                        .get(stroff..stroff + strsize)
                        .ok_or_else(|| anyhow!("string table out of bounds"))?;
                }
                LoadCommandVariant::Dysymtab(cmd) => {
                    iundefsym = Some(cmd.iundefsym.get(endian) as usize);
                }
                LoadCommandVariant::LinkeditData(cmd)
                    if command.cmd() == object::macho::LC_DATA_IN_CODE =>
                {
                    let count = cmd.datasize.get(endian) as usize / 8;
                    data_in_code = pod_slice(data, cmd.dataoff.get(endian).into(), count)
                        .context("reading data-in-code table")?;
                }
                LoadCommandVariant::BuildVersion(_) => {}
                _ => {
                    tracing::debug!(cmd = command.cmd(), "ignoring load command");
                }
            }
        }

        let debug_info = match DebugInfo::parse(&dwarf, mtime) {
            Ok(debug_info) => debug_info,
            Err(err) => {
                tracing::warn!("{name}: skipping malformed debug info: {err:#}");
                None
            }
        };

        let (sorted_symbols, num_sorted_defined) = sort_symbols(&symtab, iundefsym);

        Ok(Object {
            name,
            data,
            header_flags: header.flags(endian),
            sections,
            text_section_index,
            symtab,
            strtab,
            data_in_code,
            debug_info,
            sorted_symbols,
            num_sorted_defined,
            sections_as_symbols: HashMap::new(),
            atom_by_index_table: HashMap::new(),
            managed_atoms: Vec::new(),
        })
    }

    pub(crate) fn symbol_name(&self, sym_index: u32) -> &'data [u8] {
        string_at(
            self.strtab,
            self.symtab[sym_index as usize].n_strx.get(LittleEndian),
        )
    }

    /// Indices (into `sorted_symbols`) of the defined symbols whose address
    /// falls within `[start, end)`.
    pub(crate) fn filter_symbols_by_address(&self, start: u64, end: u64) -> (usize, usize) {
        let defined = &self.sorted_symbols[..self.num_sorted_defined];
        let first = find_first(defined, |&i| self.symtab[i as usize].value() >= start);
        let last = find_first(defined, |&i| self.symtab[i as usize].value() >= end);
        (first, last)
    }
}

fn section_bytes<'data>(data: &'data [u8], sect: &Section) -> Result<&'data [u8]> {
    let offset = sect.offset.get(LittleEndian) as usize;
    let size = sect.size.get(LittleEndian) as usize;
    data.get(offset..offset + size)
        .ok_or_else(|| anyhow!("section contents out of bounds"))
}

/// First index for which `pred` holds, assuming `pred` is monotone over the
/// slice. `items.len()` if it never holds.
pub(crate) fn find_first<T>(items: &[T], pred: impl Fn(&T) -> bool) -> usize {
    items.partition_point(|item| !pred(item))
}

/// Total order: defined symbols first, by ascending address; undefined after
/// in their original order.
fn sort_symbols(symtab: &[Nlist], iundefsym: Option<usize>) -> (Vec<u32>, usize) {
    let mut sorted: Vec<u32> = (0..symtab.len() as u32)
        .filter(|&i| !symtab[i as usize].is_stab())
        .collect();
    sorted.sort_by(|&a, &b| {
        let (sa, sb) = (&symtab[a as usize], &symtab[b as usize]);
        sb.sect()
            .cmp(&sa.sect())
            .then_with(|| match (sa.sect(), sb.sect()) {
                (true, true) => sa.value().cmp(&sb.value()),
                _ => std::cmp::Ordering::Equal,
            })
    });
    let num_defined = match iundefsym {
        Some(i) => i.min(sorted.len()),
        None => {
            // No DYSYMTAB: scan back from the end until a defined symbol.
            let mut end = sorted.len();
            while end > 0 && !symtab[sorted[end - 1] as usize].sect() {
                end -= 1;
            }
            end
        }
    };
    (sorted, num_defined)
}

/// Relocations are emitted with descending `r_address`; this returns the
/// entries whose address falls within `[start, end)`.
pub(crate) fn filter_relocs(relocs: &[Reloc], start: u64, end: u64) -> &[Reloc] {
    let first = find_first(relocs, |r| {
        u64::from(r.info(LittleEndian).r_address) < end
    });
    let last = find_first(relocs, |r| {
        u64::from(r.info(LittleEndian).r_address) < start
    });
    &relocs[first..last]
}

/// Data-in-code entries are sorted by ascending offset; this returns the
/// entries whose offset falls within `[start, end)`.
pub(crate) fn filter_dice(dices: &[DataInCodeEntry], start: u64, end: u64) -> &[DataInCodeEntry] {
    let first = find_first(dices, |d| u64::from(d.offset.get(LittleEndian)) >= start);
    let last = find_first(dices, |d| u64::from(d.offset.get(LittleEndian)) >= end);
    &dices[first..last]
}

impl<'data> Linker<'data> {
    /// Splits every section of the object into atoms and hands them to their
    /// output sections.
    pub fn split_into_atoms(&mut self, object_index: u32) -> Result {
        let oi = object_index as usize;
        let subsections_via_symbols = self.objects[oi].header_flags
            & object::macho::MH_SUBSECTIONS_VIA_SYMBOLS
            != 0
            && (self.args.optimize != crate::args::OptLevel::Debug || self.args.gc_sections);

        for sect_index in 0..self.objects[oi].sections.len() {
            let sect = self.objects[oi].sections[sect_index];
            let Some(matching) = self.get_matching_section(&sect) else {
                tracing::debug!(
                    "{}: unhandled section {},{}",
                    self.objects[oi].name,
                    String::from_utf8_lossy(seg_name(&sect)),
                    String::from_utf8_lossy(sect_name(&sect)),
                );
                continue;
            };
            self.split_section_into_atoms(oi, sect_index, matching, subsections_via_symbols)
                .with_context(|| {
                    format!(
                        "{}: splitting section {},{}",
                        self.objects[oi].name,
                        String::from_utf8_lossy(seg_name(&sect)),
                        String::from_utf8_lossy(sect_name(&sect)),
                    )
                })?;
        }
        Ok(())
    }

    fn split_section_into_atoms(
        &mut self,
        oi: usize,
        sect_index: usize,
        matching: MatchingSection,
        subsections_via_symbols: bool,
    ) -> Result {
        let sect = self.objects[oi].sections[sect_index];
        let sect_addr = sect.addr.get(LittleEndian);
        let sect_size = sect.size.get(LittleEndian);
        let sect_align = sect.align.get(LittleEndian);
        let data = self.objects[oi].data;

        let code: &'data [u8] = if is_zerofill(&sect) {
            &[]
        } else {
            section_bytes(data, &sect)?
        };
        let relocs: &'data [Reloc] = pod_slice(
            data,
            sect.reloff.get(LittleEndian).into(),
            sect.nreloc.get(LittleEndian) as usize,
        )
        .context("reading relocations")?;

        let (first, last) = self.objects[oi].filter_symbols_by_address(sect_addr, sect_addr + sect_size);
        let filtered: Vec<u32> = self.objects[oi].sorted_symbols[first..last].to_vec();

        let has_dices = self.objects[oi].text_section_index == Some(sect_index)
            && !self.objects[oi].data_in_code.is_empty();
        let has_stabs = self.objects[oi].debug_info.is_some();
        let ctx = SectionCtx {
            sect,
            matching,
            code,
            relocs,
            has_dices,
            has_stabs,
        };

        if subsections_via_symbols && !filtered.is_empty() {
            let first_addr = self.objects[oi].symtab[filtered[0] as usize].value();
            if first_addr > sect_addr {
                // Head region with no leading symbol.
                let sym_index = self.section_symbol(oi, sect_index);
                let size = first_addr - sect_addr;
                let atom_id = self.create_atom_from_subsection(
                    oi,
                    &ctx,
                    sym_index,
                    &[],
                    sect_addr,
                    size,
                    sect_align,
                )?;
                self.add_atom_to_section(atom_id, matching);
            }

            // Symbols aliasing one address share an atom; the first is its
            // defining symbol.
            let groups: Vec<(u64, Vec<u32>)> = {
                let symtab = &self.objects[oi].symtab;
                let chunks = filtered
                    .iter()
                    .copied()
                    .chunk_by(|&i| symtab[i as usize].value());
                chunks
                    .into_iter()
                    .map(|(addr, group)| (addr, group.collect()))
                    .collect()
            };
            for (index, (addr, group)) in groups.iter().enumerate() {
                let next_addr = groups
                    .get(index + 1)
                    .map_or(sect_addr + sect_size, |(next, _)| *next);
                let size = next_addr - addr;
                let alignment = if *addr > 0 {
                    (addr.trailing_zeros()).min(sect_align)
                } else {
                    sect_align
                };
                let atom_id = self.create_atom_from_subsection(
                    oi,
                    &ctx,
                    group[0],
                    &group[1..],
                    *addr,
                    size,
                    alignment,
                )?;
                self.add_atom_to_section(atom_id, matching);
            }
        } else {
            let sym_index = self.section_symbol(oi, sect_index);
            let atom_id = self.create_atom_from_subsection(
                oi,
                &ctx,
                sym_index,
                &filtered,
                sect_addr,
                sect_size,
                sect_align,
            )?;
            self.add_atom_to_section(atom_id, matching);
        }
        Ok(())
    }

    /// The cached symbol standing in for a section that has no leading
    /// symbol of its own, synthesized on first use.
    pub(crate) fn section_symbol(&mut self, oi: usize, sect_index: usize) -> u32 {
        let ordinal = (sect_index + 1) as u8;
        if let Some(&sym_index) = self.objects[oi].sections_as_symbols.get(&ordinal) {
            return sym_index;
        }
        let sect = self.objects[oi].sections[sect_index];
        let sym_index = self.objects[oi].symtab.len() as u32;
        self.objects[oi].symtab.push(make_nlist(
            0,
            object::macho::N_SECT,
            ordinal,
            0,
            sect.addr.get(LittleEndian),
        ));
        self.objects[oi]
            .sections_as_symbols
            .insert(ordinal, sym_index);
        sym_index
    }

    #[allow(clippy::too_many_arguments)]
    fn create_atom_from_subsection(
        &mut self,
        oi: usize,
        ctx: &SectionCtx<'data>,
        sym_index: u32,
        inner_sym_indexes: &[u32],
        base_addr: u64,
        size: u64,
        alignment: u32,
    ) -> Result<AtomId> {
        let sect_addr = ctx.sect.addr.get(LittleEndian);
        let ordinal = self.sections.ordinal(ctx.matching);
        let aligned_size = crate::macho::align_forward(size, alignment);

        let atom_id = self
            .atoms
            .alloc(Atom::new(sym_index, Some(oi as u32), aligned_size, alignment));
        self.objects[oi].managed_atoms.push(atom_id);
        self.objects[oi].atom_by_index_table.insert(sym_index, atom_id);
        self.objects[oi].symtab[sym_index as usize].n_sect = ordinal;

        let base_offset = base_addr - sect_addr;
        if !ctx.code.is_empty() {
            let src = &ctx.code[base_offset as usize..][..size as usize];
            self.atoms.get_mut(atom_id).code[..size as usize].copy_from_slice(src);
        }

        let atom_relocs = filter_relocs(ctx.relocs, base_offset, base_offset + size);
        self.parse_relocs(
            oi,
            atom_id,
            atom_relocs,
            RelocContext {
                base_offset,
                base_addr,
                matching: ctx.matching,
            },
        )?;

        if ctx.has_dices {
            let dices = filter_dice(self.objects[oi].data_in_code, base_addr, base_addr + size);
            let rebased: Vec<Dice> = dices
                .iter()
                .map(|d| Dice {
                    offset: (u64::from(d.offset.get(LittleEndian)) - base_addr) as u32,
                    length: d.length.get(LittleEndian),
                    kind: d.kind.get(LittleEndian),
                })
                .collect();
            self.atoms.get_mut(atom_id).dices = rebased;
        }

        for &inner in inner_sym_indexes {
            let sym = self.objects[oi].symtab[inner as usize];
            let stab = if !ctx.has_stabs {
                None
            } else {
                let debug_info = self.objects[oi].debug_info.as_ref().unwrap();
                Some(match debug_info.function_covering(sym.value()) {
                    Some(range) => Stab::Function(range.end - range.start),
                    None if sym.ext() => Stab::Global,
                    None => Stab::Static,
                })
            };
            self.atoms.get_mut(atom_id).contained.push(InnerSymbol {
                sym_index: inner,
                offset: sym.value() - base_addr,
                stab,
            });
            self.objects[oi].symtab[inner as usize].n_sect = ordinal;
            self.objects[oi].atom_by_index_table.insert(inner, atom_id);
        }

        if is_gc_root(&ctx.sect) {
            self.gc_roots.push(atom_id);
        }
        Ok(atom_id)
    }
}

struct SectionCtx<'data> {
    sect: Section,
    matching: MatchingSection,
    code: &'data [u8],
    relocs: &'data [Reloc],
    has_dices: bool,
    has_stabs: bool,
}

/// Atoms from these sections survive dead-stripping unconditionally.
pub(crate) fn is_gc_root(sect: &Section) -> bool {
    let flags = sect.flags.get(LittleEndian);
    if flags & (object::macho::S_ATTR_NO_DEAD_STRIP | object::macho::S_ATTR_LIVE_SUPPORT) != 0 {
        return true;
    }
    if sect_name(sect) == b"__StaticInit" {
        return true;
    }
    matches!(
        crate::macho::section_type(flags),
        object::macho::S_MOD_INIT_FUNC_POINTERS | object::macho::S_MOD_TERM_FUNC_POINTERS
    )
}
