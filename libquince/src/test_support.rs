//! Builds tiny relocatable Mach-O objects in memory for the test modules.
//! The layout is the minimal one the parser accepts: header, one segment
//! with all sections, a symtab command, then section contents, relocations,
//! symbols and strings.

use crate::arch::Architecture;
use crate::macho::{make_nlist, pad_name, MachHeader, Reloc, Section};
use crate::Linker;
use object::macho::SymtabCommand;
use object::{BigEndian, LittleEndian, U16, U32, U64};

type SegmentCommand = object::macho::SegmentCommand64<LittleEndian>;

pub(crate) struct SectionSpec {
    pub(crate) segname: &'static [u8],
    pub(crate) sectname: &'static [u8],
    pub(crate) addr: u64,
    pub(crate) align: u32,
    pub(crate) flags: u32,
    pub(crate) code: Vec<u8>,
    /// Must be listed in emission order: descending r_address.
    pub(crate) relocs: Vec<Reloc>,
}

impl SectionSpec {
    pub(crate) fn new(
        segname: &'static [u8],
        sectname: &'static [u8],
        addr: u64,
        code: Vec<u8>,
    ) -> SectionSpec {
        SectionSpec {
            segname,
            sectname,
            addr,
            align: 3,
            flags: object::macho::S_REGULAR,
            code,
            relocs: Vec::new(),
        }
    }

    pub(crate) fn flags(mut self, flags: u32) -> SectionSpec {
        self.flags = flags;
        self
    }

    pub(crate) fn align(mut self, align: u32) -> SectionSpec {
        self.align = align;
        self
    }

    pub(crate) fn relocs(mut self, relocs: Vec<Reloc>) -> SectionSpec {
        self.relocs = relocs;
        self
    }
}

pub(crate) struct SymSpec {
    pub(crate) name: &'static [u8],
    pub(crate) n_type: u8,
    pub(crate) n_sect: u8,
    pub(crate) n_value: u64,
}

/// An externally visible defined symbol.
pub(crate) fn global(name: &'static [u8], n_sect: u8, n_value: u64) -> SymSpec {
    SymSpec {
        name,
        n_type: object::macho::N_SECT | object::macho::N_EXT,
        n_sect,
        n_value,
    }
}

pub(crate) fn local(name: &'static [u8], n_sect: u8, n_value: u64) -> SymSpec {
    SymSpec {
        name,
        n_type: object::macho::N_SECT,
        n_sect,
        n_value,
    }
}

pub(crate) fn undef(name: &'static [u8]) -> SymSpec {
    SymSpec {
        name,
        n_type: object::macho::N_UNDF | object::macho::N_EXT,
        n_sect: 0,
        n_value: 0,
    }
}

pub(crate) fn raw_reloc(
    r_address: u32,
    r_symbolnum: u32,
    r_pcrel: bool,
    r_length: u8,
    r_extern: bool,
    r_type: u8,
) -> Reloc {
    let word1 = (r_symbolnum & 0x00ff_ffff)
        | (u32::from(r_pcrel) << 24)
        | (u32::from(r_length & 0b11) << 25)
        | (u32::from(r_extern) << 27)
        | (u32::from(r_type) << 28);
    Reloc {
        r_word0: U32::new(LittleEndian, r_address),
        r_word1: U32::new(LittleEndian, word1),
    }
}

pub(crate) struct ObjectBuilder {
    pub(crate) arch: Architecture,
    pub(crate) filetype: u32,
    pub(crate) flags: u32,
    pub(crate) sections: Vec<SectionSpec>,
    pub(crate) symbols: Vec<SymSpec>,
    pub(crate) dices: Vec<(u32, u16, u16)>,
}

impl ObjectBuilder {
    pub(crate) fn new(arch: Architecture) -> ObjectBuilder {
        ObjectBuilder {
            arch,
            filetype: object::macho::MH_OBJECT,
            flags: object::macho::MH_SUBSECTIONS_VIA_SYMBOLS,
            sections: Vec::new(),
            symbols: Vec::new(),
            dices: Vec::new(),
        }
    }

    pub(crate) fn section(mut self, section: SectionSpec) -> ObjectBuilder {
        self.sections.push(section);
        self
    }

    pub(crate) fn symbol(mut self, symbol: SymSpec) -> ObjectBuilder {
        self.symbols.push(symbol);
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let header_size = std::mem::size_of::<MachHeader>();
        let seg_size = std::mem::size_of::<SegmentCommand>();
        let sect_size = std::mem::size_of::<Section>();
        let symtab_size = std::mem::size_of::<SymtabCommand<LittleEndian>>();
        let dice_cmd_size =
            std::mem::size_of::<object::macho::LinkeditDataCommand<LittleEndian>>();

        let mut ncmds = 2u32;
        let mut cmds_size = seg_size + self.sections.len() * sect_size + symtab_size;
        if !self.dices.is_empty() {
            ncmds += 1;
            cmds_size += dice_cmd_size;
        }

        let align8 = |value: usize| (value + 7) & !7;
        let mut cursor = header_size + cmds_size;

        let mut code_offsets = Vec::new();
        for section in &self.sections {
            cursor = align8(cursor);
            code_offsets.push(cursor);
            cursor += section.code.len();
        }
        let mut reloc_offsets = Vec::new();
        for section in &self.sections {
            cursor = align8(cursor);
            reloc_offsets.push(cursor);
            cursor += section.relocs.len() * std::mem::size_of::<Reloc>();
        }
        cursor = align8(cursor);
        let dice_offset = cursor;
        cursor += self.dices.len() * 8;
        cursor = align8(cursor);
        let symoff = cursor;
        cursor += self.symbols.len() * std::mem::size_of::<crate::macho::Nlist>();

        let mut strtab = vec![0u8];
        let strx: Vec<u32> = self
            .symbols
            .iter()
            .map(|sym| {
                let offset = strtab.len() as u32;
                strtab.extend_from_slice(sym.name);
                strtab.push(0);
                offset
            })
            .collect();
        let stroff = cursor;

        let le = LittleEndian;
        let mut out = Vec::with_capacity(cursor + strtab.len());

        let header = MachHeader {
            magic: U32::new(BigEndian, object::macho::MH_CIGAM_64),
            cputype: U32::new(le, self.arch.cpu_type()),
            cpusubtype: U32::new(le, 0),
            filetype: U32::new(le, self.filetype),
            ncmds: U32::new(le, ncmds),
            sizeofcmds: U32::new(le, cmds_size as u32),
            flags: U32::new(le, self.flags),
            reserved: U32::new(le, 0),
        };
        out.extend_from_slice(object::pod::bytes_of(&header));

        let vmsize = self
            .sections
            .iter()
            .map(|s| s.addr + s.code.len() as u64)
            .max()
            .unwrap_or(0);
        let segment = SegmentCommand {
            cmd: U32::new(le, object::macho::LC_SEGMENT_64),
            cmdsize: U32::new(le, (seg_size + self.sections.len() * sect_size) as u32),
            segname: pad_name(b""),
            vmaddr: U64::new(le, 0),
            vmsize: U64::new(le, vmsize),
            fileoff: U64::new(le, 0),
            filesize: U64::new(le, 0),
            maxprot: U32::new(le, 7),
            initprot: U32::new(le, 7),
            nsects: U32::new(le, self.sections.len() as u32),
            flags: U32::new(le, 0),
        };
        out.extend_from_slice(object::pod::bytes_of(&segment));

        for (index, section) in self.sections.iter().enumerate() {
            let header = Section {
                sectname: pad_name(section.sectname),
                segname: pad_name(section.segname),
                addr: U64::new(le, section.addr),
                size: U64::new(le, section.code.len() as u64),
                offset: U32::new(le, code_offsets[index] as u32),
                align: U32::new(le, section.align),
                reloff: U32::new(le, reloc_offsets[index] as u32),
                nreloc: U32::new(le, section.relocs.len() as u32),
                flags: U32::new(le, section.flags),
                reserved1: U32::new(le, 0),
                reserved2: U32::new(le, 0),
                reserved3: U32::new(le, 0),
            };
            out.extend_from_slice(object::pod::bytes_of(&header));
        }

        let symtab = SymtabCommand {
            cmd: U32::new(le, object::macho::LC_SYMTAB),
            cmdsize: U32::new(le, symtab_size as u32),
            symoff: U32::new(le, symoff as u32),
            nsyms: U32::new(le, self.symbols.len() as u32),
            stroff: U32::new(le, stroff as u32),
            strsize: U32::new(le, strtab.len() as u32),
        };
        out.extend_from_slice(object::pod::bytes_of(&symtab));

        if !self.dices.is_empty() {
            let cmd = object::macho::LinkeditDataCommand {
                cmd: U32::new(le, object::macho::LC_DATA_IN_CODE),
                cmdsize: U32::new(le, dice_cmd_size as u32),
                dataoff: U32::new(le, dice_offset as u32),
                datasize: U32::new(le, (self.dices.len() * 8) as u32),
            };
            out.extend_from_slice(object::pod::bytes_of(&cmd));
        }

        for (index, section) in self.sections.iter().enumerate() {
            out.resize(code_offsets[index], 0);
            out.extend_from_slice(&section.code);
        }
        for (index, section) in self.sections.iter().enumerate() {
            out.resize(reloc_offsets[index], 0);
            for reloc in &section.relocs {
                out.extend_from_slice(object::pod::bytes_of(reloc));
            }
        }
        out.resize(dice_offset, 0);
        for &(offset, length, kind) in &self.dices {
            let dice = crate::macho::DataInCodeEntry {
                offset: U32::new(le, offset),
                length: U16::new(le, length),
                kind: U16::new(le, kind),
            };
            out.extend_from_slice(object::pod::bytes_of(&dice));
        }
        out.resize(symoff, 0);
        for (index, sym) in self.symbols.iter().enumerate() {
            let nlist = make_nlist(strx[index], sym.n_type, sym.n_sect, 0, sym.n_value);
            out.extend_from_slice(object::pod::bytes_of(&nlist));
        }
        out.extend_from_slice(&strtab);
        out
    }
}

/// Stand-in for the external resolver: every external defined symbol wins
/// its name, every undefined one is recorded as unresolved.
pub(crate) fn resolve_globals(linker: &mut Linker<'_>, object_index: u32) {
    use crate::macho::NlistExt as _;
    use crate::symbol_db::SymbolWithLoc;

    let nsyms = linker.objects[object_index as usize].symtab.len();
    for sym_index in 0..nsyms as u32 {
        let loc = SymbolWithLoc::in_object(object_index, sym_index);
        let sym = linker.symbol(loc);
        if !sym.ext() {
            continue;
        }
        let name = linker.objects[object_index as usize]
            .symbol_name(sym_index)
            .to_vec();
        if sym.sect() || (sym.undf() && linker.global(&name).is_none()) {
            linker.define_global(&name, loc);
        }
    }
}
