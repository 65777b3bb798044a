//! Output-side bookkeeping: the output segment/section registry with its
//! 1-based section ordinals, per-section atom lists, the eager bump
//! allocator, and the synthetic atoms the relocation parser conjures up on
//! demand (GOT entries, stubs with their lazy pointers and helpers, and
//! thread-local pointer slots).

use crate::arch::Architecture;
use crate::atom::{Atom, AtomId, Binding};
use crate::error::{LinkError, Result};
use crate::macho::{
    align_forward, make_nlist, pad_name, sect_name, seg_name, NlistExt as _, Section,
};
use crate::reloc::Relocation;
use crate::symbol_db::SymbolWithLoc;
use crate::Linker;
use anyhow::Context as _;
use object::LittleEndian;

/// Destination of an atom: output segment index and section index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchingSection {
    pub seg: u8,
    pub sect: u8,
}

pub struct OutputSection {
    pub segname: [u8; 16],
    pub sectname: [u8; 16],
    pub flags: u32,
    pub ordinal: u8,
    pub first_atom: Option<AtomId>,
    pub last_atom: Option<AtomId>,
    /// Next free address when addresses are assigned eagerly.
    cursor: u64,
}

pub(crate) struct OutputSegment {
    pub(crate) name: [u8; 16],
    pub(crate) sections: Vec<OutputSection>,
}

pub(crate) struct OutputSections {
    pub(crate) segments: Vec<OutputSegment>,
    next_ordinal: u8,
}

impl OutputSections {
    pub(crate) fn new() -> OutputSections {
        let segment = |name: &[u8]| OutputSegment {
            name: pad_name(name),
            sections: Vec::new(),
        };
        OutputSections {
            segments: vec![
                segment(b"__TEXT"),
                segment(b"__DATA_CONST"),
                segment(b"__DATA"),
            ],
            next_ordinal: 1,
        }
    }

    pub(crate) fn ensure(&mut self, segname: &[u8], sectname: &[u8], flags: u32) -> MatchingSection {
        if let Some(m) = self.find(segname, sectname) {
            return m;
        }
        let seg = match self.segments.iter().position(|s| s.name == pad_name(segname)) {
            Some(index) => index,
            None => {
                self.segments.push(OutputSegment {
                    name: pad_name(segname),
                    sections: Vec::new(),
                });
                self.segments.len() - 1
            }
        };
        let ordinal = self.next_ordinal;
        assert!(ordinal != u8::MAX, "too many output sections");
        self.next_ordinal += 1;
        self.segments[seg].sections.push(OutputSection {
            segname: pad_name(segname),
            sectname: pad_name(sectname),
            flags,
            ordinal,
            first_atom: None,
            last_atom: None,
            cursor: 0,
        });
        MatchingSection {
            seg: seg as u8,
            sect: (self.segments[seg].sections.len() - 1) as u8,
        }
    }

    pub(crate) fn find(&self, segname: &[u8], sectname: &[u8]) -> Option<MatchingSection> {
        let (segname, sectname) = (pad_name(segname), pad_name(sectname));
        self.segments.iter().enumerate().find_map(|(si, seg)| {
            seg.sections
                .iter()
                .position(|s| s.segname == segname && s.sectname == sectname)
                .map(|sect| MatchingSection {
                    seg: si as u8,
                    sect: sect as u8,
                })
        })
    }

    pub(crate) fn section(&self, m: MatchingSection) -> &OutputSection {
        &self.segments[m.seg as usize].sections[m.sect as usize]
    }

    pub(crate) fn section_mut(&mut self, m: MatchingSection) -> &mut OutputSection {
        &mut self.segments[m.seg as usize].sections[m.sect as usize]
    }

    pub(crate) fn ordinal(&self, m: MatchingSection) -> u8 {
        self.section(m).ordinal
    }

    pub(crate) fn from_ordinal(&self, ordinal: u8) -> Option<MatchingSection> {
        self.segments.iter().enumerate().find_map(|(si, seg)| {
            seg.sections
                .iter()
                .position(|s| s.ordinal == ordinal)
                .map(|sect| MatchingSection {
                    seg: si as u8,
                    sect: sect as u8,
                })
        })
    }
}

/// One GOT slot: a pointer-sized atom whose sole relocation targets the
/// referenced symbol.
pub struct GotEntry {
    pub target: SymbolWithLoc,
    pub atom: AtomId,
}

/// One stub triple. The stub jumps through the lazy pointer, which initially
/// points at the helper, which pushes its binding info and enters
/// `dyld_stub_binder`.
pub struct StubsEntry {
    pub target: SymbolWithLoc,
    pub stub_atom: AtomId,
    pub laptr_atom: AtomId,
    pub helper_atom: AtomId,
}

pub struct TlvPtrEntry {
    pub target: SymbolWithLoc,
    pub atom: AtomId,
}

// jmpq *lazy_ptr(%rip)
const STUB_TEMPLATE_X86_64: &[u8] = &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

// pushq $lazy_bind_info; jmp dyld_stub_binder
const STUB_HELPER_TEMPLATE_X86_64: &[u8] = &[
    0x68, 0x00, 0x00, 0x00, 0x00, // pushq, immediate patched by the writer
    0xe9, 0x00, 0x00, 0x00, 0x00, // jmp dyld_stub_binder
];

const STUB_TEMPLATE_AARCH64: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(lazy_ptr)
    0x10, 0x02, 0x40, 0xf9, // ldr x16, [x16, pageoff(lazy_ptr)]
    0x00, 0x02, 0x1f, 0xd6, // br x16
];

const STUB_HELPER_TEMPLATE_AARCH64: &[u8] = &[
    0x50, 0x00, 0x00, 0x58, // ldr x16, #8
    0x00, 0x00, 0x00, 0x14, // b dyld_stub_binder
    0x00, 0x00, 0x00, 0x00, // lazy binding info, patched by the writer
];

fn unsigned_r_type(arch: Architecture) -> u8 {
    match arch {
        Architecture::AArch64 => object::macho::ARM64_RELOC_UNSIGNED,
        Architecture::X86_64 => object::macho::X86_64_RELOC_UNSIGNED,
    }
}

impl<'data> Linker<'data> {
    /// Maps an input section to its output section, creating the output
    /// section if this is the first atom headed there. Returns `None` for
    /// section classes the engine doesn't carry into the output.
    pub(crate) fn get_matching_section(&mut self, sect: &Section) -> Option<MatchingSection> {
        let segname = seg_name(sect);
        if segname == b"__DWARF" || segname == b"__LLVM" {
            return None;
        }
        let flags = sect.flags.get(LittleEndian);
        if flags & object::macho::S_ATTR_DEBUG != 0 {
            return None;
        }
        Some(self.sections.ensure(segname, sect_name(sect), flags))
    }

    pub fn section_ordinal(&self, m: MatchingSection) -> u8 {
        self.sections.ordinal(m)
    }

    pub fn matching_section_from_ordinal(&self, ordinal: u8) -> Option<MatchingSection> {
        self.sections.from_ordinal(ordinal)
    }

    /// Appends the atom to its output section's sibling list.
    pub fn add_atom_to_section(&mut self, atom_id: AtomId, m: MatchingSection) {
        match self.sections.section(m).last_atom {
            Some(last) => {
                self.atoms.get_mut(last).next = Some(atom_id);
                self.atoms.get_mut(atom_id).prev = Some(last);
            }
            None => self.sections.section_mut(m).first_atom = Some(atom_id),
        }
        self.sections.section_mut(m).last_atom = Some(atom_id);
    }

    /// Eagerly places the atom: bumps the section cursor, links the atom in,
    /// and assigns addresses to its defining and contained symbols. Returns
    /// the atom's address.
    pub fn allocate_atom(
        &mut self,
        atom_id: AtomId,
        size: u64,
        alignment: u32,
        m: MatchingSection,
    ) -> u64 {
        let section = self.sections.section_mut(m);
        let address = align_forward(section.cursor, alignment);
        section.cursor = address + size;
        self.add_atom_to_section(atom_id, m);

        let loc = self.atoms.get(atom_id).loc();
        self.symbol_mut(loc).n_value.set(LittleEndian, address);
        if let Some(file) = self.atoms.get(atom_id).file {
            let contained = self.atoms.get(atom_id).contained.clone();
            for inner in contained {
                self.objects[file as usize].symtab[inner.sym_index as usize]
                    .n_value
                    .set(LittleEndian, address + inner.offset);
            }
        }
        self.atoms.get_mut(atom_id).dirty = true;
        address
    }

    fn place_atom(&mut self, atom_id: AtomId, m: MatchingSection) {
        if self.args.prealloc {
            let (size, alignment) = {
                let atom = self.atoms.get(atom_id);
                (atom.size, atom.alignment)
            };
            self.allocate_atom(atom_id, size, alignment, m);
        } else {
            self.add_atom_to_section(atom_id, m);
        }
    }

    /// An atom with a fresh unnamed symbol in the linker's own table.
    fn new_synthetic_atom(&mut self, m: MatchingSection, size: u64, alignment: u32) -> AtomId {
        let ordinal = self.sections.ordinal(m);
        let sym_index = self
            .symbol_db
            .push_synthetic(make_nlist(0, object::macho::N_SECT, ordinal, 0, 0));
        let atom_id = self.atoms.alloc(Atom::new(sym_index, None, size, alignment));
        self.atom_by_index_table.insert(sym_index, atom_id);
        atom_id
    }

    pub(crate) fn global_index_for(&self, target: SymbolWithLoc) -> Result<u32> {
        let name = self.symbol_name(target);
        self.symbol_db.global_index(name).ok_or_else(|| {
            anyhow::anyhow!(
                "symbol {} is not present in the globals map",
                String::from_utf8_lossy(name)
            )
        })
    }

    /// Ensures a GOT slot exists for `target`. Idempotent.
    pub fn add_got_entry(&mut self, target: SymbolWithLoc) -> Result {
        if self.got_entries_table.contains_key(&target) {
            return Ok(());
        }
        let index = self.got_entries.len() as u32;
        let atom = self.create_got_atom(target)?;
        self.got_entries_table.insert(target, index);
        self.got_entries.push(GotEntry { target, atom });
        Ok(())
    }

    fn create_got_atom(&mut self, target: SymbolWithLoc) -> Result<AtomId> {
        let m = self.sections.ensure(
            b"__DATA_CONST",
            b"__got",
            object::macho::S_NON_LAZY_SYMBOL_POINTERS,
        );
        let atom_id = self.new_synthetic_atom(m, 8, 3);
        if self.symbol(target).undf() {
            let global_index = self.global_index_for(target)?;
            self.atoms.get_mut(atom_id).bindings.push(Binding {
                global_index,
                offset: 0,
            });
        } else {
            self.atoms.get_mut(atom_id).rebases.push(0);
        }
        self.atoms.get_mut(atom_id).relocs.push(Relocation {
            offset: 0,
            target,
            addend: 0,
            subtractor: None,
            pcrel: false,
            length: 3,
            r_type: unsigned_r_type(self.args.arch),
        });
        self.place_atom(atom_id, m);
        Ok(atom_id)
    }

    /// Ensures a thread-local pointer slot exists for the undefined
    /// `target`. Idempotent.
    pub fn add_tlv_ptr_entry(&mut self, target: SymbolWithLoc) -> Result {
        debug_assert!(self.symbol(target).undf());
        if self.tlv_ptr_entries_table.contains_key(&target) {
            return Ok(());
        }
        let index = self.tlv_ptr_entries.len() as u32;
        let atom = self.create_tlv_ptr_atom(target)?;
        self.tlv_ptr_entries_table.insert(target, index);
        self.tlv_ptr_entries.push(TlvPtrEntry { target, atom });
        Ok(())
    }

    fn create_tlv_ptr_atom(&mut self, target: SymbolWithLoc) -> Result<AtomId> {
        let m = self.sections.ensure(
            b"__DATA",
            b"__thread_ptrs",
            object::macho::S_THREAD_LOCAL_VARIABLE_POINTERS,
        );
        let atom_id = self.new_synthetic_atom(m, 8, 3);
        let global_index = self.global_index_for(target)?;
        self.atoms.get_mut(atom_id).bindings.push(Binding {
            global_index,
            offset: 0,
        });
        self.place_atom(atom_id, m);
        Ok(atom_id)
    }

    /// Ensures the stub triple exists for the undefined `target`: helper
    /// first (the lazy pointer points at it), then the lazy pointer (the
    /// stub jumps through it), then the stub. Idempotent.
    pub fn add_stub_entry(&mut self, target: SymbolWithLoc) -> Result {
        debug_assert!(self.symbol(target).undf());
        if self.stubs_table.contains_key(&target) {
            return Ok(());
        }
        let binder = self.symbol_db.add_undefined(b"dyld_stub_binder");
        let index = self.stubs.len() as u32;

        let helper_atom = self
            .create_stub_helper_atom(binder)
            .context("creating stub helper")?;
        let helper = self.atoms.get(helper_atom).loc();
        let laptr_atom = self
            .create_lazy_pointer_atom(helper, target)
            .context("creating lazy pointer")?;
        let laptr = self.atoms.get(laptr_atom).loc();
        let stub_atom = self.create_stub_atom(laptr).context("creating stub")?;

        self.stubs_table.insert(target, index);
        self.stubs.push(StubsEntry {
            target,
            stub_atom,
            laptr_atom,
            helper_atom,
        });
        Ok(())
    }

    fn create_stub_helper_atom(&mut self, binder: SymbolWithLoc) -> Result<AtomId> {
        let m = self.sections.ensure(
            b"__TEXT",
            b"__stub_helper",
            object::macho::S_REGULAR
                | object::macho::S_ATTR_PURE_INSTRUCTIONS
                | object::macho::S_ATTR_SOME_INSTRUCTIONS,
        );
        let (template, alignment, branch_offset, branch_type) = match self.args.arch {
            Architecture::X86_64 => (
                STUB_HELPER_TEMPLATE_X86_64,
                0,
                6,
                object::macho::X86_64_RELOC_BRANCH,
            ),
            Architecture::AArch64 => (
                STUB_HELPER_TEMPLATE_AARCH64,
                2,
                4,
                object::macho::ARM64_RELOC_BRANCH26,
            ),
        };
        let atom_id = self.new_synthetic_atom(m, template.len() as u64, alignment);
        let atom = self.atoms.get_mut(atom_id);
        atom.code.copy_from_slice(template);
        atom.relocs.push(Relocation {
            offset: branch_offset,
            target: binder,
            addend: 0,
            subtractor: None,
            pcrel: true,
            length: 2,
            r_type: branch_type,
        });
        self.place_atom(atom_id, m);
        Ok(atom_id)
    }

    fn create_lazy_pointer_atom(
        &mut self,
        helper: SymbolWithLoc,
        target: SymbolWithLoc,
    ) -> Result<AtomId> {
        let m = self.sections.ensure(
            b"__DATA",
            b"__la_symbol_ptr",
            object::macho::S_LAZY_SYMBOL_POINTERS,
        );
        let atom_id = self.new_synthetic_atom(m, 8, 3);
        let global_index = self.global_index_for(target)?;
        let atom = self.atoms.get_mut(atom_id);
        atom.relocs.push(Relocation {
            offset: 0,
            target: helper,
            addend: 0,
            subtractor: None,
            pcrel: false,
            length: 3,
            r_type: unsigned_r_type(self.args.arch),
        });
        atom.rebases.push(0);
        atom.lazy_bindings.push(Binding {
            global_index,
            offset: 0,
        });
        self.place_atom(atom_id, m);
        Ok(atom_id)
    }

    fn create_stub_atom(&mut self, laptr: SymbolWithLoc) -> Result<AtomId> {
        let m = self.sections.ensure(
            b"__TEXT",
            b"__stubs",
            object::macho::S_SYMBOL_STUBS
                | object::macho::S_ATTR_PURE_INSTRUCTIONS
                | object::macho::S_ATTR_SOME_INSTRUCTIONS,
        );
        match self.args.arch {
            Architecture::X86_64 => {
                let atom_id =
                    self.new_synthetic_atom(m, STUB_TEMPLATE_X86_64.len() as u64, 0);
                let atom = self.atoms.get_mut(atom_id);
                atom.code.copy_from_slice(STUB_TEMPLATE_X86_64);
                atom.relocs.push(Relocation {
                    offset: 2,
                    target: laptr,
                    addend: 0,
                    subtractor: None,
                    pcrel: true,
                    length: 2,
                    r_type: object::macho::X86_64_RELOC_BRANCH,
                });
                self.place_atom(atom_id, m);
                Ok(atom_id)
            }
            Architecture::AArch64 => {
                let atom_id =
                    self.new_synthetic_atom(m, STUB_TEMPLATE_AARCH64.len() as u64, 2);
                let atom = self.atoms.get_mut(atom_id);
                atom.code.copy_from_slice(STUB_TEMPLATE_AARCH64);
                atom.relocs.push(Relocation {
                    offset: 0,
                    target: laptr,
                    addend: 0,
                    subtractor: None,
                    pcrel: true,
                    length: 2,
                    r_type: object::macho::ARM64_RELOC_PAGE21,
                });
                atom.relocs.push(Relocation {
                    offset: 4,
                    target: laptr,
                    addend: 0,
                    subtractor: None,
                    pcrel: false,
                    length: 2,
                    r_type: object::macho::ARM64_RELOC_PAGEOFF12,
                });
                self.place_atom(atom_id, m);
                Ok(atom_id)
            }
        }
    }

    /// Base address all thread-local offsets are relative to: the start of
    /// `__thread_data`, or `__thread_bss` when there is no initialized
    /// thread-local data at all.
    pub(crate) fn tlv_base_address(&self) -> Result<u64> {
        let m = self
            .sections
            .find(b"__DATA", b"__thread_data")
            .or_else(|| self.sections.find(b"__DATA", b"__thread_bss"))
            .ok_or(LinkError::FailedToResolveRelocationTarget)
            .context("thread-local reference without any thread-local sections")?;
        let first = self
            .sections
            .section(m)
            .first_atom
            .ok_or(LinkError::FailedToResolveRelocationTarget)
            .context("thread-local sections are empty")?;
        Ok(self.symbol(self.atoms.get(first).loc()).value())
    }

    /// Whether pointers in this output section get slid by the dynamic
    /// loader when the image rebases.
    pub(crate) fn section_allows_rebase(&self, m: MatchingSection) -> bool {
        let section = self.sections.section(m);
        let segname = &section.segname;
        if *segname != pad_name(b"__DATA") && *segname != pad_name(b"__DATA_CONST") {
            return false;
        }
        matches!(
            crate::macho::section_type(section.flags),
            object::macho::S_LITERAL_POINTERS
                | object::macho::S_REGULAR
                | object::macho::S_MOD_INIT_FUNC_POINTERS
                | object::macho::S_MOD_TERM_FUNC_POINTERS
        )
    }

    pub(crate) fn section_is_thread_local_variables(&self, ordinal: u8) -> bool {
        self.sections
            .from_ordinal(ordinal)
            .map(|m| {
                crate::macho::section_type(self.sections.section(m).flags)
                    == object::macho::S_THREAD_LOCAL_VARIABLES
            })
            .unwrap_or(false)
    }
}
