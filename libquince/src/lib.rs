//! quince is an atom-based ingestion and relocation engine for relocatable
//! Mach-O objects on Apple platforms (aarch64 and x86_64). Objects are parsed
//! and cleft into atoms along symbol boundaries, cross-references are
//! normalized while GOT entries, stubs and thread-local pointer slots are
//! synthesized on demand, and once virtual addresses are frozen the atoms'
//! code is patched with final addresses.
//!
//! The driver, global symbol resolver, address allocator and output writer
//! are the host's concern; this crate exposes the hooks they need.

pub(crate) mod arch;
pub(crate) mod args;
pub(crate) mod atom;
pub(crate) mod dwarf;
pub mod error;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod macho;
pub(crate) mod parsing;
pub(crate) mod reloc;
pub(crate) mod symbol_db;
#[cfg(test)]
pub(crate) mod test_support;

pub use crate::arch::Architecture;
pub use crate::args::{Args, OptLevel};
pub use crate::atom::{Atom, AtomId, Binding, Dice, InnerSymbol, Stab};
pub use crate::dwarf::CompileUnitInfo;
pub use crate::error::{LinkError, Result};
pub use crate::input_data::InputFile;
pub use crate::layout::{GotEntry, MatchingSection, OutputSection, StubsEntry, TlvPtrEntry};
pub use crate::reloc::Relocation;
pub use crate::symbol_db::SymbolWithLoc;

use crate::atom::Atoms;
use crate::layout::OutputSections;
use crate::macho::{Nlist, NlistExt as _};
use crate::parsing::Object;
use crate::symbol_db::SymbolDb;
use hashbrown::HashMap;
use object::LittleEndian;

pub struct Linker<'data> {
    pub(crate) args: Args,
    pub(crate) objects: Vec<Object<'data>>,
    pub(crate) atoms: Atoms,
    pub(crate) symbol_db: SymbolDb,
    pub(crate) sections: OutputSections,
    /// Atoms the linker owns directly (GOT slots, stubs, ...), keyed by
    /// synthetic symbol index.
    pub(crate) atom_by_index_table: HashMap<u32, AtomId>,
    pub(crate) got_entries: Vec<GotEntry>,
    pub(crate) got_entries_table: HashMap<SymbolWithLoc, u32>,
    pub(crate) stubs: Vec<StubsEntry>,
    pub(crate) stubs_table: HashMap<SymbolWithLoc, u32>,
    pub(crate) tlv_ptr_entries: Vec<TlvPtrEntry>,
    pub(crate) tlv_ptr_entries_table: HashMap<SymbolWithLoc, u32>,
    pub(crate) gc_roots: Vec<AtomId>,
}

impl<'data> Linker<'data> {
    pub fn new(args: Args) -> Linker<'data> {
        Linker {
            args,
            objects: Vec::new(),
            atoms: Atoms::new(),
            symbol_db: SymbolDb::new(),
            sections: OutputSections::new(),
            atom_by_index_table: HashMap::new(),
            got_entries: Vec::new(),
            got_entries_table: HashMap::new(),
            stubs: Vec::new(),
            stubs_table: HashMap::new(),
            tlv_ptr_entries: Vec::new(),
            tlv_ptr_entries_table: HashMap::new(),
            gc_roots: Vec::new(),
        }
    }

    /// Parses `input` as a relocatable object and takes ownership of its
    /// symbol table. Returns the object's index, the `file` half of every
    /// [`SymbolWithLoc`] that points into it.
    pub fn add_object(&mut self, input: &'data InputFile) -> Result<u32> {
        self.add_object_at(input, 0)
    }

    /// Like [`Linker::add_object`], for an object embedded at `file_offset`
    /// inside a universal (fat) wrapper.
    pub fn add_object_at(&mut self, input: &'data InputFile, file_offset: u64) -> Result<u32> {
        let index = self.objects.len() as u32;
        let object = Object::parse(
            input.path.display().to_string(),
            input.mtime,
            input.data(),
            file_offset,
            self.args.arch,
        )?;
        self.objects.push(object);
        Ok(index)
    }

    pub fn symbol(&self, loc: SymbolWithLoc) -> Nlist {
        match loc.file {
            Some(file) => self.objects[file as usize].symtab[loc.sym_index as usize],
            None => self.symbol_db.synthetic[loc.sym_index as usize],
        }
    }

    pub(crate) fn symbol_mut(&mut self, loc: SymbolWithLoc) -> &mut Nlist {
        match loc.file {
            Some(file) => &mut self.objects[file as usize].symtab[loc.sym_index as usize],
            None => &mut self.symbol_db.synthetic[loc.sym_index as usize],
        }
    }

    pub fn symbol_name(&self, loc: SymbolWithLoc) -> &[u8] {
        let n_strx = self.symbol(loc).n_strx.get(LittleEndian);
        match loc.file {
            Some(file) => macho::string_at(self.objects[file as usize].strtab, n_strx),
            None => self.symbol_db.strtab.get(n_strx),
        }
    }

    /// Sets the owning symbol's address. This is the host allocator's hook
    /// for the deferred-layout mode.
    pub fn set_symbol_address(&mut self, loc: SymbolWithLoc, address: u64) {
        self.symbol_mut(loc).n_value.set(LittleEndian, address);
    }

    pub fn global(&self, name: &[u8]) -> Option<SymbolWithLoc> {
        self.symbol_db.global(name)
    }

    pub fn global_index(&self, name: &[u8]) -> Option<u32> {
        self.symbol_db.global_index(name)
    }

    /// Records the resolver's verdict for `name`.
    pub fn define_global(&mut self, name: &[u8], loc: SymbolWithLoc) {
        self.symbol_db.define_global(name, loc);
    }

    /// Registers `name` as an unresolved external backed by a synthetic
    /// symbol, unless it already resolves to something.
    pub fn add_undefined_global(&mut self, name: &[u8]) -> SymbolWithLoc {
        self.symbol_db.add_undefined(name)
    }

    pub fn atom(&self, id: AtomId) -> &Atom {
        self.atoms.get(id)
    }

    /// Mutable access for the writer's passes (dirty bits, debug payloads).
    pub fn atom_mut(&mut self, id: AtomId) -> &mut Atom {
        self.atoms.get_mut(id)
    }

    /// The atoms carved out of one object, in creation order.
    pub fn object_atoms(&self, object_index: u32) -> &[AtomId] {
        &self.objects[object_index as usize].managed_atoms
    }

    /// Source-level metadata of an object's compile unit, when it carried
    /// debug info.
    pub fn compile_unit_info(&self, object_index: u32) -> Option<CompileUnitInfo<'_>> {
        let debug_info = self.objects[object_index as usize].debug_info.as_ref()?;
        Some(CompileUnitInfo {
            name: debug_info.compile_unit_name.as_deref(),
            comp_dir: debug_info.compile_unit_dir.as_deref(),
            mtime: debug_info.mtime,
        })
    }

    pub fn output_section(&self, m: MatchingSection) -> &OutputSection {
        self.sections.section(m)
    }

    /// The atom that owns `loc`'s symbol, whether `loc` is its defining
    /// symbol or one of the contained ones.
    pub fn atom_for_symbol(&self, loc: SymbolWithLoc) -> Option<AtomId> {
        match loc.file {
            Some(file) => self.objects[file as usize]
                .atom_by_index_table
                .get(&loc.sym_index)
                .copied(),
            None => self.atom_by_index_table.get(&loc.sym_index).copied(),
        }
    }

    /// Distance from this atom's start address to the next atom's, or to the
    /// end of the address space for the last atom in its section.
    pub fn capacity(&self, id: AtomId) -> u64 {
        let atom = self.atoms.get(id);
        let start = self.symbol(atom.loc()).value();
        match atom.next {
            Some(next) => {
                let next_start = self.symbol(self.atoms.get(next).loc()).value();
                next_start - start
            }
            None => u64::MAX - start,
        }
    }

    /// Whether the gap this atom sits in is worth handing to a free list
    /// when the atom is replaced.
    pub fn free_list_eligible(&self, id: AtomId) -> bool {
        atom::free_list_eligible(self.atoms.get(id).size, self.capacity(id))
    }

    pub fn section_atoms(&self, m: MatchingSection) -> impl Iterator<Item = AtomId> + '_ {
        let mut next = self.sections.section(m).first_atom;
        std::iter::from_fn(move || {
            let id = next?;
            next = self.atoms.get(id).next;
            Some(id)
        })
    }

    pub fn gc_roots(&self) -> &[AtomId] {
        &self.gc_roots
    }

    pub fn got_entries(&self) -> &[GotEntry] {
        &self.got_entries
    }

    pub fn stubs(&self) -> &[StubsEntry] {
        &self.stubs
    }

    pub fn tlv_ptr_entries(&self) -> &[TlvPtrEntry] {
        &self.tlv_ptr_entries
    }
}
