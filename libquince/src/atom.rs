//! The atom model: a contiguous run of bytes that is relocated as a unit.
//! Atoms live in one arena owned by the linker and are referred to by stable
//! ids everywhere else, so the cyclic atom -> relocation -> atom graph never
//! turns into owning pointer cycles.

use crate::macho::{make_nlist, Nlist, NlistExt as _};
use crate::reloc::Relocation;
use crate::symbol_db::SymbolWithLoc;
use object::LittleEndian;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomId(u32);

impl AtomId {
    /// The canonical empty atom, permanently at slot 0 of the arena.
    pub const EMPTY: AtomId = AtomId(0);

    pub(crate) fn from_usize(index: usize) -> AtomId {
        AtomId(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Debugger metadata attached to a symbol contained in an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stab {
    Function(u64),
    Static,
    Global,
}

impl Stab {
    /// Materializes the stab records for `sym`. Functions expand to the
    /// BNSYM/FUN/size/ENSYM quad, data symbols to a single record.
    pub fn nlists(self, sym: &Nlist) -> Vec<Nlist> {
        let n_strx = sym.n_strx.get(LittleEndian);
        match self {
            Stab::Function(size) => vec![
                make_nlist(0, object::macho::N_BNSYM, sym.n_sect, 0, sym.value()),
                make_nlist(n_strx, object::macho::N_FUN, sym.n_sect, 0, sym.value()),
                make_nlist(0, object::macho::N_FUN, 0, 0, size),
                make_nlist(0, object::macho::N_ENSYM, sym.n_sect, 0, size),
            ],
            Stab::Static => vec![make_nlist(
                n_strx,
                object::macho::N_STSYM,
                sym.n_sect,
                0,
                sym.value(),
            )],
            Stab::Global => vec![make_nlist(n_strx, object::macho::N_GSYM, 0, 0, 0)],
        }
    }
}

/// A symbol that lives inside an atom's range without defining it.
#[derive(Debug, Clone, Copy)]
pub struct InnerSymbol {
    pub sym_index: u32,
    pub offset: u64,
    pub stab: Option<Stab>,
}

/// An offset the dynamic loader writes with the address of an external
/// symbol, identified by its index in the globals map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub global_index: u32,
    pub offset: u64,
}

/// A data-in-code range, rebased to be atom-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dice {
    pub offset: u32,
    pub length: u16,
    pub kind: u16,
}

pub struct Atom {
    /// The defining symbol. `sym_index == 0` with no file marks the empty
    /// atom.
    pub sym_index: u32,
    pub file: Option<u32>,

    pub size: u64,
    /// Power-of-two exponent.
    pub alignment: u32,
    pub code: Vec<u8>,

    pub contained: Vec<InnerSymbol>,
    pub relocs: Vec<Relocation>,
    pub rebases: Vec<u64>,
    pub bindings: Vec<Binding>,
    pub lazy_bindings: Vec<Binding>,
    pub dices: Vec<Dice>,

    pub prev: Option<AtomId>,
    pub next: Option<AtomId>,

    /// Opaque debug-info payload owned by a later pass; never interpreted
    /// here.
    pub dbg_info: Option<Box<[u8]>>,
    /// Incremental-update marker consumed by the writer.
    pub dirty: bool,
}

impl Atom {
    pub(crate) fn new(sym_index: u32, file: Option<u32>, size: u64, alignment: u32) -> Atom {
        Atom {
            sym_index,
            file,
            size,
            alignment,
            code: vec![0; size as usize],
            contained: Vec::new(),
            relocs: Vec::new(),
            rebases: Vec::new(),
            bindings: Vec::new(),
            lazy_bindings: Vec::new(),
            dices: Vec::new(),
            prev: None,
            next: None,
            dbg_info: None,
            dirty: false,
        }
    }

    fn empty() -> Atom {
        Atom::new(0, None, 0, 0)
    }

    pub fn loc(&self) -> SymbolWithLoc {
        SymbolWithLoc {
            sym_index: self.sym_index,
            file: self.file,
        }
    }
}

pub(crate) struct Atoms {
    entries: Vec<Atom>,
}

impl Atoms {
    pub(crate) fn new() -> Atoms {
        Atoms {
            entries: vec![Atom::empty()],
        }
    }

    pub(crate) fn alloc(&mut self, atom: Atom) -> AtomId {
        let id = AtomId::from_usize(self.entries.len());
        self.entries.push(atom);
        id
    }

    pub(crate) fn get(&self, id: AtomId) -> &Atom {
        &self.entries[id.as_usize()]
    }

    pub(crate) fn get_mut(&mut self, id: AtomId) -> &mut Atom {
        &mut self.entries[id.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Surplus factor applied to an atom's size when deciding whether the gap it
/// sits in could host a grown replacement.
pub(crate) fn pad_to_ideal(actual_size: u64) -> u64 {
    actual_size + actual_size / 2
}

/// Below this many spare bytes a gap isn't worth tracking on a free list.
pub(crate) const MIN_TEXT_CAPACITY: u64 = 0x40;

pub(crate) fn free_list_eligible(size: u64, capacity: u64) -> bool {
    capacity >= pad_to_ideal(size) + MIN_TEXT_CAPACITY
}
