//! The linker-global symbol namespace: the globals map maintained by the
//! (external) resolver, the linker's own synthetic symbol table, and string
//! interning for names we invent.

use crate::macho::{make_nlist, Nlist};
use hashbrown::HashMap;
use indexmap::IndexMap;

/// Identifies one symbol table entry anywhere in the link: in an object's
/// table (`file = Some(object_index)`) or in the linker's synthetic table
/// (`file = None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolWithLoc {
    pub sym_index: u32,
    pub file: Option<u32>,
}

impl SymbolWithLoc {
    pub const fn in_object(file: u32, sym_index: u32) -> SymbolWithLoc {
        SymbolWithLoc {
            sym_index,
            file: Some(file),
        }
    }

    pub const fn synthetic(sym_index: u32) -> SymbolWithLoc {
        SymbolWithLoc {
            sym_index,
            file: None,
        }
    }
}

pub(crate) struct SymbolDb {
    /// name -> resolved symbol. Insertion order gives each global a stable
    /// index, which is what bindings record.
    pub(crate) globals: IndexMap<Box<[u8]>, SymbolWithLoc>,
    /// The linker's own symbols (GOT slots, stubs, ...). Index 0 is reserved
    /// for the null symbol so that the empty atom resolves to something.
    pub(crate) synthetic: Vec<Nlist>,
    pub(crate) strtab: StrTab,
}

impl SymbolDb {
    pub(crate) fn new() -> SymbolDb {
        SymbolDb {
            globals: IndexMap::new(),
            synthetic: vec![make_nlist(0, 0, 0, 0, 0)],
            strtab: StrTab::new(),
        }
    }

    pub(crate) fn global(&self, name: &[u8]) -> Option<SymbolWithLoc> {
        self.globals.get(name).copied()
    }

    pub(crate) fn global_index(&self, name: &[u8]) -> Option<u32> {
        self.globals.get_index_of(name).map(|i| i as u32)
    }

    pub(crate) fn contains_global(&self, name: &[u8]) -> bool {
        self.globals.contains_key(name)
    }

    pub(crate) fn define_global(&mut self, name: &[u8], loc: SymbolWithLoc) {
        self.globals.insert(name.into(), loc);
    }

    /// Registers `name` as an undefined global backed by a synthetic symbol,
    /// unless it already resolves to something.
    pub(crate) fn add_undefined(&mut self, name: &[u8]) -> SymbolWithLoc {
        if let Some(loc) = self.global(name) {
            return loc;
        }
        let n_strx = self.strtab.insert(name);
        let sym_index = self.push_synthetic(make_nlist(
            n_strx,
            object::macho::N_UNDF | object::macho::N_EXT,
            0,
            0,
            0,
        ));
        let loc = SymbolWithLoc::synthetic(sym_index);
        self.define_global(name, loc);
        loc
    }

    pub(crate) fn push_synthetic(&mut self, nlist: Nlist) -> u32 {
        let index = self.synthetic.len() as u32;
        self.synthetic.push(nlist);
        index
    }
}

/// An interning string table in Mach-O strtab layout: NUL-terminated strings,
/// offset 0 holding the empty name.
pub(crate) struct StrTab {
    buf: Vec<u8>,
    table: HashMap<Box<[u8]>, u32>,
}

impl StrTab {
    pub(crate) fn new() -> StrTab {
        StrTab {
            buf: vec![0],
            table: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, name: &[u8]) -> u32 {
        if name.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.table.get(name) {
            return offset;
        }
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(name);
        self.buf.push(0);
        self.table.insert(name.into(), offset);
        offset
    }

    pub(crate) fn get(&self, offset: u32) -> &[u8] {
        crate::macho::string_at(&self.buf, offset)
    }
}
