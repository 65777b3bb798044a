//! Two-pass relocation handling. During atom creation the raw entries are
//! normalized: ADDEND/SUBTRACTOR prefixes are folded into their successor,
//! targets are resolved to symbols, embedded addends are read out of the
//! code, and GOT/stub/TLV-pointer atoms are synthesized on demand. Much
//! later, once addresses are frozen, the resolver patches each atom's code
//! with architecture-specific encodings. The passes must stay separate:
//! nothing has an address at parse time.

use crate::arch::Architecture;
use crate::atom::{AtomId, Binding};
use crate::error::{LinkError, Result};
use crate::layout::MatchingSection;
use crate::macho::{NlistExt as _, Reloc};
use crate::symbol_db::SymbolWithLoc;
use crate::Linker;
use anyhow::{anyhow, bail, Context as _};
use object::macho::RelocationInfo;
use object::LittleEndian;
use quince_utils::aarch64::{is_arithmetic_op, Instruction};
use quince_utils::bit_misc::{fits_signed, BitExtraction as _};
use quince_utils::macho::{arm64_reloc_type_to_string, x86_64_reloc_type_to_string};
use quince_utils::x86_64::{rewrite_tlv_load_to_lea, signed_correction};
use std::borrow::Cow;

/// A relocation in normalized form, attached to the atom it patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset within the atom's code.
    pub offset: u32,
    pub target: SymbolWithLoc,
    pub addend: i64,
    pub subtractor: Option<SymbolWithLoc>,
    pub pcrel: bool,
    /// Log2 of the patched width in bytes.
    pub length: u8,
    /// Raw Mach-O relocation type; its meaning depends on the architecture.
    pub r_type: u8,
}

/// Where the atom being parsed sits inside its input section.
pub(crate) struct RelocContext {
    /// Atom start relative to the section start.
    pub(crate) base_offset: u64,
    /// Atom start in the object's address space.
    pub(crate) base_addr: u64,
    pub(crate) matching: MatchingSection,
}

impl<'data> Linker<'data> {
    pub(crate) fn parse_relocs(
        &mut self,
        oi: usize,
        atom_id: AtomId,
        relocs: &[Reloc],
        ctx: RelocContext,
    ) -> Result {
        let arch = self.args.arch;
        let mut addend: i64 = 0;
        let mut subtractor: Option<SymbolWithLoc> = None;

        for (index, rel) in relocs.iter().enumerate() {
            let info = rel.info(LittleEndian);
            let next_type = relocs.get(index + 1).map(|r| r.info(LittleEndian).r_type);

            // ADDEND and SUBTRACTOR are strict two-record prefixes: they
            // carry state for the next entry and emit nothing themselves.
            match (arch, info.r_type) {
                (Architecture::AArch64, object::macho::ARM64_RELOC_ADDEND) => {
                    if addend != 0 {
                        return Err(anyhow!(LinkError::UnexpectedRelocationType))
                            .context("ADDEND applied twice");
                    }
                    // The displacement rides in the symbol-number field,
                    // as an unsigned 24-bit payload.
                    addend = i64::from(info.r_symbolnum);
                    match next_type {
                        Some(
                            object::macho::ARM64_RELOC_PAGE21
                            | object::macho::ARM64_RELOC_PAGEOFF12,
                        ) => {}
                        _ => {
                            return Err(anyhow!(LinkError::UnexpectedRelocationType))
                                .context("ADDEND must be followed by PAGE21 or PAGEOFF12");
                        }
                    }
                    continue;
                }
                (Architecture::AArch64, object::macho::ARM64_RELOC_SUBTRACTOR)
                | (Architecture::X86_64, object::macho::X86_64_RELOC_SUBTRACTOR) => {
                    if subtractor.is_some() {
                        return Err(anyhow!(LinkError::UnexpectedRelocationType))
                            .context("SUBTRACTOR applied twice");
                    }
                    subtractor = Some(self.reloc_symbol_target(oi, &info)?);
                    let unsigned = match arch {
                        Architecture::AArch64 => object::macho::ARM64_RELOC_UNSIGNED,
                        Architecture::X86_64 => object::macho::X86_64_RELOC_UNSIGNED,
                    };
                    if next_type != Some(unsigned) {
                        return Err(anyhow!(LinkError::UnexpectedRelocationType))
                            .context("SUBTRACTOR must be followed by UNSIGNED");
                    }
                    continue;
                }
                _ => {}
            }

            let target = self.parse_reloc_target(oi, &info)?;
            let offset = (u64::from(info.r_address) - ctx.base_offset) as u32;
            let addend_out = match arch {
                Architecture::AArch64 => self.parse_side_effects_aarch64(
                    oi, atom_id, &info, &ctx, offset, target, addend, subtractor,
                )?,
                Architecture::X86_64 => self.parse_side_effects_x86_64(
                    oi, atom_id, &info, &ctx, offset, target, subtractor,
                )?,
            };

            self.atoms.get_mut(atom_id).relocs.push(Relocation {
                offset,
                target,
                addend: addend_out,
                subtractor,
                pcrel: info.r_pcrel,
                length: info.r_length,
                r_type: info.r_type,
            });
            addend = 0;
            subtractor = None;
        }
        Ok(())
    }

    /// Resolves who a relocation names: a section (synthesizing its stand-in
    /// symbol) or a symbol, locally if it's private to the object and
    /// through the globals map otherwise.
    fn parse_reloc_target(&mut self, oi: usize, info: &RelocationInfo) -> Result<SymbolWithLoc> {
        if !info.r_extern {
            let sect_index = info
                .r_symbolnum
                .checked_sub(1)
                .filter(|&i| (i as usize) < self.objects[oi].sections.len())
                .ok_or_else(|| anyhow!("relocation names nonexistent section {}", info.r_symbolnum))?
                as usize;
            let sym_index = self.section_symbol(oi, sect_index);
            return Ok(SymbolWithLoc::in_object(oi as u32, sym_index));
        }
        self.reloc_symbol_target(oi, info)
    }

    fn reloc_symbol_target(&self, oi: usize, info: &RelocationInfo) -> Result<SymbolWithLoc> {
        let sym_index = info.r_symbolnum;
        let sym = self.objects[oi]
            .symtab
            .get(sym_index as usize)
            .copied()
            .ok_or_else(|| anyhow!("relocation names nonexistent symbol {sym_index}"))?;
        if sym.sect() && !sym.ext() {
            return Ok(SymbolWithLoc::in_object(oi as u32, sym_index));
        }
        let name = self.objects[oi].symbol_name(sym_index);
        self.symbol_db.global(name).ok_or_else(|| {
            anyhow!(
                "symbol {} has not been resolved to a global",
                String::from_utf8_lossy(name)
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_side_effects_aarch64(
        &mut self,
        oi: usize,
        atom_id: AtomId,
        info: &RelocationInfo,
        ctx: &RelocContext,
        offset: u32,
        target: SymbolWithLoc,
        prefix_addend: i64,
        subtractor: Option<SymbolWithLoc>,
    ) -> Result<i64> {
        match info.r_type {
            object::macho::ARM64_RELOC_BRANCH26 => {
                if self.symbol(target).undf() {
                    self.add_stub_entry(target)?;
                }
                Ok(0)
            }
            object::macho::ARM64_RELOC_GOT_LOAD_PAGE21
            | object::macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12
            | object::macho::ARM64_RELOC_POINTER_TO_GOT => {
                self.add_got_entry(target)?;
                Ok(0)
            }
            object::macho::ARM64_RELOC_TLVP_LOAD_PAGE21
            | object::macho::ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                if self.symbol(target).undf() {
                    self.add_tlv_ptr_entry(target)?;
                }
                Ok(0)
            }
            object::macho::ARM64_RELOC_PAGE21 | object::macho::ARM64_RELOC_PAGEOFF12 => {
                Ok(prefix_addend)
            }
            object::macho::ARM64_RELOC_UNSIGNED => {
                self.parse_unsigned(oi, atom_id, info, ctx.matching, offset, target, subtractor)
            }
            other => {
                tracing::warn!(
                    "storing relocation type {} without side effects",
                    arm64_reloc_type_to_string(other)
                );
                Ok(0)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_side_effects_x86_64(
        &mut self,
        oi: usize,
        atom_id: AtomId,
        info: &RelocationInfo,
        ctx: &RelocContext,
        offset: u32,
        target: SymbolWithLoc,
        subtractor: Option<SymbolWithLoc>,
    ) -> Result<i64> {
        match info.r_type {
            object::macho::X86_64_RELOC_BRANCH => {
                if self.symbol(target).undf() {
                    self.add_stub_entry(target)?;
                }
                self.read_embedded_i32(atom_id, offset)
            }
            object::macho::X86_64_RELOC_GOT | object::macho::X86_64_RELOC_GOT_LOAD => {
                self.add_got_entry(target)?;
                self.read_embedded_i32(atom_id, offset)
            }
            object::macho::X86_64_RELOC_TLV => {
                if self.symbol(target).undf() {
                    self.add_tlv_ptr_entry(target)?;
                }
                self.read_embedded_i32(atom_id, offset)
            }
            object::macho::X86_64_RELOC_SIGNED
            | object::macho::X86_64_RELOC_SIGNED_1
            | object::macho::X86_64_RELOC_SIGNED_2
            | object::macho::X86_64_RELOC_SIGNED_4 => {
                let correction = signed_correction(info.r_type).unwrap_or(0);
                let mut addend = self.read_embedded_i32(atom_id, offset)? + correction;
                if !info.r_extern {
                    // The embedded displacement is end-of-instruction
                    // relative; rebase it to be section-relative.
                    let sect = self.objects[oi].sections[(info.r_symbolnum - 1) as usize];
                    addend += (ctx.base_addr + u64::from(offset) + 4) as i64
                        - sect.addr.get(LittleEndian) as i64;
                }
                Ok(addend)
            }
            object::macho::X86_64_RELOC_UNSIGNED => {
                self.parse_unsigned(oi, atom_id, info, ctx.matching, offset, target, subtractor)
            }
            other => {
                tracing::warn!(
                    "storing relocation type {} without side effects",
                    x86_64_reloc_type_to_string(other)
                );
                Ok(0)
            }
        }
    }

    /// Shared UNSIGNED handling: pull the addend out of the code, and decide
    /// whether the dynamic loader needs to slide (rebase) or write (bind)
    /// this pointer. Subtracted pairs are position independent and need
    /// neither.
    #[allow(clippy::too_many_arguments)]
    fn parse_unsigned(
        &mut self,
        oi: usize,
        atom_id: AtomId,
        info: &RelocationInfo,
        matching: MatchingSection,
        offset: u32,
        target: SymbolWithLoc,
        subtractor: Option<SymbolWithLoc>,
    ) -> Result<i64> {
        let code = &self.atoms.get(atom_id).code;
        let mut addend = match info.r_length {
            2 => i64::from(read_i32(code, offset)?),
            3 => read_i64(code, offset)?,
            other => bail!("UNSIGNED relocation with r_length {other}"),
        };
        if !info.r_extern {
            let sect = self.objects[oi].sections[(info.r_symbolnum - 1) as usize];
            addend -= sect.addr.get(LittleEndian) as i64;
        }

        if subtractor.is_none() {
            if self.symbol(target).undf() {
                let global_index = self.global_index_for(target)?;
                self.atoms.get_mut(atom_id).bindings.push(Binding {
                    global_index,
                    offset: offset.into(),
                });
            } else if info.r_length == 3 && self.section_allows_rebase(matching) {
                self.atoms.get_mut(atom_id).rebases.push(offset.into());
            }
        }
        Ok(addend)
    }

    fn read_embedded_i32(&self, atom_id: AtomId, offset: u32) -> Result<i64> {
        Ok(i64::from(read_i32(&self.atoms.get(atom_id).code, offset)?))
    }

    /// Patches every atom's code with final addresses. Run once the host has
    /// frozen virtual addresses.
    pub fn resolve_relocs(&mut self) -> Result {
        for index in 1..self.atoms.len() {
            let atom_id = AtomId::from_usize(index);
            if self.atoms.get(atom_id).relocs.is_empty() {
                continue;
            }
            self.resolve_atom_relocs(atom_id)?;
        }
        Ok(())
    }

    pub fn resolve_atom_relocs(&mut self, atom_id: AtomId) -> Result {
        let relocs = self.atoms.get(atom_id).relocs.clone();
        let loc = self.atoms.get(atom_id).loc();
        let sym = self.symbol(loc);
        let source_base = sym.value();
        let is_tlv = self.section_is_thread_local_variables(sym.n_sect);

        let mut code = std::mem::take(&mut self.atoms.get_mut(atom_id).code);
        let result = relocs.iter().try_for_each(|rel| {
            self.resolve_one(rel, source_base, is_tlv, &mut code)
                .with_context(|| {
                    format!(
                        "applying {} at offset 0x{:x}",
                        self.reloc_type_string(rel.r_type),
                        rel.offset
                    )
                })
        });
        self.atoms.get_mut(atom_id).code = code;
        result
    }

    fn resolve_one(
        &self,
        rel: &Relocation,
        source_base: u64,
        is_tlv: bool,
        code: &mut [u8],
    ) -> Result {
        let source_addr = source_base + u64::from(rel.offset);

        let target_atom = self.target_atom_for(rel)?;
        let mut target_addr = match target_atom {
            Some(target_id) => {
                // When the relocation names a sub-symbol contained in the
                // target atom, its own address is the right one; the atom's
                // defining symbol only stands in for foreign references.
                let target = self.atoms.get(target_id);
                if target.file == rel.target.file {
                    self.symbol(rel.target).value() as i64
                } else {
                    self.symbol(target.loc()).value() as i64
                }
            }
            None => {
                let name = self.symbol_name(rel.target);
                if self.symbol_db.contains_global(name) {
                    // Atomless globals like ___dso_handle still carry an
                    // address.
                    self.symbol(rel.target).value() as i64
                } else {
                    tracing::warn!(
                        "no atom or global for relocation target {}, assuming address 0",
                        String::from_utf8_lossy(name)
                    );
                    0
                }
            }
        };

        if is_tlv {
            // Thread-local references are offsets from the start of the
            // thread-local region, not absolute addresses.
            target_addr -= self.tlv_base_address()? as i64;
        }

        match self.args.arch {
            Architecture::AArch64 => self.resolve_aarch64(rel, source_addr, target_addr, code),
            Architecture::X86_64 => self.resolve_x86_64(rel, source_addr, target_addr, code),
        }
    }

    fn resolve_aarch64(
        &self,
        rel: &Relocation,
        source_addr: u64,
        target_addr: i64,
        code: &mut [u8],
    ) -> Result {
        match rel.r_type {
            object::macho::ARM64_RELOC_BRANCH26 => {
                let displacement = target_addr - source_addr as i64;
                if !fits_signed(displacement, 28) {
                    return Err(anyhow!(LinkError::BranchTargetOutOfRange));
                }
                let insn = match Instruction::decode(read_u32(code, rel.offset)?) {
                    Instruction::Branch { link, .. } => Instruction::Branch {
                        link,
                        imm26: ((displacement >> 2) as u32) & 0x3ff_ffff,
                    },
                    _ => bail!("BRANCH26 against a non-branch instruction"),
                };
                write_u32(code, rel.offset, insn.encode())
            }
            object::macho::ARM64_RELOC_PAGE21
            | object::macho::ARM64_RELOC_GOT_LOAD_PAGE21
            | object::macho::ARM64_RELOC_TLVP_LOAD_PAGE21 => {
                let pages = ((target_addr + rel.addend) >> 12) - ((source_addr as i64) >> 12);
                if !fits_signed(pages, 21) {
                    return Err(anyhow!(LinkError::RelocationOverflow));
                }
                let insn = match Instruction::decode(read_u32(code, rel.offset)?) {
                    Instruction::PcRelativeAddress { rd, page, .. } => {
                        Instruction::PcRelativeAddress {
                            rd,
                            immlo: (pages & 0b11) as u8,
                            immhi: ((pages >> 2) as u32) & 0x7_ffff,
                            page,
                        }
                    }
                    _ => bail!("PAGE21 against a non-ADRP instruction"),
                };
                write_u32(code, rel.offset, insn.encode())
            }
            object::macho::ARM64_RELOC_PAGEOFF12 => {
                let narrowed = ((target_addr + rel.addend) as u64).low_bits(12);
                let word = read_u32(code, rel.offset)?;
                let insn = if is_arithmetic_op(&word.to_le_bytes()) {
                    match Instruction::decode(word) {
                        Instruction::AddSubImmediate {
                            rd,
                            rn,
                            shift,
                            set_flags,
                            sub,
                            sf,
                            ..
                        } => Instruction::AddSubImmediate {
                            rd,
                            rn,
                            imm12: narrowed as u16,
                            shift,
                            set_flags,
                            sub,
                            sf,
                        },
                        _ => bail!("PAGEOFF12 against an unexpected instruction"),
                    }
                } else {
                    match Instruction::decode(word) {
                        Instruction::LoadStoreRegister {
                            rt,
                            rn,
                            size,
                            v,
                            opc,
                            ..
                        } => Instruction::LoadStoreRegister {
                            rt,
                            rn,
                            imm12: (narrowed / Instruction::load_store_scale(size, v)) as u16,
                            size,
                            v,
                            opc,
                        },
                        _ => bail!("PAGEOFF12 against an unexpected instruction"),
                    }
                };
                write_u32(code, rel.offset, insn.encode())
            }
            object::macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12 => {
                let narrowed = ((target_addr + rel.addend) as u64).low_bits(12);
                let insn = match Instruction::decode(read_u32(code, rel.offset)?) {
                    Instruction::LoadStoreRegister {
                        rt,
                        rn,
                        size,
                        v,
                        opc,
                        ..
                    } => Instruction::LoadStoreRegister {
                        rt,
                        rn,
                        // Pointer-sized load out of the GOT.
                        imm12: (narrowed / 8) as u16,
                        size,
                        v,
                        opc,
                    },
                    _ => bail!("GOT_LOAD_PAGEOFF12 against a non-load instruction"),
                };
                write_u32(code, rel.offset, insn.encode())
            }
            object::macho::ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                let narrowed = (target_addr as u64).low_bits(12);
                let (reg, rn) = match Instruction::decode(read_u32(code, rel.offset)?) {
                    Instruction::LoadStoreRegister { rt, rn, .. } => (rt, rn),
                    Instruction::AddSubImmediate { rd, rn, .. } => (rd, rn),
                    _ => bail!("TLVP_LOAD_PAGEOFF12 against an unexpected instruction"),
                };
                // Through a TLV pointer slot this is a pointer load; against
                // a local thread-local it degrades to address arithmetic.
                let insn = if self.tlv_ptr_entries_table.contains_key(&rel.target) {
                    Instruction::LoadStoreRegister {
                        rt: reg,
                        rn,
                        imm12: (narrowed / 8) as u16,
                        size: 0b11,
                        v: false,
                        opc: 0b01,
                    }
                } else {
                    Instruction::AddSubImmediate {
                        rd: reg,
                        rn,
                        imm12: narrowed as u16,
                        shift: false,
                        set_flags: false,
                        sub: false,
                        sf: true,
                    }
                };
                write_u32(code, rel.offset, insn.encode())
            }
            object::macho::ARM64_RELOC_POINTER_TO_GOT => {
                let displacement = target_addr - source_addr as i64;
                if !fits_signed(displacement, 32) {
                    return Err(anyhow!(LinkError::RelocationOverflow));
                }
                write_u32(code, rel.offset, displacement as u32)
            }
            object::macho::ARM64_RELOC_UNSIGNED => self.resolve_unsigned(rel, target_addr, code),
            object::macho::ARM64_RELOC_SUBTRACTOR | object::macho::ARM64_RELOC_ADDEND => {
                unreachable!("prefix relocations are consumed during parsing")
            }
            other => bail!(
                "cannot resolve relocation type {}",
                arm64_reloc_type_to_string(other)
            ),
        }
    }

    fn resolve_x86_64(
        &self,
        rel: &Relocation,
        source_addr: u64,
        target_addr: i64,
        code: &mut [u8],
    ) -> Result {
        match rel.r_type {
            object::macho::X86_64_RELOC_BRANCH
            | object::macho::X86_64_RELOC_GOT
            | object::macho::X86_64_RELOC_GOT_LOAD => {
                self.write_pcrel32(rel, source_addr, target_addr, code)
            }
            object::macho::X86_64_RELOC_TLV => {
                if !self.tlv_ptr_entries_table.contains_key(&rel.target) {
                    // The variable is defined in-image: no pointer slot to
                    // load, so the movq becomes a leaq of the descriptor.
                    rewrite_tlv_load_to_lea(code, rel.offset as usize);
                }
                self.write_pcrel32(rel, source_addr, target_addr, code)
            }
            object::macho::X86_64_RELOC_SIGNED
            | object::macho::X86_64_RELOC_SIGNED_1
            | object::macho::X86_64_RELOC_SIGNED_2
            | object::macho::X86_64_RELOC_SIGNED_4 => {
                let correction = signed_correction(rel.r_type).unwrap_or(0);
                let displacement =
                    target_addr + rel.addend - (source_addr as i64 + correction + 4);
                if !fits_signed(displacement, 32) {
                    return Err(anyhow!(LinkError::RelocationOverflow));
                }
                write_u32(code, rel.offset, displacement as u32)
            }
            object::macho::X86_64_RELOC_UNSIGNED => self.resolve_unsigned(rel, target_addr, code),
            object::macho::X86_64_RELOC_SUBTRACTOR => {
                unreachable!("prefix relocations are consumed during parsing")
            }
            other => bail!(
                "cannot resolve relocation type {}",
                x86_64_reloc_type_to_string(other)
            ),
        }
    }

    fn write_pcrel32(
        &self,
        rel: &Relocation,
        source_addr: u64,
        target_addr: i64,
        code: &mut [u8],
    ) -> Result {
        let displacement = target_addr - source_addr as i64 - 4 + rel.addend;
        if !fits_signed(displacement, 32) {
            return Err(anyhow!(LinkError::RelocationOverflow));
        }
        write_u32(code, rel.offset, displacement as u32)
    }

    fn resolve_unsigned(&self, rel: &Relocation, target_addr: i64, code: &mut [u8]) -> Result {
        if self.symbol(rel.target).undf() {
            // A binding was recorded at parse time; the dynamic loader owns
            // these bytes.
            return Ok(());
        }
        let mut result = target_addr + rel.addend;
        if let Some(subtractor) = rel.subtractor {
            result -= self.symbol(subtractor).value() as i64;
        }
        match rel.length {
            2 => write_u32(code, rel.offset, result as u32),
            3 => write_u64(code, rel.offset, result as u64),
            other => bail!("UNSIGNED relocation with length {other}"),
        }
    }

    /// Which atom supplies the target address: the GOT slot for GOT-class
    /// types, then a stub or TLV pointer slot if the target has one, then
    /// whatever atom owns the target symbol.
    fn target_atom_for(&self, rel: &Relocation) -> Result<Option<AtomId>> {
        if self.is_got_class(rel.r_type) {
            let index = self
                .got_entries_table
                .get(&rel.target)
                .copied()
                .ok_or(LinkError::FailedToResolveRelocationTarget)
                .context("GOT-class relocation without a GOT entry")?;
            return Ok(Some(self.got_entries[index as usize].atom));
        }
        if let Some(&index) = self.stubs_table.get(&rel.target) {
            return Ok(Some(self.stubs[index as usize].stub_atom));
        }
        if let Some(&index) = self.tlv_ptr_entries_table.get(&rel.target) {
            return Ok(Some(self.tlv_ptr_entries[index as usize].atom));
        }
        Ok(self.atom_for_symbol(rel.target))
    }

    fn is_got_class(&self, r_type: u8) -> bool {
        match self.args.arch {
            Architecture::AArch64 => matches!(
                r_type,
                object::macho::ARM64_RELOC_GOT_LOAD_PAGE21
                    | object::macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12
                    | object::macho::ARM64_RELOC_POINTER_TO_GOT
            ),
            Architecture::X86_64 => matches!(
                r_type,
                object::macho::X86_64_RELOC_GOT | object::macho::X86_64_RELOC_GOT_LOAD
            ),
        }
    }

    fn reloc_type_string(&self, r_type: u8) -> Cow<'static, str> {
        match self.args.arch {
            Architecture::AArch64 => arm64_reloc_type_to_string(r_type),
            Architecture::X86_64 => x86_64_reloc_type_to_string(r_type),
        }
    }
}

fn reloc_bytes(code: &[u8], offset: u32, width: usize) -> Result<&[u8]> {
    code.get(offset as usize..offset as usize + width)
        .ok_or_else(|| anyhow!("relocation offset 0x{offset:x} out of atom bounds"))
}

fn reloc_bytes_mut(code: &mut [u8], offset: u32, width: usize) -> Result<&mut [u8]> {
    code.get_mut(offset as usize..offset as usize + width)
        .ok_or_else(|| anyhow!("relocation offset 0x{offset:x} out of atom bounds"))
}

fn read_u32(code: &[u8], offset: u32) -> Result<u32> {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(reloc_bytes(code, offset, 4)?);
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(code: &[u8], offset: u32) -> Result<i32> {
    Ok(read_u32(code, offset)? as i32)
}

fn read_i64(code: &[u8], offset: u32) -> Result<i64> {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(reloc_bytes(code, offset, 8)?);
    Ok(i64::from_le_bytes(bytes))
}

fn write_u32(code: &mut [u8], offset: u32, value: u32) -> Result {
    reloc_bytes_mut(code, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_u64(code: &mut [u8], offset: u32, value: u64) -> Result {
    reloc_bytes_mut(code, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::args::Args;
    use crate::input_data::InputFile;
    use crate::test_support::{
        global, local, raw_reloc, resolve_globals, undef, ObjectBuilder, SectionSpec,
    };

    fn linker_with<'data>(
        arch: Architecture,
        input: &'data InputFile,
    ) -> (Linker<'data>, u32) {
        let mut linker = Linker::new(Args::new(arch));
        let oi = linker.add_object(input).unwrap();
        resolve_globals(&mut linker, oi);
        (linker, oi)
    }

    fn atom_of(linker: &Linker<'_>, oi: u32, sym_index: u32) -> AtomId {
        linker
            .atom_for_symbol(SymbolWithLoc::in_object(oi, sym_index))
            .unwrap()
    }

    #[test]
    fn test_aarch64_branch26() {
        let code = [0x9400_0000u32, 0xd503_201f]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, code)
                    .align(2)
                    .relocs(vec![raw_reloc(
                        0,
                        1,
                        true,
                        2,
                        true,
                        object::macho::ARM64_RELOC_BRANCH26,
                    )]),
            )
            .symbol(global(b"_caller", 1, 0))
            .symbol(global(b"_target", 1, 4))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x1010);
        linker.resolve_relocs().unwrap();

        let caller = linker.atom(atom_of(&linker, oi, 0));
        assert_eq!(&caller.code[0..4], 0x9400_0004u32.to_le_bytes());
    }

    #[test]
    fn test_x86_64_branch() {
        let bytes = ObjectBuilder::new(Architecture::X86_64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, vec![0xe8, 0, 0, 0, 0, 0, 0, 0])
                    .align(0)
                    .relocs(vec![raw_reloc(
                        1,
                        1,
                        true,
                        2,
                        true,
                        object::macho::X86_64_RELOC_BRANCH,
                    )]),
            )
            .symbol(global(b"_caller", 1, 0))
            .symbol(global(b"_target", 1, 5))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::X86_64, &input);
        linker.split_into_atoms(oi).unwrap();

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x1020);
        linker.resolve_relocs().unwrap();

        let caller = linker.atom(atom_of(&linker, oi, 0));
        assert_eq!(&caller.code[0..5], [0xe8, 0x1b, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_aarch64_adrp_add_pair() {
        let code = [0x9000_0000u32, 0x9100_0000]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, code)
                    .align(2)
                    .relocs(vec![
                        raw_reloc(4, 1, false, 2, true, object::macho::ARM64_RELOC_PAGEOFF12),
                        raw_reloc(0, 1, true, 2, true, object::macho::ARM64_RELOC_PAGE21),
                    ]),
            )
            .symbol(global(b"_fn", 1, 0))
            .section(SectionSpec::new(b"__DATA", b"__data", 0x100, vec![0; 8]))
            .symbol(global(b"_var", 2, 0x100))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x200_1234);
        linker.resolve_relocs().unwrap();

        let code = &linker.atom(atom_of(&linker, oi, 0)).code;
        let adrp = u32::from_le_bytes(code[0..4].try_into().unwrap());
        match Instruction::decode(adrp) {
            Instruction::PcRelativeAddress {
                immlo,
                immhi,
                page: true,
                ..
            } => {
                let pages = (u64::from(immhi) << 2) | u64::from(immlo);
                assert_eq!(pages, 0x2000);
            }
            other => panic!("expected ADRP, decoded {other:?}"),
        }
        let add = u32::from_le_bytes(code[4..8].try_into().unwrap());
        match Instruction::decode(add) {
            Instruction::AddSubImmediate { imm12, .. } => assert_eq!(imm12, 0x234),
            other => panic!("expected ADD, decoded {other:?}"),
        }
    }

    #[test]
    fn test_unsigned_rebase() {
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(SectionSpec::new(b"__TEXT", b"__text", 0, vec![0; 8]))
            .symbol(global(b"_target", 1, 0))
            .section(
                SectionSpec::new(b"__DATA", b"__const", 0x100, 0x10u64.to_le_bytes().to_vec())
                    .relocs(vec![raw_reloc(
                        0,
                        0,
                        false,
                        3,
                        true,
                        object::macho::ARM64_RELOC_UNSIGNED,
                    )]),
            )
            .symbol(global(b"_ptr", 2, 0x100))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();

        let ptr = atom_of(&linker, oi, 1);
        assert_eq!(linker.atom(ptr).rebases, [0]);
        assert!(linker.atom(ptr).bindings.is_empty());
        assert_eq!(linker.atom(ptr).relocs[0].addend, 0x10);

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x3000);
        linker.resolve_relocs().unwrap();
        assert_eq!(linker.atom(ptr).code, 0x3010u64.to_le_bytes());
    }

    #[test]
    fn test_unsigned_binding_leaves_code_alone() {
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__DATA", b"__const", 0, 0x10u64.to_le_bytes().to_vec())
                    .relocs(vec![raw_reloc(
                        0,
                        1,
                        false,
                        3,
                        true,
                        object::macho::ARM64_RELOC_UNSIGNED,
                    )]),
            )
            .symbol(global(b"_ptr", 1, 0))
            .symbol(undef(b"_printf"))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();

        let ptr = atom_of(&linker, oi, 0);
        assert!(linker.atom(ptr).rebases.is_empty());
        let expected_index = linker.global_index(b"_printf").unwrap();
        assert_eq!(
            linker.atom(ptr).bindings,
            [Binding {
                global_index: expected_index,
                offset: 0,
            }]
        );

        linker.resolve_relocs().unwrap();
        // The dynamic loader owns these bytes; the embedded addend stays.
        assert_eq!(linker.atom(ptr).code, 0x10u64.to_le_bytes());
    }

    #[test]
    fn test_subtractor_pair() {
        let bytes = ObjectBuilder::new(Architecture::X86_64)
            .section(SectionSpec::new(b"__TEXT", b"__text", 0, vec![0; 8]).align(2))
            .symbol(global(b"_a", 1, 0))
            .symbol(global(b"_b", 1, 4))
            .section(
                SectionSpec::new(b"__DATA", b"__data", 0x40, vec![0; 8]).relocs(vec![
                    raw_reloc(0, 0, false, 3, true, object::macho::X86_64_RELOC_SUBTRACTOR),
                    raw_reloc(0, 1, false, 3, true, object::macho::X86_64_RELOC_UNSIGNED),
                ]),
            )
            .symbol(global(b"_d", 2, 0x40))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::X86_64, &input);
        linker.split_into_atoms(oi).unwrap();

        let d = atom_of(&linker, oi, 2);
        let relocs = &linker.atom(d).relocs;
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].subtractor, Some(SymbolWithLoc::in_object(oi, 0)));
        assert_eq!(relocs[0].target, SymbolWithLoc::in_object(oi, 1));
        assert_eq!(relocs[0].addend, 0);
        // A subtracted pair is position independent.
        assert!(linker.atom(d).rebases.is_empty());

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x1020);
        linker.resolve_relocs().unwrap();
        assert_eq!(linker.atom(d).code, 0x20u64.to_le_bytes());
    }

    #[test]
    fn test_subtractor_requires_unsigned_successor() {
        let bytes = ObjectBuilder::new(Architecture::X86_64)
            .section(
                SectionSpec::new(b"__DATA", b"__data", 0, vec![0; 8]).relocs(vec![
                    raw_reloc(0, 0, false, 3, true, object::macho::X86_64_RELOC_SUBTRACTOR),
                    raw_reloc(0, 1, true, 2, true, object::macho::X86_64_RELOC_BRANCH),
                ]),
            )
            .symbol(global(b"_a", 1, 0))
            .symbol(global(b"_b", 1, 4))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::X86_64, &input);
        let err = linker.split_into_atoms(oi).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::UnexpectedRelocationType)
        );
    }

    #[test]
    fn test_addend_prefix_applies_to_successor() {
        let code = [0x9000_0000u32, 0x9100_0000]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, code)
                    .align(2)
                    .relocs(vec![
                        raw_reloc(0, 0x10, false, 2, false, object::macho::ARM64_RELOC_ADDEND),
                        raw_reloc(0, 1, true, 2, true, object::macho::ARM64_RELOC_PAGE21),
                    ]),
            )
            .symbol(global(b"_fn", 1, 0))
            .symbol(undef(b"_var"))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();

        let relocs = &linker.atom(atom_of(&linker, oi, 0)).relocs;
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].r_type, object::macho::ARM64_RELOC_PAGE21);
        assert_eq!(relocs[0].addend, 0x10);
    }

    #[test]
    fn test_addend_requires_page_successor() {
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, vec![0; 8]).relocs(vec![
                    raw_reloc(0, 0x10, false, 2, false, object::macho::ARM64_RELOC_ADDEND),
                    raw_reloc(0, 1, true, 2, true, object::macho::ARM64_RELOC_BRANCH26),
                ]),
            )
            .symbol(global(b"_fn", 1, 0))
            .symbol(undef(b"_var"))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        let err = linker.split_into_atoms(oi).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::UnexpectedRelocationType)
        );
    }

    #[test]
    fn test_got_load_resolves_through_got_atom() {
        let code = [0x9000_0008u32, 0xf940_0108]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, code)
                    .align(2)
                    .relocs(vec![
                        raw_reloc(
                            4,
                            1,
                            false,
                            2,
                            true,
                            object::macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12,
                        ),
                        raw_reloc(
                            0,
                            1,
                            true,
                            2,
                            true,
                            object::macho::ARM64_RELOC_GOT_LOAD_PAGE21,
                        ),
                    ]),
            )
            .symbol(global(b"_fn", 1, 0))
            .symbol(undef(b"_malloc"))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();
        assert_eq!(linker.got_entries().len(), 1);

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        let got_loc = linker.atom(linker.got_entries()[0].atom).loc();
        linker.set_symbol_address(got_loc, 0x2008);
        linker.resolve_relocs().unwrap();

        let code = &linker.atom(atom_of(&linker, oi, 0)).code;
        let adrp = u32::from_le_bytes(code[0..4].try_into().unwrap());
        match Instruction::decode(adrp) {
            Instruction::PcRelativeAddress { immlo, immhi, .. } => {
                assert_eq!((u64::from(immhi) << 2) | u64::from(immlo), 1);
            }
            other => panic!("expected ADRP, decoded {other:?}"),
        }
        let ldr = u32::from_le_bytes(code[4..8].try_into().unwrap());
        match Instruction::decode(ldr) {
            Instruction::LoadStoreRegister { imm12, .. } => assert_eq!(imm12, 1),
            other => panic!("expected LDR, decoded {other:?}"),
        }
    }

    #[test]
    fn test_branch_to_undefined_goes_through_stub() {
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, 0x9400_0000u32.to_le_bytes().to_vec())
                    .align(2)
                    .relocs(vec![raw_reloc(
                        0,
                        1,
                        true,
                        2,
                        true,
                        object::macho::ARM64_RELOC_BRANCH26,
                    )]),
            )
            .symbol(global(b"_caller", 1, 0))
            .symbol(undef(b"_printf"))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();
        assert_eq!(linker.stubs().len(), 1);

        let (stub, laptr, helper) = {
            let entry = &linker.stubs()[0];
            (entry.stub_atom, entry.laptr_atom, entry.helper_atom)
        };
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(linker.atom(stub).loc(), 0x1100);
        linker.set_symbol_address(linker.atom(helper).loc(), 0x1200);
        linker.set_symbol_address(linker.atom(laptr).loc(), 0x2000);
        linker.resolve_relocs().unwrap();

        // The call lands on the stub, not on the (absent) _printf.
        let caller = linker.atom(atom_of(&linker, oi, 0));
        assert_eq!(&caller.code[0..4], 0x9400_0040u32.to_le_bytes());
        // The lazy pointer initially points at the stub helper.
        assert_eq!(linker.atom(laptr).code, 0x1200u64.to_le_bytes());
    }

    #[test]
    fn test_x86_64_tlv_access_to_local_definition_becomes_lea() {
        let bytes = ObjectBuilder::new(Architecture::X86_64)
            .section(
                SectionSpec::new(
                    b"__TEXT",
                    b"__text",
                    0,
                    vec![0x48, 0x8b, 0x05, 0, 0, 0, 0],
                )
                .align(0)
                .relocs(vec![raw_reloc(
                    3,
                    1,
                    true,
                    2,
                    true,
                    object::macho::X86_64_RELOC_TLV,
                )]),
            )
            .symbol(global(b"_f", 1, 0))
            .section(
                SectionSpec::new(b"__DATA", b"__thread_vars", 0x100, vec![0; 24])
                    .flags(object::macho::S_THREAD_LOCAL_VARIABLES),
            )
            .symbol(global(b"_tvar", 2, 0x100))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::X86_64, &input);
        linker.split_into_atoms(oi).unwrap();
        assert!(linker.tlv_ptr_entries().is_empty());

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x2000);
        linker.resolve_relocs().unwrap();

        let code = &linker.atom(atom_of(&linker, oi, 0)).code;
        assert_eq!(code[1], 0x8d);
        let displacement = i32::from_le_bytes(code[3..7].try_into().unwrap());
        assert_eq!(displacement, 0x2000 - 0x1003 - 4);
    }

    #[test]
    fn test_thread_local_pointers_are_region_relative() {
        let bytes = ObjectBuilder::new(Architecture::X86_64)
            .section(
                SectionSpec::new(b"__DATA", b"__thread_vars", 0x40, vec![0; 24])
                    .flags(object::macho::S_THREAD_LOCAL_VARIABLES)
                    .relocs(vec![raw_reloc(
                        16,
                        2,
                        false,
                        3,
                        true,
                        object::macho::X86_64_RELOC_UNSIGNED,
                    )]),
            )
            .symbol(global(b"_tv", 1, 0x40))
            .section(
                SectionSpec::new(b"__DATA", b"__thread_data", 0x100, vec![0; 32])
                    .flags(object::macho::S_THREAD_LOCAL_REGULAR),
            )
            .symbol(local(b"_tfirst", 2, 0x100))
            .symbol(global(b"_tdata", 2, 0x110))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::X86_64, &input);
        linker.split_into_atoms(oi).unwrap();

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x3000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x4000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 2), 0x4010);
        linker.resolve_relocs().unwrap();

        let tv = linker.atom(atom_of(&linker, oi, 0));
        assert_eq!(&tv.code[16..24], &0x10u64.to_le_bytes());
    }

    #[test]
    fn test_branch_out_of_range_is_reported() {
        let bytes = ObjectBuilder::new(Architecture::AArch64)
            .section(
                SectionSpec::new(b"__TEXT", b"__text", 0, 0x9400_0000u32.to_le_bytes().to_vec())
                    .align(2)
                    .relocs(vec![raw_reloc(
                        0,
                        1,
                        true,
                        2,
                        true,
                        object::macho::ARM64_RELOC_BRANCH26,
                    )]),
            )
            .symbol(global(b"_caller", 1, 0))
            .section(SectionSpec::new(b"__TEXT", b"__far", 8, vec![0; 8]))
            .symbol(global(b"_far", 2, 8))
            .build();
        let input = InputFile::from_bytes("t.o", &bytes);
        let (mut linker, oi) = linker_with(Architecture::AArch64, &input);
        linker.split_into_atoms(oi).unwrap();

        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 0), 0x1000);
        linker.set_symbol_address(SymbolWithLoc::in_object(oi, 1), 0x1000_0000);
        let err = linker.resolve_relocs().unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::BranchTargetOutOfRange)
        );
    }
}
