//! x86_64 byte-level helpers for Mach-O relocation resolution.

use object::macho;

/// The extra displacement folded into `X86_64_RELOC_SIGNED_{1,2,4}`
/// relocations. The assembler subtracts it when the relocation target is not
/// at the end of the instruction, and the linker has to add it back.
pub fn signed_correction(r_type: u8) -> Option<i64> {
    match r_type {
        macho::X86_64_RELOC_SIGNED => Some(0),
        macho::X86_64_RELOC_SIGNED_1 => Some(1),
        macho::X86_64_RELOC_SIGNED_2 => Some(2),
        macho::X86_64_RELOC_SIGNED_4 => Some(4),
        _ => None,
    }
}

/// Rewrites the `movq x@TLVP(%rip), %reg` at `offset` into the equivalent
/// `leaq`. A thread-local access to a variable defined in the linked image
/// doesn't need the indirection through a TLV pointer, so the load of the
/// pointer becomes a direct address computation. The opcode byte sits two
/// bytes before the displacement the relocation covers.
pub fn rewrite_tlv_load_to_lea(code: &mut [u8], offset: usize) {
    debug_assert!(offset >= 2);
    code[offset - 2] = 0x8d;
}
