//! Display names for Mach-O relocation types, used in diagnostics.

use std::borrow::Cow;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::macho::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

pub fn arm64_reloc_type_to_string(r_type: u8) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        ARM64_RELOC_UNSIGNED,
        ARM64_RELOC_SUBTRACTOR,
        ARM64_RELOC_BRANCH26,
        ARM64_RELOC_PAGE21,
        ARM64_RELOC_PAGEOFF12,
        ARM64_RELOC_GOT_LOAD_PAGE21,
        ARM64_RELOC_GOT_LOAD_PAGEOFF12,
        ARM64_RELOC_POINTER_TO_GOT,
        ARM64_RELOC_TLVP_LOAD_PAGE21,
        ARM64_RELOC_TLVP_LOAD_PAGEOFF12,
        ARM64_RELOC_ADDEND
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
    }
}

pub fn x86_64_reloc_type_to_string(r_type: u8) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        X86_64_RELOC_UNSIGNED,
        X86_64_RELOC_SIGNED,
        X86_64_RELOC_BRANCH,
        X86_64_RELOC_GOT_LOAD,
        X86_64_RELOC_GOT,
        X86_64_RELOC_SUBTRACTOR,
        X86_64_RELOC_SIGNED_1,
        X86_64_RELOC_SIGNED_2,
        X86_64_RELOC_SIGNED_4,
        X86_64_RELOC_TLV
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reloc_type_names() {
        assert_eq!(
            &arm64_reloc_type_to_string(object::macho::ARM64_RELOC_BRANCH26),
            stringify!(ARM64_RELOC_BRANCH26)
        );
        assert_eq!(
            &x86_64_reloc_type_to_string(object::macho::X86_64_RELOC_TLV),
            stringify!(X86_64_RELOC_TLV)
        );
        assert_eq!(&arm64_reloc_type_to_string(15), "Unknown relocation type 0xf");
    }
}
