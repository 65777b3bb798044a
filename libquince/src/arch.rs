use crate::error::LinkError;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    AArch64,
}

impl Architecture {
    pub fn cpu_type(self) -> u32 {
        match self {
            Architecture::X86_64 => object::macho::CPU_TYPE_X86_64,
            Architecture::AArch64 => object::macho::CPU_TYPE_ARM64,
        }
    }
}

impl TryFrom<u32> for Architecture {
    type Error = crate::error::Error;

    fn try_from(cputype: u32) -> Result<Self, Self::Error> {
        match cputype {
            object::macho::CPU_TYPE_X86_64 => Ok(Self::X86_64),
            object::macho::CPU_TYPE_ARM64 => Ok(Self::AArch64),
            other => Err(LinkError::UnsupportedCpuArchitecture(other).into()),
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arch = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::AArch64 => "aarch64",
        };
        write!(f, "{arch}")
    }
}
