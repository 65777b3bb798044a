pub(crate) use anyhow::Error;
use crate::arch::Architecture;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Error conditions with a stable identity, for callers that need to react to
/// a specific failure rather than report a message. Everything else is plain
/// `anyhow` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The input is not a relocatable Mach-O object file.
    NotObject,
    /// The object's cputype isn't one we can link.
    UnsupportedCpuArchitecture(u32),
    /// The object's cputype doesn't match the output architecture.
    MismatchedCpuArchitecture {
        expected: Architecture,
        found: Architecture,
    },
    /// A relocation sequence is malformed: an ADDEND or SUBTRACTOR entry
    /// without its required successor, or a prefix applied twice.
    UnexpectedRelocationType,
    /// A relocation needs a GOT/TLV slot or thread-local base that doesn't
    /// exist.
    FailedToResolveRelocationTarget,
    /// A computed displacement doesn't fit the instruction's immediate field.
    RelocationOverflow,
    /// A branch displacement beyond what B/BL can encode. Fixing this needs
    /// branch islands, which are not implemented.
    BranchTargetOutOfRange,
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NotObject => write!(f, "not a relocatable object file"),
            LinkError::UnsupportedCpuArchitecture(cputype) => {
                write!(f, "unsupported cputype 0x{cputype:x}")
            }
            LinkError::MismatchedCpuArchitecture { expected, found } => {
                write!(f, "expected {expected} object, found {found}")
            }
            LinkError::UnexpectedRelocationType => {
                write!(f, "unexpected relocation type in relocation sequence")
            }
            LinkError::FailedToResolveRelocationTarget => {
                write!(f, "failed to resolve relocation target")
            }
            LinkError::RelocationOverflow => {
                write!(f, "relocation displacement overflows immediate field")
            }
            LinkError::BranchTargetOutOfRange => {
                write!(
                    f,
                    "branch target out of range (branch islands are not implemented)"
                )
            }
        }
    }
}

impl core::error::Error for LinkError {}
