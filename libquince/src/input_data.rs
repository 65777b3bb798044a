//! Maps input files into memory. The engine borrows from these buffers for
//! the lifetime of the link, so an `InputFile` must outlive the `Linker` that
//! parsed it.

use crate::error::Result;
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub struct InputFile {
    pub path: PathBuf,
    /// Stat mtime in seconds; carried into the object's debug info for stab
    /// emission.
    pub mtime: u64,
    backing: Backing,
}

enum Backing {
    Mapped(memmap2::Mmap),
    /// Owned copies are kept 8-aligned so record tables can be cast out of
    /// them at any valid file offset, same as a page-aligned mapping.
    Owned { buf: Vec<u64>, len: usize },
}

impl InputFile {
    pub fn open(path: impl AsRef<Path>) -> Result<InputFile> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mtime = file
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        // Safety: if the file is modified while we're linking, we may read
        // inconsistent bytes. That's the usual trade for not copying inputs.
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        Ok(InputFile {
            path: path.to_owned(),
            mtime,
            backing: Backing::Mapped(mmap),
        })
    }

    pub fn from_bytes(name: impl Into<PathBuf>, bytes: &[u8]) -> InputFile {
        let mut buf = vec![0u64; bytes.len().div_ceil(8)];
        object::pod::bytes_of_slice_mut(&mut buf)[..bytes.len()].copy_from_slice(bytes);
        InputFile {
            path: name.into(),
            mtime: 0,
            backing: Backing::Owned {
                buf,
                len: bytes.len(),
            },
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => mmap,
            Backing::Owned { buf, len } => &object::pod::bytes_of_slice(buf)[..*len],
        }
    }
}
