//! # Physical File Header
//!
//! Every database file starts with a fixed 16-byte header:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -------------------------------
//! 0       4     Magic bytes 90 db f1 1e
//! 4       1     Format version (only 0 defined)
//! 5       11    Reserved, must be zero
//! ```
//!
//! The free-list table begins at offset 16; the storage stack runs over an
//! offset window that hides the header entirely. The struct uses zerocopy
//! so the header is read and written without intermediate parsing.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StoreError;
use crate::filer::Filer;

pub const MAGIC: [u8; 4] = [0x90, 0xdb, 0xf1, 0x1e];
pub const CURRENT_VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 4],
    version: u8,
    reserved: [u8; 11],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == HEADER_SIZE);

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: CURRENT_VERSION,
            reserved: [0u8; 11],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "buffer too small for file header: {} < {}",
            bytes.len(),
            HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse file header: {:?}", e))?;

        ensure!(header.magic == MAGIC, "invalid magic bytes in file header");
        ensure!(
            header.version == CURRENT_VERSION,
            "unsupported format version: {} (expected {})",
            header.version,
            CURRENT_VERSION
        );

        Ok(header)
    }

    pub fn version(&self) -> u8 {
        self.version
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a fresh header at offset 0 of `f`.
pub fn write_header<F: Filer>(f: &mut F) -> Result<()> {
    let header = FileHeader::new();
    let n = f.write_at(header.as_bytes(), 0)?;
    if n != HEADER_SIZE {
        return Err(StoreError::ShortWrite {
            off: 0,
            expected: HEADER_SIZE,
            written: n,
        }
        .into());
    }
    Ok(())
}

/// Reads and validates the header at offset 0 of `f`.
pub fn check_header<F: Filer>(f: &mut F) -> Result<()> {
    let mut buf = [0u8; HEADER_SIZE];
    let n = f.read_at(&mut buf, 0)?;
    ensure!(
        n == HEADER_SIZE,
        "file too short for a header: {} bytes",
        n
    );
    FileHeader::from_bytes(&buf)?;
    Ok(())
}
