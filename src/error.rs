//! # Error Taxonomy
//!
//! All fallible operations in atomdb return `eyre::Result`. Errors that
//! callers need to distinguish programmatically are raised as [`StoreError`]
//! values and can be recovered from an `eyre::Report` with
//! `report.downcast_ref::<StoreError>()`.
//!
//! ## Classification
//!
//! - [`StoreError::InvalidArgument`] - bad input: negative sizes or offsets,
//!   handles out of range, content exceeding the block size limit, unknown
//!   free-list table kinds. The store is unchanged.
//! - [`StoreError::PermissionDenied`] - a call arrived in the wrong
//!   lifecycle state: mutating a transactional filer outside a transaction,
//!   unbalanced `end_update`/`rollback`, closing with transactions open.
//!   The store is unchanged.
//! - [`StoreError::Corrupt`] - the on-disk structure contradicts itself.
//!   [`CorruptKind`] names the specific contradiction and the error carries
//!   the byte offset where it was observed. No local repair is attempted;
//!   the bytes are left exactly as the error describes them.
//! - [`StoreError::InvalidWal`] - the write-ahead log cannot be replayed.
//!   Carries the WAL path and a reason.
//! - [`StoreError::ShortWrite`] - a backing store accepted fewer bytes than
//!   requested.
//! - [`StoreError::UnexpectedEof`] - a read needed bytes past the end of
//!   the backing store; reported where block metadata should have been.
//!
//! Corruption errors are terminal for the operation that hit them. The
//! verifier routes them through a caller-supplied sink instead so a batch
//! audit can keep going.

use std::path::PathBuf;

use thiserror::Error;

/// The specific structural contradiction behind a [`StoreError::Corrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    /// A free-block tag was required but something else was read.
    ExpectedFreeTag,
    /// A used-block tag was required but a free tag was read.
    ExpectedUsedTag,
    /// A free-list head points at a block whose prev link is not nil.
    ListHead,
    /// A free-list head block is smaller than the requested allocation.
    BlockTooSmall,
    /// A used block's tail content-code byte is not a known value.
    TailTag,
    /// Two free blocks are adjacent; they should have been coalesced.
    AdjacentFree,
    /// A free block ends at the file tail; it should have been truncated.
    FreeTailBlock,
    /// A single-atom free block's tail tag does not match its head tag.
    ShortFreeTailTag,
    /// A long free block claims fewer than two atoms.
    LongFreeTooShort,
    /// A long free block extends past the end of the file.
    LongFreeTooLong,
    /// A long free block's prev link points past the end of the file.
    LongFreePrevBeyondEof,
    /// A long free block's next link points past the end of the file.
    LongFreeNextBeyondEof,
    /// A long free block's tail tag does not match its head tag.
    LongFreeTailTag,
    /// A long free block's head size and tail size disagree.
    TailSizeMismatch,
    /// A used block extends past the end of the file.
    UsedBeyondEof,
    /// Padding bytes between content and the tail are not zero.
    Padding,
    /// A relocated block's target handle is nil.
    NullRelocation,
    /// A relocated block's target handle points past the end of the file.
    RelocationBeyondEof,
    /// A relocated block points at a free or another relocated block.
    InvalidRelocationTarget,
    /// A relocated block was found where only a plain used block may be.
    UnexpectedRelocation,
    /// Stored content failed to decompress.
    Decompression,
    /// The file size is not a multiple of the atom size.
    FileSize,
    /// The file is shorter than the free-list table it should contain.
    FltLoad,
    /// A free-list walk reached a block the forward scan did not mark free.
    FltLink,
    /// A free block is smaller than its bucket's minimum size.
    FltMinSize,
    /// A free block's prev link disagrees with the walk that reached it.
    FreeChaining,
    /// A free block is not reachable from any free-list bucket.
    LostFreeBlock,
    /// The verifier's scratch bitmap could not be read or written.
    Bitmap,
}

/// Typed errors raised by the storage core.
///
/// Carried inside `eyre::Report`; recover with `downcast_ref::<StoreError>()`.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("invalid argument: {what}: {value}")]
    InvalidArgument { what: &'static str, value: i64 },

    #[error("operation not permitted: {0}")]
    PermissionDenied(String),

    #[error("corrupted storage: {kind:?} at offset {off} (arg {arg}, arg2 {arg2})")]
    Corrupt {
        kind: CorruptKind,
        off: i64,
        arg: i64,
        arg2: i64,
    },

    #[error("invalid write-ahead log {path:?}: {reason}")]
    InvalidWal { path: PathBuf, reason: String },

    #[error("short write at offset {off}: wrote {written} of {expected} bytes")]
    ShortWrite {
        off: i64,
        expected: usize,
        written: usize,
    },

    #[error("unexpected end of file reading {expected} bytes at offset {off}")]
    UnexpectedEof { off: i64, expected: usize },
}

impl StoreError {
    /// Shorthand for a [`StoreError::Corrupt`] without auxiliary arguments.
    pub fn corrupt(kind: CorruptKind, off: i64) -> Self {
        StoreError::Corrupt {
            kind,
            off,
            arg: 0,
            arg2: 0,
        }
    }

    /// Shorthand for a [`StoreError::Corrupt`] with one auxiliary argument.
    pub fn corrupt_arg(kind: CorruptKind, off: i64, arg: i64) -> Self {
        StoreError::Corrupt {
            kind,
            off,
            arg,
            arg2: 0,
        }
    }

    /// The corruption kind, if this is a corruption error.
    pub fn corrupt_kind(&self) -> Option<CorruptKind> {
        match self {
            StoreError::Corrupt { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_shorthand_fills_offsets() {
        let err = StoreError::corrupt_arg(CorruptKind::AdjacentFree, 0x40, 0x50);
        match err {
            StoreError::Corrupt { kind, off, arg, arg2 } => {
                assert_eq!(kind, CorruptKind::AdjacentFree);
                assert_eq!(off, 0x40);
                assert_eq!(arg, 0x50);
                assert_eq!(arg2, 0);
            }
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn store_error_survives_eyre_downcast() {
        let report: eyre::Report = StoreError::PermissionDenied("write outside txn".into()).into();
        let err = report
            .downcast_ref::<StoreError>()
            .expect("downcast SHOULD recover the typed error");
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[test]
    fn corrupt_kind_accessor() {
        let err = StoreError::corrupt(CorruptKind::FreeTailBlock, 16);
        assert_eq!(err.corrupt_kind(), Some(CorruptKind::FreeTailBlock));

        let err = StoreError::InvalidArgument {
            what: "truncate size",
            value: -1,
        };
        assert_eq!(err.corrupt_kind(), None);
    }
}
