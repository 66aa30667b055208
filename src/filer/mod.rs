//! # Filer Abstraction
//!
//! A [`Filer`] is a byte-addressed model of a file-like store: positioned
//! reads and writes, truncation, advisory hole punching, and nested
//! transaction hooks. It is the contract every layer of the storage stack
//! speaks, from raw OS files up to the WAL-backed transactional wrapper.
//!
//! ## Addressing
//!
//! Offsets are absolute, non-negative byte addresses, as in `pread(2)` /
//! `pwrite(2)`. A filer is not sequentially accessible; there is no cursor.
//!
//! ## Read/Write Semantics
//!
//! - `read_at` may return fewer bytes than requested only when the read
//!   crosses the end of the store; a read that starts at or past the end
//!   returns 0. It never fails just because bytes are missing.
//! - `write_at` writes the entire buffer or fails. Writing past the current
//!   end grows the store; any gap reads back as zeros.
//! - `truncate` to a shorter size discards the removed bytes; growing
//!   exposes logical zeros.
//! - `punch_hole` is an advisory deallocation hint. Implementations may
//!   ignore it; when they act, whole pages inside the range read back as
//!   zeros on in-memory filers. OS-file filers may keep the old bytes.
//!
//! ## Transactions
//!
//! `begin_update` opens a nesting level; each level is closed by exactly one
//! of `end_update` or `rollback`. Non-transactional filers ([`MemFiler`],
//! [`OsFiler`]) keep only a balance counter; transactional wrappers
//! ([`crate::txn::RollbackFiler`], [`crate::txn::AcidFiler`]) reject
//! mutations outside an open transaction and make `end_update` at the
//! outermost level the commit point.
//!
//! ## Lifecycle
//!
//! A filer is closed exactly once. `close` fails while transactions are
//! open; the transactional wrappers additionally support an emergency close
//! that rolls back first. None of the implementations are safe for
//! concurrent use; every method takes `&mut self`.

mod inner;
mod mem;
mod os;

pub use inner::InnerFiler;
pub use mem::MemFiler;
pub use os::OsFiler;

use eyre::Result;

/// Byte-addressed, sized, truncatable storage with transactional hooks.
///
/// See the [module documentation](self) for the full contract.
pub trait Filer {
    /// A human-readable identifier, usually the backing file path.
    fn name(&self) -> String;

    /// Current size in bytes.
    fn size(&mut self) -> Result<i64>;

    /// Reads into `buf` starting at byte `off`. Returns the number of bytes
    /// read; short only when the read crosses the end of the store.
    fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize>;

    /// Writes all of `buf` at byte `off`, growing the store as needed.
    /// Returns `buf.len()` on success.
    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize>;

    /// Sets the store size. Shrinking discards data; growing exposes zeros.
    fn truncate(&mut self, size: i64) -> Result<()>;

    /// Advisory deallocation of `[off, off + size)`. May be a no-op.
    fn punch_hole(&mut self, off: i64, size: i64) -> Result<()>;

    /// Flushes buffered state to durable storage.
    fn sync(&mut self) -> Result<()>;

    /// Opens a transaction nesting level.
    fn begin_update(&mut self) -> Result<()>;

    /// Closes the innermost open level, committing at the outermost one.
    fn end_update(&mut self) -> Result<()>;

    /// Discards the innermost open level.
    fn rollback(&mut self) -> Result<()>;

    /// Releases the filer. Fails while transactions are open.
    fn close(&mut self) -> Result<()>;
}
