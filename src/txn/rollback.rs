//! # Structural Transactions
//!
//! [`RollbackFiler`] wraps any [`Filer`] with nested structural
//! transactions. Every mutation inside a transaction lands in an in-memory
//! [overlay](super::overlay) instead of the wrapped filer; reads see the
//! innermost overlay (dirty reads). Committing an inner level merges its
//! dirty bytes into the level below; committing the outermost level drains
//! them through a [`CommitSink`], which decides where the bytes physically
//! go and what "durable" means. Rolling back any level discards its overlay.
//!
//! ## Levels
//!
//! ```text
//! level 0: no transaction - reads hit the wrapped filer, mutations fail
//! begin_update  -> push a fresh overlay whose parent is the current view
//! end_update    -> level 1: drain dirty runs through the sink, checkpoint
//!                  level >1: merge dirty runs into the overlay below
//! rollback      -> discard the top overlay
//! ```
//!
//! ## Sinks
//!
//! [`DirectSink`] writes flushed bytes straight into the wrapped filer and
//! on checkpoint truncates it to the committed size and syncs: plain
//! structural transactions with no durability story beyond the OS. The
//! WAL-backed [`crate::txn::AcidFiler`] plugs in its own sink to get atomic
//! durable commits; the state machine here is identical either way.
//!
//! ## Failure
//!
//! If a sink write fails during the outermost commit, the checkpoint is not
//! invoked and the error propagates. The overlay was being drained, so the
//! wrapped filer must be treated as structurally indeterminate - exactly
//! the situation the WAL sink exists to repair on reopen.
//!
//! ## Close
//!
//! `close` inside an open transaction still closes the wrapped filer (so a
//! signal handler can always release resources) but reports a permission
//! error after the fact.

use eyre::Result;
use log::debug;

use crate::error::StoreError;
use crate::filer::Filer;
use crate::txn::overlay::Overlay;

/// Destination of the outermost commit: receives every flushed dirty run,
/// then a checkpoint carrying the committed size.
pub trait CommitSink<F: Filer> {
    /// Persists one run of committed bytes. Must write all of `b` or fail.
    fn write_at(&mut self, f: &mut F, b: &[u8], off: i64) -> Result<()>;

    /// Marks the commit point. All runs of the transaction were accepted;
    /// `size` is the committed file size.
    fn checkpoint(&mut self, f: &mut F, size: i64) -> Result<()>;
}

/// A [`CommitSink`] that writes directly into the wrapped filer.
#[derive(Debug)]
pub struct DirectSink;

impl<F: Filer> CommitSink<F> for DirectSink {
    fn write_at(&mut self, f: &mut F, b: &[u8], off: i64) -> Result<()> {
        let n = f.write_at(b, off)?;
        if n != b.len() {
            return Err(StoreError::ShortWrite {
                off,
                expected: b.len(),
                written: n,
            }
            .into());
        }
        Ok(())
    }

    fn checkpoint(&mut self, f: &mut F, size: i64) -> Result<()> {
        f.truncate(size)?;
        f.sync()
    }
}

/// Reads the view formed by `overlays` stacked over `f`.
fn view_read<F: Filer>(
    f: &mut F,
    overlays: &mut [Overlay],
    buf: &mut [u8],
    off: i64,
) -> Result<usize> {
    match overlays.split_last_mut() {
        None => f.read_at(buf, off),
        Some((top, rest)) => {
            let mut fill = |b: &mut [u8], o: i64| view_read(f, rest, b, o);
            top.read_at(buf, off, &mut fill)
        }
    }
}

fn view_write<F: Filer>(
    f: &mut F,
    overlays: &mut [Overlay],
    buf: &[u8],
    off: i64,
) -> Result<usize> {
    match overlays.split_last_mut() {
        None => f.write_at(buf, off),
        Some((top, rest)) => {
            let mut fill = |b: &mut [u8], o: i64| view_read(f, rest, b, o);
            top.write_at(buf, off, &mut fill)
        }
    }
}

fn view_truncate<F: Filer>(f: &mut F, overlays: &mut [Overlay], size: i64) -> Result<()> {
    match overlays.split_last_mut() {
        None => f.truncate(size),
        Some((top, rest)) => {
            let mut fill = |b: &mut [u8], o: i64| view_read(f, rest, b, o);
            top.truncate(size, &mut fill)
        }
    }
}

/// A [`Filer`] adding nested structural transactions over a wrapped filer.
pub struct RollbackFiler<F: Filer, S: CommitSink<F> = DirectSink> {
    f: F,
    sink: S,
    overlays: Vec<Overlay>,
    closed: bool,
}

impl<F: Filer + std::fmt::Debug, S: CommitSink<F> + std::fmt::Debug> std::fmt::Debug
    for RollbackFiler<F, S>
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("RollbackFiler")
            .field("f", &self.f)
            .field("sink", &self.sink)
            .field("overlays", &self.overlays)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<F: Filer> RollbackFiler<F> {
    /// Wraps `f` with transactions committing directly into it.
    pub fn new(f: F) -> Self {
        Self::with_sink(f, DirectSink)
    }
}

impl<F: Filer, S: CommitSink<F>> RollbackFiler<F, S> {
    /// Wraps `f` with transactions committing through `sink`.
    pub fn with_sink(f: F, sink: S) -> Self {
        Self {
            f,
            sink,
            overlays: Vec::new(),
            closed: false,
        }
    }

    /// Current transaction nesting depth; 0 means no open transaction.
    pub fn nesting(&self) -> usize {
        self.overlays.len()
    }

    pub fn filer(&self) -> &F {
        &self.f
    }

    pub fn filer_mut(&mut self) -> &mut F {
        &mut self.f
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn not_in_transaction(&self, op: &str) -> eyre::Report {
        StoreError::PermissionDenied(format!(
            "{}: {} outside of a transaction",
            self.f.name(),
            op
        ))
        .into()
    }
}

impl<F: Filer, S: CommitSink<F>> Filer for RollbackFiler<F, S> {
    fn name(&self) -> String {
        self.f.name()
    }

    fn size(&mut self) -> Result<i64> {
        match self.overlays.last() {
            Some(top) => Ok(top.size()),
            None => self.f.size(),
        }
    }

    fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "read_at offset",
                value: off,
            }
            .into());
        }
        view_read(&mut self.f, &mut self.overlays, buf, off)
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize> {
        if self.overlays.is_empty() {
            return Err(self.not_in_transaction("write_at"));
        }
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "write_at offset",
                value: off,
            }
            .into());
        }
        view_write(&mut self.f, &mut self.overlays, buf, off)
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        if self.overlays.is_empty() {
            return Err(self.not_in_transaction("truncate"));
        }
        if size < 0 {
            return Err(StoreError::InvalidArgument {
                what: "truncate size",
                value: size,
            }
            .into());
        }
        view_truncate(&mut self.f, &mut self.overlays, size)
    }

    fn punch_hole(&mut self, off: i64, size: i64) -> Result<()> {
        if self.overlays.is_empty() {
            return Err(self.not_in_transaction("punch_hole"));
        }
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "punch_hole offset",
                value: off,
            }
            .into());
        }
        if let Some(top) = self.overlays.last_mut() {
            if size < 0 || off + size > top.size() {
                return Err(StoreError::InvalidArgument {
                    what: "punch_hole size",
                    value: size,
                }
                .into());
            }
            top.punch_hole(off, size);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.f.sync()
    }

    fn begin_update(&mut self) -> Result<()> {
        let parent_size = match self.overlays.last() {
            Some(top) => top.size(),
            None => self.f.size()?,
        };
        self.overlays.push(Overlay::new(parent_size));
        Ok(())
    }

    fn end_update(&mut self) -> Result<()> {
        let top = match self.overlays.pop() {
            Some(top) => top,
            None => return Err(self.not_in_transaction("end_update")),
        };
        let committed_size = top.size();

        if self.overlays.is_empty() {
            debug!(
                "{}: committing outermost transaction, size {}",
                self.f.name(),
                committed_size
            );
            let f = &mut self.f;
            let sink = &mut self.sink;
            top.for_each_dirty_run(|off, bytes| sink.write_at(f, bytes, off))?;
            sink.checkpoint(f, committed_size)
        } else {
            let f = &mut self.f;
            let rest = &mut self.overlays;
            top.for_each_dirty_run(|off, bytes| view_write(f, rest, bytes, off).map(|_| ()))?;
            view_truncate(f, rest, committed_size)
        }
    }

    fn rollback(&mut self) -> Result<()> {
        if self.overlays.pop().is_none() {
            return Err(self.not_in_transaction("rollback"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(StoreError::PermissionDenied(format!(
                "{}: already closed",
                self.f.name()
            ))
            .into());
        }
        self.closed = true;
        self.f.close()?;

        if !self.overlays.is_empty() {
            self.overlays.clear();
            return Err(StoreError::PermissionDenied(format!(
                "{}: close inside an open transaction",
                self.f.name()
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filer::MemFiler;

    fn bytes_of<F: Filer>(f: &mut F) -> Vec<u8> {
        let size = f.size().unwrap() as usize;
        let mut buf = vec![0u8; size];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), size);
        buf
    }

    #[test]
    fn mutations_outside_transaction_are_denied() {
        let mut r = RollbackFiler::new(MemFiler::new());
        for result in [
            r.write_at(&[1], 0).map(|_| ()),
            r.truncate(0),
            r.punch_hole(0, 0),
            r.end_update(),
            r.rollback(),
        ] {
            let report = result.unwrap_err();
            let err = report.downcast_ref::<StoreError>().unwrap();
            assert!(
                matches!(err, StoreError::PermissionDenied(_)),
                "expected PermissionDenied, got {:?}",
                err
            );
        }
    }

    #[test]
    fn rollback_restores_the_pre_transaction_state() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(b"seed", 0).unwrap();
        r.end_update().unwrap();

        r.begin_update().unwrap();
        r.write_at(b"XXXX", 0).unwrap();
        r.truncate(2).unwrap();
        r.rollback().unwrap();

        assert_eq!(bytes_of(&mut r), b"seed");
        assert_eq!(bytes_of(r.filer_mut()), b"seed");
    }

    #[test]
    fn dirty_reads_see_uncommitted_writes() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(b"abc", 10).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(r.read_at(&mut buf, 10).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(r.filer_mut().size().unwrap(), 0, "parent SHOULD be untouched");
        r.rollback().unwrap();
    }

    #[test]
    fn outermost_commit_flushes_to_the_parent() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(&[1, 2, 3], 5).unwrap();
        r.end_update().unwrap();

        assert_eq!(bytes_of(r.filer_mut()), vec![0, 0, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn nested_commits_apply_last_writer_wins() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(&[1; 8], 0).unwrap();

        r.begin_update().unwrap();
        r.write_at(&[2; 4], 2).unwrap();

        r.begin_update().unwrap();
        r.write_at(&[3], 2).unwrap();
        r.end_update().unwrap(); // level 3 -> 2

        r.end_update().unwrap(); // level 2 -> 1
        r.end_update().unwrap(); // commit

        assert_eq!(bytes_of(r.filer_mut()), vec![1, 1, 3, 2, 2, 2, 1, 1]);
    }

    #[test]
    fn inner_rollback_discards_only_its_level() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(&[1; 4], 0).unwrap();

        r.begin_update().unwrap();
        r.write_at(&[9; 4], 0).unwrap();
        r.rollback().unwrap();

        r.end_update().unwrap();
        assert_eq!(bytes_of(r.filer_mut()), vec![1, 1, 1, 1]);
    }

    #[test]
    fn committed_truncate_shrinks_the_parent() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(&[7; 100], 0).unwrap();
        r.end_update().unwrap();

        r.begin_update().unwrap();
        r.truncate(10).unwrap();
        r.end_update().unwrap();

        assert_eq!(r.filer_mut().size().unwrap(), 10);
        assert_eq!(bytes_of(r.filer_mut()), vec![7; 10]);
    }

    #[test]
    fn nested_truncate_propagates_to_intermediate_levels() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(&[7; 64], 0).unwrap();

        r.begin_update().unwrap();
        r.truncate(16).unwrap();
        r.end_update().unwrap();
        assert_eq!(r.size().unwrap(), 16);

        r.end_update().unwrap();
        assert_eq!(r.filer_mut().size().unwrap(), 16);
    }

    #[test]
    fn size_tracks_the_innermost_overlay() {
        let mut r = RollbackFiler::new(MemFiler::new());
        assert_eq!(r.size().unwrap(), 0);
        r.begin_update().unwrap();
        r.write_at(&[0; 32], 0).unwrap();
        assert_eq!(r.size().unwrap(), 32);

        r.begin_update().unwrap();
        r.truncate(8).unwrap();
        assert_eq!(r.size().unwrap(), 8);
        r.rollback().unwrap();
        assert_eq!(r.size().unwrap(), 32);
        r.rollback().unwrap();
        assert_eq!(r.size().unwrap(), 0);
    }

    #[test]
    fn close_inside_transaction_closes_but_reports() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        let report = r.close().unwrap_err();
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        let report = r.close().unwrap_err();
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(err, StoreError::PermissionDenied(_)), "double close");
    }

    #[test]
    fn punch_hole_inside_transaction_reads_zero_and_commits_zeros() {
        let mut r = RollbackFiler::new(MemFiler::new());
        r.begin_update().unwrap();
        r.write_at(&[0xFF; 1024], 0).unwrap();
        r.end_update().unwrap();

        r.begin_update().unwrap();
        r.punch_hole(0, 512).unwrap();
        let mut b = [1u8];
        r.read_at(&mut b, 100).unwrap();
        assert_eq!(b[0], 0);
        r.end_update().unwrap();

        let all = bytes_of(r.filer_mut());
        assert_eq!(&all[..512], &[0u8; 512][..]);
        assert_eq!(&all[512..], &[0xFFu8; 512][..]);
    }
}
