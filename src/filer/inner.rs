//! # Offset-Window Filer
//!
//! [`InnerFiler`] exposes a window of another filer, shifted by a fixed
//! offset: `inner.write_at(b, 4)` lands at `outer` offset `4 + off`. The
//! window pretends the outer prefix does not exist - `size()` reports
//! `max(outer_size - off, 0)` and negative window offsets are rejected, so
//! a layer above cannot reach below its window.
//!
//! The canonical use is skipping a fixed file header: the allocator stack
//! runs over `InnerFiler::new(os_filer, 16)` and never sees the header
//! bytes.
//!
//! `close` is deliberately a no-op. The window does not own the lifecycle
//! of the outer store; whoever built the stack closes the bottom, and for
//! OS files the handle is released on drop in any case.

use eyre::Result;

use crate::error::StoreError;
use crate::filer::Filer;

/// A [`Filer`] view of `outer` with every access shifted by a fixed offset.
pub struct InnerFiler<F> {
    outer: F,
    off: i64,
}

impl<F: Filer> InnerFiler<F> {
    /// Wraps `outer`, adding `off` to every translated access.
    pub fn new(outer: F, off: i64) -> Self {
        Self { outer, off }
    }

    /// The wrapped filer.
    pub fn outer(&self) -> &F {
        &self.outer
    }

    /// The wrapped filer, mutably.
    pub fn outer_mut(&mut self) -> &mut F {
        &mut self.outer
    }

    /// Unwraps into the outer filer.
    pub fn into_outer(self) -> F {
        self.outer
    }
}

impl<F: Filer> Filer for InnerFiler<F> {
    fn name(&self) -> String {
        self.outer.name()
    }

    fn size(&mut self) -> Result<i64> {
        Ok((self.outer.size()? - self.off).max(0))
    }

    fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "read_at offset",
                value: off,
            }
            .into());
        }
        self.outer.read_at(buf, self.off + off)
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "write_at offset",
                value: off,
            }
            .into());
        }
        self.outer.write_at(buf, self.off + off)
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(StoreError::InvalidArgument {
                what: "truncate size",
                value: size,
            }
            .into());
        }
        self.outer.truncate(self.off + size)
    }

    fn punch_hole(&mut self, off: i64, size: i64) -> Result<()> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "punch_hole offset",
                value: off,
            }
            .into());
        }
        self.outer.punch_hole(self.off + off, size)
    }

    fn sync(&mut self) -> Result<()> {
        self.outer.sync()
    }

    fn begin_update(&mut self) -> Result<()> {
        self.outer.begin_update()
    }

    fn end_update(&mut self) -> Result<()> {
        self.outer.end_update()
    }

    fn rollback(&mut self) -> Result<()> {
        self.outer.rollback()
    }

    fn close(&mut self) -> Result<()> {
        // The outer filer owns the actual resource.
        Ok(())
    }
}
