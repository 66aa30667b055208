//! # In-Memory Filer
//!
//! [`MemFiler`] is a memory-backed [`Filer`] built on a sparse page map.
//! Pages are 64 KiB; a page that was never written does not exist and reads
//! as zeros, so a mostly-empty multi-gigabyte logical file costs only the
//! pages actually touched.
//!
//! ## Sparse Semantics
//!
//! Writes preserve sparseness: a write that covers a whole page with zeros
//! deletes the page instead of allocating it, and `punch_hole` drops every
//! page fully inside the punched range. `truncate` zero-fills the retained
//! tail of the boundary page so that shrinking and then re-growing exposes
//! logical zeros, matching what an OS file would do.
//!
//! ## Persistence Helpers
//!
//! `MemFiler` is not persistent by itself but can ferry its content:
//! [`read_from`](MemFiler::read_from) repopulates it from any reader,
//! [`write_to`](MemFiler::write_to) streams the full logical content, and
//! [`write_to_filer`](MemFiler::write_to_filer) copies only the pages that
//! exist, leaving holes in a sparse-capable destination.
//!
//! Besides serving as scratch backing in tests, a `MemFiler` is the
//! recommended bitmap argument for the allocator's verifier.

use std::io::{Read, Write};

use eyre::Result;
use hashbrown::HashMap;

use crate::error::StoreError;
use crate::filer::Filer;

const PG_BITS: u32 = 16;
const PG_SIZE: usize = 1 << PG_BITS;
const PG_MASK: i64 = PG_SIZE as i64 - 1;

const ZERO_PAGE: [u8; PG_SIZE] = [0u8; PG_SIZE];

/// A sparse, memory-backed [`Filer`] with 64 KiB pages.
#[derive(Debug)]
pub struct MemFiler {
    pages: HashMap<i64, Box<[u8; PG_SIZE]>>,
    size: i64,
    nest: usize,
}

impl MemFiler {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            size: 0,
            nest: 0,
        }
    }

    /// Number of materialized pages; absent pages read as zeros.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Replaces the content with everything readable from `r`.
    pub fn read_from<R: Read>(&mut self, r: &mut R) -> Result<i64> {
        self.truncate(0)?;

        let mut buf = vec![0u8; PG_SIZE];
        let mut off = 0i64;
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write_at(&buf[..n], off)?;
            off += n as i64;
        }
        Ok(off)
    }

    /// Streams the full logical content, zeros included, to `w`.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> Result<i64> {
        let mut buf = vec![0u8; PG_SIZE];
        let mut off = 0i64;
        while off < self.size {
            let n = self.read_at(&mut buf, off)?;
            if n == 0 {
                break;
            }
            w.write_all(&buf[..n])?;
            off += n as i64;
        }
        Ok(off)
    }

    /// Copies only materialized pages into `dst`, preserving holes.
    ///
    /// `dst` is truncated to this filer's size first, so bytes under the
    /// holes are whatever `dst` exposes for never-written ranges (zeros for
    /// a fresh file).
    pub fn write_to_filer<F: Filer>(&mut self, dst: &mut F) -> Result<i64> {
        dst.truncate(self.size)?;

        let mut written = 0i64;
        let last_pg = self.size >> PG_BITS;
        for (&pg_i, page) in &self.pages {
            let sz = if pg_i == last_pg {
                (self.size & PG_MASK) as usize
            } else {
                PG_SIZE
            };
            if sz == 0 {
                continue;
            }
            let off = pg_i << PG_BITS;
            let n = dst.write_at(&page[..sz], off)?;
            if n != sz {
                return Err(StoreError::ShortWrite {
                    off,
                    expected: sz,
                    written: n,
                }
                .into());
            }
            written += sz as i64;
        }
        Ok(written)
    }
}

impl Default for MemFiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Filer for MemFiler {
    fn name(&self) -> String {
        format!("{:p}.memfiler", self)
    }

    fn size(&mut self) -> Result<i64> {
        Ok(self.size)
    }

    fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "read_at offset",
                value: off,
            }
            .into());
        }

        let avail = self.size - off;
        if avail <= 0 {
            return Ok(0);
        }

        let want = (buf.len() as i64).min(avail) as usize;
        let mut done = 0usize;
        let mut pg_i = off >> PG_BITS;
        let mut pg_o = (off & PG_MASK) as usize;
        while done < want {
            let nc = (PG_SIZE - pg_o).min(want - done);
            let src: &[u8] = match self.pages.get(&pg_i) {
                Some(page) => &page[pg_o..pg_o + nc],
                None => &ZERO_PAGE[..nc],
            };
            buf[done..done + nc].copy_from_slice(src);
            done += nc;
            pg_i += 1;
            pg_o = 0;
        }
        Ok(want)
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "write_at offset",
                value: off,
            }
            .into());
        }

        let mut rem = buf.len();
        let mut src = buf;
        let mut pg_i = off >> PG_BITS;
        let mut pg_o = (off & PG_MASK) as usize;
        while rem != 0 {
            let nc;
            if pg_o == 0 && rem >= PG_SIZE && src[..PG_SIZE] == ZERO_PAGE {
                // Whole-page zero write: keep the file sparse.
                self.pages.remove(&pg_i);
                nc = PG_SIZE;
            } else {
                let page = self
                    .pages
                    .entry(pg_i)
                    .or_insert_with(|| Box::new([0u8; PG_SIZE]));
                nc = (PG_SIZE - pg_o).min(rem);
                page[pg_o..pg_o + nc].copy_from_slice(&src[..nc]);
            }
            src = &src[nc..];
            rem -= nc;
            pg_i += 1;
            pg_o = 0;
        }
        self.size = self.size.max(off + buf.len() as i64);
        Ok(buf.len())
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(StoreError::InvalidArgument {
                what: "truncate size",
                value: size,
            }
            .into());
        }

        if size == 0 {
            self.pages.clear();
            self.size = 0;
            return Ok(());
        }

        if size < self.size {
            let first_gone = (size + PG_MASK) >> PG_BITS;
            self.pages.retain(|&pg_i, _| pg_i < first_gone);

            // Zero the retained tail of the boundary page so a later grow
            // exposes zeros, not stale bytes.
            let tail = (size & PG_MASK) as usize;
            if tail != 0 {
                if let Some(page) = self.pages.get_mut(&(size >> PG_BITS)) {
                    page[tail..].fill(0);
                }
            }
        }
        self.size = size;
        Ok(())
    }

    fn punch_hole(&mut self, off: i64, size: i64) -> Result<()> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "punch_hole offset",
                value: off,
            }
            .into());
        }
        if size < 0 || off + size > self.size {
            return Err(StoreError::InvalidArgument {
                what: "punch_hole size",
                value: size,
            }
            .into());
        }

        // Drop exactly the pages fully covered by the range.
        let first = (off + PG_MASK) >> PG_BITS;
        let last = (off + size) >> PG_BITS; // exclusive
        for pg_i in first..last {
            self.pages.remove(&pg_i);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_update(&mut self) -> Result<()> {
        self.nest += 1;
        Ok(())
    }

    fn end_update(&mut self) -> Result<()> {
        if self.nest == 0 {
            return Err(StoreError::PermissionDenied(format!(
                "{}: end_update outside of a transaction",
                self.name()
            ))
            .into());
        }
        self.nest -= 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.nest == 0 {
            return Err(StoreError::PermissionDenied(format!(
                "{}: rollback outside of a transaction",
                self.name()
            ))
            .into());
        }
        self.nest -= 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.nest != 0 {
            return Err(StoreError::PermissionDenied(format!(
                "{}: close inside an open transaction",
                self.name()
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_from_empty_filer_return_zero_bytes() {
        let mut f = MemFiler::new();
        let mut buf = [0xAAu8; 32];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 0);
        assert_eq!(f.read_at(&mut buf, 1 << 30).unwrap(), 0);
    }

    #[test]
    fn absent_pages_read_as_zeros() {
        let mut f = MemFiler::new();
        f.write_at(&[1, 2, 3], (PG_SIZE * 4) as i64).unwrap();

        let mut buf = [0xAAu8; 8];
        let n = f.read_at(&mut buf, 100).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0u8; 8]);
        assert_eq!(f.page_count(), 1, "only the written page SHOULD exist");
    }

    #[test]
    fn short_read_at_eof() {
        let mut f = MemFiler::new();
        f.write_at(&[7u8; 10], 0).unwrap();

        let mut buf = [0u8; 32];
        let n = f.read_at(&mut buf, 4).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], &[7u8; 6]);
    }

    #[test]
    fn whole_zero_page_write_stays_sparse() {
        let mut f = MemFiler::new();
        f.write_at(&vec![0u8; PG_SIZE], 0).unwrap();
        assert_eq!(f.page_count(), 0);
        assert_eq!(f.size().unwrap(), PG_SIZE as i64);

        f.write_at(&[1u8], 0).unwrap();
        assert_eq!(f.page_count(), 1);
        f.write_at(&vec![0u8; PG_SIZE], 0).unwrap();
        assert_eq!(f.page_count(), 0, "zero overwrite SHOULD drop the page");
    }

    #[test]
    fn write_spanning_pages() {
        let mut f = MemFiler::new();
        let data: Vec<u8> = (0..PG_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let off = (PG_SIZE - 50) as i64;
        f.write_at(&data, off).unwrap();

        let mut back = vec![0u8; data.len()];
        assert_eq!(f.read_at(&mut back, off).unwrap(), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn truncate_then_grow_reads_zeros() {
        let mut f = MemFiler::new();
        f.write_at(&[0xFFu8; 100], 0).unwrap();
        f.truncate(10).unwrap();
        f.write_at(&[1u8], 200).unwrap();

        let mut buf = [0xAAu8; 100];
        f.read_at(&mut buf, 10).unwrap();
        assert_eq!(buf, [0u8; 100], "regrown range SHOULD read as zeros");
    }

    #[test]
    fn truncate_to_zero_clears_pages() {
        let mut f = MemFiler::new();
        f.write_at(&[1u8; 100], (PG_SIZE * 3) as i64).unwrap();
        f.truncate(0).unwrap();
        assert_eq!(f.page_count(), 0);
        assert_eq!(f.size().unwrap(), 0);
    }

    #[test]
    fn punch_hole_drops_only_covered_pages() {
        let mut f = MemFiler::new();
        for pg in 0..4 {
            f.write_at(&[0xABu8; PG_SIZE], (pg * PG_SIZE) as i64).unwrap();
        }
        assert_eq!(f.page_count(), 4);

        // Covers page 1 fully, pages 0 and 2 partially.
        f.punch_hole(PG_SIZE as i64 - 1, PG_SIZE as i64 + 2).unwrap();
        assert_eq!(f.page_count(), 3);

        let mut b = [0u8; 1];
        f.read_at(&mut b, PG_SIZE as i64).unwrap();
        assert_eq!(b[0], 0, "hole SHOULD read as zero");
        f.read_at(&mut b, PG_SIZE as i64 - 1).unwrap();
        assert_eq!(b[0], 0xAB, "partial edge page SHOULD keep its bytes");
    }

    #[test]
    fn punch_hole_validates_bounds() {
        let mut f = MemFiler::new();
        f.write_at(&[0u8; 16], 0).unwrap();
        assert!(f.punch_hole(-1, 4).is_err());
        assert!(f.punch_hole(0, -4).is_err());
        assert!(f.punch_hole(8, 16).is_err());
    }

    #[test]
    fn update_nesting_is_counted() {
        let mut f = MemFiler::new();
        assert!(f.end_update().is_err());
        f.begin_update().unwrap();
        f.begin_update().unwrap();
        assert!(f.close().is_err(), "close with open updates SHOULD fail");
        f.end_update().unwrap();
        f.rollback().unwrap();
        f.close().unwrap();
    }

    #[test]
    fn stream_round_trip() {
        let mut src = MemFiler::new();
        let data: Vec<u8> = (0..3 * PG_SIZE / 2).map(|i| (i % 256) as u8).collect();
        src.write_at(&data, 0).unwrap();

        let mut bytes = Vec::new();
        src.write_to(&mut bytes).unwrap();
        assert_eq!(bytes, data);

        let mut dst = MemFiler::new();
        dst.read_from(&mut &bytes[..]).unwrap();
        assert_eq!(dst.size().unwrap(), data.len() as i64);
        let mut back = vec![0u8; data.len()];
        dst.read_at(&mut back, 0).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn sparse_copy_preserves_holes() {
        let mut src = MemFiler::new();
        src.write_at(&[9u8; 10], (PG_SIZE * 2) as i64).unwrap();
        assert_eq!(src.page_count(), 1);

        let mut dst = MemFiler::new();
        src.write_to_filer(&mut dst).unwrap();
        assert_eq!(dst.size().unwrap(), src.size().unwrap());
        assert_eq!(dst.page_count(), 1, "holes SHOULD stay holes");

        let mut b = [0u8; 10];
        dst.read_at(&mut b, (PG_SIZE * 2) as i64).unwrap();
        assert_eq!(b, [9u8; 10]);
    }
}
