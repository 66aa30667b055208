//! # Dirty-Page Overlay
//!
//! An [`Overlay`] is one level of a structural transaction: a sparse map of
//! 256-byte pages layered over a parent view. Reads fall through to the
//! parent for bytes the overlay has not touched; writes land in overlay
//! pages and set a per-byte dirty bit, so a commit can later replay exactly
//! the bytes the transaction wrote and nothing else.
//!
//! ## Page Record
//!
//! Each page holds a 256-byte data image, a 32-byte dirty bitmap (one bit
//! per byte), and a page-level dirty flag. Pages are created on first
//! write, pre-filled from the parent view so partial-page writes keep the
//! surrounding bytes intact.
//!
//! ## Parent View
//!
//! The overlay does not hold a reference to its parent; every operation
//! that may need parent bytes receives a `fill` callback that reads the
//! parent view (the next overlay down, or the wrapped filer). Short fills
//! leave zeros, which encodes "the parent ends here".
//!
//! ## Truncation
//!
//! Shrinking must make the discarded range read as zeros even if the
//! transaction grows the file again, and must overwrite stale parent bytes
//! if the range is re-exposed at commit. The overlay therefore materializes
//! the shrunk-away range that the parent actually backs as all-dirty zero
//! pages, and zero-fills (and dirties) the retained tail of the boundary
//! page. The cost is proportional to the shrink span, which the allocator
//! keeps small (tail blocks); hole punching uses the same mechanism.
//!
//! ## Flush
//!
//! [`Overlay::for_each_dirty_run`] walks pages in ascending order and emits
//! maximal runs of consecutive dirty bytes, clamped to the overlay size.
//! Within a page, runs come out in ascending byte order.

use eyre::Result;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

pub(crate) const PG_BITS: u32 = 8;
pub(crate) const PG_SIZE: usize = 1 << PG_BITS;
const PG_MASK: i64 = PG_SIZE as i64 - 1;
const FLAG_BYTES: usize = PG_SIZE / 8;

/// Reads the parent view; short reads mean the parent ends there.
pub(crate) type ParentRead<'a> = dyn FnMut(&mut [u8], i64) -> Result<usize> + 'a;

#[derive(Debug)]
struct OverlayPage {
    data: [u8; PG_SIZE],
    flags: [u8; FLAG_BYTES],
    dirty: bool,
}

impl OverlayPage {
    fn zeroed() -> Box<Self> {
        Box::new(OverlayPage {
            data: [0; PG_SIZE],
            flags: [0; FLAG_BYTES],
            dirty: false,
        })
    }

    fn all_dirty_zero() -> Box<Self> {
        Box::new(OverlayPage {
            data: [0; PG_SIZE],
            flags: [0xFF; FLAG_BYTES],
            dirty: true,
        })
    }

    fn mark(&mut self, range: std::ops::Range<usize>) {
        for i in range {
            self.flags[i >> 3] |= 1 << (i & 7);
        }
        self.dirty = true;
    }

    fn is_marked(&self, i: usize) -> bool {
        self.flags[i >> 3] & (1 << (i & 7)) != 0
    }
}

/// One transaction level: a copy-on-write page map over a parent view.
#[derive(Debug)]
pub(crate) struct Overlay {
    pages: HashMap<i64, Box<OverlayPage>>,
    /// Logical size of this level's view.
    size: i64,
    /// Extent of the parent view when this level opened; bytes past it are
    /// known to read as zeros from below.
    parent_size: i64,
}

impl Overlay {
    pub fn new(parent_size: i64) -> Self {
        Self {
            pages: HashMap::new(),
            size: parent_size,
            parent_size,
        }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    fn page_or_fill<'a>(
        pages: &'a mut HashMap<i64, Box<OverlayPage>>,
        pg_i: i64,
        fill: &mut ParentRead<'_>,
    ) -> Result<&'a mut OverlayPage> {
        match pages.entry(pg_i) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let mut page = OverlayPage::zeroed();
                // Short fills leave zeros for bytes past the parent's end.
                fill(&mut page.data, pg_i << PG_BITS)?;
                Ok(v.insert(page))
            }
        }
    }

    pub fn read_at(
        &mut self,
        buf: &mut [u8],
        off: i64,
        fill: &mut ParentRead<'_>,
    ) -> Result<usize> {
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
            match self.pages.get(&pg_i) {
                Some(page) => buf[done..done + nc].copy_from_slice(&page.data[pg_o..pg_o + nc]),
                None => {
                    let chunk = &mut buf[done..done + nc];
                    chunk.fill(0);
                    fill(chunk, (pg_i << PG_BITS) + pg_o as i64)?;
                }
            }
            done += nc;
            pg_i += 1;
            pg_o = 0;
        }
        Ok(want)
    }

    pub fn write_at(&mut self, buf: &[u8], off: i64, fill: &mut ParentRead<'_>) -> Result<usize> {
        let mut src = buf;
        let mut pg_i = off >> PG_BITS;
        let mut pg_o = (off & PG_MASK) as usize;
        while !src.is_empty() {
            let page = Self::page_or_fill(&mut self.pages, pg_i, fill)?;
            let nc = (PG_SIZE - pg_o).min(src.len());
            page.data[pg_o..pg_o + nc].copy_from_slice(&src[..nc]);
            page.mark(pg_o..pg_o + nc);
            src = &src[nc..];
            pg_i += 1;
            pg_o = 0;
        }
        self.size = self.size.max(off + buf.len() as i64);
        Ok(buf.len())
    }

    pub fn truncate(&mut self, size: i64, fill: &mut ParentRead<'_>) -> Result<()> {
        if size >= self.size {
            self.size = size;
            return Ok(());
        }

        // Boundary page: keep the head, zero and dirty the discarded tail.
        let tail = (size & PG_MASK) as usize;
        if tail != 0 {
            let pg_i = size >> PG_BITS;
            let pg_off = pg_i << PG_BITS;
            if let Some(page) = self.pages.get_mut(&pg_i) {
                page.data[tail..].fill(0);
                page.mark(tail..PG_SIZE);
            } else if pg_off < self.parent_size {
                let mut page = OverlayPage::zeroed();
                fill(&mut page.data[..tail], pg_off)?;
                page.mark(tail..PG_SIZE);
                self.pages.insert(pg_i, page);
            }
        }

        // Whole pages the parent still backs become all-dirty zero pages so
        // the stale parent bytes cannot resurface; pages past the parent's
        // extent read as zeros from below and are simply dropped.
        let first_stale = (size + PG_MASK) >> PG_BITS;
        let end_stale = (self.parent_size + PG_MASK) >> PG_BITS;
        for pg_i in first_stale..end_stale {
            self.pages.insert(pg_i, OverlayPage::all_dirty_zero());
        }
        self.pages.retain(|&pg_i, _| pg_i < end_stale.max(first_stale));

        self.size = size;
        Ok(())
    }

    /// Replaces every page fully covered by `[off, off + size)` with an
    /// all-dirty zero page. Bounds are validated by the caller.
    pub fn punch_hole(&mut self, off: i64, size: i64) {
        let first = (off + PG_MASK) >> PG_BITS;
        let last = (off + size) >> PG_BITS; // exclusive
        for pg_i in first..last {
            self.pages.insert(pg_i, OverlayPage::all_dirty_zero());
        }
    }

    /// Emits `(offset, bytes)` for every maximal dirty run, pages in
    /// ascending order, ascending byte order within a page, clamped to the
    /// overlay size.
    pub fn for_each_dirty_run(
        &self,
        mut emit: impl FnMut(i64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut dirty: Vec<i64> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&i, _)| i)
            .collect();
        dirty.sort_unstable();

        for pg_i in dirty {
            let page = &self.pages[&pg_i];
            let pg_off = pg_i << PG_BITS;
            // Nothing of this page is inside the committed image.
            if pg_off >= self.size {
                continue;
            }
            let limit = ((self.size - pg_off).min(PG_SIZE as i64)) as usize;

            let mut run_start: Option<usize> = None;
            for i in 0..=limit {
                let on = i < limit && page.is_marked(i);
                match (run_start, on) {
                    (None, true) => run_start = Some(i),
                    (Some(s), false) => {
                        emit(pg_off + s as i64, &page.data[s..i])?;
                        run_start = None;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A parent view backed by a byte vector.
    fn vec_fill(parent: &[u8]) -> impl FnMut(&mut [u8], i64) -> Result<usize> + '_ {
        move |buf, off| {
            let off = off as usize;
            if off >= parent.len() {
                return Ok(0);
            }
            let n = buf.len().min(parent.len() - off);
            buf[..n].copy_from_slice(&parent[off..off + n]);
            Ok(n)
        }
    }

    #[test]
    fn reads_fall_through_to_parent() {
        let parent = vec![7u8; 600];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(600);

        let mut buf = [0u8; 20];
        assert_eq!(ov.read_at(&mut buf, 250, &mut fill).unwrap(), 20);
        assert_eq!(buf, [7u8; 20]);
    }

    #[test]
    fn writes_shadow_parent_and_keep_neighbours() {
        let parent = vec![7u8; 600];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(600);

        ov.write_at(&[1, 2, 3], 100, &mut fill).unwrap();

        let mut buf = [0u8; 5];
        ov.read_at(&mut buf, 99, &mut fill).unwrap();
        assert_eq!(buf, [7, 1, 2, 3, 7], "surrounding bytes SHOULD come from the parent");
    }

    #[test]
    fn reads_clamp_to_overlay_size() {
        let parent = vec![7u8; 100];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(100);

        let mut buf = [0xAAu8; 200];
        assert_eq!(ov.read_at(&mut buf, 40, &mut fill).unwrap(), 60);
        assert_eq!(ov.read_at(&mut buf, 100, &mut fill).unwrap(), 0);
    }

    #[test]
    fn dirty_runs_cover_exactly_the_written_bytes() {
        let parent = vec![7u8; 600];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(600);

        ov.write_at(&[1, 1], 10, &mut fill).unwrap();
        ov.write_at(&[2], 13, &mut fill).unwrap();
        ov.write_at(&[3; 10], 250, &mut fill).unwrap(); // crosses a page edge

        let mut runs = Vec::new();
        ov.for_each_dirty_run(|off, bytes| {
            runs.push((off, bytes.to_vec()));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            runs,
            vec![
                (10, vec![1, 1]),
                (13, vec![2]),
                (250, vec![3; 6]),
                (256, vec![3; 4]),
            ]
        );
    }

    #[test]
    fn truncate_then_grow_reads_zeros() {
        let parent = vec![7u8; 600];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(600);

        ov.truncate(100, &mut fill).unwrap();
        assert_eq!(ov.size(), 100);
        ov.truncate(600, &mut fill).unwrap();

        let mut buf = [0xAAu8; 500];
        ov.read_at(&mut buf, 100, &mut fill).unwrap();
        assert_eq!(&buf[..], &[0u8; 500][..], "regrown range SHOULD read as zeros");

        let mut head = [0u8; 100];
        ov.read_at(&mut head, 0, &mut fill).unwrap();
        assert_eq!(head, [7u8; 100], "retained range SHOULD keep parent bytes");
    }

    #[test]
    fn truncate_dirties_the_discarded_parent_range() {
        let parent = vec![7u8; 512];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(512);

        ov.truncate(200, &mut fill).unwrap();
        ov.write_at(&[9], 511, &mut fill).unwrap(); // regrow to 512

        let mut zeros_written = 0usize;
        ov.for_each_dirty_run(|_, bytes| {
            zeros_written += bytes.iter().filter(|&&b| b == 0).count();
            Ok(())
        })
        .unwrap();
        assert!(
            zeros_written >= 311,
            "flush SHOULD overwrite stale parent bytes with zeros, saw {}",
            zeros_written
        );
    }

    #[test]
    fn dirty_runs_do_not_leak_past_the_size() {
        let parent = vec![7u8; 512];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(512);

        ov.write_at(&[1; 100], 412, &mut fill).unwrap();
        ov.truncate(450, &mut fill).unwrap();

        ov.for_each_dirty_run(|off, bytes| {
            assert!(off + bytes.len() as i64 <= 450, "run past the size");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn punch_hole_zeroes_whole_pages_only() {
        let parent = vec![7u8; 1024];
        let mut fill = vec_fill(&parent);
        let mut ov = Overlay::new(1024);

        // Fully covers page 1, partially covers pages 0 and 2.
        ov.punch_hole(200, 400);

        let mut buf = [0u8; 1];
        ov.read_at(&mut buf, 300, &mut fill).unwrap();
        assert_eq!(buf[0], 0, "inside the hole SHOULD be zero");
        ov.read_at(&mut buf, 200, &mut fill).unwrap();
        assert_eq!(buf[0], 7, "partial edge SHOULD keep parent bytes");
        ov.read_at(&mut buf, 599, &mut fill).unwrap();
        assert_eq!(buf[0], 7);
    }
}
