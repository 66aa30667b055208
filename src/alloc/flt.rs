//! # Free-List Table
//!
//! The FLT is the allocator's persistent index of free space: an array of
//! buckets, each holding the head handle of a doubly linked list of free
//! blocks whose size in atoms is at least the bucket's minimum. The table
//! itself lives at offset 0 of the allocator's filer as `7 * nbuckets`
//! bytes of big-endian handles, zero-padded up to an atom boundary; block
//! space starts right after it.
//!
//! ## Bucket Shapes
//!
//! Three canonical shapes trade table size against fit precision:
//!
//! - **PowersOf2**: `1, 2, 4, …, 4096, 4112` (14 buckets, 112 bytes)
//! - **Fib**: `1, 2, 3, 5, 8, …, 2584, 4112` (18 buckets)
//! - **Full**: one bucket per atom count `1..=4112`
//!
//! `4112` is the atom span of the largest possible block, so the last
//! bucket always exists and catches everything at or above its minimum.
//!
//! ## Lookup Tables
//!
//! Two in-memory arrays map an atom count to a bucket index in O(1):
//! `get[rq]` is the first bucket whose minimum is `>= rq` (where a
//! satisfying free block may be listed), and `put[atoms]` is the last
//! bucket whose minimum is `<= atoms` (where a freed block of that size
//! belongs). They are rebuilt from the bucket minima on open.
//!
//! On a zero-sized filer the table is created zeroed; on an existing one
//! the heads are loaded from disk. A file shorter than the table is
//! corruption.

use eyre::Result;

use super::{b2h, h2b, MAX_FLT_RQ};
use crate::error::{CorruptKind, StoreError};
use crate::filer::Filer;

/// Canonical free-list table shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FltKind {
    #[default]
    PowersOf2,
    Fib,
    Full,
}

impl FltKind {
    fn min_sizes(self) -> Vec<i64> {
        match self {
            FltKind::PowersOf2 => {
                let mut v: Vec<i64> = (0..13).map(|i| 1i64 << i).collect();
                v.push(MAX_FLT_RQ);
                v
            }
            FltKind::Fib => {
                let mut v = vec![1i64, 2];
                while let [.., a, b] = v[..] {
                    if a + b > 2584 {
                        break;
                    }
                    v.push(a + b);
                }
                v.push(MAX_FLT_RQ);
                v
            }
            FltKind::Full => (1..=MAX_FLT_RQ).collect(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FltSlot {
    pub min_size: i64,
    pub head: i64,
    off: i64,
}

/// The in-memory table: slots plus O(1) bucket lookup arrays.
#[derive(Debug)]
pub(crate) struct Flt {
    slots: Vec<FltSlot>,
    size: i64,
    get: Vec<u16>,
    put: Vec<u16>,
}

impl Flt {
    /// Builds the table for `kind`, creating it on a fresh filer or
    /// loading the persisted heads from an existing one.
    pub fn new<F: Filer>(f: &mut F, kind: FltKind) -> Result<Self> {
        let min_sizes = kind.min_sizes();
        let slots: Vec<FltSlot> = min_sizes
            .iter()
            .enumerate()
            .map(|(i, &min_size)| FltSlot {
                min_size,
                head: 0,
                off: 7 * i as i64,
            })
            .collect();

        let size = (7 * slots.len() as i64 + 15) & !15;
        let mut flt = Self {
            slots,
            size,
            get: build_get(&min_sizes),
            put: build_put(&min_sizes),
        };

        let fsize = f.size()?;
        if fsize == 0 {
            let zeros = vec![0u8; size as usize];
            let n = f.write_at(&zeros, 0)?;
            if n != zeros.len() {
                return Err(StoreError::ShortWrite {
                    off: 0,
                    expected: zeros.len(),
                    written: n,
                }
                .into());
            }
        } else if fsize >= size {
            let mut buf = vec![0u8; size as usize];
            let n = f.read_at(&mut buf, 0)?;
            if n != buf.len() {
                return Err(StoreError::UnexpectedEof {
                    off: 0,
                    expected: buf.len(),
                }
                .into());
            }
            for (i, slot) in flt.slots.iter_mut().enumerate() {
                slot.head = b2h(&buf[7 * i..]);
            }
        } else {
            return Err(StoreError::corrupt_arg(CorruptKind::FltLoad, fsize, size).into());
        }

        Ok(flt)
    }

    /// Bytes the table occupies on disk; block space starts here.
    pub fn size_bytes(&self) -> i64 {
        self.size
    }

    fn bucket_for_put(&self, atoms: i64) -> usize {
        debug_assert!(atoms >= 1);
        if atoms >= MAX_FLT_RQ {
            self.slots.len() - 1
        } else {
            self.put[atoms as usize] as usize
        }
    }

    /// Pops the head of the first non-empty bucket that can satisfy a
    /// request of `need` atoms. Returns 0 when no such block is listed.
    /// The popped block stays linked; the caller unlinks it after reading
    /// its list neighbours.
    pub fn find<F: Filer>(&mut self, f: &mut F, need: i64) -> Result<i64> {
        debug_assert!(need >= 1);
        let start = if need >= MAX_FLT_RQ {
            self.slots.len() - 1
        } else {
            self.get[need as usize] as usize
        };
        for i in start..self.slots.len() {
            let h = self.slots[i].head;
            if h != 0 {
                self.write_head(f, i, 0)?;
                return Ok(h);
            }
        }
        Ok(0)
    }

    /// Head of the bucket a free block of `atoms` atoms belongs to.
    pub fn head(&self, atoms: i64) -> i64 {
        self.slots[self.bucket_for_put(atoms)].head
    }

    /// Persists `h` as the head of the bucket for blocks of `atoms` atoms.
    pub fn set_head<F: Filer>(&mut self, f: &mut F, h: i64, atoms: i64) -> Result<()> {
        let i = self.bucket_for_put(atoms);
        self.write_head(f, i, h)
    }

    fn write_head<F: Filer>(&mut self, f: &mut F, i: usize, h: i64) -> Result<()> {
        let slot = &mut self.slots[i];
        slot.head = h;
        let mut b = [0u8; 7];
        h2b(&mut b, h);
        let n = f.write_at(&b, slot.off)?;
        if n != 7 {
            return Err(StoreError::ShortWrite {
                off: slot.off,
                expected: 7,
                written: n,
            }
            .into());
        }
        Ok(())
    }

    /// Re-reads every bucket head from the filer, discarding the cached
    /// values. Required after a transaction rollback, which reverts the
    /// persisted heads underneath the cache.
    pub fn reload<F: Filer>(&mut self, f: &mut F) -> Result<()> {
        let mut buf = vec![0u8; self.size as usize];
        let n = f.read_at(&mut buf, 0)?;
        if n != buf.len() {
            return Err(StoreError::UnexpectedEof {
                off: 0,
                expected: buf.len(),
            }
            .into());
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.head = b2h(&buf[7 * i..]);
        }
        Ok(())
    }

    /// All buckets, for the verifier's free-list walk.
    pub fn report(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.slots.iter().map(|s| (s.min_size, s.head))
    }
}

fn build_get(min_sizes: &[i64]) -> Vec<u16> {
    let mut get = vec![0u16; MAX_FLT_RQ as usize + 1];
    let mut rq = 1usize;
    for (si, &min) in min_sizes.iter().enumerate() {
        while rq as i64 <= min {
            get[rq] = si as u16;
            rq += 1;
        }
    }
    get
}

fn build_put(min_sizes: &[i64]) -> Vec<u16> {
    let mut put = vec![0u16; MAX_FLT_RQ as usize + 1];
    let mut rq = 1usize;
    for si in 0..min_sizes.len() {
        if si == min_sizes.len() - 1 {
            put[MAX_FLT_RQ as usize] = si as u16;
            break;
        }
        while (rq as i64) <= min_sizes[si + 1] - 1 {
            put[rq] = si as u16;
            rq += 1;
        }
    }
    put
}
