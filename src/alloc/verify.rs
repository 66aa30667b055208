//! # Structural Audit
//!
//! [`Allocator::verify`] walks the whole file and checks every invariant
//! the allocator maintains: block tags and geometry, zero padding, content
//! codes, decompressability, relocation targets, free-list linkage, the
//! no-adjacent-free and no-free-tail rules, and that every free block is
//! reachable from exactly one bucket.
//!
//! ## Phases
//!
//! 1. **Forward scan** - walk blocks from handle 1 to the tail, validate
//!    each block in depth, and mark every block start in a scratch bitmap.
//! 2. **Used-block check** - walk again; relocated blocks must point at
//!    plain used blocks; clear the bitmap bit of every used block.
//! 3. **Free-list walk** - follow every bucket's list, checking prev/next
//!    consistency and bucket minimums, clearing bits as blocks are
//!    visited.
//! 4. **Lost-block sweep** - any bit still set is a free block no list
//!    reaches; report each one.
//!
//! ## Reporting
//!
//! Structural findings go through the caller's sink, which returns whether
//! to keep going; the audit also stops on its own where a finding makes
//! the walk itself unreliable (an undecodable block span, a broken list).
//! I/O and bitmap failures are not findings - they abort immediately.
//! Verify returns `Ok` only when the audit completed with zero findings;
//! only then is the optional [`AllocStats`] filled.
//!
//! The bitmap is any caller-supplied zero-sized [`Filer`] (a
//! [`crate::filer::MemFiler`] unless the file is enormous); it grows to
//! `file_size / 128` bytes.

use eyre::Result;
use log::debug;

use super::{
    b2h, h2off, m2n, n2atoms, Allocator, ATOM, CC_NONE, CC_SNAPPY, MAX_RQ, TAG_FREE_LONG,
    TAG_FREE_SHORT, TAG_USED_LONG, TAG_USED_RELOCATED,
};
use crate::error::{CorruptKind, StoreError};
use crate::filer::Filer;

/// Statistics gathered by a successful [`Allocator::verify`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Atoms in the file: `alloc_atoms + free_atoms`.
    pub total_atoms: i64,
    /// Atoms in used blocks, relocation atoms included.
    pub alloc_atoms: i64,
    /// Content bytes stored, after decompression where used.
    pub alloc_bytes: i64,
    /// Number of relocated used blocks.
    pub relocations: i64,
    /// Atoms in free blocks.
    pub free_atoms: i64,
    /// Live handles: used blocks that are not relocation targets.
    pub handles: i64,
}

/// Per-handle bit ledger over a scratch filer.
struct BlockBitmap<'a, B: Filer> {
    filer: &'a mut B,
    bits: i64,
}

impl<B: Filer> BlockBitmap<'_, B> {
    fn peek(&mut self, h: i64) -> Result<bool> {
        let off = h >> 3;
        let mut byte = [0u8];
        if off < self.filer.size()? {
            self.filer
                .read_at(&mut byte, off)
                .map_err(|_| StoreError::corrupt(CorruptKind::Bitmap, off))?;
        }
        Ok(byte[0] & (1 << (h & 7)) != 0)
    }

    fn flip(&mut self, h: i64, on: bool) -> Result<bool> {
        let off = h >> 3;
        let mask = 1u8 << (h & 7);
        let mut byte = [0u8];
        if off < self.filer.size()? {
            let n = self
                .filer
                .read_at(&mut byte, off)
                .map_err(|_| StoreError::corrupt(CorruptKind::Bitmap, off))?;
            if n != 1 {
                return Err(StoreError::corrupt(CorruptKind::Bitmap, off).into());
            }
        }

        let was_on = byte[0] & mask != 0;
        match (was_on, on) {
            (false, true) => {
                byte[0] |= mask;
                self.bits += 1;
            }
            (true, false) => {
                byte[0] ^= mask;
                self.bits -= 1;
            }
            _ => {}
        }
        let n = self
            .filer
            .write_at(&byte, off)
            .map_err(|_| StoreError::corrupt(CorruptKind::Bitmap, off))?;
        if n != 1 {
            return Err(StoreError::corrupt(CorruptKind::Bitmap, off).into());
        }
        Ok(was_on)
    }
}

/// Funnels findings to the caller's sink and remembers the first one, so
/// the audit can keep walking yet still fail at the end.
struct Reporter<'a> {
    log: &'a mut dyn FnMut(&StoreError) -> bool,
    first: Option<StoreError>,
}

impl<'a> Reporter<'a> {
    fn new(log: &'a mut dyn FnMut(&StoreError) -> bool) -> Self {
        Self { log, first: None }
    }

    /// Records a finding; `Err` means the sink asked to stop.
    fn finding(&mut self, err: StoreError) -> Result<()> {
        let go_on = (self.log)(&err);
        if self.first.is_none() {
            self.first = Some(err.clone());
        }
        if go_on {
            Ok(())
        } else {
            Err(err.into())
        }
    }

    /// Records a finding the walk cannot survive; always an error.
    fn fatal(&mut self, err: StoreError) -> eyre::Report {
        (self.log)(&err);
        if self.first.is_none() {
            self.first = Some(err.clone());
        }
        err.into()
    }

    fn into_result(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }
}

impl<F: Filer> Allocator<F> {
    /// Audits the entire file.
    ///
    /// `bitmap` must be a zero-sized scratch [`Filer`]. Structural findings
    /// are passed to `log`; returning `false` stops the audit. `stats` is
    /// filled only when the audit finishes without a single finding.
    pub fn verify<B: Filer>(
        &mut self,
        bitmap: &mut B,
        log: &mut dyn FnMut(&StoreError) -> bool,
        stats: Option<&mut AllocStats>,
    ) -> Result<()> {
        if bitmap.size()? != 0 {
            return Err(StoreError::InvalidArgument {
                what: "verify: bitmap initial size non-zero",
                value: bitmap.size()?,
            }
            .into());
        }

        let mut rep = Reporter::new(log);

        let fsz = self.bsize()?;
        if fsz % ATOM != 0 {
            return Err(rep.fatal(StoreError::corrupt_arg(CorruptKind::FileSize, 0, fsz)));
        }
        let total_atoms = fsz / ATOM;

        let mut bits = BlockBitmap { filer: bitmap, bits: 0 };
        let mut st = AllocStats {
            total_atoms,
            ..AllocStats::default()
        };
        let mut content = vec![0u8; MAX_RQ];

        // Phase 1: forward scan, one bit per block start.
        debug!("verify: forward scan of {} atoms", total_atoms);
        let mut prev_free = false;
        let mut last_h = 0i64;
        let mut last_tag = 0u8;
        let mut h = 1i64;
        while h <= total_atoms {
            let mut tag = [0u8];
            self.read(&mut tag, h2off(h))?;
            let tag = tag[0];

            let atoms = match tag {
                TAG_FREE_SHORT | TAG_FREE_LONG => {
                    if prev_free {
                        return Err(rep.fatal(StoreError::corrupt_arg(
                            CorruptKind::AdjacentFree,
                            h2off(last_h),
                            h2off(h),
                        )));
                    }
                    let atoms = self.verify_free_block(h, total_atoms, tag, &mut rep)?;
                    st.free_atoms += atoms;
                    atoms
                }
                _ => {
                    let (dlen, atoms) =
                        self.verify_used_block(h, total_atoms, tag, &mut rep, &mut content)?;
                    st.alloc_atoms += atoms;
                    st.alloc_bytes += dlen as i64;
                    if tag == TAG_USED_RELOCATED {
                        st.relocations += 1;
                    } else {
                        st.handles += 1;
                    }
                    atoms
                }
            };

            if bits.flip(h, true)? {
                eyre::bail!("verify: internal error: block start {} marked twice", h);
            }
            prev_free = matches!(tag, TAG_FREE_SHORT | TAG_FREE_LONG);
            last_h = h;
            last_tag = tag;
            h += atoms;
        }

        if total_atoms != 0 && matches!(last_tag, TAG_FREE_SHORT | TAG_FREE_LONG) {
            return Err(rep.fatal(StoreError::corrupt(
                CorruptKind::FreeTailBlock,
                h2off(last_h),
            )));
        }

        // Phase 2: relocation targets, then unmark used blocks.
        debug!("verify: used-block check");
        let mut h = 1i64;
        while h <= total_atoms {
            let (tag, atoms, _, link) = self.nfo(h)?;
            match tag {
                TAG_FREE_SHORT | TAG_FREE_LONG => {
                    h += atoms;
                    continue;
                }
                TAG_USED_RELOCATED => {
                    // A nil or out-of-range target was already reported in
                    // phase 1; only in-range targets can be inspected.
                    if link >= 1 && link <= total_atoms {
                        let mut target_tag = [0u8];
                        self.read(&mut target_tag, h2off(link))?;
                        if matches!(
                            target_tag[0],
                            TAG_FREE_SHORT | TAG_FREE_LONG | TAG_USED_RELOCATED
                        ) {
                            rep.finding(StoreError::corrupt_arg(
                                CorruptKind::InvalidRelocationTarget,
                                h2off(h),
                                link,
                            ))?;
                        }
                    }
                }
                _ => {}
            }

            if !bits.flip(h, false)? {
                eyre::bail!("verify: internal error: used block {} was not marked", h);
            }
            h += atoms;
        }

        // Phase 3: walk every bucket's list.
        debug!("verify: free-list walk");
        let buckets: Vec<(i64, i64)> = self.flt.report().collect();
        for (min_size, head) in buckets {
            let mut prev = 0i64;
            let mut next = head;
            while next != 0 {
                if !bits.flip(next, false)? {
                    return Err(rep.fatal(StoreError::corrupt_arg(
                        CorruptKind::FltLink,
                        h2off(next),
                        min_size,
                    )));
                }

                let (tag, atoms, fprev, fnext) = self.nfo(next)?;
                if !matches!(tag, TAG_FREE_SHORT | TAG_FREE_LONG) {
                    return Err(rep.fatal(StoreError::corrupt_arg(
                        CorruptKind::ExpectedFreeTag,
                        h2off(next),
                        i64::from(tag),
                    )));
                }
                if atoms < min_size {
                    rep.finding(StoreError::Corrupt {
                        kind: CorruptKind::FltMinSize,
                        off: h2off(next),
                        arg: atoms,
                        arg2: min_size,
                    })?;
                }
                if fprev != prev {
                    return Err(rep.fatal(StoreError::corrupt(
                        CorruptKind::FreeChaining,
                        h2off(next),
                    )));
                }

                prev = next;
                next = fnext;
            }
        }

        // Phase 4: any bit still set is a lost free block.
        if bits.bits != 0 {
            debug!("verify: sweeping for {} lost free blocks", bits.bits);
            for h in 1..=total_atoms {
                if bits.peek(h)? {
                    rep.finding(StoreError::corrupt(CorruptKind::LostFreeBlock, h2off(h)))?;
                }
            }
        }

        rep.into_result()?;
        if let Some(stats) = stats {
            *stats = st;
        }
        Ok(())
    }

    /// Full validation of a free block in phase 1. Returns its atom span.
    fn verify_free_block(
        &mut self,
        h: i64,
        total_atoms: i64,
        tag: u8,
        rep: &mut Reporter<'_>,
    ) -> Result<i64> {
        let off = h2off(h);
        match tag {
            TAG_FREE_SHORT => {
                let mut b = [0u8; 16];
                self.read(&mut b, off)?;
                if b[15] != TAG_FREE_SHORT {
                    rep.finding(StoreError::corrupt_arg(
                        CorruptKind::ShortFreeTailTag,
                        off,
                        i64::from(b[15]),
                    ))?;
                }
                Ok(1)
            }
            _ => {
                let mut b = [0u8; 22];
                self.read(&mut b, off)?;
                let atoms = b2h(&b[1..]);
                let prev = b2h(&b[8..]);
                let next = b2h(&b[15..]);

                if atoms < 2 {
                    return Err(rep.fatal(StoreError::corrupt_arg(
                        CorruptKind::LongFreeTooShort,
                        off,
                        atoms,
                    )));
                }
                if h + atoms - 1 > total_atoms {
                    return Err(rep.fatal(StoreError::corrupt_arg(
                        CorruptKind::LongFreeTooLong,
                        off,
                        atoms,
                    )));
                }
                if prev > total_atoms {
                    rep.finding(StoreError::corrupt_arg(
                        CorruptKind::LongFreePrevBeyondEof,
                        off,
                        prev,
                    ))?;
                }
                if next > total_atoms {
                    rep.finding(StoreError::corrupt_arg(
                        CorruptKind::LongFreeNextBeyondEof,
                        off,
                        next,
                    ))?;
                }

                let mut tail = [0u8; 8];
                self.read(&mut tail, h2off(h + atoms) - 8)?;
                if tail[7] != TAG_FREE_LONG {
                    rep.finding(StoreError::corrupt_arg(
                        CorruptKind::LongFreeTailTag,
                        off,
                        i64::from(tail[7]),
                    ))?;
                } else if b2h(&tail) != atoms {
                    rep.finding(StoreError::Corrupt {
                        kind: CorruptKind::TailSizeMismatch,
                        off,
                        arg: atoms,
                        arg2: b2h(&tail),
                    })?;
                }
                Ok(atoms)
            }
        }
    }

    /// Full validation of a used block in phase 1. Returns the stored
    /// content length (decompressed where applicable) and the atom span.
    fn verify_used_block(
        &mut self,
        h: i64,
        total_atoms: i64,
        tag: u8,
        rep: &mut Reporter<'_>,
        content: &mut [u8],
    ) -> Result<(usize, i64)> {
        let off = h2off(h);
        let (mut dlen, atoms, padding, doff) = match tag {
            TAG_USED_LONG => {
                let mut b2 = [0u8; 2];
                self.read(&mut b2, off + 1)?;
                let dlen = m2n(i64::from(b2[0]) << 8 | i64::from(b2[1]));
                (dlen, n2atoms(dlen), (15 - (dlen + 3) % 16), off + 3)
            }
            TAG_USED_RELOCATED => (7usize, 1i64, 7usize, off + 1),
            _ => {
                let dlen = tag as usize;
                (dlen, n2atoms(dlen), (15 - (dlen + 1) % 16), off + 1)
            }
        };

        if h + atoms - 1 > total_atoms {
            return Err(rep.fatal(StoreError::corrupt_arg(
                CorruptKind::UsedBeyondEof,
                off,
                atoms,
            )));
        }

        // Padding plus content code, at the end of the block.
        let tailsz = 1 + padding;
        let mut tail = [0u8; 16];
        self.read(&mut tail[..tailsz], off + ATOM * atoms - tailsz as i64)?;
        if tail[..padding].iter().any(|&b| b != 0) {
            rep.finding(StoreError::corrupt(CorruptKind::Padding, off))?;
        }

        let cc = tail[padding];
        match cc {
            CC_NONE => {}
            CC_SNAPPY if tag == TAG_USED_RELOCATED => {
                rep.finding(StoreError::corrupt(CorruptKind::TailTag, off))?;
            }
            CC_SNAPPY => {}
            _ => {
                rep.finding(StoreError::corrupt_arg(
                    CorruptKind::TailTag,
                    off,
                    i64::from(cc),
                ))?;
            }
        }

        self.read(&mut content[..dlen], doff)?;

        if cc == CC_SNAPPY {
            match snap::raw::Decoder::new().decompress_vec(&content[..dlen]) {
                Ok(raw) if raw.len() <= MAX_RQ => dlen = raw.len(),
                _ => {
                    rep.finding(StoreError::corrupt(CorruptKind::Decompression, off))?;
                }
            }
        }

        if tag == TAG_USED_RELOCATED {
            let link = b2h(content);
            if link == 0 {
                rep.finding(StoreError::corrupt(CorruptKind::NullRelocation, off))?;
            } else if link > total_atoms {
                rep.finding(StoreError::corrupt_arg(
                    CorruptKind::RelocationBeyondEof,
                    off,
                    link,
                ))?;
            }
            dlen = 0;
        }

        Ok((dlen, atoms))
    }
}
