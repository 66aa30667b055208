//! # Block Allocator
//!
//! The [`Allocator`] manages raw storage space on a [`Filer`]: it carves
//! the file into used and free blocks at 16-byte (atom) granularity, hands
//! out stable integer handles for stored content, and reuses freed space
//! through the [free-list table](flt).
//!
//! ## Atoms and Handles
//!
//! An atom is 16 bytes; every block is a contiguous run of atoms, so a
//! valid file size is always a multiple of 16. A handle names the atom a
//! block starts at: `handle = offset/16 + 1`, handle 0 is nil. Handles are
//! 56-bit, capping the addressable file at 2^60 bytes.
//!
//! ## Block Images
//!
//! The first byte of a block is its head tag, the last byte its tail tag:
//!
//! | Head | Kind | Layout |
//! |---|---|---|
//! | `0x00-0xFB` | short used | tag is the content length; 1 atom up to 14 bytes, else `(N+1)/16 + 1` atoms |
//! | `0xFC` | long used | 2-byte length field for `N` in `252..=65787`; `(N+3)/16 + 1` atoms |
//! | `0xFD` | relocated | bytes 1-7 hold the target handle; exactly 1 atom |
//! | `0xFE` | short free | 1 atom; prev and next list links |
//! | `0xFF` | long free | >= 2 atoms; size, prev, next in the head; size again in the last 8 bytes |
//!
//! A used block's tail byte is its content code: 0 for raw bytes, 1 for
//! Snappy-compressed. Padding between content and tail is zeros. A
//! relocated block points at the real content block, so a handle can stay
//! constant while the content changes size; at most one hop is allowed.
//!
//! ## Free-Space Discipline
//!
//! Deallocation coalesces with free neighbours on both sides, never leaves
//! two adjacent free blocks, and truncates the file instead of linking a
//! free block that would end at the file tail. Allocation reuses the first
//! listed block big enough, splitting off the remainder as a smaller free
//! block, and grows the file only when no listed block fits.
//!
//! ## Compression
//!
//! With compression enabled, content longer than 14 bytes is test-encoded
//! with Snappy and the compressed form is stored only when it saves at
//! least one whole atom. Reads are transparent either way.
//!
//! ## Caveats
//!
//! Handles are raw pointers into the file: passing a handle that was never
//! returned by [`Allocator::alloc`], or was already freed, can corrupt the
//! database irreparably. Content is not wiped on free; callers storing
//! sensitive data should overwrite it before freeing. Mutating operations
//! should run inside a transaction of the underlying filer stack.

mod flt;
mod verify;

pub use flt::FltKind;
pub use verify::AllocStats;

use eyre::Result;

use crate::error::{CorruptKind, StoreError};
use crate::filer::Filer;
use flt::Flt;

pub(crate) const ATOM: i64 = 16;
/// Longest content of a short used block.
pub const MAX_SHORT: usize = 251;
/// Longest content of any block.
pub const MAX_RQ: usize = 65787;
pub(crate) const MAX_HANDLE: i64 = (1i64 << 56) - 1;
pub(crate) const MAX_FLT_RQ: i64 = 4112;

pub(crate) const TAG_USED_LONG: u8 = 0xFC;
pub(crate) const TAG_USED_RELOCATED: u8 = 0xFD;
pub(crate) const TAG_FREE_SHORT: u8 = 0xFE;
pub(crate) const TAG_FREE_LONG: u8 = 0xFF;

pub(crate) const CC_NONE: u8 = 0x00;
pub(crate) const CC_SNAPPY: u8 = 0x01;

/// Atoms a block holding `n` content bytes occupies, uncompressed.
/// Useful for callers planning space ahead of allocation.
pub fn atoms_for(n: usize) -> i64 {
    n2atoms(n)
}

/// Atoms needed to store `n` content bytes.
pub(crate) fn n2atoms(n: usize) -> i64 {
    let n = n as i64;
    if n > MAX_SHORT as i64 {
        (n + 3) / 16 + 1
    } else {
        (n + 1) / 16 + 1
    }
}

/// Zero-padding bytes between `n` content bytes and the tail tag.
pub(crate) fn n2padding(n: usize) -> usize {
    let n = n as i64;
    let pad = if n > MAX_SHORT as i64 {
        15 - (n + 3) % 16
    } else {
        15 - (n + 1) % 16
    };
    pad as usize
}

pub(crate) fn h2off(h: i64) -> i64 {
    (h - 1) * ATOM
}

pub(crate) fn off2h(off: i64) -> i64 {
    off / ATOM + 1
}

/// Decodes the long-block length field: stored value is `n mod 0x10000`,
/// and anything at or below [`MAX_SHORT`] means the next 64 KiB band.
pub(crate) fn m2n(m: i64) -> usize {
    if m <= MAX_SHORT as i64 {
        (m + 0x10000) as usize
    } else {
        m as usize
    }
}

pub(crate) fn n2m(n: usize) -> i64 {
    (n % 0x10000) as i64
}

/// Reads a 7-byte big-endian handle.
pub(crate) fn b2h(b: &[u8]) -> i64 {
    let mut h = 0i64;
    for &byte in &b[..7] {
        h = h << 8 | i64::from(byte);
    }
    h
}

/// Writes a 7-byte big-endian handle.
pub(crate) fn h2b(b: &mut [u8], h: i64) {
    let mut h = h;
    for i in (0..7).rev() {
        b[i] = h as u8;
        h >>= 8;
    }
}

/// Prepared on-disk head and size info for a used block's content.
struct UsedHead {
    head: [u8; 3],
    head_len: usize,
    cc: u8,
    dlen: usize,
    rq_atoms: i64,
    in_zbuf: bool,
}

/// Atom-granular block allocator over a [`Filer`].
///
/// The free-list table occupies the filer's prefix; block space begins at
/// the first atom boundary after it. To open an existing file pass its
/// filer; a zero-sized filer is initialized as a fresh, empty store. On a
/// transactional filer, creation and every mutating call must happen
/// inside an open transaction.
pub struct Allocator<F: Filer> {
    f: F,
    flt: Flt,
    base: i64,
    compress: bool,
    zbuf: Vec<u8>,
}

impl<F: Filer> Allocator<F> {
    pub fn new(mut f: F, kind: FltKind) -> Result<Self> {
        let flt = Flt::new(&mut f, kind)?;
        let base = flt.size_bytes();
        Ok(Self {
            f,
            flt,
            base,
            compress: false,
            zbuf: Vec::new(),
        })
    }

    /// Enables or disables Snappy compression for subsequent writes.
    /// Existing blocks are unaffected; reads always honour the stored
    /// content code.
    pub fn set_compression(&mut self, on: bool) {
        self.compress = on;
    }

    pub fn compression(&self) -> bool {
        self.compress
    }

    /// Re-reads the free-list table heads from the filer. Must be called
    /// after rolling back a transaction that may have mutated free lists;
    /// the rollback reverts the persisted table underneath the cache.
    pub fn reload_flt(&mut self) -> Result<()> {
        self.flt.reload(&mut self.f)
    }

    pub fn filer(&self) -> &F {
        &self.f
    }

    pub fn filer_mut(&mut self) -> &mut F {
        &mut self.f
    }

    pub fn into_filer(self) -> F {
        self.f
    }

    /// Size of the block space in bytes (the filer minus the table).
    fn bsize(&mut self) -> Result<i64> {
        Ok((self.f.size()? - self.base).max(0))
    }

    fn read(&mut self, buf: &mut [u8], off: i64) -> Result<()> {
        let n = self.f.read_at(buf, off + self.base)?;
        if n != buf.len() {
            return Err(StoreError::UnexpectedEof {
                off,
                expected: buf.len(),
            }
            .into());
        }
        Ok(())
    }

    fn write(&mut self, b: &[u8], off: i64) -> Result<()> {
        let n = self.f.write_at(b, off + self.base)?;
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

    fn write_parts(&mut self, mut off: i64, parts: &[&[u8]]) -> Result<()> {
        for part in parts {
            self.write(part, off)?;
            off += part.len() as i64;
        }
        Ok(())
    }

    fn truncate_bspace(&mut self, off: i64) -> Result<()> {
        self.f.truncate(off + self.base)
    }

    /// Allocates a block holding `b` and returns its handle.
    ///
    /// The handle stays valid until [`free`](Self::free), or until a
    /// [`realloc`](Self::realloc) moves the content (the handle itself
    /// remains usable). No two live handles share a value.
    pub fn alloc(&mut self, b: &[u8]) -> Result<i64> {
        let mut zbuf = std::mem::take(&mut self.zbuf);
        let r = self.alloc_with(b, &mut zbuf);
        self.zbuf = zbuf;
        r
    }

    fn alloc_with(&mut self, b: &[u8], zbuf: &mut Vec<u8>) -> Result<i64> {
        let head = self.make_used_block(b, zbuf)?;
        let data: &[u8] = if head.in_zbuf { &zbuf[..] } else { b };
        self.alloc_block(data, &head)
    }

    fn alloc_block(&mut self, data: &[u8], head: &UsedHead) -> Result<i64> {
        let rq_atoms = head.rq_atoms;
        let h = self.flt.find(&mut self.f, rq_atoms)?;

        if h == 0 {
            // No listed block fits; grow the file.
            let h = off2h(self.bsize()?);
            self.write_used_block(h, head, data)?;
            return Ok(h);
        }

        // The candidate is the head of its bucket's list.
        let (tag, s, prev, next) = self.nfo(h)?;
        if tag != TAG_FREE_SHORT && tag != TAG_FREE_LONG {
            return Err(StoreError::corrupt_arg(
                CorruptKind::ExpectedFreeTag,
                h2off(h),
                i64::from(tag),
            )
            .into());
        }
        if prev != 0 {
            return Err(
                StoreError::corrupt_arg(CorruptKind::ListHead, h2off(h), prev).into(),
            );
        }
        if s < rq_atoms {
            return Err(StoreError::Corrupt {
                kind: CorruptKind::BlockTooSmall,
                off: h2off(h),
                arg: rq_atoms,
                arg2: s,
            }
            .into());
        }

        self.unlink(s, prev, next)?;
        if s > rq_atoms {
            // Split: the remainder becomes a new free block.
            self.link(h + rq_atoms, s - rq_atoms)?;
        }
        self.write_used_block(h, head, data)?;
        Ok(h)
    }

    /// Deallocates the block at `handle`. The handle is invalid afterwards.
    pub fn free(&mut self, handle: i64) -> Result<()> {
        if handle <= 0 || handle > MAX_HANDLE {
            return Err(StoreError::InvalidArgument {
                what: "free: handle out of limits",
                value: handle,
            }
            .into());
        }
        self.free_handle(handle, 0, true)
    }

    fn free_handle(&mut self, h: i64, from: i64, accept_relocs: bool) -> Result<()> {
        let (tag, atoms, _, next) = self.nfo(h)?;
        match tag {
            TAG_USED_RELOCATED => {
                if !accept_relocs {
                    return Err(StoreError::corrupt_arg(
                        CorruptKind::UnexpectedRelocation,
                        h2off(h),
                        h2off(from),
                    )
                    .into());
                }
                self.free_handle(next, h, false)?;
            }
            TAG_FREE_SHORT | TAG_FREE_LONG => {
                return Err(StoreError::InvalidArgument {
                    what: "free: attempt to free a free block at offset",
                    value: h2off(h),
                }
                .into());
            }
            _ => {}
        }
        self.free_block(h, atoms)
    }

    /// Links the freed span, coalescing with free neighbours and cutting
    /// the file tail instead of listing a trailing free block.
    fn free_block(&mut self, h: i64, atoms: i64) -> Result<()> {
        let sz = self.bsize()?;

        let (latoms, lp, ln) = match self.left_nfo(h)? {
            Some((tag, s, p, n)) if tag == TAG_FREE_SHORT || tag == TAG_FREE_LONG => (s, p, n),
            _ => (0, 0, 0),
        };

        let is_tail = h2off(h) + atoms * ATOM == sz;
        let (mut ratoms, mut rp, mut rn) = (0i64, 0i64, 0i64);
        if !is_tail {
            let (rtag, s, p, n) = self.nfo(h + atoms)?;
            if rtag == TAG_FREE_SHORT || rtag == TAG_FREE_LONG {
                ratoms = s;
                rp = p;
                rn = n;
            }
        }

        match (latoms != 0, ratoms != 0) {
            (false, false) => {
                if is_tail {
                    return self.truncate_bspace(h2off(h));
                }
                self.link(h, atoms)
            }
            (false, true) => {
                self.unlink(ratoms, rp, rn)?;
                self.link(h, atoms + ratoms)
            }
            (true, false) => {
                self.unlink(latoms, lp, ln)?;
                if is_tail {
                    return self.truncate_bspace(h2off(h - latoms));
                }
                self.link(h - latoms, latoms + atoms)
            }
            (true, true) => {
                let (lh, rh) = (h - latoms, h + atoms);
                self.unlink(latoms, lp, ln)?;
                // Unlinking the left block may have rewritten the right
                // block's list links.
                let (_, _, rp, rn) = self.nfo(rh)?;
                self.unlink(ratoms, rp, rn)?;
                self.link(lh, latoms + atoms + ratoms)
            }
        }
    }

    /// Adds the block at `h` to the free list of its size bucket.
    fn link(&mut self, h: i64, atoms: i64) -> Result<()> {
        let next = self.flt.head(atoms);
        self.make_free(h, atoms, 0, next)?;
        self.flt.set_head(&mut self.f, h, atoms)
    }

    /// Removes a block with links `(prev, next)` from its bucket's list.
    fn unlink(&mut self, atoms: i64, prev: i64, next: i64) -> Result<()> {
        match (prev != 0, next != 0) {
            // Sole member; it was the bucket head.
            (false, false) => self.flt.set_head(&mut self.f, 0, atoms),
            (false, true) => {
                self.set_prev(next, 0)?;
                self.flt.set_head(&mut self.f, next, atoms)
            }
            (true, false) => self.set_next(prev, 0),
            (true, true) => {
                self.set_next(prev, next)?;
                self.set_prev(next, prev)
            }
        }
    }

    /// Reads the content of the block at `handle`.
    ///
    /// Compressed content is returned decompressed. Reads never mutate
    /// allocator state.
    pub fn get(&mut self, handle: i64) -> Result<Vec<u8>> {
        let mut dst = Vec::new();
        self.get_into(handle, &mut dst)?;
        Ok(dst)
    }

    /// Like [`get`](Self::get), reusing `dst`'s capacity.
    pub fn get_into(&mut self, handle: i64, dst: &mut Vec<u8>) -> Result<()> {
        let mut zbuf = std::mem::take(&mut self.zbuf);
        let r = self.get_with(handle, dst, &mut zbuf);
        self.zbuf = zbuf;
        r
    }

    fn get_with(&mut self, mut handle: i64, dst: &mut Vec<u8>, zbuf: &mut Vec<u8>) -> Result<()> {
        let reloc_src = handle;
        let mut relocated = false;
        loop {
            if handle <= 0 || handle > MAX_HANDLE {
                return Err(StoreError::InvalidArgument {
                    what: "get: handle out of limits",
                    value: handle,
                }
                .into());
            }

            let off = h2off(handle);
            let mut first = [0u8; 16];
            self.read(&mut first, off)?;

            match first[0] {
                0 => {
                    dst.clear();
                    return Ok(());
                }
                tag @ 1..=0xFB => {
                    let dlen = tag as usize;
                    if n2atoms(dlen) == 1 {
                        // Content lives entirely in the first atom.
                        return match first[15] {
                            CC_NONE => {
                                dst.clear();
                                dst.extend_from_slice(&first[1..1 + dlen]);
                                Ok(())
                            }
                            CC_SNAPPY => decompress_into(&first[1..1 + dlen], dst, off),
                            cc => Err(StoreError::corrupt_arg(
                                CorruptKind::TailTag,
                                off,
                                i64::from(cc),
                            )
                            .into()),
                        };
                    }
                    return self.read_content(off, 1, dlen, dst, zbuf);
                }
                TAG_USED_LONG => {
                    let dlen = m2n(i64::from(first[1]) << 8 | i64::from(first[2]));
                    return self.read_content(off, 3, dlen, dst, zbuf);
                }
                TAG_USED_RELOCATED => {
                    if relocated {
                        return Err(StoreError::corrupt_arg(
                            CorruptKind::UnexpectedRelocation,
                            off,
                            reloc_src,
                        )
                        .into());
                    }
                    handle = b2h(&first[1..]);
                    relocated = true;
                }
                tag => {
                    return Err(StoreError::corrupt_arg(
                        CorruptKind::ExpectedUsedTag,
                        off,
                        i64::from(tag),
                    )
                    .into());
                }
            }
        }
    }

    /// Reads a multi-atom used block's content and tail code.
    fn read_content(
        &mut self,
        off: i64,
        head_len: i64,
        dlen: usize,
        dst: &mut Vec<u8>,
        zbuf: &mut Vec<u8>,
    ) -> Result<()> {
        let atoms = n2atoms(dlen);
        let mut cc = [0u8];
        self.read(&mut cc, off + ATOM * atoms - 1)?;
        match cc[0] {
            CC_NONE => {
                dst.resize(dlen, 0);
                self.read(&mut dst[..], off + head_len)
            }
            CC_SNAPPY => {
                zbuf.resize(dlen, 0);
                self.read(&mut zbuf[..], off + head_len)?;
                decompress_into(zbuf, dst, off)
            }
            cc => Err(StoreError::corrupt_arg(CorruptKind::TailTag, off, i64::from(cc)).into()),
        }
    }

    /// Replaces the content of the block at `handle` with `b`.
    ///
    /// The handle stays valid; if the new content cannot fit in place, the
    /// block becomes a single-atom relocation pointing at a freshly
    /// allocated content block.
    pub fn realloc(&mut self, handle: i64, b: &[u8]) -> Result<()> {
        if handle <= 0 || handle > MAX_HANDLE {
            return Err(StoreError::InvalidArgument {
                what: "realloc: handle out of limits",
                value: handle,
            }
            .into());
        }
        let mut zbuf = std::mem::take(&mut self.zbuf);
        let r = self.realloc_with(handle, b, &mut zbuf);
        self.zbuf = zbuf;
        r
    }

    fn realloc_with(&mut self, handle: i64, b: &[u8], zbuf: &mut Vec<u8>) -> Result<()> {
        let head = self.make_used_block(b, zbuf)?;
        let need = head.rq_atoms;
        let off = h2off(handle);

        let mut b8 = [0u8; 8];
        self.read(&mut b8, off)?;
        let dlen = match b8[0] {
            TAG_USED_LONG => m2n(i64::from(b8[1]) << 8 | i64::from(b8[2])),
            TAG_USED_RELOCATED => {
                // The relocation target is recycled; the handle's own atom
                // is reshaped below as an empty block.
                self.free_handle(b2h(&b8[1..]), handle, false)?;
                0
            }
            TAG_FREE_SHORT | TAG_FREE_LONG => {
                return Err(StoreError::InvalidArgument {
                    what: "realloc: invalid handle",
                    value: handle,
                }
                .into());
            }
            tag => tag as usize,
        };

        let mut atoms = n2atoms(dlen);
        loop {
            if need < atoms {
                // Shrink in place, releasing the tail.
                let data: &[u8] = if head.in_zbuf { &zbuf[..] } else { b };
                self.write_used_block(handle, &head, data)?;
                let (fh, fa) = (handle + need, atoms - need);
                if h2off(fh) + ATOM * fa == self.bsize()? {
                    return self.truncate_bspace(h2off(fh));
                }
                return self.free_block(fh, fa);
            }

            if need == atoms {
                let data: &[u8] = if head.in_zbuf { &zbuf[..] } else { b };
                return self.write_used_block(handle, &head, data);
            }

            // need > atoms: extend in place, eat a free right neighbour,
            // or relocate.
            let sz = self.bsize()?;
            if off + atoms * ATOM == sz {
                // Tail block: grow in place.
                let data: &[u8] = if head.in_zbuf { &zbuf[..] } else { b };
                return self.write_used_block(handle, &head, data);
            }

            if off + atoms * ATOM < sz {
                let rh = handle + atoms;
                let (rtag, ratoms, rp, rn) = self.nfo(rh)?;
                if (rtag == TAG_FREE_SHORT || rtag == TAG_FREE_LONG) && need <= atoms + ratoms {
                    self.unlink(ratoms, rp, rn)?;
                    atoms += ratoms;
                    continue;
                }
            }

            // Relocate: shrink this block to one atom, allocate the
            // content elsewhere, and point the original atom at it.
            if atoms > 1 {
                self.realloc_with(handle, &[], &mut Vec::new())?;
            }
            let data: &[u8] = if head.in_zbuf { &zbuf[..] } else { b };
            let new_h = self.alloc_block(data, &head)?;

            let mut rb = [0u8; 16];
            rb[0] = TAG_USED_RELOCATED;
            h2b(&mut rb[1..8], new_h);
            return self.write(&rb, h2off(handle));
        }
    }

    /// Prepares the head bytes, content code, and atom count for `b`,
    /// compressing into `zbuf` when that saves at least one atom.
    fn make_used_block(&mut self, b: &[u8], zbuf: &mut Vec<u8>) -> Result<UsedHead> {
        if b.len() > MAX_RQ {
            return Err(StoreError::InvalidArgument {
                what: "content size out of limits",
                value: b.len() as i64,
            }
            .into());
        }

        let mut dlen = b.len();
        let mut rq_atoms = n2atoms(dlen);
        let mut cc = CC_NONE;
        let mut in_zbuf = false;

        if self.compress && b.len() > 14 {
            *zbuf = snap::raw::Encoder::new()
                .compress_vec(b)
                .map_err(|e| eyre::eyre!("snappy compression failed: {}", e))?;
            let z_atoms = n2atoms(zbuf.len());
            if z_atoms < rq_atoms {
                dlen = zbuf.len();
                rq_atoms = z_atoms;
                cc = CC_SNAPPY;
                in_zbuf = true;
            }
        }

        let mut head = [0u8; 3];
        let head_len;
        if dlen <= MAX_SHORT {
            head[0] = dlen as u8;
            head_len = 1;
        } else {
            let m = n2m(dlen);
            head[0] = TAG_USED_LONG;
            head[1] = (m >> 8) as u8;
            head[2] = m as u8;
            head_len = 3;
        }

        Ok(UsedHead {
            head,
            head_len,
            cc,
            dlen,
            rq_atoms,
            in_zbuf,
        })
    }

    fn write_used_block(&mut self, h: i64, head: &UsedHead, data: &[u8]) -> Result<()> {
        const PAD: [u8; 15] = [0u8; 15];
        self.write_parts(
            h2off(h),
            &[
                &head.head[..head.head_len],
                data,
                &PAD[..n2padding(head.dlen)],
                &[head.cc],
            ],
        )
    }

    /// Writes the on-disk image of a free block and stitches both list
    /// neighbours to it.
    fn make_free(&mut self, h: i64, atoms: i64, prev: i64, next: i64) -> Result<()> {
        let mut buf = [0u8; 22];
        if atoms == 1 {
            buf[0] = TAG_FREE_SHORT;
            buf[15] = TAG_FREE_SHORT;
            h2b(&mut buf[1..8], prev);
            h2b(&mut buf[8..15], next);
            self.write(&buf[..16], h2off(h))?;
        } else {
            buf[0] = TAG_FREE_LONG;
            h2b(&mut buf[1..8], atoms);
            h2b(&mut buf[8..15], prev);
            h2b(&mut buf[15..22], next);
            self.write(&buf[..22], h2off(h))?;

            let mut tail = [0u8; 8];
            h2b(&mut tail[..7], atoms);
            tail[7] = TAG_FREE_LONG;
            self.write(&tail, h2off(h + atoms) - 8)?;
        }

        if prev != 0 {
            self.set_next(prev, h)?;
        }
        if next != 0 {
            self.set_prev(next, h)?;
        }
        Ok(())
    }

    /// Tag and geometry of the block at `h`: `(tag, atoms, prev, next)`.
    /// For used blocks only the atom count is meaningful; for relocated
    /// blocks `next` is the target handle.
    fn nfo(&mut self, h: i64) -> Result<(u8, i64, i64, i64)> {
        let off = h2off(h);
        let fsize = self.bsize()?;
        let mut rq = 22i64;
        if off + rq >= fsize {
            rq = fsize - off;
            if rq < 15 {
                return Err(StoreError::UnexpectedEof { off, expected: 15 }.into());
            }
        }

        let mut buf = [0u8; 22];
        self.read(&mut buf[..rq as usize], off)?;

        let tag = buf[0];
        Ok(match tag {
            TAG_USED_LONG => {
                let dlen = m2n(i64::from(buf[1]) << 8 | i64::from(buf[2]));
                (tag, n2atoms(dlen), 0, 0)
            }
            TAG_FREE_LONG => {
                if rq < 22 {
                    return Err(StoreError::UnexpectedEof { off, expected: 22 }.into());
                }
                (tag, b2h(&buf[1..]), b2h(&buf[8..]), b2h(&buf[15..]))
            }
            TAG_USED_RELOCATED => (tag, 1, 0, b2h(&buf[1..])),
            TAG_FREE_SHORT => (tag, 1, b2h(&buf[1..]), b2h(&buf[8..])),
            short => (tag, n2atoms(short as usize), 0, 0),
        })
    }

    /// [`nfo`](Self::nfo) of the left neighbour, if it is a free block.
    fn left_nfo(&mut self, h: i64) -> Result<Option<(u8, i64, i64, i64)>> {
        if h <= 1 {
            return Ok(None);
        }

        let mut buf = [0u8; 8];
        self.read(&mut buf, h2off(h) - 8)?;
        match buf[7] {
            TAG_FREE_SHORT => self.nfo(h - 1).map(Some),
            TAG_FREE_LONG => self.nfo(h - b2h(&buf)).map(Some),
            _ => Ok(None),
        }
    }

    /// Rewrites the prev link of the free block at `h`.
    fn set_prev(&mut self, h: i64, prev: i64) -> Result<()> {
        let off = h2off(h);
        let mut tag = [0u8];
        self.read(&mut tag, off)?;
        let field_off = match tag[0] {
            TAG_FREE_SHORT => off + 1,
            TAG_FREE_LONG => off + 8,
            tag => {
                return Err(StoreError::corrupt_arg(
                    CorruptKind::ExpectedFreeTag,
                    off,
                    i64::from(tag),
                )
                .into());
            }
        };
        let mut b = [0u8; 7];
        h2b(&mut b, prev);
        self.write(&b, field_off)
    }

    /// Rewrites the next link of the free block at `h`.
    fn set_next(&mut self, h: i64, next: i64) -> Result<()> {
        let off = h2off(h);
        let mut tag = [0u8];
        self.read(&mut tag, off)?;
        let field_off = match tag[0] {
            TAG_FREE_SHORT => off + 8,
            TAG_FREE_LONG => off + 15,
            tag => {
                return Err(StoreError::corrupt_arg(
                    CorruptKind::ExpectedFreeTag,
                    off,
                    i64::from(tag),
                )
                .into());
            }
        };
        let mut b = [0u8; 7];
        h2b(&mut b, next);
        self.write(&b, field_off)
    }
}

fn decompress_into(src: &[u8], dst: &mut Vec<u8>, off: i64) -> Result<()> {
    match snap::raw::Decoder::new().decompress_vec(src) {
        Ok(out) => {
            *dst = out;
            Ok(())
        }
        Err(_) => Err(StoreError::corrupt(CorruptKind::Decompression, off).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filer::MemFiler;

    fn new_alloc() -> Allocator<MemFiler> {
        Allocator::new(MemFiler::new(), FltKind::PowersOf2).unwrap()
    }

    fn block_space(a: &mut Allocator<MemFiler>) -> Vec<u8> {
        let base = a.base;
        let size = a.f.size().unwrap() - base;
        let mut buf = vec![0u8; size as usize];
        a.f.read_at(&mut buf, base).unwrap();
        buf
    }

    #[test]
    fn atom_and_padding_math() {
        // (content length, atoms, padding)
        let cases: &[(usize, i64, usize)] = &[
            (0, 1, 14),
            (1, 1, 13),
            (14, 1, 0),
            (15, 2, 15),
            (251, 16, 0),
            (252, 16, 12),
            (65787, 4112, 9),
        ];
        for &(n, atoms, padding) in cases {
            assert_eq!(n2atoms(n), atoms, "atoms for {}", n);
            assert_eq!(n2padding(n), padding, "padding for {}", n);
        }
    }

    #[test]
    fn long_length_field_is_bijective() {
        for n in [252usize, 65535, 65536, 65787] {
            assert_eq!(m2n(n2m(n)), n, "round trip for {}", n);
        }
        assert_eq!(n2m(65536), 0);
        assert_eq!(m2n(0), 65536);
    }

    #[test]
    fn handle_offset_math() {
        assert_eq!(h2off(1), 0);
        assert_eq!(off2h(0), 1);
        assert_eq!(h2off(8), 112);
        assert_eq!(off2h(112), 8);
    }

    #[test]
    fn handle_bytes_round_trip() {
        let mut b = [0u8; 7];
        for h in [0i64, 1, 0xDEAD, MAX_HANDLE] {
            h2b(&mut b, h);
            assert_eq!(b2h(&b), h);
        }
        h2b(&mut b, 1);
        assert_eq!(b, [0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn empty_alloc_writes_a_zero_atom() {
        let mut a = new_alloc();
        let h = a.alloc(&[]).unwrap();
        assert_eq!(h, 1);
        assert_eq!(block_space(&mut a), vec![0u8; 16]);
        assert_eq!(a.get(h).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn one_byte_block_image_is_exact() {
        let mut a = new_alloc();
        let h = a.alloc(&[0x42]).unwrap();
        assert_eq!(h, 1);
        assert_eq!(
            block_space(&mut a),
            vec![0x01, 0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn round_trip_boundary_lengths() {
        let mut a = new_alloc();
        for &n in &[0usize, 1, 14, 15, 251, 252, MAX_RQ] {
            let content: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let h = a.alloc(&content).unwrap();
            assert_eq!(a.get(h).unwrap(), content, "round trip for {} bytes", n);
        }
    }

    #[test]
    fn oversized_content_is_rejected() {
        let mut a = new_alloc();
        let report = a.alloc(&vec![0u8; MAX_RQ + 1]).unwrap_err();
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn sequential_allocations_get_sequential_handles() {
        let mut a = new_alloc();
        assert_eq!(a.alloc(&[1]).unwrap(), 1);
        assert_eq!(a.alloc(&[2]).unwrap(), 2);
        assert_eq!(a.alloc(&vec![3u8; 100]).unwrap(), 3);
        // 100 bytes span 7 atoms; the next block starts after them.
        assert_eq!(a.alloc(&[4]).unwrap(), 10);
    }

    #[test]
    fn free_tail_block_truncates_the_file() {
        let mut a = new_alloc();
        let h1 = a.alloc(&[1]).unwrap();
        let h2 = a.alloc(&[2]).unwrap();

        a.free(h2).unwrap();
        assert_eq!(a.bsize().unwrap(), 16, "tail free SHOULD truncate");

        a.free(h1).unwrap();
        assert_eq!(a.bsize().unwrap(), 0);
    }

    #[test]
    fn freed_space_is_reused() {
        let mut a = new_alloc();
        let h1 = a.alloc(&[1]).unwrap();
        let _h2 = a.alloc(&[2]).unwrap();
        a.free(h1).unwrap();

        let h3 = a.alloc(&[3]).unwrap();
        assert_eq!(h3, h1, "the freed atom SHOULD be reused");
        assert_eq!(a.get(h3).unwrap(), vec![3]);
    }

    #[test]
    fn split_leaves_the_remainder_free() {
        let mut a = new_alloc();
        let h1 = a.alloc(&vec![9u8; 62]).unwrap(); // 4 atoms
        let _h2 = a.alloc(&[2]).unwrap();
        a.free(h1).unwrap();

        // 30 bytes need 2 atoms; the other 2 atoms stay free.
        let h3 = a.alloc(&vec![7u8; 30]).unwrap();
        assert_eq!(h3, h1);
        let h4 = a.alloc(&[8u8; 14]).unwrap();
        assert_eq!(h4, h1 + 2, "the split remainder SHOULD be reused next");
    }

    #[test]
    fn adjacent_free_blocks_coalesce() {
        let mut a = new_alloc();
        let h1 = a.alloc(&vec![1u8; 30]).unwrap(); // 2 atoms each
        let h2 = a.alloc(&vec![2u8; 30]).unwrap();
        let h3 = a.alloc(&vec![3u8; 30]).unwrap();
        let _guard = a.alloc(&[9]).unwrap();

        a.free(h1).unwrap();
        a.free(h3).unwrap();
        a.free(h2).unwrap(); // joins both neighbours

        // The coalesced 6-atom block must satisfy a 4-atom request.
        let h = a.alloc(&vec![5u8; 60]).unwrap();
        assert_eq!(h, h1);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut a = new_alloc();
        let h1 = a.alloc(&[1]).unwrap();
        let _h2 = a.alloc(&[2]).unwrap();
        a.free(h1).unwrap();

        let report = a.free(h1).unwrap_err();
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn get_of_a_free_block_is_structural_corruption() {
        let mut a = new_alloc();
        let h1 = a.alloc(&[1]).unwrap();
        let _h2 = a.alloc(&[2]).unwrap();
        a.free(h1).unwrap();

        let report = a.get(h1).unwrap_err();
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert_eq!(err.corrupt_kind(), Some(CorruptKind::ExpectedUsedTag));
    }

    #[test]
    fn realloc_in_place_same_size() {
        let mut a = new_alloc();
        let h = a.alloc(&[1, 2, 3]).unwrap();
        a.realloc(h, &[4, 5, 6]).unwrap();
        assert_eq!(a.get(h).unwrap(), vec![4, 5, 6]);
        assert_eq!(a.bsize().unwrap(), 16);
    }

    #[test]
    fn realloc_shrink_releases_the_tail() {
        let mut a = new_alloc();
        let h = a.alloc(&vec![1u8; 100]).unwrap(); // 7 atoms
        let guard = a.alloc(&[9]).unwrap();

        a.realloc(h, &[2u8; 10]).unwrap(); // 1 atom
        assert_eq!(a.get(h).unwrap(), vec![2u8; 10]);
        assert_eq!(a.get(guard).unwrap(), vec![9]);

        // The six released atoms are reusable.
        let h2 = a.alloc(&vec![3u8; 60]).unwrap(); // 4 atoms
        assert_eq!(h2, h + 1);
    }

    #[test]
    fn realloc_shrink_of_tail_block_truncates() {
        let mut a = new_alloc();
        let h = a.alloc(&vec![1u8; 100]).unwrap();
        a.realloc(h, &[2]).unwrap();
        assert_eq!(a.bsize().unwrap(), 16);
        assert_eq!(a.get(h).unwrap(), vec![2]);
    }

    #[test]
    fn realloc_grow_at_tail_extends_in_place() {
        let mut a = new_alloc();
        let h = a.alloc(&[1]).unwrap();
        a.realloc(h, &vec![2u8; 1000]).unwrap();
        assert_eq!(h, 1);
        assert_eq!(a.get(h).unwrap(), vec![2u8; 1000]);
        assert_eq!(a.bsize().unwrap(), n2atoms(1000) * 16);
    }

    #[test]
    fn realloc_grow_eats_a_free_right_neighbour() {
        let mut a = new_alloc();
        let h1 = a.alloc(&[1]).unwrap();
        let h2 = a.alloc(&vec![2u8; 30]).unwrap(); // 2 atoms
        let guard = a.alloc(&[9]).unwrap();
        a.free(h2).unwrap();

        a.realloc(h1, &vec![3u8; 40]).unwrap(); // needs 3 atoms
        assert_eq!(a.get(h1).unwrap(), vec![3u8; 40]);
        assert_eq!(a.get(guard).unwrap(), vec![9]);

        let mut tag = [0u8];
        a.read(&mut tag, h2off(h1)).unwrap();
        assert_ne!(tag[0], TAG_USED_RELOCATED, "growth SHOULD happen in place");
    }

    #[test]
    fn realloc_grow_relocates_when_walled_in() {
        let mut a = new_alloc();
        let h = a.alloc(&vec![1u8; 5]).unwrap();
        let guard = a.alloc(&[9]).unwrap();

        a.realloc(h, &vec![2u8; 5000]).unwrap();

        let mut first = [0u8; 16];
        a.read(&mut first, h2off(h)).unwrap();
        assert_eq!(first[0], TAG_USED_RELOCATED);
        let target = b2h(&first[1..]);
        assert!(target > guard, "content SHOULD live in a fresh block");

        assert_eq!(a.get(h).unwrap(), vec![2u8; 5000]);
        assert_eq!(a.get(guard).unwrap(), vec![9]);
    }

    #[test]
    fn realloc_of_a_relocated_handle_frees_the_old_target() {
        let mut a = new_alloc();
        let h = a.alloc(&vec![1u8; 5]).unwrap();
        let guard = a.alloc(&[9]).unwrap();
        a.realloc(h, &vec![2u8; 5000]).unwrap(); // relocates

        a.realloc(h, &[3]).unwrap(); // shrinks back into the home atom
        assert_eq!(a.get(h).unwrap(), vec![3]);
        assert_eq!(a.get(guard).unwrap(), vec![9]);

        let mut first = [0u8; 16];
        a.read(&mut first, h2off(h)).unwrap();
        assert_ne!(first[0], TAG_USED_RELOCATED, "small content SHOULD come home");
    }

    #[test]
    fn realloc_idempotence() {
        let mut a = new_alloc();
        for &n in &[0usize, 5, 100, 300, 5000] {
            let content: Vec<u8> = (0..n).map(|i| (i % 13) as u8).collect();
            let h = a.alloc(&content).unwrap();
            let before = a.get(h).unwrap();
            a.realloc(h, &before).unwrap();
            assert_eq!(a.get(h).unwrap(), before, "realloc(get) for {} bytes", n);
        }
    }

    #[test]
    fn compression_kicks_in_only_when_it_saves_atoms() {
        let mut a = new_alloc();
        a.set_compression(true);

        let b = vec![0xABu8; 256]; // 17 atoms raw
        let h = a.alloc(&b).unwrap();
        assert!(
            a.bsize().unwrap() < n2atoms(256) * 16,
            "repetitive content SHOULD occupy fewer atoms than raw"
        );

        let space = block_space(&mut a);
        assert_eq!(
            space[space.len() - 1],
            CC_SNAPPY,
            "tail SHOULD carry the compressed code"
        );
        assert_eq!(a.get(h).unwrap(), b);
    }

    #[test]
    fn short_content_is_never_compressed() {
        let mut a = new_alloc();
        a.set_compression(true);

        let h = a.alloc(&[0u8; 14]).unwrap();
        assert_eq!(a.bsize().unwrap(), 16);
        let space = block_space(&mut a);
        assert_eq!(space[15], CC_NONE, "14 bytes or less SHOULD stay raw");
        assert_eq!(a.get(h).unwrap(), vec![0u8; 14]);
    }

    #[test]
    fn incompressible_content_is_stored_raw() {
        let mut a = new_alloc();
        a.set_compression(true);

        let b: Vec<u8> = (0..17).map(|i| (i * 37 % 251) as u8).collect();
        let h = a.alloc(&b).unwrap();
        assert_eq!(a.bsize().unwrap(), 32, "incompressible content keeps two atoms");
        let space = block_space(&mut a);
        assert_eq!(space[31], CC_NONE);
        assert_eq!(a.get(h).unwrap(), b);
    }

    #[test]
    fn compression_off_stores_two_atoms_for_the_same_content() {
        let mut a = new_alloc();
        let b = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x99, 0x01, 0x02, 0x03, 0x04,
            0x05, 0x06, 0x07, 0x08,
        ];
        let h = a.alloc(&b).unwrap();
        assert_eq!(a.bsize().unwrap(), 32);
        assert_eq!(a.get(h).unwrap(), b.to_vec());
    }

    #[test]
    fn compressed_blocks_round_trip_across_realloc() {
        let mut a = new_alloc();
        a.set_compression(true);

        let big = vec![0xABu8; 10000];
        let h = a.alloc(&big).unwrap();
        assert!(a.bsize().unwrap() < 10000 as i64, "repetitive content SHOULD shrink");
        assert_eq!(a.get(h).unwrap(), big);

        let other = vec![0xCDu8; 20000];
        a.realloc(h, &other).unwrap();
        assert_eq!(a.get(h).unwrap(), other);
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let mut a = new_alloc();
        for h in [0i64, -1, MAX_HANDLE + 1] {
            assert!(a.get(h).is_err());
            assert!(a.free(h).is_err());
            assert!(a.realloc(h, &[]).is_err());
        }
    }
}
