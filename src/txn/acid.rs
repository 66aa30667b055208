//! # ACID Filer
//!
//! [`AcidFiler`] is the durability layer: a [`RollbackFiler`] whose commit
//! sink is a write-ahead log, giving atomic, durable, crash-recoverable
//! commits over any backing [`Filer`].
//!
//! ## Two-Phase Commit
//!
//! During the outermost `end_update`, every flushed dirty run is recorded
//! twice: appended to the WAL as a write-data packet and inserted into an
//! in-memory map ordered by offset. The checkpoint then runs:
//!
//! 1. **Phase 1 (durable intent)**: append the checkpoint packet carrying
//!    the committed size, flush the WAL buffer, fsync the WAL. From this
//!    instant the transaction is committed; a crash is recoverable.
//! 2. **Phase 2 (apply)**: replay the map into the backing filer in
//!    ascending offset order, truncate it to the committed size, sync it,
//!    then truncate the WAL to zero and sync it. The log is empty again;
//!    the next epoch starts with the next transaction's first flushed run.
//!
//! ## Recovery
//!
//! Opening with a non-empty WAL means a crash interrupted a commit. If the
//! log carries a complete header-writes-checkpoint sequence, phase 2 is
//! re-run from the log; replaying an already-applied log is idempotent
//! because the packets are absolute-offset writes followed by a truncate.
//! A log that ends mid-packet without a checkpoint is the remnant of an
//! unfinished phase 1 and is discarded - the transaction never committed.
//! Anything else (misaligned length, unknown packet kinds, bytes after the
//! checkpoint) is reported as an invalid WAL naming the log's path.
//!
//! ## Peak WAL Size
//!
//! After every successful WAL fsync the filer updates a monotonically
//! non-decreasing high-water mark, observable via
//! [`AcidFiler::peak_wal_size`]; it tells an operator how big the log gets
//! under their transaction sizes.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use log::{debug, info, warn};

use crate::error::StoreError;
use crate::filer::Filer;
use crate::txn::rollback::{CommitSink, RollbackFiler};
use crate::txn::wal::{
    checkpoint_packet, header_packet, write_data_packet, NextPacket, PacketReader, WAL_ALIGN,
    WAL_TYPE_ACID, WPT_CHECKPOINT, WPT_HEADER, WPT_WRITE_DATA,
};

/// WAL-backed commit sink: records runs, then two-phase commits them.
#[derive(Debug)]
pub struct WalSink {
    wal: BufWriter<File>,
    path: PathBuf,
    data: BTreeMap<i64, Vec<u8>>,
    epoch_open: bool,
    wal_len: i64,
    peak_wal_size: i64,
}

impl WalSink {
    fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.wal
            .write_all(packet)
            .wrap_err_with(|| format!("failed to append to WAL '{}'", self.path.display()))?;
        self.wal_len += packet.len() as i64;
        Ok(())
    }

    fn begin_epoch(&mut self) -> Result<()> {
        self.data.clear();
        let header = header_packet();
        self.write_packet(&header)?;
        self.epoch_open = true;
        Ok(())
    }
}

impl<F: Filer> CommitSink<F> for WalSink {
    fn write_at(&mut self, _f: &mut F, b: &[u8], off: i64) -> Result<()> {
        if !self.epoch_open {
            self.begin_epoch()?;
        }
        let packet = write_data_packet(b, off);
        self.write_packet(&packet)?;
        self.data.insert(off, b.to_vec());
        Ok(())
    }

    fn checkpoint(&mut self, f: &mut F, size: i64) -> Result<()> {
        // A transaction of pure truncates still commits through the log.
        if !self.epoch_open {
            self.begin_epoch()?;
        }

        // Phase 1: durable intent.
        let packet = checkpoint_packet(size);
        self.write_packet(&packet)?;
        self.wal
            .flush()
            .wrap_err_with(|| format!("failed to flush WAL '{}'", self.path.display()))?;
        self.wal
            .get_ref()
            .sync_all()
            .wrap_err_with(|| format!("failed to sync WAL '{}'", self.path.display()))?;
        self.peak_wal_size = self.peak_wal_size.max(self.wal_len);
        debug!(
            "WAL '{}': committed {} runs, {} bytes logged",
            self.path.display(),
            self.data.len(),
            self.wal_len
        );

        // Phase 2: apply.
        for (&off, bytes) in &self.data {
            let n = f.write_at(bytes, off)?;
            if n != bytes.len() {
                return Err(StoreError::ShortWrite {
                    off,
                    expected: bytes.len(),
                    written: n,
                }
                .into());
            }
        }
        f.truncate(size)?;
        f.sync()?;

        let file = self.wal.get_mut();
        file.set_len(0)
            .wrap_err_with(|| format!("failed to truncate WAL '{}'", self.path.display()))?;
        file.seek(SeekFrom::Start(0))
            .wrap_err_with(|| format!("failed to rewind WAL '{}'", self.path.display()))?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync WAL '{}'", self.path.display()))?;
        self.wal_len = 0;

        self.data.clear();
        self.epoch_open = false;
        Ok(())
    }
}

/// A [`Filer`] with WAL-backed atomic durable commits and crash recovery.
pub struct AcidFiler<F: Filer> {
    inner: RollbackFiler<F, WalSink>,
}

impl<F: Filer + std::fmt::Debug> std::fmt::Debug for AcidFiler<F> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("AcidFiler").field("inner", &self.inner).finish()
    }
}

impl<F: Filer> AcidFiler<F> {
    /// Wraps `db`, using (and if necessary creating) the WAL at `wal_path`.
    ///
    /// A non-empty WAL is recovered before the filer is usable: committed
    /// transactions are re-applied to `db`, unfinished ones are discarded,
    /// and the WAL is truncated to zero either way.
    pub fn new<P: AsRef<Path>>(mut db: F, wal_path: P) -> Result<Self> {
        let path = wal_path.as_ref().to_path_buf();
        let mut wal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL '{}'", path.display()))?;

        let len = wal
            .metadata()
            .wrap_err_with(|| format!("failed to stat WAL '{}'", path.display()))?
            .len() as i64;
        if len != 0 {
            recover(&mut db, &mut wal, &path, len)?;
        }

        Ok(Self {
            inner: RollbackFiler::with_sink(
                db,
                WalSink {
                    wal: BufWriter::new(wal),
                    path,
                    data: BTreeMap::new(),
                    epoch_open: false,
                    wal_len: 0,
                    peak_wal_size: 0,
                },
            ),
        })
    }

    /// High-water mark of the WAL length, in bytes. Never decreases within
    /// the lifetime of this filer.
    pub fn peak_wal_size(&self) -> i64 {
        self.inner.sink().peak_wal_size
    }

    /// Path of the write-ahead log file.
    pub fn wal_path(&self) -> &Path {
        &self.inner.sink().path
    }

    /// Current transaction nesting depth.
    pub fn nesting(&self) -> usize {
        self.inner.nesting()
    }

    /// The wrapped backing filer.
    pub fn db(&self) -> &F {
        self.inner.filer()
    }

    /// The wrapped backing filer, mutably. Writing through it bypasses the
    /// transaction machinery; intended for inspection and tests.
    pub fn db_mut(&mut self) -> &mut F {
        self.inner.filer_mut()
    }
}

fn invalid_wal(path: &Path, reason: impl Into<String>) -> eyre::Report {
    StoreError::InvalidWal {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

/// Replays or discards a non-empty WAL against `db`.
fn recover<F: Filer>(db: &mut F, wal: &mut File, path: &Path, len: i64) -> Result<()> {
    if len % WAL_ALIGN as i64 != 0 {
        return Err(invalid_wal(path, format!("length {} not a multiple of 16", len)));
    }

    wal.seek(SeekFrom::Start(0))
        .wrap_err_with(|| format!("failed to rewind WAL '{}'", path.display()))?;
    let mut bytes = Vec::with_capacity(len as usize);
    wal.read_to_end(&mut bytes)
        .wrap_err_with(|| format!("failed to read WAL '{}'", path.display()))?;

    let mut reader = PacketReader::new(&bytes);

    // Epoch header first.
    match reader
        .next()
        .map_err(|e| invalid_wal(path, format!("bad packet: {}", e)))?
    {
        NextPacket::Packet(items) => {
            let ok = items.len() == 3
                && items[0].as_int() == Some(WPT_HEADER)
                && items[1].as_int() == Some(WAL_TYPE_ACID);
            if !ok {
                return Err(invalid_wal(path, "bad or missing header packet"));
            }
        }
        NextPacket::End | NextPacket::TruncatedTail => {
            warn!("WAL '{}': discarding torn header", path.display());
            return discard(wal, path);
        }
    }

    let mut data: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
    loop {
        match reader
            .next()
            .map_err(|e| invalid_wal(path, format!("bad packet: {}", e)))?
        {
            NextPacket::End | NextPacket::TruncatedTail => {
                // Phase 1 never finished; the transaction did not commit.
                warn!(
                    "WAL '{}': no checkpoint, discarding {} uncommitted writes",
                    path.display(),
                    data.len()
                );
                return discard(wal, path);
            }
            NextPacket::Packet(items) => {
                let kind = items
                    .first()
                    .and_then(|s| s.as_int())
                    .ok_or_else(|| invalid_wal(path, "packet missing kind"))?;
                match kind {
                    WPT_WRITE_DATA => {
                        let (b, off) = match (items.get(1), items.get(2)) {
                            (Some(b), Some(off)) => match (b.as_bytes(), off.as_int()) {
                                (Some(b), Some(off)) if off >= 0 => (b.to_vec(), off),
                                _ => return Err(invalid_wal(path, "malformed write packet")),
                            },
                            _ => return Err(invalid_wal(path, "malformed write packet")),
                        };
                        data.insert(off, b);
                    }
                    WPT_CHECKPOINT => {
                        let size = items
                            .get(1)
                            .and_then(|s| s.as_int())
                            .filter(|&s| s >= 0)
                            .ok_or_else(|| invalid_wal(path, "malformed checkpoint packet"))?;
                        if reader.remaining() != 0 {
                            return Err(invalid_wal(path, "data after checkpoint packet"));
                        }

                        info!(
                            "WAL '{}': replaying {} writes, committed size {}",
                            path.display(),
                            data.len(),
                            size
                        );
                        for (&off, b) in &data {
                            let n = db.write_at(b, off)?;
                            if n != b.len() {
                                return Err(StoreError::ShortWrite {
                                    off,
                                    expected: b.len(),
                                    written: n,
                                }
                                .into());
                            }
                        }
                        db.truncate(size)?;
                        db.sync()?;
                        return discard(wal, path);
                    }
                    other => {
                        return Err(invalid_wal(path, format!("unknown packet kind {}", other)))
                    }
                }
            }
        }
    }
}

fn discard(wal: &mut File, path: &Path) -> Result<()> {
    wal.set_len(0)
        .wrap_err_with(|| format!("failed to truncate WAL '{}'", path.display()))?;
    wal.seek(SeekFrom::Start(0))
        .wrap_err_with(|| format!("failed to rewind WAL '{}'", path.display()))?;
    wal.sync_all()
        .wrap_err_with(|| format!("failed to sync WAL '{}'", path.display()))
}

impl<F: Filer> Filer for AcidFiler<F> {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn size(&mut self) -> Result<i64> {
        self.inner.size()
    }

    fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize> {
        self.inner.read_at(buf, off)
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize> {
        self.inner.write_at(buf, off)
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        self.inner.truncate(size)
    }

    fn punch_hole(&mut self, off: i64, size: i64) -> Result<()> {
        self.inner.punch_hole(off, size)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn begin_update(&mut self) -> Result<()> {
        self.inner.begin_update()
    }

    fn end_update(&mut self) -> Result<()> {
        self.inner.end_update()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
