//! # Store Wiring
//!
//! [`Store`] assembles the canonical stack over one database file:
//!
//! ```text
//! Allocator( AcidFiler( wal, InnerFiler( OsFiler, 16 ) ) )
//! ```
//!
//! A 16-byte [header](crate::format) fronts the file; the inner window
//! hides it from the transactional layers; the WAL lives in a side-car
//! file (`<path>.wal` by default). [`StoreBuilder`] configures the
//! free-list shape and compression before opening.
//!
//! `Store` wraps every single operation in its own transaction (begin,
//! operate, commit - or roll back on error), which is the right default
//! for callers without multi-operation atomicity needs. For batched
//! atomic work, use [`begin_update`](Store::begin_update) /
//! [`end_update`](Store::end_update) explicitly; the per-operation
//! wrapping nests harmlessly inside.
//!
//! This module wires layers together and nothing more: no key encoding,
//! no indexes, no background workers.

use std::path::{Path, PathBuf};

use eyre::Result;

use crate::alloc::{AllocStats, Allocator, FltKind};
use crate::error::StoreError;
use crate::filer::{Filer, InnerFiler, MemFiler, OsFiler};
use crate::format;
use crate::txn::AcidFiler;

type Stack = AcidFiler<InnerFiler<OsFiler>>;

/// Configuration for opening or creating a [`Store`].
pub struct StoreBuilder {
    path: PathBuf,
    wal_path: Option<PathBuf>,
    flt_kind: FltKind,
    compress: bool,
}

impl StoreBuilder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            wal_path: None,
            flt_kind: FltKind::default(),
            compress: false,
        }
    }

    /// Overrides the WAL location; defaults to `<path>.wal`.
    pub fn wal_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.wal_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Free-list table shape for a freshly created store. Opening an
    /// existing store must use the shape it was created with.
    pub fn flt_kind(mut self, kind: FltKind) -> Self {
        self.flt_kind = kind;
        self
    }

    /// Enables Snappy compression for stored content.
    pub fn compress(mut self, on: bool) -> Self {
        self.compress = on;
        self
    }

    pub fn open(self) -> Result<Store> {
        let exists = self
            .path
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        let mut os = if exists {
            OsFiler::open(&self.path)?
        } else {
            OsFiler::create(&self.path)?
        };

        // The header sits outside the transactional window and is written
        // directly, once, at creation.
        if exists {
            format::check_header(&mut os)?;
        } else {
            format::write_header(&mut os)?;
            os.sync()?;
        }

        let inner = InnerFiler::new(os, format::HEADER_SIZE as i64);
        let wal_path = self
            .wal_path
            .unwrap_or_else(|| self.path.with_extension("wal"));
        let mut acid = AcidFiler::new(inner, wal_path)?;

        // A fresh store writes its zeroed free-list table; that mutation
        // must commit through the stack like any other.
        acid.begin_update()?;
        let mut alloc = Allocator::new(acid, self.flt_kind)?;
        alloc.filer_mut().end_update()?;
        alloc.set_compression(self.compress);

        Ok(Store { alloc })
    }
}

/// An open database file: allocator, transactions, and audit in one.
pub struct Store {
    alloc: Allocator<Stack>,
}

impl Store {
    pub fn builder<P: AsRef<Path>>(path: P) -> StoreBuilder {
        StoreBuilder::new(path)
    }

    /// Opens `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        StoreBuilder::new(path).open()
    }

    /// Opens an explicit transaction; pair with [`end_update`](Self::end_update)
    /// or [`rollback`](Self::rollback).
    pub fn begin_update(&mut self) -> Result<()> {
        self.alloc.filer_mut().begin_update()
    }

    pub fn end_update(&mut self) -> Result<()> {
        self.alloc.filer_mut().end_update()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.alloc.filer_mut().rollback()?;
        // The cached free-list heads may now be ahead of the file.
        self.alloc.reload_flt()
    }

    fn in_txn<T>(&mut self, op: impl FnOnce(&mut Allocator<Stack>) -> Result<T>) -> Result<T> {
        self.alloc.filer_mut().begin_update()?;
        match op(&mut self.alloc) {
            Ok(v) => {
                self.alloc.filer_mut().end_update()?;
                Ok(v)
            }
            Err(e) => {
                let _ = self.alloc.filer_mut().rollback();
                let _ = self.alloc.reload_flt();
                Err(e)
            }
        }
    }

    /// Stores `b` and returns its handle.
    pub fn alloc(&mut self, b: &[u8]) -> Result<i64> {
        self.in_txn(|a| a.alloc(b))
    }

    /// Releases the block at `handle`.
    pub fn free(&mut self, handle: i64) -> Result<()> {
        self.in_txn(|a| a.free(handle))
    }

    /// Replaces the content of the block at `handle`.
    pub fn realloc(&mut self, handle: i64, b: &[u8]) -> Result<()> {
        self.in_txn(|a| a.realloc(handle, b))
    }

    /// Reads the content of the block at `handle`.
    pub fn get(&mut self, handle: i64) -> Result<Vec<u8>> {
        self.alloc.get(handle)
    }

    /// Like [`get`](Self::get), reusing `dst`'s capacity.
    pub fn get_into(&mut self, handle: i64, dst: &mut Vec<u8>) -> Result<()> {
        self.alloc.get_into(handle, dst)
    }

    /// Runs the full structural audit with an in-memory bitmap.
    pub fn verify(
        &mut self,
        log: &mut dyn FnMut(&StoreError) -> bool,
        stats: Option<&mut AllocStats>,
    ) -> Result<()> {
        let mut bitmap = MemFiler::new();
        self.alloc.verify(&mut bitmap, log, stats)
    }

    /// High-water mark of the WAL length.
    pub fn peak_wal_size(&self) -> i64 {
        self.alloc.filer().peak_wal_size()
    }

    /// Direct access to the allocator, for callers that manage their own
    /// transaction boundaries.
    pub fn allocator_mut(&mut self) -> &mut Allocator<Stack> {
        &mut self.alloc
    }

    /// Closes the store. Fails if a transaction is still open.
    pub fn close(mut self) -> Result<()> {
        self.alloc.filer_mut().close()
    }
}
