//! # atomdb - Embedded Storage Core
//!
//! atomdb is the storage engine substrate of an embedded, single-process
//! database: it turns one append-extendible file into a durable,
//! transactional, block-allocated store. Higher layers (B-trees, catalogs,
//! query engines) allocate their nodes through it and never touch the file
//! directly.
//!
//! ## Architecture
//!
//! The crate is a stack of layers, composed bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Store (stack wiring)             │
//! ├─────────────────────────────────────────┤
//! │   Allocator + FLT + Verifier            │  atom-granular blocks
//! ├─────────────────────────────────────────┤
//! │   AcidFiler (WAL, two-phase commit)     │  durability
//! ├─────────────────────────────────────────┤
//! │   RollbackFiler (dirty-page overlays)   │  structural transactions
//! ├─────────────────────────────────────────┤
//! │   InnerFiler / OsFiler / MemFiler       │  byte-addressed backing
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every layer speaks the same [`Filer`] contract: positioned reads and
//! writes, truncation, hole punching, and nested transaction hooks. The
//! canonical on-disk composition is
//! `Allocator(AcidFiler(wal, InnerFiler(OsFiler, 16)))`: a 16-byte header,
//! then the free-list table, then allocator blocks, with a side-car WAL
//! file that is empty except while a commit is in flight.
//!
//! ## Quick Start
//!
//! ```ignore
//! use atomdb::Store;
//!
//! let mut store = Store::builder("./data.adb").open()?;
//! let h = store.alloc(b"hello")?;
//! assert_eq!(store.get(h)?, b"hello");
//! store.close()?;
//! ```
//!
//! ## Concurrency
//!
//! The core is single-threaded cooperative: every mutating entry point takes
//! `&mut self` and assumes exclusive access. Callers that share a store
//! across threads must serialize access externally.
//!
//! ## Module Overview
//!
//! - [`filer`]: the `Filer` trait and its backing implementations
//! - [`txn`]: structural transactions and the write-ahead log
//! - [`alloc`]: the block allocator, free-list table, and verifier
//! - [`encoding`]: varint and scalar tuple codecs used by the WAL
//! - [`format`]: the physical file header
//! - [`store`]: builder that wires the canonical stack

pub mod alloc;
pub mod encoding;
pub mod error;
pub mod filer;
pub mod format;
pub mod store;
pub mod txn;

pub use alloc::{AllocStats, Allocator, FltKind};
pub use error::{CorruptKind, StoreError};
pub use filer::{Filer, InnerFiler, MemFiler, OsFiler};
pub use store::{Store, StoreBuilder};
pub use txn::{AcidFiler, RollbackFiler};
