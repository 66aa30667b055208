//! # Transaction Layers
//!
//! Two wrappers add transactional behavior to any [`crate::filer::Filer`]:
//!
//! - [`RollbackFiler`]: nested structural transactions held in
//!   copy-on-write dirty-page overlays; the outermost commit drains the
//!   overlay through a pluggable [`CommitSink`].
//! - [`AcidFiler`]: a `RollbackFiler` whose sink is a write-ahead log,
//!   upgrading structural transactions to atomic durable commits with
//!   crash recovery on open.
//!
//! The [`wal`] module defines the packet format the log is made of.

mod acid;
mod overlay;
mod rollback;
pub mod wal;

pub use acid::AcidFiler;
pub use rollback::{CommitSink, DirectSink, RollbackFiler};
