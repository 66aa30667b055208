//! # Wire Encodings
//!
//! Small, allocation-light codecs used by the write-ahead log:
//!
//! - [`varint`]: LEB128 unsigned varints plus the zig-zag transform for
//!   signed values.
//! - [`scalar`]: a bijective codec for heterogeneous tuples of integers,
//!   byte strings, and UTF-8 strings - the payload format of WAL packets.
//!
//! Both codecs are pure functions over byte slices; recovery decodes
//! exactly the bytes that commit encoded.

pub mod scalar;
pub mod varint;

pub use scalar::{decode_scalars, encode_scalars, Scalar};
