//! # Scalar Tuple Codec
//!
//! Encodes heterogeneous tuples of scalars - signed integers, byte strings,
//! and UTF-8 strings - into a self-delimiting byte form and back. The
//! write-ahead log uses it for packet payloads: a packet is just an encoded
//! tuple like `[kind, bytes, offset]`.
//!
//! ## Wire Form
//!
//! Each value is a 1-byte type tag followed by its body:
//!
//! | Tag | Type | Body |
//! |-----|-------|------------------------------------|
//! | 0 | `Int` | zig-zag LEB128 varint |
//! | 1 | `Bytes` | LEB128 length, then raw bytes |
//! | 2 | `Str` | LEB128 length, then UTF-8 bytes |
//!
//! The encoding is bijective: decoding an encoded tuple yields the original
//! values, and re-encoding yields the original bytes. Unknown tags,
//! truncated bodies, and invalid UTF-8 are decode errors.

use eyre::{bail, ensure, Result};

use super::varint::{decode_u64, encode_u64, zigzag_decode, zigzag_encode};

const TAG_INT: u8 = 0;
const TAG_BYTES: u8 = 1;
const TAG_STR: u8 = 2;

/// One value of a WAL payload tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

impl Scalar {
    /// The integer value, if this is an [`Scalar::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The byte content, if this is a [`Scalar::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Scalar::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Encodes `items` into a fresh buffer.
pub fn encode_scalars(items: &[Scalar]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        match item {
            Scalar::Int(v) => {
                out.push(TAG_INT);
                encode_u64(zigzag_encode(*v), &mut out);
            }
            Scalar::Bytes(b) => {
                out.push(TAG_BYTES);
                encode_u64(b.len() as u64, &mut out);
                out.extend_from_slice(b);
            }
            Scalar::Str(s) => {
                out.push(TAG_STR);
                encode_u64(s.len() as u64, &mut out);
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
    out
}

/// Decodes a full buffer of encoded scalars.
///
/// The buffer must contain exactly a sequence of encoded values; trailing
/// bytes are an error.
pub fn decode_scalars(mut buf: &[u8]) -> Result<Vec<Scalar>> {
    let mut items = Vec::new();
    while !buf.is_empty() {
        let tag = buf[0];
        buf = &buf[1..];
        match tag {
            TAG_INT => {
                let (raw, n) = decode_u64(buf)?;
                items.push(Scalar::Int(zigzag_decode(raw)));
                buf = &buf[n..];
            }
            TAG_BYTES | TAG_STR => {
                let (len, n) = decode_u64(buf)?;
                buf = &buf[n..];
                let len = usize::try_from(len)
                    .map_err(|_| eyre::eyre!("scalar length {} does not fit usize", len))?;
                ensure!(
                    buf.len() >= len,
                    "truncated scalar body: need {} bytes, have {}",
                    len,
                    buf.len()
                );
                let body = &buf[..len];
                buf = &buf[len..];
                if tag == TAG_BYTES {
                    items.push(Scalar::Bytes(body.to_vec()));
                } else {
                    let s = std::str::from_utf8(body)
                        .map_err(|e| eyre::eyre!("invalid UTF-8 in string scalar: {}", e))?;
                    items.push(Scalar::Str(s.to_string()));
                }
            }
            other => bail!("unknown scalar tag {}", other),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(items: &[Scalar]) {
        let encoded = encode_scalars(items);
        let decoded = decode_scalars(&encoded).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(encode_scalars(&decoded), encoded, "re-encoding SHOULD be stable");
    }

    #[test]
    fn empty_tuple() {
        round_trip(&[]);
    }

    #[test]
    fn mixed_tuple() {
        round_trip(&[
            Scalar::Int(1),
            Scalar::Bytes(vec![0x42, 0x00, 0xFF]),
            Scalar::Int(314),
        ]);
    }

    #[test]
    fn integer_extremes() {
        round_trip(&[
            Scalar::Int(0),
            Scalar::Int(-1),
            Scalar::Int(i64::MAX),
            Scalar::Int(i64::MIN),
        ]);
    }

    #[test]
    fn empty_bytes_and_strings() {
        round_trip(&[Scalar::Bytes(Vec::new()), Scalar::Str(String::new())]);
    }

    #[test]
    fn strings_keep_utf8() {
        round_trip(&[Scalar::Str("päckchen".into()), Scalar::Str("wal".into())]);
    }

    #[test]
    fn unknown_tag_fails() {
        assert!(decode_scalars(&[9, 0]).is_err());
    }

    #[test]
    fn truncated_body_fails() {
        let mut encoded = encode_scalars(&[Scalar::Bytes(vec![1, 2, 3, 4])]);
        encoded.truncate(encoded.len() - 2);
        assert!(decode_scalars(&encoded).is_err());
    }

    #[test]
    fn invalid_utf8_fails() {
        // Tag 2, length 2, invalid UTF-8 body.
        assert!(decode_scalars(&[TAG_STR, 2, 0xFF, 0xFE]).is_err());
    }

    #[test]
    fn accessors() {
        assert_eq!(Scalar::Int(7).as_int(), Some(7));
        assert_eq!(Scalar::Int(7).as_bytes(), None);
        let b = Scalar::Bytes(vec![1]);
        assert_eq!(b.as_bytes(), Some(&[1u8][..]));
        assert_eq!(b.as_int(), None);
    }
}
