//! # WAL Packet Format
//!
//! The write-ahead log is a sequence of 16-byte-aligned packets. Each
//! packet is a 4-byte big-endian payload length `L`, `L` payload bytes,
//! then `(16 - ((4 + L) mod 16)) mod 16` zero bytes of padding, so the log
//! as a whole is always a multiple of 16 bytes.
//!
//! The payload is a [scalar tuple](crate::encoding::scalar):
//!
//! | Packet | Tuple | When |
//! |---|---|---|
//! | header | `[0, wal_type, ""]` | once, at the start of an epoch |
//! | write data | `[1, bytes, offset]` | one per flushed dirty run |
//! | checkpoint | `[2, size]` | terminal; fsynced before phase 2 |
//!
//! A log that stops mid-packet with no checkpoint is a crash remnant of an
//! unfinished commit and is discarded. A structurally complete packet with
//! bad content is corruption and is reported as such. Recovery decodes
//! exactly what commit encoded; there is no checksum - the terminal
//! checkpoint packet is the commit marker.

use eyre::Result;

use crate::encoding::scalar::{decode_scalars, encode_scalars, Scalar};

/// Packet kind tags.
pub const WPT_HEADER: i64 = 0;
pub const WPT_WRITE_DATA: i64 = 1;
pub const WPT_CHECKPOINT: i64 = 2;

/// The only defined WAL flavour.
pub const WAL_TYPE_ACID: i64 = 0;

/// Whole-log alignment.
pub const WAL_ALIGN: usize = 16;

/// Encodes one packet: length prefix, payload, zero padding.
pub fn encode_packet(items: &[Scalar]) -> Vec<u8> {
    let payload = encode_scalars(items);
    let raw = 4 + payload.len();
    let padded = (raw + WAL_ALIGN - 1) & !(WAL_ALIGN - 1);

    let mut out = Vec::with_capacity(padded);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out.resize(padded, 0);
    out
}

/// Result of pulling one packet off a byte stream.
#[derive(Debug, PartialEq, Eq)]
pub enum NextPacket {
    /// A complete packet's decoded payload.
    Packet(Vec<Scalar>),
    /// Clean end of the stream.
    End,
    /// The stream stops mid-packet - a crash remnant.
    TruncatedTail,
}

/// Sequential packet reader over a fully-loaded WAL image.
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decodes the next packet. Malformed payloads inside a structurally
    /// complete packet are errors; an incomplete packet at the end of the
    /// stream is [`NextPacket::TruncatedTail`].
    pub fn next(&mut self) -> Result<NextPacket> {
        let rem = &self.buf[self.pos..];
        if rem.is_empty() {
            return Ok(NextPacket::End);
        }
        if rem.len() < 4 {
            return Ok(NextPacket::TruncatedTail);
        }

        let len = u32::from_be_bytes([rem[0], rem[1], rem[2], rem[3]]) as usize;
        let raw = 4 + len;
        let padded = (raw + WAL_ALIGN - 1) & !(WAL_ALIGN - 1);
        if padded > rem.len() {
            return Ok(NextPacket::TruncatedTail);
        }

        let payload = &rem[4..raw];
        let items = decode_scalars(payload)?;
        self.pos += padded;
        Ok(NextPacket::Packet(items))
    }
}

/// Builds the epoch header packet.
pub fn header_packet() -> Vec<u8> {
    encode_packet(&[
        Scalar::Int(WPT_HEADER),
        Scalar::Int(WAL_TYPE_ACID),
        Scalar::Str(String::new()),
    ])
}

/// Builds a write-data packet for one flushed run.
pub fn write_data_packet(b: &[u8], off: i64) -> Vec<u8> {
    encode_packet(&[
        Scalar::Int(WPT_WRITE_DATA),
        Scalar::Bytes(b.to_vec()),
        Scalar::Int(off),
    ])
}

/// Builds the terminal checkpoint packet.
pub fn checkpoint_packet(size: i64) -> Vec<u8> {
    encode_packet(&[Scalar::Int(WPT_CHECKPOINT), Scalar::Int(size)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_16_aligned() {
        for payload_len in [0usize, 1, 11, 12, 13, 100] {
            let pkt = encode_packet(&[Scalar::Bytes(vec![0xAB; payload_len])]);
            assert_eq!(pkt.len() % WAL_ALIGN, 0, "payload length {}", payload_len);
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&header_packet());
        stream.extend_from_slice(&write_data_packet(&[0x42], 314));
        stream.extend_from_slice(&checkpoint_packet(320));

        let mut r = PacketReader::new(&stream);

        match r.next().unwrap() {
            NextPacket::Packet(items) => {
                assert_eq!(items[0].as_int(), Some(WPT_HEADER));
                assert_eq!(items[1].as_int(), Some(WAL_TYPE_ACID));
                assert_eq!(items[2], Scalar::Str(String::new()));
            }
            other => panic!("expected header packet, got {:?}", other),
        }

        match r.next().unwrap() {
            NextPacket::Packet(items) => {
                assert_eq!(items[0].as_int(), Some(WPT_WRITE_DATA));
                assert_eq!(items[1].as_bytes(), Some(&[0x42u8][..]));
                assert_eq!(items[2].as_int(), Some(314));
            }
            other => panic!("expected write packet, got {:?}", other),
        }

        match r.next().unwrap() {
            NextPacket::Packet(items) => {
                assert_eq!(items[0].as_int(), Some(WPT_CHECKPOINT));
                assert_eq!(items[1].as_int(), Some(320));
            }
            other => panic!("expected checkpoint packet, got {:?}", other),
        }

        assert_eq!(r.next().unwrap(), NextPacket::End);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_stream_is_a_tail_not_an_error() {
        let full = write_data_packet(&[1, 2, 3, 4, 5], 0);
        for cut in 1..full.len() {
            let mut r = PacketReader::new(&full[..cut]);
            assert_eq!(
                r.next().unwrap(),
                NextPacket::TruncatedTail,
                "cut at {} SHOULD be a truncated tail",
                cut
            );
        }
    }

    #[test]
    fn malformed_payload_is_an_error() {
        // A complete packet whose payload is not a valid scalar tuple.
        let mut pkt = vec![0, 0, 0, 2, 0xFF, 0xFF];
        pkt.resize(16, 0);
        let mut r = PacketReader::new(&pkt);
        assert!(r.next().is_err());
    }

    #[test]
    fn remaining_counts_unconsumed_bytes() {
        let mut stream = header_packet();
        let first_len = stream.len();
        stream.extend_from_slice(&checkpoint_packet(0));

        let mut r = PacketReader::new(&stream);
        r.next().unwrap();
        assert_eq!(r.remaining(), stream.len() - first_len);
    }
}
