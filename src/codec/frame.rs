use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::Decoded;
use crate::core::{Error, Result};

/// First byte of every binary frame
pub const SYNC: u8 = 0xA5;

/// sync + kind + sequence + 2-byte length
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted
pub const MAX_PAYLOAD: usize = 1024;

/// Acknowledgement kind shared by the binary protocols
pub const KIND_ACK: u8 = 0x7F;

/// Subscription request kind shared by the binary protocols
pub const KIND_SUBSCRIBE: u8 = 0x10;

/// One frame of the antenna switch / amplifier protocols
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Message kind
    pub kind: u8,
    /// Sequence number, echoed in acknowledgements
    pub seq: u8,
    /// Kind-specific payload
    pub payload: Bytes,
}

impl BinaryFrame {
    /// Creates a new frame
    pub fn new(kind: u8, seq: u8, payload: impl Into<Bytes>) -> Self {
        BinaryFrame {
            kind,
            seq,
            payload: payload.into(),
        }
    }

    /// Status byte of an acknowledgement; zero means accepted
    pub fn ack_status(&self) -> Result<u8> {
        if self.kind != KIND_ACK {
            return Err(Error::decode(format!(
                "frame kind 0x{:02X} is not an acknowledgement",
                self.kind
            )));
        }
        self.payload
            .first()
            .copied()
            .ok_or_else(|| Error::decode("empty acknowledgement payload"))
    }
}

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Fails with a decode error unless `payload` holds at least `needed` bytes
pub fn require(payload: &[u8], needed: usize, what: &str) -> Result<()> {
    if payload.len() < needed {
        return Err(Error::decode(format!(
            "{} payload too short: {} bytes, need {}",
            what,
            payload.len(),
            needed
        )));
    }
    Ok(())
}

/// Codec for sync-prefixed, checksummed binary frames
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded<BinaryFrame>;
    type Error = io::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != SYNC {
            // Lost sync: skip to the next candidate sync byte
            let skip = src.iter().position(|b| *b == SYNC).unwrap_or(src.len());
            src.advance(skip);
            return Ok(Some(Decoded::Malformed(format!(
                "skipped {} bytes before sync",
                skip
            ))));
        }

        if src.len() < HEADER_LEN {
            // Need more data to read the header
            return Ok(None);
        }

        let length = usize::from(u16::from_be_bytes([src[3], src[4]]));
        if length > MAX_PAYLOAD {
            src.advance(1);
            return Ok(Some(Decoded::Malformed(format!(
                "payload length {} exceeds {}",
                length, MAX_PAYLOAD
            ))));
        }

        let total = HEADER_LEN + length + 1;
        if src.len() < total {
            // Need more data to read the full frame
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total).freeze();
        let expected = frame[total - 1];
        let actual = checksum(&frame[1..total - 1]);
        if expected != actual {
            return Ok(Some(Decoded::Malformed(format!(
                "checksum mismatch on kind 0x{:02X}: expected 0x{:02X}, got 0x{:02X}",
                frame[1], expected, actual
            ))));
        }

        Ok(Some(Decoded::Item(BinaryFrame {
            kind: frame[1],
            seq: frame[2],
            payload: frame.slice(HEADER_LEN..total - 1),
        })))
    }
}

impl Encoder<BinaryFrame> for FrameCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: BinaryFrame,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        let length = u16::try_from(item.payload.len())
            .ok()
            .filter(|len| usize::from(*len) <= MAX_PAYLOAD)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("payload of {} bytes is too large", item.payload.len()),
                )
            })?;

        dst.reserve(HEADER_LEN + item.payload.len() + 1);
        let start = dst.len();
        dst.put_u8(SYNC);
        dst.put_u8(item.kind);
        dst.put_u8(item.seq);
        dst.put_u16(length);
        dst.put_slice(&item.payload);
        let sum = checksum(&dst[start + 1..]);
        dst.put_u8(sum);
        Ok(())
    }
}
