//! Wire codecs
//!
//! Framing and parsing for each device protocol. Codecs never fail the stream
//! because of one bad message: they yield [`Decoded::Malformed`] and carry on,
//! so only real I/O errors end a connection.

pub mod amplifier;
pub mod announce;
pub mod antenna;
pub mod frame;
pub mod json_cat;
pub mod rotctl;
pub mod smartsdr;
pub mod spot;

pub use self::frame::{BinaryFrame, FrameCodec};

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Longest text line accepted from a device
pub const MAX_LINE_LENGTH: usize = 4096;

/// One decoding result
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A well-formed message
    Item(T),
    /// A message that could not be decoded; the stream continues
    Malformed(String),
}

/// Newline-delimited text codec.
///
/// Accepts `\n` or `\r\n`. Lines that are not UTF-8 or exceed the length limit
/// come out as [`Decoded::Malformed`] instead of erroring the stream.
#[derive(Debug, Clone)]
pub struct LineCodec {
    /// Length limit
    max_length: usize,
    /// Inside an overlong line, dropping bytes up to the next newline
    discarding: bool,
    /// Where the newline search resumes
    next_index: usize,
}

impl LineCodec {
    /// Creates a codec with the default length limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Creates a codec with a custom length limit
    pub fn with_max_length(max_length: usize) -> Self {
        LineCodec {
            max_length,
            discarding: false,
            next_index: 0,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(bytes: &[u8]) -> Decoded<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(line) => Decoded::Item(line.to_string()),
        Err(e) => Decoded::Malformed(format!("line is not valid UTF-8: {}", e)),
    }
}

impl Decoder for LineCodec {
    type Item = Decoded<String>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match newline {
                Some(end) => {
                    self.next_index = 0;
                    let line = src.split_to(end + 1);
                    if self.discarding {
                        // Tail of an overlong line
                        self.discarding = false;
                        continue;
                    }
                    if end > self.max_length {
                        return Ok(Some(Decoded::Malformed(format!(
                            "line of {} bytes exceeds limit of {}",
                            end, self.max_length
                        ))));
                    }
                    return Ok(Some(decode_line(&line[..end])));
                }
                None if src.len() > self.max_length => {
                    src.clear();
                    self.next_index = 0;
                    if self.discarding {
                        return Ok(None);
                    }
                    self.discarding = true;
                    return Ok(Some(Decoded::Malformed(format!(
                        "line exceeds limit of {} bytes",
                        self.max_length
                    ))));
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        // Final line without a trailing newline
        self.next_index = 0;
        let rest = src.split_to(src.len());
        Ok(Some(decode_line(&rest)))
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Splits `key=value` tokens, ignoring tokens without `=`
pub fn key_values(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.split_whitespace().filter_map(|token| token.split_once('='))
}
