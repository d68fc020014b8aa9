//! Text encodings for PTY data
//!
//! Inbound bytes are decoded incrementally: a multi-byte UTF-8 sequence split
//! across two reads is held back and completed by the next read. Invalid
//! sequences are replaced with U+FFFD; nothing is passed through raw.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PtyError;

/// Character encoding applied to PTY data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    #[serde(alias = "binary", alias = "iso-8859-1")]
    Latin1,
    Ascii,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
        }
    }

    /// Encode outbound text
    ///
    /// Characters the encoding cannot represent become `?`.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    /// Create a streaming decoder for this encoding
    pub fn decoder(&self) -> Decoder {
        Decoder::new(*self)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = PtyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "binary" | "iso-8859-1" => Ok(Encoding::Latin1),
            "ascii" => Ok(Encoding::Ascii),
            other => Err(PtyError::InvalidArgument(format!(
                "unsupported encoding: {}",
                other
            ))),
        }
    }
}

/// Streaming decoder that carries incomplete sequences between reads
#[derive(Debug, Clone)]
pub struct Decoder {
    encoding: Encoding,
    /// Trailing bytes of an unfinished UTF-8 sequence
    pending: Vec<u8>,
}

impl Decoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::with_capacity(4),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Check if decoder is in the middle of a sequence
    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decode one read batch
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => self.decode_utf8(bytes),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Encoding::Ascii => bytes.iter().map(|&b| char::from(b & 0x7f)).collect(),
        }
    }

    /// Flush at end of stream; an unfinished sequence becomes U+FFFD
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> String {
        let joined;
        let mut input: &[u8] = if self.pending.is_empty() {
            bytes
        } else {
            self.pending.extend_from_slice(bytes);
            joined = std::mem::take(&mut self.pending);
            &joined
        };

        let mut out = String::with_capacity(input.len());
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                },
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    // SAFETY: from_utf8 verified this prefix
                    out.push_str(unsafe { std::str::from_utf8_unchecked(valid) });
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[bad..];
                        },
                        None => {
                            // Incomplete sequence at the end of this batch
                            self.pending.extend_from_slice(rest);
                            break;
                        },
                    }
                },
            }
        }
        out
    }
}
