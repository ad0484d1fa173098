//! Header framing for delta streams.
//!
//! A framed stream is `JSON(DeltaMetadata)`, one `0x00` byte, then raw batch
//! bytes until end of stream. serde_json escapes every control character, so
//! the first `0x00` always terminates the header.
//!
//! Decoding is incremental: [`try_consume`] is fed one chunk at a time and
//! the separator may land anywhere, including the very first or last byte of
//! a chunk. Bytes after the separator are handed back untouched.

use crate::metadata::{DeltaMetadata, DELTA_VERSION};
use serde_json::Value;
use thiserror::Error;

pub const HEADER_SEPARATOR: u8 = 0x00;

/// Upper bound on buffered header bytes before a separator must appear.
pub const DEFAULT_MAX_HEADER_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed delta header: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("unknown delta version: {0}")]
    UnsupportedVersion(String),
    #[error("delta header exceeds {limit} bytes without a separator")]
    HeaderTooLarge { limit: usize },
    #[error("delta stream ended before the header separator ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// Outcome of feeding one chunk to [`try_consume`].
#[derive(Debug, PartialEq)]
pub enum Consumed {
    NeedMore,
    Complete {
        metadata: DeltaMetadata,
        /// Bytes of the chunk that followed the separator, in order.
        remainder: Vec<u8>,
    },
}

/// Serialize `metadata` followed by the separator byte.
pub fn encode_header(metadata: &DeltaMetadata) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec(metadata)?;
    debug_assert!(!out.contains(&HEADER_SEPARATOR));
    out.push(HEADER_SEPARATOR);
    Ok(out)
}

/// Decode and validate the header bytes preceding the separator.
pub fn decode_header(bytes: &[u8]) -> Result<DeltaMetadata, ProtocolError> {
    let mut raw: Value = serde_json::from_slice(bytes).map_err(ProtocolError::InvalidJson)?;
    let version = raw.get("version").cloned();
    match version {
        Some(ref v) if is_current_version(v) => {
            raw["version"] = Value::from(DELTA_VERSION);
            serde_json::from_value(raw).map_err(ProtocolError::InvalidJson)
        }
        _ => Err(ProtocolError::UnsupportedVersion(
            version.map_or_else(|| "undefined".to_owned(), |v| v.to_string()),
        )),
    }
}

/// Any JSON number equal to the current version matches, so `2.0` does too.
#[allow(clippy::float_cmp, clippy::cast_precision_loss)]
fn is_current_version(version: &Value) -> bool {
    version.as_f64() == Some(DELTA_VERSION as f64)
}

/// Feed `chunk` into the header accumulator `buffer`.
///
/// `buffer` never contains a separator: it holds only the header bytes seen
/// so far. Once the separator is found the header is decoded and the rest of
/// `chunk` is returned as the remainder.
pub fn try_consume(
    buffer: &mut Vec<u8>,
    chunk: &[u8],
    max_len: usize,
) -> Result<Consumed, ProtocolError> {
    let Some(pos) = chunk.iter().position(|&b| b == HEADER_SEPARATOR) else {
        if buffer.len() + chunk.len() > max_len {
            return Err(ProtocolError::HeaderTooLarge { limit: max_len });
        }
        buffer.extend_from_slice(chunk);
        return Ok(Consumed::NeedMore);
    };

    if buffer.len() + pos > max_len {
        return Err(ProtocolError::HeaderTooLarge { limit: max_len });
    }
    buffer.extend_from_slice(&chunk[..pos]);
    let metadata = decode_header(buffer)?;
    Ok(Consumed::Complete {
        metadata,
        remainder: chunk[pos + 1..].to_vec(),
    })
}

/// Stateful wrapper around [`try_consume`] for callers that read in a loop.
#[derive(Debug)]
pub struct HeaderParser {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_HEADER_LEN)
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Number of header bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Consumed, ProtocolError> {
        try_consume(&mut self.buffer, chunk, self.max_len)
    }

    /// Signal end of input. Always an error: a complete header returns from
    /// [`push`](Self::push) before the stream can end.
    pub fn finish(self) -> ProtocolError {
        ProtocolError::Truncated {
            buffered: self.buffer.len(),
        }
    }
}
