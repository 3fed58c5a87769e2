//! JSON text framing for envelopes, plus a streaming UTF-8 decoder for
//! terminal output.
//!
//! Wire format: one JSON object per WebSocket text message.

use crate::error::{TourError, TourResult};

/// Encode an envelope into a JSON text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> TourResult<String> {
    serde_json::to_string(value).map_err(|e| TourError::Codec(e.to_string()))
}

/// Decode a JSON text frame into a typed envelope.
///
/// Syntax errors and shape mismatches are reported as
/// [`TourError::MalformedEnvelope`].
pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> TourResult<T> {
    Ok(serde_json::from_str(text)?)
}

/// Streaming UTF-8 decoder: accumulates raw pty bytes and yields text that
/// never ends in the middle of a multi-byte sequence.
///
/// Incomplete trailing sequences (at most 3 bytes) are held back until the
/// next `feed`. Invalid bytes are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Feed a chunk and return all text that can be emitted so far.
    pub fn feed(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = consumed + e.valid_up_to();
                    // The prefix is known-valid here.
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending[consumed..valid_up_to],
                    ));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_up_to + bad;
                        }
                        None => {
                            // Truncated sequence at the end: keep it.
                            consumed = valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is left (lossily) when the stream ends.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    /// Number of bytes held back waiting for the rest of a sequence.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
