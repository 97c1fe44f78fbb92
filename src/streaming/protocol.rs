//! NUL-delimited progress framing for the pipe transport.
//!
//! With progress enabled, `conda --json` writes each progress update as a
//! single-line JSON object followed by a `0x00` byte, and the final result as
//! an ordinary (possibly pretty-printed) JSON document once progress is over.
//!
//! Wire format:
//! ```text
//! {"fetch":"numpy","maxval":100,"progress":0}\0
//! {"fetch":"numpy","maxval":100,"progress":100,"finished":true}\0
//! {"name":"numpy","maxval":3,"progress":1}\0        <- second phase (install)
//! ...
//! {
//!   "success": true, ...                            <- final document, no sentinel
//! }
//! ```

use crate::error::FrameError;
use bytes::{Bytes, BytesMut};
use serde_json::Value;

/// Frame delimiter. Application JSON never contains it.
pub const SENTINEL: u8 = 0x00;

/// Key marking the last frame of a progress phase.
pub const FINISHED_KEY: &str = "finished";

// =============================================================================
// Phase
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Progress frames are expected.
    #[default]
    Streaming,
    /// Only final-output bytes are expected.
    Draining,
}

/// Whether a progress frame closes its phase.
pub fn is_finished(message: &Value) -> bool {
    match message.get(FINISHED_KEY) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn find_sentinel(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|&b| b == SENTINEL)
}

// =============================================================================
// FrameDecoder
// =============================================================================

/// Reassembles progress frames from arbitrarily split stdout chunks.
///
/// The decoder owns the per-call buffer and phase. Bytes are never duplicated
/// or dropped: every byte of input ends up either inside exactly one emitted
/// frame or in the final-output buffer returned by [`FrameDecoder::finish`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    phase: Phase,
    frames: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of frames emitted so far, malformed ones included.
    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }

    /// Bytes currently held for a partial frame or the final document.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Feed one chunk and return the frames it completed, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Value, FrameError>> {
        let mut out = Vec::new();

        let Some(first) = find_sentinel(chunk) else {
            // No sentinel anywhere: progress reporting is over (for now).
            self.buffer.extend_from_slice(chunk);
            if self.phase == Phase::Streaming {
                tracing::debug!(
                    frames = self.frames,
                    "chunk without sentinel, draining final output"
                );
            }
            self.phase = Phase::Draining;
            return out;
        };

        if self.phase == Phase::Draining {
            // A sentinel after draining started is the next progress phase
            // (e.g. install after fetch). What was buffered is its first frame.
            tracing::debug!(buffered = self.buffer.len(), "progress resumed");
            self.phase = Phase::Streaming;
        }

        let mut rest = chunk;
        let mut next = Some(first);
        while let (Phase::Streaming, Some(end)) = (self.phase, next) {
            self.buffer.extend_from_slice(&rest[..end]);
            rest = &rest[end + 1..];
            let frame = self.buffer.split().freeze();
            next = find_sentinel(rest);

            match self.parse_frame(&frame) {
                Ok(message) => {
                    if is_finished(&message) && next.is_none() {
                        self.phase = Phase::Draining;
                    }
                    out.push(Ok(message));
                }
                Err(err) => out.push(Err(err)),
            }
        }

        self.buffer.extend_from_slice(rest);
        out
    }

    fn parse_frame(&mut self, frame: &Bytes) -> Result<Value, FrameError> {
        self.frames += 1;
        serde_json::from_slice(frame).map_err(|e| FrameError::new(frame, e))
    }

    /// Take everything buffered as the final output, leaving the decoder empty.
    pub fn finish(&mut self) -> Bytes {
        self.phase = Phase::Draining;
        self.buffer.split().freeze()
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode one progress message as a wire frame.
pub fn encode_frame(message: &Value) -> Bytes {
    let mut buf = serde_json::to_vec(message).unwrap_or_default();
    buf.push(SENTINEL);
    Bytes::from(buf)
}

// =============================================================================
// Tests
// =============================================================================
