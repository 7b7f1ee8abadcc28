//! MLLP wire framing (C4/C10): `<VT> payload <FS><CR>`.
//!
//! [`FrameDecoder`] implements the state machine from §4.3 byte by byte, so it can sit directly
//! on top of a socket read loop without needing to buffer a whole TCP segment first.

use crate::message::V2Message;
use interop_core::error::{EngineError, EngineResult};

pub const SB: u8 = 0x0B;
pub const EB: u8 = 0x1C;
pub const CR: u8 = 0x0D;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    ReadingPayload,
    ExpectCr,
}

/// Byte-at-a-time MLLP frame decoder. Bytes seen in `Idle` outside of a start-block are
/// discarded, matching "discard (IDLE)" in §4.3's state table.
#[derive(Debug)]
pub struct FrameDecoder {
    state: FrameState,
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            state: FrameState::Idle,
            buf: Vec::new(),
            max_payload: usize::MAX,
        }
    }

    /// Same as [`FrameDecoder::new`], but a payload growing past `max_payload` bytes without
    /// completing a frame is a protocol error rather than an unbounded allocation. Mirrors the
    /// `buffer_size` a listener is configured with (§6 `inbound.hl7v2_listener.options`).
    pub fn with_max_payload(max_payload: usize) -> Self {
        FrameDecoder {
            state: FrameState::Idle,
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Feeds one byte. Returns `Ok(Some(payload))` when a full frame completes, `Ok(None)` while
    /// still mid-frame, and `Err` on a protocol violation (a byte other than `CR` after `FS`, or
    /// a payload exceeding the configured buffer size).
    pub fn feed(&mut self, byte: u8) -> EngineResult<Option<Vec<u8>>> {
        match self.state {
            FrameState::Idle => {
                if byte == SB {
                    self.buf.clear();
                    self.state = FrameState::ReadingPayload;
                }
                Ok(None)
            }
            FrameState::ReadingPayload => {
                if byte == EB {
                    self.state = FrameState::ExpectCr;
                } else {
                    if self.buf.len() >= self.max_payload {
                        self.state = FrameState::Idle;
                        self.buf.clear();
                        return Err(EngineError::parse("MLLP payload exceeds configured buffer size"));
                    }
                    self.buf.push(byte);
                }
                Ok(None)
            }
            FrameState::ExpectCr => {
                self.state = FrameState::Idle;
                if byte == CR {
                    Ok(Some(std::mem::take(&mut self.buf)))
                } else {
                    Err(EngineError::parse("MLLP protocol error: expected CR after FS"))
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps `payload` in MLLP framing for writing to the wire.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(SB);
    out.extend_from_slice(payload);
    out.push(EB);
    out.push(CR);
    out
}

/// Decodes a single buffered frame read in one shot (e.g. from [`interop_core::net::Connection`]
/// reading up to `CR`). Validates the leading `SB` and trailing `EB CR`.
pub fn decode(framed: &[u8]) -> EngineResult<&[u8]> {
    if framed.len() < 3 {
        return Err(EngineError::parse("MLLP frame too short"));
    }
    if framed[0] != SB {
        return Err(EngineError::parse("MLLP frame missing leading VT"));
    }
    let last = framed.len() - 1;
    if framed[last] != CR || framed[last - 1] != EB {
        return Err(EngineError::parse("MLLP frame missing trailing FS CR"));
    }
    Ok(&framed[1..last - 1])
}

/// Builds an `MSA|AA|<control_id>` acknowledgement (§4.3/§4.9).
pub fn build_ack(original: &V2Message, control_id: &str) -> String {
    build_acknowledgement(original, control_id, "AA", None)
}

/// Builds an `MSA|AE|<control_id>|<reason>` negative acknowledgement.
pub fn build_nak(original: &V2Message, control_id: &str, reason: &str) -> String {
    build_acknowledgement(original, control_id, "AE", Some(reason))
}

fn build_acknowledgement(
    original: &V2Message,
    control_id: &str,
    ack_code: &str,
    reason: Option<&str>,
) -> String {
    let msh = original.msh();
    let sending_app = msh.and_then(|m| m.field(3)).map(|f| f.text()).unwrap_or("");
    let sending_facility = msh.and_then(|m| m.field(4)).map(|f| f.text()).unwrap_or("");
    let receiving_app = msh.and_then(|m| m.field(5)).map(|f| f.text()).unwrap_or("");
    let receiving_facility = msh.and_then(|m| m.field(6)).map(|f| f.text()).unwrap_or("");
    let version = msh.and_then(|m| m.field(12)).map(|f| f.text()).unwrap_or("2.3");

    // Sending and receiving swap relative to the inbound message: we are answering it.
    let mut out = format!(
        "MSH|^~\\&|{receiving_app}|{receiving_facility}|{sending_app}|{sending_facility}||ACK|{control_id}|P|{version}\r"
    );
    out.push_str("MSA|");
    out.push_str(ack_code);
    out.push('|');
    out.push_str(control_id);
    if let Some(reason) = reason {
        out.push('|');
        out.push_str(reason);
    }
    out.push('\r');
    out
}

/// Parses an acknowledgement message and returns `(code, reason)` from `MSA-1`/`MSA-3`.
pub fn parse_ack(msg: &V2Message) -> EngineResult<(String, Option<String>)> {
    let msa = msg
        .first_segment("MSA")
        .ok_or_else(|| EngineError::parse("acknowledgement missing MSA segment"))?;
    let code = msa
        .field(1)
        .map(|f| f.text().to_string())
        .ok_or_else(|| EngineError::parse("MSA-1 missing"))?;
    let reason = msa.field(3).map(|f| f.text().to_string()).filter(|s| !s.is_empty());
    Ok((code, reason))
}
