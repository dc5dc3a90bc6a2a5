//! Inbound frame codec
//!
//! Every server message starts with a 4-byte little-endian header word:
//!
//! ```text
//! bit 31 .. 4   3 .. 1   0
//!     length    kind     deflate
//! ```
//!
//! `length` counts the kind-specific fixed fields plus the payload, not the
//! header word itself. Payloads are JSON text, raw-deflate compressed when the
//! flag is set.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;

/// Size of the header word
pub const HEADER_LEN: usize = 4;

/// Largest length the 28-bit field can carry
pub const MAX_FRAME_LEN: usize = (1 << 28) - 1;

/// Largest payload a compressed frame may inflate to
pub const MAX_INFLATED_LEN: usize = 64 * 1024 * 1024;

/// Frame decoding failures. None of these close the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("frame of kind {kind:?} too short for its fixed fields (length {len})")]
    Truncated { kind: FrameKind, len: usize },
    #[error("frame too large")]
    FrameTooLarge,
    #[error("failed to inflate payload: {0}")]
    Inflate(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Message kind carried in bits 1..3 of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    FunctionResponse = 0,
    SubscriptionData = 1,
    SubscriptionDiff = 2,
    GetUnchanged = 3,
    Auth = 4,
    Error = 5,
}

impl FrameKind {
    /// Bytes of fixed fields that precede the payload
    pub fn fixed_len(self) -> usize {
        match self {
            FrameKind::FunctionResponse => 3,
            FrameKind::SubscriptionData => 16,
            FrameKind::SubscriptionDiff => 24,
            FrameKind::GetUnchanged => 8,
            FrameKind::Auth | FrameKind::Error => 0,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameKind::FunctionResponse),
            1 => Ok(FrameKind::SubscriptionData),
            2 => Ok(FrameKind::SubscriptionDiff),
            3 => Ok(FrameKind::GetUnchanged),
            4 => Ok(FrameKind::Auth),
            5 => Ok(FrameKind::Error),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub deflate: bool,
    pub len: usize,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, deflate: bool, len: usize) -> Result<Self, FrameError> {
        if len > MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLarge);
        }
        Ok(Self { kind, deflate, len })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let word = ((self.len as u32) << 4) | ((self.kind as u32) << 1) | u32::from(self.deflate);
        word.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Incomplete {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = FrameKind::try_from(((word >> 1) & 0b111) as u8)?;
        Ok(Self {
            kind,
            deflate: word & 1 == 1,
            len: (word >> 4) as usize,
        })
    }
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Response to a `call`, correlated by request id
    FunctionResponse {
        request_id: u32,
        payload: Option<Value>,
    },
    /// Complete value of a subscription
    SubscriptionData {
        id: u64,
        checksum: u64,
        payload: Option<Value>,
    },
    /// Patch turning the value at `previous_checksum` into the value at `checksum`
    SubscriptionDiff {
        id: u64,
        checksum: u64,
        previous_checksum: u64,
        patch: Option<Value>,
    },
    /// The checksum sent with a get is still current
    GetUnchanged { id: u64 },
    /// Result of a token change, or a server-side auth state change
    Auth { payload: Option<Value> },
    /// Error correlated to a request or a subscription
    Error { payload: Option<Value> },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::FunctionResponse { .. } => FrameKind::FunctionResponse,
            Frame::SubscriptionData { .. } => FrameKind::SubscriptionData,
            Frame::SubscriptionDiff { .. } => FrameKind::SubscriptionDiff,
            Frame::GetUnchanged { .. } => FrameKind::GetUnchanged,
            Frame::Auth { .. } => FrameKind::Auth,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// Decode a single frame from the start of `buf`
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        let header = FrameHeader::decode(buf)?;
        let end = HEADER_LEN + header.len;
        if buf.len() < end {
            return Err(FrameError::Incomplete {
                needed: end,
                available: buf.len(),
            });
        }
        let fixed_len = header.kind.fixed_len();
        if header.len < fixed_len {
            return Err(FrameError::Truncated {
                kind: header.kind,
                len: header.len,
            });
        }

        let fixed = &buf[HEADER_LEN..HEADER_LEN + fixed_len];
        let body = &buf[HEADER_LEN + fixed_len..end];
        // Older servers pad an empty auth frame to three bytes.
        let payload = if header.kind == FrameKind::Auth && header.len == 3 && !header.deflate {
            None
        } else {
            decode_payload(body, header.deflate)?
        };

        let frame = match header.kind {
            FrameKind::FunctionResponse => Frame::FunctionResponse {
                request_id: read_u24(fixed),
                payload,
            },
            FrameKind::SubscriptionData => Frame::SubscriptionData {
                id: read_u64(&fixed[0..8]),
                checksum: read_u64(&fixed[8..16]),
                payload,
            },
            FrameKind::SubscriptionDiff => Frame::SubscriptionDiff {
                id: read_u64(&fixed[0..8]),
                checksum: read_u64(&fixed[8..16]),
                previous_checksum: read_u64(&fixed[16..24]),
                patch: payload,
            },
            FrameKind::GetUnchanged => Frame::GetUnchanged {
                id: read_u64(&fixed[0..8]),
            },
            FrameKind::Auth => Frame::Auth { payload },
            FrameKind::Error => Frame::Error { payload },
        };

        Ok((frame, end))
    }

    /// Encode this frame, compressing the payload when `deflate` is set
    pub fn encode(&self, deflate: bool) -> Result<Vec<u8>, FrameError> {
        let mut fixed = Vec::with_capacity(24);
        let payload = match self {
            Frame::FunctionResponse {
                request_id,
                payload,
            } => {
                fixed.extend_from_slice(&request_id.to_le_bytes()[..3]);
                payload
            }
            Frame::SubscriptionData {
                id,
                checksum,
                payload,
            } => {
                fixed.extend_from_slice(&id.to_le_bytes());
                fixed.extend_from_slice(&checksum.to_le_bytes());
                payload
            }
            Frame::SubscriptionDiff {
                id,
                checksum,
                previous_checksum,
                patch,
            } => {
                fixed.extend_from_slice(&id.to_le_bytes());
                fixed.extend_from_slice(&checksum.to_le_bytes());
                fixed.extend_from_slice(&previous_checksum.to_le_bytes());
                patch
            }
            Frame::GetUnchanged { id } => {
                fixed.extend_from_slice(&id.to_le_bytes());
                &None
            }
            Frame::Auth { payload } | Frame::Error { payload } => payload,
        };

        let body = match payload {
            Some(value) => encode_payload(value, deflate)?,
            None => Vec::new(),
        };
        let header = FrameHeader::new(
            self.kind(),
            deflate && !body.is_empty(),
            fixed.len() + body.len(),
        )?;

        let mut buf = Vec::with_capacity(HEADER_LEN + header.len);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&fixed);
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

fn decode_payload(body: &[u8], deflate: bool) -> Result<Option<Value>, FrameError> {
    if body.is_empty() {
        return Ok(None);
    }
    let value = if deflate {
        serde_json::from_slice(&inflate(body, MAX_INFLATED_LEN)?)
    } else {
        serde_json::from_slice(body)
    }
    .map_err(|e| FrameError::InvalidPayload(e.to_string()))?;
    Ok(Some(value))
}

fn inflate(body: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut text = Vec::new();
    DeflateDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut text)
        .map_err(|e| FrameError::Inflate(e.to_string()))?;
    if text.len() > limit {
        return Err(FrameError::FrameTooLarge);
    }
    Ok(text)
}

fn encode_payload(value: &Value, deflate: bool) -> Result<Vec<u8>, FrameError> {
    let text = serde_json::to_vec(value).map_err(|e| FrameError::InvalidPayload(e.to_string()))?;
    if !deflate {
        return Ok(text);
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&text)
        .and_then(|_| encoder.finish())
        .map_err(|e| FrameError::Inflate(e.to_string()))
}

fn read_u24(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0])
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(buf);
    u64::from_le_bytes(bytes)
}
