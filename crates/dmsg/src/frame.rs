//! Frame encoding and decoding for the dmsg wire protocol.
//!
//! Every message exchanged on a physical connection to a relay is a frame:
//!
//! ```text
//! +--------+----------------+----------------+------------------+
//! | type:1 | circuit_id:2BE | length:2BE     | payload:length   |
//! +--------+----------------+----------------+------------------+
//! ```
//!
//! Payload shapes by type:
//!
//! | Type | Value | Payload |
//! |------|-------|---------|
//! | `REQUEST` | 0x01 | initiator pk (32) ‖ responder pk (32) |
//! | `ACCEPT`  | 0x02 | initiator pk (32) ‖ responder pk (32) |
//! | `CLOSE`   | 0x03 | reason (1) |
//! | `FWD`     | 0x0A | sequence (2BE) ‖ application bytes |
//! | `ACK`     | 0x0B | sequence (2BE) |

use crate::error::FrameError;
use crate::keys::{PUBLIC_KEY_SIZE, PubKey};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed frame header size in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload carried by a single frame
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Size of the sequence number prefixed to `FWD` payloads and carried by `ACK`
pub const SEQ_SIZE: usize = 2;

/// Maximum application bytes in one `FWD` frame
pub const MAX_FWD_DATA: usize = MAX_PAYLOAD_SIZE - SEQ_SIZE;

/// `REQUEST` / `ACCEPT` payload size (two public keys)
pub const HANDSHAKE_PAYLOAD_SIZE: usize = 2 * PUBLIC_KEY_SIZE;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a circuit
    Request = 0x01,
    /// Accept a circuit
    Accept = 0x02,
    /// Close or reject a circuit
    Close = 0x03,
    /// Forward application data
    Fwd = 0x0A,
    /// Acknowledge a `FWD`
    Ack = 0x0B,
}

impl FrameType {
    /// Wire name, used in logs and errors
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Close => "CLOSE",
            Self::Fwd => "FWD",
            Self::Ack => "ACK",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Accept),
            0x03 => Ok(Self::Close),
            0x0A => Ok(Self::Fwd),
            0x0B => Ok(Self::Ack),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Reason byte carried by `CLOSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// Orderly close by either endpoint
    Normal = 0,
    /// Circuit request refused or protocol violation
    Rejected = 1,
    /// Circuit request not answered in time
    TimedOut = 2,
}

impl From<u8> for CloseReason {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Rejected,
            2 => Self::TimedOut,
            _ => Self::Normal,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    circuit_id: u16,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, checking the payload fits the length field
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] for payloads over 65535 bytes.
    pub fn new(frame_type: FrameType, circuit_id: u16, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            frame_type,
            circuit_id,
            payload,
        })
    }

    /// `REQUEST` naming initiator and responder
    #[must_use]
    pub fn request(circuit_id: u16, initiator: &PubKey, responder: &PubKey) -> Self {
        Self::handshake(FrameType::Request, circuit_id, initiator, responder)
    }

    /// `ACCEPT` echoing initiator and responder
    #[must_use]
    pub fn accept(circuit_id: u16, initiator: &PubKey, responder: &PubKey) -> Self {
        Self::handshake(FrameType::Accept, circuit_id, initiator, responder)
    }

    fn handshake(frame_type: FrameType, circuit_id: u16, initiator: &PubKey, responder: &PubKey) -> Self {
        let mut payload = Vec::with_capacity(HANDSHAKE_PAYLOAD_SIZE);
        payload.extend_from_slice(initiator.as_bytes());
        payload.extend_from_slice(responder.as_bytes());
        Self {
            frame_type,
            circuit_id,
            payload,
        }
    }

    /// `CLOSE` with a reason byte
    #[must_use]
    pub fn close(circuit_id: u16, reason: CloseReason) -> Self {
        Self {
            frame_type: FrameType::Close,
            circuit_id,
            payload: vec![reason as u8],
        }
    }

    /// `FWD` carrying a chunk of application data
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if `data` exceeds [`MAX_FWD_DATA`].
    pub fn fwd(circuit_id: u16, seq: u16, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_FWD_DATA {
            return Err(FrameError::PayloadTooLarge(data.len() + SEQ_SIZE));
        }
        let mut payload = Vec::with_capacity(SEQ_SIZE + data.len());
        payload.extend_from_slice(&seq.to_be_bytes());
        payload.extend_from_slice(data);
        Ok(Self {
            frame_type: FrameType::Fwd,
            circuit_id,
            payload,
        })
    }

    /// `ACK` for one `FWD` sequence number
    #[must_use]
    pub fn ack(circuit_id: u16, seq: u16) -> Self {
        Self {
            frame_type: FrameType::Ack,
            circuit_id,
            payload: seq.to_be_bytes().to_vec(),
        }
    }

    /// Get the frame type
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Get the circuit id
    #[must_use]
    pub fn circuit_id(&self) -> u16 {
        self.circuit_id
    }

    /// Get the payload slice
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning the payload
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Same frame addressed to another circuit id (relay rewrite)
    #[must_use]
    pub fn with_circuit_id(mut self, circuit_id: u16) -> Self {
        self.circuit_id = circuit_id;
        self
    }

    /// Decode the `(initiator, responder)` keys of a `REQUEST` / `ACCEPT`
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MalformedPayload`] if the payload is not exactly
    /// two public keys.
    pub fn handshake_keys(&self) -> Result<(PubKey, PubKey), FrameError> {
        self.expect_len(HANDSHAKE_PAYLOAD_SIZE)?;
        let (initiator, responder) = self.payload.split_at(PUBLIC_KEY_SIZE);
        let mut a = [0u8; PUBLIC_KEY_SIZE];
        let mut b = [0u8; PUBLIC_KEY_SIZE];
        a.copy_from_slice(initiator);
        b.copy_from_slice(responder);
        Ok((PubKey::from_bytes(a), PubKey::from_bytes(b)))
    }

    /// Split a `FWD` payload into sequence number and data
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MalformedPayload`] if the payload is shorter than
    /// a sequence number.
    pub fn fwd_parts(&self) -> Result<(u16, &[u8]), FrameError> {
        if self.payload.len() < SEQ_SIZE {
            return Err(self.malformed(SEQ_SIZE));
        }
        let seq = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        Ok((seq, &self.payload[SEQ_SIZE..]))
    }

    /// Sequence number acknowledged by an `ACK`
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MalformedPayload`] if the payload is not 2 bytes.
    pub fn ack_seq(&self) -> Result<u16, FrameError> {
        self.expect_len(SEQ_SIZE)?;
        Ok(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Reason carried by a `CLOSE` (empty payload reads as normal)
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        self.payload
            .first()
            .copied()
            .map_or(CloseReason::Normal, CloseReason::from)
    }

    fn expect_len(&self, expected: usize) -> Result<(), FrameError> {
        if self.payload.len() == expected {
            Ok(())
        } else {
            Err(self.malformed(expected))
        }
    }

    fn malformed(&self, expected: usize) -> FrameError {
        FrameError::MalformedPayload {
            kind: self.frame_type.name(),
            expected,
            actual: self.payload.len(),
        }
    }

    /// Encode header and payload into a single buffer
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded frame to `buf` (used to coalesce several frames
    /// into one link write)
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        // Constructors bound the payload to MAX_PAYLOAD_SIZE
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Parse one frame from the front of `data`, returning it with the number
    /// of bytes consumed
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if `data` holds less than one full
    /// frame and [`FrameError::InvalidFrameType`] for unknown type bytes.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        let (frame_type, circuit_id, len) = decode_header(&data[..HEADER_SIZE]);
        let total = HEADER_SIZE + len;
        if data.len() < total {
            return Err(FrameError::Truncated);
        }
        let frame_type = FrameType::try_from(frame_type)?;
        Ok((
            Self {
                frame_type,
                circuit_id,
                payload: data[HEADER_SIZE..total].to_vec(),
            },
            total,
        ))
    }
}

fn decode_header(header: &[u8]) -> (u8, u16, usize) {
    let circuit_id = u16::from_be_bytes([header[1], header[2]]);
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    (header[0], circuit_id, len)
}

/// Encode a frame from its parts
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] for payloads over 65535 bytes.
pub fn make_frame(frame_type: FrameType, circuit_id: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    Ok(Frame::new(frame_type, circuit_id, payload.to_vec())?.encode())
}

/// Read exactly one frame from `reader`
///
/// Blocks until the header and exactly `length` payload bytes have arrived.
/// A frame with an unknown type byte is consumed in full before
/// [`FrameError::InvalidFrameType`] is returned, so the stream stays aligned.
///
/// # Errors
///
/// - [`FrameError::Io`] with [`io::ErrorKind::UnexpectedEof`] if the stream
///   ended cleanly on a frame boundary
/// - [`FrameError::Truncated`] if it ended mid-frame
/// - [`FrameError::Io`] for any other I/O failure
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Io(io::ErrorKind::UnexpectedEof.into())
            } else {
                FrameError::Truncated
            });
        }
        filled += n;
    }

    let (frame_type, circuit_id, len) = decode_header(&header);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(Frame {
        frame_type: FrameType::try_from(frame_type)?,
        circuit_id,
        payload,
    })
}

/// Write one frame and flush
///
/// # Errors
///
/// Returns any I/O error from the writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

impl FrameError {
    /// True if the stream ended cleanly on a frame boundary
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
