//! Error types for the dmsg relay transport.
//!
//! Errors fall into two scopes:
//!
//! - **Per-circuit**: rejection, handshake timeout and closed-pipe errors only
//!   ever affect one [`Transport`](crate::Transport).
//! - **Per-connection**: I/O failures on the physical link close every circuit
//!   multiplexed on it, but never spill over to sibling connections.

use std::borrow::Cow;
use thiserror::Error;

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame type byte is not one of the known types
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// Payload does not fit in the 16-bit length field
    #[error("payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    /// Payload does not have the shape its frame type requires
    #[error("malformed {kind} payload: expected {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Frame type name
        kind: &'static str,
        /// Expected payload length
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// Stream ended before a full frame was read
    #[error("stream truncated mid-frame")]
    Truncated,

    /// Underlying I/O failure
    #[error("frame i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the discovery collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// No entry is registered for the key
    #[error("entry not found for {0}")]
    EntryNotFound(String),

    /// Entry signature did not verify
    #[error("entry signature invalid")]
    InvalidSignature,

    /// Entry sequence did not advance
    #[error("entry sequence out of order: have {current}, got {received}")]
    SequenceOutOfOrder {
        /// Sequence currently stored
        current: u64,
        /// Sequence received
        received: u64,
    },

    /// Entry could not be encoded for signing
    #[error("entry encoding failed: {0}")]
    Encoding(String),

    /// Service unreachable or returned an error
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

/// dmsg errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame codec error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Physical connection I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Discovery lookup or publish failed
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// None of the remote's delegated relay servers could be reached
    #[error("no relay server available")]
    NoRelayAvailable,

    /// Remote (or relay) answered the circuit request with CLOSE
    #[error("circuit rejected by remote")]
    Rejected,

    /// No answer to the circuit request within the handshake timeout
    #[error("circuit handshake timed out")]
    HandshakeTimeout,

    /// Circuit or connection is closed
    #[error("closed pipe")]
    ClosedPipe,

    /// Client has been shut down
    #[error("client closed")]
    ClientClosed,

    /// Every circuit id of the local parity is in use
    #[error("circuit id space exhausted")]
    IdsExhausted,

    /// Peer identity could not be established
    #[error("authentication failed: {0}")]
    AuthFailed(Cow<'static, str>),

    /// Relay refused the session because it is at capacity
    #[error("relay server full")]
    ServerFull,

    /// Key material is not a valid Ed25519 key
    #[error("invalid key")]
    InvalidKey,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl Error {
    /// Returns true if the error signals a closed circuit, connection or client
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ClosedPipe | Error::ClientClosed)
    }

    /// Returns true if retrying through another relay may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Rejected
                | Error::HandshakeTimeout
                | Error::Io(_)
                | Error::ClosedPipe
                | Error::ServerFull
                | Error::IdsExhausted
        )
    }

    /// Create an authentication error with static context (zero allocation)
    #[must_use]
    pub const fn auth(context: &'static str) -> Self {
        Error::AuthFailed(Cow::Borrowed(context))
    }

    /// Create a configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }
}

/// Result type for dmsg operations
pub type Result<T> = std::result::Result<T, Error>;
