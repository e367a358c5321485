//! # dmsg
//!
//! Relay-mediated virtual circuits between endpoints identified by Ed25519
//! public keys.
//!
//! Endpoints hold long-lived TCP connections to relay servers. A dialer asks
//! a relay to open a circuit to a remote key; the relay finds the remote's
//! own connection, forwards the request and, once accepted, forwards frames
//! in both directions. Each circuit is a reliable, ordered, flow-controlled
//! byte stream.
//!
//! This crate provides:
//! - Frame encoding and decoding
//! - Circuit id allocation
//! - Flow-controlled circuits ([`Transport`])
//! - The per-relay client multiplexer ([`ClientConn`]) and endpoint ([`Client`])
//! - The relay ([`Server`])
//! - A discovery seam with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  circuit 2   ┌───────────────────┐  circuit 7   ┌──────────┐
//! │ Client A │─────────────▶│   Relay Server    │─────────────▶│ Client B │
//! │ (dialer) │◀─────────────│ relation 2 <-> 7  │◀─────────────│(responder│
//! └──────────┘     TCP      └───────────────────┘     TCP      └──────────┘
//!       │                            │                              │
//!       └────────────── Discovery (entries, relay sets) ────────────┘
//! ```
//!
//! Dialer-side circuit ids are even; ids the relay allocates on the
//! responder's connection are odd.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod client_conn;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
mod handshake;
pub mod ids;
pub mod keys;
mod link;
pub mod metrics;
pub mod server;
pub mod transport;

pub use client::Client;
pub use client_conn::ClientConn;
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use discovery::{ClientEntry, Discovery, Entry, MemoryDiscovery, ServerEntry};
pub use error::{DiscoveryError, Error, FrameError, Result};
pub use frame::{CloseReason, Frame, FrameType, MAX_FWD_DATA};
pub use ids::{IdSpace, Parity};
pub use keys::{PubKey, SecretKey, Signature};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::{RelationInfo, Server, ServerConn};
pub use transport::{Transport, TransportState};

/// Default relay listen port
pub const DEFAULT_SERVER_PORT: u16 = 8081;
