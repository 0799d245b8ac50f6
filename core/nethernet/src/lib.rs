//! NetherNet discovery, signaling and session framing
//!
//! This crate lets a client find servers on the local network, negotiate a
//! peer-to-peer session with one of them and exchange ordered application
//! messages over it:
//! - Sealed discovery packets (checksum + encryption) on UDP port 7551
//! - Schema-driven packet codec (Request / Response / Message)
//! - Text-encoded handshake signals carried in Message packets
//! - Per-session queueing, segmentation and reassembly
//!
//! # Architecture
//!
//! ```text
//!   Client / Server  ──────── poll(timeout) ─────────► ClientEvent / ServerEvent
//!        │
//!        ├── DiscoveryService ── Envelope ── PacketCodec ── UDP (mio)
//!        │        │
//!        │        └── Signal ──► Session (handshake state machine)
//!        │                           │
//!        └───────────────────────────┴── Connection ── framing ── DataChannel
//!                                            │
//!                                      PeerConnection (engine, pluggable)
//! ```
//!
//! The peer-connection engine is abstracted by [`transport::PeerConnector`];
//! [`loopback::LoopbackNetwork`] is an in-process engine for tests and demos.

// ============================================================================
// Modules
// ============================================================================

pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod loopback;
pub mod packet;
pub mod schema;
pub mod server;
pub mod signal;
pub mod signaling;
pub mod timer;
pub mod transport;

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of one client or server instance
pub type NetworkId = u64;

/// Identity of one session attempt
pub type ConnectionId = u64;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{Client, ClientEvent, ServerResponse};
pub use config::{ClientConfig, ServerConfig, DEFAULT_PORT};
pub use connection::{Connection, SendStatus};
pub use envelope::{Envelope, EnvelopeCipher, RingCipher};
pub use error::{Error, Result};
pub use loopback::LoopbackNetwork;
pub use server::{Server, ServerEvent};
pub use signal::{Signal, SignalType};
pub use transport::{NoTransport, PeerConnector};
