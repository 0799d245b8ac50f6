//! Peer-connection engine interface
//!
//! The engine that negotiates addresses, secures the transport and delivers
//! channel data is external. This module defines the seam: a factory
//! ([`PeerConnector`]), a per-session handle ([`PeerConnection`]), channel
//! handles ([`DataChannel`]) and the closed set of notifications a handle
//! delivers ([`PeerEvent`]).
//!
//! Notifications are pulled from the handle in order with
//! [`PeerConnection::poll_event`], so all state changes are applied by the
//! owner's single loop.

use std::fmt;

use crate::error::{Error, Result};

/// Label of the ordered, retransmitting channel
pub const RELIABLE_CHANNEL_LABEL: &str = "ReliableDataChannel";

/// Label of the unordered, lossy channel
pub const UNRELIABLE_CHANNEL_LABEL: &str = "UnreliableDataChannel";

/// Media stream id used when applying remote candidates
pub const DEFAULT_CANDIDATE_MID: &str = "0";

// ============================================================================
// Enums
// ============================================================================

/// Which side of the handshake a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiates sessions (produces the offer)
    Client,
    /// Accepts sessions (produces the answer)
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Kind of a remote session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Transport state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the session cannot carry data
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The two channel roles, matched by label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Reliable,
    Unreliable,
}

impl ChannelKind {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            RELIABLE_CHANNEL_LABEL => Some(ChannelKind::Reliable),
            UNRELIABLE_CHANNEL_LABEL => Some(ChannelKind::Unreliable),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Reliable => RELIABLE_CHANNEL_LABEL,
            ChannelKind::Unreliable => UNRELIABLE_CHANNEL_LABEL,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Notifications delivered by a peer-connection handle
pub enum PeerEvent {
    /// A local session description is ready to send to the peer
    LocalDescription(String),
    /// A local ICE candidate is ready to send to the peer
    LocalCandidate(String),
    /// Transport state changed
    StateChanged(PeerState),
    /// The remote side opened a channel (answering side)
    DataChannel(Box<dyn DataChannel>),
    /// A channel with this label became writable
    ChannelOpen(String),
    /// A channel with this label closed
    ChannelClosed(String),
    /// One message arrived on the labelled channel
    Message { label: String, data: Vec<u8> },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalDescription(d) => write!(f, "LocalDescription({} bytes)", d.len()),
            PeerEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c),
            PeerEvent::StateChanged(s) => write!(f, "StateChanged({})", s),
            PeerEvent::DataChannel(ch) => write!(f, "DataChannel({})", ch.label()),
            PeerEvent::ChannelOpen(l) => write!(f, "ChannelOpen({})", l),
            PeerEvent::ChannelClosed(l) => write!(f, "ChannelClosed({})", l),
            PeerEvent::Message { label, data } => {
                write!(f, "Message({}, {} bytes)", label, data.len())
            }
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A data channel of an established session
pub trait DataChannel: Send {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Largest message the channel accepts in one `send`
    fn max_message_size(&self) -> usize;

    /// Send one message; messages above `max_message_size` are rejected
    fn send(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self);
}

/// One peer-connection handle (one per session)
pub trait PeerConnection: Send {
    fn set_remote_description(&mut self, description: &str, kind: DescriptionKind) -> Result<()>;

    fn add_remote_candidate(&mut self, candidate: &str, mid: &str) -> Result<()>;

    /// Create a locally initiated channel (offering side)
    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>>;

    /// Next pending notification, in the order the engine produced them
    fn poll_event(&mut self) -> Option<PeerEvent>;

    /// Tear down the session; idempotent
    fn close(&mut self);
}

/// Factory for peer-connection handles
pub trait PeerConnector: Send {
    fn create(&mut self, role: Role, ice_servers: &[String]) -> Result<Box<dyn PeerConnection>>;
}

/// Connector for processes that only answer discovery.
///
/// Every session attempt is refused, which a server reports back to the
/// requester as a `ConnectError` signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl PeerConnector for NoTransport {
    fn create(&mut self, role: Role, _ice_servers: &[String]) -> Result<Box<dyn PeerConnection>> {
        Err(Error::Transport(format!(
            "no peer-connection engine configured ({} role)",
            role
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_from_label() {
        assert_eq!(
            ChannelKind::from_label(RELIABLE_CHANNEL_LABEL),
            Some(ChannelKind::Reliable)
        );
        assert_eq!(
            ChannelKind::from_label(UNRELIABLE_CHANNEL_LABEL),
            Some(ChannelKind::Unreliable)
        );
        assert_eq!(ChannelKind::from_label("chat"), None);
        assert_eq!(ChannelKind::Reliable.label(), RELIABLE_CHANNEL_LABEL);
    }

    #[test]
    fn test_terminal_states() {
        assert!(PeerState::Closed.is_terminal());
        assert!(PeerState::Failed.is_terminal());
        assert!(PeerState::Disconnected.is_terminal());
        assert!(!PeerState::Connected.is_terminal());
        assert!(!PeerState::Connecting.is_terminal());
    }

    #[test]
    fn test_no_transport_refuses() {
        let mut connector = NoTransport;
        assert!(matches!(
            connector.create(Role::Server, &[]),
            Err(Error::Transport(_))
        ));
    }
}
