//! Per-session signaling state machine
//!
//! # States
//!
//! ```text
//!  Idle ──► OfferExchanging ──► AnswerExchanging ──► IceExchanging ──► Connected
//!    │             │                   │                   │               │
//!    └─────────────┴───────────────────┴───────────────────┴───────────────┴──► Closed
//! ```
//!
//! A [`Session`] couples one [`Connection`] with the handshake around it.
//! Inbound signals are applied with [`Session::handle_signal`]; engine
//! notifications are pulled in order by [`Session::poll`], which turns them
//! into signals to send, lifecycle changes and application payloads.

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};

use crate::connection::{Connection, SendStatus};
use crate::error::{Error, Result};
use crate::signal::{rewrite_session_origin, ConnectErrorCode, Signal, SignalType};
use crate::transport::{
    DescriptionKind, PeerConnection, PeerEvent, PeerState, Role, DEFAULT_CANDIDATE_MID,
    RELIABLE_CHANNEL_LABEL, UNRELIABLE_CHANNEL_LABEL,
};
use crate::{ConnectionId, NetworkId};

/// Random nonzero 64-bit identifier
pub fn generate_id() -> Result<u64> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 8];
    loop {
        rng.fill(&mut bytes)
            .map_err(|_| Error::Transport("system random source unavailable".to_string()))?;
        let id = u64::from_le_bytes(bytes);
        if id != 0 {
            return Ok(id);
        }
    }
}

// ============================================================================
// States and Outputs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    OfferExchanging,
    AnswerExchanging,
    IceExchanging,
    Connected,
    Closed,
}

impl HandshakeState {
    fn is_negotiating(&self) -> bool {
        matches!(
            self,
            HandshakeState::OfferExchanging | HandshakeState::AnswerExchanging
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::OfferExchanging => "offer-exchanging",
            HandshakeState::AnswerExchanging => "answer-exchanging",
            HandshakeState::IceExchanging => "ice-exchanging",
            HandshakeState::Connected => "connected",
            HandshakeState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a session asks its owner to do or report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// Send to the remote peer; `network_id` is the recipient
    Signal(Signal),
    /// Transport reported connected
    Connected,
    /// Session ended (reported once)
    Closed(String),
    /// A complete application payload
    Message(Vec<u8>),
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    role: Role,
    local_id: NetworkId,
    remote_network_id: NetworkId,
    connection_id: ConnectionId,
    state: HandshakeState,
    connection: Connection,
}

impl Session {
    /// Start a session as the offering (client) side.
    ///
    /// Both channels are created up front; the engine then produces the
    /// offer description, picked up by [`Session::poll`].
    pub fn offer(
        local_id: NetworkId,
        remote_network_id: NetworkId,
        connection_id: ConnectionId,
        peer: Box<dyn PeerConnection>,
    ) -> Result<Self> {
        let mut connection = Connection::new(Role::Client, connection_id, peer);
        let reliable = connection
            .peer_mut()
            .create_data_channel(RELIABLE_CHANNEL_LABEL)?;
        let unreliable = connection
            .peer_mut()
            .create_data_channel(UNRELIABLE_CHANNEL_LABEL)?;
        connection.set_channels(Some(reliable), Some(unreliable))?;

        log::info!(
            "Session {}: offering to server {}",
            connection_id,
            remote_network_id
        );

        Ok(Self {
            role: Role::Client,
            local_id,
            remote_network_id,
            connection_id,
            state: HandshakeState::OfferExchanging,
            connection,
        })
    }

    /// Accept a `ConnectRequest` as the answering (server) side
    pub fn answer(
        local_id: NetworkId,
        offer: &Signal,
        peer: Box<dyn PeerConnection>,
    ) -> Result<Self> {
        if offer.signal_type != SignalType::ConnectRequest {
            return Err(Error::Protocol(format!(
                "cannot answer a {} signal",
                offer.signal_type
            )));
        }
        let remote_network_id = offer
            .network_id
            .ok_or_else(|| Error::Protocol("offer carries no sender".to_string()))?;

        let mut connection = Connection::new(Role::Server, offer.connection_id, peer);
        connection
            .peer_mut()
            .set_remote_description(&offer.data, DescriptionKind::Offer)?;

        log::info!(
            "Session {}: answering client {}",
            offer.connection_id,
            remote_network_id
        );

        Ok(Self {
            role: Role::Server,
            local_id,
            remote_network_id,
            connection_id: offer.connection_id,
            state: HandshakeState::AnswerExchanging,
            connection,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn remote_network_id(&self) -> NetworkId {
        self.remote_network_id
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandshakeState::Closed
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    // ========================================================================
    // Inbound Signals
    // ========================================================================

    /// Apply one signal from the remote peer.
    ///
    /// A transport failure closes the session and is reported as
    /// [`SessionOutput::Closed`]; other errors are returned for logging.
    pub fn handle_signal(&mut self, signal: &Signal) -> Result<Option<SessionOutput>> {
        if self.is_closed() {
            return Ok(None);
        }

        match self.apply_signal(signal) {
            Ok(output) => Ok(output),
            Err(Error::Transport(msg)) => Ok(self.close(&format!("transport error: {}", msg))),
            Err(e) => Err(e),
        }
    }

    fn apply_signal(&mut self, signal: &Signal) -> Result<Option<SessionOutput>> {
        match (signal.signal_type, self.role) {
            (SignalType::ConnectRequest, Role::Server) => {
                log::debug!("Session {}: duplicate connect request", self.connection_id);
                Ok(None)
            }
            (SignalType::ConnectResponse, Role::Client) => {
                self.connection
                    .peer_mut()
                    .set_remote_description(&signal.data, DescriptionKind::Answer)?;
                if self.state == HandshakeState::OfferExchanging {
                    self.transition(HandshakeState::AnswerExchanging);
                }
                Ok(None)
            }
            (SignalType::CandidateAdd, _) => {
                self.connection
                    .peer_mut()
                    .add_remote_candidate(&signal.data, DEFAULT_CANDIDATE_MID)?;
                if self.state.is_negotiating() {
                    self.transition(HandshakeState::IceExchanging);
                }
                Ok(None)
            }
            (SignalType::ConnectError, _) => {
                let code = ConnectErrorCode::parse(&signal.data);
                log::warn!("Session {}: remote refused: {}", self.connection_id, code);
                Ok(self.close(&format!("connect error: {}", code)))
            }
            (signal_type, role) => Err(Error::Protocol(format!(
                "{} is not valid for the {} side",
                signal_type, role
            ))),
        }
    }

    // ========================================================================
    // Engine Notifications
    // ========================================================================

    /// Drain engine notifications in order
    pub fn poll(&mut self) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();

        // Closed directly through connection_mut()
        if self.connection.is_closed() && !self.is_closed() {
            outputs.extend(self.close("connection closed"));
        }

        while let Some(event) = self.connection.next_peer_event() {
            if self.is_closed() {
                log::trace!("Session {}: late {:?}", self.connection_id, event);
                continue;
            }
            self.on_peer_event(event, &mut outputs);
        }

        outputs
    }

    fn on_peer_event(&mut self, event: PeerEvent, outputs: &mut Vec<SessionOutput>) {
        match event {
            PeerEvent::LocalDescription(description) => {
                let signal_type = match self.role {
                    Role::Client => SignalType::ConnectRequest,
                    Role::Server => SignalType::ConnectResponse,
                };
                let data = rewrite_session_origin(&description, self.local_id);
                outputs.push(self.outbound(signal_type, data));
            }
            PeerEvent::LocalCandidate(candidate) => {
                outputs.push(self.outbound(SignalType::CandidateAdd, candidate));
            }
            PeerEvent::StateChanged(PeerState::Connected) => {
                if self.state != HandshakeState::Connected {
                    self.transition(HandshakeState::Connected);
                    outputs.push(SessionOutput::Connected);
                }
            }
            PeerEvent::StateChanged(state) if state.is_terminal() => {
                outputs.extend(self.close(&format!("transport {}", state)));
            }
            PeerEvent::StateChanged(state) => {
                log::trace!("Session {}: transport {}", self.connection_id, state);
            }
            PeerEvent::DataChannel(channel) => {
                if let Err(e) = self.connection.attach_channel(channel) {
                    log::warn!("Session {}: {}", self.connection_id, e);
                }
            }
            PeerEvent::ChannelOpen(label) => {
                if let Err(e) = self.connection.on_channel_open(&label) {
                    outputs.extend(self.close(&format!("flush on {} failed: {}", label, e)));
                }
            }
            PeerEvent::ChannelClosed(label) => self.connection.on_channel_closed(&label),
            PeerEvent::Message { label, data } => match self.connection.handle_message(&label, &data) {
                Ok(Some(payload)) => outputs.push(SessionOutput::Message(payload)),
                Ok(None) => {}
                Err(e) => log::debug!("Session {}: dropped message: {}", self.connection_id, e),
            },
        }
    }

    fn outbound(&self, signal_type: SignalType, data: String) -> SessionOutput {
        SessionOutput::Signal(Signal::new(
            signal_type,
            self.connection_id,
            data,
            Some(self.remote_network_id),
        ))
    }

    fn transition(&mut self, next: HandshakeState) {
        log::debug!(
            "Session {}: {} -> {}",
            self.connection_id,
            self.state,
            next
        );
        self.state = next;
    }

    // ========================================================================
    // Outbound Data and Teardown
    // ========================================================================

    /// Send an application payload on the reliable channel
    pub fn send(&mut self, payload: &[u8]) -> Result<SendStatus> {
        if self.is_closed() {
            return Err(Error::State(format!(
                "session {} is closed",
                self.connection_id
            )));
        }
        self.connection.send(payload)
    }

    /// Close the session; returns the closure to report, once
    pub fn close(&mut self, reason: &str) -> Option<SessionOutput> {
        if self.is_closed() {
            return None;
        }
        self.transition(HandshakeState::Closed);
        self.connection.close();
        log::info!("Session {} closed: {}", self.connection_id, reason);
        Some(SessionOutput::Closed(reason.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
