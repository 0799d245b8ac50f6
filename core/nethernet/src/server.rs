//! Server: answers discovery and accepts sessions
//!
//! ```text
//!                 ┌──────────────────────── Server ─────────────────────────┐
//!  Request ──────►│ advertisement set? ──► Response (else ignored)          │
//!  ConnectRequest►│ connector.create ─► Session::answer ─► sessions[cid]    │
//!  CandidateAdd ─►│ sessions[cid].handle_signal                             │
//!                 │ sessions[*].poll ─► OpenConnection / CloseConnection /  │
//!                 │                     Encapsulated                        │
//!                 └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Many sessions may be live at once, keyed by ConnectionId. A failure in
//! one session closes only that session.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::{Events, Poll, Token};

use crate::config::ServerConfig;
use crate::connection::{Connection, SendStatus};
use crate::discovery::{AddressCache, DiscoveryService, DiscoveryStats, Inbound};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::signal::{ConnectErrorCode, Signal, SignalType};
use crate::signaling::{generate_id, Session, SessionOutput};
use crate::transport::{PeerConnector, Role};
use crate::{ConnectionId, NetworkId};

const DISCOVERY_TOKEN: Token = Token(0);

/// Longest mio wait while sessions are live
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A session's transport is up
    OpenConnection(ConnectionId),
    CloseConnection {
        connection_id: ConnectionId,
        reason: String,
    },
    /// One application payload from a client
    Encapsulated {
        payload: Vec<u8>,
        connection_id: ConnectionId,
    },
    /// The server itself closed
    Close(String),
}

/// A session and where its client's signals come from
struct PeerSession {
    session: Session,
    addr: SocketAddr,
}

pub struct Server {
    network_id: NetworkId,
    config: ServerConfig,
    connector: Box<dyn PeerConnector>,
    poll: Poll,
    mio_events: Events,
    /// Consumed by `listen`
    envelope: Option<Envelope>,
    discovery: Option<DiscoveryService>,
    advertisement: Option<Vec<u8>>,
    sessions: HashMap<ConnectionId, PeerSession>,
    events: VecDeque<ServerEvent>,
    closed: bool,
}

impl Server {
    pub fn new(config: ServerConfig, connector: Box<dyn PeerConnector>) -> Result<Self> {
        let envelope = Envelope::with_seed(config.envelope_key)?;
        Self::with_envelope(config, connector, envelope)
    }

    /// Server using a custom envelope cipher
    pub fn with_envelope(
        config: ServerConfig,
        connector: Box<dyn PeerConnector>,
        envelope: Envelope,
    ) -> Result<Self> {
        config.validate()?;

        let network_id = match config.network_id {
            Some(id) => id,
            None => generate_id()?,
        };

        Ok(Self {
            network_id,
            config,
            connector,
            poll: Poll::new()?,
            mio_events: Events::with_capacity(256),
            envelope: Some(envelope),
            discovery: None,
            advertisement: None,
            sessions: HashMap::new(),
            events: VecDeque::new(),
            closed: false,
        })
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    /// Bytes returned in every discovery `Response`
    pub fn set_advertisement(&mut self, data: impl Into<Vec<u8>>) {
        self.advertisement = Some(data.into());
    }

    /// Bind the discovery socket; returns the bound address
    pub fn listen(&mut self) -> Result<SocketAddr> {
        if self.closed {
            return Err(Error::State("server is closed".to_string()));
        }
        if self.discovery.is_some() {
            return Err(Error::State("server is already listening".to_string()));
        }
        let envelope = self
            .envelope
            .take()
            .ok_or_else(|| Error::State("envelope already consumed".to_string()))?;

        let discovery = DiscoveryService::bind(
            self.config.listen_addr(),
            true,
            self.network_id,
            envelope,
            self.poll.registry(),
            DISCOVERY_TOKEN,
        )?;
        let addr = discovery.local_addr()?;
        self.discovery = Some(discovery);

        log::info!("Server {} listening on {}", self.network_id, addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.discovery
            .as_ref()
            .ok_or_else(|| Error::State("server is not listening".to_string()))?
            .local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn addresses(&self) -> Option<&AddressCache> {
        self.discovery.as_ref().map(|d| d.addresses())
    }

    pub fn stats(&self) -> Option<DiscoveryStats> {
        self.discovery.as_ref().map(|d| d.stats())
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn connection_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Connection> {
        self.sessions
            .get_mut(&connection_id)
            .map(|p| p.session.connection_mut())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Send an application payload to one client
    pub fn send(&mut self, connection_id: ConnectionId, payload: &[u8]) -> Result<SendStatus> {
        if self.closed {
            return Err(Error::State("server is closed".to_string()));
        }
        let peer = self
            .sessions
            .get_mut(&connection_id)
            .ok_or_else(|| Error::State(format!("no connection {}", connection_id)))?;

        match peer.session.send(payload) {
            Err(Error::Transport(msg)) => {
                self.end_session(connection_id, &format!("send failed: {}", msg));
                Err(Error::Transport(msg))
            }
            other => other,
        }
    }

    /// Close one connection (kick); its client sees a disconnect
    pub fn close_connection(&mut self, connection_id: ConnectionId, reason: &str) -> Result<()> {
        if !self.sessions.contains_key(&connection_id) {
            return Err(Error::State(format!("no connection {}", connection_id)));
        }
        self.end_session(connection_id, reason);
        Ok(())
    }

    /// Close every connection and the discovery socket
    pub fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let ids: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.end_session(id, reason);
        }

        if let Some(mut discovery) = self.discovery.take() {
            if let Err(e) = discovery.deregister(self.poll.registry()) {
                log::debug!("Deregistering discovery socket failed: {}", e);
            }
        }

        self.events.push_back(ServerEvent::Close(reason.to_string()));
        log::info!("Server {} closed: {}", self.network_id, reason);
    }

    fn end_session(&mut self, connection_id: ConnectionId, reason: &str) {
        if let Some(mut peer) = self.sessions.remove(&connection_id) {
            if let Some(SessionOutput::Closed(reason)) = peer.session.close(reason) {
                self.events.push_back(ServerEvent::CloseConnection {
                    connection_id,
                    reason,
                });
            }
        }
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Process I/O for up to `timeout` and return what happened.
    ///
    /// On a closed server this only drains events left by `close`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ServerEvent>> {
        if self.closed {
            return Ok(self.events.drain(..).collect());
        }
        if self.discovery.is_none() {
            return Err(Error::State("server is not listening".to_string()));
        }

        let wait = if !self.events.is_empty() {
            Some(Duration::ZERO)
        } else if !self.sessions.is_empty() {
            Some(timeout.map_or(SESSION_POLL_INTERVAL, |t| t.min(SESSION_POLL_INTERVAL)))
        } else {
            timeout
        };

        match self.poll.poll(&mut self.mio_events, wait) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let inbound = match self.discovery.as_mut() {
            Some(discovery) => discovery.recv(),
            None => Vec::new(),
        };
        for packet in inbound {
            self.on_inbound(packet);
        }

        self.pump_sessions();

        Ok(self.events.drain(..).collect())
    }

    fn on_inbound(&mut self, packet: Inbound) {
        match packet {
            Inbound::Request { sender_id, from } => {
                let discovery = match self.discovery.as_mut() {
                    Some(d) => d,
                    None => return,
                };
                match &self.advertisement {
                    Some(data) => {
                        discovery.send_response(data, from);
                    }
                    None => log::debug!(
                        "No advertisement set, request from {} ({}) not answered",
                        sender_id,
                        from
                    ),
                }
            }
            Inbound::Response { sender_id, .. } => {
                log::trace!("Ignoring discovery response from {}", sender_id);
            }
            Inbound::Signal { signal, from } => self.on_signal(signal, from),
        }
    }

    fn on_signal(&mut self, signal: Signal, from: SocketAddr) {
        let connection_id = signal.connection_id;

        if let Some(peer) = self.sessions.get_mut(&connection_id) {
            if Some(peer.session.remote_network_id()) != signal.network_id {
                log::debug!(
                    "Signal for session {} from wrong peer {:?}",
                    connection_id,
                    signal.network_id
                );
                return;
            }
            peer.addr = from;
            match peer.session.handle_signal(&signal) {
                Ok(Some(SessionOutput::Closed(reason))) => {
                    self.sessions.remove(&connection_id);
                    self.events.push_back(ServerEvent::CloseConnection {
                        connection_id,
                        reason,
                    });
                }
                Ok(_) => {}
                Err(e) => log::debug!("Signal {} rejected: {}", signal.signal_type, e),
            }
            return;
        }

        if signal.signal_type != SignalType::ConnectRequest {
            log::debug!(
                "{} for unknown session {} dropped",
                signal.signal_type,
                connection_id
            );
            return;
        }

        match self.accept(&signal) {
            Ok(session) => {
                self.sessions
                    .insert(connection_id, PeerSession { session, addr: from });
            }
            Err((code, e)) => {
                log::warn!("Refusing session {} from {}: {}", connection_id, from, e);
                let sender = signal.network_id.unwrap_or_default();
                let reply = Signal::connect_error(connection_id, code, Some(sender));
                if let Some(discovery) = self.discovery.as_mut() {
                    discovery.send_signal_to(sender, &reply, from);
                }
            }
        }
    }

    fn accept(&mut self, offer: &Signal) -> std::result::Result<Session, (ConnectErrorCode, Error)> {
        let peer = self
            .connector
            .create(Role::Server, &self.config.ice_servers)
            .map_err(|e| (ConnectErrorCode::TransportUnavailable, e))?;
        Session::answer(self.network_id, offer, peer)
            .map_err(|e| (ConnectErrorCode::NegotiationFailed, e))
    }

    fn pump_sessions(&mut self) {
        let mut ended = Vec::new();

        for (&connection_id, peer) in self.sessions.iter_mut() {
            for output in peer.session.poll() {
                match output {
                    SessionOutput::Signal(signal) => {
                        if let Some(discovery) = self.discovery.as_mut() {
                            discovery.send_signal_to(
                                peer.session.remote_network_id(),
                                &signal,
                                peer.addr,
                            );
                        }
                    }
                    SessionOutput::Connected => {
                        log::info!("Session {} connected", connection_id);
                        self.events
                            .push_back(ServerEvent::OpenConnection(connection_id));
                    }
                    SessionOutput::Message(payload) => {
                        self.events.push_back(ServerEvent::Encapsulated {
                            payload,
                            connection_id,
                        });
                    }
                    SessionOutput::Closed(reason) => {
                        self.events.push_back(ServerEvent::CloseConnection {
                            connection_id,
                            reason,
                        });
                        ended.push(connection_id);
                    }
                }
            }
        }

        for id in ended {
            self.sessions.remove(&id);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close("server dropped");
    }
}
