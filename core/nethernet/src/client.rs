//! Client: discovers servers and initiates one session at a time
//!
//! The client broadcasts a discovery `Request` on construction and then on a
//! fixed interval until closed. Every `Response` is surfaced as a
//! [`ClientEvent::Pong`]. [`Client::connect`] starts a handshake with the
//! server whose NetworkId was given at construction.
//!
//! All I/O is driven by [`Client::poll`]:
//!
//! ```text
//! poll(timeout)
//!   ├─ mio wait (bounded by the discovery timer)
//!   ├─ drain discovery socket ─► pongs, signals ─► session
//!   ├─ discovery timer tick   ─► Request to target
//!   └─ session.poll()         ─► signals out, Connected / Disconnect / Encapsulated
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};

use crate::config::ClientConfig;
use crate::connection::{Connection, SendStatus};
use crate::discovery::{AddressCache, DiscoveryService, DiscoveryStats, Inbound};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::signaling::{generate_id, HandshakeState, Session, SessionOutput};
use crate::timer::Interval;
use crate::transport::{PeerConnector, Role};
use crate::{ConnectionId, NetworkId};

const DISCOVERY_TOKEN: Token = Token(0);

/// Longest mio wait while a session is live; engine notifications do not
/// wake the poll
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Advertisement received from a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub sender_id: NetworkId,
    pub address: SocketAddr,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session's transport is up
    Connected(ConnectionId),
    Disconnect {
        connection_id: ConnectionId,
        reason: String,
    },
    /// One application payload from the server
    Encapsulated(Vec<u8>),
    Pong(ServerResponse),
}

pub struct Client {
    network_id: NetworkId,
    server_network_id: NetworkId,
    config: ClientConfig,
    connector: Box<dyn PeerConnector>,
    poll: Poll,
    mio_events: Events,
    discovery: Option<DiscoveryService>,
    discovery_timer: Interval,
    connection_id: ConnectionId,
    session: Option<Session>,
    /// Signals produced before the server's address was known
    pending_signals: Vec<Signal>,
    responses: HashMap<NetworkId, ServerResponse>,
    events: VecDeque<ClientEvent>,
    closed: bool,
}

impl Client {
    pub fn new(
        server_network_id: NetworkId,
        config: ClientConfig,
        connector: Box<dyn PeerConnector>,
    ) -> Result<Self> {
        let envelope = Envelope::with_seed(config.envelope_key)?;
        Self::with_envelope(server_network_id, config, connector, envelope)
    }

    /// Client using a custom envelope cipher
    pub fn with_envelope(
        server_network_id: NetworkId,
        config: ClientConfig,
        connector: Box<dyn PeerConnector>,
        envelope: Envelope,
    ) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let network_id = generate_id()?;
        let mut discovery = DiscoveryService::bind(
            config.bind_address,
            true,
            network_id,
            envelope,
            poll.registry(),
            DISCOVERY_TOKEN,
        )?;

        log::info!(
            "Client {} discovering on {} (server {})",
            network_id,
            config.target,
            server_network_id
        );
        discovery.send_request(config.target);

        Ok(Self {
            network_id,
            server_network_id,
            connector,
            poll,
            mio_events: Events::with_capacity(64),
            discovery: Some(discovery),
            discovery_timer: Interval::new(config.discovery_interval()),
            connection_id: generate_id()?,
            session: None,
            pending_signals: Vec::new(),
            responses: HashMap::new(),
            events: VecDeque::new(),
            closed: false,
            config,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    /// ConnectionId of the current (or next) session attempt
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.session
            .as_ref()
            .map_or(HandshakeState::Idle, |s| s.state())
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.session.as_mut().map(|s| s.connection_mut())
    }

    /// Latest advertisement per server
    pub fn responses(&self) -> &HashMap<NetworkId, ServerResponse> {
        &self.responses
    }

    /// Peers seen on the discovery socket; `None` once closed
    pub fn addresses(&self) -> Option<&AddressCache> {
        self.discovery.as_ref().map(|d| d.addresses())
    }

    pub fn stats(&self) -> Option<DiscoveryStats> {
        self.discovery.as_ref().map(|d| d.stats())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.discovery
            .as_ref()
            .ok_or_else(|| Error::State("client is closed".to_string()))?
            .local_addr()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::State("client is closed".to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Start a session with the server; returns its ConnectionId
    pub fn connect(&mut self) -> Result<ConnectionId> {
        self.ensure_open()?;

        match &self.session {
            Some(session) if !session.is_closed() => {
                return Err(Error::State(format!(
                    "session {} is still active",
                    session.connection_id()
                )));
            }
            // Each attempt gets its own id
            Some(_) => self.connection_id = generate_id()?,
            None => {}
        }
        self.session = None;
        self.pending_signals.clear();

        let peer = self
            .connector
            .create(Role::Client, &self.config.ice_servers)?;
        let session = Session::offer(
            self.network_id,
            self.server_network_id,
            self.connection_id,
            peer,
        )?;
        self.session = Some(session);
        self.pump_session();

        Ok(self.connection_id)
    }

    /// Send an application payload to the server
    pub fn send(&mut self, payload: &[u8]) -> Result<SendStatus> {
        self.ensure_open()?;

        let session = match self.session.as_mut() {
            Some(s) if !s.is_closed() => s,
            Some(s) => {
                return Err(Error::State(format!(
                    "session {} is closed",
                    s.connection_id()
                )))
            }
            None => return Err(Error::State("not connected".to_string())),
        };

        match session.send(payload) {
            Err(Error::Transport(msg)) => {
                let connection_id = session.connection_id();
                if let Some(SessionOutput::Closed(reason)) =
                    session.close(&format!("send failed: {}", msg))
                {
                    self.events.push_back(ClientEvent::Disconnect {
                        connection_id,
                        reason,
                    });
                }
                Err(Error::Transport(msg))
            }
            other => other,
        }
    }

    /// Send a discovery request now
    pub fn ping(&mut self) -> Result<()> {
        self.ensure_open()?;
        let target = self.config.target;
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.send_request(target);
        }
        Ok(())
    }

    /// Close the client; later calls fail with a state error
    pub fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.discovery_timer.cancel();

        if let Some(session) = self.session.as_mut() {
            let connection_id = session.connection_id();
            if let Some(SessionOutput::Closed(reason)) = session.close(reason) {
                self.events.push_back(ClientEvent::Disconnect {
                    connection_id,
                    reason,
                });
            }
        }
        self.pending_signals.clear();

        if let Some(mut discovery) = self.discovery.take() {
            if let Err(e) = discovery.deregister(self.poll.registry()) {
                log::debug!("Deregistering discovery socket failed: {}", e);
            }
        }

        log::info!("Client {} closed: {}", self.network_id, reason);
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Process I/O for up to `timeout` and return what happened.
    ///
    /// On a closed client this only drains events left by `close`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ClientEvent>> {
        if self.closed {
            return Ok(self.events.drain(..).collect());
        }

        let now = Instant::now();
        let mut wait = min_timeout(timeout, self.discovery_timer.remaining(now));
        if !self.events.is_empty() {
            wait = Some(Duration::ZERO);
        } else if self.session.as_ref().map_or(false, |s| !s.is_closed()) {
            wait = min_timeout(wait, Some(SESSION_POLL_INTERVAL));
        }

        match self.poll.poll(&mut self.mio_events, wait) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        // Drained unconditionally; recv stops at WouldBlock
        let inbound = match self.discovery.as_mut() {
            Some(discovery) => discovery.recv(),
            None => Vec::new(),
        };
        for packet in inbound {
            self.on_inbound(packet);
        }

        if self.discovery_timer.poll(Instant::now()) {
            let target = self.config.target;
            if let Some(discovery) = self.discovery.as_mut() {
                discovery.send_request(target);
            }
        }

        self.pump_session();

        Ok(self.events.drain(..).collect())
    }

    fn on_inbound(&mut self, packet: Inbound) {
        match packet {
            Inbound::Request { sender_id, .. } => {
                log::trace!("Ignoring discovery request from {}", sender_id);
            }
            Inbound::Response {
                sender_id,
                data,
                from,
            } => {
                let response = ServerResponse {
                    sender_id,
                    address: from,
                    data,
                };
                self.responses.insert(sender_id, response.clone());
                self.events.push_back(ClientEvent::Pong(response));

                if sender_id == self.server_network_id {
                    self.flush_pending_signals();
                }
            }
            Inbound::Signal { signal, from } => {
                if signal.network_id != Some(self.server_network_id) {
                    log::debug!(
                        "Signal from {:?} at {} is not from our server",
                        signal.network_id,
                        from
                    );
                    return;
                }

                let session = match self.session.as_mut() {
                    Some(s) if s.connection_id() == signal.connection_id => s,
                    _ => {
                        log::debug!(
                            "{} for unknown session {}",
                            signal.signal_type,
                            signal.connection_id
                        );
                        return;
                    }
                };

                match session.handle_signal(&signal) {
                    Ok(Some(output)) => {
                        let connection_id = session.connection_id();
                        self.on_session_output(connection_id, output);
                    }
                    Ok(None) => {}
                    Err(e) => log::debug!("Signal {} rejected: {}", signal.signal_type, e),
                }
            }
        }
    }

    fn pump_session(&mut self) {
        let (connection_id, outputs) = match self.session.as_mut() {
            Some(session) => (session.connection_id(), session.poll()),
            None => return,
        };
        for output in outputs {
            self.on_session_output(connection_id, output);
        }
    }

    fn on_session_output(&mut self, connection_id: ConnectionId, output: SessionOutput) {
        match output {
            SessionOutput::Signal(signal) => self.send_signal(signal),
            SessionOutput::Connected => {
                log::info!("Session {} connected", connection_id);
                self.events.push_back(ClientEvent::Connected(connection_id));
            }
            SessionOutput::Closed(reason) => {
                self.pending_signals.clear();
                self.events.push_back(ClientEvent::Disconnect {
                    connection_id,
                    reason,
                });
            }
            SessionOutput::Message(payload) => {
                self.events.push_back(ClientEvent::Encapsulated(payload));
            }
        }
    }

    fn send_signal(&mut self, signal: Signal) {
        let discovery = match self.discovery.as_mut() {
            Some(d) => d,
            None => return,
        };

        if discovery.addresses().get(self.server_network_id).is_some() {
            discovery.send_signal(self.server_network_id, &signal);
        } else {
            log::debug!(
                "Server {} not discovered yet, holding {}",
                self.server_network_id,
                signal.signal_type
            );
            self.pending_signals.push(signal);
        }
    }

    fn flush_pending_signals(&mut self) {
        if self.pending_signals.is_empty() {
            return;
        }
        log::debug!("Sending {} held signals", self.pending_signals.len());
        for signal in std::mem::take(&mut self.pending_signals) {
            self.send_signal(signal);
        }
    }
}

fn min_timeout(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close("client dropped");
    }
}
