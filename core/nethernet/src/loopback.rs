//! In-process peer-connection engine
//!
//! Pairs offers and answers through a shared hub so a client and a server in
//! the same process (or in threads of it) can complete the full handshake
//! without a real network transport. Descriptions carry an
//! `a=loopback-peer:<id>` attribute that the answering side uses to find the
//! offering handle.
//!
//! # Handshake
//!
//! ```text
//! offerer                         hub                         answerer
//!   │ create_data_channel ──────►  │                              │
//!   │ ◄── LocalDescription(offer)  │                              │
//!   │                              │ ◄──── set_remote(offer) ──── │
//!   │                              │  LocalDescription(answer) ──►│
//!   │ set_remote(answer) ───────►  │                              │
//!   │ ◄── Connected, ChannelOpen   │  Connected, DataChannel ───► │
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::transport::{
    DataChannel, DescriptionKind, PeerConnection, PeerConnector, PeerEvent, PeerState, Role,
};

/// Default channel message limit
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

const PEER_ATTRIBUTE: &str = "a=loopback-peer:";

// ============================================================================
// Hub
// ============================================================================

struct Slot {
    role: Role,
    state: PeerState,
    remote: Option<u64>,
    events: VecDeque<PeerEvent>,
    local_channels: Vec<String>,
    described: bool,
    remote_candidates: usize,
}

impl Slot {
    fn new(role: Role) -> Self {
        Self {
            role,
            state: PeerState::New,
            remote: None,
            events: VecDeque::new(),
            local_channels: Vec::new(),
            described: false,
            remote_candidates: 0,
        }
    }
}

struct Hub {
    next_id: u64,
    max_message_size: usize,
    peers: HashMap<u64, Slot>,
}

impl Hub {
    fn push(&mut self, id: u64, event: PeerEvent) {
        if let Some(slot) = self.peers.get_mut(&id) {
            slot.events.push_back(event);
        }
    }

    fn state(&self, id: u64) -> Option<PeerState> {
        self.peers.get(&id).map(|s| s.state)
    }

    fn set_state(&mut self, id: u64, state: PeerState) {
        if let Some(slot) = self.peers.get_mut(&id) {
            slot.state = state;
            slot.events.push_back(PeerEvent::StateChanged(state));
        }
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn description(id: u64, role: Role) -> String {
    let kind = match role {
        Role::Client => "offer",
        Role::Server => "answer",
    };
    format!(
        "v=0\r\no=rtc {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=loopback-{}\r\n{}{}\r\n",
        1_000_000 + id,
        kind,
        PEER_ATTRIBUTE,
        id
    )
}

fn candidate(id: u64) -> String {
    format!(
        "candidate:1 1 UDP 2122317823 127.0.0.1 {} typ host",
        40_000 + (id % 20_000)
    )
}

fn parse_peer_id(description: &str) -> Option<u64> {
    description
        .lines()
        .find_map(|line| line.trim_end().strip_prefix(PEER_ATTRIBUTE))
        .and_then(|id| id.parse().ok())
}

// ============================================================================
// Network (connector)
// ============================================================================

/// Shared in-process network; clones refer to the same hub
#[derive(Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Network whose channels reject messages above `max_message_size`
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                next_id: 1,
                max_message_size,
                peers: HashMap::new(),
            })),
        }
    }

    /// Handles that have not been closed
    pub fn open_peers(&self) -> usize {
        lock(&self.hub)
            .peers
            .values()
            .filter(|s| s.state != PeerState::Closed)
            .count()
    }
}

impl LoopbackNetwork {
    /// Handles still alive, closed or not; a slot goes away when its handle drops
    pub fn tracked_peers(&self) -> usize {
        lock(&self.hub).peers.len()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnector for LoopbackNetwork {
    fn create(&mut self, role: Role, ice_servers: &[String]) -> Result<Box<dyn PeerConnection>> {
        let mut hub = lock(&self.hub);
        let id = hub.next_id;
        hub.next_id += 1;
        hub.peers.insert(id, Slot::new(role));

        log::trace!(
            "loopback: created {} peer {} ({} ice servers ignored)",
            role,
            id,
            ice_servers.len()
        );

        Ok(Box::new(LoopbackPeer {
            id,
            hub: Arc::clone(&self.hub),
        }))
    }
}

// ============================================================================
// Peer Handle
// ============================================================================

struct LoopbackPeer {
    id: u64,
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackPeer {
    fn channel(&self, label: &str) -> Box<dyn DataChannel> {
        Box::new(LoopbackChannel {
            peer: self.id,
            label: label.to_string(),
            hub: Arc::clone(&self.hub),
            closed: false,
        })
    }

    /// Link an offerer (self) to the answerer that accepted it
    fn establish(&self, hub: &mut Hub, answerer: u64) {
        let labels = hub
            .peers
            .get(&self.id)
            .map(|s| s.local_channels.clone())
            .unwrap_or_default();

        hub.set_state(self.id, PeerState::Connected);
        hub.set_state(answerer, PeerState::Connected);

        for label in labels {
            let remote_channel: Box<dyn DataChannel> = Box::new(LoopbackChannel {
                peer: answerer,
                label: label.clone(),
                hub: Arc::clone(&self.hub),
                closed: false,
            });
            hub.push(answerer, PeerEvent::DataChannel(remote_channel));
            hub.push(answerer, PeerEvent::ChannelOpen(label.clone()));
            hub.push(self.id, PeerEvent::ChannelOpen(label));
        }

        log::debug!("loopback: peers {} and {} connected", self.id, answerer);
    }
}

impl PeerConnection for LoopbackPeer {
    fn set_remote_description(&mut self, remote: &str, kind: DescriptionKind) -> Result<()> {
        let remote_id = parse_peer_id(remote).ok_or_else(|| {
            Error::Transport("description does not name a loopback peer".to_string())
        })?;

        let mut hub = lock(&self.hub);
        match hub.state(self.id) {
            Some(PeerState::New) | Some(PeerState::Connecting) => {}
            Some(state) => {
                return Err(Error::Transport(format!(
                    "cannot apply remote description in state {}",
                    state
                )))
            }
            None => return Err(Error::Transport("unknown loopback peer".to_string())),
        }

        match kind {
            DescriptionKind::Offer => {
                if hub.state(remote_id).map_or(true, |s| s.is_terminal()) {
                    return Err(Error::Transport(format!(
                        "offering peer {} is gone",
                        remote_id
                    )));
                }
                if let Some(slot) = hub.peers.get_mut(&self.id) {
                    slot.remote = Some(remote_id);
                    slot.described = true;
                }
                hub.set_state(self.id, PeerState::Connecting);
                hub.push(
                    self.id,
                    PeerEvent::LocalDescription(description(self.id, Role::Server)),
                );
                hub.push(self.id, PeerEvent::LocalCandidate(candidate(self.id)));
            }
            DescriptionKind::Answer => {
                let accepted = hub
                    .peers
                    .get(&remote_id)
                    .map_or(false, |s| s.remote == Some(self.id) && !s.state.is_terminal());
                if !accepted {
                    return Err(Error::Transport(format!(
                        "answer from peer {} does not match this offer",
                        remote_id
                    )));
                }
                if let Some(slot) = hub.peers.get_mut(&self.id) {
                    slot.remote = Some(remote_id);
                }
                self.establish(&mut hub, remote_id);
            }
        }

        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str, mid: &str) -> Result<()> {
        if !candidate.starts_with("candidate:") {
            return Err(Error::Transport(format!("malformed candidate {:?}", candidate)));
        }

        let mut hub = lock(&self.hub);
        let slot = hub
            .peers
            .get_mut(&self.id)
            .ok_or_else(|| Error::Transport("unknown loopback peer".to_string()))?;
        if slot.state == PeerState::Closed {
            return Err(Error::Transport("peer connection is closed".to_string()));
        }
        slot.remote_candidates += 1;

        log::trace!("loopback: peer {} got candidate (mid {})", self.id, mid);
        Ok(())
    }

    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>> {
        let mut hub = lock(&self.hub);
        let slot = hub
            .peers
            .get_mut(&self.id)
            .ok_or_else(|| Error::Transport("unknown loopback peer".to_string()))?;

        if slot.state.is_terminal() {
            return Err(Error::Transport("peer connection is closed".to_string()));
        }

        slot.local_channels.push(label.to_string());

        if slot.role == Role::Client && !slot.described {
            slot.described = true;
            slot.state = PeerState::Connecting;
            slot.events
                .push_back(PeerEvent::LocalDescription(description(self.id, Role::Client)));
            slot.events.push_back(PeerEvent::LocalCandidate(candidate(self.id)));
        }

        Ok(self.channel(label))
    }

    fn poll_event(&mut self) -> Option<PeerEvent> {
        lock(&self.hub)
            .peers
            .get_mut(&self.id)
            .and_then(|slot| slot.events.pop_front())
    }

    fn close(&mut self) {
        let mut hub = lock(&self.hub);
        let remote = match hub.peers.get(&self.id) {
            Some(slot) if slot.state != PeerState::Closed => slot.remote,
            _ => return,
        };

        hub.set_state(self.id, PeerState::Closed);

        if let Some(remote) = remote {
            if hub.state(remote).map_or(false, |s| !s.is_terminal()) {
                hub.set_state(remote, PeerState::Disconnected);
            }
        }

        log::debug!("loopback: peer {} closed", self.id);
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.close();
        // Queued events may own channels; drop them after the lock is released
        let slot = lock(&self.hub).peers.remove(&self.id);
        drop(slot);
    }
}

// ============================================================================
// Channel
// ============================================================================

struct LoopbackChannel {
    peer: u64,
    label: String,
    hub: Arc<Mutex<Hub>>,
    closed: bool,
}

impl LoopbackChannel {
    fn remote_if_open(&self, hub: &Hub) -> Option<u64> {
        if self.closed {
            return None;
        }
        let slot = hub.peers.get(&self.peer)?;
        if slot.state != PeerState::Connected {
            return None;
        }
        let remote = slot.remote?;
        match hub.state(remote) {
            Some(PeerState::Connected) => Some(remote),
            _ => None,
        }
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        let hub = lock(&self.hub);
        self.remote_if_open(&hub).is_some()
    }

    fn max_message_size(&self) -> usize {
        lock(&self.hub).max_message_size
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut hub = lock(&self.hub);
        if data.len() > hub.max_message_size {
            return Err(Error::Transport(format!(
                "message of {} bytes exceeds channel limit {}",
                data.len(),
                hub.max_message_size
            )));
        }

        let remote = self
            .remote_if_open(&hub)
            .ok_or_else(|| Error::Transport(format!("channel {} is not open", self.label)))?;

        hub.push(
            remote,
            PeerEvent::Message {
                label: self.label.clone(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RELIABLE_CHANNEL_LABEL, UNRELIABLE_CHANNEL_LABEL};

    fn drain(peer: &mut Box<dyn PeerConnection>) -> Vec<PeerEvent> {
        std::iter::from_fn(|| peer.poll_event()).collect()
    }

    fn local_description(events: &[PeerEvent]) -> String {
        events
            .iter()
            .find_map(|e| match e {
                PeerEvent::LocalDescription(d) => Some(d.clone()),
                _ => None,
            })
            .expect("no local description")
    }

    #[test]
    fn test_full_handshake() {
        let mut net = LoopbackNetwork::new();
        let mut client = net.create(Role::Client, &[]).unwrap();
        let mut server = net.create(Role::Server, &[]).unwrap();

        let mut reliable = client.create_data_channel(RELIABLE_CHANNEL_LABEL).unwrap();
        let _unreliable = client.create_data_channel(UNRELIABLE_CHANNEL_LABEL).unwrap();
        assert!(!reliable.is_open());

        let offer = local_description(&drain(&mut client));
        assert!(offer.contains("o=rtc "));
        server.set_remote_description(&offer, DescriptionKind::Offer).unwrap();

        let answer = local_description(&drain(&mut server));
        client.set_remote_description(&answer, DescriptionKind::Answer).unwrap();

        let client_events = drain(&mut client);
        assert!(matches!(
            client_events[0],
            PeerEvent::StateChanged(PeerState::Connected)
        ));
        assert!(reliable.is_open());

        let server_events = drain(&mut server);
        let mut channels: Vec<Box<dyn DataChannel>> = server_events
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::DataChannel(ch) => Some(ch),
                _ => None,
            })
            .collect();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].label(), RELIABLE_CHANNEL_LABEL);

        reliable.send(b"hello").unwrap();
        match server.poll_event() {
            Some(PeerEvent::Message { label, data }) => {
                assert_eq!(label, RELIABLE_CHANNEL_LABEL);
                assert_eq!(data, b"hello");
            }
            other => panic!("unexpected {:?}", other),
        }

        channels[0].send(b"back").unwrap();
        assert!(matches!(client.poll_event(), Some(PeerEvent::Message { .. })));
    }

    #[test]
    fn test_message_size_limit() {
        let mut net = LoopbackNetwork::with_max_message_size(8);
        let mut client = net.create(Role::Client, &[]).unwrap();
        let mut ch = client.create_data_channel(RELIABLE_CHANNEL_LABEL).unwrap();
        assert_eq!(ch.max_message_size(), 8);
        assert!(matches!(ch.send(&[0u8; 9]), Err(Error::Transport(_))));
    }

    #[test]
    fn test_send_before_open_fails() {
        let mut net = LoopbackNetwork::new();
        let mut client = net.create(Role::Client, &[]).unwrap();
        let mut ch = client.create_data_channel(RELIABLE_CHANNEL_LABEL).unwrap();
        assert!(matches!(ch.send(b"x"), Err(Error::Transport(_))));
    }

    #[test]
    fn test_close_notifies_remote() {
        let mut net = LoopbackNetwork::new();
        let mut client = net.create(Role::Client, &[]).unwrap();
        let mut server = net.create(Role::Server, &[]).unwrap();
        client.create_data_channel(RELIABLE_CHANNEL_LABEL).unwrap();

        let offer = local_description(&drain(&mut client));
        server.set_remote_description(&offer, DescriptionKind::Offer).unwrap();
        let answer = local_description(&drain(&mut server));
        client.set_remote_description(&answer, DescriptionKind::Answer).unwrap();
        drain(&mut client);
        drain(&mut server);

        server.close();
        server.close();
        assert!(matches!(
            drain(&mut server).as_slice(),
            [PeerEvent::StateChanged(PeerState::Closed)]
        ));
        assert!(matches!(
            drain(&mut client).as_slice(),
            [PeerEvent::StateChanged(PeerState::Disconnected)]
        ));
        assert_eq!(net.open_peers(), 1);
    }

    #[test]
    fn test_dropped_handles_release_slots() {
        let mut net = LoopbackNetwork::new();
        for _ in 0..5 {
            let mut client = net.create(Role::Client, &[]).unwrap();
            let mut server = net.create(Role::Server, &[]).unwrap();
            client.create_data_channel(RELIABLE_CHANNEL_LABEL).unwrap();
            let offer = local_description(&drain(&mut client));
            server.set_remote_description(&offer, DescriptionKind::Offer).unwrap();
            let answer = local_description(&drain(&mut server));
            client.set_remote_description(&answer, DescriptionKind::Answer).unwrap();
            assert_eq!(net.tracked_peers(), 2);

            // Server side goes first; its queued DataChannel event is never read
            drop(server);
            assert_eq!(net.tracked_peers(), 1);
            assert!(matches!(
                drain(&mut client).last(),
                Some(PeerEvent::StateChanged(PeerState::Disconnected))
            ));
        }
        assert_eq!(net.tracked_peers(), 0);
        assert_eq!(net.open_peers(), 0);
    }

    #[test]
    fn test_unknown_offer_rejected() {
        let mut net = LoopbackNetwork::new();
        let mut server = net.create(Role::Server, &[]).unwrap();
        assert!(server
            .set_remote_description("v=0\r\n", DescriptionKind::Offer)
            .is_err());
        assert!(server
            .set_remote_description("v=0\r\na=loopback-peer:999\r\n", DescriptionKind::Offer)
            .is_err());
    }

    #[test]
    fn test_candidate_validation() {
        let mut net = LoopbackNetwork::new();
        let mut peer = net.create(Role::Server, &[]).unwrap();
        assert!(peer.add_remote_candidate("candidate:1 1 UDP 1 127.0.0.1 1 typ host", "0").is_ok());
        assert!(peer.add_remote_candidate("garbage", "0").is_err());
    }
}
