//! Per-session message queueing and framing
//!
//! A [`Connection`] owns one peer-connection handle and up to two channels.
//! Application payloads submitted before the reliable channel opens are
//! queued and flushed in submission order once it does; payloads larger than
//! the channel limit are segmented (see [`crate::framing`]).
//!
//! ```text
//!   send(p1) send(p2)       channel open        send(p3)
//!       │       │                │                  │
//!       ▼       ▼                ▼                  ▼
//!   ┌─────────────┐   flush   ┌───────────────────────────┐
//!   │ [p1, p2]    │ ────────► │ reliable: p1, p2, p3 ...  │
//!   └─────────────┘           └───────────────────────────┘
//! ```

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::framing::{self, Reassembler};
use crate::transport::{ChannelKind, DataChannel, PeerConnection, PeerEvent, Role};
use crate::ConnectionId;

/// Outcome of [`Connection::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Transmitted as this many segments
    Sent(usize),
    /// Held until the reliable channel opens
    Queued,
}

/// One negotiated (or negotiating) session
pub struct Connection {
    role: Role,
    remote_id: ConnectionId,
    peer: Box<dyn PeerConnection>,
    reliable: Option<Box<dyn DataChannel>>,
    unreliable: Option<Box<dyn DataChannel>>,
    reassembly: Reassembler,
    outbound: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Connection {
    pub fn new(role: Role, remote_id: ConnectionId, peer: Box<dyn PeerConnection>) -> Self {
        Self {
            role,
            remote_id,
            peer,
            reliable: None,
            unreliable: None,
            reassembly: Reassembler::new(),
            outbound: VecDeque::new(),
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// ConnectionId of the session this connection belongs to
    pub fn remote_id(&self) -> ConnectionId {
        self.remote_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when the reliable channel can carry data
    pub fn is_ready(&self) -> bool {
        !self.closed && self.reliable.as_ref().map_or(false, |ch| ch.is_open())
    }

    /// Payloads waiting for the reliable channel
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn peer_mut(&mut self) -> &mut dyn PeerConnection {
        self.peer.as_mut()
    }

    pub(crate) fn next_peer_event(&mut self) -> Option<PeerEvent> {
        self.peer.poll_event()
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Attach channels as they become available and flush queued payloads
    pub fn set_channels(
        &mut self,
        reliable: Option<Box<dyn DataChannel>>,
        unreliable: Option<Box<dyn DataChannel>>,
    ) -> Result<()> {
        if self.closed {
            for mut ch in reliable.into_iter().chain(unreliable) {
                ch.close();
            }
            return Err(Error::State("connection is closed".to_string()));
        }

        if let Some(ch) = reliable {
            self.reliable = Some(ch);
        }
        if let Some(ch) = unreliable {
            self.unreliable = Some(ch);
        }

        self.flush().map(|_| ())
    }

    /// Attach a channel opened by the remote side, matched by label
    pub fn attach_channel(&mut self, mut channel: Box<dyn DataChannel>) -> Result<()> {
        match ChannelKind::from_label(channel.label()) {
            Some(ChannelKind::Reliable) => self.set_channels(Some(channel), None),
            Some(ChannelKind::Unreliable) => self.set_channels(None, Some(channel)),
            None => {
                let label = channel.label().to_string();
                channel.close();
                Err(Error::Protocol(format!("unexpected channel {:?}", label)))
            }
        }
    }

    /// A channel became writable
    pub fn on_channel_open(&mut self, label: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match ChannelKind::from_label(label) {
            Some(ChannelKind::Reliable) => self.flush().map(|_| ()),
            _ => Ok(()),
        }
    }

    /// A channel went away; reliable sends queue again until a new one opens
    pub fn on_channel_closed(&mut self, label: &str) {
        match ChannelKind::from_label(label) {
            Some(ChannelKind::Reliable) => {
                self.reliable = None;
                self.reassembly.reset();
            }
            Some(ChannelKind::Unreliable) => self.unreliable = None,
            None => {}
        }
        log::debug!("Connection {}: channel {} closed", self.remote_id, label);
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send one application payload on the reliable channel, in order
    pub fn send(&mut self, payload: &[u8]) -> Result<SendStatus> {
        if self.closed {
            return Err(Error::State(format!(
                "connection {} is closed",
                self.remote_id
            )));
        }

        // Oversized payloads are refused up front and never queued
        if let Some(ch) = self.reliable.as_ref() {
            framing::segment_count(payload.len(), ch.max_message_size())?;
        }

        self.flush()?;

        if self.outbound.is_empty() && self.is_ready() {
            return self.transmit(payload).map(SendStatus::Sent);
        }

        self.outbound.push_back(payload.to_vec());
        log::trace!(
            "Connection {}: queued {} bytes ({} waiting)",
            self.remote_id,
            payload.len(),
            self.outbound.len()
        );
        Ok(SendStatus::Queued)
    }

    /// Send one unit on the unreliable channel; never segmented.
    ///
    /// Returns false when no unreliable channel is open.
    pub fn send_unreliable(&mut self, payload: &[u8]) -> Result<bool> {
        if self.closed {
            return Err(Error::State(format!(
                "connection {} is closed",
                self.remote_id
            )));
        }

        let ch = match self.unreliable.as_mut() {
            Some(ch) if ch.is_open() => ch,
            _ => return Ok(false),
        };

        if payload.len() > ch.max_message_size() {
            return Err(Error::Format(format!(
                "unreliable payload of {} bytes exceeds {}",
                payload.len(),
                ch.max_message_size()
            )));
        }

        ch.send(payload)?;
        Ok(true)
    }

    /// Transmit queued payloads while the reliable channel is open
    fn flush(&mut self) -> Result<usize> {
        let mut flushed = 0;
        while self.is_ready() {
            let payload = match self.outbound.front() {
                Some(p) => p.clone(),
                None => break,
            };
            match self.transmit(&payload) {
                Ok(_) => flushed += 1,
                // Queued before the channel limit was known
                Err(Error::Format(msg)) => log::warn!(
                    "Connection {}: dropping queued payload: {}",
                    self.remote_id,
                    msg
                ),
                Err(e) => return Err(e),
            }
            self.outbound.pop_front();
        }

        if flushed > 0 {
            log::debug!(
                "Connection {}: flushed {} queued payloads",
                self.remote_id,
                flushed
            );
        }
        Ok(flushed)
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<usize> {
        let ch = self
            .reliable
            .as_mut()
            .ok_or_else(|| Error::Transport("reliable channel missing".to_string()))?;

        let segments = framing::segment(payload, ch.max_message_size())?;
        for seg in &segments {
            ch.send(seg)?;
        }
        Ok(segments.len())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process one channel message; returns a complete application payload
    pub fn handle_message(&mut self, label: &str, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        match ChannelKind::from_label(label) {
            Some(ChannelKind::Reliable) => self.reassembly.push(data),
            Some(ChannelKind::Unreliable) => Ok(Some(data.to_vec())),
            None => Err(Error::Protocol(format!(
                "message on unknown channel {:?}",
                label
            ))),
        }
    }

    /// Tear down channels and the peer handle; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut ch) = self.reliable.take() {
            ch.close();
        }
        if let Some(mut ch) = self.unreliable.take() {
            ch.close();
        }
        self.peer.close();

        if !self.outbound.is_empty() {
            log::debug!(
                "Connection {}: dropping {} unsent payloads",
                self.remote_id,
                self.outbound.len()
            );
        }
        self.outbound.clear();
        self.reassembly.reset();

        log::info!("Connection {} closed", self.remote_id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
