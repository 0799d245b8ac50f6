//! Discovery service: UDP socket, envelope and packet dispatch
//!
//! ```text
//! datagram ──► Envelope::decode ──► PacketCodec::decode ──► dispatch
//!                  │                       │                   │
//!             IntegrityError     FormatError/ProtocolError     ├─ Request  ─► Inbound::Request
//!                  └──────── logged, dropped ◄─┘               ├─ Response ─► cache + Inbound::Response
//!                                                              └─ Message  ─► cache + Signal
//! ```
//!
//! Sends are fire-and-forget. Nothing raised while handling one inbound
//! datagram leaves [`DiscoveryService::recv`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::packet::{DiscoveryPacket, PacketCodec};
use crate::signal::{Signal, KEEPALIVE_MARKER};
use crate::NetworkId;

/// Largest datagram accepted
const MAX_DATAGRAM_SIZE: usize = 65_535;

// ============================================================================
// Address Cache
// ============================================================================

/// Last-known address per peer NetworkId (latest wins)
#[derive(Debug, Clone, Default)]
pub struct AddressCache {
    entries: HashMap<NetworkId, SocketAddr>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, network_id: NetworkId, addr: SocketAddr) {
        if let Some(prev) = self.entries.insert(network_id, addr) {
            if prev != addr {
                log::debug!("Peer {} moved {} -> {}", network_id, prev, addr);
            }
        }
    }

    pub fn get(&self, network_id: NetworkId) -> Option<SocketAddr> {
        self.entries.get(&network_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetworkId, SocketAddr)> + '_ {
        self.entries.iter().map(|(id, addr)| (*id, *addr))
    }
}

// ============================================================================
// Inbound Events
// ============================================================================

/// A validated inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Request {
        sender_id: NetworkId,
        from: SocketAddr,
    },
    Response {
        sender_id: NetworkId,
        data: Vec<u8>,
        from: SocketAddr,
    },
    /// Signal addressed to us; `network_id` holds the sender
    Signal { signal: Signal, from: SocketAddr },
}

/// Datagram counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub received: u64,
    /// Datagrams dropped for integrity, format or protocol errors
    pub rejected: u64,
    pub sent: u64,
}

// ============================================================================
// Service
// ============================================================================

pub struct DiscoveryService {
    socket: UdpSocket,
    local_id: NetworkId,
    codec: PacketCodec,
    envelope: Envelope,
    cache: AddressCache,
    stats: DiscoveryStats,
    recv_buf: Vec<u8>,
}

impl DiscoveryService {
    /// Bind the socket and register it for readability
    pub fn bind(
        addr: SocketAddr,
        broadcast: bool,
        local_id: NetworkId,
        envelope: Envelope,
        registry: &Registry,
        token: Token,
    ) -> Result<Self> {
        let codec = PacketCodec::builtin()?;
        let mut socket = UdpSocket::bind(addr)?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        registry.register(&mut socket, token, Interest::READABLE)?;

        log::debug!(
            "Discovery socket bound on {} (network id {})",
            socket.local_addr()?,
            local_id
        );

        Ok(Self {
            socket,
            local_id,
            codec,
            envelope,
            cache: AddressCache::new(),
            stats: DiscoveryStats::default(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_id(&self) -> NetworkId {
        self.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn addresses(&self) -> &AddressCache {
        &self.cache
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.stats
    }

    pub fn deregister(&mut self, registry: &Registry) -> Result<()> {
        registry.deregister(&mut self.socket)?;
        Ok(())
    }

    // ========================================================================
    // Send Path
    // ========================================================================

    /// Encode, seal and send one packet. Failures are logged, never retried.
    pub fn send_packet(&mut self, packet: &DiscoveryPacket, to: SocketAddr) -> bool {
        let sealed = match self
            .codec
            .encode(packet)
            .and_then(|plain| self.envelope.encode(&plain))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {} packet: {}", packet.packet_type(), e);
                return false;
            }
        };

        match self.socket.send_to(&sealed, to) {
            Ok(_) => {
                self.stats.sent += 1;
                log::trace!(
                    "Sent {} packet ({} bytes) to {}",
                    packet.packet_type(),
                    sealed.len(),
                    to
                );
                true
            }
            Err(e) => {
                log::debug!("Send to {} failed: {}", to, e);
                false
            }
        }
    }

    pub fn send_request(&mut self, to: SocketAddr) -> bool {
        let packet = DiscoveryPacket::Request {
            sender_id: self.local_id,
        };
        self.send_packet(&packet, to)
    }

    pub fn send_response(&mut self, data: &[u8], to: SocketAddr) -> bool {
        let packet = DiscoveryPacket::Response {
            sender_id: self.local_id,
            data: data.to_vec(),
        };
        self.send_packet(&packet, to)
    }

    /// Send a signal to a peer's last-known address; false when unknown
    pub fn send_signal(&mut self, recipient: NetworkId, signal: &Signal) -> bool {
        match self.cache.get(recipient) {
            Some(addr) => self.send_signal_to(recipient, signal, addr),
            None => {
                log::debug!(
                    "No address for peer {}, {} not sent",
                    recipient,
                    signal.signal_type
                );
                false
            }
        }
    }

    pub fn send_signal_to(&mut self, recipient: NetworkId, signal: &Signal, to: SocketAddr) -> bool {
        let packet = DiscoveryPacket::Message {
            sender_id: self.local_id,
            recipient_id: recipient,
            data: signal.to_text(),
        };
        self.send_packet(&packet, to)
    }

    // ========================================================================
    // Receive Path
    // ========================================================================

    /// Drain the socket. Malformed or hostile datagrams are logged and dropped.
    pub fn recv(&mut self) -> Vec<Inbound> {
        let mut inbound = Vec::new();

        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Discovery socket receive failed: {}", e);
                    break;
                }
            };

            self.stats.received += 1;
            let datagram = self.recv_buf[..len].to_vec();

            match self.process(&datagram, from) {
                Ok(Some(event)) => inbound.push(event),
                Ok(None) => {}
                Err(e) if e.is_inbound_rejection() => {
                    self.stats.rejected += 1;
                    log::debug!("Dropped {} byte datagram from {}: {}", len, from, e);
                }
                Err(e) => log::warn!("Failed to handle datagram from {}: {}", from, e),
            }
        }

        inbound
    }

    fn process(&mut self, datagram: &[u8], from: SocketAddr) -> Result<Option<Inbound>> {
        let plaintext = self.envelope.decode(datagram)?;
        let packet = self.codec.decode(&plaintext)?;

        if packet.sender_id() == self.local_id {
            log::trace!("Ignoring own {} packet", packet.packet_type());
            return Ok(None);
        }

        match packet {
            DiscoveryPacket::Request { sender_id } => Ok(Some(Inbound::Request { sender_id, from })),
            DiscoveryPacket::Response { sender_id, data } => {
                self.cache.record(sender_id, from);
                Ok(Some(Inbound::Response {
                    sender_id,
                    data,
                    from,
                }))
            }
            DiscoveryPacket::Message {
                sender_id,
                recipient_id,
                data,
            } => {
                self.cache.record(sender_id, from);

                if recipient_id != self.local_id {
                    log::debug!(
                        "Message from {} for {} is not for us ({})",
                        sender_id,
                        recipient_id,
                        self.local_id
                    );
                    return Ok(None);
                }

                if data == KEEPALIVE_MARKER {
                    log::trace!("Keepalive from {}", sender_id);
                    return Ok(None);
                }

                let mut signal = Signal::from_text(&data)?;
                signal.network_id = Some(sender_id);
                Ok(Some(Inbound::Signal { signal, from }))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DEFAULT_ENVELOPE_KEY;
    use crate::signal::SignalType;
    use mio::Poll;
    use std::time::Duration;

    fn service(poll: &Poll, id: NetworkId) -> DiscoveryService {
        DiscoveryService::bind(
            "127.0.0.1:0".parse().unwrap(),
            false,
            id,
            Envelope::with_seed(DEFAULT_ENVELOPE_KEY).unwrap(),
            poll.registry(),
            Token(0),
        )
        .unwrap()
    }

    fn recv_some(svc: &mut DiscoveryService, want: usize) -> Vec<Inbound> {
        let mut out = Vec::new();
        for _ in 0..200 {
            out.extend(svc.recv());
            if out.len() >= want {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        out
    }

    fn wait_rejected(svc: &mut DiscoveryService, want: u64) {
        for _ in 0..200 {
            assert!(svc.recv().is_empty());
            if svc.stats().rejected >= want {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("datagrams never arrived");
    }

    #[test]
    fn test_request_response_updates_cache() {
        let poll = Poll::new().unwrap();
        let mut a = service(&poll, 1);
        let mut b = service(&poll, 2);
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        assert!(a.send_request(b_addr));
        let got = recv_some(&mut b, 1);
        assert_eq!(
            got,
            vec![Inbound::Request {
                sender_id: 1,
                from: a_addr
            }]
        );
        // Requests do not populate the cache
        assert!(b.addresses().is_empty());

        assert!(b.send_response(b"advert", a_addr));
        let got = recv_some(&mut a, 1);
        assert_eq!(
            got,
            vec![Inbound::Response {
                sender_id: 2,
                data: b"advert".to_vec(),
                from: b_addr
            }]
        );
        assert_eq!(a.addresses().get(2), Some(b_addr));
    }

    #[test]
    fn test_signal_delivery_sets_sender() {
        let poll = Poll::new().unwrap();
        let mut a = service(&poll, 10);
        let mut b = service(&poll, 20);
        let b_addr = b.local_addr().unwrap();

        let signal = Signal::new(SignalType::CandidateAdd, 99, "candidate:1 1 UDP", None);
        assert!(a.send_signal_to(20, &signal, b_addr));

        match recv_some(&mut b, 1).as_slice() {
            [Inbound::Signal { signal: got, .. }] => {
                assert_eq!(got.signal_type, SignalType::CandidateAdd);
                assert_eq!(got.connection_id, 99);
                assert_eq!(got.network_id, Some(10));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(b.addresses().get(10).is_some());

        // Now b can reply without an explicit address
        assert!(b.send_signal(10, &signal));
        assert!(!b.send_signal(11, &signal));
    }

    #[test]
    fn test_keepalive_and_misaddressed_dropped() {
        let poll = Poll::new().unwrap();
        let mut a = service(&poll, 1);
        let mut b = service(&poll, 2);
        let b_addr = b.local_addr().unwrap();

        let keepalive = DiscoveryPacket::Message {
            sender_id: 1,
            recipient_id: 2,
            data: KEEPALIVE_MARKER.to_string(),
        };
        let misaddressed = DiscoveryPacket::Message {
            sender_id: 1,
            recipient_id: 3,
            data: "CANDIDATEADD 1 x".to_string(),
        };
        assert!(a.send_packet(&keepalive, b_addr));
        assert!(a.send_packet(&misaddressed, b_addr));
        a.send_request(b_addr);

        // The trailing request proves the first two were consumed
        let got = recv_some(&mut b, 1);
        assert!(matches!(got.as_slice(), [Inbound::Request { .. }]));
        assert_eq!(b.stats().rejected, 0);
        assert_eq!(b.stats().received, 3);
    }

    #[test]
    fn test_hostile_datagrams_rejected() {
        let poll = Poll::new().unwrap();
        let mut b = service(&poll, 2);
        let b_addr = b.local_addr().unwrap();

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"short", b_addr).unwrap();
        raw.send_to(&[0u8; 200], b_addr).unwrap();

        // Valid envelope, flipped checksum bit
        let codec = PacketCodec::builtin().unwrap();
        let env = Envelope::with_seed(DEFAULT_ENVELOPE_KEY).unwrap();
        let plain = codec
            .encode(&DiscoveryPacket::Request { sender_id: 5 })
            .unwrap();
        let mut sealed = env.encode(&plain).unwrap();
        sealed[3] ^= 0x10;
        raw.send_to(&sealed, b_addr).unwrap();

        // Valid envelope, garbage signal text
        let plain = codec
            .encode(&DiscoveryPacket::Message {
                sender_id: 5,
                recipient_id: 2,
                data: "NOPE".to_string(),
            })
            .unwrap();
        raw.send_to(&env.encode(&plain).unwrap(), b_addr).unwrap();

        wait_rejected(&mut b, 4);
        assert_eq!(b.stats().rejected, 4);

        // Service still works afterwards
        let mut a = service(&poll, 1);
        a.send_request(b_addr);
        assert_eq!(recv_some(&mut b, 1).len(), 1);
    }
}
