//! Lightweight Prometheus-compatible metrics for the discovery server.
//!
//! Counters are atomics so the signal path can read them while the poll loop
//! writes. Rendered in Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use nethernet::discovery::DiscoveryStats;
use nethernet::ServerEvent;

pub struct Metrics {
    /// Datagrams read from the discovery socket (counter)
    pub datagrams_received_total: AtomicU64,
    /// Datagrams dropped as malformed or tampered (counter)
    pub datagrams_rejected_total: AtomicU64,
    /// Packets sent: responses and signals (counter)
    pub packets_sent_total: AtomicU64,
    /// Sessions that reached connected (counter)
    pub connections_opened_total: AtomicU64,
    /// Sessions closed for any reason (counter)
    pub connections_closed_total: AtomicU64,
    /// Application payloads received (counter)
    pub payloads_received_total: AtomicU64,
    /// Currently open sessions (gauge)
    pub active_connections: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            datagrams_received_total: AtomicU64::new(0),
            datagrams_rejected_total: AtomicU64::new(0),
            packets_sent_total: AtomicU64::new(0),
            connections_opened_total: AtomicU64::new(0),
            connections_closed_total: AtomicU64::new(0),
            payloads_received_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Fold one server event into the counters
    pub fn record(&self, event: &ServerEvent) {
        match event {
            ServerEvent::OpenConnection(_) => {
                self.connections_opened_total.fetch_add(1, Ordering::Relaxed);
                self.active_connections.fetch_add(1, Ordering::Relaxed);
            }
            ServerEvent::CloseConnection { .. } => {
                self.connections_closed_total.fetch_add(1, Ordering::Relaxed);
                // Sessions refused before connecting were never counted as active
                let _ = self.active_connections.fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |n| n.checked_sub(1),
                );
            }
            ServerEvent::Encapsulated { .. } => {
                self.payloads_received_total.fetch_add(1, Ordering::Relaxed);
            }
            ServerEvent::Close(_) => {}
        }
    }

    /// Copy the discovery socket counters
    pub fn update_discovery(&self, stats: &DiscoveryStats) {
        self.datagrams_received_total
            .store(stats.received, Ordering::Relaxed);
        self.datagrams_rejected_total
            .store(stats.rejected, Ordering::Relaxed);
        self.packets_sent_total.store(stats.sent, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP nethernet_datagrams_received_total Datagrams read from the discovery socket\n\
             # TYPE nethernet_datagrams_received_total counter\n\
             nethernet_datagrams_received_total {}\n\
             # HELP nethernet_datagrams_rejected_total Datagrams dropped as malformed or tampered\n\
             # TYPE nethernet_datagrams_rejected_total counter\n\
             nethernet_datagrams_rejected_total {}\n\
             # HELP nethernet_packets_sent_total Discovery packets sent\n\
             # TYPE nethernet_packets_sent_total counter\n\
             nethernet_packets_sent_total {}\n\
             # HELP nethernet_connections_opened_total Sessions that reached connected\n\
             # TYPE nethernet_connections_opened_total counter\n\
             nethernet_connections_opened_total {}\n\
             # HELP nethernet_connections_closed_total Sessions closed\n\
             # TYPE nethernet_connections_closed_total counter\n\
             nethernet_connections_closed_total {}\n\
             # HELP nethernet_payloads_received_total Application payloads received\n\
             # TYPE nethernet_payloads_received_total counter\n\
             nethernet_payloads_received_total {}\n\
             # HELP nethernet_active_connections Currently open sessions\n\
             # TYPE nethernet_active_connections gauge\n\
             nethernet_active_connections {}\n\
             # HELP nethernet_uptime_seconds Server uptime in seconds\n\
             # TYPE nethernet_uptime_seconds gauge\n\
             nethernet_uptime_seconds {}\n",
            self.datagrams_received_total.load(Ordering::Relaxed),
            self.datagrams_rejected_total.load(Ordering::Relaxed),
            self.packets_sent_total.load(Ordering::Relaxed),
            self.connections_opened_total.load(Ordering::Relaxed),
            self.connections_closed_total.load(Ordering::Relaxed),
            self.payloads_received_total.load(Ordering::Relaxed),
            self.active_connections.load(Ordering::Relaxed),
            uptime,
        )
    }
}
