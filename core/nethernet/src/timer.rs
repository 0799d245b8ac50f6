//! Cancellable periodic timer driven by the owner's poll loop

use std::time::{Duration, Instant};

/// A repeating deadline checked from an event loop.
///
/// Nothing runs in the background: the owner calls [`Interval::poll`] after
/// each wakeup and uses [`Interval::remaining`] to bound its poll timeout.
/// Once cancelled it never fires again.
#[derive(Debug)]
pub struct Interval {
    period: Duration,
    next: Option<Instant>,
}

impl Interval {
    /// First tick one `period` from now
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now() + period)
    }

    pub fn starting_at(period: Duration, first: Instant) -> Self {
        Self {
            period,
            next: Some(first),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns true once per elapsed period and schedules the next tick
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(deadline) if now >= deadline => {
                // Skip missed ticks instead of bursting
                let mut next = deadline + self.period;
                if next <= now {
                    next = now + self.period;
                }
                self.next = Some(next);
                true
            }
            _ => false,
        }
    }

    /// Time until the next tick, `None` when cancelled
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next.map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn cancel(&mut self) {
        self.next = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.next.is_none()
    }
}
