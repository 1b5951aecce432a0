//! Receive counters exposed to status pages.

use crate::address::HardwareAddress;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    received: u32,
    last_sender: Option<HardwareAddress>,
    last_received_at: Option<u64>,
}

impl ReceiveStats {
    pub fn record(&mut self, from: HardwareAddress, now: u64) {
        self.received = self.received.wrapping_add(1);
        self.last_sender = Some(from);
        self.last_received_at = Some(now);
    }

    /// Application packets received so far.
    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn last_sender(&self) -> Option<HardwareAddress> {
        self.last_sender
    }

    pub fn last_received_at(&self) -> Option<u64> {
        self.last_received_at
    }

    /// Whole seconds since the last packet, `None` before the first one.
    pub fn seconds_since_last(&self, now: u64) -> Option<u64> {
        self.last_received_at
            .map(|at| now.saturating_sub(at) / 1000)
    }
}
