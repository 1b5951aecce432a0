//! Periodic application send with an out-of-band "send now" trigger.

use tracing::{debug, info};

use crate::radio::{LinkError, RadioDriver, RadioLink};

/// Default period between application sends.
pub const DEFAULT_SEND_PERIOD_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Unicast to every registered peer.
    Unicast,
    /// Broadcast, no peer registration needed.
    Broadcast,
}

/// What one scheduled send did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReport {
    NotDue,
    /// Unicast mode with an empty peer table.
    NoPeers,
    Sent,
    Rejected(LinkError),
}

pub struct PeriodicSend {
    period_ms: u64,
    mode: SendMode,
    last_sent_at: Option<u64>,
    forced: bool,
}

impl PeriodicSend {
    pub fn new(period_ms: u64, mode: SendMode) -> Self {
        Self {
            period_ms,
            mode,
            last_sent_at: None,
            forced: false,
        }
    }

    pub fn mode(&self) -> SendMode {
        self.mode
    }

    /// Make the next check due regardless of the period.
    pub fn trigger(&mut self) {
        self.forced = true;
    }

    /// Due on the first check, after `trigger`, and once per period after the last attempt.
    pub fn is_due(&self, now: u64) -> bool {
        match self.last_sent_at {
            None => true,
            Some(_) if self.forced => true,
            Some(at) => now.saturating_sub(at) >= self.period_ms,
        }
    }

    /// Send `payload` if due. An attempt restarts the period whatever its outcome;
    /// retrying is left to the next period.
    pub fn poll<D: RadioDriver>(
        &mut self,
        link: &mut RadioLink<D>,
        payload: &[u8],
        now: u64,
    ) -> SendReport {
        if !self.is_due(now) {
            return SendReport::NotDue;
        }
        self.last_sent_at = Some(now);
        self.forced = false;
        let result = match self.mode {
            SendMode::Broadcast => link.send_broadcast(payload),
            SendMode::Unicast if link.peer_count() == 0 => {
                debug!("no peers, unicast send skipped");
                return SendReport::NoPeers;
            }
            SendMode::Unicast => link.send_all(payload),
        };
        match result {
            Ok(()) => {
                info!(mode = ?self.mode, len = payload.len(), "message sent");
                SendReport::Sent
            }
            Err(e) => {
                info!(mode = ?self.mode, error = %e, "message send failed");
                SendReport::Rejected(e)
            }
        }
    }
}
