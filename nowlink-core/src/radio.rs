//! Radio link: capability wrapper over a connectionless broadcast radio driver.
//!
//! The driver reports receptions and unicast delivery results through an
//! [`EventSink`] handed to it when the link is initialized. Sink methods only
//! push to a bounded inbox or overwrite the single-slot send outcome; the owner
//! reads both between cooperative steps via [`RadioLink::poll`] and
//! [`RadioLink::send_error`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::address::{Channel, HardwareAddress};
use crate::peer::{PeerKey, PeerTable, PeerTableError, KEY_LEN};

/// Largest payload the radio carries in one frame.
pub const MAX_PAYLOAD_LEN: usize = 250;

/// Frames buffered between two polls; further receptions are dropped.
pub const INBOX_CAPACITY: usize = 32;

/// Frame delivered by the receive callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: HardwareAddress,
    pub payload: Vec<u8>,
}

/// Delivery result of the most recent unicast, reported after `send` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub peer: HardwareAddress,
    pub delivered: bool,
}

#[derive(Default)]
struct SinkState {
    inbox: VecDeque<Inbound>,
    dropped: u64,
    last_outcome: Option<SendOutcome>,
}

/// Callback routing handed to a driver. Cheap to clone; all clones feed the same link.
#[derive(Clone, Default)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive callback.
    pub fn on_receive(&self, from: HardwareAddress, payload: &[u8]) {
        let mut state = self.lock();
        if state.inbox.len() >= INBOX_CAPACITY {
            state.dropped += 1;
            return;
        }
        state.inbox.push_back(Inbound {
            from,
            payload: payload.to_vec(),
        });
    }

    /// Send-result callback. Overwrites whatever was recorded before.
    pub fn on_send(&self, peer: HardwareAddress, delivered: bool) {
        self.lock().last_outcome = Some(SendOutcome { peer, delivered });
    }

    fn drain(&self) -> Vec<Inbound> {
        self.lock().inbox.drain(..).collect()
    }

    fn last_outcome(&self) -> Option<SendOutcome> {
        self.lock().last_outcome
    }

    fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.inbox.clear();
        state.last_outcome = None;
    }
}

/// Errors reported synchronously by a radio driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("radio is not configured")]
    NotConfigured,
    #[error("another link already owns the radio callbacks")]
    Busy,
    #[error("channel configuration failed: {0}")]
    Configure(String),
    #[error("peer {0} is not registered with the radio")]
    UnknownPeer(HardwareAddress),
    #[error("{0} cannot be registered as a peer")]
    InvalidPeer(HardwareAddress),
    #[error("radio peer list is full")]
    PeerListFull,
    #[error("payload length {0} outside 1..={MAX_PAYLOAD_LEN}")]
    PayloadLength(usize),
    #[error("radio i/o: {0}")]
    Io(String),
}

/// The radio driver boundary.
///
/// A driver supports one attached [`EventSink`] at a time; `attach` must fail
/// with [`DriverError::Busy`] while another sink is registered.
pub trait RadioDriver {
    fn hardware_address(&self) -> HardwareAddress;

    /// Register the callback routing.
    fn attach(&mut self, sink: EventSink) -> Result<(), DriverError>;

    /// Drop the callback routing. No-op when nothing is attached.
    fn detach(&mut self);

    /// Enter peer-to-peer mode on `channel`, or channel-agnostic discovery mode for `None`.
    fn configure(&mut self, channel: Option<Channel>) -> Result<(), DriverError>;

    /// Stop the radio and forget driver-side peers. Idempotent.
    fn shutdown(&mut self);

    fn set_master_key(&mut self, key: &[u8; KEY_LEN]) -> Result<(), DriverError>;

    fn add_peer(
        &mut self,
        address: HardwareAddress,
        key: Option<&PeerKey>,
    ) -> Result<(), DriverError>;

    fn remove_peer(&mut self, address: &HardwareAddress) -> Result<(), DriverError>;

    /// Queue one frame. Ok means queued; delivery of unicasts is reported later through the sink.
    fn transmit(&mut self, dest: HardwareAddress, payload: &[u8]) -> Result<(), DriverError>;

    /// Give the driver a chance to run deferred callbacks. Drivers whose callbacks fire on
    /// their own keep the default.
    fn service(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("radio link is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    PeerTable(#[from] PeerTableError),
    #[error("key length {0} (expected {KEY_LEN})")]
    InvalidKeyLength(usize),
    #[error("{0} cannot be a peer")]
    InvalidPeer(HardwareAddress),
    #[error("no peers to send to")]
    NoPeers,
    #[error("payload length {0} outside 1..={MAX_PAYLOAD_LEN}")]
    PayloadLength(usize),
    #[error("{failed} of {total} sends rejected")]
    PartialSend { failed: usize, total: usize },
}

fn check_payload(data: &[u8]) -> Result<(), LinkError> {
    if data.is_empty() || data.len() > MAX_PAYLOAD_LEN {
        return Err(LinkError::PayloadLength(data.len()));
    }
    Ok(())
}

fn key_from_slice(key: &[u8]) -> Result<[u8; KEY_LEN], LinkError> {
    key.try_into()
        .map_err(|_| LinkError::InvalidKeyLength(key.len()))
}

/// One radio link. Owns the driver handle and the peer table.
pub struct RadioLink<D: RadioDriver> {
    driver: D,
    peers: PeerTable,
    sink: EventSink,
    channel: Option<Channel>,
    active: bool,
}

impl<D: RadioDriver> RadioLink<D> {
    pub fn new(driver: D) -> Self {
        Self::with_peer_table(driver, PeerTable::new())
    }

    pub fn with_peer_table(driver: D, peers: PeerTable) -> Self {
        Self {
            driver,
            peers,
            sink: EventSink::new(),
            channel: None,
            active: false,
        }
    }

    /// Configure the radio on `channel` (or discovery mode for `None`) and install the callbacks.
    pub fn initialize(&mut self, channel: Option<Channel>) -> Result<(), LinkError> {
        if self.active {
            self.end();
        }
        self.sink.reset();
        self.driver.attach(self.sink.clone())?;
        if let Err(e) = self.driver.configure(channel) {
            self.driver.detach();
            return Err(e.into());
        }
        self.channel = channel;
        self.active = true;
        match channel {
            Some(ch) => info!(address = %self.hardware_address(), channel = %ch, "radio link up"),
            None => info!(address = %self.hardware_address(), "radio link up in discovery mode"),
        }
        Ok(())
    }

    /// Release the radio. Safe to call repeatedly and on a link that was never initialized.
    pub fn end(&mut self) {
        if !self.active {
            return;
        }
        self.driver.detach();
        self.driver.shutdown();
        self.peers.clear();
        self.channel = None;
        self.active = false;
        debug!("radio link down");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        self.driver.hardware_address()
    }

    /// Retune an initialized link.
    pub fn set_channel(&mut self, channel: Channel) -> Result<(), LinkError> {
        self.ensure_active()?;
        self.driver.configure(Some(channel))?;
        self.channel = Some(channel);
        Ok(())
    }

    pub fn set_master_key(&mut self, key: &[u8]) -> Result<(), LinkError> {
        let key = key_from_slice(key)?;
        self.driver.set_master_key(&key)?;
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.count()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn find_peer(&self, address: &HardwareAddress) -> bool {
        self.peers.find(address)
    }

    pub fn add_peer(&mut self, address: HardwareAddress) -> Result<(), LinkError> {
        self.register_peer(address, None)
    }

    pub fn add_peer_secure(
        &mut self,
        address: HardwareAddress,
        key: &[u8],
    ) -> Result<(), LinkError> {
        let key = key_from_slice(key)?;
        self.register_peer(address, Some(key))
    }

    fn register_peer(
        &mut self,
        address: HardwareAddress,
        key: Option<PeerKey>,
    ) -> Result<(), LinkError> {
        self.ensure_active()?;
        if address.is_broadcast() || address == self.hardware_address() {
            return Err(LinkError::InvalidPeer(address));
        }
        if self.peers.find(&address) {
            return Ok(());
        }
        self.peers.check_room(&address, key.is_some())?;
        self.driver.add_peer(address, key.as_ref())?;
        match key {
            Some(key) => self.peers.add_secure(address, key)?,
            None => self.peers.add(address)?,
        }
        debug!(peer = %address, secure = key.is_some(), "peer added");
        Ok(())
    }

    pub fn remove_peer(&mut self, address: &HardwareAddress) -> Result<(), LinkError> {
        if !self.peers.find(address) {
            return Ok(());
        }
        if self.active {
            self.driver.remove_peer(address)?;
        }
        self.peers.remove(address)?;
        debug!(peer = %address, "peer removed");
        Ok(())
    }

    pub fn clear_peers(&mut self) {
        for address in self.peers.addresses() {
            if self.active {
                if let Err(e) = self.driver.remove_peer(&address) {
                    warn!(peer = %address, error = %e, "driver refused peer removal");
                }
            }
        }
        self.peers.clear();
    }

    /// Queue a unicast. Ok means the driver accepted it, not that it was delivered.
    pub fn send(&mut self, address: HardwareAddress, data: &[u8]) -> Result<(), LinkError> {
        self.ensure_active()?;
        check_payload(data)?;
        self.driver.transmit(address, data)?;
        Ok(())
    }

    /// Unicast to every peer in insertion order. Ok only if every send was accepted.
    pub fn send_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.ensure_active()?;
        check_payload(data)?;
        let targets = self.peers.addresses();
        if targets.is_empty() {
            return Err(LinkError::NoPeers);
        }
        let mut failed = 0;
        for address in &targets {
            if let Err(e) = self.driver.transmit(*address, data) {
                debug!(peer = %address, error = %e, "send rejected");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(LinkError::PartialSend {
                failed,
                total: targets.len(),
            });
        }
        Ok(())
    }

    /// Send to the broadcast address. Does not consult the peer table.
    pub fn send_broadcast(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.ensure_active()?;
        check_payload(data)?;
        self.driver.transmit(HardwareAddress::BROADCAST, data)?;
        Ok(())
    }

    /// Whether the most recent reported unicast failed. `false` until an outcome arrives.
    pub fn send_error(&self) -> bool {
        self.sink
            .last_outcome()
            .map(|o| !o.delivered)
            .unwrap_or(false)
    }

    pub fn last_send_outcome(&self) -> Option<SendOutcome> {
        self.sink.last_outcome()
    }

    /// Frames dropped because the inbox was full.
    pub fn dropped_frames(&self) -> u64 {
        self.sink.dropped()
    }

    /// Service the driver and take every frame received since the last poll.
    pub fn poll(&mut self) -> Vec<Inbound> {
        if !self.active {
            return Vec::new();
        }
        self.driver.service();
        self.sink.drain()
    }

    fn ensure_active(&self) -> Result<(), LinkError> {
        if self.active {
            Ok(())
        } else {
            Err(LinkError::NotInitialized)
        }
    }
}

impl<D: RadioDriver> Drop for RadioLink<D> {
    fn drop(&mut self) {
        self.end();
    }
}
