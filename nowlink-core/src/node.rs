//! Node: role state machine on top of one radio link.
//!
//! `Unbound -> Discovering -> {ClientBound | ServerActive}`. A node preset as
//! server skips discovery; a node preset with a known server channel and
//! address binds as client directly. Terminal states are kept for the life of
//! the node. Like the rest of the crate, the node does no I/O scheduling of its
//! own: the host calls [`Node::poll`] with the current time and acts on the
//! returned events.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::address::{Channel, HardwareAddress};
use crate::discovery::{
    self, ClientScan, DiscoveryConfig, DiscoveryError, DiscoveryResult, DiscoveryStatus,
};
use crate::peer::KEY_LEN;
use crate::radio::{Inbound, LinkError, RadioDriver, RadioLink};
use crate::stats::ReceiveStats;
use crate::wire::{self, FrameDecodeError};

/// How a node starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preset {
    /// Look for a server; become one if none answers.
    Discover,
    /// Serve on a fixed channel without looking for another server.
    Server { channel: Channel },
    /// Known server: bind without discovery.
    Client {
        channel: Channel,
        server: HardwareAddress,
    },
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub preset: Preset,
    pub discovery: DiscoveryConfig,
    /// Channel a node serves on after discovery found nobody.
    pub server_channel: Channel,
    /// Link-wide key for secure peers; the radio default is used when unset.
    pub master_key: Option<[u8; KEY_LEN]>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            preset: Preset::Discover,
            discovery: DiscoveryConfig::default(),
            server_channel: Channel::MIN,
            master_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unbound,
    Discovering,
    ClientBound,
    ServerActive,
}

/// Extra connectivity a server may have besides the radio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Uplink {
    #[default]
    None,
    /// Associated to an access point as a station.
    Station { ssid: String },
}

enum Role {
    Unbound,
    Discovering(ClientScan),
    /// Discovery finished but the radio could not be brought up for the new role yet.
    Settling(Outcome),
    Client { server: HardwareAddress },
    Server,
}

#[derive(Clone, Copy)]
enum Outcome {
    Client(DiscoveryResult),
    Server(Channel),
}

/// Something the host may want to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Discovery (or the preset) bound this node to a server.
    Bound(DiscoveryResult),
    ServerStarted { channel: Channel },
    /// Application payload.
    Received(Inbound),
    PeerAdded(HardwareAddress),
    /// Sender could not be registered; it is only reachable by broadcast.
    PeerUnreachable(HardwareAddress),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node already started")]
    AlreadyStarted,
    #[error("node is not bound to a server")]
    NotClient,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

pub struct Node<D: RadioDriver> {
    link: RadioLink<D>,
    config: NodeConfig,
    role: Role,
    stats: ReceiveStats,
    uplink: Uplink,
    discovery_attempts: u32,
    /// Senders already reported as `PeerUnreachable`.
    unreachable: HashSet<HardwareAddress>,
}

impl<D: RadioDriver> Node<D> {
    pub fn new(driver: D, config: NodeConfig) -> Self {
        Self::with_link(RadioLink::new(driver), config)
    }

    pub fn with_link(link: RadioLink<D>, config: NodeConfig) -> Self {
        Self {
            link,
            config,
            role: Role::Unbound,
            stats: ReceiveStats::default(),
            uplink: Uplink::None,
            discovery_attempts: 0,
            unreachable: HashSet::new(),
        }
    }

    /// Leave `Unbound`. Fails if already started or if the radio cannot be configured.
    pub fn start(&mut self, now: u64) -> Result<Vec<NodeEvent>, NodeError> {
        if !matches!(self.role, Role::Unbound) {
            return Err(NodeError::AlreadyStarted);
        }
        let mut events = Vec::new();
        match self.config.preset.clone() {
            Preset::Discover => {
                self.bring_up(None)?;
                self.discovery_attempts += 1;
                info!(address = %self.address(), "looking for a server");
                self.role = Role::Discovering(ClientScan::new(
                    self.config.discovery.clone(),
                    self.address(),
                    now,
                ));
            }
            Preset::Server { channel } => self.become_server(channel, &mut events)?,
            Preset::Client { channel, server } => {
                self.become_client(DiscoveryResult { channel, server }, &mut events)?
            }
        }
        Ok(events)
    }

    /// One cooperative step: advance discovery or handle received frames.
    ///
    /// If the radio cannot be brought up for the role discovery settled on, the
    /// error is returned and the bring-up is retried on the next call.
    pub fn poll(&mut self, now: u64) -> Result<Vec<NodeEvent>, NodeError> {
        let mut events = Vec::new();
        if let Role::Settling(outcome) = self.role {
            self.settle(outcome, &mut events)?;
            return Ok(events);
        }
        if !self.link.is_active() {
            return Ok(events);
        }
        let inbound = self.link.poll();

        if let Role::Discovering(scan) = &mut self.role {
            let outcome = match scan.step(&mut self.link, &inbound, now)? {
                DiscoveryStatus::Scanning { .. } => return Ok(events),
                DiscoveryStatus::Found(result) => Outcome::Client(result),
                DiscoveryStatus::NotFound => Outcome::Server(self.config.server_channel),
            };
            self.role = Role::Settling(outcome);
            self.settle(outcome, &mut events)?;
            return Ok(events);
        }

        for frame in inbound {
            self.handle_frame(frame, now, &mut events);
        }
        Ok(events)
    }

    fn settle(&mut self, outcome: Outcome, events: &mut Vec<NodeEvent>) -> Result<(), NodeError> {
        match outcome {
            Outcome::Client(result) => self.become_client(result, events),
            Outcome::Server(channel) => self.become_server(channel, events),
        }
    }

    fn bring_up(&mut self, channel: Option<Channel>) -> Result<(), NodeError> {
        self.link.initialize(channel)?;
        if let Some(key) = self.config.master_key {
            self.link.set_master_key(&key)?;
        }
        Ok(())
    }

    fn become_client(
        &mut self,
        result: DiscoveryResult,
        events: &mut Vec<NodeEvent>,
    ) -> Result<(), NodeError> {
        self.bring_up(Some(result.channel))?;
        self.link.add_peer(result.server)?;
        self.role = Role::Client {
            server: result.server,
        };
        info!(channel = %result.channel, server = %result.server, "client started");
        events.push(NodeEvent::Bound(result));
        Ok(())
    }

    fn become_server(
        &mut self,
        channel: Channel,
        events: &mut Vec<NodeEvent>,
    ) -> Result<(), NodeError> {
        self.bring_up(Some(channel))?;
        self.unreachable.clear();
        self.role = Role::Server;
        info!(channel = %channel, address = %self.address(), "server started");
        events.push(NodeEvent::ServerStarted { channel });
        Ok(())
    }

    fn handle_frame(&mut self, frame: Inbound, now: u64, events: &mut Vec<NodeEvent>) {
        let serving = matches!(self.role, Role::Server);
        if serving && !self.link.find_peer(&frame.from) {
            match self.link.add_peer(frame.from) {
                Ok(()) => {
                    info!(peer = %frame.from, "new peer");
                    self.unreachable.remove(&frame.from);
                    events.push(NodeEvent::PeerAdded(frame.from));
                }
                Err(e) if self.unreachable.insert(frame.from) => {
                    warn!(
                        peer = %frame.from,
                        error = %e,
                        "cannot add peer, reachable by broadcast only"
                    );
                    events.push(NodeEvent::PeerUnreachable(frame.from));
                }
                Err(e) => debug!(peer = %frame.from, error = %e, "peer still not added"),
            }
        }

        match wire::decode_frame(&frame.payload) {
            Err(FrameDecodeError::NotDiscovery) => {
                debug!(from = %frame.from, len = frame.payload.len(), "packet received");
                self.stats.record(frame.from, now);
                events.push(NodeEvent::Received(frame));
            }
            Ok(msg) if serving => {
                if let Err(e) = discovery::answer_probe(&mut self.link, frame.from, &msg) {
                    warn!(client = %frame.from, error = %e, "probe not answered");
                }
            }
            Ok(_) => debug!(from = %frame.from, "discovery frame ignored"),
            Err(e) => debug!(from = %frame.from, error = %e, "malformed discovery frame"),
        }
    }

    pub fn state(&self) -> NodeState {
        match self.role {
            Role::Unbound => NodeState::Unbound,
            Role::Discovering(_) | Role::Settling(_) => NodeState::Discovering,
            Role::Client { .. } => NodeState::ClientBound,
            Role::Server => NodeState::ServerActive,
        }
    }

    pub fn address(&self) -> HardwareAddress {
        self.link.hardware_address()
    }

    pub fn channel(&self) -> Option<Channel> {
        self.link.channel()
    }

    /// Server this node is bound to, when a client.
    pub fn server_address(&self) -> Option<HardwareAddress> {
        match self.role {
            Role::Client { server } => Some(server),
            _ => None,
        }
    }

    pub fn discovery(&self) -> Option<&ClientScan> {
        match &self.role {
            Role::Discovering(scan) => Some(scan),
            _ => None,
        }
    }

    /// Times this node started a discovery scan; never more than one per node.
    pub fn discovery_attempts(&self) -> u32 {
        self.discovery_attempts
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    pub fn set_uplink(&mut self, uplink: Uplink) {
        if let Uplink::Station { ssid } = &uplink {
            info!(ssid = %ssid, "station uplink recorded");
        }
        self.uplink = uplink;
    }

    pub fn uplink(&self) -> &Uplink {
        &self.uplink
    }

    pub fn link(&self) -> &RadioLink<D> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut RadioLink<D> {
        &mut self.link
    }

    pub fn peer_count(&self) -> usize {
        self.link.peer_count()
    }

    pub fn send(&mut self, address: HardwareAddress, data: &[u8]) -> Result<(), LinkError> {
        self.link.send(address, data)
    }

    pub fn send_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.link.send_all(data)
    }

    pub fn send_broadcast(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.link.send_broadcast(data)
    }

    pub fn send_to_server(&mut self, data: &[u8]) -> Result<(), NodeError> {
        let server = self.server_address().ok_or(NodeError::NotClient)?;
        Ok(self.link.send(server, data)?)
    }

    /// Whether the most recent unicast was reported undelivered.
    pub fn send_error(&self) -> bool {
        self.link.send_error()
    }

    /// Release the radio. Idempotent, also fine before `start`.
    pub fn end(&mut self) {
        self.link.end();
        // A pending bring-up must not bring the radio back.
        if matches!(self.role, Role::Settling(_)) {
            self.role = Role::Unbound;
        }
    }
}
