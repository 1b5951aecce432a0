//! nowlink: connectionless peer-to-peer radio messaging with automatic server discovery.
//! Host-driven: the core owns no threads or sockets; the host supplies a radio driver
//! and the current time, and acts on the returned events.

pub mod address;
pub mod air;
pub mod crypto;
pub mod discovery;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod radio;
pub mod schedule;
pub mod sim;
pub mod stats;
pub mod wire;

pub use address::{AddressParseError, Channel, HardwareAddress, InvalidChannel, MAX_CHANNEL};
pub use discovery::{answer_probe, ClientScan, DiscoveryConfig, DiscoveryResult, DiscoveryStatus};
pub use node::{Node, NodeConfig, NodeError, NodeEvent, NodeState, Preset, Uplink};
pub use peer::{Peer, PeerKey, PeerTable, PeerTableError, KEY_LEN};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use radio::{
    DriverError, EventSink, Inbound, LinkError, RadioDriver, RadioLink, SendOutcome,
    MAX_PAYLOAD_LEN,
};
pub use schedule::{PeriodicSend, SendMode, SendReport};
pub use stats::ReceiveStats;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
