//! Discovery messages exchanged on top of the opaque radio payload.

use serde::{Deserialize, Serialize};

use crate::address::{Channel, HardwareAddress};

/// Current discovery protocol version. Carried in probe and advertisement.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discovery frames. Encoding is bincode behind a marker prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client looking for a server on the channel it is currently tuned to.
    Probe {
        protocol_version: u8,
        client: HardwareAddress,
        /// Fresh per channel visit; echoed back so stale answers can be told apart.
        nonce: u32,
    },
    /// Server answer to a probe.
    Advertisement {
        protocol_version: u8,
        server: HardwareAddress,
        channel: Channel,
        nonce: u32,
    },
}

impl Message {
    pub fn probe(client: HardwareAddress, nonce: u32) -> Self {
        Message::Probe {
            protocol_version: PROTOCOL_VERSION,
            client,
            nonce,
        }
    }

    pub fn advertisement(server: HardwareAddress, channel: Channel, nonce: u32) -> Self {
        Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            server,
            channel,
            nonce,
        }
    }
}
