//! Radio addressing: 6-byte hardware address and channel index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hardware (MAC) address of a radio interface. Compared byte-wise.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    /// Reserved all-ones address; frames sent here reach every listener on the channel.
    pub const BROADCAST: HardwareAddress = HardwareAddress([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        HardwareAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Random unicast, locally administered address (for emulated radios).
    pub fn random_local() -> Self {
        let mut bytes: [u8; 6] = rand::random();
        bytes[0] = (bytes[0] & 0xFC) | 0x02;
        HardwareAddress(bytes)
    }
}

impl From<[u8; 6]> for HardwareAddress {
    fn from(bytes: [u8; 6]) -> Self {
        HardwareAddress(bytes)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = AddressParseError;

    /// Parse `AA:BB:CC:DD:EE:FF` (case-insensitive; `-` also accepted as separator).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(AddressParseError::Length)?;
            if part.len() != 2 {
                return Err(AddressParseError::Octet(part.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::Octet(part.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError::Length);
        }
        Ok(HardwareAddress(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("expected six octets")]
    Length,
    #[error("invalid octet {0:?}")]
    Octet(String),
}

/// Highest channel index any supported radio region allows.
pub const MAX_CHANNEL: u8 = 14;

/// Radio channel index, always in `1..=MAX_CHANNEL`. "Unset" is `Option<Channel>::None`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    pub const MIN: Channel = Channel(1);
    pub const MAX: Channel = Channel(MAX_CHANNEL);

    /// Returns `None` for 0 (reserved for "unset") and anything above [`MAX_CHANNEL`].
    pub const fn new(index: u8) -> Option<Channel> {
        if index == 0 || index > MAX_CHANNEL {
            None
        } else {
            Some(Channel(index))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Next channel up to and including `last`, or `None` past it.
    pub fn next_up_to(self, last: Channel) -> Option<Channel> {
        if self.0 >= last.0 {
            None
        } else {
            Some(Channel(self.0 + 1))
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = InvalidChannel;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Channel::new(index).ok_or(InvalidChannel(index))
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> u8 {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid channel {0} (expected 1..={MAX_CHANNEL})")]
pub struct InvalidChannel(pub u8);
