//! Air frames: what a driver actually puts on the medium, plus the driver-side
//! peer registry that decides which frames get sealed and which can be opened.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::HardwareAddress;
use crate::crypto::{self, FrameCryptoError, DEFAULT_MASTER_KEY};
use crate::peer::{PeerKey, DEFAULT_PEER_CAPACITY, KEY_LEN};
use crate::radio::{DriverError, MAX_PAYLOAD_LEN};

/// One transmission on the medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirFrame {
    pub src: HardwareAddress,
    pub dst: HardwareAddress,
    /// Body is a sealed payload (see [`crypto::seal`]).
    pub sealed: bool,
    pub body: Vec<u8>,
}

impl AirFrame {
    /// Serialize for media that carry raw bytes (e.g. UDP emulation).
    pub fn encode(&self) -> Result<Vec<u8>, AirError> {
        bincode::serialize(self).map_err(AirError::Codec)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AirError> {
        bincode::deserialize(bytes).map_err(AirError::Codec)
    }

    pub fn is_for(&self, address: &HardwareAddress) -> bool {
        self.dst.is_broadcast() || self.dst == *address
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AirError {
    #[error("air frame codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("sealed frame from {0} which has no key registered")]
    NoKey(HardwareAddress),
    #[error(transparent)]
    Crypto(#[from] FrameCryptoError),
}

/// Driver-side peer list and master key. Shared by the simulated and UDP drivers,
/// mirrors what a radio firmware keeps in its own peer slots.
pub struct DriverPeers {
    master_key: [u8; KEY_LEN],
    peers: HashMap<HardwareAddress, Option<PeerKey>>,
    limit: usize,
}

impl DriverPeers {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_PEER_CAPACITY)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            master_key: DEFAULT_MASTER_KEY,
            peers: HashMap::new(),
            limit,
        }
    }

    pub fn set_master_key(&mut self, key: &[u8; KEY_LEN]) {
        self.master_key = *key;
    }

    pub fn add(
        &mut self,
        address: HardwareAddress,
        key: Option<&PeerKey>,
    ) -> Result<(), DriverError> {
        if address.is_broadcast() {
            return Err(DriverError::InvalidPeer(address));
        }
        if !self.peers.contains_key(&address) && self.peers.len() >= self.limit {
            return Err(DriverError::PeerListFull);
        }
        self.peers.insert(address, key.copied());
        Ok(())
    }

    pub fn remove(&mut self, address: &HardwareAddress) {
        self.peers.remove(address);
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn contains(&self, address: &HardwareAddress) -> bool {
        self.peers.contains_key(address)
    }

    /// Build the frame for a transmission. Unicast requires a registered destination;
    /// a destination registered with a key gets a sealed body.
    pub fn outbound(
        &self,
        src: HardwareAddress,
        dst: HardwareAddress,
        payload: &[u8],
    ) -> Result<AirFrame, DriverError> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
            return Err(DriverError::PayloadLength(payload.len()));
        }
        if dst.is_broadcast() {
            return Ok(AirFrame {
                src,
                dst,
                sealed: false,
                body: payload.to_vec(),
            });
        }
        match self.peers.get(&dst) {
            None => Err(DriverError::UnknownPeer(dst)),
            Some(None) => Ok(AirFrame {
                src,
                dst,
                sealed: false,
                body: payload.to_vec(),
            }),
            Some(Some(key)) => {
                let frame_key = crypto::derive_frame_key(&self.master_key, key);
                let body = crypto::seal(&frame_key, payload)
                    .map_err(|e| DriverError::Io(e.to_string()))?;
                Ok(AirFrame {
                    src,
                    dst,
                    sealed: true,
                    body,
                })
            }
        }
    }

    /// Recover the payload of a received frame.
    pub fn inbound(&self, frame: &AirFrame) -> Result<Vec<u8>, AirError> {
        if !frame.sealed {
            return Ok(frame.body.clone());
        }
        let key = self
            .peers
            .get(&frame.src)
            .copied()
            .flatten()
            .ok_or(AirError::NoKey(frame.src))?;
        let frame_key = crypto::derive_frame_key(&self.master_key, &key);
        Ok(crypto::open(&frame_key, &frame.body)?)
    }
}

impl Default for DriverPeers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> HardwareAddress {
        HardwareAddress::new([0x02, 0, 0, 0, 0, n])
    }

    #[test]
    fn unicast_requires_registered_peer() {
        let peers = DriverPeers::new();
        assert!(matches!(
            peers.outbound(addr(1), addr(2), b"x"),
            Err(DriverError::UnknownPeer(_))
        ));
        assert!(peers.outbound(addr(1), HardwareAddress::BROADCAST, b"x").is_ok());
    }

    #[test]
    fn secure_peers_exchange_sealed_frames() {
        let key = [5u8; KEY_LEN];
        let mut alice = DriverPeers::new();
        let mut bob = DriverPeers::new();
        alice.add(addr(2), Some(&key)).unwrap();
        bob.add(addr(1), Some(&key)).unwrap();

        let frame = alice.outbound(addr(1), addr(2), b"secret").unwrap();
        assert!(frame.sealed);
        let wire = frame.encode().unwrap();
        let received = AirFrame::decode(&wire).unwrap();
        assert_eq!(bob.inbound(&received).unwrap(), b"secret");

        let stranger = DriverPeers::new();
        assert!(matches!(stranger.inbound(&received), Err(AirError::NoKey(_))));
    }

    #[test]
    fn mismatched_master_key_fails_to_open() {
        let key = [5u8; KEY_LEN];
        let mut alice = DriverPeers::new();
        let mut bob = DriverPeers::new();
        alice.add(addr(2), Some(&key)).unwrap();
        bob.add(addr(1), Some(&key)).unwrap();
        bob.set_master_key(b"PLEASE_CHANGE_ME");

        let frame = alice.outbound(addr(1), addr(2), b"secret").unwrap();
        assert!(matches!(bob.inbound(&frame), Err(AirError::Crypto(_))));
    }

    #[test]
    fn rejects_oversized_payload() {
        let peers = DriverPeers::new();
        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            peers.outbound(addr(1), HardwareAddress::BROADCAST, &big),
            Err(DriverError::PayloadLength(_))
        ));
    }
}
