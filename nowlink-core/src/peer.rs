//! Peer table: bounded, insertion-ordered set of addresses registered for unicast.

use crate::address::HardwareAddress;

/// Length of a per-peer or master key accepted by the radio.
pub const KEY_LEN: usize = 16;

/// Maximum concurrent peers the radio can hold.
pub const DEFAULT_PEER_CAPACITY: usize = 20;

/// Maximum peers registered with a key (radio-level encryption slots).
pub const DEFAULT_SECURE_PEER_CAPACITY: usize = 6;

pub type PeerKey = [u8; KEY_LEN];

/// One registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: HardwareAddress,
    pub key: Option<PeerKey>,
}

impl Peer {
    pub fn is_secure(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerTableError {
    #[error("peer table full ({capacity} peers)")]
    Full { capacity: usize },
    #[error("secure peer slots full ({capacity} peers)")]
    SecureFull { capacity: usize },
}

pub struct PeerTable {
    peers: Vec<Peer>,
    capacity: usize,
    secure_capacity: usize,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PEER_CAPACITY, DEFAULT_SECURE_PEER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize, secure_capacity: usize) -> Self {
        Self {
            peers: Vec::with_capacity(capacity),
            capacity,
            secure_capacity: secure_capacity.min(capacity),
        }
    }

    /// Add a plain peer. Re-adding a known address is a no-op success.
    pub fn add(&mut self, address: HardwareAddress) -> Result<(), PeerTableError> {
        self.insert(address, None)
    }

    /// Add a peer with a radio-level key. Re-adding a known address is a no-op success,
    /// the stored key is left unchanged.
    pub fn add_secure(
        &mut self,
        address: HardwareAddress,
        key: PeerKey,
    ) -> Result<(), PeerTableError> {
        self.insert(address, Some(key))
    }

    /// Check whether `add`/`add_secure` would succeed, without mutating.
    pub fn check_room(
        &self,
        address: &HardwareAddress,
        secure: bool,
    ) -> Result<(), PeerTableError> {
        if self.find(address) {
            return Ok(());
        }
        if self.peers.len() >= self.capacity {
            return Err(PeerTableError::Full {
                capacity: self.capacity,
            });
        }
        if secure && self.secure_count() >= self.secure_capacity {
            return Err(PeerTableError::SecureFull {
                capacity: self.secure_capacity,
            });
        }
        Ok(())
    }

    fn insert(
        &mut self,
        address: HardwareAddress,
        key: Option<PeerKey>,
    ) -> Result<(), PeerTableError> {
        self.check_room(&address, key.is_some())?;
        if !self.find(&address) {
            self.peers.push(Peer { address, key });
        }
        Ok(())
    }

    /// Remove a peer. Removing an absent address is not an error.
    pub fn remove(&mut self, address: &HardwareAddress) -> Result<(), PeerTableError> {
        self.peers.retain(|p| p.address != *address);
        Ok(())
    }

    pub fn find(&self, address: &HardwareAddress) -> bool {
        self.peers.iter().any(|p| p.address == *address)
    }

    pub fn get(&self, address: &HardwareAddress) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == *address)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn secure_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_secure()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Peers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn addresses(&self) -> Vec<HardwareAddress> {
        self.peers.iter().map(|p| p.address).collect()
    }
}

impl Default for PeerTable {
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
    fn add_is_idempotent() {
        let mut table = PeerTable::new();
        assert!(table.add(addr(1)).is_ok());
        assert!(table.add(addr(1)).is_ok());
        assert_eq!(table.count(), 1);
        assert!(table.find(&addr(1)));
    }

    #[test]
    fn add_beyond_capacity_fails() {
        let mut table = PeerTable::with_capacity(4, 2);
        for n in 0..4 {
            table.add(addr(n)).unwrap();
        }
        assert_eq!(table.add(addr(4)), Err(PeerTableError::Full { capacity: 4 }));
        assert_eq!(table.count(), 4);
        // Known address still succeeds at capacity.
        assert!(table.add(addr(2)).is_ok());
    }

    #[test]
    fn default_capacity_rejects_twenty_first() {
        let mut table = PeerTable::new();
        for n in 0..DEFAULT_PEER_CAPACITY as u8 {
            table.add(addr(n)).unwrap();
        }
        assert!(matches!(table.add(addr(200)), Err(PeerTableError::Full { .. })));
    }

    #[test]
    fn secure_slots_are_bounded_separately() {
        let mut table = PeerTable::with_capacity(5, 1);
        table.add_secure(addr(1), [7u8; KEY_LEN]).unwrap();
        assert_eq!(
            table.add_secure(addr(2), [7u8; KEY_LEN]),
            Err(PeerTableError::SecureFull { capacity: 1 })
        );
        table.add(addr(2)).unwrap();
        assert_eq!(table.count(), 2);
        assert_eq!(table.secure_count(), 1);
        assert!(table.get(&addr(1)).unwrap().is_secure());
    }

    #[test]
    fn clear_then_count_is_zero() {
        let mut table = PeerTable::new();
        table.add(addr(1)).unwrap();
        table.add(addr(2)).unwrap();
        table.clear();
        assert_eq!(table.count(), 0);
        table.clear();
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn remove_absent_succeeds() {
        let mut table = PeerTable::new();
        assert!(table.remove(&addr(9)).is_ok());
        table.add(addr(1)).unwrap();
        table.remove(&addr(1)).unwrap();
        assert!(table.remove(&addr(1)).is_ok());
        assert!(table.is_empty());
    }

    #[test]
    fn keeps_insertion_order() {
        let mut table = PeerTable::new();
        for n in [5, 3, 9, 1] {
            table.add(addr(n)).unwrap();
        }
        table.remove(&addr(3)).unwrap();
        assert_eq!(table.addresses(), vec![addr(5), addr(9), addr(1)]);
    }
}
