//! In-process radio medium for tests and host-side experiments.
//!
//! [`SimEther`] holds every simulated station. Transmissions are queued with the
//! sender's channel at transmit time and delivered the next time any radio is
//! serviced, to each station tuned to that channel whose address matches the
//! destination (or every station, for broadcast). A unicast produces a
//! send-result callback: delivered if at least one station accepted the frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::address::{Channel, HardwareAddress};
use crate::air::{AirFrame, DriverPeers};
use crate::peer::{PeerKey, KEY_LEN};
use crate::radio::{DriverError, EventSink, RadioDriver};

/// Transmissions kept by [`SimEther::history`]; older ones are discarded.
pub const HISTORY_CAPACITY: usize = 1024;

struct Station {
    address: HardwareAddress,
    channel: Option<Channel>,
    sink: Option<EventSink>,
    peers: DriverPeers,
    fail_next_configure: bool,
}

struct Transmission {
    channel: Channel,
    frame: AirFrame,
}

#[derive(Default)]
struct EtherState {
    stations: Vec<Station>,
    queue: VecDeque<Transmission>,
    history: VecDeque<(Channel, AirFrame)>,
}

impl EtherState {
    fn station(&self, address: &HardwareAddress) -> Option<&Station> {
        self.stations.iter().find(|s| s.address == *address)
    }

    fn station_mut(&mut self, address: &HardwareAddress) -> Option<&mut Station> {
        self.stations.iter_mut().find(|s| s.address == *address)
    }
}

/// Shared simulated medium. Clones refer to the same medium.
#[derive(Clone, Default)]
pub struct SimEther {
    inner: Arc<Mutex<EtherState>>,
}

impl SimEther {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EtherState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle to the station with `address`, creating the station on first use.
    /// Several handles to one station share its single callback registration.
    pub fn radio(&self, address: HardwareAddress) -> SimRadio {
        let mut state = self.lock();
        if state.station(&address).is_none() {
            state.stations.push(Station {
                address,
                channel: None,
                sink: None,
                peers: DriverPeers::new(),
                fail_next_configure: false,
            });
        }
        SimRadio {
            ether: self.clone(),
            address,
        }
    }

    /// Make the next `configure` of this station fail.
    pub fn fail_next_configure(&self, address: HardwareAddress) {
        if let Some(station) = self.lock().station_mut(&address) {
            station.fail_next_configure = true;
        }
    }

    /// Channel the station is tuned to, `None` when idle or in discovery mode.
    pub fn channel_of(&self, address: &HardwareAddress) -> Option<Channel> {
        self.lock().station(address).and_then(|s| s.channel)
    }

    /// Put a raw, unsealed frame on `channel` from a transmitter that is not a station.
    pub fn inject(
        &self,
        channel: Channel,
        src: HardwareAddress,
        dst: HardwareAddress,
        payload: &[u8],
    ) {
        let frame = AirFrame {
            src,
            dst,
            sealed: false,
            body: payload.to_vec(),
        };
        self.lock().queue.push_back(Transmission { channel, frame });
    }

    /// The last [`HISTORY_CAPACITY`] frames put on the medium, oldest first, with their channel.
    pub fn history(&self) -> Vec<(Channel, AirFrame)> {
        self.lock().history.iter().cloned().collect()
    }

    /// Deliver every queued transmission.
    pub fn pump(&self) {
        let mut receptions: Vec<(EventSink, HardwareAddress, Vec<u8>)> = Vec::new();
        let mut results: Vec<(EventSink, HardwareAddress, bool)> = Vec::new();
        {
            let mut state = self.lock();
            let queue: Vec<Transmission> = state.queue.drain(..).collect();
            for tx in queue {
                let mut accepted = false;
                for station in &state.stations {
                    if station.channel != Some(tx.channel)
                        || station.address == tx.frame.src
                        || !tx.frame.is_for(&station.address)
                    {
                        continue;
                    }
                    let Some(sink) = &station.sink else { continue };
                    match station.peers.inbound(&tx.frame) {
                        Ok(payload) => {
                            receptions.push((sink.clone(), tx.frame.src, payload));
                            accepted = true;
                        }
                        Err(e) => {
                            debug!(station = %station.address, error = %e, "frame dropped")
                        }
                    }
                }
                if !tx.frame.dst.is_broadcast() {
                    if let Some(sink) = state.station(&tx.frame.src).and_then(|s| s.sink.clone()) {
                        results.push((sink, tx.frame.dst, accepted));
                    }
                }
                if state.history.len() >= HISTORY_CAPACITY {
                    state.history.pop_front();
                }
                state.history.push_back((tx.channel, tx.frame));
            }
        }
        for (sink, from, payload) in receptions {
            sink.on_receive(from, &payload);
        }
        for (sink, peer, delivered) in results {
            sink.on_send(peer, delivered);
        }
    }
}

/// Driver handle for one simulated station.
#[derive(Clone)]
pub struct SimRadio {
    ether: SimEther,
    address: HardwareAddress,
}

impl SimRadio {
    fn with_station<T>(
        &self,
        f: impl FnOnce(&mut Station) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut state = self.ether.lock();
        let station = state
            .station_mut(&self.address)
            .ok_or(DriverError::NotConfigured)?;
        f(station)
    }

    pub fn ether(&self) -> &SimEther {
        &self.ether
    }
}

impl RadioDriver for SimRadio {
    fn hardware_address(&self) -> HardwareAddress {
        self.address
    }

    fn attach(&mut self, sink: EventSink) -> Result<(), DriverError> {
        self.with_station(|station| {
            if station.sink.is_some() {
                return Err(DriverError::Busy);
            }
            station.sink = Some(sink);
            Ok(())
        })
    }

    fn detach(&mut self) {
        let _ = self.with_station(|station| {
            station.sink = None;
            Ok(())
        });
    }

    fn configure(&mut self, channel: Option<Channel>) -> Result<(), DriverError> {
        self.with_station(|station| {
            if station.fail_next_configure {
                station.fail_next_configure = false;
                return Err(DriverError::Configure("injected fault".into()));
            }
            station.channel = channel;
            Ok(())
        })
    }

    fn shutdown(&mut self) {
        let _ = self.with_station(|station| {
            station.channel = None;
            station.peers.clear();
            Ok(())
        });
    }

    fn set_master_key(&mut self, key: &[u8; KEY_LEN]) -> Result<(), DriverError> {
        self.with_station(|station| {
            station.peers.set_master_key(key);
            Ok(())
        })
    }

    fn add_peer(
        &mut self,
        address: HardwareAddress,
        key: Option<&PeerKey>,
    ) -> Result<(), DriverError> {
        self.with_station(|station| station.peers.add(address, key))
    }

    fn remove_peer(&mut self, address: &HardwareAddress) -> Result<(), DriverError> {
        self.with_station(|station| {
            station.peers.remove(address);
            Ok(())
        })
    }

    fn transmit(&mut self, dest: HardwareAddress, payload: &[u8]) -> Result<(), DriverError> {
        let mut state = self.ether.lock();
        let station = state
            .station(&self.address)
            .ok_or(DriverError::NotConfigured)?;
        let channel = station.channel.ok_or(DriverError::NotConfigured)?;
        let frame = station.peers.outbound(self.address, dest, payload)?;
        state.queue.push_back(Transmission { channel, frame });
        Ok(())
    }

    fn service(&mut self) {
        self.ether.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{Inbound, RadioLink};

    fn addr(n: u8) -> HardwareAddress {
        HardwareAddress::new([0x02, 0, 0, 0, 0, n])
    }

    fn link(ether: &SimEther, n: u8, channel: u8) -> RadioLink<SimRadio> {
        let mut link = RadioLink::new(ether.radio(addr(n)));
        link.initialize(Channel::new(channel)).unwrap();
        link
    }

    #[test]
    fn history_keeps_latest_frames() {
        let ether = SimEther::new();
        let ch = Channel::MIN;
        for i in 0..HISTORY_CAPACITY + 5 {
            let payload = (i as u32).to_le_bytes();
            ether.inject(ch, addr(9), HardwareAddress::BROADCAST, &payload);
        }
        ether.pump();
        let history = ether.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].1.body, 5u32.to_le_bytes().to_vec());
        assert_eq!(
            history[HISTORY_CAPACITY - 1].1.body,
            ((HISTORY_CAPACITY + 4) as u32).to_le_bytes().to_vec()
        );
    }

    #[test]
    fn delivery_is_per_channel() {
        let ether = SimEther::new();
        let mut a = link(&ether, 1, 1);
        let mut b = link(&ether, 2, 1);
        let mut c = link(&ether, 3, 2);

        a.send_broadcast(b"hi").unwrap();
        assert_eq!(
            b.poll(),
            vec![Inbound {
                from: addr(1),
                payload: b"hi".to_vec()
            }]
        );
        assert!(c.poll().is_empty());
        assert!(a.poll().is_empty());
        assert_eq!(ether.history().len(), 1);
        assert_eq!(ether.history()[0].0, Channel::new(1).unwrap());
    }

    #[test]
    fn channel_is_captured_at_transmit_time() {
        let ether = SimEther::new();
        let mut a = link(&ether, 1, 1);
        let mut b = link(&ether, 2, 1);
        a.send_broadcast(b"on one").unwrap();
        b.set_channel(Channel::new(2).unwrap()).unwrap();
        assert!(b.poll().is_empty());
        assert_eq!(ether.channel_of(&addr(2)), Channel::new(2));
    }

    #[test]
    fn injected_frames_reach_tuned_stations() {
        let ether = SimEther::new();
        let mut a = link(&ether, 1, 5);
        ether.inject(
            Channel::new(5).unwrap(),
            addr(9),
            HardwareAddress::BROADCAST,
            b"rogue",
        );
        ether.inject(Channel::new(4).unwrap(), addr(9), addr(1), b"elsewhere");
        let got = a.poll();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from, addr(9));
    }

    #[test]
    fn idle_station_receives_nothing() {
        let ether = SimEther::new();
        let mut a = link(&ether, 1, 1);
        let mut b = RadioLink::new(ether.radio(addr(2)));
        b.initialize(None).unwrap();
        a.send_broadcast(b"hi").unwrap();
        assert!(b.poll().is_empty());
        assert_eq!(ether.channel_of(&addr(2)), None);
    }
}
