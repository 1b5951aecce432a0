//! Radio emulated over UDP multicast: channel N is group 239.255.60.60 on port `base + N`.
//! Every station on a channel sees every frame; address filtering and sealing happen
//! here, as a radio firmware would do them.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use nowlink_core::air::{AirFrame, DriverPeers};
use nowlink_core::{
    Channel, DriverError, EventSink, HardwareAddress, PeerKey, RadioDriver, KEY_LEN,
};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
/// Encoded air frames are well below this.
const RECV_BUF_LEN: usize = 2048;

struct Tuned {
    channel: Channel,
    socket: UdpSocket,
    group: SocketAddr,
}

pub struct UdpRadio {
    address: HardwareAddress,
    port_base: u16,
    tuned: Option<Tuned>,
    sink: Option<EventSink>,
    peers: DriverPeers,
    /// Unicast results reported on the next `service`.
    pending: Vec<(HardwareAddress, bool)>,
}

impl UdpRadio {
    pub fn new(address: HardwareAddress, port_base: u16) -> Self {
        Self {
            address,
            port_base,
            tuned: None,
            sink: None,
            peers: DriverPeers::new(),
            pending: Vec::new(),
        }
    }

    fn open(&self, channel: Channel) -> std::io::Result<Tuned> {
        let port = self
            .port_base
            .checked_add(u16::from(channel.get()))
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "port out of range"))?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_nonblocking(true)?;
        Ok(Tuned {
            channel,
            socket: socket.into(),
            group: SocketAddrV4::new(MULTICAST_GROUP, port).into(),
        })
    }

    fn receive(&mut self) {
        let (Some(tuned), Some(sink)) = (&self.tuned, &self.sink) else {
            return;
        };
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            let len = match tuned.socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(channel = %tuned.channel, error = %e, "receive failed");
                    break;
                }
            };
            let frame = match AirFrame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "not an air frame");
                    continue;
                }
            };
            if frame.src == self.address || !frame.is_for(&self.address) {
                continue;
            }
            match self.peers.inbound(&frame) {
                Ok(payload) => sink.on_receive(frame.src, &payload),
                Err(e) => debug!(from = %frame.src, error = %e, "frame dropped"),
            }
        }
    }
}

impl RadioDriver for UdpRadio {
    fn hardware_address(&self) -> HardwareAddress {
        self.address
    }

    fn attach(&mut self, sink: EventSink) -> Result<(), DriverError> {
        if self.sink.is_some() {
            return Err(DriverError::Busy);
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn detach(&mut self) {
        self.sink = None;
    }

    fn configure(&mut self, channel: Option<Channel>) -> Result<(), DriverError> {
        match channel {
            None => self.tuned = None,
            Some(ch) if self.tuned.as_ref().map(|t| t.channel) == Some(ch) => {}
            Some(ch) => {
                // Leave the old channel before binding the new one.
                self.tuned = None;
                let tuned = self
                    .open(ch)
                    .map_err(|e| DriverError::Configure(e.to_string()))?;
                debug!(channel = %ch, group = %tuned.group, "tuned");
                self.tuned = Some(tuned);
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.tuned = None;
        self.peers.clear();
        self.pending.clear();
    }

    fn set_master_key(&mut self, key: &[u8; KEY_LEN]) -> Result<(), DriverError> {
        self.peers.set_master_key(key);
        Ok(())
    }

    fn add_peer(
        &mut self,
        address: HardwareAddress,
        key: Option<&PeerKey>,
    ) -> Result<(), DriverError> {
        self.peers.add(address, key)
    }

    fn remove_peer(&mut self, address: &HardwareAddress) -> Result<(), DriverError> {
        self.peers.remove(address);
        Ok(())
    }

    /// A unicast counts as delivered once the datagram left the socket.
    fn transmit(&mut self, dest: HardwareAddress, payload: &[u8]) -> Result<(), DriverError> {
        let tuned = self.tuned.as_ref().ok_or(DriverError::NotConfigured)?;
        let frame = self.peers.outbound(self.address, dest, payload)?;
        let bytes = frame.encode().map_err(|e| DriverError::Io(e.to_string()))?;
        tuned
            .socket
            .send_to(&bytes, tuned.group)
            .map_err(|e| DriverError::Io(e.to_string()))?;
        if !dest.is_broadcast() {
            self.pending.push((dest, true));
        }
        Ok(())
    }

    fn service(&mut self) {
        self.receive();
        let pending = std::mem::take(&mut self.pending);
        if let Some(sink) = &self.sink {
            for (peer, delivered) in pending {
                sink.on_send(peer, delivered);
            }
        }
    }
}
