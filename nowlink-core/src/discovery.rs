//! Server discovery: client-side channel scan and server-side probe responder.
//!
//! The scan is a polled state machine. The host calls [`ClientScan::step`] once per
//! cooperative step with the frames received since the previous step and the
//! current wall-clock time in milliseconds. Channels are visited in ascending
//! order; on each visit the client broadcasts up to `probes_per_channel` probes,
//! `probe_interval_ms` apart, and waits one more interval for an answer before
//! moving on. After the last channel the sweep starts over until `timeout_ms`.

use tracing::{debug, info, warn};

use crate::address::{Channel, HardwareAddress};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::radio::{Inbound, LinkError, RadioDriver, RadioLink};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Last channel of the default scan range (the channel set every region allows).
pub const DEFAULT_LAST_CHANNEL: u8 = 11;
pub const DEFAULT_PROBES_PER_CHANNEL: u8 = 3;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 50;
/// How long a client looks for a server before giving up.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub first_channel: Channel,
    pub last_channel: Channel,
    pub probes_per_channel: u8,
    pub probe_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            first_channel: Channel::MIN,
            last_channel: Channel::new(DEFAULT_LAST_CHANNEL).unwrap_or(Channel::MAX),
            probes_per_channel: DEFAULT_PROBES_PER_CHANNEL,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
        }
    }
}

impl DiscoveryConfig {
    /// Time spent on one channel visit.
    pub fn channel_dwell_ms(&self) -> u64 {
        u64::from(self.probes_per_channel.max(1)) * self.probe_interval_ms
    }
}

/// Where a server was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub channel: Channel,
    pub server: HardwareAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Scanning { channel: Channel },
    Found(DiscoveryResult),
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

struct Visit {
    channel: Channel,
    nonce: u32,
    probes_sent: u8,
    last_probe_at: u64,
}

/// Client side of discovery.
pub struct ClientScan {
    config: DiscoveryConfig,
    own: HardwareAddress,
    started_at: u64,
    visit: Option<Visit>,
    sweeps: u32,
    finished: Option<DiscoveryStatus>,
}

impl ClientScan {
    pub fn new(config: DiscoveryConfig, own: HardwareAddress, now: u64) -> Self {
        Self {
            config,
            own,
            started_at: now,
            visit: None,
            sweeps: 0,
            finished: None,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn current_channel(&self) -> Option<Channel> {
        self.visit.as_ref().map(|v| v.channel)
    }

    /// Nonce of the current channel visit.
    pub fn current_nonce(&self) -> Option<u32> {
        self.visit.as_ref().map(|v| v.nonce)
    }

    /// Completed passes over the whole channel range.
    pub fn sweeps(&self) -> u32 {
        self.sweeps
    }

    pub fn elapsed_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_at)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Advance the scan. Once `Found` or `NotFound` is returned, every later call returns
    /// the same status and ignores its frames.
    pub fn step<D: RadioDriver>(
        &mut self,
        link: &mut RadioLink<D>,
        inbound: &[Inbound],
        now: u64,
    ) -> Result<DiscoveryStatus, DiscoveryError> {
        if let Some(done) = self.finished {
            return Ok(done);
        }

        if let Some(result) = inbound.iter().find_map(|frame| self.accept(frame)) {
            info!(
                channel = %result.channel,
                server = %result.server,
                elapsed_ms = self.elapsed_ms(now),
                "server found"
            );
            let status = DiscoveryStatus::Found(result);
            self.finished = Some(status);
            return Ok(status);
        }

        if self.elapsed_ms(now) >= self.config.timeout_ms {
            info!(
                elapsed_ms = self.elapsed_ms(now),
                sweeps = self.sweeps,
                "no server found"
            );
            self.finished = Some(DiscoveryStatus::NotFound);
            return Ok(DiscoveryStatus::NotFound);
        }

        let (channel, probes_sent, last_probe_at) = match &self.visit {
            None => {
                let first = self.config.first_channel;
                self.tune(link, first, now)?;
                return Ok(DiscoveryStatus::Scanning { channel: first });
            }
            Some(v) => (v.channel, v.probes_sent, v.last_probe_at),
        };

        if now.saturating_sub(last_probe_at) >= self.config.probe_interval_ms {
            if probes_sent < self.config.probes_per_channel {
                self.probe(link, now)?;
            } else {
                let next = match channel.next_up_to(self.config.last_channel) {
                    Some(next) => next,
                    None => {
                        self.sweeps += 1;
                        self.config.first_channel
                    }
                };
                self.tune(link, next, now)?;
                return Ok(DiscoveryStatus::Scanning { channel: next });
            }
        }
        Ok(DiscoveryStatus::Scanning { channel })
    }

    fn tune<D: RadioDriver>(
        &mut self,
        link: &mut RadioLink<D>,
        channel: Channel,
        now: u64,
    ) -> Result<(), DiscoveryError> {
        link.set_channel(channel)?;
        self.visit = Some(Visit {
            channel,
            nonce: rand::random(),
            probes_sent: 0,
            last_probe_at: now,
        });
        debug!(channel = %channel, "probing");
        self.probe(link, now)
    }

    fn probe<D: RadioDriver>(
        &mut self,
        link: &mut RadioLink<D>,
        now: u64,
    ) -> Result<(), DiscoveryError> {
        let Some(visit) = self.visit.as_mut() else {
            return Ok(());
        };
        let frame = wire::encode_frame(&Message::probe(self.own, visit.nonce))?;
        visit.probes_sent += 1;
        visit.last_probe_at = now;
        if let Err(e) = link.send_broadcast(&frame) {
            warn!(channel = %visit.channel, error = %e, "probe not sent");
        }
        Ok(())
    }

    /// Validate one received frame against the current visit.
    fn accept(&self, frame: &Inbound) -> Option<DiscoveryResult> {
        let visit = self.visit.as_ref()?;
        let msg = match wire::decode_frame(&frame.payload) {
            Ok(msg) => msg,
            Err(FrameDecodeError::NotDiscovery) => return None,
            Err(e) => {
                debug!(from = %frame.from, error = %e, "malformed discovery frame");
                return None;
            }
        };
        let Message::Advertisement {
            protocol_version,
            server,
            channel,
            nonce,
        } = msg
        else {
            return None;
        };
        let reject = |reason: &str| {
            debug!(from = %frame.from, channel = %visit.channel, reason, "advertisement rejected");
            None
        };
        if protocol_version != PROTOCOL_VERSION {
            return reject("protocol version");
        }
        if nonce != visit.nonce {
            return reject("stale nonce");
        }
        if channel != visit.channel {
            return reject("channel mismatch");
        }
        if server != frame.from {
            return reject("address mismatch");
        }
        if server.is_broadcast() || server == self.own {
            return reject("invalid server address");
        }
        Some(DiscoveryResult { channel, server })
    }
}

/// How a server answered a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisedVia {
    Unicast,
    /// Prober could not be registered as a peer.
    Broadcast,
}

/// Server side: answer a probe from `from` with our address and channel.
/// Stateless; every valid probe is answered. Returns `None` for frames that are not
/// answerable probes.
pub fn answer_probe<D: RadioDriver>(
    link: &mut RadioLink<D>,
    from: HardwareAddress,
    msg: &Message,
) -> Result<Option<AdvertisedVia>, DiscoveryError> {
    let Message::Probe {
        protocol_version,
        client,
        nonce,
    } = msg
    else {
        return Ok(None);
    };
    if *protocol_version != PROTOCOL_VERSION || *client != from {
        debug!(from = %from, "ignoring probe");
        return Ok(None);
    }
    let channel = link.channel().ok_or(LinkError::NotInitialized)?;
    let frame = wire::encode_frame(&Message::advertisement(
        link.hardware_address(),
        channel,
        *nonce,
    ))?;
    if link.find_peer(&from) {
        link.send(from, &frame)?;
        debug!(client = %from, "advertised");
        Ok(Some(AdvertisedVia::Unicast))
    } else {
        link.send_broadcast(&frame)?;
        debug!(client = %from, "advertised by broadcast");
        Ok(Some(AdvertisedVia::Broadcast))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimEther, SimRadio};

    const CLIENT: HardwareAddress = HardwareAddress::new([0x02, 0, 0, 0, 0, 0x0C]);
    const SERVER: HardwareAddress = HardwareAddress::new([0x02, 0, 0, 0, 0, 0x5E]);
    const ROGUE: HardwareAddress = HardwareAddress::new([0x02, 0, 0, 0, 0, 0xBD]);

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            first_channel: ch(1),
            last_channel: ch(11),
            probes_per_channel: 2,
            probe_interval_ms: 20,
            timeout_ms: 2_000,
        }
    }

    fn client_link(ether: &SimEther) -> RadioLink<SimRadio> {
        let mut link = RadioLink::new(ether.radio(CLIENT));
        link.initialize(None).unwrap();
        link
    }

    /// Minimal server loop: add unknown senders, answer probes.
    fn serve(server: &mut RadioLink<SimRadio>) {
        for frame in server.poll() {
            let _ = server.add_peer(frame.from);
            if let Ok(msg) = wire::decode_frame(&frame.payload) {
                answer_probe(server, frame.from, &msg).unwrap();
            }
        }
    }

    fn inject_advert(ether: &SimEther, on: Channel, from: HardwareAddress, msg: Message) {
        let frame = wire::encode_frame(&msg).unwrap();
        ether.inject(on, from, CLIENT, &frame);
    }

    #[test]
    fn binds_to_server_channel_and_rejects_fakes() {
        let ether = SimEther::new();
        let mut server = RadioLink::new(ether.radio(SERVER));
        server.initialize(Some(ch(7))).unwrap();
        let mut client = client_link(&ether);
        let mut scan = ClientScan::new(test_config(), CLIENT, 0);

        let mut faked = Vec::new();
        let mut visited = Vec::new();
        let mut now = 0;
        let result = loop {
            serve(&mut server);
            let inbound = client.poll();
            let status = scan.step(&mut client, &inbound, now).unwrap();
            match status {
                DiscoveryStatus::Found(result) => break result,
                DiscoveryStatus::NotFound => panic!("server on channel 7 not found"),
                DiscoveryStatus::Scanning { channel } => {
                    if visited.last() != Some(&channel) {
                        visited.push(channel);
                    }
                    if channel.get() < 7 && !faked.contains(&channel) {
                        faked.push(channel);
                        let nonce = scan.current_nonce().unwrap();
                        let fake = match channel.get() % 4 {
                            // stale: answer to an older probe
                            0 => Message::advertisement(ROGUE, channel, nonce.wrapping_add(1)),
                            // claims another channel
                            1 => Message::advertisement(ROGUE, ch(7), nonce),
                            // claims to be someone else
                            2 => Message::advertisement(SERVER, channel, nonce),
                            // wrong protocol version
                            _ => Message::Advertisement {
                                protocol_version: PROTOCOL_VERSION + 1,
                                server: ROGUE,
                                channel,
                                nonce,
                            },
                        };
                        inject_advert(&ether, channel, ROGUE, fake);
                    }
                }
            }
            now += 5;
            assert!(now < 10_000);
        };

        assert_eq!(result, DiscoveryResult { channel: ch(7), server: SERVER });
        assert_eq!(faked.len(), 6);
        assert_eq!(visited, (1..=7).map(ch).collect::<Vec<_>>());
        assert_eq!(scan.sweeps(), 0);
        // Later calls keep the first result.
        let again = scan.step(&mut client, &[], now + 1_000_000).unwrap();
        assert_eq!(again, DiscoveryStatus::Found(result));
    }

    #[test]
    fn times_out_within_one_probe_interval() {
        let ether = SimEther::new();
        let mut client = client_link(&ether);
        let config = test_config();
        let interval = config.probe_interval_ms;
        let timeout = config.timeout_ms;
        let start = 1_000;
        let mut scan = ClientScan::new(config, CLIENT, start);

        let mut now = start;
        loop {
            let inbound = client.poll();
            match scan.step(&mut client, &inbound, now).unwrap() {
                DiscoveryStatus::NotFound => break,
                DiscoveryStatus::Found(_) => panic!("nobody is serving"),
                DiscoveryStatus::Scanning { .. } => {}
            }
            now += interval;
        }
        let elapsed = now - start;
        assert!(elapsed >= timeout && elapsed <= timeout + interval, "elapsed {elapsed}");
        // 2 probes * 20 ms over 11 channels = 440 ms per sweep.
        assert_eq!(scan.sweeps(), 4);
    }

    #[test]
    fn probes_channels_in_ascending_order() {
        let ether = SimEther::new();
        let mut client = client_link(&ether);
        let mut config = test_config();
        config.timeout_ms = config.channel_dwell_ms() * 12;
        let mut scan = ClientScan::new(config.clone(), CLIENT, 0);
        let mut now = 0;
        while !scan.is_finished() {
            scan.step(&mut client, &[], now).unwrap();
            now += 1;
        }
        client.poll();

        let probes: Vec<(Channel, Message)> = ether
            .history()
            .into_iter()
            .filter(|(_, f)| f.src == CLIENT && f.dst.is_broadcast())
            .map(|(c, f)| (c, wire::decode_frame(&f.body).unwrap()))
            .collect();
        let channels: Vec<u8> = probes.iter().map(|(c, _)| c.get()).collect();
        let mut expected: Vec<u8> = (1..=11).flat_map(|c| [c, c]).collect();
        expected.extend([1, 1]);
        assert_eq!(channels, expected);
        // Each visit uses one nonce for both probes, and a new one on the next visit.
        let nonce_of = |i: usize| match probes[i].1 {
            Message::Probe { nonce, .. } => nonce,
            _ => panic!("expected probe"),
        };
        assert_eq!(nonce_of(0), nonce_of(1));
        assert_ne!(nonce_of(1), nonce_of(2));
    }

    #[test]
    fn late_answer_from_earlier_channel_is_ignored() {
        let ether = SimEther::new();
        let mut client = client_link(&ether);
        let mut scan = ClientScan::new(test_config(), CLIENT, 0);
        let mut now = 0;
        scan.step(&mut client, &[], now).unwrap();
        let first_nonce = scan.current_nonce().unwrap();
        while scan.current_channel() == Some(ch(1)) {
            now += 10;
            scan.step(&mut client, &[], now).unwrap();
        }
        assert_eq!(scan.current_channel(), Some(ch(2)));
        let late = Inbound {
            from: SERVER,
            payload: wire::encode_frame(&Message::advertisement(SERVER, ch(1), first_nonce))
                .unwrap(),
        };
        let status = scan.step(&mut client, &[late], now).unwrap();
        assert_eq!(status, DiscoveryStatus::Scanning { channel: ch(2) });
    }

    #[test]
    fn server_answers_every_probe_without_state() {
        let ether = SimEther::new();
        let mut server = RadioLink::new(ether.radio(SERVER));
        server.initialize(Some(ch(4))).unwrap();
        server.add_peer(CLIENT).unwrap();

        let probe = Message::probe(CLIENT, 99);
        for _ in 0..3 {
            assert_eq!(
                answer_probe(&mut server, CLIENT, &probe).unwrap(),
                Some(AdvertisedVia::Unicast)
            );
        }
        // Unknown prober gets a broadcast answer.
        let other = HardwareAddress::new([0x02, 0, 0, 0, 0, 0x77]);
        assert_eq!(
            answer_probe(&mut server, other, &Message::probe(other, 5)).unwrap(),
            Some(AdvertisedVia::Broadcast)
        );
        // Spoofed client field is ignored.
        assert_eq!(answer_probe(&mut server, other, &probe).unwrap(), None);
        // Advertisements are not answered.
        let advert = Message::advertisement(other, ch(4), 1);
        assert_eq!(answer_probe(&mut server, other, &advert).unwrap(), None);

        server.poll();
        let adverts: Vec<Message> = ether
            .history()
            .into_iter()
            .filter(|(_, f)| f.src == SERVER)
            .map(|(_, f)| wire::decode_frame(&f.body).unwrap())
            .collect();
        assert_eq!(adverts.len(), 4);
        assert_eq!(adverts[0], Message::advertisement(SERVER, ch(4), 99));
    }
}
