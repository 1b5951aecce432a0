// nowlink Linux: node daemon with the radio emulated over UDP multicast.

mod config;
mod udp_radio;

use std::time::{Duration, Instant};

use anyhow::Context;
use nowlink_core::{
    HardwareAddress, Node, NodeEvent, NodeState, PeriodicSend, SendOutcome, SendReport, Uplink,
};
use tracing::{debug, info, warn};

use crate::udp_radio::UdpRadio;

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Main loop period; discovery probing runs at this resolution.
const TICK: Duration = Duration::from_millis(10);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nowlink-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let node_config = cfg.node_config().context("invalid configuration")?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cfg, node_config))
}

async fn run(cfg: config::Config, node_config: nowlink_core::NodeConfig) -> anyhow::Result<()> {
    let address = HardwareAddress::random_local();
    info!(%address, version = VERSION, role = ?cfg.role, "nowlink starting");

    let mut node = Node::new(UdpRadio::new(address, cfg.port_base), node_config);
    if let Some(ssid) = &cfg.station_ssid {
        node.set_uplink(Uplink::Station { ssid: ssid.clone() });
    }

    let started = Instant::now();
    let now_ms = || started.elapsed().as_millis() as u64;

    for event in node.start(now_ms()).context("node start failed")? {
        log_event(&event);
    }

    let mut sender = PeriodicSend::new(cfg.send_period_ms, cfg.send_mode());
    let mut last_outcome: Option<SendOutcome> = None;
    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut send_now = send_now_signal()?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = send_now.recv() => {
                info!("send requested");
                sender.trigger();
            }
            _ = tick.tick() => {
                let now = now_ms();
                for event in node.poll(now).context("node stopped")? {
                    log_event(&event);
                }
                if !matches!(node.state(), NodeState::ClientBound | NodeState::ServerActive) {
                    continue;
                }
                match sender.poll(node.link_mut(), cfg.message.as_bytes(), now) {
                    SendReport::NotDue | SendReport::Sent => {}
                    SendReport::NoPeers => debug!("no peers yet"),
                    SendReport::Rejected(e) => warn!(error = %e, "send rejected"),
                }
                let outcome = node.link().last_send_outcome();
                if outcome != last_outcome {
                    if let Some(o) = outcome {
                        if o.delivered {
                            debug!(peer = %o.peer, "delivery success");
                        } else {
                            warn!(peer = %o.peer, "delivery fail");
                        }
                    }
                    last_outcome = outcome;
                }
            }
        }
    }

    let stats = node.stats();
    info!(
        received = stats.received(),
        last_sender = ?stats.last_sender(),
        dropped = node.link().dropped_frames(),
        "shutting down"
    );
    node.end();
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::Bound(result) => {
            info!(channel = %result.channel, server = %result.server, "bound to server")
        }
        NodeEvent::ServerStarted { channel } => info!(%channel, "serving"),
        NodeEvent::Received(frame) => info!(
            from = %frame.from,
            len = frame.payload.len(),
            text = %String::from_utf8_lossy(&frame.payload),
            "received"
        ),
        NodeEvent::PeerAdded(peer) => info!(%peer, "peer added"),
        NodeEvent::PeerUnreachable(peer) => warn!(%peer, "peer table full"),
    }
}

/// SIGUSR1 forces the next periodic send.
fn send_now_signal() -> anyhow::Result<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{signal, SignalKind};
    Ok(signal(SignalKind::user_defined1())?)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
