//! Load config from file and environment.

use anyhow::{bail, Context};
use nowlink_core::discovery::DEFAULT_DISCOVERY_TIMEOUT_MS;
use nowlink_core::schedule::{SendMode, DEFAULT_SEND_PERIOD_MS};
use nowlink_core::{
    Channel, DiscoveryConfig, HardwareAddress, NodeConfig, Preset, KEY_LEN, MAX_PAYLOAD_LEN,
};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Discover a server, serve if none answers.
    Auto,
    Server,
    Client,
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Role::Auto),
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            _ => Err(()),
        }
    }
}

/// Daemon configuration. File: ~/.config/nowlink/config.toml or /etc/nowlink/config.toml.
/// Env overrides: NOWLINK_ROLE, NOWLINK_CHANNEL, NOWLINK_SERVER, NOWLINK_PORT_BASE,
/// NOWLINK_SEND_PERIOD_MS, NOWLINK_BROADCAST.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Server channel (role server/auto) or the known server's channel (role client).
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Known server address, required for role client.
    #[serde(default)]
    pub server: Option<String>,
    /// Emulated channel N uses UDP port `port_base + N` (default 47600).
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_send_period_ms")]
    pub send_period_ms: u64,
    /// Broadcast application messages instead of unicasting to every peer.
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// 16 ASCII characters.
    #[serde(default)]
    pub master_key: Option<String>,
    /// Station uplink, reported only.
    #[serde(default)]
    pub station_ssid: Option<String>,
    /// Payload of the periodic send.
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_role() -> Role {
    Role::Auto
}
fn default_channel() -> u8 {
    1
}
fn default_port_base() -> u16 {
    47600
}
fn default_send_period_ms() -> u64 {
    DEFAULT_SEND_PERIOD_MS
}
fn default_discovery_timeout_ms() -> u64 {
    DEFAULT_DISCOVERY_TIMEOUT_MS
}
fn default_message() -> String {
    "hello from nowlink".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            channel: default_channel(),
            server: None,
            port_base: default_port_base(),
            send_period_ms: default_send_period_ms(),
            broadcast: false,
            discovery_timeout_ms: default_discovery_timeout_ms(),
            master_key: None,
            station_ssid: None,
            message: default_message(),
        }
    }
}

impl Config {
    pub fn send_mode(&self) -> SendMode {
        if self.broadcast {
            SendMode::Broadcast
        } else {
            SendMode::Unicast
        }
    }

    /// Validate and translate into the node's configuration.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let channel = Channel::try_from(self.channel).context("channel")?;
        if self.message.is_empty() || self.message.len() > MAX_PAYLOAD_LEN {
            bail!("message must be 1..={MAX_PAYLOAD_LEN} bytes");
        }
        let preset = match self.role {
            Role::Auto => Preset::Discover,
            Role::Server => Preset::Server { channel },
            Role::Client => {
                let Some(server) = &self.server else {
                    bail!("role client needs a server address");
                };
                let server: HardwareAddress = server
                    .parse()
                    .with_context(|| format!("server address {server:?}"))?;
                Preset::Client { channel, server }
            }
        };
        let master_key = match &self.master_key {
            None => None,
            Some(key) => {
                let bytes: [u8; KEY_LEN] = key
                    .as_bytes()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("master_key must be {KEY_LEN} bytes"))?;
                Some(bytes)
            }
        };
        Ok(NodeConfig {
            preset,
            discovery: DiscoveryConfig {
                timeout_ms: self.discovery_timeout_ms,
                ..DiscoveryConfig::default()
            },
            server_channel: channel,
            master_key,
        })
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

/// Values that fail to parse are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(role) = var("NOWLINK_ROLE").and_then(|s| s.parse().ok()) {
        c.role = role;
    }
    if let Some(ch) = var("NOWLINK_CHANNEL").and_then(|s| s.parse().ok()) {
        c.channel = ch;
    }
    if let Some(server) = var("NOWLINK_SERVER") {
        c.server = Some(server);
    }
    if let Some(p) = var("NOWLINK_PORT_BASE").and_then(|s| s.parse().ok()) {
        c.port_base = p;
    }
    if let Some(ms) = var("NOWLINK_SEND_PERIOD_MS").and_then(|s| s.parse().ok()) {
        c.send_period_ms = ms;
    }
    if let Some(b) = var("NOWLINK_BROADCAST").and_then(|s| parse_bool(&s)) {
        c.broadcast = b;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nowlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/nowlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "config file ignored")
                    }
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "config file unreadable"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn file_fields_and_defaults() {
        let c: Config = toml::from_str("role = \"server\"\nchannel = 6\n").unwrap();
        assert_eq!(c.role, Role::Server);
        assert_eq!(c.channel, 6);
        assert_eq!(c.port_base, 47600);
        assert_eq!(c.send_period_ms, DEFAULT_SEND_PERIOD_MS);
        assert!(!c.broadcast);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("NOWLINK_ROLE", "Client"),
                ("NOWLINK_CHANNEL", "nine"),
                ("NOWLINK_SERVER", "02:00:00:00:00:5E"),
                ("NOWLINK_PORT_BASE", "50000"),
                ("NOWLINK_BROADCAST", "yes"),
            ]),
        );
        assert_eq!(c.role, Role::Client);
        assert_eq!(c.channel, 1);
        assert_eq!(c.port_base, 50000);
        assert!(c.broadcast);
        assert_eq!(c.send_mode(), SendMode::Broadcast);

        let node = c.node_config().unwrap();
        assert_eq!(
            node.preset,
            Preset::Client {
                channel: Channel::MIN,
                server: HardwareAddress::new([2, 0, 0, 0, 0, 0x5E]),
            }
        );
    }

    #[test]
    fn node_config_validation() {
        let mut c = Config {
            channel: 0,
            ..Config::default()
        };
        assert!(c.node_config().is_err());

        c.channel = 3;
        c.role = Role::Client;
        assert!(c.node_config().is_err());

        c.role = Role::Auto;
        c.master_key = Some("short".into());
        assert!(c.node_config().is_err());

        c.master_key = Some("PLEASE_CHANGE_ME".into());
        let node = c.node_config().unwrap();
        assert_eq!(node.preset, Preset::Discover);
        assert_eq!(node.server_channel.get(), 3);
        assert_eq!(node.master_key, Some(*b"PLEASE_CHANGE_ME"));
        assert_eq!(node.discovery.timeout_ms, DEFAULT_DISCOVERY_TIMEOUT_MS);
    }
}
