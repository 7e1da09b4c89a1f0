//! Engine configuration.
//!
//! The host hands the engine an opaque TOML string when starting the
//! instance. Every section is optional except `[rendezvous]`.

use crate::error::{EngineError, EngineResult};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Default UDP bind address for the packet transport.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:0";

/// Default MTU, matching the tunnel settings the host applies.
pub const DEFAULT_MTU: u16 = 1380;

/// Default subnet requested when hosting a room.
pub const DEFAULT_ROOM_NETWORK: &str = "10.144.144.0/24";

/// Default depth of the inbound queue toward the TUN descriptor.
pub const DEFAULT_INBOUND_QUEUE: usize = 1024;

/// Largest accepted inbound queue depth.
pub const MAX_INBOUND_QUEUE: usize = 65_536;

const DEFAULT_INSTANCE_NAME: &str = "terracotta";

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

/// Rendezvous service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendezvousConfig {
    /// `host:port` of the rendezvous TCP endpoint.
    pub server: String,
    /// Total latency bound of one create/join, retries included.
    #[serde(default = "default_rendezvous_timeout")]
    pub timeout_ms: u64,
    /// Connect attempts before a transport error is surfaced.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles on every retry.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Interval of the rendezvous ping while in a room.
    #[serde(default = "default_rendezvous_keepalive")]
    pub keepalive_ms: u64,
}

/// Data-plane settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Whether the descriptor carries a 4-byte address-family header
    /// (Darwin utun).
    #[serde(default = "default_packet_info")]
    pub packet_info: bool,
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mtu: DEFAULT_MTU,
            packet_info: default_packet_info(),
            inbound_queue: DEFAULT_INBOUND_QUEUE,
        }
    }
}

/// Settings used when this instance hosts a room.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomConfig {
    #[serde(default = "default_room_network")]
    pub network: Ipv4Net,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            network: default_room_network(),
        }
    }
}

/// Peer liveness settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepaliveConfig {
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval(),
            timeout_ms: default_keepalive_timeout(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML configuration string.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> EngineResult<()> {
        let server = self.rendezvous.server.trim();
        match server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(EngineError::Config(format!(
                    "[rendezvous] server '{}' must be host:port",
                    self.rendezvous.server
                )))
            }
        }
        if self.rendezvous.timeout_ms == 0 {
            return Err(EngineError::Config(
                "[rendezvous] timeout_ms must be > 0".into(),
            ));
        }
        if self.rendezvous.max_attempts == 0 {
            return Err(EngineError::Config(
                "[rendezvous] max_attempts must be > 0".into(),
            ));
        }
        if self.rendezvous.keepalive_ms == 0 {
            return Err(EngineError::Config(
                "[rendezvous] keepalive_ms must be > 0".into(),
            ));
        }
        if !(576..=9000).contains(&self.network.mtu) {
            return Err(EngineError::Config(format!(
                "[network] mtu {} out of range 576-9000",
                self.network.mtu
            )));
        }
        if !(1..=MAX_INBOUND_QUEUE).contains(&self.network.inbound_queue) {
            return Err(EngineError::Config(format!(
                "[network] inbound_queue {} out of range 1-{}",
                self.network.inbound_queue, MAX_INBOUND_QUEUE
            )));
        }
        if self.room.network.prefix_len() > 30 {
            return Err(EngineError::Config(format!(
                "[room] network {} leaves no room for peers",
                self.room.network
            )));
        }
        let keepalive = &self.keepalive;
        if keepalive.interval_ms == 0 || keepalive.timeout_ms <= keepalive.interval_ms {
            return Err(EngineError::Config(
                "[keepalive] timeout_ms must exceed a non-zero interval_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous.timeout_ms)
    }

    pub fn rendezvous_keepalive(&self) -> Duration {
        Duration::from_millis(self.rendezvous.keepalive_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive.interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive.timeout_ms)
    }
}

// Default value functions for serde
fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_string()
}

fn default_rendezvous_timeout() -> u64 {
    15_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

fn default_rendezvous_keepalive() -> u64 {
    15_000
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_packet_info() -> bool {
    cfg!(any(target_os = "ios", target_os = "macos"))
}

fn default_inbound_queue() -> usize {
    DEFAULT_INBOUND_QUEUE
}

fn default_room_network() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(10, 144, 144, 0), 24).unwrap_or_default()
}

fn default_keepalive_interval() -> u64 {
    2_000
}

fn default_keepalive_timeout() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [rendezvous]
            server = "127.0.0.1:13448"
            "#,
        )
        .unwrap();

        assert_eq!(config.instance_name, "terracotta");
        assert_eq!(config.network.mtu, DEFAULT_MTU);
        assert_eq!(config.network.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.room.network.to_string(), DEFAULT_ROOM_NETWORK);
        assert_eq!(config.rendezvous.max_attempts, 3);
        assert_eq!(config.keepalive_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_full_config() {
        let config = EngineConfig::from_toml_str(
            r#"
            instance_name = "lan-party"

            [rendezvous]
            server = "rdv.example.net:13448"
            timeout_ms = 5000
            max_attempts = 5
            base_delay_ms = 50
            keepalive_ms = 1000

            [network]
            listen = "127.0.0.1:0"
            mtu = 1400
            packet_info = true
            inbound_queue = 64

            [room]
            network = "10.20.0.0/16"

            [keepalive]
            interval_ms = 500
            timeout_ms = 3000
            "#,
        )
        .unwrap();

        assert_eq!(config.instance_name, "lan-party");
        assert_eq!(config.rendezvous_timeout(), Duration::from_secs(5));
        assert!(config.network.packet_info);
        assert_eq!(config.network.inbound_queue, 64);
        assert_eq!(config.room.network.prefix_len(), 16);
        assert_eq!(config.keepalive_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = EngineConfig::from_toml_str("[rendezvous\nserver = ").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_missing_rendezvous() {
        let err = EngineConfig::from_toml_str("instance_name = \"x\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let err = EngineConfig::from_toml_str(
            r#"
            [rendezvous]
            server = "127.0.0.1:1"
            sever = "typo"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "[rendezvous]\nserver = \"no-port\"",
            "[rendezvous]\nserver = \"h:1\"\ntimeout_ms = 0",
            "[rendezvous]\nserver = \"h:1\"\nmax_attempts = 0",
            "[rendezvous]\nserver = \"h:1\"\n[network]\nmtu = 100",
            "[rendezvous]\nserver = \"h:1\"\n[network]\ninbound_queue = 0",
            "[rendezvous]\nserver = \"h:1\"\n[network]\ninbound_queue = 9000000000000000000",
            "[rendezvous]\nserver = \"h:1\"\n[room]\nnetwork = \"10.0.0.0/31\"",
            "[rendezvous]\nserver = \"h:1\"\n[keepalive]\ninterval_ms = 1000\ntimeout_ms = 1000",
        ];
        for case in cases {
            let err = EngineConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, EngineError::Config(_)), "case: {}", case);
        }
    }
}
