//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub call: CallConfig,
    pub test_client: TestClientConfig,
}

impl EngineConfig {
    /// Default location of the config file for this user
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "rtc", "rtc-session-engine")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Load from `path`, or the default path, falling back to defaults when
    /// no file exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(p) => p,
            None => return Ok(Self::default()),
        };
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Local bind addresses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address bound for IPv4 channels
    pub ipv4_bind: Ipv4Addr,
    /// Address bound for IPv6 channels
    pub ipv6_bind: Ipv6Addr,
}

impl NetworkConfig {
    pub fn bind_ip(&self, ipv6: bool) -> IpAddr {
        if ipv6 {
            IpAddr::V6(self.ipv6_bind)
        } else {
            IpAddr::V4(self.ipv4_bind)
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ipv4_bind: Ipv4Addr::LOCALHOST,
            ipv6_bind: Ipv6Addr::LOCALHOST,
        }
    }
}

/// Packet transport behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Defer sends onto the network context
    pub async_send: bool,
    /// Delay applied to async sends
    pub async_delay_ms: u64,
    /// SO_RCVBUF applied to every bound socket
    pub receive_buffer: Option<i32>,
    /// SO_SNDBUF applied to every bound socket
    pub send_buffer: Option<i32>,
    /// DSCP value for outgoing packets
    pub dscp: Option<i32>,
}

impl TransportConfig {
    pub fn async_delay(&self) -> Duration {
        Duration::from_millis(self.async_delay_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            async_send: false,
            async_delay_ms: DEFAULT_ASYNC_SEND_DELAY_MS,
            receive_buffer: None,
            send_buffer: None,
            dscp: None,
        }
    }
}

/// Bitrate bounds handed to the call's bitrate allocator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub start_bitrate_bps: u32,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            start_bitrate_bps: 300_000,
            min_bitrate_bps: 30_000,
            max_bitrate_bps: 2_000_000,
        }
    }
}

/// Packet inspection timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestClientConfig {
    pub timeout_ms: u64,
    pub no_packet_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for TestClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PACKET_TIMEOUT_MS,
            no_packet_timeout_ms: DEFAULT_NO_PACKET_TIMEOUT_MS,
            queue_capacity: MAX_QUEUED_PACKETS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [transport]
            async_send = true
            async_delay_ms = 5

            [call]
            max_bitrate_bps = 1000000
            "#,
        )
        .unwrap();

        assert!(config.transport.async_send);
        assert_eq!(config.transport.async_delay(), Duration::from_millis(5));
        assert_eq!(config.call.max_bitrate_bps, 1_000_000);
        assert_eq!(config.call.min_bitrate_bps, 30_000);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml("transport = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("rtc-session-engine-does-not-exist.toml");
        let config = EngineConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_bind_ip_by_family() {
        let network = NetworkConfig::default();
        assert!(network.bind_ip(false).is_ipv4());
        assert!(network.bind_ip(true).is_ipv6());
    }
}
