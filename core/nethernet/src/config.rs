//! Client and server configuration
//!
//! Both configs deserialize from JSON with every field optional:
//!
//! ```text
//! { "port": 7551, "network_id": 42, "ice_servers": ["stun:stun.example.org:3478"] }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::DEFAULT_ENVELOPE_KEY;
use crate::error::{Error, Result};
use crate::NetworkId;

/// Well-known discovery port
pub const DEFAULT_PORT: u16 = 7551;

/// Client discovery broadcast period
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 2000;

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Fixed NetworkId; random when unset
    pub network_id: Option<NetworkId>,
    pub ice_servers: Vec<String>,
    pub envelope_key: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            network_id: None,
            ice_servers: Vec::new(),
            envelope_key: DEFAULT_ENVELOPE_KEY,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("server port must not be 0".to_string()));
        }
        if self.network_id == Some(0) {
            return Err(Error::Config("network id must not be 0".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bind_address: SocketAddr,
    /// Where discovery requests go (broadcast or a unicast server address)
    pub target: SocketAddr,
    pub discovery_interval_ms: u64,
    pub ice_servers: Vec<String>,
    pub envelope_key: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DEFAULT_PORT),
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            ice_servers: Vec::new(),
            envelope_key: DEFAULT_ENVELOPE_KEY,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery_interval_ms == 0 {
            return Err(Error::Config(
                "discovery interval must be greater than 0".to_string(),
            ));
        }
        if self.target.port() == 0 {
            return Err(Error::Config("discovery target port must not be 0".to_string()));
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 7551);
        assert_eq!(server.listen_addr().to_string(), "0.0.0.0:7551");
        assert!(server.validate().is_ok());

        let client = ClientConfig::default();
        assert_eq!(client.target.to_string(), "255.255.255.255:7551");
        assert_eq!(client.discovery_interval(), Duration::from_secs(2));
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let server: ServerConfig =
            serde_json::from_str(r#"{ "port": 19132, "network_id": 42 }"#).unwrap();
        assert_eq!(server.port, 19132);
        assert_eq!(server.network_id, Some(42));
        assert_eq!(server.envelope_key, DEFAULT_ENVELOPE_KEY);

        let client: ClientConfig =
            serde_json::from_str(r#"{ "target": "192.168.1.10:7551" }"#).unwrap();
        assert_eq!(client.target.to_string(), "192.168.1.10:7551");
        assert_eq!(client.discovery_interval_ms, DEFAULT_DISCOVERY_INTERVAL_MS);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let server = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(server.validate(), Err(Error::Config(_))));

        let client = ClientConfig {
            discovery_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(client.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("nethernet-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "port": 7552, "ice_servers": ["stun:example.org"] }"#).unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7552);
        assert_eq!(config.ice_servers, vec!["stun:example.org".to_string()]);

        assert!(matches!(
            ServerConfig::from_file("/nonexistent/nethernet.json"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = serde_json::from_str::<ServerConfig>("{ port: }").unwrap_err();
        assert!(matches!(Error::from(err), Error::Config(_)));
    }
}
