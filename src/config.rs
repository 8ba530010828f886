//! Settings
//!
//! One JSON file holds everything the services need at start. Missing fields
//! fall back to their defaults; changing a value takes effect on restart.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::AuthContext;
use crate::catalog::CATALOG_FILE;
use crate::discovery::DiscoveryConfig;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Display name announced to peers
    #[serde(default = "default_username")]
    pub username: String,

    /// UDP port for presence announcements
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,

    #[serde(default = "default_file_port")]
    pub tcp_file_port: u16,

    #[serde(default = "default_chat_port")]
    pub tcp_chat_port: u16,

    /// Where announcements are sent
    #[serde(default = "default_broadcast_ip")]
    pub broadcast_ip: IpAddr,

    /// Address the services bind to (0.0.0.0 for all interfaces)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Directory that receives pushed and downloaded files
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    /// Directory holding the shared certificate and key
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Shared secret every request must carry, if set
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Source addresses allowed to connect, if set
    #[serde(default)]
    pub allowed_addresses: Option<Vec<IpAddr>>,

    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Drop peers not heard from for this long; unset keeps them forever
    #[serde(default)]
    pub peer_ttl_secs: Option<u64>,

    /// Per-service cap on concurrently handled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Server-side receive timeout
    #[serde(default = "default_server_timeout")]
    pub server_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Client-side receive timeout
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Only trust peers presenting the shared certificate
    #[serde(default)]
    pub verify_peer_certificate: bool,
}

fn default_username() -> String {
    "User".to_string()
}

fn default_broadcast_port() -> u16 {
    12345
}

fn default_file_port() -> u16 {
    12346
}

fn default_chat_port() -> u16 {
    12347
}

fn default_broadcast_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".lanlink")
}

fn default_announce_interval() -> u64 {
    5
}

fn default_max_connections() -> usize {
    100
}

fn default_server_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_client_timeout() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            username: default_username(),
            broadcast_port: default_broadcast_port(),
            tcp_file_port: default_file_port(),
            tcp_chat_port: default_chat_port(),
            broadcast_ip: default_broadcast_ip(),
            bind_address: default_bind_address(),
            save_dir: default_save_dir(),
            data_dir: default_data_dir(),
            auth_token: None,
            allowed_addresses: None,
            announce_interval_secs: default_announce_interval(),
            peer_ttl_secs: None,
            max_connections: default_max_connections(),
            server_timeout_secs: default_server_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            client_timeout_secs: default_client_timeout(),
            verify_peer_certificate: false,
        }
    }
}

impl Settings {
    pub fn chat_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tcp_chat_port)
    }

    pub fn file_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tcp_file_port)
    }

    pub fn auth_context(&self) -> AuthContext {
        AuthContext::new(self.auth_token.clone(), self.allowed_addresses.clone())
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: SocketAddr::new(self.bind_address, self.broadcast_port),
            broadcast_addr: SocketAddr::new(self.broadcast_ip, self.broadcast_port),
            interval: Duration::from_secs(self.announce_interval_secs.max(1)),
            peer_ttl: self.peer_ttl_secs.map(Duration::from_secs),
        }
    }

    /// Message history shared by every process using this data directory
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Load settings, writing the defaults out if the file does not exist yet.
///
/// A file that cannot be parsed is left alone and the defaults are used.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        save_settings(path, &settings)?;
        info!("Wrote default settings to {:?}", path);
        return Ok(settings);
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;

    match serde_json::from_str(&raw) {
        Ok(settings) => Ok(settings),
        Err(e) => {
            warn!("Ignoring unreadable settings file {:?}: {}", path, e);
            Ok(Settings::default())
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write settings file: {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(path.exists());
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(
            &path,
            r#"{"username": "Alice", "tcp_chat_port": 4000, "allowed_addresses": ["10.0.0.5"]}"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.username, "Alice");
        assert_eq!(settings.tcp_chat_port, 4000);
        assert_eq!(settings.tcp_file_port, 12346);
        assert_eq!(settings.broadcast_port, 12345);

        let auth = settings.auth_context();
        assert!(auth.check_source("10.0.0.5".parse().unwrap()).is_ok());
        assert!(auth.check_source("10.0.0.6".parse().unwrap()).is_err());
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(load_settings(&path).unwrap(), Settings::default());
    }

    #[test]
    fn test_derived_addresses() {
        let settings = Settings::default();
        assert_eq!(settings.chat_addr().to_string(), "0.0.0.0:12347");
        assert_eq!(settings.file_addr().to_string(), "0.0.0.0:12346");

        let discovery = settings.discovery_config();
        assert_eq!(discovery.broadcast_addr.to_string(), "255.255.255.255:12345");
        assert_eq!(discovery.interval, Duration::from_secs(5));
        assert!(discovery.peer_ttl.is_none());
    }
}
