//! Configuration system for Weft.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WEFT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/weft/config.toml
//!   3. ~/.config/weft/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::channel::PipeConfiguration;

/// Top-level configuration for one mesh node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    pub routing: RoutingConfig,
    /// Pipes to bring up at start, one fixed channel variant each.
    pub pipes: Vec<PipeConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Opaque node id. Auto-generated when empty.
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP bind address for socket link intake. Port 0 = OS-assigned.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Retransmissions after the initial attempt. max_retries + 1 total.
    pub max_retries: u32,
    pub retry_timeout_ms: u64,
    /// How long the receiver waits after the final chunk before asking for
    /// missing indices.
    pub recovery_grace_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Silence past this marks the pipe dead.
    pub heartbeat_timeout_secs: u64,
    /// Bound on concurrent reassembly buffers per pipe.
    pub reassembly_max_buffers: usize,
    /// Incomplete frames older than this are evicted.
    pub reassembly_max_age_secs: u64,
    /// Upper bound on chunk payload size, clamped by pipe capabilities.
    pub max_chunk_bytes: usize,
    /// Application delivery queue depth. Full queue drops the newest.
    pub delivery_queue: usize,
    /// Default hop budget for locally originated messages.
    pub default_ttl: u8,
    /// Bound on the recently-seen broadcast id cache.
    pub seen_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub announce_interval_secs: u64,
    /// Peers not re-announced within this window are reported departed.
    pub peer_ttl_secs: u64,
    /// UDP port announcements are broadcast on.
    pub port: u16,
    /// Peers known ahead of time, `id@host:port`.
    pub static_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Routes not refreshed within this window expire.
    pub route_ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7350".into(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_timeout_ms: 2_000,
            recovery_grace_ms: 1_500,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            reassembly_max_buffers: 64,
            reassembly_max_age_secs: 120,
            max_chunk_bytes: 32 * 1024,
            delivery_queue: 256,
            default_ttl: 8,
            seen_cache_size: 1024,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            announce_interval_secs: 2,
            peer_ttl_secs: 10,
            port: 7300,
            static_peers: Vec::new(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { route_ttl_secs: 60 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("weft")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides();
        if config.node.id.is_empty() {
            config.node.id = hex::encode(rand::random::<[u8; 8]>());
        }
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WEFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply WEFT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEFT_NODE__ID") {
            self.node.id = v;
        }
        if let Ok(v) = std::env::var("WEFT_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("WEFT_DISCOVERY__ENABLED") {
            self.discovery.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("WEFT_DISCOVERY__PORT") {
            if let Ok(p) = v.parse() {
                self.discovery.port = p;
            }
        }
        if let Ok(v) = std::env::var("WEFT_TRANSPORT__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.transport.max_retries = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MeshConfig::default();
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(config.transport.default_ttl, 8);
        assert!(config.discovery.enabled);
        assert!(config.pipes.is_empty());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&MeshConfig::default()).unwrap();
        let back: MeshConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.discovery.port, 7300);
        assert_eq!(back.transport.delivery_queue, 256);
    }

    #[test]
    fn pipes_parse_from_toml() {
        let text = r#"
            [node]
            id = "n1"

            [[pipes]]
            pipe_id = "fallback"
            timeout_ms = 10000

            [pipes.channel]
            kind = "socket"
            endpoint = "192.168.0.7:7350"
        "#;
        let config: MeshConfig = toml::from_str(text).unwrap();
        assert_eq!(config.pipes.len(), 1);
        assert_eq!(config.pipes[0].pipe_id, "fallback");
    }
}
