//! Channel kinds and per-pipe configuration.
//!
//! One `PipeConfiguration` is fixed per pipe at construction: a channel
//! kind, an id, a timeout, and exactly one kind-specific variant payload.
//! Capabilities are derived from the variant and never change afterwards.

use serde::{Deserialize, Serialize};

/// The four physical channel kinds a pipe can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Proximity optical codes exchanged between displays and cameras.
    Optical,
    /// Short-range radio (BLE-style characteristic writes).
    Radio,
    /// Near-field tap exchange.
    NearField,
    /// Socket stream fallback.
    Socket,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Optical => "optical",
            Self::Radio => "radio",
            Self::NearField => "near_field",
            Self::Socket => "socket",
        };
        f.write_str(s)
    }
}

/// Optical code error-correction level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcLevel {
    Low,
    #[default]
    Medium,
    Quartile,
    High,
}

/// Kind-specific configuration payload. Exactly one variant per pipe,
/// selected at construction and never mixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    Optical {
        code_version: u8,
        #[serde(default)]
        error_correction: EcLevel,
        /// Byte budget of a single optical frame.
        chunk_bytes: u32,
    },
    Radio {
        service_uuid: String,
        characteristic_uuid: String,
        #[serde(default)]
        require_bonding: bool,
        /// Negotiated MTU; one characteristic write carries mtu - 3 bytes.
        mtu: u32,
    },
    NearField {
        application_id: String,
        #[serde(default)]
        secure_element: bool,
        /// Max bytes of one tap exchange.
        max_bytes: u32,
    },
    Socket {
        /// `host:port` endpoint to dial.
        endpoint: String,
        #[serde(default = "default_true")]
        streaming: bool,
        #[serde(default)]
        headers: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        tls: bool,
    },
}

fn default_true() -> bool {
    true
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Optical { .. } => ChannelKind::Optical,
            Self::Radio { .. } => ChannelKind::Radio,
            Self::NearField { .. } => ChannelKind::NearField,
            Self::Socket { .. } => ChannelKind::Socket,
        }
    }
}

/// Static per-pipe capabilities, derived from the channel variant and
/// queried before deciding chunk sizes and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeCapabilities {
    pub kind: ChannelKind,
    /// Largest single record the medium can carry.
    pub max_message_bytes: u32,
    /// Rough sustained throughput, bits per second.
    pub max_throughput_bps: u64,
    pub bidirectional: bool,
    pub requires_user_interaction: bool,
    pub supports_background: bool,
    pub features: Vec<String>,
}

impl PipeCapabilities {
    /// Capabilities of an in-process loopback pipe, used by tests and by
    /// multi-node-in-one-process hosts.
    pub fn loopback(max_message_bytes: u32) -> Self {
        Self {
            kind: ChannelKind::Socket,
            max_message_bytes,
            max_throughput_bps: u64::MAX,
            bidirectional: true,
            requires_user_interaction: false,
            supports_background: true,
            features: vec!["loopback".into()],
        }
    }
}

/// Full configuration of one pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfiguration {
    pub pipe_id: String,
    pub timeout_ms: u64,
    pub channel: ChannelConfig,
}

impl PipeConfiguration {
    /// A socket pipe toward the given endpoint, with defaults elsewhere.
    pub fn socket(pipe_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            pipe_id: pipe_id.into(),
            timeout_ms: 10_000,
            channel: ChannelConfig::Socket {
                endpoint: endpoint.into(),
                streaming: true,
                headers: Default::default(),
                tls: false,
            },
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    /// Derive the static capabilities for this pipe.
    pub fn capabilities(&self) -> PipeCapabilities {
        match &self.channel {
            ChannelConfig::Optical { chunk_bytes, .. } => PipeCapabilities {
                kind: ChannelKind::Optical,
                max_message_bytes: *chunk_bytes,
                max_throughput_bps: 4_000,
                bidirectional: true,
                requires_user_interaction: true,
                supports_background: false,
                features: vec!["visual".into()],
            },
            ChannelConfig::Radio { mtu, require_bonding, .. } => PipeCapabilities {
                kind: ChannelKind::Radio,
                // ATT write overhead is 3 bytes per characteristic write.
                max_message_bytes: mtu.saturating_sub(3).max(1),
                max_throughput_bps: 125_000,
                bidirectional: true,
                requires_user_interaction: *require_bonding,
                supports_background: true,
                features: vec!["radio".into(), "low-energy".into()],
            },
            ChannelConfig::NearField { max_bytes, .. } => PipeCapabilities {
                kind: ChannelKind::NearField,
                max_message_bytes: *max_bytes,
                max_throughput_bps: 100_000,
                bidirectional: true,
                requires_user_interaction: true,
                supports_background: false,
                features: vec!["tap".into()],
            },
            ChannelConfig::Socket { streaming, tls, .. } => PipeCapabilities {
                kind: ChannelKind::Socket,
                max_message_bytes: 65_535,
                max_throughput_bps: 100_000_000,
                bidirectional: true,
                requires_user_interaction: false,
                supports_background: true,
                features: {
                    let mut f = vec!["stream".into()];
                    if !streaming {
                        f = vec!["datagram".into()];
                    }
                    if *tls {
                        f.push("tls".into());
                    }
                    f
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_defaults() {
        let cfg = PipeConfiguration::socket("p1", "10.0.0.2:7350");
        assert_eq!(cfg.kind(), ChannelKind::Socket);
        let caps = cfg.capabilities();
        assert!(caps.bidirectional);
        assert!(caps.supports_background);
        assert_eq!(caps.max_message_bytes, 65_535);
    }

    #[test]
    fn radio_budget_subtracts_att_overhead() {
        let cfg = PipeConfiguration {
            pipe_id: "r1".into(),
            timeout_ms: 5_000,
            channel: ChannelConfig::Radio {
                service_uuid: "180a".into(),
                characteristic_uuid: "2a29".into(),
                require_bonding: false,
                mtu: 247,
            },
        };
        assert_eq!(cfg.capabilities().max_message_bytes, 244);
    }

    #[test]
    fn channel_config_is_tagged_by_kind() {
        let toml = r#"
            pipe_id = "qr"
            timeout_ms = 30000

            [channel]
            kind = "optical"
            code_version = 40
            error_correction = "quartile"
            chunk_bytes = 2900
        "#;
        let cfg: PipeConfiguration = toml::from_str(toml).unwrap();
        assert_eq!(cfg.kind(), ChannelKind::Optical);
        let caps = cfg.capabilities();
        assert!(caps.requires_user_interaction);
        assert!(!caps.supports_background);
        assert_eq!(caps.max_message_bytes, 2900);
    }
}
