use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    pub bypass: BypassConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    /// `0` asks the OS for an ephemeral port.
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// `http://[user:pass@]host[:port]`.
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BypassConfig {
    /// This machine's own host name; always bypassed when set.
    pub host_identity: Option<String>,
    /// Comma-separated host names that are also bypassed. IPv6 literals may
    /// be written with or without brackets.
    pub hosts: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_header_bytes: usize,
}

impl ProxyConfig {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        Self {
            upstream: UpstreamConfig {
                url: upstream_url.into(),
            },
            ..Self::default()
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: tollgate_net::Limits::default().max_header_bytes,
        }
    }
}

impl From<&LimitsConfig> for tollgate_net::Limits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_header_bytes: config.max_header_bytes,
        }
    }
}
