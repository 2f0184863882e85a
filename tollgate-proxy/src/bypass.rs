use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::BypassConfig;

/// Always routed directly, whatever else is configured.
pub const UNSPECIFIED_HOST: &str = "0.0.0.0";

/// Runtime-configurable, comma-separated list of bypassed host names.
///
/// Clones share the same list; [`BypassList::set`] is seen by the very next
/// classification on every clone.
#[derive(Debug, Clone)]
pub struct BypassList {
    raw: Arc<ArcSwap<String>>,
}

impl Default for BypassList {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl BypassList {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: Arc::new(ArcSwap::from_pointee(raw.into())),
        }
    }

    pub fn set(&self, raw: impl Into<String>) {
        self.raw.store(Arc::new(raw.into()));
    }

    pub fn get(&self) -> Arc<String> {
        self.raw.load_full()
    }

    /// The current entries, trimmed, with empty items dropped and IPv6
    /// brackets removed.
    pub fn hosts(&self) -> Vec<String> {
        self.raw
            .load()
            .split(',')
            .map(normalize_entry)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// Destination hosts carry IPv6 literals unbracketed, so `[::1]` and `::1`
// name the same entry.
fn normalize_entry(raw: &str) -> &str {
    let host = raw.trim();
    host.strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host)
}

/// Decides whether a destination host skips the upstream proxy.
#[derive(Debug, Clone)]
pub struct BypassClassifier {
    host_identity: Option<String>,
    configured: BypassList,
}

impl BypassClassifier {
    pub fn new(host_identity: Option<String>, configured: BypassList) -> Self {
        let host_identity = host_identity
            .map(|host| normalize_entry(&host).to_string())
            .filter(|host| !host.is_empty());
        Self {
            host_identity,
            configured,
        }
    }

    pub fn from_config(config: &BypassConfig) -> Self {
        Self::new(
            config.host_identity.clone(),
            BypassList::new(config.hosts.clone().unwrap_or_default()),
        )
    }

    pub fn configured(&self) -> &BypassList {
        &self.configured
    }

    /// The full bypass set as of this call.
    pub fn bypass_hosts(&self) -> HashSet<String> {
        let mut hosts = HashSet::from([UNSPECIFIED_HOST.to_string()]);
        if let Some(identity) = &self.host_identity {
            hosts.insert(identity.clone());
        }
        hosts.extend(self.configured.hosts());
        hosts
    }

    /// Exact, case-sensitive match against [`BypassClassifier::bypass_hosts`].
    pub fn is_bypassed(&self, hostname: &str) -> bool {
        self.bypass_hosts().contains(hostname)
    }
}
