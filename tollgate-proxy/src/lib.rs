//! Forwarding HTTP(S) proxy with per-host bypass.
//!
//! Connections to bypassed hosts are tunnelled straight to their destination;
//! everything else is relayed through a single upstream proxy, and the bytes
//! of those upstream connections are totalled.

mod accounting;
mod bypass;
mod config;
mod error;
mod events;
mod passthrough;
mod proxy;
mod relay;
mod upstream;

pub use accounting::{TrafficAccountant, TrafficTotals};
pub use bypass::{BypassClassifier, BypassList, UNSPECIFIED_HOST};
pub use config::{BypassConfig, LimitsConfig, ListenConfig, ProxyConfig, UpstreamConfig};
pub use error::ProxyError;
pub use events::{ConnectionClosed, ConnectionId, ProxyEvents, Route, TransferStats};
pub use proxy::{ProxyServer, ServerState};
pub use upstream::UpstreamEndpoint;
