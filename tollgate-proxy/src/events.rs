use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Names one client connection for as long as the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Tunnelled straight to the destination.
    Bypass,
    /// Relayed through the upstream proxy.
    Upstream,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Bypass => "bypass",
            Route::Upstream => "upstream",
        }
    }
}

/// Bytes moved over the outbound (target-facing) socket of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes_sent_to_target: u64,
    pub bytes_received_from_target: u64,
}

/// Emitted exactly once when a client connection is finished.
///
/// `stats` is `None` when no outbound socket was ever connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClosed {
    pub id: ConnectionId,
    pub route: Option<Route>,
    pub stats: Option<TransferStats>,
}

pub type ProxyEvents = ReceiverStream<ConnectionClosed>;

pub fn event_channel() -> (mpsc::Sender<ConnectionClosed>, ProxyEvents) {
    let (sender, receiver) = mpsc::channel(50_000);
    (sender, ReceiverStream::new(receiver))
}
