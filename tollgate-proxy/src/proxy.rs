use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info};

use tollgate_net::{
    Limits, ParseStatus, RequestHead, RequestParser, Target, resolve_target, status_response,
};

use crate::accounting::{TrafficAccountant, TrafficTotals};
use crate::bypass::{BypassClassifier, BypassList};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{ConnectionClosed, ConnectionId, ProxyEvents, Route, event_channel};
use crate::passthrough;
use crate::relay::TransferCounters;
use crate::upstream::{self, UpstreamEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Closed,
}

impl ServerState {
    fn as_str(&self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Listening => "listening",
            ServerState::Closed => "closed",
        }
    }
}

/// A forwarding proxy that sends bypassed hosts straight to their
/// destination and everything else through one upstream proxy.
///
/// Dropping the server stops the listener and terminates open connections;
/// use [`ProxyServer::close`] to wait for that to finish.
#[derive(Debug)]
pub struct ProxyServer {
    state: Arc<ProxyState>,
    url: String,
    lifecycle: ServerState,
    local_addr: Option<SocketAddr>,
    tracker: TaskTracker,
    stop_accepting: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ProxyState {
    config: ProxyConfig,
    upstream: UpstreamEndpoint,
    classifier: BypassClassifier,
    accountant: TrafficAccountant,
    limits: Limits,
    sender: mpsc::Sender<ConnectionClosed>,
    terminate: CancellationToken,
}

/// A parsed client request, with whatever the client already sent past
/// its head.
pub(crate) struct ClientRequest {
    pub(crate) head: RequestHead,
    pub(crate) target: Target,
    pub(crate) pending: Vec<u8>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<(Self, ProxyEvents), ProxyError> {
        let upstream = UpstreamEndpoint::parse(&config.upstream.url)?;
        let classifier = BypassClassifier::from_config(&config.bypass);
        let limits = Limits::from(&config.limits);
        let (sender, events) = event_channel();
        let url = local_url(&SocketAddr::new(placeholder_ip(&config.listen.host), 0));

        Ok((
            Self {
                state: Arc::new(ProxyState {
                    config,
                    upstream,
                    classifier,
                    accountant: TrafficAccountant::new(),
                    limits,
                    sender,
                    terminate: CancellationToken::new(),
                }),
                url,
                lifecycle: ServerState::Created,
                local_addr: None,
                tracker: TaskTracker::new(),
                stop_accepting: CancellationToken::new(),
                accept_task: None,
            },
            events,
        ))
    }

    /// The proxy's own base URL. Only meaningful once [`ProxyServer::listen`]
    /// has returned; before that it carries port 0.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn upstream_url(&self) -> &str {
        self.state.upstream.url()
    }

    pub fn tx_bytes(&self) -> u64 {
        self.state.accountant.tx_bytes()
    }

    pub fn rx_bytes(&self) -> u64 {
        self.state.accountant.rx_bytes()
    }

    pub fn traffic(&self) -> TrafficTotals {
        self.state.accountant.totals()
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Handle to the runtime-configurable bypass list.
    pub fn bypass_list(&self) -> BypassList {
        self.state.classifier.configured().clone()
    }

    pub fn is_bypassed(&self, hostname: &str) -> bool {
        self.state.classifier.is_bypassed(hostname)
    }

    /// Bypassed connections that are still open.
    pub fn open_bypass_connections(&self) -> usize {
        self.state.accountant.tracked_count()
    }

    pub async fn listen(&mut self) -> Result<(), ProxyError> {
        if self.lifecycle != ServerState::Created {
            return Err(ProxyError::State {
                operation: "listen",
                state: self.lifecycle.as_str(),
            });
        }

        let host = self.state.config.listen.host.as_str();
        let port = self.state.config.listen.port;
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|err| ProxyError::Bind(format!("{host}:{port}: {err}")))?;
        let bound = listener
            .local_addr()
            .map_err(|err| ProxyError::Bind(err.to_string()))?;

        self.url = local_url(&bound);
        self.local_addr = Some(bound);
        info!(
            bind_addr = %bound,
            upstream = %self.state.upstream.address(),
            "proxy listening"
        );

        let state = Arc::clone(&self.state);
        let tracker = self.tracker.clone();
        let stop = self.stop_accepting.clone();
        self.accept_task = Some(tokio::spawn(async move {
            accept_loop(state, listener, tracker, stop).await;
        }));
        self.lifecycle = ServerState::Listening;
        Ok(())
    }

    /// Stops accepting and waits for open connections to finish. With
    /// `force`, open connections are cut immediately instead. Closing an
    /// already closed server does nothing.
    pub async fn close(&mut self, force: bool) -> Result<(), ProxyError> {
        match self.lifecycle {
            ServerState::Closed => return Ok(()),
            ServerState::Created => {
                self.lifecycle = ServerState::Closed;
                return Ok(());
            }
            ServerState::Listening => {}
        }

        info!(force, open = self.tracker.len(), "closing proxy");
        self.stop_accepting.cancel();
        if force {
            self.state.terminate.cancel();
        }

        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "accept loop ended abnormally");
            }
        }
        self.tracker.close();
        self.tracker.wait().await;

        self.lifecycle = ServerState::Closed;
        info!(
            tx_bytes = self.tx_bytes(),
            rx_bytes = self.rx_bytes(),
            "proxy closed"
        );
        Ok(())
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.stop_accepting.cancel();
        self.state.terminate.cancel();
    }
}

async fn accept_loop(
    state: Arc<ProxyState>,
    listener: TcpListener,
    tracker: TaskTracker,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let state = Arc::clone(&state);
                tracker.spawn(
                    handle_connection(state, stream)
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                );
            }
            Err(err) => {
                error!(error = %err, "accept error");
                // Avoid spinning on persistent accept failures.
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        }
    }
    debug!("listener released");
}

async fn handle_connection(state: Arc<ProxyState>, client: TcpStream) {
    let id = ConnectionId::new();
    let counters = Arc::new(TransferCounters::default());
    let mut route = None;

    let result = tokio::select! {
        result = serve_connection(&state, id, client, &counters, &mut route) => result,
        _ = state.terminate.cancelled() => {
            Err(ProxyError::Runtime("terminated by forced close".to_string()))
        }
    };
    if let Err(err) = &result {
        debug!(connection = %id, error = %err, "connection failed");
    }

    let event = ConnectionClosed {
        id,
        route,
        stats: counters.stats(),
    };
    state.accountant.connection_closed(&event);
    debug!(
        connection = %id,
        route = route.map(|route| route.as_str()).unwrap_or("none"),
        tx_bytes = event.stats.map(|stats| stats.bytes_sent_to_target),
        rx_bytes = event.stats.map(|stats| stats.bytes_received_from_target),
        "connection closed"
    );
    let _ = state.sender.try_send(event);
}

async fn serve_connection(
    state: &ProxyState,
    id: ConnectionId,
    mut client: TcpStream,
    counters: &Arc<TransferCounters>,
    route: &mut Option<Route>,
) -> Result<(), ProxyError> {
    let Some(request) = read_client_request(&mut client, state.limits).await? else {
        return Ok(());
    };

    let bypass = state.classifier.is_bypassed(&request.target.host);
    debug!(
        connection = %id,
        method = %request.head.line.method,
        target = %request.target,
        bypass,
        "request classified"
    );

    if bypass {
        *route = Some(Route::Bypass);
        passthrough::serve(&mut client, request, id, &state.accountant, counters).await
    } else {
        *route = Some(Route::Upstream);
        upstream::serve(&mut client, request, &state.upstream, state.limits, counters).await
    }
}

async fn read_client_request<S>(
    client: &mut S,
    limits: Limits,
) -> Result<Option<ClientRequest>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut parser = RequestParser::with_limits(limits);
    let mut buffer = vec![0u8; 8192];

    let head = loop {
        let n = client.read(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        match parser.push(&buffer[..n]) {
            ParseStatus::NeedMore { .. } => continue,
            ParseStatus::Complete { message, .. } => break message,
            ParseStatus::Error { error, .. } => {
                let _ = client.write_all(&status_response(400, "Bad Request")).await;
                return Err(ProxyError::Protocol(format!("parse error {error:?}")));
            }
        }
    };

    let target = match resolve_target(&head) {
        Ok(target) => target,
        Err(err) => {
            let _ = client.write_all(&status_response(400, "Bad Request")).await;
            return Err(ProxyError::Protocol(format!("unusable target {err:?}")));
        }
    };

    Ok(Some(ClientRequest {
        head,
        target,
        pending: parser.take_buffered(),
    }))
}

// Before binding there is no port to report, and an unspecified bind address
// is reached through loopback.
fn placeholder_ip(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn local_url(addr: &SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use assert_matches::assert_matches;

    use super::{ProxyServer, ServerState, local_url};
    use crate::config::ProxyConfig;
    use crate::error::ProxyError;

    #[test]
    fn local_url_uses_loopback_for_unspecified() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(local_url(&addr), "http://127.0.0.1:8080");
        let addr: SocketAddr = "[::]:8080".parse().unwrap();
        assert_eq!(local_url(&addr), "http://[::1]:8080");
    }

    #[test]
    fn new_server_starts_with_zero_counters() {
        let (server, _events) = ProxyServer::new(ProxyConfig::new("http://up.example:8080")).unwrap();
        assert_eq!(server.state(), ServerState::Created);
        assert_eq!(server.url(), "http://127.0.0.1:0");
        assert_eq!(server.upstream_url(), "http://up.example:8080");
        assert_eq!((server.tx_bytes(), server.rx_bytes()), (0, 0));
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn rejects_invalid_upstream() {
        assert_matches!(
            ProxyServer::new(ProxyConfig::new("ftp://up.example")),
            Err(ProxyError::Config(_))
        );
    }

    #[tokio::test]
    async fn listen_reports_bound_port() {
        let (mut server, _events) =
            ProxyServer::new(ProxyConfig::new("http://up.example:8080")).unwrap();
        server.listen().await.unwrap();

        let port = server.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(server.url(), format!("http://127.0.0.1:{port}"));
        assert_eq!(server.state(), ServerState::Listening);

        server.close(false).await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn listen_twice_is_rejected() {
        let (mut server, _events) =
            ProxyServer::new(ProxyConfig::new("http://up.example:8080")).unwrap();
        server.listen().await.unwrap();

        assert_matches!(server.listen().await, Err(ProxyError::State { .. }));
        server.close(true).await.unwrap();
        assert_matches!(server.listen().await, Err(ProxyError::State { .. }));
    }

    #[tokio::test]
    async fn bind_failure_leaves_server_created() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ProxyConfig::new("http://up.example:8080");
        config.listen.port = occupied.local_addr().unwrap().port();

        let (mut server, _events) = ProxyServer::new(config).unwrap();
        assert_matches!(server.listen().await, Err(ProxyError::Bind(_)));
        assert_eq!(server.state(), ServerState::Created);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut server, _events) =
            ProxyServer::new(ProxyConfig::new("http://up.example:8080")).unwrap();
        server.close(false).await.unwrap();
        server.close(false).await.unwrap();
        server.close(true).await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        assert_eq!((server.tx_bytes(), server.rx_bytes()), (0, 0));
    }
}
