use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use tollgate_net::{
    CONNECTION_ESTABLISHED, Limits, ParseStatus, ProxyCredentials, RequestForm, ResponseHead,
    ResponseParser, Target, build_connect_request, forward_request_head, is_success_status,
    status_response,
};

use crate::error::ProxyError;
use crate::proxy::ClientRequest;
use crate::relay::{CountingStream, TransferCounters, relay};

const DEFAULT_UPSTREAM_PORT: u16 = 80;

/// The single upstream proxy that non-bypassed traffic goes through.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    url: String,
    address: Target,
    credentials: Option<ProxyCredentials>,
}

impl UpstreamEndpoint {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = url::Url::parse(raw)
            .map_err(|err| ProxyError::Config(format!("invalid upstream url: {err}")))?;
        if url.scheme() != "http" {
            return Err(ProxyError::Config(format!(
                "unsupported upstream scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config("upstream url has no host".to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port().unwrap_or(DEFAULT_UPSTREAM_PORT);

        let username = percent_decode_str(url.username())
            .decode_utf8_lossy()
            .into_owned();
        let password = url
            .password()
            .map(|password| percent_decode_str(password).decode_utf8_lossy().into_owned());
        let credentials = if username.is_empty() && password.is_none() {
            None
        } else {
            Some(ProxyCredentials::new(username, password.unwrap_or_default()))
        };

        Ok(Self {
            url: raw.to_string(),
            address: Target::new(host, port),
            credentials,
        })
    }

    /// The URL exactly as configured.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn address(&self) -> &Target {
        &self.address
    }

    pub fn credentials(&self) -> Option<&ProxyCredentials> {
        self.credentials.as_ref()
    }
}

/// Relays a connection through the upstream proxy.
///
/// CONNECT requests are re-issued to the upstream as a CONNECT of their own;
/// plain requests are handed over in absolute form. The local side never
/// asks the client for credentials; the upstream's own credentials come from
/// its URL. Upstream failures are reported to the client and not retried.
pub(crate) async fn serve<C>(
    client: &mut C,
    request: ClientRequest,
    endpoint: &UpstreamEndpoint,
    limits: Limits,
    counters: &Arc<TransferCounters>,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let address = endpoint.address();
    let socket = match TcpStream::connect((address.host.as_str(), address.port)).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(upstream = %address, error = %err, "upstream connect failed");
            let _ = client.write_all(&status_response(502, "Bad Gateway")).await;
            return Err(ProxyError::Connect {
                target: address.to_string(),
                reason: err.to_string(),
            });
        }
    };
    let _ = socket.set_nodelay(true);
    let mut upstream = CountingStream::new(socket, Arc::clone(counters));

    if !request.head.is_connect() {
        let head = forward_request_head(
            &request.head,
            &request.target,
            RequestForm::Absolute,
            endpoint.credentials(),
        );
        upstream.write_all(&head).await?;
        relay(client, &mut upstream, request.pending, Vec::new()).await?;
        return Ok(());
    }

    upstream
        .write_all(&build_connect_request(&request.target, endpoint.credentials()))
        .await?;
    upstream.flush().await?;

    let (reply, from_upstream) = match read_response_head(&mut upstream, limits).await {
        Ok(reply) => reply,
        Err(err) => {
            let _ = client.write_all(&status_response(502, "Bad Gateway")).await;
            return Err(err);
        }
    };

    let status_code = reply.line.status_code;
    if !is_success_status(status_code) {
        debug!(target = %request.target, status_code, "upstream refused tunnel");
        let _ = client
            .write_all(&status_response(status_code, &reply.line.reason))
            .await;
        return Err(ProxyError::Connect {
            target: request.target.to_string(),
            reason: format!("upstream answered {status_code} {}", reply.line.reason),
        });
    }

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    relay(client, &mut upstream, request.pending, from_upstream).await?;
    Ok(())
}

async fn read_response_head<S>(
    stream: &mut S,
    limits: Limits,
) -> Result<(ResponseHead, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ResponseParser::with_limits(limits);
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Err(ProxyError::Runtime(
                "upstream closed before answering CONNECT".to_string(),
            ));
        }
        match parser.push(&buffer[..n]) {
            ParseStatus::NeedMore { .. } => continue,
            ParseStatus::Complete { message, .. } => {
                return Ok((message, parser.take_buffered()));
            }
            ParseStatus::Error { error, .. } => {
                return Err(ProxyError::Runtime(format!(
                    "upstream response parse error {error:?}"
                )));
            }
        }
    }
}
