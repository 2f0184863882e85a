use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use tollgate_net::{CONNECTION_ESTABLISHED, RequestForm, forward_request_head, status_response};

use crate::accounting::TrafficAccountant;
use crate::error::ProxyError;
use crate::events::ConnectionId;
use crate::proxy::ClientRequest;
use crate::relay::{CountingStream, TransferCounters, relay};

/// Serves a bypassed connection by dialling the destination itself.
///
/// The client still gets the answer it expects from a proxy (a
/// `200 Connection Established` for CONNECT, the origin's own response for a
/// plain request), but nothing passes through the upstream. The connection is
/// tracked as bypassed before any socket is opened.
pub(crate) async fn serve<C>(
    client: &mut C,
    request: ClientRequest,
    id: ConnectionId,
    accountant: &TrafficAccountant,
    counters: &Arc<TransferCounters>,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    accountant.track_bypass(id);

    let target = &request.target;
    let socket = match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(target = %target, error = %err, "direct connect failed");
            let _ = client.write_all(&status_response(502, "Bad Gateway")).await;
            return Err(ProxyError::Connect {
                target: target.to_string(),
                reason: err.to_string(),
            });
        }
    };
    let _ = socket.set_nodelay(true);
    let mut destination = CountingStream::new(socket, Arc::clone(counters));
    debug!(target = %target, "direct connection established");

    if request.head.is_connect() {
        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;
    } else {
        let head = forward_request_head(&request.head, target, RequestForm::Origin, None);
        destination.write_all(&head).await?;
    }

    relay(client, &mut destination, request.pending, Vec::new()).await?;
    Ok(())
}
