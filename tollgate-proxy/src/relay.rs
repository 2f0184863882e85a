use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::events::TransferStats;

/// Per-connection byte counters for the outbound socket.
#[derive(Debug, Default)]
pub(crate) struct TransferCounters {
    connected: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
}

impl TransferCounters {
    /// `None` until an outbound socket has been wrapped.
    pub(crate) fn stats(&self) -> Option<TransferStats> {
        if !self.connected.load(Ordering::Acquire) {
            return None;
        }
        Some(TransferStats {
            bytes_sent_to_target: self.sent.load(Ordering::Relaxed),
            bytes_received_from_target: self.received.load(Ordering::Relaxed),
        })
    }
}

/// Wraps the outbound socket and counts every byte crossing it.
pub(crate) struct CountingStream<S> {
    inner: S,
    counters: Arc<TransferCounters>,
}

impl<S> CountingStream<S> {
    pub(crate) fn new(inner: S, counters: Arc<TransferCounters>) -> Self {
        counters.connected.store(true, Ordering::Release);
        Self { inner, counters }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            self.counters.received.fetch_add(read, Ordering::Relaxed);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            self.counters
                .sent
                .fetch_add(*written as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Pumps bytes both ways until either side is done.
///
/// `to_target` and `to_client` are bytes already read off one side (past a
/// parsed head) that still have to reach the other.
pub(crate) async fn relay<C, T>(
    client: &mut C,
    target: &mut T,
    to_target: Vec<u8>,
    to_client: Vec<u8>,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    if !to_target.is_empty() {
        target.write_all(&to_target).await?;
        target.flush().await?;
    }
    if !to_client.is_empty() {
        client.write_all(&to_client).await?;
        client.flush().await?;
    }
    tokio::io::copy_bidirectional(client, target).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{CountingStream, TransferCounters, relay};

    #[test]
    fn stats_absent_until_connected() {
        let counters = Arc::new(TransferCounters::default());
        assert!(counters.stats().is_none());

        let _stream = CountingStream::new(tokio::io::empty(), Arc::clone(&counters));
        let stats = counters.stats().unwrap();
        assert_eq!(stats.bytes_sent_to_target, 0);
        assert_eq!(stats.bytes_received_from_target, 0);
    }

    #[tokio::test]
    async fn counts_both_directions() {
        let counters = Arc::new(TransferCounters::default());
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = CountingStream::new(near, Arc::clone(&counters));

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        far.write_all(b"pong!!!").await.unwrap();
        let mut reply = [0u8; 7];
        stream.read_exact(&mut reply).await.unwrap();

        let stats = counters.stats().unwrap();
        assert_eq!(stats.bytes_sent_to_target, 5);
        assert_eq!(stats.bytes_received_from_target, 7);
    }

    #[tokio::test]
    async fn relay_flushes_pending_bytes_first() {
        let (mut client, mut client_peer) = tokio::io::duplex(1024);
        let (mut target, mut target_peer) = tokio::io::duplex(1024);

        let pump = tokio::spawn(async move {
            relay(&mut client_peer, &mut target_peer, b"early".to_vec(), b"head".to_vec()).await
        });

        let mut early = [0u8; 5];
        target.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"head");

        client.write_all(b"ping").await.unwrap();
        let mut ping = [0u8; 4];
        target.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");

        drop(client);
        drop(target);
        let _ = pump.await.unwrap();
    }
}
