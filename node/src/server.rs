//! # Session Server
//!
//! TCP accept loop for the seller role. Every connection runs one PoD
//! session on its own task; the loop itself only accepts and spawns, so a
//! slow buyer never blocks the next one.
//!
//! Channel bytes are counted by wrapping each socket in a
//! [`CountingStream`] before handing it to the protocol driver.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pod_protocol::seller::Seller;
use pod_protocol::transaction::TxStatus;

use crate::metrics::SharedMetrics;

/// Stream adapter that adds every byte read or written to the node's
/// `bytes_transferred_total` counters.
pub struct CountingStream<S> {
    inner: S,
    metrics: SharedMetrics,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, metrics: SharedMetrics) -> Self {
        Self { inner, metrics }
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
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                self.metrics
                    .bytes_transferred_total
                    .with_label_values(&["received"])
                    .inc_by(n);
            }
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
        if let Poll::Ready(Ok(n)) = &poll {
            self.metrics
                .bytes_transferred_total
                .with_label_values(&["sent"])
                .inc_by(*n as u64);
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

/// Accept buyer connections until `shutdown` flips to `true`.
///
/// Sessions already running are left to finish on their own tasks.
pub async fn serve_sessions(
    seller: Arc<Seller>,
    listener: TcpListener,
    metrics: SharedMetrics,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting PoD sessions");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let seller = Arc::clone(&seller);
                    let metrics = Arc::clone(&metrics);
                    tokio::spawn(async move {
                        run_session(&seller, stream, peer, &metrics).await;
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("session listener stopped");
                    break;
                }
            }
        }
    }
}

async fn run_session(seller: &Seller, stream: TcpStream, peer: SocketAddr, metrics: &SharedMetrics) {
    debug!(%peer, "buyer connected");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not set TCP_NODELAY");
    }
    metrics
        .sessions_started_total
        .with_label_values(&["seller"])
        .inc();
    let active = metrics.active_sessions.with_label_values(&["seller"]);
    active.inc();
    let timer = metrics.session_duration_seconds.start_timer();

    let result = seller
        .serve(CountingStream::new(stream, Arc::clone(metrics)))
        .await;

    timer.observe_duration();
    active.dec();
    match result {
        Ok(record) if record.status == TxStatus::Claimed => {
            metrics.proofs_submitted_total.inc();
            metrics
                .sessions_completed_total
                .with_label_values(&["seller", record.kind.label()])
                .inc();
            info!(%peer, session = %record.session_id, "session claimed");
        }
        Ok(record) => {
            metrics
                .sessions_failed_total
                .with_label_values(&["seller", record.status.as_str()])
                .inc();
            warn!(%peer, session = %record.session_id, status = %record.status, "session ended unpaid");
        }
        Err(e) => {
            metrics
                .sessions_failed_total
                .with_label_values(&["seller", e.kind().as_str()])
                .inc();
            warn!(%peer, error = %e, "session failed");
        }
    }
}
