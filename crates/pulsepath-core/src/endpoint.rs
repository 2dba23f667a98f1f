//! Datagram substrate. See `SPEC_FULL.md` §4.2.
//!
//! Mirrors the teacher's `DatagramTx` trait in `voice_forwarder.rs`: an
//! `#[async_trait]` seam between the Sender/Receiver cores and the concrete
//! socket, so tests can substitute an in-memory endpoint without opening a
//! real port. [`UdpEndpoint::bind`] spawns one receive-pump task that loops
//! `recv_from` and forwards datagrams over an `mpsc` channel to the caller's
//! single driver task — the driver never calls `recv_from` itself, so
//! delivery to core state stays serialized through one consumer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Result, TransportError};

/// Max UDP payload this transport will ever assemble or accept. Comfortably
/// above any realistic path MTU; oversized reads are simply truncated by
/// `recv_from`, which the header check and reassembly will reject.
const RECV_BUF_LEN: usize = 2048;

/// Abstract send/close surface the Sender and Receiver cores drive. Receive
/// is not part of the trait: it happens on a background pump task that
/// forwards to an `mpsc` channel, not through a trait method call.
#[async_trait]
pub trait DatagramEndpoint: Send + Sync + 'static {
    /// Best-effort send. I/O errors are logged and swallowed — spec.md §7
    /// treats a failed send as something to retry via the normal
    /// retransmission/ack path, not an error the caller awaits.
    async fn send_to(&self, bytes: &[u8], remote: SocketAddr);

    /// Release the underlying socket. Idempotent.
    async fn close(&self);
}

/// Concrete [`DatagramEndpoint`] over a real `tokio::net::UdpSocket`.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
}

impl UdpEndpoint {
    /// The address actually bound, useful when `local_addr` was `:0`.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::BindError)
    }

    /// Bind `local_addr` and start the receive pump. Returns the endpoint
    /// handle plus the channel the pump delivers `(payload, source)` pairs
    /// on; the channel closes once the pump task exits.
    pub async fn bind(local_addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<(Bytes, SocketAddr)>)> {
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(TransportError::BindError)?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1024);

        let pump_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUF_LEN];
            loop {
                match pump_socket.recv_from(&mut buf).await {
                    Ok((n, src)) => {
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        if tx.send((payload, src)).await.is_err() {
                            break; // driver task gone
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "datagram receive failed");
                    }
                }
            }
        });

        Ok((
            Arc::new(Self {
                socket,
                closed: AtomicBool::new(false),
            }),
            rx,
        ))
    }
}

#[async_trait]
impl DatagramEndpoint for UdpEndpoint {
    async fn send_to(&self, bytes: &[u8], remote: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, remote).await {
            warn!(error = %e, %remote, "send_to failed");
        }
    }

    async fn close(&self) {
        // tokio::net::UdpSocket has no explicit close; dropping the last Arc
        // releases the fd. This just makes the call idempotent and gives the
        // driver a symmetric lifecycle hook to call at shutdown.
        self.closed.store(true, Ordering::SeqCst);
    }
}
