//! Best-effort, frame-oriented transport between lobby members.

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

/// `ip:port` string identifying a peer. The listening address is a peer's
/// identity throughout the protocol.
pub type IpAddress = String;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Address-to-address frame delivery. One `send` produces at most one
/// `receive` on the destination; there is no retry and no ordering across
/// calls. A failed `send` is a signal the membership layer acts on, not an
/// error.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort one-shot delivery. Returns false on any failure.
    async fn send(&self, dest: &str, frame: &str) -> bool;

    /// Blocks up to a short bounded interval for one inbound frame.
    /// Returns `None` on idle timeout or after shutdown. The returned
    /// address is the remote end of the connection, not the sender's
    /// lobby identity; messages carry their sender in-band.
    async fn receive(&self) -> Option<(IpAddress, String)>;

    /// Unblocks any in-flight `receive` and releases the listening
    /// endpoint. Idempotent.
    async fn shutdown(&self);
}

/// TCP transport: connect-send-close per outgoing frame, accept-read-to-EOF
/// per incoming frame.
pub struct TcpTransport {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    closing: Notify,
}

impl TcpTransport {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("listening on {local_addr}");
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, dest: &str, frame: &str) -> bool {
        let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(dest)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("connect to {dest} failed: {e}");
                return false;
            }
            Err(_) => {
                debug!("connect to {dest} timed out");
                return false;
            }
        };

        let write = async {
            stream.write_all(frame.as_bytes()).await?;
            // Half-close so the receiver's read-to-EOF sees the frame end.
            stream.shutdown().await
        };
        match timeout(CONNECT_TIMEOUT, write).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("send to {dest} failed: {e}");
                false
            }
            Err(_) => {
                debug!("send to {dest} timed out");
                false
            }
        }
    }

    async fn receive(&self) -> Option<(IpAddress, String)> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let guard = self.listener.lock().await;
        let listener = guard.as_ref()?;

        let accepted = tokio::select! {
            _ = self.closing.notified() => return None,
            accepted = timeout(RECEIVE_TIMEOUT, listener.accept()) => accepted,
        };
        match accepted {
            // Idle timeout; the caller decides whether to keep listening.
            Err(_) => None,
            Ok(Err(e)) => {
                warn!("accept failed: {e}");
                None
            }
            Ok(Ok((mut stream, remote))) => {
                let mut frame = String::new();
                match timeout(RECEIVE_TIMEOUT, stream.read_to_string(&mut frame)).await {
                    Ok(Ok(_)) => Some((remote.to_string(), frame)),
                    Ok(Err(e)) => {
                        warn!("read from {remote} failed: {e}");
                        None
                    }
                    Err(_) => {
                        warn!("read from {remote} timed out");
                        None
                    }
                }
            }
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake a blocked receive, or leave a permit if none is waiting.
        self.closing.notify_waiters();
        self.closing.notify_one();
        self.listener.lock().await.take();
    }
}
