//! In-memory transport for multi-node tests on a paused clock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{IpAddress, Transport};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Routes frames between [`MemoryTransport`] endpoints by address.
/// Removing an endpoint makes it unreachable in both directions, which is
/// how tests simulate a crashed or partitioned node.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: Mutex<HashMap<IpAddress, mpsc::UnboundedSender<(IpAddress, String)>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(self: &Arc<Self>, addr: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .unwrap()
            .insert(addr.to_string(), tx);
        MemoryTransport {
            hub: self.clone(),
            addr: addr.to_string(),
            inbound: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate a crash: the address stops receiving and its sends fail.
    pub fn kill(&self, addr: &str) {
        self.endpoints.lock().unwrap().remove(addr);
    }

    fn route(&self, dest: &str) -> Option<mpsc::UnboundedSender<(IpAddress, String)>> {
        self.endpoints.lock().unwrap().get(dest).cloned()
    }

    fn is_registered(&self, addr: &str) -> bool {
        self.endpoints.lock().unwrap().contains_key(addr)
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    addr: IpAddress,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(IpAddress, String)>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, dest: &str, frame: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) || !self.hub.is_registered(&self.addr) {
            return false;
        }
        match self.hub.route(dest) {
            Some(tx) => tx.send((self.addr.clone(), frame.to_string())).is_ok(),
            None => false,
        }
    }

    async fn receive(&self) -> Option<(IpAddress, String)> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut inbound = self.inbound.lock().await;
        match timeout(RECEIVE_TIMEOUT, inbound.recv()).await {
            Ok(frame) => frame,
            Err(_) => None,
        }
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.kill(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn frames_route_by_address() {
        let hub = MemoryHub::new();
        let a = hub.open("10.0.0.1:5000");
        let b = hub.open("10.0.0.2:5000");

        assert!(a.send("10.0.0.2:5000", "hello").await);
        let (source, frame) = b.receive().await.unwrap();
        assert_eq!(source, "10.0.0.1:5000");
        assert_eq!(frame, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn killed_endpoint_is_unreachable_both_ways() {
        let hub = MemoryHub::new();
        let a = hub.open("10.0.0.1:5000");
        let _b = hub.open("10.0.0.2:5000");

        hub.kill("10.0.0.2:5000");
        assert!(!a.send("10.0.0.2:5000", "hello").await);

        hub.kill("10.0.0.1:5000");
        assert!(!a.send("10.0.0.1:5000", "loop").await);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_idle() {
        let hub = MemoryHub::new();
        let a = hub.open("10.0.0.1:5000");
        assert!(a.receive().await.is_none());
    }
}
