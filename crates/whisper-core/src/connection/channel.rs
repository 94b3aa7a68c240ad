//! The seam between the core and the out-of-scope browser peer-connection
//! and data-channel primitives (§1 Non-goals). The core never interprets SDP
//! or ICE candidate bytes; it only transports them encrypted. These traits
//! are what an embedding application implements against a real `RTCPeerConnection`;
//! [`LoopbackPeerConnection`]/[`LoopbackChannel`] are the in-process test
//! double used by this crate's own saga and connection tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};

/// The ready bidirectional message channel a [`super::Connection`] exposes
/// to the application once a saga reaches `Connected` (§3, §6).
#[async_trait::async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Register the handler invoked for every inbound application message.
    /// Connections call this once, immediately after the channel opens.
    fn set_on_message(&self, handler: Arc<dyn Fn(String) + Send + Sync>);
}

/// The browser peer-connection a saga drives through SDP/ICE installation
/// (§4.5). Opaque to the core: `create_local_description` returns whatever
/// bytes the application's WebRTC stack produces, and the core only signs,
/// encrypts, and transports them.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_local_description(&self) -> Result<String>;
    async fn install_remote_description(&self, sdp: &str) -> Result<()>;
    async fn add_remote_ice_candidate(&self, candidate: &str) -> Result<()>;
    /// Suspend until the underlying connection reaches its connected state,
    /// then yield the data channel (§5 `AwaitingConnection` suspension point).
    async fn wait_connected(&self) -> Result<Arc<dyn DataChannel>>;
}

/// Produces a fresh [`PeerConnection`] for each saga attempt (§9: the
/// ephemeral pair, and by extension the underlying peer-connection, is
/// attempt-scoped, not connection-scoped).
pub type PeerConnectionFactory = Arc<dyn Fn() -> Arc<dyn PeerConnection> + Send + Sync>;

/// An in-memory, cross-wired pair of channels standing in for two peers'
/// real data channels in tests and the demo binary.
pub struct LoopbackChannel {
    tx: mpsc::UnboundedSender<String>,
    on_message: std::sync::Mutex<Option<Arc<dyn Fn(String) + Send + Sync>>>,
    open: AtomicBool,
}

impl LoopbackChannel {
    /// Build two ends wired to each other: messages sent on one arrive,
    /// via a background pump, at the other's registered handler.
    pub fn pair() -> (Arc<LoopbackChannel>, Arc<LoopbackChannel>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();

        let a = Arc::new(LoopbackChannel {
            tx: tx_ab,
            on_message: std::sync::Mutex::new(None),
            open: AtomicBool::new(true),
        });
        let b = Arc::new(LoopbackChannel {
            tx: tx_ba,
            on_message: std::sync::Mutex::new(None),
            open: AtomicBool::new(true),
        });

        spawn_pump(rx_ba, Arc::clone(&a));
        spawn_pump(rx_ab, Arc::clone(&b));

        (a, b)
    }
}

fn spawn_pump(mut rx: mpsc::UnboundedReceiver<String>, owner: Arc<LoopbackChannel>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let handler = owner.on_message.lock().unwrap().clone();
            match handler {
                Some(handler) => handler(message),
                None => tracing::debug!("loopback channel dropped a message with no handler registered"),
            }
        }
    });
}

#[async_trait::async_trait]
impl DataChannel for LoopbackChannel {
    async fn send(&self, message: &str) -> Result<()> {
        self.tx
            .send(message.to_string())
            .map_err(|_| Error::TransportUnavailable)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn set_on_message(&self, handler: Arc<dyn Fn(String) + Send + Sync>) {
        *self.on_message.lock().unwrap() = Some(handler);
    }
}

/// A [`PeerConnection`] backed by one end of a [`LoopbackChannel`] pair.
/// SDP/ICE content is never inspected; the connection is considered
/// established the moment a remote description is installed (real trickle
/// ICE gathering and candidate matching is out of scope here).
pub struct LoopbackPeerConnection {
    channel: Arc<LoopbackChannel>,
    connected: Notify,
    installed: AtomicBool,
}

impl LoopbackPeerConnection {
    pub fn new(channel: Arc<LoopbackChannel>) -> Arc<dyn PeerConnection> {
        Arc::new(Self {
            channel,
            connected: Notify::new(),
            installed: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_local_description(&self) -> Result<String> {
        Ok("loopback-sdp".to_string())
    }

    async fn install_remote_description(&self, _sdp: &str) -> Result<()> {
        self.installed.store(true, Ordering::Relaxed);
        self.connected.notify_waiters();
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, _candidate: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_connected(&self) -> Result<Arc<dyn DataChannel>> {
        if !self.installed.load(Ordering::Relaxed) {
            self.connected.notified().await;
        }
        Ok(Arc::clone(&self.channel) as Arc<dyn DataChannel>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_channel_delivers_across_the_pair() {
        let (a, b) = LoopbackChannel::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_on_message(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));

        a.send("hello").await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "hello");
    }

    #[tokio::test]
    async fn peer_connection_resolves_once_remote_description_installs() {
        let (a, _b) = LoopbackChannel::pair();
        let pc = LoopbackPeerConnection::new(a);
        let pc2 = Arc::clone(&pc);
        let waiter = tokio::spawn(async move { pc2.wait_connected().await });

        tokio::task::yield_now().await;
        pc.install_remote_description("sdp").await.unwrap();

        let channel = waiter.await.unwrap().unwrap();
        assert!(channel.is_open());
    }
}
