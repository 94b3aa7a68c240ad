//! Connection registry (§4.6): the single owner of every [`Connection`] this
//! process knows about, keyed by peer public key.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::call::CallService;
use crate::config::RuntimeConfig;
use crate::connection::channel::PeerConnectionFactory;
use crate::connection::Connection;
use crate::crypto::IdentityKeyPair;

/// Invoked the first time a peer dials this process with no existing
/// connection (§4.6). Runs detached; any error it produces is logged, never
/// propagated back into the call handler.
pub type OnIncomingConnection = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    call: Arc<CallService>,
    identity: Arc<IdentityKeyPair>,
    config: RuntimeConfig,
    peer_connection_factory: PeerConnectionFactory,
    on_incoming_connection: RwLock<Option<OnIncomingConnection>>,
}

impl ConnectionRegistry {
    pub fn new(
        call: Arc<CallService>,
        identity: Arc<IdentityKeyPair>,
        config: RuntimeConfig,
        peer_connection_factory: PeerConnectionFactory,
        on_incoming_connection: Option<OnIncomingConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            call,
            identity,
            config,
            peer_connection_factory,
            on_incoming_connection: RwLock::new(on_incoming_connection),
        })
    }

    pub async fn set_on_incoming_connection(&self, hook: OnIncomingConnection) {
        *self.on_incoming_connection.write().await = Some(hook);
    }

    pub async fn get(&self, peer_public_key: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(peer_public_key).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, peer_public_key: &str) {
        let connection = self.connections.write().await.remove(peer_public_key);
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Get the existing connection to `peer_public_key`, or create and
    /// start an outgoing saga toward it (§6 `WhisperHandle.dial(peer)`).
    ///
    /// The check-and-insert happens under one held write guard so two
    /// concurrent callers for the same peer can never both construct a
    /// `Connection` and race to register it (§4.6: the registry is the
    /// exclusive owner of every `Connection`).
    pub async fn get_or_dial(&self, peer_public_key: &str) -> Arc<Connection> {
        let mut guard = self.connections.write().await;
        if let Some(existing) = guard.get(peer_public_key) {
            return Arc::clone(existing);
        }
        let connection = self.new_connection(peer_public_key);
        guard.insert(peer_public_key.to_string(), Arc::clone(&connection));
        drop(guard);
        connection.dial().await;
        connection
    }

    /// Get or create the connection a `dial` call names, firing
    /// `onIncomingConnection` the first time a peer dials with no prior
    /// connection (§4.4, §4.6). Same single-guard check-and-insert as
    /// [`Self::get_or_dial`].
    pub async fn get_or_create_incoming(&self, peer_public_key: &str) -> Arc<Connection> {
        let mut guard = self.connections.write().await;
        if let Some(existing) = guard.get(peer_public_key) {
            return Arc::clone(existing);
        }
        let connection = self.new_connection(peer_public_key);
        guard.insert(peer_public_key.to_string(), Arc::clone(&connection));
        drop(guard);

        if let Some(hook) = self.on_incoming_connection.read().await.as_ref() {
            let hook = Arc::clone(hook);
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                hook(connection);
            });
        }
        connection
    }

    fn new_connection(&self, peer_public_key: &str) -> Arc<Connection> {
        Connection::new(
            peer_public_key.to_string(),
            Arc::clone(&self.call),
            Arc::clone(&self.identity),
            self.config.clone(),
            Arc::clone(&self.peer_connection_factory),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::channel::{LoopbackChannel, LoopbackPeerConnection};
    use crate::session::SessionService;
    use crate::time::TimeService;
    use crate::transport::mock::MockRelay;

    fn factory() -> PeerConnectionFactory {
        Arc::new(|| {
            let (a, _b) = LoopbackChannel::pair();
            LoopbackPeerConnection::new(a)
        })
    }

    fn registry(relay: &MockRelay) -> Arc<ConnectionRegistry> {
        let identity = IdentityKeyPair::generate();
        let session = SessionService::new(identity.clone());
        let transport = Arc::new(relay.transport());
        let call = Arc::new(CallService::new(
            session,
            TimeService::new(),
            RuntimeConfig::default(),
            Some(transport.clone()),
            Some(transport),
            None,
        ));
        ConnectionRegistry::new(call, Arc::new(identity), RuntimeConfig::default(), factory(), None)
    }

    #[tokio::test]
    async fn get_or_dial_reuses_the_same_connection() {
        let relay = MockRelay::new();
        let registry = registry(&relay);
        let a = registry.get_or_dial("peer").await;
        let b = registry.get_or_dial("peer").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn incoming_connection_hook_fires_once_for_a_new_peer() {
        let relay = MockRelay::new();
        let registry = registry(&relay);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry
            .set_on_incoming_connection(Arc::new(move |connection| {
                let _ = tx.send(connection.peer_public_key().to_string());
            }))
            .await;

        registry.get_or_create_incoming("peer").await;
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen, "peer");

        registry.get_or_create_incoming("peer").await;
        assert!(rx.try_recv().is_err());
    }
}
