//! Connections and the saga pairs that establish them (§3, §4.5, §4.6).

pub mod channel;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::call::CallService;
use crate::config::RuntimeConfig;
use crate::connection::channel::{DataChannel, PeerConnectionFactory};
use crate::crypto::IdentityKeyPair;
use crate::saga::{Role, Saga};

/// Connection lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Open,
    Closed,
}

pub type OnProgress = Arc<dyn Fn(&str) + Send + Sync>;
pub type OnStateChanged = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type OnMessage = Arc<dyn Fn(String) + Send + Sync>;

/// One peer relationship: a pair of sagas (one per direction) racing to
/// open a shared data channel (§3, §4.6). Only one saga's outcome wins;
/// the connection exposes a single [`ConnectionState`] derived from both.
pub struct Connection {
    peer_public_key: String,
    state: RwLock<ConnectionState>,
    opened_at_ms: RwLock<Option<i64>>,
    incoming: RwLock<Option<Arc<Saga>>>,
    outgoing: RwLock<Option<Arc<Saga>>>,
    data_channel: RwLock<Option<Arc<dyn DataChannel>>>,
    on_state_changed: RwLock<Option<OnStateChanged>>,
    on_message: RwLock<Option<OnMessage>>,
    call: Arc<CallService>,
    identity: Arc<IdentityKeyPair>,
    config: RuntimeConfig,
    peer_connection_factory: PeerConnectionFactory,
}

impl Connection {
    pub fn new(
        peer_public_key: String,
        call: Arc<CallService>,
        identity: Arc<IdentityKeyPair>,
        config: RuntimeConfig,
        peer_connection_factory: PeerConnectionFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_public_key,
            state: RwLock::new(ConnectionState::New),
            opened_at_ms: RwLock::new(None),
            incoming: RwLock::new(None),
            outgoing: RwLock::new(None),
            data_channel: RwLock::new(None),
            on_state_changed: RwLock::new(None),
            on_message: RwLock::new(None),
            call,
            identity,
            config,
            peer_connection_factory,
        })
    }

    pub fn peer_public_key(&self) -> &str {
        &self.peer_public_key
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn opened_at_ms(&self) -> Option<i64> {
        *self.opened_at_ms.read().await
    }

    pub async fn set_on_state_changed(&self, handler: OnStateChanged) {
        *self.on_state_changed.write().await = Some(handler);
    }

    pub async fn set_on_message(&self, handler: OnMessage) {
        *self.on_message.write().await = Some(handler);
    }

    pub async fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.read().await.clone()
    }

    /// Send an application message over the open data channel (§6).
    pub async fn send(&self, message: &str) -> crate::error::Result<()> {
        match self.data_channel.read().await.as_ref() {
            Some(channel) => channel.send(message).await,
            None => Err(crate::error::Error::TransportUnavailable),
        }
    }

    /// Start (or restart) the outgoing saga that dials this peer (§4.5).
    pub async fn dial(self: &Arc<Self>) {
        let saga = Saga::new(
            Role::Outgoing,
            self.peer_public_key.clone(),
            Arc::clone(&self.call),
            Arc::clone(&self.identity),
            self.config.clone(),
            Arc::clone(&self.peer_connection_factory),
        );
        *self.outgoing.write().await = Some(Arc::clone(&saga));
        self.spawn_watch(Arc::clone(&saga));
        tokio::spawn(Saga::run_outgoing(saga));
        self.set_state(ConnectionState::Connecting).await;
    }

    /// Accept a fresh incoming attempt, replacing any prior one (§4.5's
    /// "the existing saga is aborted and a fresh one begun" re-dial rule,
    /// resolved in DESIGN.md). `peer_ephemeral_public_key` is the key
    /// carried on the triggering `dial` call.
    pub async fn accept_incoming(self: &Arc<Self>, peer_ephemeral_public_key: String) -> Arc<Saga> {
        if let Some(existing) = self.incoming.write().await.take() {
            existing.abort();
        }
        let saga = Saga::new(
            Role::Incoming,
            self.peer_public_key.clone(),
            Arc::clone(&self.call),
            Arc::clone(&self.identity),
            self.config.clone(),
            Arc::clone(&self.peer_connection_factory),
        );
        *self.incoming.write().await = Some(Arc::clone(&saga));
        self.spawn_watch(Arc::clone(&saga));
        tokio::spawn(Saga::run_incoming(Arc::clone(&saga), peer_ephemeral_public_key));
        self.set_state(ConnectionState::Connecting).await;
        saga
    }

    pub async fn incoming_saga(&self) -> Option<Arc<Saga>> {
        self.incoming.read().await.clone()
    }

    pub async fn outgoing_saga(&self) -> Option<Arc<Saga>> {
        self.outgoing.read().await.clone()
    }

    /// Abort both sagas, notify the peer via the beacon, and mark the
    /// connection closed (§4.6 delete / §6 `Connection.close()`).
    pub async fn close(self: &Arc<Self>) {
        self.abort_sagas().await;
        let _ = self.call.close(&self.peer_public_key).await;
        self.set_state(ConnectionState::Closed).await;
    }

    /// Mark the connection closed in response to an inbound `close` call
    /// (§4.4). Unlike [`Self::close`], this never sends our own `close`
    /// back — we are reacting to the peer's, not initiating teardown.
    pub async fn close_from_peer(self: &Arc<Self>) {
        self.abort_sagas().await;
        self.set_state(ConnectionState::Closed).await;
    }

    async fn abort_sagas(&self) {
        if let Some(saga) = self.incoming.read().await.as_ref() {
            saga.abort();
        }
        if let Some(saga) = self.outgoing.read().await.as_ref() {
            saga.abort();
        }
    }

    async fn set_state(self: &Arc<Self>, new_state: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == new_state {
            return;
        }
        *state = new_state;
        drop(state);
        if new_state == ConnectionState::Open {
            *self.opened_at_ms.write().await = Some(self.call.time().server_time());
        }
        if let Some(handler) = self.on_state_changed.read().await.as_ref() {
            handler(new_state);
        }
    }

    /// Watch a saga's state transitions and fold them into the connection's
    /// single state (§3: open on the first saga to connect, closed once
    /// both are terminal).
    fn spawn_watch(self: &Arc<Self>, saga: Arc<Saga>) {
        let connection = Arc::clone(self);
        let mut rx = saga.watch_state();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    crate::saga::SagaState::Connected => {
                        if let Some(channel) = saga.data_channel().await {
                            connection.bind_data_channel(channel).await;
                        }
                        connection.set_state(ConnectionState::Open).await;
                    }
                    crate::saga::SagaState::Closed => {
                        if connection.both_terminal().await {
                            connection.set_state(ConnectionState::Closed).await;
                        }
                        return;
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    async fn bind_data_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        {
            let existing = self.data_channel.read().await;
            if existing.is_some() {
                return;
            }
        }
        let connection = Arc::clone(self);
        channel.set_on_message(Arc::new(move |message| {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                if let Some(handler) = connection.on_message.read().await.as_ref() {
                    handler(message);
                }
            });
        }));
        *self.data_channel.write().await = Some(channel);
    }

    async fn both_terminal(&self) -> bool {
        let incoming_ok = match self.incoming.read().await.as_ref() {
            Some(saga) => saga.state() == crate::saga::SagaState::Closed,
            None => true,
        };
        let outgoing_ok = match self.outgoing.read().await.as_ref() {
            Some(saga) => saga.state() == crate::saga::SagaState::Closed,
            None => true,
        };
        incoming_ok && outgoing_ok
    }
}
