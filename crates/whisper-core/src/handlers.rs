//! Call handlers (§4.4): validate inbound envelopes and dispatch to a
//! connection's sagas.
//!
//! Two departures from §4.4's literal handler text, both forced by the
//! happy-path traversal in §4.5 and recorded in DESIGN.md:
//!
//! - `offer` continues the *incoming* saga (it's the one sitting in
//!   `AwaitingOffer`), and `answer` continues the *outgoing* saga (it's the
//!   one sitting in `AwaitingAnswer`) — the reverse of §4.4's wording, which
//!   contradicts its own §4.5 state traversal.
//! - `dial` never needs an `AwaitingDial`-continuation branch: the incoming
//!   saga is always constructed fresh by this handler with the sender's
//!   ephemeral key already in hand (see saga.rs's `run_incoming`), so "a
//!   connection exists with its incoming saga in `AwaitingDial`" and "force
//!   reopen" collapse into the same action — restart the incoming saga.
//! - A `dial` that arrives while our own outgoing saga to that same peer is
//!   still running means both sides dialed each other at once. The tie is
//!   broken on public key (DESIGN.md OQ2): whichever side's key sorts
//!   greater keeps driving its outgoing saga and ignores the incoming dial;
//!   the other aborts its outgoing saga and accepts the incoming one.

use std::sync::Arc;

use crate::call::CallService;
use crate::config::RuntimeConfig;
use crate::connection::ConnectionState;
use crate::envelope::{self, DialOrClosePayload, IcePayload, IceSource, Method, OfferOrAnswerPayload, Payload};
use crate::registry::ConnectionRegistry;
use crate::saga::{ContinueSignal, SagaState};

pub type FocusOnDial = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type RequestDial = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct CallHandlers {
    own_public_key: String,
    registry: Arc<ConnectionRegistry>,
    call: Arc<CallService>,
    config: RuntimeConfig,
    focus_on_dial: Option<FocusOnDial>,
    request_dial: Option<RequestDial>,
}

impl CallHandlers {
    pub fn new(
        own_public_key: String,
        registry: Arc<ConnectionRegistry>,
        call: Arc<CallService>,
        config: RuntimeConfig,
        focus_on_dial: Option<FocusOnDial>,
        request_dial: Option<RequestDial>,
    ) -> Arc<Self> {
        Arc::new(Self { own_public_key, registry, call, config, focus_on_dial, request_dial })
    }

    /// The hook wired to a transport's `onCall` (§4.3): parse, validate,
    /// dispatch. Detached so a slow handler never blocks the transport's
    /// read loop.
    pub fn handle_raw(self: &Arc<Self>, raw: String) {
        let handlers = Arc::clone(self);
        tokio::spawn(async move {
            handlers.handle(&raw).await;
        });
    }

    async fn handle(&self, raw: &str) {
        let envelope = match envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(%err, "dropping unparseable call envelope");
                return;
            }
        };

        let server_time = self.call.time().server_time();
        if !envelope::verify(&envelope, &self.own_public_key, server_time, self.config.timestamp_freshness_ms) {
            return;
        }

        match envelope.payload {
            Payload::Update(_) => {
                tracing::debug!("update is not a peer-directed call the registry dispatches on");
            }
            Payload::Dial(payload) => self.handle_dial(payload).await,
            Payload::Offer(payload) => self.handle_offer(payload).await,
            Payload::Answer(payload) => self.handle_answer(payload).await,
            Payload::Ice(payload) => self.handle_ice(payload).await,
            Payload::Close(payload) => self.handle_close(payload).await,
        }
    }

    async fn handle_dial(&self, payload: DialOrClosePayload) {
        let peer = payload.sender;
        let Some(ephemeral_public_key) = payload.ephemeral_public_key else {
            tracing::debug!(%peer, "dropping dial with no ephemeral key");
            return;
        };

        let is_new_peer = self.registry.get(&peer).await.is_none();
        if is_new_peer {
            if let Some(focus) = &self.focus_on_dial {
                if !focus(&peer) {
                    tracing::debug!(%peer, "dial vetoed by focusOnDial");
                    return;
                }
            }
            if let Some(request) = &self.request_dial {
                if !request(&peer) {
                    tracing::debug!(%peer, "dial vetoed by requestDial");
                    return;
                }
            }
        }

        // Both sides dialed inside the same freshness window: each now has a
        // live outgoing saga to the other. Break the tie on public key so
        // both sides land on the same answer without another round trip
        // (DESIGN.md OQ2).
        if let Some(connection) = self.registry.get(&peer).await {
            if let Some(outgoing) = connection.outgoing_saga().await {
                if outgoing.state() != SagaState::Closed {
                    if self.own_public_key > peer {
                        tracing::debug!(%peer, "dropping simultaneous dial: local outgoing saga wins the tie-break");
                        return;
                    }
                    tracing::debug!(%peer, "simultaneous dial: remote wins the tie-break, aborting local outgoing saga");
                    outgoing.abort();
                }
            }
        }

        let connection = self.registry.get_or_create_incoming(&peer).await;
        connection.accept_incoming(ephemeral_public_key).await;
    }

    async fn handle_offer(&self, payload: OfferOrAnswerPayload) {
        let peer = payload.sender;
        let Some(connection) = self.registry.get(&peer).await else {
            tracing::debug!(%peer, "dropping offer with no connection");
            return;
        };
        let Some(saga) = connection.incoming_saga().await else {
            tracing::debug!(%peer, "dropping offer with no incoming saga");
            return;
        };
        if saga.state() != SagaState::AwaitingOffer {
            tracing::debug!(%peer, state = ?saga.state(), "dropping offer: incoming saga not awaiting one");
            return;
        }
        saga.continue_(ContinueSignal::Offer {
            peer_ephemeral_public_key: payload.ephemeral_public_key,
            sealed_description: payload.sealed_description,
        });
    }

    async fn handle_answer(&self, payload: OfferOrAnswerPayload) {
        let peer = payload.sender;
        let Some(connection) = self.registry.get(&peer).await else {
            tracing::debug!(%peer, "dropping answer with no connection");
            return;
        };
        let Some(saga) = connection.outgoing_saga().await else {
            tracing::debug!(%peer, "dropping answer with no outgoing saga");
            return;
        };
        if saga.state() != SagaState::AwaitingAnswer {
            tracing::debug!(%peer, state = ?saga.state(), "dropping answer: outgoing saga not awaiting one");
            return;
        }
        saga.continue_(ContinueSignal::Answer {
            peer_ephemeral_public_key: payload.ephemeral_public_key,
            sealed_description: payload.sealed_description,
        });
    }

    async fn handle_ice(&self, payload: IcePayload) {
        let peer = payload.base.sender.clone();
        let Some(connection) = self.registry.get(&peer).await else {
            tracing::debug!(%peer, "dropping ice with no connection");
            return;
        };
        let saga = match payload.source {
            // A candidate tagged `Incoming` came from the peer's incoming
            // saga, which is the counterpart of our outgoing saga.
            IceSource::Incoming => connection.outgoing_saga().await,
            IceSource::Outgoing => connection.incoming_saga().await,
            IceSource::Unknown => {
                tracing::debug!(%peer, "dropping ice with unknown source");
                return;
            }
        };
        let Some(saga) = saga else {
            tracing::debug!(%peer, "dropping ice with no matching saga");
            return;
        };
        saga.on_ice_candidate(&payload.base.sealed_description).await;
    }

    async fn handle_close(&self, payload: DialOrClosePayload) {
        let peer = payload.sender;
        let Some(connection) = self.registry.get(&peer).await else {
            tracing::debug!(%peer, "dropping close with no connection");
            return;
        };
        if connection.state().await == ConnectionState::Closed {
            return;
        }
        if let Some(opened_at) = connection.opened_at_ms().await {
            if payload.timestamp <= opened_at {
                tracing::debug!(%peer, "dropping stale close for a superseded attempt");
                return;
            }
        }
        connection.close_from_peer().await;
    }
}
