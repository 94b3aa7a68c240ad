//! Connection sagas (§4.5): the per-attempt state machines that negotiate
//! SDP/ICE over signed, encrypted calls and hand off a data channel.
//!
//! Two asymmetries in the spec's happy path drive the shape of this module:
//!
//! - The peer that dials sends `offer` before it has ever seen the peer's
//!   ephemeral key (its first inbound message is `answer`). The ordinary
//!   mutual ephemeral-ephemeral Diffie-Hellman used for every later frame
//!   can't produce a key yet, so the first `offer` is sealed with the
//!   one-sided bootstrap key from [`crate::crypto::derive_bootstrap_key_as_recipient`]
//!   instead (see crypto.rs's doc comments and DESIGN.md).
//! - `offer`/`answer` call handlers continue the saga that is actually
//!   sitting in the matching `Awaiting*` state in the happy path traversal
//!   below (incoming for `offer`, outgoing for `answer`) rather than the
//!   roles named in §4.4's handler text verbatim; DESIGN.md records this
//!   as a resolved inconsistency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, OnceCell};

use crate::call::CallService;
use crate::config::RuntimeConfig;
use crate::connection::channel::{DataChannel, PeerConnection, PeerConnectionFactory};
use crate::crypto::{self, EphemeralKeyPair, IdentityKeyPair, SharedKey};
use crate::envelope::IceSource;
use crate::error::Result;

/// Which direction this saga negotiates (§3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outgoing,
    Incoming,
}

/// The full state list of §4.5, driven top to bottom by [`Saga::run_outgoing`]
/// / [`Saga::run_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    New,
    AwaitDial,
    AwaitingDial,
    DialAccepted,
    SendOffer,
    SendingOffer,
    OfferSent,
    AwaitAnswer,
    AwaitingAnswer,
    AnswerReceived,
    AwaitConnection,
    AwaitingConnection,
    Connected,
    AwaitOffer,
    AwaitingOffer,
    OfferReceived,
    SendAnswer,
    SendingAnswer,
    AnswerSent,
    Closing,
    Closed,
}

/// What arrives from a call handler while a saga is suspended in an
/// `Awaiting*` state (§4.4).
#[derive(Debug, Clone)]
pub enum ContinueSignal {
    /// Incoming saga's `AwaitingOffer`: the sealed SDP from `offer`.
    Offer {
        peer_ephemeral_public_key: String,
        sealed_description: String,
    },
    /// Outgoing saga's `AwaitingAnswer`: the sealed SDP from `answer`.
    Answer {
        peer_ephemeral_public_key: String,
        sealed_description: String,
    },
}

enum SagaEvent {
    Continue(ContinueSignal),
    Abort,
}

enum Outcome {
    Continue(ContinueSignal),
    Abort,
    Deadline,
}

struct SagaInner {
    ephemeral: Option<EphemeralKeyPair>,
    peer_ephemeral_public_key: Option<String>,
    shared_key: Option<SharedKey>,
    remote_installed: bool,
    buffered_ice: Vec<String>,
    pending: Option<oneshot::Sender<SagaEvent>>,
    aborted: bool,
}

impl SagaInner {
    fn new() -> Self {
        Self {
            ephemeral: None,
            peer_ephemeral_public_key: None,
            shared_key: None,
            remote_installed: false,
            buffered_ice: Vec::new(),
            pending: None,
            aborted: false,
        }
    }
}

/// One attempt to establish a connection in a given direction.
pub struct Saga {
    role: Role,
    peer_public_key: String,
    call: Arc<CallService>,
    own_identity: Arc<IdentityKeyPair>,
    config: RuntimeConfig,
    peer_connection: Arc<dyn PeerConnection>,
    state_tx: watch::Sender<SagaState>,
    data_channel: OnceCell<Arc<dyn DataChannel>>,
    inner: std::sync::Mutex<SagaInner>,
}

impl Saga {
    pub fn new(
        role: Role,
        peer_public_key: String,
        call: Arc<CallService>,
        own_identity: Arc<IdentityKeyPair>,
        config: RuntimeConfig,
        peer_connection_factory: PeerConnectionFactory,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SagaState::New);
        Arc::new(Self {
            role,
            peer_public_key,
            call,
            own_identity,
            config,
            peer_connection: peer_connection_factory(),
            state_tx,
            data_channel: OnceCell::new(),
            inner: std::sync::Mutex::new(SagaInner::new()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SagaState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SagaState> {
        self.state_tx.subscribe()
    }

    pub async fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.get().cloned()
    }

    /// Deliver a call handler's continuation to a suspended `Awaiting*`
    /// state. A no-op, logged at debug, if the saga is not currently
    /// suspended (§4.5: `continue()` outside `Awaiting*` does nothing).
    pub fn continue_(&self, signal: ContinueSignal) {
        let sender = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.take()
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(SagaEvent::Continue(signal));
            }
            None => tracing::debug!(role = ?self.role, state = ?self.state(), "continue() on a saga not awaiting, ignoring"),
        }
    }

    /// Force the saga into `Closing` regardless of its current state
    /// (§4.5: `abort()` always succeeds).
    pub fn abort(&self) {
        let sender = {
            let mut inner = self.inner.lock().unwrap();
            inner.aborted = true;
            inner.pending.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(SagaEvent::Abort);
        }
    }

    /// Queue (or immediately forward) a sealed ICE candidate from the peer.
    /// Candidates that arrive before the remote description is installed
    /// are buffered and flushed in order once it is (§4.5 ICE buffering).
    pub async fn on_ice_candidate(&self, sealed_candidate: &str) {
        let ready = {
            let inner = self.inner.lock().unwrap();
            inner.remote_installed && inner.shared_key.is_some()
        };
        if ready {
            self.decrypt_and_add_ice(sealed_candidate).await;
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.buffered_ice.push(sealed_candidate.to_string());
    }

    async fn decrypt_and_add_ice(&self, sealed_candidate: &str) {
        let key = {
            let inner = self.inner.lock().unwrap();
            match &inner.shared_key {
                Some(key) => key.clone(),
                None => return,
            }
        };
        let Ok(frame) = crypto::base64_decode(sealed_candidate) else {
            tracing::warn!("dropping ice candidate with invalid base64 framing");
            return;
        };
        match key.open(&frame) {
            Ok(plaintext) => {
                if let Ok(candidate) = String::from_utf8(plaintext) {
                    let _ = self.peer_connection.add_remote_ice_candidate(&candidate).await;
                }
            }
            Err(_) => tracing::warn!("dropping ice candidate that failed AEAD authentication"),
        }
    }

    async fn flush_buffered_ice(&self) {
        let buffered = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.buffered_ice)
        };
        for candidate in buffered {
            self.decrypt_and_add_ice(&candidate).await;
        }
    }

    /// Seal a local ICE candidate for the wire, using this attempt's
    /// established shared key. `None` if no shared key has been derived yet
    /// (callers should not be generating local candidates before that point
    /// in the happy path, but a defensive caller can treat this as "retry
    /// later").
    pub fn seal_local_ice(&self, candidate: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .shared_key
            .as_ref()
            .map(|key| crypto::base64_encode(&key.seal(candidate.as_bytes())))
    }

    pub fn ice_source(&self) -> IceSource {
        match self.role {
            Role::Outgoing => IceSource::Outgoing,
            Role::Incoming => IceSource::Incoming,
        }
    }

    fn set_state(&self, state: SagaState) {
        let _ = self.state_tx.send(state);
    }

    async fn suspend(&self) -> Outcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.aborted {
                return Outcome::Abort;
            }
            inner.pending = Some(tx);
        }
        tokio::select! {
            event = rx => match event {
                Ok(SagaEvent::Continue(signal)) => Outcome::Continue(signal),
                Ok(SagaEvent::Abort) | Err(_) => Outcome::Abort,
            },
            _ = tokio::time::sleep(Duration::from_secs(self.config.attempt_deadline_secs)) => Outcome::Deadline,
        }
    }

    async fn close(&self, reason: &'static str) {
        tracing::debug!(role = ?self.role, peer = %self.peer_public_key, reason, "saga closing");
        self.set_state(SagaState::Closing);
        self.set_state(SagaState::Closed);
    }

    fn peer_identity(&self) -> Result<ed25519_dalek::VerifyingKey> {
        crypto::parse_verifying_key(&self.peer_public_key)
    }

    // ── Outgoing happy path (§4.5) ──────────────────────────────────────────

    pub async fn run_outgoing(self: Arc<Self>) {
        self.set_state(SagaState::AwaitDial);
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key_base64();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.ephemeral = Some(ephemeral);
        }

        self.set_state(SagaState::AwaitingDial);
        if let Err(err) = self.call.dial(&self.peer_public_key, &ephemeral_public).await {
            tracing::warn!(%err, "dial failed");
            return self.close("dial failed").await;
        }
        self.set_state(SagaState::DialAccepted);

        self.set_state(SagaState::SendOffer);
        let peer_identity = match self.peer_identity() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(%err, "peer public key did not parse as a valid identity");
                return self.close("invalid peer identity").await;
            }
        };
        let sdp = match self.peer_connection.create_local_description().await {
            Ok(sdp) => sdp,
            Err(err) => {
                tracing::warn!(%err, "failed to create local description");
                return self.close("local description failed").await;
            }
        };
        let bootstrap_key = {
            let inner = self.inner.lock().unwrap();
            inner.ephemeral.as_ref().unwrap().derive_bootstrap_key_as_sender(&peer_identity)
        };
        let bootstrap_key = match bootstrap_key {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(%err, "failed to derive offer bootstrap key");
                return self.close("bootstrap key derivation failed").await;
            }
        };
        let sealed_offer = crypto::base64_encode(&bootstrap_key.seal(sdp.as_bytes()));

        self.set_state(SagaState::SendingOffer);
        if let Err(err) = self.call.offer(&self.peer_public_key, &ephemeral_public, &sealed_offer).await {
            tracing::warn!(%err, "offer failed");
            return self.close("offer failed").await;
        }
        self.set_state(SagaState::OfferSent);

        self.set_state(SagaState::AwaitAnswer);
        self.set_state(SagaState::AwaitingAnswer);
        let (peer_ephemeral_public_key, sealed_description) = match self.suspend().await {
            Outcome::Continue(ContinueSignal::Answer { peer_ephemeral_public_key, sealed_description }) => {
                (peer_ephemeral_public_key, sealed_description)
            }
            Outcome::Continue(_) => {
                tracing::warn!("outgoing saga received an unexpected continuation while awaiting answer");
                return self.close("unexpected continuation").await;
            }
            Outcome::Abort => return self.close("aborted while awaiting answer").await,
            Outcome::Deadline => return self.close("deadline while awaiting answer").await,
        };

        let shared_key = {
            let inner = self.inner.lock().unwrap();
            inner.ephemeral.as_ref().unwrap().derive_shared_key(&peer_ephemeral_public_key)
        };
        let shared_key = match shared_key {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(%err, "failed to derive mutual shared key from answer");
                return self.close("shared key derivation failed").await;
            }
        };
        let Ok(frame) = crypto::base64_decode(&sealed_description) else {
            tracing::warn!("answer sealed description was not valid base64");
            return self.close("malformed answer").await;
        };
        let opened = match shared_key.open(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, "answer failed AEAD authentication");
                return self.close("answer decryption failed").await;
            }
        };
        let Ok(answer_sdp) = String::from_utf8(opened) else {
            tracing::warn!("answer plaintext was not valid UTF-8");
            return self.close("malformed answer sdp").await;
        };

        if let Err(err) = self.peer_connection.install_remote_description(&answer_sdp).await {
            tracing::warn!(%err, "failed to install remote description from answer");
            return self.close("remote description install failed").await;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.peer_ephemeral_public_key = Some(peer_ephemeral_public_key);
            inner.shared_key = Some(shared_key);
            inner.remote_installed = true;
        }
        self.flush_buffered_ice().await;
        self.set_state(SagaState::AnswerReceived);

        self.finish_connecting().await;
    }

    // ── Incoming happy path (§4.5) ──────────────────────────────────────────

    /// `peer_ephemeral_public_key` is the key carried on the `dial` call
    /// that created this saga (§4.4). Unlike the outgoing saga's own
    /// `AwaitDial`/`AwaitingDial` pair, the incoming side never suspends to
    /// wait for it: the handler that invokes this already has it in hand
    /// from the call that constructed the saga, so there is nothing to
    /// continue() — `AwaitingDial` here is a transiently-observed, not a
    /// suspended, state (see DESIGN.md).
    pub async fn run_incoming(self: Arc<Self>, peer_ephemeral_public_key: String) {
        self.set_state(SagaState::AwaitingDial);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.peer_ephemeral_public_key = Some(peer_ephemeral_public_key);
        }

        self.set_state(SagaState::AwaitOffer);
        self.set_state(SagaState::AwaitingOffer);
        let (peer_ephemeral_public_key, sealed_description) = match self.suspend().await {
            Outcome::Continue(ContinueSignal::Offer { peer_ephemeral_public_key, sealed_description }) => {
                (peer_ephemeral_public_key, sealed_description)
            }
            Outcome::Continue(_) => {
                tracing::warn!("incoming saga received an unexpected continuation while awaiting offer");
                return self.close("unexpected continuation").await;
            }
            Outcome::Abort => return self.close("aborted while awaiting offer").await,
            Outcome::Deadline => return self.close("deadline while awaiting offer").await,
        };

        let bootstrap_key = match crypto::derive_bootstrap_key_as_recipient(&self.own_identity, &peer_ephemeral_public_key) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(%err, "failed to derive offer bootstrap key as recipient");
                return self.close("bootstrap key derivation failed").await;
            }
        };
        let Ok(frame) = crypto::base64_decode(&sealed_description) else {
            tracing::warn!("offer sealed description was not valid base64");
            return self.close("malformed offer").await;
        };
        let opened = match bootstrap_key.open(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, "offer failed AEAD authentication");
                return self.close("offer decryption failed").await;
            }
        };
        let Ok(offer_sdp) = String::from_utf8(opened) else {
            tracing::warn!("offer plaintext was not valid UTF-8");
            return self.close("malformed offer sdp").await;
        };
        if let Err(err) = self.peer_connection.install_remote_description(&offer_sdp).await {
            tracing::warn!(%err, "failed to install remote description from offer");
            return self.close("remote description install failed").await;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.peer_ephemeral_public_key = Some(peer_ephemeral_public_key);
            inner.remote_installed = true;
        }
        self.set_state(SagaState::OfferReceived);

        self.set_state(SagaState::SendAnswer);
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key_base64();
        let peer_ephemeral_public_key = {
            let inner = self.inner.lock().unwrap();
            inner.peer_ephemeral_public_key.clone().unwrap()
        };
        let shared_key = match ephemeral.derive_shared_key(&peer_ephemeral_public_key) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(%err, "failed to derive mutual shared key for answer");
                return self.close("shared key derivation failed").await;
            }
        };
        let sdp = match self.peer_connection.create_local_description().await {
            Ok(sdp) => sdp,
            Err(err) => {
                tracing::warn!(%err, "failed to create local description");
                return self.close("local description failed").await;
            }
        };
        let sealed_answer = crypto::base64_encode(&shared_key.seal(sdp.as_bytes()));
        {
            let mut inner = self.inner.lock().unwrap();
            inner.ephemeral = Some(ephemeral);
            inner.shared_key = Some(shared_key);
        }
        self.flush_buffered_ice().await;

        self.set_state(SagaState::SendingAnswer);
        if let Err(err) = self.call.answer(&self.peer_public_key, &ephemeral_public, &sealed_answer).await {
            tracing::warn!(%err, "answer failed");
            return self.close("answer failed").await;
        }
        self.set_state(SagaState::AnswerSent);

        self.finish_connecting().await;
    }

    async fn finish_connecting(self: &Arc<Self>) {
        self.set_state(SagaState::AwaitConnection);
        self.set_state(SagaState::AwaitingConnection);
        match self.peer_connection.wait_connected().await {
            Ok(channel) => {
                let _ = self.data_channel.set(channel);
                self.set_state(SagaState::Connected);
            }
            Err(err) => {
                tracing::warn!(%err, "peer connection never reached connected");
                self.close("peer connection failed").await;
            }
        }
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

    fn call_service(relay: &MockRelay, identity: IdentityKeyPair) -> Arc<CallService> {
        let session = SessionService::new(identity);
        let transport = Arc::new(relay.transport());
        Arc::new(CallService::new(
            session,
            TimeService::new(),
            RuntimeConfig::default(),
            Some(transport.clone()),
            Some(transport),
            None,
        ))
    }

    #[tokio::test]
    async fn outgoing_saga_suspends_in_awaiting_answer_until_continued() {
        let relay = MockRelay::new();
        let own_identity = IdentityKeyPair::generate();
        let peer_identity = IdentityKeyPair::generate();
        let call = call_service(&relay, own_identity.clone());

        let saga = Saga::new(
            Role::Outgoing,
            peer_identity.public_key_base64(),
            call,
            Arc::new(own_identity),
            RuntimeConfig::default(),
            factory(),
        );

        let driver = tokio::spawn(Saga::run_outgoing(Arc::clone(&saga)));
        tokio::task::yield_now().await;

        for _ in 0..20 {
            if saga.state() == SagaState::AwaitingAnswer {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(saga.state(), SagaState::AwaitingAnswer);

        let peer_ephemeral = EphemeralKeyPair::generate();
        let shared = peer_ephemeral
            .derive_shared_key(
                &saga
                    .inner
                    .lock()
                    .unwrap()
                    .ephemeral
                    .as_ref()
                    .unwrap()
                    .public_key_base64(),
            )
            .unwrap();
        let sealed = crypto::base64_encode(&shared.seal(b"v=0 answer"));

        saga.continue_(ContinueSignal::Answer {
            peer_ephemeral_public_key: peer_ephemeral.public_key_base64(),
            sealed_description: sealed,
        });

        driver.await.unwrap();
        assert_eq!(saga.state(), SagaState::Connected);
        assert!(saga.data_channel().await.is_some());
    }

    #[tokio::test]
    async fn continue_on_a_non_awaiting_saga_is_a_no_op() {
        let relay = MockRelay::new();
        let own_identity = IdentityKeyPair::generate();
        let peer_identity = IdentityKeyPair::generate();
        let call = call_service(&relay, own_identity.clone());

        let saga = Saga::new(
            Role::Incoming,
            peer_identity.public_key_base64(),
            call,
            Arc::new(own_identity),
            RuntimeConfig::default(),
            factory(),
        );

        saga.continue_(ContinueSignal::Offer {
            peer_ephemeral_public_key: "x".into(),
            sealed_description: "y".into(),
        });
        assert_eq!(saga.state(), SagaState::New);
    }

    #[tokio::test]
    async fn abort_closes_a_suspended_saga() {
        let relay = MockRelay::new();
        let own_identity = IdentityKeyPair::generate();
        let peer_identity = IdentityKeyPair::generate();
        let call = call_service(&relay, own_identity.clone());

        let saga = Saga::new(
            Role::Incoming,
            peer_identity.public_key_base64(),
            call,
            Arc::new(own_identity),
            RuntimeConfig::default(),
            factory(),
        );

        let driver = tokio::spawn(Saga::run_incoming(Arc::clone(&saga), "peer-ephemeral".into()));
        tokio::task::yield_now().await;
        saga.abort();
        driver.await.unwrap();
        assert_eq!(saga.state(), SagaState::Closed);
    }
}
