//! End-to-end scenarios over an in-process relay (§8 concrete scenarios
//! A–D). Scenarios E (watchdog) and F (update merge) and property 8
//! (store dump/restore) are exercised at the unit level closer to the code
//! they cover (`reliability::watchdog`, `reliability::update`,
//! `whisper-store::store`) since they don't need two wired-up identities.

use std::sync::Arc;
use std::time::Duration;

use whisper_core::call::CallService;
use whisper_core::config::RuntimeConfig;
use whisper_core::connection::channel::{LoopbackChannel, LoopbackPeerConnection, PeerConnectionFactory};
use whisper_core::connection::ConnectionState;
use whisper_core::crypto::IdentityKeyPair;
use whisper_core::envelope::{self, DialOrClosePayload, Payload};
use whisper_core::handlers::CallHandlers;
use whisper_core::registry::ConnectionRegistry;
use whisper_core::session::SessionService;
use whisper_core::time::TimeService;
use whisper_core::transport::mock::MockRelay;

struct Participant {
    public_key: String,
    identity: IdentityKeyPair,
    registry: Arc<ConnectionRegistry>,
    call: Arc<CallService>,
    time: TimeService,
}

fn spin_up(relay: &MockRelay, peer_connection_factory: PeerConnectionFactory) -> Participant {
    let identity = IdentityKeyPair::generate();
    let session = SessionService::new(identity.clone());
    let public_key = session.public_key().to_string();
    let time = TimeService::new();
    let config = RuntimeConfig::default();

    let transport = Arc::new(relay.transport());
    let call = Arc::new(CallService::new(
        session,
        time.clone(),
        config.clone(),
        Some(transport.clone()),
        Some(transport.clone()),
        Some(transport),
    ));

    let registry = ConnectionRegistry::new(Arc::clone(&call), Arc::new(identity.clone()), config.clone(), peer_connection_factory, None);
    let handlers = CallHandlers::new(public_key.clone(), Arc::clone(&registry), Arc::clone(&call), config, None, None);

    let handlers_for_hook = Arc::clone(&handlers);
    relay.register(public_key.clone(), Arc::new(move |raw| handlers_for_hook.handle_raw(raw)));

    Participant { public_key, identity, registry, call, time }
}

fn loopback_factories() -> (PeerConnectionFactory, PeerConnectionFactory) {
    let (a, b) = LoopbackChannel::pair();
    let factory_a: PeerConnectionFactory = Arc::new(move || LoopbackPeerConnection::new(Arc::clone(&a)));
    let factory_b: PeerConnectionFactory = Arc::new(move || LoopbackPeerConnection::new(Arc::clone(&b)));
    (factory_a, factory_b)
}

async fn wait_for_state(connection: &whisper_core::connection::Connection, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if connection.state().await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("connection never reached {state:?}"));
}

/// A. Outgoing connection happy path: `get(peer).open()` on one side drives
/// dial → offer → answer (→ ice) on the wire and both sides land on `Open`
/// with a bound data channel.
#[tokio::test]
async fn scenario_a_outgoing_connection_happy_path() {
    let relay = MockRelay::new();
    let (factory_a, factory_b) = loopback_factories();
    let alice = spin_up(&relay, factory_a);
    let bob = spin_up(&relay, factory_b);

    let alice_connection = alice.registry.get_or_dial(&bob.public_key).await;
    wait_for_state(&alice_connection, ConnectionState::Open).await;

    let bob_connection = bob.registry.get(&alice.public_key).await.expect("bob saw the dial");
    wait_for_state(&bob_connection, ConnectionState::Open).await;

    assert!(alice_connection.data_channel().await.is_some());
    assert!(bob_connection.data_channel().await.is_some());

    alice_connection.send("hello from alice").await.unwrap();
}

/// B. Replay rejection: a `dial` replayed once its timestamp has fallen
/// outside the freshness window is dropped outright, so the recipient never
/// creates a connection for it.
#[tokio::test]
async fn scenario_b_replay_is_rejected_as_stale() {
    let relay = MockRelay::new();
    let (factory_a, factory_b) = loopback_factories();
    let alice = spin_up(&relay, factory_a);
    let bob = spin_up(&relay, factory_b);

    let stale_dial = envelope::sign(
        Payload::Dial(DialOrClosePayload {
            sender: alice.public_key.clone(),
            timestamp: bob.time.server_time(),
            recipient: bob.public_key.clone(),
            ephemeral_public_key: Some("ephpub".into()),
        }),
        &alice.identity,
    )
    .unwrap();
    let raw = envelope::to_wire_json(&stale_dial).unwrap();

    // Replay it 10s later per bob's clock: the freshness window (5s default)
    // has elapsed, so bob's handler must drop it.
    bob.time.record_server_timestamp(bob.time.server_time() + 10_000);

    let bob_handlers = CallHandlers::new(bob.public_key.clone(), Arc::clone(&bob.registry), Arc::clone(&bob.call), RuntimeConfig::default(), None, None);
    bob_handlers.handle_raw(raw);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(bob.registry.get(&alice.public_key).await.is_none());
}

/// C. Wrong recipient: a `dial` addressed to some third party that the
/// relay happens to misroute to bob is dropped; bob creates no connection.
#[tokio::test]
async fn scenario_c_wrong_recipient_is_rejected() {
    let relay = MockRelay::new();
    let (factory_a, factory_b) = loopback_factories();
    let alice = spin_up(&relay, factory_a);
    let bob = spin_up(&relay, factory_b);
    let carol_identity = IdentityKeyPair::generate();

    let misdirected_dial = envelope::sign(
        Payload::Dial(DialOrClosePayload {
            sender: alice.public_key.clone(),
            timestamp: bob.time.server_time(),
            recipient: carol_identity.public_key_base64(),
            ephemeral_public_key: Some("ephpub".into()),
        }),
        &alice.identity,
    )
    .unwrap();
    let raw = envelope::to_wire_json(&misdirected_dial).unwrap();

    let bob_handlers = CallHandlers::new(bob.public_key.clone(), Arc::clone(&bob.registry), Arc::clone(&bob.call), RuntimeConfig::default(), None, None);
    bob_handlers.handle_raw(raw);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(bob.registry.get(&alice.public_key).await.is_none());
}

/// D. Close on reload: once a connection is `Open`, a `close` beacon that
/// postdates `openedAt` tears the recipient's connection down without it
/// sending a `close` of its own back.
#[tokio::test]
async fn scenario_d_close_on_reload_tears_down_the_peer_side() {
    let relay = MockRelay::new();
    let (factory_a, factory_b) = loopback_factories();
    let alice = spin_up(&relay, factory_a);
    let bob = spin_up(&relay, factory_b);

    let alice_connection = alice.registry.get_or_dial(&bob.public_key).await;
    wait_for_state(&alice_connection, ConnectionState::Open).await;
    let bob_connection = bob.registry.get(&alice.public_key).await.unwrap();
    wait_for_state(&bob_connection, ConnectionState::Open).await;

    // Ensure the beacon's timestamp strictly postdates `openedAt`.
    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.call.close(&bob.public_key).await.unwrap();

    wait_for_state(&bob_connection, ConnectionState::Closed).await;
}
