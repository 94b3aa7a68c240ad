//! Drives a full dial → offer → answer → data-channel handshake between two
//! local identities over an in-process relay (§8 scenario A), without
//! standing up the out-of-scope relay server or a real peer connection.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use whisper_core::call::CallService;
use whisper_core::config::RuntimeConfig;
use whisper_core::connection::channel::{LoopbackChannel, LoopbackPeerConnection, PeerConnectionFactory};
use whisper_core::connection::{Connection, ConnectionState};
use whisper_core::crypto::IdentityKeyPair;
use whisper_core::handlers::CallHandlers;
use whisper_core::registry::ConnectionRegistry;
use whisper_core::reliability::{NullSink, UpdateLog};
use whisper_core::session::SessionService;
use whisper_core::time::TimeService;
use whisper_core::transport::mock::MockRelay;

#[derive(Parser)]
struct Args {
    /// How long to wait for the handshake before giving up.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "whisper_demo=info,whisper_core=debug".into()),
        )
        .init();

    let args = Args::parse();
    let relay = MockRelay::new();
    let (alice_channel, bob_channel) = LoopbackChannel::pair();

    let alice = Participant::spin_up("alice", &relay, {
        let channel = Arc::clone(&alice_channel);
        Arc::new(move || LoopbackPeerConnection::new(Arc::clone(&channel)))
    });
    let bob = Participant::spin_up("bob", &relay, {
        let channel = Arc::clone(&bob_channel);
        Arc::new(move || LoopbackPeerConnection::new(Arc::clone(&channel)))
    });

    tracing::info!(alice = %alice.public_key, bob = %bob.public_key, "identities registered with the relay");

    let connection = alice.registry.get_or_dial(&bob.public_key).await;
    let timeout = Duration::from_secs(args.timeout_secs);
    tokio::time::timeout(timeout, wait_until_open(&connection))
        .await
        .map_err(|_| anyhow::anyhow!("handshake did not reach Open within {timeout:?}"))?;

    tracing::info!("connection open, sending a message over the negotiated data channel");
    let channel = connection.data_channel().await.expect("data channel bound once Open");
    let log = UpdateLog::new(bob.public_key.clone(), Arc::new(NullSink), alice.time.clone());
    log.send_text(&*channel, "hello from alice").await?;

    // Let the loopback pump and bob's handler finish before the process exits.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn wait_until_open(connection: &Arc<Connection>) {
    loop {
        if connection.state().await == ConnectionState::Open {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// One local identity, wired to the shared [`MockRelay`] the way a real
/// process would wire itself to a primary/secondary/beacon transport.
struct Participant {
    public_key: String,
    registry: Arc<ConnectionRegistry>,
    time: TimeService,
}

impl Participant {
    fn spin_up(label: &str, relay: &MockRelay, peer_connection_factory: PeerConnectionFactory) -> Self {
        let identity = Arc::new(IdentityKeyPair::generate());
        let session = SessionService::new((*identity).clone());
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

        let registry = ConnectionRegistry::new(
            Arc::clone(&call),
            Arc::clone(&identity),
            config.clone(),
            peer_connection_factory,
            None,
        );
        let handlers = CallHandlers::new(public_key.clone(), Arc::clone(&registry), call, config, None, None);

        let handlers_for_hook = Arc::clone(&handlers);
        relay.register(public_key.clone(), Arc::new(move |raw| handlers_for_hook.handle_raw(raw)));

        tracing::debug!(%label, %public_key, "participant registered");
        Self { public_key, registry, time }
    }
}
