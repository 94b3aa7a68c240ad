//! Top-level glue (§6): wires the transports, call service, connection
//! registry, and call handlers into the single handle an embedding
//! application holds.

use std::sync::Arc;

use crate::call::CallService;
use crate::config::RuntimeConfig;
use crate::connection::channel::PeerConnectionFactory;
use crate::connection::Connection;
use crate::crypto::IdentityKeyPair;
use crate::envelope::PushSubscription;
use crate::error::Result;
use crate::handlers::{CallHandlers, FocusOnDial, RequestDial};
use crate::registry::{ConnectionRegistry, OnIncomingConnection};
use crate::session::SessionService;
use crate::time::TimeService;
use crate::transport::beacon::HttpBeaconTransport;
use crate::transport::primary::PrimaryChannel;
use crate::transport::secondary::HttpSecondaryTransport;
use crate::transport::{BeaconTransport, OnCallHook, OnMayWorkUnstably, OnReadyHook, PrimaryTransport, SecondaryTransport};

/// Asks the embedding UI to surface a notification (§1: UI rendering is
/// out of scope here, so this is a pass-through hook, not a renderer).
pub type ShowNotification = Arc<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

/// Everything [`initialize`] needs that isn't derivable from the relay
/// itself (§6's `initialize(config)` parameter table).
pub struct WhisperConfig {
    pub server_url: String,
    pub identity: IdentityKeyPair,
    pub runtime: RuntimeConfig,
    pub peer_connection_factory: PeerConnectionFactory,
    pub on_incoming_connection: Option<OnIncomingConnection>,
    pub focus_on_dial: Option<FocusOnDial>,
    pub request_dial: Option<RequestDial>,
    pub on_may_work_unstably: Option<OnMayWorkUnstably>,
    pub show_notification: Option<ShowNotification>,
}

/// The process-wide handle §6 calls `WhisperHandle`: one per identity, one
/// primary channel, one registry owning every [`Connection`].
pub struct WhisperHandle {
    session: SessionService,
    time: TimeService,
    call: Arc<CallService>,
    registry: Arc<ConnectionRegistry>,
    handlers: Arc<CallHandlers>,
    show_notification: Option<ShowNotification>,
}

impl WhisperHandle {
    pub fn public_key(&self) -> &str {
        self.session.public_key()
    }

    pub fn server_time(&self) -> i64 {
        self.time.server_time()
    }

    /// The connection to `peer_public_key`, dialing it if this is the
    /// first time it's been asked for (§6 `get(peerKey)`).
    pub async fn get(&self, peer_public_key: &str) -> Arc<Connection> {
        self.registry.get_or_dial(peer_public_key).await
    }

    pub async fn delete(&self, peer_public_key: &str) {
        self.registry.delete(peer_public_key).await
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.list().await
    }

    /// Re-publish this identity's push subscription to the relay (§4.2
    /// `update`, §6 re-publish-on-reconnect behavior).
    pub async fn publish_push_subscription(&self, push_subscription: Option<PushSubscription>) -> Result<()> {
        self.call.update(push_subscription).await?;
        Ok(())
    }

    /// Ask the embedding application to show a notification (§6). Returns
    /// `false` if no hook was registered or the hook declined.
    pub fn show_notification(&self, title: &str, body: Option<&str>) -> bool {
        match &self.show_notification {
            Some(hook) => hook(title, body),
            None => false,
        }
    }
}

/// Build and start a [`WhisperHandle`]: connect the primary channel,
/// construct the call service and connection registry, and wire the
/// relay's pushed calls to [`CallHandlers`] (§6).
pub fn initialize(config: WhisperConfig) -> Arc<WhisperHandle> {
    let identity = Arc::new(config.identity);
    let session = SessionService::new((*identity).clone());
    let time = TimeService::new();
    let own_public_key = session.public_key().to_string();

    // `PrimaryChannel::connect` needs hooks that in turn need the
    // `CallService`/`CallHandlers` this function hasn't built yet. Both
    // sides of the cycle are broken with a `OnceLock` the hooks read
    // through; by the time any call actually arrives, both are set.
    let call_cell: Arc<std::sync::OnceLock<Arc<CallService>>> = Arc::new(std::sync::OnceLock::new());
    let handlers_cell: Arc<std::sync::OnceLock<Arc<CallHandlers>>> = Arc::new(std::sync::OnceLock::new());

    let on_call: OnCallHook = {
        let handlers_cell = Arc::clone(&handlers_cell);
        Arc::new(move |raw: String| {
            if let Some(handlers) = handlers_cell.get() {
                handlers.handle_raw(raw);
            } else {
                tracing::debug!("dropping call received before handlers were wired up");
            }
        })
    };
    let on_ready: OnReadyHook = {
        let call_cell = Arc::clone(&call_cell);
        Arc::new(move || {
            let Some(call) = call_cell.get() else { return };
            let call = Arc::clone(call);
            tokio::spawn(async move {
                if let Err(err) = call.update(None).await {
                    tracing::warn!(%err, "failed to re-publish update on (re)connect");
                }
            });
        })
    };

    let signal_url = format!("{}/signal/v1", config.server_url.trim_end_matches('/'));
    let primary = Arc::new(PrimaryChannel::connect(signal_url, config.runtime.clone(), on_call, on_ready));
    let secondary = Arc::new(HttpSecondaryTransport::new(&config.server_url));
    let beacon = Arc::new(HttpBeaconTransport::new(&config.server_url));

    let mut call_service = CallService::new(
        session.clone(),
        time.clone(),
        config.runtime.clone(),
        Some(primary as Arc<dyn PrimaryTransport>),
        Some(secondary as Arc<dyn SecondaryTransport>),
        Some(beacon as Arc<dyn BeaconTransport>),
    );
    if let Some(hook) = config.on_may_work_unstably {
        call_service.set_on_may_work_unstably(hook);
    }
    let call = Arc::new(call_service);
    let _ = call_cell.set(Arc::clone(&call));

    let registry = ConnectionRegistry::new(
        Arc::clone(&call),
        Arc::clone(&identity),
        config.runtime.clone(),
        Arc::clone(&config.peer_connection_factory),
        config.on_incoming_connection,
    );

    let handlers = CallHandlers::new(
        own_public_key,
        Arc::clone(&registry),
        Arc::clone(&call),
        config.runtime.clone(),
        config.focus_on_dial,
        config.request_dial,
    );
    let _ = handlers_cell.set(Arc::clone(&handlers));

    Arc::new(WhisperHandle {
        session,
        time,
        call,
        registry,
        handlers,
        show_notification: config.show_notification,
    })
}
