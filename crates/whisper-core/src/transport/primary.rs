//! Primary channel: a single long-lived connection to `<serverUrl>/signal/v1`
//! with auto-reconnect and backoff (§4.3), grounded on the reconnect-loop
//! idiom of a persistent gateway client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::config::RuntimeConfig;
use crate::envelope::RelayResponse;
use crate::error::{Error, Result};
use crate::transport::{OnCallHook, OnReadyHook};

struct OutboundCall {
    json: String,
    reply: oneshot::Sender<Result<RelayResponse>>,
}

type PendingQueue = Arc<Mutex<VecDeque<oneshot::Sender<Result<RelayResponse>>>>>;

/// Handle to the background-managed persistent relay connection.
pub struct PrimaryChannel {
    ready: Arc<AtomicBool>,
    notify: Arc<Notify>,
    outbound_tx: mpsc::UnboundedSender<OutboundCall>,
}

#[async_trait::async_trait]
impl crate::transport::PrimaryTransport for PrimaryChannel {
    fn is_ready(&self) -> bool {
        self.is_ready()
    }

    async fn wait_ready(&self) {
        self.wait_ready().await
    }

    async fn send(&self, envelope_json: String) -> Result<RelayResponse> {
        self.send(envelope_json).await
    }
}

impl PrimaryChannel {
    /// Spawn the reconnect loop and return a handle to it. `on_call` receives
    /// raw JSON text for every relay-pushed call envelope; `on_ready` fires
    /// on every (re)connect, including the first.
    pub fn connect(url: String, config: RuntimeConfig, on_call: OnCallHook, on_ready: OnReadyHook) -> Self {
        let ready = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_reconnect_loop(
            url,
            config,
            ready.clone(),
            notify.clone(),
            outbound_rx,
            on_call,
            on_ready,
        ));

        Self { ready, notify, outbound_tx }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Suspend until the channel becomes ready (the `readyPromise` of §4.3).
    pub async fn wait_ready(&self) {
        while !self.is_ready() {
            self.notify.notified().await;
        }
    }

    /// Send a signed envelope's wire JSON and await its relay response.
    /// Fails immediately with `TransportUnavailable` if not ready; callers
    /// that want to wait for readiness should call [`Self::wait_ready`] first.
    pub async fn send(&self, envelope_json: String) -> Result<RelayResponse> {
        if !self.is_ready() {
            return Err(Error::TransportUnavailable);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbound_tx
            .send(OutboundCall { json: envelope_json, reply: reply_tx })
            .map_err(|_| Error::TransportUnavailable)?;
        reply_rx.await.map_err(|_| Error::TransportUnavailable)?
    }
}

async fn run_reconnect_loop(
    url: String,
    config: RuntimeConfig,
    ready: Arc<AtomicBool>,
    notify: Arc<Notify>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundCall>,
    on_call: OnCallHook,
    on_ready: OnReadyHook,
) {
    let mut retries: u32 = 0;
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                tracing::info!(%url, "primary channel connected");
                retries = 0;
                ready.store(true, Ordering::Relaxed);
                notify.notify_waiters();
                (on_ready)();

                run_connection(ws_stream, &mut outbound_rx, &on_call).await;

                ready.store(false, Ordering::Relaxed);
                tracing::warn!(%url, "primary channel disconnected, reconnecting");
            }
            Err(err) => {
                tracing::warn!(%url, %err, "primary channel connect attempt failed");
            }
        }

        let delay = config.reconnect_backoff_ms(retries);
        retries = retries.saturating_add(1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

async fn run_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundCall>,
    on_call: &OnCallHook,
) {
    let (mut write, mut read) = ws_stream.split();
    let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(call) = outbound else { break };
                pending.lock().await.push_back(call.reply);
                if write.send(Message::Text(call.json.into())).await.is_err() {
                    if let Some(tx) = pending.lock().await.pop_back() {
                        let _ = tx.send(Err(Error::TransportUnavailable));
                    }
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_incoming(text.to_string(), &pending, on_call).await;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary/Close frames carry no call traffic.
                    }
                    Some(Err(err)) => {
                        tracing::debug!(%err, "primary channel read error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let mut guard = pending.lock().await;
    while let Some(tx) = guard.pop_front() {
        let _ = tx.send(Err(Error::TransportUnavailable));
    }
}

async fn handle_incoming(text: String, pending: &PendingQueue, on_call: &OnCallHook) {
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("dropping malformed relay frame");
            return;
        }
    };

    if value.get("ok").is_some() {
        match serde_json::from_value::<RelayResponse>(value) {
            Ok(response) => {
                if let Some(tx) = pending.lock().await.pop_front() {
                    let _ = tx.send(Ok(response));
                }
            }
            Err(_) => tracing::debug!("dropping malformed relay response"),
        }
    } else {
        (on_call)(text);
    }
}
