//! Fire-and-forget beacon transport, used exclusively for `close` so
//! teardown survives page/process unload even when no reply is possible.

use crate::transport::BeaconTransport;

pub struct HttpBeaconTransport {
    client: reqwest::Client,
    call_url: String,
}

impl HttpBeaconTransport {
    pub fn new(server_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            call_url: format!("{}/api/v1/call", server_url.trim_end_matches('/')),
        }
    }
}

#[async_trait::async_trait]
impl BeaconTransport for HttpBeaconTransport {
    async fn send(&self, envelope_json: String) {
        let request = self
            .client
            .post(&self.call_url)
            .header("content-type", "application/json")
            .body(envelope_json)
            .send();

        // Best-effort: no response is awaited beyond dispatch, and any
        // failure is unobservable by design (the caller may already be
        // tearing down).
        if let Err(err) = request.await {
            tracing::debug!(%err, "beacon close call could not be dispatched");
        }
    }
}
