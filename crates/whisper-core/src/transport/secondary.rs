//! Secondary request/response transport: `POST <serverUrl>/api/v1/call`,
//! grounded on the REST client's `request<T>` helper idiom.

use crate::envelope::RelayResponse;
use crate::error::{Error, Result};
use crate::transport::SecondaryTransport;

pub struct HttpSecondaryTransport {
    client: reqwest::Client,
    call_url: String,
}

impl HttpSecondaryTransport {
    pub fn new(server_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            call_url: format!("{}/api/v1/call", server_url.trim_end_matches('/')),
        }
    }
}

#[async_trait::async_trait]
impl SecondaryTransport for HttpSecondaryTransport {
    async fn send(&self, envelope_json: String) -> Result<RelayResponse> {
        let response = self
            .client
            .post(&self.call_url)
            .header("content-type", "application/json")
            .body(envelope_json)
            .send()
            .await
            .map_err(|_| Error::TransportUnavailable)?;

        if !response.status().is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(Error::RelayRejected { reason });
        }

        response
            .json::<RelayResponse>()
            .await
            .map_err(|_| Error::InvalidResponse)
    }
}
