//! Call service (§4.2): builds signed calls, routes them via the
//! primary/secondary/beacon transport policy, and updates the clock from
//! relay responses.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::envelope::{self, DialOrClosePayload, IcePayload, IceSource, OfferOrAnswerPayload, Payload, PushSubscription, RelayResponse, UpdatePayload};
use crate::error::{Error, Result};
use crate::session::SessionService;
use crate::time::TimeService;
use crate::transport::{BeaconTransport, OnMayWorkUnstably, PrimaryTransport, SecondaryTransport};

pub struct CallService {
    session: SessionService,
    time: TimeService,
    config: RuntimeConfig,
    primary: Option<Arc<dyn PrimaryTransport>>,
    secondary: Option<Arc<dyn SecondaryTransport>>,
    beacon: Option<Arc<dyn BeaconTransport>>,
    on_may_work_unstably: Option<OnMayWorkUnstably>,
}

impl CallService {
    pub fn new(
        session: SessionService,
        time: TimeService,
        config: RuntimeConfig,
        primary: Option<Arc<dyn PrimaryTransport>>,
        secondary: Option<Arc<dyn SecondaryTransport>>,
        beacon: Option<Arc<dyn BeaconTransport>>,
    ) -> Self {
        Self { session, time, config, primary, secondary, beacon, on_may_work_unstably: None }
    }

    /// Register the hook fired every time a call has to fall back off the
    /// primary transport (§6 `onMayWorkUnstably`).
    pub fn set_on_may_work_unstably(&mut self, hook: OnMayWorkUnstably) {
        self.on_may_work_unstably = Some(hook);
    }

    pub fn session(&self) -> &SessionService {
        &self.session
    }

    pub fn time(&self) -> &TimeService {
        &self.time
    }

    /// Sign and send any non-`close` payload via the transport fallback
    /// policy (§4.2 steps 1–4).
    pub async fn send(&self, payload: Payload) -> Result<RelayResponse> {
        let envelope = envelope::sign(payload, self.session.identity())?;
        let json = envelope::to_wire_json(&envelope)?;
        self.dispatch(json).await
    }

    pub async fn update(&self, push_subscription: Option<PushSubscription>) -> Result<RelayResponse> {
        self.send(Payload::Update(UpdatePayload {
            sender: self.session.public_key().to_string(),
            push_subscription,
        }))
        .await
    }

    pub async fn dial(&self, recipient: &str, ephemeral_public_key: &str) -> Result<RelayResponse> {
        self.send(Payload::Dial(DialOrClosePayload {
            sender: self.session.public_key().to_string(),
            timestamp: self.time.server_time(),
            recipient: recipient.to_string(),
            ephemeral_public_key: Some(ephemeral_public_key.to_string()),
        }))
        .await
    }

    pub async fn offer(
        &self,
        recipient: &str,
        ephemeral_public_key: &str,
        sealed_description: &str,
    ) -> Result<RelayResponse> {
        self.send(Payload::Offer(self.offer_answer_payload(
            recipient,
            ephemeral_public_key,
            sealed_description,
        )))
        .await
    }

    pub async fn answer(
        &self,
        recipient: &str,
        ephemeral_public_key: &str,
        sealed_description: &str,
    ) -> Result<RelayResponse> {
        self.send(Payload::Answer(self.offer_answer_payload(
            recipient,
            ephemeral_public_key,
            sealed_description,
        )))
        .await
    }

    pub async fn ice(
        &self,
        recipient: &str,
        ephemeral_public_key: &str,
        sealed_candidate: &str,
        source: IceSource,
    ) -> Result<RelayResponse> {
        self.send(Payload::Ice(IcePayload {
            base: self.offer_answer_payload(recipient, ephemeral_public_key, sealed_candidate),
            source,
        }))
        .await
    }

    /// `close` is fire-and-forget via the beacon only (§4.2).
    pub async fn close(&self, recipient: &str) -> Result<()> {
        let payload = Payload::Close(DialOrClosePayload {
            sender: self.session.public_key().to_string(),
            timestamp: self.time.server_time(),
            recipient: recipient.to_string(),
            ephemeral_public_key: None,
        });
        let envelope = envelope::sign(payload, self.session.identity())?;
        let json = envelope::to_wire_json(&envelope)?;
        if let Some(beacon) = &self.beacon {
            beacon.send(json).await;
        }
        Ok(())
    }

    fn offer_answer_payload(
        &self,
        recipient: &str,
        ephemeral_public_key: &str,
        sealed_description: &str,
    ) -> OfferOrAnswerPayload {
        OfferOrAnswerPayload {
            sender: self.session.public_key().to_string(),
            timestamp: self.time.server_time(),
            recipient: recipient.to_string(),
            ephemeral_public_key: ephemeral_public_key.to_string(),
            sealed_description: sealed_description.to_string(),
        }
    }

    async fn dispatch(&self, json: String) -> Result<RelayResponse> {
        if let Some(primary) = &self.primary {
            if primary.is_ready() {
                match primary.send(json.clone()).await {
                    Ok(response) => return self.finalize(response),
                    Err(err) => {
                        tracing::warn!(%err, "primary transport failed, falling back to secondary");
                        if let Some(hook) = &self.on_may_work_unstably {
                            hook("primary transport failed, falling back to secondary");
                        }
                    }
                }
            }
        }

        if let Some(secondary) = &self.secondary {
            match secondary.send(json).await {
                Ok(response) => return self.finalize(response),
                Err(err) => {
                    tracing::warn!(%err, "secondary transport failed");
                }
            }
        }

        Err(Error::TransportUnavailable)
    }

    fn finalize(&self, response: RelayResponse) -> Result<RelayResponse> {
        self.time.record_server_timestamp(response.timestamp);
        if !response.ok {
            return Err(Error::RelayRejected { reason: response.reason.clone().unwrap_or_default() });
        }
        Ok(response)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use crate::transport::mock::MockRelay;

    fn call_service(relay: &MockRelay, session: SessionService) -> CallService {
        let transport = Arc::new(relay.transport());
        CallService::new(
            session,
            TimeService::new(),
            RuntimeConfig::default(),
            Some(transport.clone()),
            Some(transport),
            None,
        )
    }

    #[tokio::test]
    async fn dial_updates_server_time_from_response() {
        let relay = MockRelay::new();
        let session = SessionService::new(IdentityKeyPair::generate());
        let call = call_service(&relay, session);
        let before = call.time().server_time();
        call.dial("someone", "ephpub").await.unwrap();
        assert!(call.time().server_time() >= before);
    }

    #[tokio::test]
    async fn falls_back_to_secondary_when_primary_not_ready() {
        struct NeverReady;
        #[async_trait::async_trait]
        impl PrimaryTransport for NeverReady {
            fn is_ready(&self) -> bool {
                false
            }
            async fn wait_ready(&self) {}
            async fn send(&self, _: String) -> Result<RelayResponse> {
                unreachable!("should never be called while not ready")
            }
        }

        let relay = MockRelay::new();
        let session = SessionService::new(IdentityKeyPair::generate());
        let secondary = Arc::new(relay.transport());
        let call = CallService::new(
            session,
            TimeService::new(),
            RuntimeConfig::default(),
            Some(Arc::new(NeverReady)),
            Some(secondary),
            None,
        );

        let response = call.dial("someone", "ephpub").await.unwrap();
        assert!(response.ok);
    }
}
