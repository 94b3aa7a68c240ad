//! Transport policy (§4.2/§4.3/§6): primary persistent channel, secondary
//! request/response fallback, and the close-only beacon.

pub mod beacon;
pub mod mock;
pub mod primary;
pub mod secondary;

use std::sync::Arc;

use crate::envelope::RelayResponse;
use crate::error::Result;

/// Invoked with the raw JSON text of a relay-pushed call envelope.
pub type OnCallHook = Arc<dyn Fn(String) + Send + Sync>;
/// Invoked every time the primary channel (re)establishes readiness.
pub type OnReadyHook = Arc<dyn Fn() + Send + Sync>;
/// Invoked when the call service has to fall back off the primary
/// transport, the signal that a caller may want to warn its user the
/// connection is degraded (§6 `onMayWorkUnstably`).
pub type OnMayWorkUnstably = Arc<dyn Fn(&str) + Send + Sync>;

/// The persistent bidirectional channel (§4.3). A trait so tests can swap in
/// [`mock::MockPrimaryTransport`] for [`primary::PrimaryChannel`].
#[async_trait::async_trait]
pub trait PrimaryTransport: Send + Sync {
    fn is_ready(&self) -> bool;
    async fn wait_ready(&self);
    async fn send(&self, envelope_json: String) -> Result<RelayResponse>;
}

/// The request/response transport the call service falls back to when the
/// primary channel is not ready (§4.2 step 2).
#[async_trait::async_trait]
pub trait SecondaryTransport: Send + Sync {
    async fn send(&self, envelope_json: String) -> Result<RelayResponse>;
}

/// The fire-and-forget transport used exclusively for `close` (§4.2/§6).
#[async_trait::async_trait]
pub trait BeaconTransport: Send + Sync {
    async fn send(&self, envelope_json: String);
}
