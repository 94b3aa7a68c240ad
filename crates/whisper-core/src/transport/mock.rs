//! In-process mock relay (test-only, but not `#[cfg(test)]`-gated since the
//! demo binary also uses it to avoid standing up the out-of-scope relay
//! server). Blind routing only: it never parses, signs, or validates
//! anything beyond finding the recipient field, matching the real relay's
//! no-retention/no-policy contract (§1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::envelope::RelayResponse;
use crate::error::Result;
use crate::transport::{BeaconTransport, OnCallHook, PrimaryTransport, SecondaryTransport};

#[derive(Clone)]
pub struct MockRelay {
    participants: Arc<Mutex<HashMap<String, OnCallHook>>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self { participants: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Register the hook a participant's call service uses to receive
    /// pushed envelopes, mirroring the primary channel's `onCall`.
    pub fn register(&self, public_key: String, on_call: OnCallHook) {
        self.participants.lock().unwrap().insert(public_key, on_call);
    }

    pub fn unregister(&self, public_key: &str) {
        self.participants.lock().unwrap().remove(public_key);
    }

    /// A transport handle bound to this relay, usable as the primary,
    /// secondary, and beacon transport simultaneously.
    pub fn transport(&self) -> MockRelayTransport {
        MockRelayTransport { relay: self.clone() }
    }

    fn deliver(&self, envelope_json: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(envelope_json) else {
            return;
        };
        let Some(recipient) = value.get("b").and_then(|b| b.get("c")).and_then(|c| c.as_str())
        else {
            // `update` carries no recipient — nothing to route.
            return;
        };
        if let Some(hook) = self.participants.lock().unwrap().get(recipient).cloned() {
            hook(envelope_json.to_string());
        }
    }
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// A single participant's view of a [`MockRelay`], implementing all three
/// transport roles the real deployment splits across a WebSocket and HTTP.
pub struct MockRelayTransport {
    relay: MockRelay,
}

#[async_trait::async_trait]
impl PrimaryTransport for MockRelayTransport {
    fn is_ready(&self) -> bool {
        true
    }

    async fn wait_ready(&self) {}

    async fn send(&self, envelope_json: String) -> Result<RelayResponse> {
        self.relay.deliver(&envelope_json);
        Ok(RelayResponse { ok: true, timestamp: now_ms(), reason: None, errors: None })
    }
}

#[async_trait::async_trait]
impl SecondaryTransport for MockRelayTransport {
    async fn send(&self, envelope_json: String) -> Result<RelayResponse> {
        self.relay.deliver(&envelope_json);
        Ok(RelayResponse { ok: true, timestamp: now_ms(), reason: None, errors: None })
    }
}

#[async_trait::async_trait]
impl BeaconTransport for MockRelayTransport {
    async fn send(&self, envelope_json: String) {
        self.relay.deliver(&envelope_json);
    }
}
