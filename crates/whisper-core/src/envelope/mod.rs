//! Envelope codec & signer (§4.1): sign, verify, parse call envelopes.

pub mod payload;

pub use payload::{
    DialOrClosePayload, IcePayload, IceSource, Method, OfferOrAnswerPayload, Payload,
    PushKeys, PushSubscription, RelayResponse, UpdatePayload,
};

use serde::{Deserialize, Serialize};

use crate::crypto::{self, IdentityKeyPair};
use crate::error::{Error, EnvelopeField, Result};

/// A signed call envelope, once parsed off the wire or built locally.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub method: Method,
    pub payload: Payload,
    /// base64-encoded detached Ed25519 signature of the payload bytes.
    pub signature: String,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    a: Method,
    b: serde_json::Value,
    c: String,
}

/// Sign a payload, producing the envelope ready to hand to a transport.
pub fn sign(payload: Payload, identity: &IdentityKeyPair) -> Result<Envelope> {
    let bytes = payload.to_signing_bytes()?;
    let signature = crypto::base64_encode(&identity.sign(&bytes).to_bytes());
    Ok(Envelope {
        method: payload.method(),
        payload,
        signature,
    })
}

/// Serialize an envelope to the compact wire JSON form (§6).
pub fn to_wire_json(envelope: &Envelope) -> Result<String> {
    let wire = WireEnvelope {
        a: envelope.method,
        b: envelope.payload.to_value()?,
        c: envelope.signature.clone(),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Parse raw relay traffic into an envelope. Does not validate it — callers
/// must still run [`verify`] before trusting anything in the payload.
pub fn parse(raw: &str) -> Result<Envelope> {
    let wire: WireEnvelope = serde_json::from_str(raw)?;
    let payload = Payload::from_value(wire.a, wire.b)?;
    Ok(Envelope {
        method: wire.a,
        payload,
        signature: wire.c,
    })
}

/// Run the three validation checks in order, returning which one failed.
///
/// `update` envelopes carry no recipient/timestamp and skip checks 1–2
/// (§4.1). Exposed separately from [`verify`] so tests can assert on
/// invariant 2/3 of §8 precisely; handlers should call [`verify`].
pub fn verify_detailed(
    envelope: &Envelope,
    own_public_key: &str,
    server_time_ms: i64,
    freshness_window_ms: i64,
) -> Result<()> {
    if envelope.method.is_peer_directed() {
        let timestamp = envelope
            .payload
            .timestamp()
            .ok_or(Error::InvalidEnvelope { field: EnvelopeField::Timestamp })?;
        if (timestamp - server_time_ms).abs() > freshness_window_ms {
            return Err(Error::InvalidEnvelope { field: EnvelopeField::Timestamp });
        }

        let recipient = envelope
            .payload
            .recipient()
            .ok_or(Error::InvalidEnvelope { field: EnvelopeField::Recipient })?;
        if recipient != own_public_key {
            return Err(Error::InvalidEnvelope { field: EnvelopeField::Recipient });
        }
    }

    let bytes = envelope.payload.to_signing_bytes()?;
    let ok = crypto::verify_detached(envelope.payload.sender(), &bytes, &envelope.signature)?;
    if !ok {
        return Err(Error::InvalidEnvelope { field: EnvelopeField::Signature });
    }
    Ok(())
}

/// Validate an inbound envelope. Never propagates an error: the relay is
/// untrusted, so any failure is logged at debug and the caller treats the
/// envelope as if it never arrived (§4.1).
pub fn verify(
    envelope: &Envelope,
    own_public_key: &str,
    server_time_ms: i64,
    freshness_window_ms: i64,
) -> bool {
    match verify_detailed(envelope, own_public_key, server_time_ms, freshness_window_ms) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(method = ?envelope.method, %err, "dropping envelope that failed validation");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    fn dial_envelope(sender: &IdentityKeyPair, recipient: &str, timestamp: i64) -> Envelope {
        let payload = Payload::Dial(DialOrClosePayload {
            sender: sender.public_key_base64(),
            timestamp,
            recipient: recipient.to_string(),
            ephemeral_public_key: Some("ephpub".into()),
        });
        sign(payload, sender).unwrap()
    }

    #[test]
    fn signed_envelope_verifies() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let env = dial_envelope(&a, &b.public_key_base64(), 1_000);
        assert!(verify(&env, &b.public_key_base64(), 1_000, 5_000));
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let mut env = dial_envelope(&a, &b.public_key_base64(), 1_000);
        if let Payload::Dial(p) = &mut env.payload {
            p.timestamp = 999_999;
        }
        let err = verify_detailed(&env, &b.public_key_base64(), 1_000, 5_000).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidEnvelope { field: EnvelopeField::Timestamp }
        ));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let env = dial_envelope(&a, &b.public_key_base64(), 0);
        assert!(!verify(&env, &b.public_key_base64(), 11_000, 5_000));
    }

    #[test]
    fn wrong_recipient_rejected() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let c = IdentityKeyPair::generate();
        let env = dial_envelope(&a, &c.public_key_base64(), 1_000);
        assert!(!verify(&env, &b.public_key_base64(), 1_000, 5_000));
    }

    #[test]
    fn update_envelope_skips_timestamp_and_recipient_checks() {
        let a = IdentityKeyPair::generate();
        let payload = Payload::Update(UpdatePayload {
            sender: a.public_key_base64(),
            push_subscription: None,
        });
        let env = sign(payload, &a).unwrap();
        // Any server_time/own_public_key combination is fine for `update`.
        assert!(verify(&env, "irrelevant-recipient", 999_999_999, 5_000));
    }

    #[test]
    fn wire_roundtrip_preserves_signature_validity() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let env = dial_envelope(&a, &b.public_key_base64(), 1_000);
        let json = to_wire_json(&env).unwrap();
        let reparsed = parse(&json).unwrap();
        assert!(verify(&reparsed, &b.public_key_base64(), 1_000, 5_000));
    }
}
