//! Error taxonomy for the signaling and session core.

use thiserror::Error;

/// Errors surfaced by the call service, envelope codec, and sagas.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ────────────────────────────────────────────────────────────
    #[error("no transport could deliver the call")]
    TransportUnavailable,

    #[error("relay rejected the call: {reason}")]
    RelayRejected { reason: String },

    #[error("relay response was not well formed")]
    InvalidResponse,

    // ── Envelope ─────────────────────────────────────────────────────────────
    #[error("envelope failed {field} validation")]
    InvalidEnvelope { field: EnvelopeField },

    #[error("AEAD frame failed to decrypt or authenticate")]
    DecryptFailed,

    // ── Saga ─────────────────────────────────────────────────────────────────
    #[error("saga attempt deadline elapsed")]
    SagaDeadline,

    #[error("saga was aborted")]
    SagaAborted,

    // ── Store ────────────────────────────────────────────────────────────────
    #[error("store operation attempted without a valid password")]
    StoreLocked,

    #[error("store record is corrupt")]
    StoreCorrupt,

    // ── General ──────────────────────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which check in [`crate::envelope::verify`] rejected the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeField {
    Timestamp,
    Recipient,
    Signature,
}

impl std::fmt::Display for EnvelopeField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvelopeField::Timestamp => "timestamp",
            EnvelopeField::Recipient => "recipient",
            EnvelopeField::Signature => "signature",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
