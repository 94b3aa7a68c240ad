//! Wire shapes for call envelopes (§6). Field labels are the opaque
//! single-letter names the relay already expects; do not rename them.

use serde::{Deserialize, Serialize};

/// The envelope method, carried as field `a` of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Update,
    Dial,
    Offer,
    Answer,
    Ice,
    Close,
}

impl Method {
    /// `update` is the only method whose payload is not peer-directed
    /// (§3, §4.1: no recipient/timestamp, checks 1–2 are skipped).
    pub fn is_peer_directed(self) -> bool {
        !matches!(self, Method::Update)
    }
}

/// `update.b`: `{ a: sender, b?: push subscription }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(rename = "a")]
    pub sender: String,
    #[serde(rename = "b", skip_serializing_if = "Option::is_none", default)]
    pub push_subscription: Option<PushSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    #[serde(rename = "a")]
    pub endpoint: String,
    #[serde(rename = "b")]
    pub expiration_time: Option<i64>,
    #[serde(rename = "c")]
    pub keys: PushKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushKeys {
    #[serde(rename = "a")]
    pub p256dh: String,
    #[serde(rename = "b")]
    pub auth: String,
}

/// `dial.b` / `close.b`: `{ a: sender, b: timestamp, c: recipient [, d: ephemeralPub] }`.
/// `d` is present for `dial`, absent for `close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialOrClosePayload {
    #[serde(rename = "a")]
    pub sender: String,
    #[serde(rename = "b")]
    pub timestamp: i64,
    #[serde(rename = "c")]
    pub recipient: String,
    #[serde(rename = "d", skip_serializing_if = "Option::is_none", default)]
    pub ephemeral_public_key: Option<String>,
}

/// `offer.b` / `answer.b`: `{ a, b, c, d: ephemeralPub, e: base64-aead(sdp) }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferOrAnswerPayload {
    #[serde(rename = "a")]
    pub sender: String,
    #[serde(rename = "b")]
    pub timestamp: i64,
    #[serde(rename = "c")]
    pub recipient: String,
    #[serde(rename = "d")]
    pub ephemeral_public_key: String,
    /// base64 of `nonce‖ciphertext` sealing the UTF-8 session description.
    #[serde(rename = "e")]
    pub sealed_description: String,
}

/// `ice.b`: offer/answer shape plus `f: IceSource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcePayload {
    #[serde(flatten)]
    pub base: OfferOrAnswerPayload,
    #[serde(rename = "f")]
    pub source: IceSource,
}

/// Which of the *recipient's* two sagas an ICE candidate belongs to (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IceSource {
    Unknown,
    Incoming,
    Outgoing,
}

impl From<IceSource> for u8 {
    fn from(value: IceSource) -> Self {
        match value {
            IceSource::Unknown => 0,
            IceSource::Incoming => 1,
            IceSource::Outgoing => 2,
        }
    }
}

impl TryFrom<u8> for IceSource {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IceSource::Unknown),
            1 => Ok(IceSource::Incoming),
            2 => Ok(IceSource::Outgoing),
            other => Err(format!("unknown ice source tag {other}")),
        }
    }
}

/// The relay's response to a primary/secondary transport call (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub ok: bool,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errors: Option<Vec<String>>,
}

/// The typed payload carried by an envelope, keyed by `method`.
#[derive(Debug, Clone)]
pub enum Payload {
    Update(UpdatePayload),
    Dial(DialOrClosePayload),
    Offer(OfferOrAnswerPayload),
    Answer(OfferOrAnswerPayload),
    Ice(IcePayload),
    Close(DialOrClosePayload),
}

impl Payload {
    pub fn method(&self) -> Method {
        match self {
            Payload::Update(_) => Method::Update,
            Payload::Dial(_) => Method::Dial,
            Payload::Offer(_) => Method::Offer,
            Payload::Answer(_) => Method::Answer,
            Payload::Ice(_) => Method::Ice,
            Payload::Close(_) => Method::Close,
        }
    }

    /// The sender's signing public key, present in every payload variant.
    pub fn sender(&self) -> &str {
        match self {
            Payload::Update(p) => &p.sender,
            Payload::Dial(p) | Payload::Close(p) => &p.sender,
            Payload::Offer(p) | Payload::Answer(p) => &p.sender,
            Payload::Ice(p) => &p.base.sender,
        }
    }

    /// `None` for `update`, which carries no recipient (§3).
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Payload::Update(_) => None,
            Payload::Dial(p) | Payload::Close(p) => Some(&p.recipient),
            Payload::Offer(p) | Payload::Answer(p) => Some(&p.recipient),
            Payload::Ice(p) => Some(&p.base.recipient),
        }
    }

    /// `None` for `update`, which carries no timestamp (§3).
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Payload::Update(_) => None,
            Payload::Dial(p) | Payload::Close(p) => Some(p.timestamp),
            Payload::Offer(p) | Payload::Answer(p) => Some(p.timestamp),
            Payload::Ice(p) => Some(p.base.timestamp),
        }
    }

    /// Serialize the concrete payload struct to the exact bytes that are
    /// signed and later re-derived for verification (§3 stable-ordering
    /// invariant — `serde_json` preserves declared field order for structs,
    /// so this is byte-identical on both ends without extra canonicalization).
    pub fn to_signing_bytes(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Payload::Update(p) => serde_json::to_vec(p),
            Payload::Dial(p) | Payload::Close(p) => serde_json::to_vec(p),
            Payload::Offer(p) | Payload::Answer(p) => serde_json::to_vec(p),
            Payload::Ice(p) => serde_json::to_vec(p),
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Payload::Update(p) => serde_json::to_value(p),
            Payload::Dial(p) | Payload::Close(p) => serde_json::to_value(p),
            Payload::Offer(p) | Payload::Answer(p) => serde_json::to_value(p),
            Payload::Ice(p) => serde_json::to_value(p),
        }
    }

    pub fn from_value(method: Method, value: serde_json::Value) -> serde_json::Result<Payload> {
        Ok(match method {
            Method::Update => Payload::Update(serde_json::from_value(value)?),
            Method::Dial => Payload::Dial(serde_json::from_value(value)?),
            Method::Offer => Payload::Offer(serde_json::from_value(value)?),
            Method::Answer => Payload::Answer(serde_json::from_value(value)?),
            Method::Ice => Payload::Ice(serde_json::from_value(value)?),
            Method::Close => Payload::Close(serde_json::from_value(value)?),
        })
    }
}
