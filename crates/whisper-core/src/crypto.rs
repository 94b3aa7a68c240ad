//! Identity signing, ephemeral key agreement, and AEAD framing.
//!
//! The long-term identity key pair is Ed25519 (detached signatures). Each
//! saga attempt generates a fresh X25519 ephemeral pair; the shared secret
//! derived from it is expanded with HKDF and never persisted.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Byte length of an Ed25519 / X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Nonce length for ChaCha20-Poly1305.
const NONCE_LEN: usize = 12;

/// The long-term signing identity of a peer.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore an identity from a 32-byte seed (e.g. loaded from the store).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Base64-encoded public key — this is the peer's address on the wire.
    pub fn public_key_base64(&self) -> String {
        B64.encode(self.verifying_key().to_bytes())
    }

    /// Detached-sign the exact bytes handed in (must be the re-serializable
    /// payload form so the recipient can reproduce the same bytes).
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    /// The X25519 secret scalar paired with this identity's signing seed,
    /// via the standard Ed25519→X25519 clamped-hash conversion. Used only to
    /// bootstrap the very first sealed frame of a saga attempt, before the
    /// peer's ephemeral public key has arrived — see DESIGN.md.
    fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let hash = Sha512::digest(self.signing_key.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;
        x25519_dalek::StaticSecret::from(scalar)
    }

}

/// Reciprocal of [`EphemeralKeyPair::derive_bootstrap_key_as_sender`]: the
/// recipient derives the same bootstrap key from its own identity secret and
/// the sender's ephemeral public key.
pub fn derive_bootstrap_key_as_recipient(
    own_identity: &IdentityKeyPair,
    sender_ephemeral_public_b64: &str,
) -> Result<SharedKey> {
    let peer_public = decode_x25519_public(sender_ephemeral_public_b64)?;
    let shared = own_identity.to_x25519_secret().diffie_hellman(&peer_public);
    expand_bootstrap_key(shared.as_bytes())
}

fn identity_to_x25519_public(verifying_key: &VerifyingKey) -> Result<x25519_dalek::PublicKey> {
    let compressed = CompressedEdwardsY(verifying_key.to_bytes());
    let point = compressed.decompress().ok_or(Error::DecryptFailed)?;
    Ok(x25519_dalek::PublicKey::from(point.to_montgomery().to_bytes()))
}

fn expand_bootstrap_key(shared_secret: &[u8]) -> Result<SharedKey> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(b"whisper-core/attempt-bootstrap", &mut okm)
        .map_err(|_| Error::DecryptFailed)?;
    Ok(SharedKey(okm))
}

/// Decode a peer's base64 address into its verifying key.
pub fn parse_verifying_key(public_key_b64: &str) -> Result<VerifyingKey> {
    let bytes = B64.decode(public_key_b64).map_err(|_| Error::DecryptFailed)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::DecryptFailed)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| Error::DecryptFailed)
}

/// Decode a base64 Ed25519 public key and verify a detached signature.
pub fn verify_detached(public_key_b64: &str, bytes: &[u8], signature_b64: &str) -> Result<bool> {
    let key_bytes = match B64.decode(public_key_b64) {
        Ok(b) => b,
        Err(_) => return Ok(false),
    };
    let Ok(key_bytes): std::result::Result<[u8; 32], _> = key_bytes.try_into() else {
        return Ok(false);
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return Ok(false);
    };

    let sig_bytes = match B64.decode(signature_b64) {
        Ok(b) => b,
        Err(_) => return Ok(false),
    };
    let Ok(sig_bytes): std::result::Result<[u8; 64], _> = sig_bytes.try_into() else {
        return Ok(false);
    };
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(bytes, &signature).is_ok())
}

/// A fresh X25519 key pair, generated once per saga attempt and never
/// persisted. See §4.5 / §9 encryption discipline.
pub struct EphemeralKeyPair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_base64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }

    /// Derive the shared symmetric key for this attempt from the peer's
    /// ephemeral public key (base64-encoded, as carried on the wire).
    pub fn derive_shared_key(&self, peer_public_key_b64: &str) -> Result<SharedKey> {
        let peer_public = decode_x25519_public(peer_public_key_b64)?;
        let shared_secret = self.secret.diffie_hellman(&peer_public);

        let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(b"whisper-core/saga-attempt", &mut okm)
            .map_err(|_| Error::DecryptFailed)?;
        Ok(SharedKey(okm))
    }

    /// Bootstrap shared key the OUTGOING side uses to seal its first offer,
    /// computable from only the recipient's long-term public key — no extra
    /// round trip needed before the peer's own ephemeral key arrives in
    /// `answer`. See [`derive_bootstrap_key_as_recipient`] and DESIGN.md.
    pub fn derive_bootstrap_key_as_sender(&self, peer_identity_public: &VerifyingKey) -> Result<SharedKey> {
        let peer_x25519 = identity_to_x25519_public(peer_identity_public)?;
        let shared = self.secret.diffie_hellman(&peer_x25519);
        expand_bootstrap_key(shared.as_bytes())
    }
}

fn decode_x25519_public(b64: &str) -> Result<x25519_dalek::PublicKey> {
    let bytes = B64.decode(b64).map_err(|_| Error::DecryptFailed)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::DecryptFailed)?;
    Ok(x25519_dalek::PublicKey::from(bytes))
}

/// The symmetric key derived once per saga attempt, used to seal SDP and
/// ICE candidate payloads under ChaCha20-Poly1305.
#[derive(Clone)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Encrypt `plaintext`, returning `nonce‖ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new((&self.0).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // ChaCha20Poly1305 only fails on plaintexts far larger than anything
        // this protocol ever sends (SDP / ICE candidates).
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .expect("chacha20poly1305 encryption of a bounded signaling payload cannot fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt a `nonce‖ciphertext` frame. Any authentication failure is a
    /// hard error for that frame (§3 AEAD frame invariant).
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < NONCE_LEN {
            return Err(Error::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&self.0).into());
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::DecryptFailed)
    }
}

pub fn base64_encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    B64.decode(s).map_err(|_| Error::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let bytes = b"payload bytes to sign";
        let sig = identity.sign(bytes);
        let sig_b64 = B64.encode(sig.to_bytes());
        let ok = verify_detached(&identity.public_key_base64(), bytes, &sig_b64).unwrap();
        assert!(ok);
    }

    #[test]
    fn verify_rejects_tampered_bytes() {
        let identity = IdentityKeyPair::generate();
        let sig = identity.sign(b"original");
        let sig_b64 = B64.encode(sig.to_bytes());
        let ok = verify_detached(&identity.public_key_base64(), b"tampered", &sig_b64).unwrap();
        assert!(!ok);
    }

    #[test]
    fn ephemeral_key_exchange_agrees_both_sides() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let shared_a = a.derive_shared_key(&b.public_key_base64()).unwrap();
        let shared_b = b.derive_shared_key(&a.public_key_base64()).unwrap();

        let msg = b"session description";
        let frame = shared_a.seal(msg);
        let opened = shared_b.open(&frame).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn bootstrap_key_agrees_without_peer_ephemeral_known() {
        let sender_ephemeral = EphemeralKeyPair::generate();
        let recipient_identity = IdentityKeyPair::generate();

        let sender_key = sender_ephemeral
            .derive_bootstrap_key_as_sender(&recipient_identity.verifying_key())
            .unwrap();
        let recipient_key = derive_bootstrap_key_as_recipient(
            &recipient_identity,
            &sender_ephemeral.public_key_base64(),
        )
        .unwrap();

        let frame = sender_key.seal(b"offer sdp");
        assert_eq!(recipient_key.open(&frame).unwrap(), b"offer sdp");
    }

    #[test]
    fn aead_open_rejects_corrupted_frame() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let shared_a = a.derive_shared_key(&b.public_key_base64()).unwrap();
        let shared_b = b.derive_shared_key(&a.public_key_base64()).unwrap();

        let mut frame = shared_a.seal(b"ice candidate");
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(shared_b.open(&frame).is_err());
    }
}
