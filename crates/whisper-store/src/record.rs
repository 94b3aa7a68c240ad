//! The on-disk record shape (§4.8): `{ id_hash, iv, salt, ciphertext }`,
//! with every field besides `id_hash` base64-encoded.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kdf::{self, NONCE_LEN, SALT_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id_hash: String,
    pub iv: String,
    pub salt: String,
    pub ciphertext: String,
}

impl Record {
    /// Seal `value` under a fresh per-write salt derived from `password`.
    pub fn seal(id_hash: String, value: &[u8], password: &str) -> Result<Self> {
        let salt = kdf::random_salt();
        let nonce_bytes = kdf::random_nonce();
        let key = kdf::derive_key(password, &salt)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| Error::StoreCorrupt)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, value).map_err(|_| Error::StoreCorrupt)?;
        Ok(Self {
            id_hash,
            iv: B64.encode(nonce_bytes),
            salt: B64.encode(salt),
            ciphertext: B64.encode(ciphertext),
        })
    }

    /// Rederive the key from the record's own stored salt and open it.
    /// Returns [`Error::StoreLocked`] on an authentication failure, which is
    /// how a wrong password is distinguished from on-disk corruption.
    pub fn open(&self, password: &str) -> Result<Vec<u8>> {
        let salt = decode_fixed::<SALT_LEN>(&self.salt)?;
        let nonce_bytes = decode_fixed::<NONCE_LEN>(&self.iv)?;
        let ciphertext = B64.decode(&self.ciphertext).map_err(|_| Error::StoreCorrupt)?;
        let key = kdf::derive_key(password, &salt)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| Error::StoreCorrupt)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        cipher.decrypt(nonce, ciphertext.as_ref()).map_err(|_| Error::StoreLocked)
    }
}

fn decode_fixed<const N: usize>(field: &str) -> Result<[u8; N]> {
    let bytes = B64.decode(field).map_err(|_| Error::StoreCorrupt)?;
    bytes.try_into().map_err(|_| Error::StoreCorrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_roundtrips() {
        let record = Record::seal("idhash".into(), b"hello", "pw").unwrap();
        assert_eq!(record.open("pw").unwrap(), b"hello");
    }

    #[test]
    fn wrong_password_fails_as_store_locked() {
        let record = Record::seal("idhash".into(), b"hello", "pw").unwrap();
        let err = record.open("wrong").unwrap_err();
        assert!(matches!(err, Error::StoreLocked));
    }

    #[test]
    fn corrupted_ciphertext_fails_as_store_locked() {
        let mut record = Record::seal("idhash".into(), b"hello", "pw").unwrap();
        record.ciphertext = B64.encode(b"not the real ciphertext at all");
        assert!(record.open("pw").is_err());
    }
}
