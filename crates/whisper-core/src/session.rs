//! Session service — the process-wide long-term signing identity.

use crate::crypto::IdentityKeyPair;

/// Holds the long-term signing key pair. Read-only after construction
/// (§5: "the session key pair is process-global and read-only after init").
#[derive(Clone)]
pub struct SessionService {
    identity: std::sync::Arc<IdentityKeyPair>,
    public_key: String,
}

impl SessionService {
    pub fn new(identity: IdentityKeyPair) -> Self {
        let public_key = identity.public_key_base64();
        Self {
            identity: std::sync::Arc::new(identity),
            public_key,
        }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_stable() {
        let session = SessionService::new(IdentityKeyPair::generate());
        assert_eq!(session.public_key(), session.public_key());
    }
}
