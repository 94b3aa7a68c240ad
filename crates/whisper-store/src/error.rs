//! Error taxonomy for the encrypted KV store (§4.8, §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A KV operation was attempted before [`crate::store::FsStore::open`]
    /// established a password, or the supplied password didn't match the
    /// store's `check` canary.
    #[error("store operation attempted without a valid password")]
    StoreLocked,

    /// A record's ciphertext failed to decrypt/authenticate under its own
    /// stored salt/iv, or the on-disk table JSON was not well formed.
    #[error("store record is corrupt")]
    StoreCorrupt,

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
