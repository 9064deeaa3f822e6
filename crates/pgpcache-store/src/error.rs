use std::io;
use thiserror::Error;

use pgpcache_core::KeyId;
use pgpcache_packet::FramingError;
use pgpcache_secrets::CacheError;

use crate::openpgp::PgpError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secure cache: {0}")]
    Cache(#[from] CacheError),

    /// Persisting a key failed; its dirty flags are kept for a retry.
    #[error("writing {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: CacheError,
    },

    #[error("decoding stored entry {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: PgpError,
    },

    #[error("no OpenPGP backend to serialize key {0}")]
    NoBackend(KeyId),

    #[error(transparent)]
    Pgp(#[from] PgpError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<StoreError> for pgpcache_core::PgpCacheError {
    fn from(e: StoreError) -> Self {
        pgpcache_core::PgpCacheError::Store(e.to_string())
    }
}
