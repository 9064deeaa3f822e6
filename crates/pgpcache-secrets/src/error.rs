use thiserror::Error;

use crate::cache::{ObjectKind, Serial};

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no {kind} named {name:?} reachable from scope {scope}")]
    NotFound {
        scope: Serial,
        kind: ObjectKind,
        name: String,
    },

    #[error("object {0} does not exist")]
    NoSuchObject(Serial),

    #[error("object {0} has expired")]
    Expired(Serial),

    #[error("object {0} is not a scope")]
    NotAScope(Serial),

    #[error("object {object} is not linked into scope {scope}")]
    NotLinked { object: Serial, scope: Serial },

    /// The referenced object is neither a key nor a scope.
    #[error("unsupported secure cache object kind")]
    UnsupportedObjectKind,

    /// The referenced object expired or was removed after it was listed.
    #[error("invalid secure cache reference")]
    InvalidReference,

    #[error("keychain: {0}")]
    Keychain(String),

    #[error("corrupt registry index: {0}")]
    Index(String),
}

impl CacheError {
    /// True for lookups that simply found nothing (a cache miss).
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. } | CacheError::NoSuchObject(_))
    }
}

impl From<CacheError> for std::io::Error {
    fn from(e: CacheError) -> Self {
        let kind = if e.is_not_found() {
            std::io::ErrorKind::NotFound
        } else {
            std::io::ErrorKind::Other
        };
        std::io::Error::new(kind, e)
    }
}

impl From<CacheError> for pgpcache_core::PgpCacheError {
    fn from(e: CacheError) -> Self {
        pgpcache_core::PgpCacheError::Cache(e.to_string())
    }
}
