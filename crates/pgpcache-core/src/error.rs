use thiserror::Error;

pub type PgpCacheResult<T> = Result<T, PgpCacheError>;

#[derive(Debug, Error)]
pub enum PgpCacheError {
    #[error("secure cache error: {0}")]
    Cache(String),

    #[error("packet framing error: {0}")]
    Framing(String),

    #[error("key store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid key id: {0}")]
    KeyId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
