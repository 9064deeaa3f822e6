use std::io;
use thiserror::Error;

pub type FramingResult<T> = Result<T, FramingError>;

#[derive(Debug, Error)]
pub enum FramingError {
    /// Malformed header.
    #[error("structural error: {0}")]
    Structural(String),

    /// The stream ended inside a header, length prefix, or declared body.
    #[error("unexpected end of packet stream")]
    UnexpectedEnd,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FramingError> for io::Error {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::Io(inner) => inner,
            FramingError::UnexpectedEnd => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<FramingError> for pgpcache_core::PgpCacheError {
    fn from(e: FramingError) -> Self {
        pgpcache_core::PgpCacheError::Framing(e.to_string())
    }
}
