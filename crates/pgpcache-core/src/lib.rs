pub mod config;
pub mod error;
pub mod types;

pub use error::{PgpCacheError, PgpCacheResult};
pub use types::KeyId;
