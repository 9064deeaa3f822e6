//! pgpcache-secrets: scoped, permissioned, time-bounded secret storage
//!
//! Layers (bottom up):
//!   1. [`SecureCache`]: the raw contract, addressed by integer serials
//!      (add / search / read / update / set-timeout / set-permission /
//!      link / unlink / list / describe)
//!   2. [`RegistryCache`]: an implementation keeping object metadata in a
//!      registry and payloads in a [`PayloadStore`]:
//!        - [`MemoryPayloads`]: process-local, nothing outlives the process
//!        - [`KeychainPayloads`]: platform keychain via the `keyring` crate
//!   3. [`Scope`], [`Key`], [`Reference`]: typed handles over any cache,
//!      plus [`KeyReader`] / [`KeyWriter`] streams

pub mod cache;
pub mod clock;
pub mod error;
pub mod keychain;
pub mod memory;
pub mod perms;
pub mod registry;
pub mod scope;
pub mod stream;

pub use cache::{Description, Found, ObjectKind, SecureCache, Serial};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, CacheResult};
pub use keychain::{KeychainCache, KeychainPayloads};
pub use memory::{MemoryCache, MemoryPayloads};
pub use perms::Permission;
pub use registry::{PayloadStore, RegistryCache};
pub use scope::{Entry, Key, Reference, Scope};
pub use stream::{KeyReader, KeyWriter};

use std::sync::Arc;

use pgpcache_core::config::{CacheBackend, CacheConfig};

/// Build the secure cache selected by `config`.
pub fn open_cache(config: &CacheConfig) -> CacheResult<Arc<dyn SecureCache>> {
    let cache: Arc<dyn SecureCache> = match config.backend {
        CacheBackend::Memory => {
            Arc::new(MemoryCache::in_memory().with_trace_calls(config.trace_calls))
        }
        CacheBackend::Keychain => {
            Arc::new(KeychainCache::open(&config.service)?.with_trace_calls(config.trace_calls))
        }
    };
    tracing::debug!(backend = ?config.backend, "opened secure cache");
    Ok(cache)
}
