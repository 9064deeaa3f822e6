//! Platform keychain payload store.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: Secret Service (D-Bus) / kernel keyutils
//! - Windows: Credential Manager (DPAPI)
//!
//! Every object payload is one keychain entry (`object:<serial>`) under the
//! configured service; the registry index is stored as entry `index`.

use zeroize::Zeroizing;

use crate::cache::Serial;
use crate::error::{CacheError, CacheResult};
use crate::registry::{PayloadStore, RegistryCache};

const INDEX_ENTRY: &str = "index";

pub struct KeychainPayloads {
    service: String,
}

impl KeychainPayloads {
    pub fn new(service: &str) -> Self {
        KeychainPayloads {
            service: service.to_string(),
        }
    }

    fn entry(&self, name: &str) -> CacheResult<keyring::Entry> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| CacheError::Keychain(format!("entry creation: {e}")))
    }

    fn get_entry(&self, name: &str) -> CacheResult<Option<Zeroizing<Vec<u8>>>> {
        match self.entry(name)?.get_secret() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CacheError::Keychain(format!("get for '{name}': {e}"))),
        }
    }

    fn set_entry(&self, name: &str, payload: &[u8]) -> CacheResult<()> {
        self.entry(name)?
            .set_secret(payload)
            .map_err(|e| CacheError::Keychain(format!("store for '{name}': {e}")))?;
        tracing::debug!(entry = name, "stored entry in platform keychain");
        Ok(())
    }
}

fn object_entry(id: Serial) -> String {
    format!("object:{id}")
}

impl PayloadStore for KeychainPayloads {
    fn load_index(&self) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.get_entry(INDEX_ENTRY)?.map(|index| index.to_vec()))
    }

    fn store_index(&self, index: &[u8]) -> CacheResult<()> {
        self.set_entry(INDEX_ENTRY, index)
    }

    fn get(&self, id: Serial) -> CacheResult<Zeroizing<Vec<u8>>> {
        self.get_entry(&object_entry(id))?
            .ok_or(CacheError::NoSuchObject(id))
    }

    fn put(&self, id: Serial, payload: &[u8]) -> CacheResult<()> {
        self.set_entry(&object_entry(id), payload)
    }

    fn remove(&self, id: Serial) -> CacheResult<()> {
        let name = object_entry(id);
        match self.entry(&name)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(entry = %name, "deleted entry from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(CacheError::Keychain(format!("delete for '{name}': {e}"))),
        }
    }
}

pub type KeychainCache = RegistryCache<KeychainPayloads>;

impl KeychainCache {
    /// Open (or initialize) the cache stored under keychain `service`.
    pub fn open(service: &str) -> CacheResult<Self> {
        RegistryCache::new(KeychainPayloads::new(service))
    }
}

/// Check if the platform keychain is available.
pub fn is_available(service: &str) -> bool {
    keyring::Entry::new(service, "__pgpcache_probe__").is_ok()
}
