//! Process-local payload store. Nothing outlives the process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use zeroize::Zeroizing;

use crate::cache::Serial;
use crate::error::{CacheError, CacheResult};
use crate::registry::{PayloadStore, RegistryCache};

#[derive(Default)]
pub struct MemoryPayloads {
    entries: Mutex<HashMap<Serial, Zeroizing<Vec<u8>>>>,
}

impl PayloadStore for MemoryPayloads {
    fn persistent(&self) -> bool {
        false
    }

    fn load_index(&self) -> CacheResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn store_index(&self, _index: &[u8]) -> CacheResult<()> {
        Ok(())
    }

    fn get(&self, id: Serial) -> CacheResult<Zeroizing<Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(CacheError::NoSuchObject(id))
    }

    fn put(&self, id: Serial, payload: &[u8]) -> CacheResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Zeroizing::new(payload.to_vec()));
        Ok(())
    }

    fn remove(&self, id: Serial) -> CacheResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }
}

pub type MemoryCache = RegistryCache<MemoryPayloads>;

impl MemoryCache {
    pub fn in_memory() -> Self {
        RegistryCache::empty(MemoryPayloads::default())
    }
}
