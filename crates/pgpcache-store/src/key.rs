//! One stored OpenPGP key: merged entity, private key, pending writes, and
//! handles to its secure-cache entries.

use std::fmt;
use std::ops::BitOr;
use zeroize::Zeroizing;

use pgpcache_core::KeyId;
use pgpcache_secrets::{CacheError, Entry, Key, Scope};

use crate::error::{StoreError, StoreResult};
use crate::openpgp::{Entity, OpenPgp, PrivateKey, SelfSignature};
use crate::ring::KeyStore;
use crate::{private_name, public_name};

/// Writes still owed to the secure cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pending(pub u8);

impl Pending {
    pub const NONE: Pending = Pending(0);
    pub const PUBLIC: Pending = Pending(1);
    pub const PRIVATE: Pending = Pending(1 << 1);
    pub const SUBKEYS: Pending = Pending(1 << 2);

    pub fn contains(self, other: Pending) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Pending) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Pending) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Pending {
    type Output = Pending;
    fn bitor(self, rhs: Pending) -> Pending {
        Pending(self.0 | rhs.0)
    }
}

/// Raw private-key packet bytes by key id, as captured during import.
pub type CapturedKeys<'a> = dyn Fn(KeyId) -> Option<Zeroizing<Vec<u8>>> + 'a;

pub struct StoredKey {
    key_id: KeyId,
    entity: Option<Entity>,
    private_key: Option<PrivateKey>,
    flags: Pending,
    pubkey: Option<Key>,
    privkey: Option<Key>,
    livekey: Option<Key>,
}

impl fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKey")
            .field("key_id", &self.key_id)
            .field("has_entity", &self.entity.is_some())
            .field("private_key", &self.private_key)
            .field("flags", &self.flags)
            .field("pubkey", &self.pubkey.as_ref().map(Key::id))
            .field("privkey", &self.privkey.as_ref().map(Key::id))
            .field("livekey", &self.livekey.as_ref().map(Key::id))
            .finish()
    }
}

impl StoredKey {
    pub fn new(key_id: KeyId) -> Self {
        StoredKey {
            key_id,
            entity: None,
            private_key: None,
            flags: Pending::NONE,
            pubkey: None,
            privkey: None,
            livekey: None,
        }
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn flags(&self) -> Pending {
        self.flags
    }

    pub fn has_public_entry(&self) -> bool {
        self.pubkey.is_some()
    }

    /// Whether a private entry exists in either the live or private scope.
    pub fn has_private_entry(&self) -> bool {
        self.privkey.is_some() || self.livekey.is_some()
    }

    /// Find the cache entries for `id` without decoding anything.
    pub(crate) fn locate(store: &KeyStore, id: KeyId) -> StoreResult<Self> {
        let mut key = StoredKey::new(id);
        key.pubkey = store.public().find(&public_name(id))?;
        let name = private_name(id);
        key.livekey = find_direct(store.live(), &name)?;
        key.privkey = find_direct(store.private(), &name)?;
        Ok(key)
    }

    /// Locate `id` and decode its stored public entity, if any.
    pub(crate) fn load(store: &KeyStore, pgp: &dyn OpenPgp, id: KeyId) -> StoreResult<Self> {
        let mut key = StoredKey::locate(store, id)?;
        if let Some(handle) = &key.pubkey {
            match read_entities(pgp, handle) {
                Ok(entities) => {
                    key.entity = entities.into_iter().find(|e| e.key_id() == id).map(|mut e| {
                        e.private_key = None;
                        e
                    });
                }
                Err(e) => tracing::warn!(key_id = %id, "ignoring undecodable public entry: {e}"),
            }
        }
        Ok(key)
    }

    /// Fold a freshly decoded entity into this key and record what changed.
    pub fn merge(&mut self, mut incoming: Entity) {
        let is_primary = incoming
            .primary_self_signature()
            .is_some_and(SelfSignature::is_primary);
        let incoming_private = incoming.private_key.take();

        match self.entity.as_mut() {
            None => {
                self.flags.insert(Pending::PUBLIC);
                if !incoming.subkeys.is_empty()
                    || !incoming.revocations.is_empty()
                    || !incoming.identities.is_empty()
                {
                    self.flags.insert(Pending::SUBKEYS);
                }
                self.entity = Some(incoming);
            }
            Some(stored) => {
                if stored.primary_key != incoming.primary_key {
                    stored.primary_key = incoming.primary_key.clone();
                    self.flags.insert(Pending::PUBLIC);
                }
                if merge_parts(stored, incoming) {
                    self.flags.insert(Pending::PUBLIC | Pending::SUBKEYS);
                }
            }
        }

        if let Some(private) = incoming_private {
            if self.private_key.is_none() || is_primary {
                self.private_key = Some(private);
                self.flags.insert(Pending::PRIVATE);
            }
        }
    }

    /// Drop the public material; the next write unlinks the public entry.
    pub(crate) fn clear_public(&mut self) {
        self.entity = None;
        self.flags.insert(Pending::PUBLIC | Pending::SUBKEYS);
    }

    /// Drop the private material; the next write unlinks the private entries.
    pub(crate) fn clear_private(&mut self) {
        self.private_key = None;
        self.flags.insert(Pending::PRIVATE);
    }

    /// Persist pending changes. Flags are cleared only for sections that were
    /// written successfully.
    pub(crate) fn write(
        &mut self,
        store: &KeyStore,
        pgp: Option<&dyn OpenPgp>,
        captured: &CapturedKeys<'_>,
    ) -> StoreResult<()> {
        // SUBKEYS is OR-ed in after the mask, so this section runs on every write.
        if (self.flags.0 & Pending::PUBLIC.0) | Pending::SUBKEYS.0 != 0 {
            match self.entity.as_ref() {
                Some(entity) => {
                    let pgp = pgp.ok_or(StoreError::NoBackend(self.key_id))?;
                    let name = public_name(self.key_id);
                    let mut writer = match &self.pubkey {
                        Some(handle) => handle.writer(),
                        None => store.public().writer(&name),
                    };
                    pgp.serialize(entity, &mut writer)?;
                    let handle = writer
                        .commit()
                        .map_err(|source| StoreError::Write { name, source })?;
                    tracing::debug!(key_id = %self.key_id, serial = %handle.id(), "stored public key");
                    self.pubkey = Some(handle);
                    self.flags.remove(Pending::PUBLIC | Pending::SUBKEYS);
                }
                None => {
                    if let Some(handle) = &self.pubkey {
                        handle.unlink().map_err(|source| StoreError::Write {
                            name: handle.name().to_string(),
                            source,
                        })?;
                        self.pubkey = None;
                        self.flags.remove(Pending::PUBLIC | Pending::SUBKEYS);
                    }
                }
            }
        }

        if self.flags.contains(Pending::PRIVATE) {
            match &self.private_key {
                None => {
                    self.unlink_private(store);
                    self.flags.remove(Pending::PRIVATE);
                }
                Some(pk) if self.entity.is_some() => {
                    let encrypted = pk.encrypted;
                    let Some(blob) = self.private_blob(captured) else {
                        tracing::debug!(key_id = %self.key_id, "no captured private key bytes, deferring");
                        return Ok(());
                    };
                    let name = private_name(self.key_id);
                    let (target, other) = if encrypted {
                        (store.private(), store.live())
                    } else {
                        (store.live(), store.private())
                    };
                    let handle = target
                        .add(&name, &blob)
                        .map_err(|source| StoreError::Write {
                            name: name.clone(),
                            source,
                        })?;

                    let stale = if encrypted {
                        self.livekey.take()
                    } else {
                        self.privkey.take()
                    };
                    if let Some(stale) = stale {
                        if let Err(e) = stale.unlink_from(other) {
                            tracing::debug!(entry = %name, "unlinking stale private entry: {e}");
                        }
                    }
                    tracing::debug!(key_id = %self.key_id, encrypted, serial = %handle.id(), "stored private key");
                    if encrypted {
                        self.privkey = Some(handle);
                    } else {
                        self.livekey = Some(handle);
                    }
                    self.flags.remove(Pending::PRIVATE);
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Unlink every private entry from both the live and private scopes.
    pub(crate) fn unlink_private(&mut self, store: &KeyStore) {
        for handle in [self.livekey.take(), self.privkey.take()].into_iter().flatten() {
            for scope in [store.live(), store.private()] {
                if let Err(e) = handle.unlink_from(scope) {
                    tracing::trace!(entry = handle.name(), "unlink: {e}");
                }
            }
        }
    }

    /// Captured primary private-key packet followed by any captured subkey
    /// packets.
    fn private_blob(&self, captured: &CapturedKeys<'_>) -> Option<Zeroizing<Vec<u8>>> {
        let primary = self.private_key.as_ref()?;
        let mut blob = Zeroizing::new(captured(primary.key_id)?.to_vec());
        if let Some(entity) = &self.entity {
            for sub in entity.subkeys.iter().filter_map(|s| s.private_key.as_ref()) {
                if let Some(bytes) = captured(sub.key_id) {
                    blob.extend_from_slice(&bytes);
                }
            }
        }
        Some(blob)
    }
}

/// Merge identities (by name), subkeys (by key id), and revocations. Returns
/// true if anything changed.
fn merge_parts(stored: &mut Entity, incoming: Entity) -> bool {
    let mut changed = false;

    for ident in incoming.identities {
        match stored.identities.iter_mut().find(|i| i.name == ident.name) {
            Some(existing) if *existing == ident => {}
            Some(existing) => {
                *existing = ident;
                changed = true;
            }
            None => {
                stored.identities.push(ident);
                changed = true;
            }
        }
    }

    for mut sub in incoming.subkeys {
        match stored
            .subkeys
            .iter_mut()
            .find(|s| s.public_key.key_id == sub.public_key.key_id)
        {
            Some(existing) => {
                if existing.public_key != sub.public_key
                    || (existing.private_key.is_none() && sub.private_key.is_some())
                {
                    changed = true;
                }
                if sub.private_key.is_none() {
                    sub.private_key = existing.private_key.take();
                }
                *existing = sub;
            }
            None => {
                stored.subkeys.push(sub);
                changed = true;
            }
        }
    }

    for rev in incoming.revocations {
        if !stored.revocations.contains(&rev) {
            stored.revocations.push(rev);
            changed = true;
        }
    }

    changed
}

/// A key entry linked directly into `scope` (nested scopes are not searched).
fn find_direct(scope: &Scope, name: &str) -> StoreResult<Option<Key>> {
    for mut r in scope.list()? {
        match r.resolve() {
            Ok(Entry::Key(k)) if k.name() == name => return Ok(Some(k)),
            Ok(_) => {}
            Err(CacheError::InvalidReference | CacheError::UnsupportedObjectKind) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

pub(crate) fn read_entities(pgp: &dyn OpenPgp, handle: &Key) -> StoreResult<Vec<Entity>> {
    let payload = handle.get()?;
    pgp.read_keyring(&mut &payload[..])
        .map_err(|source| StoreError::Decode {
            name: handle.name().to_string(),
            source,
        })
}
