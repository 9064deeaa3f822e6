//! The three-scope key store.

use std::collections::BTreeMap;
use std::io::{BufRead, Read};
use std::sync::Arc;

use pgpcache_core::config::StoreConfig;
use pgpcache_core::KeyId;
use pgpcache_packet::CaptureReader;
use pgpcache_secrets::{CacheError, Entry, Permission, Scope, SecureCache};

use crate::error::StoreResult;
use crate::key::{read_entities, CapturedKeys, StoredKey};
use crate::openpgp::{self, Entity, KeyRef, KeySource, KeyUsage, OpenPgp};
use crate::{private_name, public_name, LIVE_SCOPE, PRIVATE_PREFIX, PUBLIC_PREFIX};

/// Read for user, group and other; write and setattr for the user only.
const PUBLIC_PERM: Permission = Permission(
    Permission::USER_ALL.0
        | (Permission::GROUP_ALL.0 ^ (Permission::GROUP_WRITE.0 | Permission::GROUP_SETATTR.0))
        | (Permission::OTHER_ALL.0 ^ (Permission::OTHER_WRITE.0 | Permission::OTHER_SETATTR.0)),
);

const OWNER_PERM: Permission = Permission::USER_ALL;

pub struct KeyStore {
    root: Scope,
    public: Scope,
    live: Scope,
    private: Scope,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("root", &self.root.id())
            .field("public", &self.public.id())
            .field("live", &self.live.id())
            .field("private", &self.private.id())
            .finish()
    }
}

impl KeyStore {
    /// Open (creating as needed) the store under the session scope of `cache`.
    pub fn open(cache: Arc<dyn SecureCache>, config: &StoreConfig) -> StoreResult<Self> {
        KeyStore::open_under(Scope::session(cache)?, config)
    }

    /// Open (creating as needed) the store under `root`.
    pub fn open_under(root: Scope, config: &StoreConfig) -> StoreResult<Self> {
        let public = Scope::open_or_create(&root, PUBLIC_PREFIX)?;
        public.set_permission(PUBLIC_PERM)?;

        let mut live = Scope::open_or_create(&root, LIVE_SCOPE)?;
        if let Some(ttl) = config.live_ttl() {
            live.set_default_timeout(ttl);
        }
        live.set_permission(OWNER_PERM)?;

        let private = Scope::open_or_create(&live, PRIVATE_PREFIX)?;
        private.set_permission(OWNER_PERM)?;

        tracing::debug!(
            public = %public.id(),
            live = %live.id(),
            private = %private.id(),
            live_ttl = ?config.live_ttl(),
            "opened key store"
        );
        Ok(KeyStore {
            root,
            public,
            live,
            private,
        })
    }

    pub fn root(&self) -> &Scope {
        &self.root
    }

    pub fn public(&self) -> &Scope {
        &self.public
    }

    pub fn live(&self) -> &Scope {
        &self.live
    }

    pub fn private(&self) -> &Scope {
        &self.private
    }

    // ── Import ───────────────────────────────────────────────────────────

    /// Import a binary keyring stream. Returns the primary ids whose entries
    /// were written in full.
    pub fn import<R: Read>(&self, pgp: &dyn OpenPgp, input: R) -> StoreResult<Vec<KeyId>> {
        self.import_captured(pgp, CaptureReader::new(input, pgp))
    }

    /// Import an ASCII-armored keyring.
    pub fn import_armored<R: BufRead>(
        &self,
        pgp: &dyn OpenPgp,
        input: R,
    ) -> StoreResult<Vec<KeyId>> {
        self.import_captured(pgp, CaptureReader::from_armored(input, pgp))
    }

    fn import_captured<R: Read>(
        &self,
        pgp: &dyn OpenPgp,
        mut reader: CaptureReader<R, &dyn OpenPgp>,
    ) -> StoreResult<Vec<KeyId>> {
        let entities = pgp.read_keyring(&mut reader)?;

        let mut pending: BTreeMap<KeyId, StoredKey> = BTreeMap::new();
        for entity in entities {
            let id = entity.key_id();
            let key = match pending.entry(id) {
                std::collections::btree_map::Entry::Occupied(slot) => slot.into_mut(),
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(StoredKey::load(self, pgp, id)?)
                }
            };
            key.merge(entity);
        }

        let captured = |id: KeyId| reader.private_key(id);
        let mut written = Vec::with_capacity(pending.len());
        for (id, key) in pending.iter_mut() {
            key.write(self, Some(pgp), &captured)?;
            if key.flags().is_empty() {
                written.push(*id);
            } else {
                tracing::warn!(key_id = %id, flags = ?key.flags(), "private key packet not captured, write deferred");
            }
        }
        tracing::info!(keys = written.len(), "imported keys");
        Ok(written)
    }

    /// Locate and decode the stored state of `id` (empty if nothing is stored).
    pub fn load_key(&self, pgp: &dyn OpenPgp, id: KeyId) -> StoreResult<StoredKey> {
        StoredKey::load(self, pgp, id)
    }

    /// Persist the pending writes of `key`. On failure the key keeps its
    /// pending flags and can be written again.
    pub fn write_key(
        &self,
        pgp: &dyn OpenPgp,
        key: &mut StoredKey,
        captured: &CapturedKeys<'_>,
    ) -> StoreResult<()> {
        key.write(self, Some(pgp), captured)
    }

    // ── Removal ──────────────────────────────────────────────────────────

    /// Remove every entry for `id`. Returns false if nothing was stored.
    pub fn forget(&self, id: KeyId) -> StoreResult<bool> {
        let mut key = StoredKey::locate(self, id)?;
        let existed = key.has_public_entry() || key.has_private_entry();
        key.clear_public();
        key.clear_private();
        key.write(self, None, &|_| None)?;
        tracing::info!(key_id = %id, existed, "forgot key");
        Ok(existed)
    }

    /// Remove the private entries for `id`, keeping the public one.
    pub fn forget_private(&self, id: KeyId) -> StoreResult<bool> {
        let mut key = StoredKey::locate(self, id)?;
        let existed = key.has_private_entry();
        key.unlink_private(self);
        tracing::info!(key_id = %id, existed, "forgot private key");
        Ok(existed)
    }

    // ── Query ────────────────────────────────────────────────────────────

    /// Entities stored for `id`: the live scope first (which also reaches
    /// the nested private scope), then the public scope. Entries are named by
    /// primary id, so a subkey id falls back to walking both private-key scopes.
    fn entities_by_id(&self, pgp: &dyn OpenPgp, id: KeyId) -> StoreResult<Vec<Entity>> {
        if let Some(handle) = self.live.find(&private_name(id))? {
            match read_entities(pgp, &handle) {
                Ok(entities) if !entities.is_empty() => return Ok(entities),
                Ok(_) => {}
                Err(e) => tracing::debug!(key_id = %id, "live entry unreadable: {e}"),
            }
        }
        if let Some(handle) = self.public.find(&public_name(id))? {
            return read_entities(pgp, &handle);
        }
        let mut entities = self.entities_in(pgp, &self.live)?;
        entities.extend(self.entities_in(pgp, &self.private)?);
        Ok(entities)
    }

    pub fn keys_by_id(&self, pgp: &dyn OpenPgp, id: KeyId) -> StoreResult<Vec<KeyRef>> {
        let entities = self.entities_by_id(pgp, id)?;
        Ok(openpgp::keys_by_id(&entities, id))
    }

    pub fn keys_by_id_usage(
        &self,
        pgp: &dyn OpenPgp,
        id: KeyId,
        usage: KeyUsage,
    ) -> StoreResult<Vec<KeyRef>> {
        let entities = self.entities_by_id(pgp, id)?;
        Ok(openpgp::keys_by_id_usage(&entities, id, usage))
    }

    /// Every decryption-capable key held in the private scope.
    pub fn decryption_keys(&self, pgp: &dyn OpenPgp) -> StoreResult<Vec<KeyRef>> {
        Ok(openpgp::decryption_keys(&self.entities_in(pgp, &self.private)?))
    }

    /// Decode every `pgp-privkey:` entry linked directly into `scope`.
    fn entities_in(&self, pgp: &dyn OpenPgp, scope: &Scope) -> StoreResult<Vec<Entity>> {
        let prefix = format!("{PRIVATE_PREFIX}:");
        let mut entities = Vec::new();
        for mut r in scope.list()? {
            let name = match r.info() {
                Ok(info) => info.name.clone(),
                Err(_) => continue,
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            let handle = match r.resolve() {
                Ok(Entry::Key(k)) => k,
                Ok(_) | Err(CacheError::InvalidReference | CacheError::UnsupportedObjectKind) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            match read_entities(pgp, &handle) {
                Ok(kel) => entities.extend(kel),
                Err(e) => tracing::warn!(entry = %name, "skipping unreadable private entry: {e}"),
            }
        }
        Ok(entities)
    }

    /// A [`KeySource`] view of this store for message decryption.
    pub fn key_source<'a>(&'a self, pgp: &'a dyn OpenPgp) -> StoreKeys<'a> {
        StoreKeys { store: self, pgp }
    }
}

/// Store lookups for a message decoder. Errors are logged and treated as
/// "no keys".
pub struct StoreKeys<'a> {
    store: &'a KeyStore,
    pgp: &'a dyn OpenPgp,
}

impl KeySource for StoreKeys<'_> {
    fn keys_by_id(&self, id: KeyId) -> Vec<KeyRef> {
        self.store.keys_by_id(self.pgp, id).unwrap_or_else(|e| {
            tracing::warn!(key_id = %id, "key lookup failed: {e}");
            Vec::new()
        })
    }

    fn decryption_keys(&self) -> Vec<KeyRef> {
        self.store.decryption_keys(self.pgp).unwrap_or_else(|e| {
            tracing::warn!("enumerating decryption keys failed: {e}");
            Vec::new()
        })
    }
}
