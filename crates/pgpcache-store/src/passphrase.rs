//! Caching passphrase decryptor.
//!
//! [`PassphraseKeyring::read_message`] hands the backend a prompt callback
//! that, for each candidate key, first tries a passphrase cached under
//! `pgp:<ID>` and only then asks the real prompter. A passphrase obtained by
//! prompting is cached once it has unlocked its key. Symmetric messages always
//! go straight to the prompter and are never cached.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::Zeroizing;

use pgpcache_core::config::PassphraseConfig;
use pgpcache_core::KeyId;
use pgpcache_secrets::{CacheResult, Key, Permission, Scope, SecureCache};

use crate::openpgp::{KeyRef, KeySource, MessageDetails, OpenPgp, PgpError, PrivateKey, PromptReply};
use crate::passphrase_name;
use crate::prompt::{PromptError, Prompter};

pub struct PassphraseKeyring {
    scope: Scope,
    prompter: Arc<dyn Prompter>,
}

impl PassphraseKeyring {
    pub fn new(scope: Scope, prompter: Arc<dyn Prompter>) -> Self {
        PassphraseKeyring { scope, prompter }
    }

    /// Open (creating as needed) the configured passphrase scope under the
    /// session scope of `cache`.
    pub fn open(
        cache: Arc<dyn SecureCache>,
        config: &PassphraseConfig,
        prompter: Arc<dyn Prompter>,
    ) -> CacheResult<Self> {
        let session = Scope::session(cache)?;
        let mut scope = Scope::open_or_create(&session, &config.scope)?;
        if let Some(ttl) = config.ttl() {
            scope.set_default_timeout(ttl);
        }
        scope.set_permission(Permission::USER_ALL)?;
        Ok(PassphraseKeyring::new(scope, prompter))
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Decode a message through `pgp`, resolving passphrases from the cache
    /// where possible. `prompter` overrides the keyring's default prompter
    /// for this call.
    pub fn read_message(
        &self,
        pgp: &dyn OpenPgp,
        input: &mut dyn Read,
        keys: &dyn KeySource,
        prompter: Option<&dyn Prompter>,
    ) -> Result<MessageDetails, PgpError> {
        let session = Session {
            scope: &self.scope,
            pgp,
            handler: prompter.unwrap_or(&*self.prompter),
            tried: Mutex::new(HashSet::new()),
        };
        pgp.read_message(
            input,
            keys,
            &mut |candidates: &mut [KeyRef], symmetric: bool| session.check(candidates, symmetric),
        )
    }

    /// Cache `passphrase` for key `id`.
    pub fn remember(&self, id: KeyId, passphrase: &[u8]) -> CacheResult<Key> {
        let key = self.scope.add(&passphrase_name(id), passphrase)?;
        tracing::debug!(key_id = %id, "cached passphrase");
        Ok(key)
    }

    pub fn lookup(&self, id: KeyId) -> CacheResult<Option<Zeroizing<Vec<u8>>>> {
        match self.scope.find(&passphrase_name(id))? {
            Some(key) => Ok(Some(key.get()?)),
            None => Ok(None),
        }
    }

    /// Drop the cached passphrase for `id`. Returns false if none was cached.
    pub fn forget(&self, id: KeyId) -> CacheResult<bool> {
        match self.scope.find(&passphrase_name(id))? {
            Some(key) => {
                key.unlink()?;
                tracing::debug!(key_id = %id, "forgot cached passphrase");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Per-call prompt state.
struct Session<'a> {
    scope: &'a Scope,
    pgp: &'a dyn OpenPgp,
    handler: &'a dyn Prompter,
    tried: Mutex<HashSet<KeyId>>,
}

impl Session<'_> {
    /// Marks `id` as tried; false if it already was.
    fn first_try(&self, id: KeyId) -> bool {
        self.tried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    fn check(&self, keys: &mut [KeyRef], symmetric: bool) -> Result<PromptReply, PromptError> {
        if symmetric {
            return self.handler.prompt(keys, true).map(PromptReply::Passphrase);
        }

        for i in 0..keys.len() {
            let (id, encrypted) = match &keys[i].private_key {
                Some(p) => (p.key_id, p.encrypted),
                None => continue,
            };
            if !self.first_try(id) || !encrypted {
                continue;
            }

            if let Some(private) = keys[i].private_key.as_mut() {
                if self.unlock_from_cache(private) {
                    return Ok(PromptReply::Unlocked);
                }
            }

            let pass = self.handler.prompt(&keys[i..=i], false)?;
            let Some(private) = keys[i].private_key.as_mut() else {
                continue;
            };
            match self.pgp.unlock(private, &pass) {
                Ok(()) => {
                    self.scope
                        .add(&passphrase_name(id), &pass)
                        .map_err(|source| PromptError::CacheWrite { key_id: id, source })?;
                    tracing::debug!(key_id = %id, "unlocked with prompted passphrase, cached");
                    return Ok(PromptReply::Unlocked);
                }
                Err(e) => tracing::debug!(key_id = %id, "prompted passphrase rejected: {e}"),
            }
        }

        self.handler.prompt(&[], false).map(PromptReply::Passphrase)
    }

    fn unlock_from_cache(&self, private: &mut PrivateKey) -> bool {
        let id = private.key_id;
        let cached = match self.scope.find(&passphrase_name(id)) {
            Ok(Some(entry)) => entry.get(),
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(key_id = %id, "passphrase cache lookup failed: {e}");
                return false;
            }
        };
        match cached {
            Ok(pass) => match self.pgp.unlock(private, &pass) {
                Ok(()) => {
                    tracing::debug!(key_id = %id, "unlocked with cached passphrase");
                    true
                }
                Err(e) => {
                    tracing::debug!(key_id = %id, "cached passphrase rejected: {e}");
                    false
                }
            },
            Err(e) => {
                tracing::debug!(key_id = %id, "cached passphrase unreadable: {e}");
                false
            }
        }
    }
}
