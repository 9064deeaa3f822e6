//! Typed handles over a [`SecureCache`]: scopes, keys, and listed references.

use std::sync::Arc;
use zeroize::Zeroizing;

use crate::cache::{Description, ObjectKind, SecureCache, Serial};
use crate::error::{CacheError, CacheResult};
use crate::perms::Permission;
use crate::stream::{KeyReader, KeyWriter};

// ── Scope ────────────────────────────────────────────────────────────────

/// A scope inside a secure cache.
///
/// A scope opened by name remembers its parent so it can unlink itself. The
/// default TTL (if any) is applied to every key added through this handle.
#[derive(Clone)]
pub struct Scope {
    cache: Arc<dyn SecureCache>,
    id: Serial,
    name: Option<String>,
    parent: Option<Serial>,
    default_ttl: Option<u32>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl Scope {
    /// The session root of `cache`.
    pub fn session(cache: Arc<dyn SecureCache>) -> CacheResult<Scope> {
        let id = cache.session_scope()?;
        Ok(Scope {
            cache,
            id,
            name: None,
            parent: None,
            default_ttl: None,
        })
    }

    /// Open an existing scope reachable from `parent`.
    pub fn open(parent: &Scope, name: &str) -> CacheResult<Scope> {
        let found = parent.cache.search(parent.id, ObjectKind::Scope, name)?;
        let mut scope = parent.child(found.id, name);
        scope.parent = Some(found.scope);
        Ok(scope)
    }

    /// Create a scope directly under `parent`.
    pub fn create(parent: &Scope, name: &str) -> CacheResult<Scope> {
        let id = parent.cache.create_scope(parent.id, name)?;
        tracing::debug!(scope = name, serial = %id, "created scope");
        Ok(parent.child(id, name))
    }

    pub fn open_or_create(parent: &Scope, name: &str) -> CacheResult<Scope> {
        match Scope::open(parent, name) {
            Ok(scope) => Ok(scope),
            Err(e) if e.is_not_found() => Scope::create(parent, name),
            Err(e) => Err(e),
        }
    }

    fn child(&self, id: Serial, name: &str) -> Scope {
        Scope {
            cache: self.cache.clone(),
            id,
            name: Some(name.to_string()),
            parent: Some(self.id),
            default_ttl: None,
        }
    }

    pub fn id(&self) -> Serial {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<Serial> {
        self.parent
    }

    pub fn cache(&self) -> &Arc<dyn SecureCache> {
        &self.cache
    }

    pub fn default_ttl(&self) -> Option<u32> {
        self.default_ttl
    }

    /// TTL applied to keys added through this handle; zero disables it.
    pub fn set_default_timeout(&mut self, secs: u32) {
        self.default_ttl = (secs > 0).then_some(secs);
    }

    /// Expire the scope itself after `secs` seconds.
    pub fn set_timeout(&self, secs: u32) -> CacheResult<()> {
        self.cache.set_timeout(self.id, secs)
    }

    pub fn set_permission(&self, perm: Permission) -> CacheResult<()> {
        self.cache.set_permission(self.id, perm)
    }

    pub fn describe(&self) -> CacheResult<Description> {
        self.cache.describe(self.id)
    }

    /// Add (or update) a key directly in this scope.
    pub fn add(&self, name: &str, payload: &[u8]) -> CacheResult<Key> {
        let id = self.cache.add(self.id, name, payload)?;
        let key = Key {
            cache: self.cache.clone(),
            id,
            name: name.to_string(),
            scope: self.id,
            ttl: self.default_ttl,
        };
        if let Some(secs) = self.default_ttl {
            self.cache.set_timeout(id, secs)?;
        }
        Ok(key)
    }

    /// Find a key by name in this scope or any nested scope. The key handle
    /// belongs to the scope it was actually found in.
    pub fn search(&self, name: &str) -> CacheResult<Key> {
        let found = self.cache.search(self.id, ObjectKind::Key, name)?;
        Ok(Key {
            cache: self.cache.clone(),
            id: found.id,
            name: name.to_string(),
            scope: found.scope,
            ttl: self.default_ttl,
        })
    }

    /// Like [`Scope::search`], with a miss reported as `None`.
    pub fn find(&self, name: &str) -> CacheResult<Option<Key>> {
        match self.search(name) {
            Ok(key) => Ok(Some(key)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// References to everything directly linked into this scope.
    pub fn list(&self) -> CacheResult<Vec<Reference>> {
        Ok(self
            .cache
            .list(self.id)?
            .into_iter()
            .map(|id| Reference::new(self.cache.clone(), id, self.id))
            .collect())
    }

    /// Unlink this scope from the parent it was opened through.
    pub fn unlink(&self) -> CacheResult<()> {
        let parent = self.parent.ok_or(CacheError::InvalidReference)?;
        self.cache.unlink(self.id, parent)
    }

    /// Open a writer that creates (or updates) key `name` on commit.
    pub fn writer(&self, name: &str) -> KeyWriter {
        KeyWriter::create(self.clone(), name)
    }

    /// Stream the payload of key `name`.
    pub fn reader(&self, name: &str) -> CacheResult<KeyReader> {
        Ok(self.search(name)?.reader())
    }
}

// ── Key ──────────────────────────────────────────────────────────────────

/// A key (named secret) and the scope it was reached through.
#[derive(Clone)]
pub struct Key {
    cache: Arc<dyn SecureCache>,
    id: Serial,
    name: String,
    scope: Serial,
    ttl: Option<u32>,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Key {
    pub fn id(&self) -> Serial {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Serial {
        self.scope
    }

    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }

    pub fn get(&self) -> CacheResult<Zeroizing<Vec<u8>>> {
        self.cache.read(self.id)
    }

    /// Replace the payload; a key with a TTL has it restarted.
    pub fn set(&self, payload: &[u8]) -> CacheResult<()> {
        self.cache.update(self.id, payload)?;
        if let Some(secs) = self.ttl {
            self.cache.set_timeout(self.id, secs)?;
        }
        Ok(())
    }

    /// Expire after `secs` seconds and remember the TTL for later `set`s.
    pub fn expire_after(&mut self, secs: u32) -> CacheResult<()> {
        self.cache.set_timeout(self.id, secs)?;
        self.ttl = (secs > 0).then_some(secs);
        Ok(())
    }

    pub fn info(&self) -> CacheResult<Description> {
        self.cache.describe(self.id)
    }

    pub fn set_permission(&self, perm: Permission) -> CacheResult<()> {
        self.cache.set_permission(self.id, perm)
    }

    /// Additionally link this key into `scope`.
    pub fn link(&self, scope: &Scope) -> CacheResult<()> {
        self.cache.link(self.id, scope.id())
    }

    /// Unlink from the scope this key was reached through.
    pub fn unlink(&self) -> CacheResult<()> {
        self.cache.unlink(self.id, self.scope)
    }

    pub fn unlink_from(&self, scope: &Scope) -> CacheResult<()> {
        self.cache.unlink(self.id, scope.id())
    }

    pub fn reader(&self) -> KeyReader {
        KeyReader::new(self.clone())
    }

    pub fn writer(&self) -> KeyWriter {
        KeyWriter::update(self.clone())
    }
}

// ── Reference ────────────────────────────────────────────────────────────

/// What a [`Reference`] turned out to point at.
#[derive(Debug, Clone)]
pub enum Entry {
    Key(Key),
    /// An anonymous scope (no name, or a special negative serial).
    Scope(Scope),
    /// A named scope that can unlink itself from the listed parent.
    NamedScope(Scope),
}

/// An entry returned by [`Scope::list`], described lazily.
#[derive(Clone)]
pub struct Reference {
    cache: Arc<dyn SecureCache>,
    id: Serial,
    parent: Serial,
    info: Option<Description>,
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("info", &self.info)
            .finish()
    }
}

impl Reference {
    pub fn new(cache: Arc<dyn SecureCache>, id: Serial, parent: Serial) -> Self {
        Reference {
            cache,
            id,
            parent,
            info: None,
        }
    }

    pub fn id(&self) -> Serial {
        self.id
    }

    pub fn parent(&self) -> Serial {
        self.parent
    }

    /// Describe the referenced object; the first successful answer is kept.
    pub fn info(&mut self) -> CacheResult<&Description> {
        if self.info.is_none() {
            let desc = self.cache.describe(self.id).map_err(|e| match e {
                CacheError::Expired(_) | CacheError::NoSuchObject(_) => {
                    CacheError::InvalidReference
                }
                other => other,
            })?;
            self.info = Some(desc);
        }
        self.info.as_ref().ok_or(CacheError::InvalidReference)
    }

    pub fn is_valid(&mut self) -> bool {
        self.info().is_ok()
    }

    /// Materialize the referenced object.
    pub fn resolve(&mut self) -> CacheResult<Entry> {
        let cache = self.cache.clone();
        let (id, parent) = (self.id, self.parent);
        let info = self.info()?;
        match &info.kind {
            ObjectKind::Key => Ok(Entry::Key(Key {
                cache,
                id,
                name: info.name.clone(),
                scope: parent,
                ttl: None,
            })),
            ObjectKind::Scope => {
                let named = id.0 > 0 && !info.name.is_empty();
                let scope = Scope {
                    cache,
                    id,
                    name: named.then(|| info.name.clone()),
                    parent: named.then_some(parent),
                    default_ttl: None,
                };
                Ok(if named {
                    Entry::NamedScope(scope)
                } else {
                    Entry::Scope(scope)
                })
            }
            ObjectKind::Unsupported(_) => Err(CacheError::UnsupportedObjectKind),
        }
    }
}
