//! Registry-backed secure cache.
//!
//! Object metadata (kind, name, permission, expiry, links) lives in an
//! in-memory registry guarded by one mutex per cache instance. Payload bytes
//! and, for persistent stores, the serialized registry itself are delegated
//! to a [`PayloadStore`].
//!
//! Every call that names an object first collects whatever has expired, so
//! an expired payload is dropped from the [`PayloadStore`] as soon as anyone
//! touches the cache. A serial listed before its expiry can still turn out to
//! be gone when it is described.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zeroize::Zeroizing;

use crate::cache::{Description, Found, ObjectKind, SecureCache, Serial};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::perms::Permission;

const SESSION_NAME: &str = "_ses";

/// Possessor may do anything, the owning user may view.
const DEFAULT_PERM: Permission =
    Permission(Permission::POSSESSOR_ALL.0 | Permission::USER_VIEW.0);

/// Where payload bytes and the registry index are kept.
pub trait PayloadStore: Send + Sync {
    /// Whether the registry index must be written back after each mutation.
    fn persistent(&self) -> bool {
        true
    }

    fn load_index(&self) -> CacheResult<Option<Vec<u8>>>;

    fn store_index(&self, index: &[u8]) -> CacheResult<()>;

    fn get(&self, id: Serial) -> CacheResult<Zeroizing<Vec<u8>>>;

    fn put(&self, id: Serial, payload: &[u8]) -> CacheResult<()>;

    fn remove(&self, id: Serial) -> CacheResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Object {
    kind: ObjectKind,
    name: String,
    perm: Permission,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    parents: BTreeSet<Serial>,
    #[serde(default)]
    children: Vec<Serial>,
}

impl Object {
    fn expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    next_serial: i32,
    session: Option<Serial>,
    objects: BTreeMap<i32, Object>,
}

impl Registry {
    fn allocate(&mut self, kind: ObjectKind, name: &str) -> Serial {
        self.next_serial += 1;
        let id = Serial(self.next_serial);
        self.objects.insert(
            id.0,
            Object {
                kind,
                name: name.to_string(),
                perm: DEFAULT_PERM,
                expires_at: None,
                parents: BTreeSet::new(),
                children: Vec::new(),
            },
        );
        id
    }

    fn get(&self, id: Serial) -> CacheResult<&Object> {
        self.objects.get(&id.0).ok_or(CacheError::NoSuchObject(id))
    }

    fn get_mut(&mut self, id: Serial) -> CacheResult<&mut Object> {
        self.objects.get_mut(&id.0).ok_or(CacheError::NoSuchObject(id))
    }

    fn live(&self, id: Serial, now: u64) -> CacheResult<&Object> {
        let obj = self.get(id)?;
        if obj.expired(now) {
            return Err(CacheError::Expired(id));
        }
        Ok(obj)
    }

    fn live_scope(&self, id: Serial, now: u64) -> CacheResult<&Object> {
        let obj = self.live(id, now)?;
        if obj.kind != ObjectKind::Scope {
            return Err(CacheError::NotAScope(id));
        }
        Ok(obj)
    }

    fn attach(&mut self, id: Serial, scope: Serial) {
        if let Some(obj) = self.objects.get_mut(&id.0) {
            obj.parents.insert(scope);
        }
        if let Some(parent) = self.objects.get_mut(&scope.0) {
            if !parent.children.contains(&id) {
                parent.children.push(id);
            }
        }
    }

    /// Drop the link `scope -> id`; returns true when `id` is left unlinked.
    fn detach(&mut self, id: Serial, scope: Serial) -> bool {
        if let Some(parent) = self.objects.get_mut(&scope.0) {
            parent.children.retain(|c| *c != id);
        }
        match self.objects.get_mut(&id.0) {
            Some(obj) => {
                obj.parents.remove(&scope);
                obj.parents.is_empty()
            }
            None => false,
        }
    }

    fn find_child(&self, scope: Serial, kind: &ObjectKind, name: &str, now: u64) -> Option<Serial> {
        let parent = self.objects.get(&scope.0)?;
        parent.children.iter().copied().find(|child| {
            self.objects
                .get(&child.0)
                .map(|c| !c.expired(now) && &c.kind == kind && c.name == name)
                .unwrap_or(false)
        })
    }

    /// Breadth-first: direct children before nested scopes.
    fn search(&self, scope: Serial, kind: &ObjectKind, name: &str, now: u64) -> Option<Found> {
        let mut queue = VecDeque::from([scope]);
        let mut seen = BTreeSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let Some(obj) = self.objects.get(&current.0) else {
                continue;
            };
            for child in &obj.children {
                let Some(c) = self.objects.get(&child.0) else {
                    continue;
                };
                if c.expired(now) {
                    continue;
                }
                if &c.kind == kind && c.name == name {
                    return Some(Found {
                        id: *child,
                        scope: current,
                    });
                }
                if c.kind == ObjectKind::Scope {
                    queue.push_back(*child);
                }
            }
        }
        None
    }

    fn destroy(&mut self, id: Serial, removed: &mut Vec<Serial>) {
        let Some(obj) = self.objects.remove(&id.0) else {
            return;
        };
        removed.push(id);
        for parent in &obj.parents {
            if let Some(p) = self.objects.get_mut(&parent.0) {
                p.children.retain(|c| *c != id);
            }
        }
        for child in obj.children {
            let orphaned = match self.objects.get_mut(&child.0) {
                Some(c) => {
                    c.parents.remove(&id);
                    c.parents.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.destroy(child, removed);
            }
        }
    }

    fn collect_garbage(&mut self, now: u64) -> Vec<Serial> {
        let expired: Vec<Serial> = self
            .objects
            .iter()
            .filter(|(id, obj)| obj.expired(now) && self.session != Some(Serial(**id)))
            .map(|(id, _)| Serial(*id))
            .collect();
        let mut removed = Vec::new();
        for id in expired {
            self.destroy(id, &mut removed);
        }
        removed
    }
}

/// A [`SecureCache`] keeping metadata in a registry and payloads in `P`.
pub struct RegistryCache<P> {
    registry: Mutex<Registry>,
    payloads: P,
    clock: Arc<dyn Clock>,
    trace_calls: bool,
}

impl<P: PayloadStore> RegistryCache<P> {
    /// Open a cache over `payloads`, restoring its index when one was stored.
    pub fn new(payloads: P) -> CacheResult<Self> {
        let mut registry: Registry = match payloads.load_index()? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CacheError::Index(e.to_string()))?,
            None => Registry::default(),
        };
        if registry.session.is_none() {
            let id = registry.allocate(ObjectKind::Scope, SESSION_NAME);
            registry.session = Some(id);
            if payloads.persistent() {
                let bytes = serde_json::to_vec(&registry)
                    .map_err(|e| CacheError::Index(e.to_string()))?;
                payloads.store_index(&bytes)?;
            }
        }
        Ok(RegistryCache {
            registry: Mutex::new(registry),
            payloads,
            clock: Arc::new(SystemClock),
            trace_calls: false,
        })
    }

    /// A cache with a fresh session scope and no stored index.
    pub(crate) fn empty(payloads: P) -> Self {
        let mut registry = Registry::default();
        registry.session = Some(registry.allocate(ObjectKind::Scope, SESSION_NAME));
        RegistryCache {
            registry: Mutex::new(registry),
            payloads,
            clock: Arc::new(SystemClock),
            trace_calls: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit a trace event for every contract call made on this instance.
    pub fn with_trace_calls(mut self, on: bool) -> Self {
        self.trace_calls = on;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, registry: &Registry) -> CacheResult<()> {
        if !self.payloads.persistent() {
            return Ok(());
        }
        let bytes =
            serde_json::to_vec(registry).map_err(|e| CacheError::Index(e.to_string()))?;
        self.payloads.store_index(&bytes)
    }

    /// Collect expired objects and drop their payloads. Fails with
    /// `Expired` when `touched` was one of them.
    fn sweep(&self, now: u64, touched: Option<Serial>) -> CacheResult<()> {
        let mut reg = self.lock();
        let hit = touched.filter(|id| reg.objects.get(&id.0).is_some_and(|o| o.expired(now)));
        let removed = reg.collect_garbage(now);
        let stored = if removed.is_empty() {
            Ok(())
        } else {
            self.store(&reg)
        };
        drop(reg);

        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "collected expired objects");
        }
        self.discard(removed);
        stored?;
        match hit {
            Some(id) => Err(CacheError::Expired(id)),
            None => Ok(()),
        }
    }

    fn discard(&self, removed: Vec<Serial>) {
        for id in removed {
            if let Err(e) = self.payloads.remove(id) {
                tracing::warn!(serial = %id, "dropping payload of destroyed object: {e}");
            }
        }
    }

    fn trace(&self, op: &'static str, id: Serial, name: &str) {
        if self.trace_calls {
            tracing::trace!(op, serial = %id, name, "secure cache call");
        }
    }
}

impl<P: PayloadStore> SecureCache for RegistryCache<P> {
    fn session_scope(&self) -> CacheResult<Serial> {
        self.lock()
            .session
            .ok_or_else(|| CacheError::Index("no session scope".into()))
    }

    fn create_scope(&self, parent: Serial, name: &str) -> CacheResult<Serial> {
        let now = self.clock.now();
        let mut reg = self.lock();
        let mut removed = reg.collect_garbage(now);
        reg.live_scope(parent, now)?;

        if let Some(old) = reg.find_child(parent, &ObjectKind::Scope, name, now) {
            if reg.detach(old, parent) {
                reg.destroy(old, &mut removed);
            }
        }
        let id = reg.allocate(ObjectKind::Scope, name);
        reg.attach(id, parent);
        self.store(&reg)?;
        drop(reg);

        self.discard(removed);
        self.trace("create_scope", id, name);
        Ok(id)
    }

    fn add(&self, scope: Serial, name: &str, payload: &[u8]) -> CacheResult<Serial> {
        let now = self.clock.now();
        let mut reg = self.lock();
        let removed = reg.collect_garbage(now);
        reg.live_scope(scope, now)?;

        let id = match reg.find_child(scope, &ObjectKind::Key, name, now) {
            Some(existing) => {
                self.payloads.put(existing, payload)?;
                existing
            }
            None => {
                let id = reg.allocate(ObjectKind::Key, name);
                if let Err(e) = self.payloads.put(id, payload) {
                    reg.objects.remove(&id.0);
                    return Err(e);
                }
                reg.attach(id, scope);
                id
            }
        };
        self.store(&reg)?;
        drop(reg);

        self.discard(removed);
        self.trace("add", id, name);
        Ok(id)
    }

    fn search(&self, scope: Serial, kind: ObjectKind, name: &str) -> CacheResult<Found> {
        let now = self.clock.now();
        self.sweep(now, Some(scope))?;
        let reg = self.lock();
        reg.live_scope(scope, now)?;
        let found = reg.search(scope, &kind, name, now);
        drop(reg);

        match found {
            Some(hit) => {
                self.trace("search", hit.id, name);
                Ok(hit)
            }
            None => Err(CacheError::NotFound {
                scope,
                kind,
                name: name.to_string(),
            }),
        }
    }

    fn read(&self, id: Serial) -> CacheResult<Zeroizing<Vec<u8>>> {
        let now = self.clock.now();
        self.sweep(now, Some(id))?;
        let reg = self.lock();
        let obj = reg.live(id, now)?;
        self.trace("read", id, &obj.name);
        match &obj.kind {
            ObjectKind::Key => self.payloads.get(id),
            ObjectKind::Scope => Ok(Zeroizing::new(
                obj.children.iter().flat_map(|c| c.0.to_le_bytes()).collect(),
            )),
            ObjectKind::Unsupported(_) => Err(CacheError::UnsupportedObjectKind),
        }
    }

    fn update(&self, id: Serial, payload: &[u8]) -> CacheResult<()> {
        let now = self.clock.now();
        self.sweep(now, Some(id))?;
        let reg = self.lock();
        let obj = reg.live(id, now)?;
        if obj.kind != ObjectKind::Key {
            return Err(CacheError::UnsupportedObjectKind);
        }
        self.trace("update", id, &obj.name);
        self.payloads.put(id, payload)
    }

    fn set_timeout(&self, id: Serial, secs: u32) -> CacheResult<()> {
        let now = self.clock.now();
        let mut reg = self.lock();
        reg.live(id, now)?;
        let obj = reg.get_mut(id)?;
        obj.expires_at = (secs > 0).then(|| now + u64::from(secs));
        self.store(&reg)?;
        drop(reg);

        if self.trace_calls {
            tracing::trace!(op = "set_timeout", serial = %id, secs, "secure cache call");
        }
        Ok(())
    }

    fn set_permission(&self, id: Serial, perm: Permission) -> CacheResult<()> {
        let now = self.clock.now();
        let mut reg = self.lock();
        reg.live(id, now)?;
        reg.get_mut(id)?.perm = perm;
        self.store(&reg)?;
        drop(reg);

        if self.trace_calls {
            tracing::trace!(op = "set_permission", serial = %id, perm = %perm, "secure cache call");
        }
        Ok(())
    }

    fn link(&self, id: Serial, scope: Serial) -> CacheResult<()> {
        let now = self.clock.now();
        let mut reg = self.lock();
        reg.live_scope(scope, now)?;
        reg.live(id, now)?;
        reg.attach(id, scope);
        self.store(&reg)?;
        drop(reg);

        self.trace("link", id, "");
        Ok(())
    }

    fn unlink(&self, id: Serial, scope: Serial) -> CacheResult<()> {
        let mut reg = self.lock();
        if !reg.get(id)?.parents.contains(&scope) {
            return Err(CacheError::NotLinked { object: id, scope });
        }
        let mut removed = Vec::new();
        if reg.detach(id, scope) {
            reg.destroy(id, &mut removed);
        }
        self.store(&reg)?;
        drop(reg);

        self.discard(removed);
        self.trace("unlink", id, "");
        Ok(())
    }

    fn list(&self, scope: Serial) -> CacheResult<Vec<Serial>> {
        let now = self.clock.now();
        self.sweep(now, Some(scope))?;
        let reg = self.lock();
        Ok(reg.live_scope(scope, now)?.children.clone())
    }

    fn describe(&self, id: Serial) -> CacheResult<Description> {
        let now = self.clock.now();
        self.sweep(now, Some(id))?;
        let reg = self.lock();
        let obj = reg.live(id, now)?;
        Ok(Description {
            kind: obj.kind.clone(),
            perm: obj.perm,
            name: obj.name.clone(),
        })
    }
}
