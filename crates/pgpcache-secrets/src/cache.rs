//! The secure-cache contract every backend implements.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::CacheResult;
use crate::perms::Permission;

/// Identifier of one object (key or scope) inside a secure cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(pub i32);

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a serial refers to, as reported by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Key,
    Scope,
    /// Anything else a backend may hold; never dereferenced.
    Unsupported(String),
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Key => f.write_str("key"),
            ObjectKind::Scope => f.write_str("scope"),
            ObjectKind::Unsupported(kind) => f.write_str(kind),
        }
    }
}

/// Result of `describe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub kind: ObjectKind,
    pub perm: Permission,
    pub name: String,
}

/// A search hit: the object and the scope it is directly linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub id: Serial,
    pub scope: Serial,
}

/// Scoped named-secret storage with expiry and permission bits.
///
/// Implementations must be safe to call from several threads at once; no
/// caller-side serialization is assumed.
pub trait SecureCache: Send + Sync {
    /// The root scope of the current session.
    fn session_scope(&self) -> CacheResult<Serial>;

    /// Create a scope named `name` linked into `parent`.
    fn create_scope(&self, parent: Serial, name: &str) -> CacheResult<Serial>;

    /// Add a key to `scope`. A live key of the same name directly in `scope`
    /// is updated in place and keeps its serial.
    fn add(&self, scope: Serial, name: &str, payload: &[u8]) -> CacheResult<Serial>;

    /// Find an object by kind and name, descending into nested scopes.
    /// Expired objects are never returned.
    fn search(&self, scope: Serial, kind: ObjectKind, name: &str) -> CacheResult<Found>;

    fn read(&self, id: Serial) -> CacheResult<Zeroizing<Vec<u8>>>;

    fn update(&self, id: Serial, payload: &[u8]) -> CacheResult<()>;

    /// Expire `id` after `secs` seconds; zero clears any expiry.
    fn set_timeout(&self, id: Serial, secs: u32) -> CacheResult<()>;

    fn set_permission(&self, id: Serial, perm: Permission) -> CacheResult<()>;

    fn link(&self, id: Serial, scope: Serial) -> CacheResult<()>;

    /// Remove the link from `scope` to `id`; an object left without links is
    /// destroyed.
    fn unlink(&self, id: Serial, scope: Serial) -> CacheResult<()>;

    /// Serials directly linked into `scope`.
    fn list(&self, scope: Serial) -> CacheResult<Vec<Serial>>;

    fn describe(&self, id: Serial) -> CacheResult<Description>;
}
