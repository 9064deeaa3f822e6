//! `io::Read` / `io::Write` adapters over cached keys.

use std::io::{self, Read, Write};
use zeroize::Zeroizing;

use crate::error::CacheResult;
use crate::scope::{Key, Scope};

/// Reads a key's payload, fetching it on first read.
pub struct KeyReader {
    key: Key,
    payload: Option<Zeroizing<Vec<u8>>>,
    pos: usize,
}

impl KeyReader {
    pub fn new(key: Key) -> Self {
        KeyReader {
            key,
            payload: None,
            pos: 0,
        }
    }
}

impl Read for KeyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.payload.is_none() {
            self.payload = Some(self.key.get()?);
        }
        let Some(payload) = self.payload.as_ref() else {
            return Ok(0);
        };
        let remaining = &payload[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

enum Target {
    Existing(Key),
    Pending { scope: Scope, name: String },
}

/// Buffers writes and stores the whole buffer as the key payload on
/// [`KeyWriter::commit`] (or `flush`).
pub struct KeyWriter {
    target: Target,
    buf: Zeroizing<Vec<u8>>,
}

impl KeyWriter {
    /// Write to a key that already exists; its TTL restarts on commit.
    pub fn update(key: Key) -> Self {
        KeyWriter {
            target: Target::Existing(key),
            buf: Zeroizing::new(Vec::with_capacity(1024)),
        }
    }

    /// Write to key `name` in `scope`, adding it on the first commit.
    pub fn create(scope: Scope, name: &str) -> Self {
        KeyWriter {
            target: Target::Pending {
                scope,
                name: name.to_string(),
            },
            buf: Zeroizing::new(Vec::with_capacity(1024)),
        }
    }

    /// Persist everything written so far and return the key written to.
    pub fn commit(&mut self) -> CacheResult<Key> {
        let key = match &self.target {
            Target::Existing(key) => {
                key.set(&self.buf)?;
                key.clone()
            }
            Target::Pending { scope, name } => scope.add(name, &self.buf)?,
        };
        self.target = Target::Existing(key.clone());
        Ok(key)
    }
}

impl Write for KeyWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit()?;
        Ok(())
    }
}
