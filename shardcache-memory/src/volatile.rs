// Copyright 2026 shardcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// In-memory table of short-lived values, consulted before persistent storage.
pub trait VolatileStore: Send + Sync + Debug + 'static {
    /// A private copy of the live value of `key`.
    fn get_copy(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// Value held by a [`VolatileTable`] until it expires.
#[derive(Debug, Clone)]
pub struct VolatileObject {
    data: Vec<u8>,
    expires_at: Instant,
}

impl VolatileObject {
    /// Value bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Expiration time.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// [`VolatileStore`] with per-entry time to live.
///
/// Expired entries are invisible to reads and dropped by [`VolatileTable::expire`].
#[derive(Debug, Default)]
pub struct VolatileTable {
    entries: RwLock<HashMap<Bytes, VolatileObject>>,
}

impl VolatileTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` for `key` for `ttl`, returning the replaced live value.
    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Vec<u8>>, ttl: Duration) -> Option<Vec<u8>> {
        let now = Instant::now();
        let object = VolatileObject {
            data: value.into(),
            expires_at: now + ttl,
        };
        self.entries
            .write()
            .insert(key.into(), object)
            .filter(|old| !old.is_expired(now))
            .map(|old| old.data)
    }

    /// Drop `key`, returning its live value.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .write()
            .remove(key)
            .filter(|old| !old.is_expired(Instant::now()))
            .map(|old| old.data)
    }

    /// Drop every entry expired at `now`, returning how many were dropped.
    pub fn expire(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, object| !object.is_expired(now));
        let expired = before - entries.len();
        if expired > 0 {
            tracing::trace!("[volatile]: expired {expired} entries");
        }
        expired
    }

    /// Number of entries, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table holds no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VolatileStore for VolatileTable {
    fn get_copy(&self, key: &[u8]) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        let object = entries.get(key)?;
        if object.is_expired(Instant::now()) {
            return None;
        }
        Some(object.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = VolatileTable::new();
        assert!(table.insert(&b"k"[..], b"v1".to_vec(), Duration::from_secs(60)).is_none());
        assert_eq!(
            table.insert(&b"k"[..], b"v2".to_vec(), Duration::from_secs(60)),
            Some(b"v1".to_vec())
        );

        let mut copy = table.get_copy(b"k").unwrap();
        copy[0] = b'x';
        assert_eq!(table.get_copy(b"k").unwrap(), b"v2");

        assert_eq!(table.remove(b"k"), Some(b"v2".to_vec()));
        assert!(table.get_copy(b"k").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_expiration() {
        let table = VolatileTable::new();
        table.insert(&b"short"[..], b"s".to_vec(), Duration::ZERO);
        table.insert(&b"long"[..], b"l".to_vec(), Duration::from_secs(3600));

        assert!(table.get_copy(b"short").is_none());
        assert_eq!(table.get_copy(b"long").unwrap(), b"l");
        assert_eq!(table.len(), 2);

        assert_eq!(table.expire(Instant::now()), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.expire(Instant::now() + Duration::from_secs(7200)), 1);
        assert!(table.is_empty());
    }
}
