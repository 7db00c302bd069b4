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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::object::{CacheObject, ObjectId};

/// Owner of all live cache objects, addressed by [`ObjectId`].
///
/// Runtime tasks streaming a peer reply keep their own reference, so a destroyed object stays alive until its
/// in-flight fetch resolves.
#[derive(Debug, Default)]
pub struct ObjectArena {
    objects: RwLock<HashMap<ObjectId, Arc<CacheObject>>>,
    next: AtomicU64,
}

impl ObjectArena {
    /// Allocate a new object.
    pub fn insert(&self, key: Bytes, async_mode: bool) -> Arc<CacheObject> {
        let id = ObjectId::new(self.next.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(CacheObject::new(id, key, async_mode));
        self.objects.write().insert(id, object.clone());
        object
    }

    /// Look up an object.
    pub fn get(&self, id: ObjectId) -> Option<Arc<CacheObject>> {
        self.objects.read().get(&id).cloned()
    }

    /// Remove an object from the arena.
    pub fn remove(&self, id: ObjectId) -> Option<Arc<CacheObject>> {
        self.objects.write().remove(&id)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the arena holds no object.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
