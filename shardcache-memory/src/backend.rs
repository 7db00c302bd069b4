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

use std::sync::Arc;

use shardcache_common::error::Result;

use crate::{listener::BoxedListener, object::ObjectId};

/// Outcome of [`Backend::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    /// The value is resident, with its length.
    Ready(usize),
    /// A peer reply is being streamed in; listeners are told when it completes.
    Pending,
    /// No source had a value.
    NotFound,
}

/// Callbacks into the eviction policy that indexes the objects.
///
/// Always invoked without any object lock held.
pub trait Policy: Send + Sync + 'static {
    /// The value of `key` finished loading asynchronously with `len` bytes.
    fn update_size(&self, key: &[u8], len: usize);

    /// Drop `key` from the policy index, after a failed or empty asynchronous fetch.
    fn remove(&self, key: &[u8]);
}

/// Object lifecycle operations driven by the eviction policy.
pub trait Backend: Send + Sync + 'static {
    /// Allocate an object for `key`. Listeners can only be registered on objects created with `async_mode`.
    fn create(&self, key: &[u8], async_mode: bool) -> ObjectId;

    /// Populate the object on a miss.
    ///
    /// Concurrent calls for the same object never issue a second retrieval. `policy` is held weakly by an
    /// asynchronous fetch.
    fn fetch(&self, id: ObjectId, policy: &Arc<dyn Policy>) -> Result<Fetched>;

    /// Release the value of the object, or defer until its listeners are drained.
    fn evict(&self, id: ObjectId);

    /// Forget the object.
    fn destroy(&self, id: ObjectId);

    /// Register a listener on an async object.
    ///
    /// Data already received is replayed to the listener first.
    fn subscribe(&self, id: ObjectId, listener: BoxedListener) -> Result<()>;
}
