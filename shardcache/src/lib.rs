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

//! shardcache - the miss-handling core of a sharded peer cache node.
//!
//! When a key is not resident, the node asks its ring who owns the key, then fetches the value from the owning
//! peer over an authenticated binary protocol, or from its own volatile table and storage. Concurrent callers of
//! the same key share a single retrieval.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use shardcache::{Backend, ShardCacheBuilder, Topology};
//!
//! # fn run(topology: Arc<dyn Topology>, policy: Arc<dyn shardcache::Policy>) -> shardcache::Result<()> {
//! let node = ShardCacheBuilder::new()
//!     .with_name("node-a")
//!     .with_auth_secret("shared secret")
//!     .with_topology(topology)
//!     .build()?;
//!
//! let id = node.create(b"key", false);
//! let fetched = node.fetch(id, &policy)?;
//! # let _ = fetched;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cache;

mod prelude;
pub use prelude::*;

/// Common components of shardcache.
pub mod common {
    pub use shardcache_common::*;
}

/// Peer wire protocol and client.
pub mod net {
    pub use shardcache_net::*;
}

/// Cache object lifecycle and fetch coordinator.
pub mod memory {
    pub use shardcache_memory::*;
}
