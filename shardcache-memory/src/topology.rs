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

use std::fmt::Debug;

/// Owner of a key according to the current ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// This node.
    Local,
    /// Another node, by label.
    Remote(String),
    /// The ring cannot tell, e.g. while a shard migration is starting. The key is served locally.
    Ambiguous,
}

/// Owner of a key while a shard migration may be in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOwner {
    /// This node owns the key in the migration ring.
    Local,
    /// Another node owns the key in the migration ring.
    Remote(String),
    /// The migration ring cannot tell.
    Ambiguous,
}

/// View of the consistent-hash ring.
pub trait Topology: Send + Sync + Debug + 'static {
    /// Owner of `key` in the current ring.
    fn test_ownership(&self, key: &[u8]) -> Owner;

    /// Owner of `key` taking an ongoing migration into account.
    fn test_migration_ownership(&self, key: &[u8]) -> MigrationOwner;

    /// `host:port` address of node `node`.
    fn node_address(&self, node: &str) -> Option<String>;
}
