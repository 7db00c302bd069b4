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

use shardcache_common::{error::Result, metrics::model::Counters};
use shardcache_memory::{
    Backend, BoxedListener, CacheObject, Fetched, ObjectId, Owner, PeerFetcher, Policy, Topology,
};
use shardcache_net::PeerClient;

/// A shard cache node.
///
/// Implements [`Backend`] for the eviction policy of the node, and exposes the peer client for requests to other
/// nodes.
#[derive(Debug, Clone)]
pub struct ShardCache {
    name: Arc<str>,
    fetcher: PeerFetcher,
    client: PeerClient,
    topology: Arc<dyn Topology>,
}

impl ShardCache {
    pub(crate) fn new(name: String, fetcher: PeerFetcher, client: PeerClient, topology: Arc<dyn Topology>) -> Self {
        Self {
            name: name.into(),
            fetcher,
            client,
            topology,
        }
    }

    /// Name of the node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The miss handler of the node.
    pub fn fetcher(&self) -> &PeerFetcher {
        &self.fetcher
    }

    /// Client for requests to other nodes.
    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    /// Ring view of the node.
    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    /// Look up a live object.
    pub fn object(&self, id: ObjectId) -> Option<Arc<CacheObject>> {
        self.fetcher.object(id)
    }

    /// Copy of the fetch counters.
    pub fn stats(&self) -> Counters {
        self.fetcher.metrics().snapshot()
    }

    /// Address of the node owning `key`, or `None` if this node owns it.
    pub fn owner_address(&self, key: &[u8]) -> Option<String> {
        match self.topology.test_ownership(key) {
            Owner::Local | Owner::Ambiguous => None,
            Owner::Remote(node) => self.topology.node_address(&node),
        }
    }
}

impl Backend for ShardCache {
    fn create(&self, key: &[u8], async_mode: bool) -> ObjectId {
        self.fetcher.create(key, async_mode)
    }

    fn fetch(&self, id: ObjectId, policy: &Arc<dyn Policy>) -> Result<Fetched> {
        self.fetcher.fetch(id, policy)
    }

    fn evict(&self, id: ObjectId) {
        self.fetcher.evict(id)
    }

    fn destroy(&self, id: ObjectId) {
        self.fetcher.destroy(id)
    }

    fn subscribe(&self, id: ObjectId, listener: BoxedListener) -> Result<()> {
        self.fetcher.subscribe(id, listener)
    }
}
