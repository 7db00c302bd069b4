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

use std::{fmt::Debug, sync::Arc};

use shardcache_common::{
    error::{Error, ErrorKind, Result},
    metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, BoxedRegistry, RegistryOps},
    spawn::Spawner,
};
use shardcache_memory::{PeerFetcher, PeerFetcherConfig, Storage, Topology, VolatileStore, DEFAULT_MAX_DUMP_LEN};
use shardcache_net::{AuthKey, Codec, ConnectionPool, PeerClient, PeerConfig, TcpConnector};

use crate::cache::ShardCache;

/// Worker threads of the runtime built when no spawner is given outside of a runtime.
const DEFAULT_WORKER_THREADS: usize = 2;

/// Shard cache node builder.
pub struct ShardCacheBuilder {
    name: String,
    secret: Vec<u8>,
    peer_config: PeerConfig,
    topology: Option<Arc<dyn Topology>>,
    storage: Option<Arc<dyn Storage>>,
    shared_storage: bool,
    volatile: Option<Arc<dyn VolatileStore>>,
    pool: Option<Arc<dyn ConnectionPool>>,
    spawner: Option<Spawner>,
    registry: BoxedRegistry,
    max_dump_len: usize,
}

impl Debug for ShardCacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCacheBuilder")
            .field("name", &self.name)
            .field("peer_config", &self.peer_config)
            .field("topology", &self.topology)
            .field("storage", &self.storage)
            .field("shared_storage", &self.shared_storage)
            .field("volatile", &self.volatile)
            .field("pool", &self.pool)
            .field("spawner", &self.spawner)
            .field("registry", &self.registry)
            .field("max_dump_len", &self.max_dump_len)
            .finish()
    }
}

impl Default for ShardCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardCacheBuilder {
    /// Create a new shard cache node builder.
    pub fn new() -> Self {
        Self {
            name: "shardcache".to_string(),
            secret: vec![],
            peer_config: PeerConfig::default(),
            topology: None,
            storage: None,
            shared_storage: false,
            volatile: None,
            pool: None,
            spawner: None,
            registry: Box::new(NoopMetricsRegistry),
            max_dump_len: DEFAULT_MAX_DUMP_LEN,
        }
    }

    /// Set the name of the node.
    ///
    /// The name labels the metrics of the node and the threads of its dedicated runtime.
    ///
    /// Default: `shardcache`.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the secret shared by all nodes, used to sign and verify peer messages.
    ///
    /// Only the first 16 bytes are used; shorter secrets are zero-padded.
    ///
    /// Default: empty secret.
    pub fn with_auth_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.secret = secret.as_ref().to_vec();
        self
    }

    /// Set the peer network settings.
    pub fn with_peer_config(mut self, config: PeerConfig) -> Self {
        self.peer_config = config;
        self
    }

    /// Set the ring view. Required.
    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Set the persistent storage.
    ///
    /// With `shared`, every node sees the same storage and may serve any key from it when the owner is unreachable.
    ///
    /// Default: no storage.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>, shared: bool) -> Self {
        self.storage = Some(storage);
        self.shared_storage = shared;
        self
    }

    /// Set the volatile table consulted before the storage.
    ///
    /// Default: no volatile table.
    pub fn with_volatile(mut self, volatile: Arc<dyn VolatileStore>) -> Self {
        self.volatile = Some(volatile);
        self
    }

    /// Set the connection pool.
    ///
    /// Default: a [`TcpConnector`] opening a connection per request.
    pub fn with_connection_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set where asynchronous peer fetches run.
    ///
    /// Default: the current runtime when built inside one, a dedicated runtime otherwise.
    pub fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Set the metrics registry.
    ///
    /// Default: [`NoopMetricsRegistry`].
    pub fn with_metrics_registry(mut self, registry: impl RegistryOps) -> Self {
        self.registry = Box::new(registry);
        self
    }

    /// Set how many value bytes debug logs dump.
    ///
    /// Default: [`DEFAULT_MAX_DUMP_LEN`].
    pub fn with_max_dump_len(mut self, len: usize) -> Self {
        self.max_dump_len = len;
        self
    }

    /// Build the node.
    pub fn build(self) -> Result<ShardCache> {
        let topology = self
            .topology
            .ok_or_else(|| Error::new(ErrorKind::Config, "topology is required").with_context("name", &self.name))?;
        if self.peer_config.max_record_len == 0 {
            return Err(Error::new(ErrorKind::Config, "max record length must be positive"));
        }

        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => match tokio::runtime::Handle::try_current() {
                Ok(handle) => Spawner::from(handle),
                Err(_) => Spawner::dedicated(&self.name, DEFAULT_WORKER_THREADS)?,
            },
        };
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(TcpConnector::new(&self.peer_config)));
        let codec = Codec::new(AuthKey::new(&self.secret), self.peer_config);
        let client = PeerClient::new(codec, pool);
        let metrics = Arc::new(Metrics::new(self.name.clone(), self.registry.as_ref()));

        tracing::debug!(
            "[shardcache]: build node {} (storage: {}, shared: {}, volatile: {})",
            self.name,
            self.storage.is_some(),
            self.shared_storage,
            self.volatile.is_some()
        );

        let fetcher = PeerFetcher::new(PeerFetcherConfig {
            client: client.clone(),
            topology: topology.clone(),
            storage: self.storage,
            shared_storage: self.shared_storage,
            volatile: self.volatile,
            spawner,
            metrics,
            max_dump_len: self.max_dump_len,
        });

        Ok(ShardCache::new(self.name, fetcher, client, topology))
    }
}
