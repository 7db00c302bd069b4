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

pub use shardcache_common::{
    error::{Error, ErrorKind, Result},
    metrics::model::{Counters, Metrics},
    spawn::Spawner,
};
pub use shardcache_memory::{
    listener, Backend, BoxedListener, CacheObject, FetchListener, Fetched, ListenerControl, ListenerEvent,
    MigrationOwner, ObjectId, ObjectState, Owner, PeerFetcher, Phase, Policy, Storage, Topology, VolatileStore,
    VolatileTable,
};
pub use shardcache_net::{
    AuthKey, Codec, ConnectionPool, Message, Opcode, PeerAddr, PeerClient, PeerConfig, PooledConnection, TcpConnector,
};

pub use crate::{builder::ShardCacheBuilder, cache::ShardCache};
