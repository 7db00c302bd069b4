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

pub use crate::{
    arena::ObjectArena,
    backend::{Backend, Fetched, Policy},
    fetch::{escape, PeerFetcher, PeerFetcherConfig, DEFAULT_MAX_DUMP_LEN},
    listener::{listener, BoxedListener, FetchListener, ListenerControl, ListenerEvent},
    object::{CacheObject, ObjectId, ObjectState, Phase},
    storage::Storage,
    topology::{MigrationOwner, Owner, Topology},
    volatile::{VolatileObject, VolatileStore, VolatileTable},
};
