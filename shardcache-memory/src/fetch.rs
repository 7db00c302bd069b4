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
    sync::{Arc, Weak},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use parking_lot::MutexGuard;
use shardcache_common::{
    error::{Error, ErrorKind, Result},
    metrics::model::Metrics,
    spawn::Spawner,
    strict_assert,
};
use shardcache_net::{PeerAddr, PeerClient, PooledConnection};

use crate::{
    arena::ObjectArena,
    backend::{Backend, Fetched, Policy},
    listener::{BoxedListener, ListenerEvent},
    object::{CacheObject, ObjectId, ObjectState, Phase},
    storage::Storage,
    topology::{MigrationOwner, Owner, Topology},
    volatile::VolatileStore,
};

/// Default number of value bytes dumped by debug logs.
pub const DEFAULT_MAX_DUMP_LEN: usize = 128;

/// Collaborators of a [`PeerFetcher`].
#[derive(Debug)]
pub struct PeerFetcherConfig {
    /// Client used for peer requests.
    pub client: PeerClient,
    /// Ring view deciding which node serves a key.
    pub topology: Arc<dyn Topology>,
    /// Persistent storage for locally served keys.
    pub storage: Option<Arc<dyn Storage>>,
    /// Whether every node sees the same storage, so any node can serve any key from it.
    pub shared_storage: bool,
    /// Volatile table consulted before the storage.
    pub volatile: Option<Arc<dyn VolatileStore>>,
    /// Runtime driving asynchronous peer fetches.
    pub spawner: Spawner,
    /// Fetch counters.
    pub metrics: Arc<Metrics>,
    /// Number of value bytes dumped by debug logs.
    pub max_dump_len: usize,
}

#[derive(Debug)]
struct Inner {
    arena: ObjectArena,
    client: PeerClient,
    topology: Arc<dyn Topology>,
    storage: Option<Arc<dyn Storage>>,
    shared_storage: bool,
    volatile: Option<Arc<dyn VolatileStore>>,
    spawner: Spawner,
    metrics: Arc<Metrics>,
    max_dump_len: usize,
}

/// Miss handler deciding between local retrieval and peer requests, and fanning results out to listeners.
///
/// Implements [`Backend`] for the eviction policy.
#[derive(Debug, Clone)]
pub struct PeerFetcher {
    inner: Arc<Inner>,
}

/// Effects to apply once the object lock is released.
#[derive(Debug, Default)]
struct Deferred {
    evicted: bool,
    remove: bool,
}

impl PeerFetcher {
    /// Create a fetcher.
    pub fn new(config: PeerFetcherConfig) -> Self {
        let inner = Inner {
            arena: ObjectArena::default(),
            client: config.client,
            topology: config.topology,
            storage: config.storage,
            shared_storage: config.shared_storage,
            volatile: config.volatile,
            spawner: config.spawner,
            metrics: config.metrics,
            max_dump_len: config.max_dump_len,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Look up a live object.
    pub fn object(&self, id: ObjectId) -> Option<Arc<CacheObject>> {
        self.inner.arena.get(id)
    }

    /// Arena of live objects.
    pub fn arena(&self) -> &ObjectArena {
        &self.inner.arena
    }

    /// Fetch counters.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    fn lookup(&self, id: ObjectId) -> Result<Arc<CacheObject>> {
        self.inner
            .arena
            .get(id)
            .ok_or_else(|| Error::new(ErrorKind::Config, "unknown object").with_context("object", id))
    }

    fn resolve(
        &self,
        object: &Arc<CacheObject>,
        state: &mut MutexGuard<'_, ObjectState>,
        policy: &Arc<dyn Policy>,
        deferred: &mut Deferred,
    ) -> Result<Fetched> {
        match self.inner.topology.test_ownership(object.key()) {
            Owner::Local => self.fetch_local(object, state, deferred),
            Owner::Ambiguous => {
                tracing::debug!(
                    "[peer fetch]: ownership of key {} is ambiguous, serve locally",
                    escape(object.key(), self.inner.max_dump_len)
                );
                self.fetch_local(object, state, deferred)
            }
            Owner::Remote(node) => self.fetch_remote_or_fallback(object, state, policy, node, deferred),
        }
    }

    fn fetch_remote_or_fallback(
        &self,
        object: &Arc<CacheObject>,
        state: &mut MutexGuard<'_, ObjectState>,
        policy: &Arc<dyn Policy>,
        node: String,
        deferred: &mut Deferred,
    ) -> Result<Fetched> {
        let key = object.key();
        let mut err = match self.fetch_remote(object, state, policy, &node) {
            Ok(fetched) => return Ok(fetched),
            Err(e) => e,
        };
        self.on_peer_error(key, &node, &err);

        let permit_local = match self.inner.topology.test_migration_ownership(key) {
            MigrationOwner::Remote(other) if other != node => {
                tracing::debug!(
                    "[peer fetch]: retry key {} on migration owner {other}",
                    escape(key, self.inner.max_dump_len)
                );
                self.inner.metrics.fallback.increase(1);
                match self.fetch_remote(object, state, policy, &other) {
                    Ok(fetched) => return Ok(fetched),
                    Err(e) => {
                        self.on_peer_error(key, &other, &e);
                        err = e;
                    }
                }
                false
            }
            MigrationOwner::Remote(_) => false,
            MigrationOwner::Local | MigrationOwner::Ambiguous => true,
        };

        if permit_local || (self.inner.shared_storage && self.inner.storage.is_some()) {
            tracing::debug!(
                "[peer fetch]: serve key {} locally after peer failure",
                escape(key, self.inner.max_dump_len)
            );
            self.inner.metrics.fallback.increase(1);
            return self.fetch_local(object, state, deferred);
        }
        Err(err)
    }

    fn on_peer_error(&self, key: &[u8], node: &str, err: &Error) {
        self.inner.metrics.peer_fetch_error.increase(1);
        tracing::warn!(
            "[peer fetch]: fetch key {} from {node} failed: {err}",
            escape(key, self.inner.max_dump_len)
        );
    }

    fn fetch_remote(
        &self,
        object: &Arc<CacheObject>,
        state: &mut MutexGuard<'_, ObjectState>,
        policy: &Arc<dyn Policy>,
        node: &str,
    ) -> Result<Fetched> {
        let addr = self
            .inner
            .topology
            .node_address(node)
            .ok_or_else(|| Error::new(ErrorKind::Config, "no address for node").with_context("node", node))?;
        let addr = self.inner.client.peer_addr(&addr)?;
        let conn = self.inner.client.connect(&addr)?;

        if state.async_mode {
            return Ok(self.spawn_remote(object, state, policy, conn));
        }
        self.fetch_remote_sync(object, state, addr, conn)
    }

    fn fetch_remote_sync(
        &self,
        object: &Arc<CacheObject>,
        state: &mut MutexGuard<'_, ObjectState>,
        addr: PeerAddr,
        mut conn: PooledConnection,
    ) -> Result<Fetched> {
        state.phase = Phase::RemoteSync;
        let start = Instant::now();
        let value = self
            .inner
            .client
            .fetch_on(conn.stream_mut(), object.key())
            .map_err(|e| e.with_context("peer", &addr))?;
        conn.release();
        self.inner.metrics.peer_fetch.increase(1);
        Metrics::record_duration(&self.inner.metrics.peer_fetch_duration, start.elapsed());

        if value.is_empty() {
            state.phase = Phase::Created;
            self.inner.metrics.fetch_not_found.increase(1);
            return Ok(Fetched::NotFound);
        }

        state.data = Some(BytesMut::from(&value[..]));
        state.complete();
        self.inner.metrics.fetch_miss.increase(1);
        self.dump(object.key(), &addr.to_string(), &value);
        Ok(Fetched::Ready(value.len()))
    }

    fn spawn_remote(
        &self,
        object: &Arc<CacheObject>,
        state: &mut MutexGuard<'_, ObjectState>,
        policy: &Arc<dyn Policy>,
        conn: PooledConnection,
    ) -> Fetched {
        state.phase = Phase::RemoteAsyncPending;
        state.epoch += 1;
        tracing::trace!(
            "[peer fetch]: stream key {} from {}",
            escape(object.key(), self.inner.max_dump_len),
            conn.peer()
        );
        let task = AsyncFetch {
            object: object.clone(),
            policy: Arc::downgrade(policy),
            client: self.inner.client.clone(),
            metrics: self.inner.metrics.clone(),
            epoch: state.epoch,
            max_dump_len: self.inner.max_dump_len,
        };
        let _ = self.inner.spawner.spawn(task.run(conn));
        self.inner.metrics.fetch_miss.increase(1);
        Fetched::Pending
    }

    fn fetch_local(
        &self,
        object: &Arc<CacheObject>,
        state: &mut MutexGuard<'_, ObjectState>,
        deferred: &mut Deferred,
    ) -> Result<Fetched> {
        state.phase = Phase::LocalLookup;
        let key = object.key();
        let start = Instant::now();

        let mut value = self.inner.volatile.as_ref().and_then(|v| v.get_copy(key));
        if value.is_none() {
            if let Some(storage) = self.inner.storage.as_ref() {
                value = storage
                    .fetch(key)
                    .map_err(|e| e.with_context("key", escape(key, self.inner.max_dump_len)))?;
            }
        }
        self.inner.metrics.local_fetch.increase(1);
        Metrics::record_duration(&self.inner.metrics.local_fetch_duration, start.elapsed());

        let value = match value {
            Some(value) if !value.is_empty() => value,
            _ => {
                state.phase = Phase::Created;
                state.notify_terminal(key, ListenerEvent::NotFound);
                deferred.evicted |= state.apply_deferred_eviction();
                self.inner.metrics.fetch_not_found.increase(1);
                return Ok(Fetched::NotFound);
            }
        };

        state.data = Some(BytesMut::from(&value[..]));
        let timestamp = state.complete();
        state.notify_data(key, &value);
        state.notify_terminal(
            key,
            ListenerEvent::Complete {
                len: value.len(),
                timestamp,
            },
        );
        deferred.evicted |= state.apply_deferred_eviction();
        self.inner.metrics.fetch_miss.increase(1);
        self.dump(key, "local", &value);
        Ok(Fetched::Ready(value.len()))
    }

    fn dump(&self, key: &[u8], source: &str, value: &[u8]) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                "[peer fetch]: fetched {} bytes for key {} from {source}: {}",
                value.len(),
                escape(key, self.inner.max_dump_len),
                escape(value, self.inner.max_dump_len)
            );
        }
    }

    fn apply(&self, key: &[u8], policy: &Arc<dyn Policy>, deferred: Deferred) {
        if deferred.evicted {
            self.inner.metrics.evict.increase(1);
        }
        if deferred.remove {
            policy.remove(key);
        }
    }
}

impl Backend for PeerFetcher {
    fn create(&self, key: &[u8], async_mode: bool) -> ObjectId {
        self.inner.arena.insert(Bytes::copy_from_slice(key), async_mode).id()
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "shardcache::memory::fetch"))]
    fn fetch(&self, id: ObjectId, policy: &Arc<dyn Policy>) -> Result<Fetched> {
        let object = self.lookup(id)?;
        let mut deferred = Deferred::default();

        let res = {
            let mut state = object.lock();
            if state.phase == Phase::RemoteAsyncPending {
                return Ok(Fetched::Pending);
            }
            if let Some(data) = state.data.as_ref() {
                return Ok(Fetched::Ready(data.len()));
            }

            let res = self.resolve(&object, &mut state, policy, &mut deferred);
            if let Err(e) = &res {
                state.phase = Phase::Created;
                if state.async_mode {
                    state.notify_error(object.key(), e);
                    deferred.evicted |= state.apply_deferred_eviction();
                    deferred.remove = true;
                }
            }
            res
        };

        self.apply(object.key(), policy, deferred);
        res
    }

    fn evict(&self, id: ObjectId) {
        let Some(object) = self.inner.arena.get(id) else {
            tracing::debug!("[peer fetch]: evict unknown object {id}");
            return;
        };
        let released = object.lock().request_eviction();
        if released {
            self.inner.metrics.evict.increase(1);
        }
    }

    fn destroy(&self, id: ObjectId) {
        if self.inner.arena.remove(id).is_none() {
            tracing::debug!("[peer fetch]: destroy unknown object {id}");
        }
    }

    fn subscribe(&self, id: ObjectId, listener: BoxedListener) -> Result<()> {
        let object = self.lookup(id)?;
        if object.lock().subscribe(object.key(), listener) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Config, "listeners require an async object").with_context("object", id))
        }
    }
}

/// Continuation of an asynchronous peer fetch, run as a runtime task.
struct AsyncFetch {
    object: Arc<CacheObject>,
    policy: Weak<dyn Policy>,
    client: PeerClient,
    metrics: Arc<Metrics>,
    epoch: u64,
    max_dump_len: usize,
}

impl AsyncFetch {
    async fn run(self, conn: PooledConnection) {
        let peer = conn.peer().clone();
        let start = Instant::now();
        let res = self
            .client
            .fetch_pooled(conn, self.object.key().clone(), |chunk| self.on_chunk(&chunk))
            .await;
        match res {
            Ok(len) => {
                self.metrics.peer_fetch.increase(1);
                Metrics::record_duration(&self.metrics.peer_fetch_duration, start.elapsed());
                self.on_complete(len, &peer);
            }
            Err(e) => self.on_error(e, &peer),
        }
    }

    /// Lock the object unless it has been evicted or refetched since this task started.
    fn lock_current(&self) -> Option<MutexGuard<'_, ObjectState>> {
        let state = self.object.lock();
        (state.epoch == self.epoch && state.phase == Phase::RemoteAsyncPending).then_some(state)
    }

    fn on_chunk(&self, chunk: &[u8]) {
        let Some(mut state) = self.lock_current() else {
            return;
        };
        state.append(chunk);
        state.notify_data(self.object.key(), chunk);
    }

    fn on_complete(&self, len: usize, peer: &PeerAddr) {
        let key = self.object.key();
        let (total, evicted) = {
            let Some(mut state) = self.lock_current() else {
                tracing::debug!("[peer fetch]: drop stale reply from {peer}");
                return;
            };
            let total = state.len();
            strict_assert!(total == len);
            if total == 0 {
                state.phase = Phase::Created;
                state.data = None;
                state.notify_terminal(key, ListenerEvent::NotFound);
            } else {
                let timestamp = state.complete();
                state.notify_terminal(key, ListenerEvent::Complete { len: total, timestamp });
            }
            (total, state.apply_deferred_eviction())
        };

        if evicted {
            self.metrics.evict.increase(1);
        }
        if total == 0 {
            self.metrics.fetch_not_found.increase(1);
        } else if tracing::enabled!(tracing::Level::DEBUG) {
            let value = self.object.value().unwrap_or_default();
            tracing::debug!(
                "[peer fetch]: fetched {total} bytes for key {} from {peer}: {}",
                escape(key, self.max_dump_len),
                escape(&value, self.max_dump_len)
            );
        }

        if let Some(policy) = self.policy.upgrade() {
            if total == 0 {
                policy.remove(key);
            } else {
                policy.update_size(key, total);
            }
        }
    }

    fn on_error(&self, e: Error, peer: &PeerAddr) {
        let key = self.object.key();
        self.metrics.peer_fetch_error.increase(1);
        tracing::warn!(
            "[peer fetch]: streaming key {} from {peer} failed: {e}",
            escape(key, self.max_dump_len)
        );

        let evicted = {
            let Some(mut state) = self.lock_current() else {
                return;
            };
            state.phase = Phase::Created;
            state.data = None;
            state.notify_error(key, &e);
            state.apply_deferred_eviction()
        };
        if evicted {
            self.metrics.evict.increase(1);
        }
        if let Some(policy) = self.policy.upgrade() {
            policy.remove(key);
        }
    }
}

/// Printable form of `data`, escaping non-printable bytes and truncating after `limit` bytes.
pub fn escape(data: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(data.len().min(limit));
    for b in data.iter().take(limit) {
        out.extend(std::ascii::escape_default(*b).map(char::from));
    }
    if data.len() > limit {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use hashbrown::HashMap;
    use shardcache_net::{AuthKey, Codec, PeerConfig, TcpConnector};

    use super::*;
    use crate::{
        test_utils::{
            dead_addr, FakePeer, ListenerLog, MapStorage, PolicyEvent, RecordedEvent, RecordingPolicy, StaticTopology,
        },
        volatile::VolatileTable,
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn codec() -> Codec {
        Codec::new(
            AuthKey::new("fetch-secret"),
            PeerConfig::default()
                .with_connect_timeout(Duration::from_secs(1))
                .with_io_timeout(Duration::from_secs(5)),
        )
    }

    fn fetcher(
        topology: StaticTopology,
        storage: Option<Arc<MapStorage>>,
        shared_storage: bool,
        volatile: Option<Arc<VolatileTable>>,
    ) -> PeerFetcher {
        let codec = codec();
        let pool = Arc::new(TcpConnector::new(codec.config()));
        PeerFetcher::new(PeerFetcherConfig {
            client: PeerClient::new(codec, pool),
            topology: Arc::new(topology),
            storage: storage.map(|s| s as Arc<dyn Storage>),
            shared_storage,
            volatile: volatile.map(|v| v as Arc<dyn VolatileStore>),
            spawner: Spawner::dedicated("shardcache-test", 2).unwrap(),
            metrics: Arc::new(Metrics::noop()),
            max_dump_len: DEFAULT_MAX_DUMP_LEN,
        })
    }

    fn peer(values: &[(&[u8], &[u8])], delay: Duration) -> FakePeer {
        let values: HashMap<_, _> = values.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        FakePeer::spawn(codec(), values, delay)
    }

    /// Policy callbacks run after listeners are notified.
    fn wait_policy(recording: &RecordingPolicy) -> Vec<PolicyEvent> {
        let deadline = std::time::Instant::now() + WAIT;
        loop {
            let events = recording.events();
            if !events.is_empty() {
                return events;
            }
            assert!(std::time::Instant::now() < deadline, "policy never called");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn policy() -> (Arc<RecordingPolicy>, Arc<dyn Policy>) {
        let recording = Arc::new(RecordingPolicy::default());
        let policy: Arc<dyn Policy> = recording.clone();
        (recording, policy)
    }

    #[test_log::test]
    fn test_local_volatile_then_storage() {
        let volatile = Arc::new(VolatileTable::new());
        volatile.insert(&b"hot"[..], b"from-volatile".to_vec(), Duration::from_secs(60));
        let storage = Arc::new(MapStorage::default().with(b"cold", b"from-storage"));
        let fetcher = fetcher(StaticTopology::local(), Some(storage.clone()), false, Some(volatile));
        let (_, policy) = policy();

        let hot = fetcher.create(b"hot", false);
        assert_eq!(fetcher.fetch(hot, &policy).unwrap(), Fetched::Ready(13));
        assert_eq!(storage.fetches(), 0);

        let cold = fetcher.create(b"cold", false);
        assert_eq!(fetcher.fetch(cold, &policy).unwrap(), Fetched::Ready(12));
        assert_eq!(storage.fetches(), 1);

        // Resident data short-circuits.
        assert_eq!(fetcher.fetch(cold, &policy).unwrap(), Fetched::Ready(12));
        assert_eq!(storage.fetches(), 1);

        let object = fetcher.object(cold).unwrap();
        assert_eq!(object.value().unwrap(), &b"from-storage"[..]);
        assert_eq!(object.lock().phase(), Phase::Complete);
        assert!(object.lock().timestamp().is_some());

        let missing = fetcher.create(b"missing", false);
        assert_eq!(fetcher.fetch(missing, &policy).unwrap(), Fetched::NotFound);

        let counters = fetcher.metrics().snapshot();
        assert_eq!(counters.cache_misses, 2);
        assert_eq!(counters.not_found, 1);
        assert_eq!(counters.local_fetches, 3);
    }

    #[test_log::test]
    fn test_local_async_notifies_listeners() {
        let storage = Arc::new(MapStorage::default().with(b"key", b"value"));
        let fetcher = fetcher(StaticTopology::local(), Some(storage), false, None);
        let (recording, policy) = policy();
        let log = ListenerLog::default();

        let id = fetcher.create(b"key", true);
        fetcher.subscribe(id, log.listener()).unwrap();
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(5));
        assert_eq!(
            log.events(),
            vec![RecordedEvent::Data(b"value".to_vec()), RecordedEvent::Complete(5)]
        );
        // Local completion reports its size through the return value only.
        assert!(recording.events().is_empty());

        let missing = fetcher.create(b"missing", true);
        let log = ListenerLog::default();
        fetcher.subscribe(missing, log.listener()).unwrap();
        assert_eq!(fetcher.fetch(missing, &policy).unwrap(), Fetched::NotFound);
        assert_eq!(log.events(), vec![RecordedEvent::NotFound]);
    }

    #[test_log::test]
    fn test_remote_sync() {
        let peer = peer(&[(&b"key"[..], &b"remote-value"[..])], Duration::ZERO);
        let fetcher = fetcher(StaticTopology::remote("a", peer.addr()), None, false, None);
        let (_, policy) = policy();

        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(12));
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(12));
        assert_eq!(peer.requests(), 1);
        assert_eq!(fetcher.object(id).unwrap().value().unwrap(), &b"remote-value"[..]);

        // An empty reply means the owner has nothing.
        let missing = fetcher.create(b"missing", false);
        assert_eq!(fetcher.fetch(missing, &policy).unwrap(), Fetched::NotFound);

        let counters = fetcher.metrics().snapshot();
        assert_eq!(counters.peer_fetches, 2);
        assert_eq!(counters.cache_misses, 1);
        assert_eq!(counters.not_found, 1);
    }

    #[test_log::test]
    fn test_remote_sync_single_flight() {
        let peer = peer(&[(&b"key"[..], &b"slow-value"[..])], Duration::from_millis(200));
        let fetcher = fetcher(StaticTopology::remote("a", peer.addr()), None, false, None);
        let (_, policy) = policy();
        let id = fetcher.create(b"key", false);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = fetcher.clone();
                let policy = policy.clone();
                thread::spawn(move || fetcher.fetch(id, &policy).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Fetched::Ready(10));
        }
        assert_eq!(peer.requests(), 1);
        assert_eq!(fetcher.metrics().snapshot().cache_misses, 1);
    }

    #[test_log::test]
    fn test_remote_async_streaming() {
        let value: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let peer = peer(&[(&b"key"[..], &value[..])], Duration::from_millis(100));
        let fetcher = fetcher(StaticTopology::remote("a", peer.addr()), None, false, None);
        let (recording, policy) = policy();
        let id = fetcher.create(b"key", true);

        let first = ListenerLog::default();
        let second = ListenerLog::default();
        fetcher.subscribe(id, first.listener()).unwrap();
        fetcher.subscribe(id, second.listener()).unwrap();

        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Pending);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Pending);

        for log in [&first, &second] {
            let events = log.wait_terminal(1, WAIT);
            assert_eq!(events.last(), Some(&RecordedEvent::Complete(value.len())));
            assert_eq!(log.data(), value);
        }
        assert_eq!(peer.requests(), 1);
        assert_eq!(
            wait_policy(&recording),
            vec![PolicyEvent::UpdateSize(b"key".to_vec(), value.len())]
        );

        // Late subscribers get the full value replayed.
        let late = ListenerLog::default();
        fetcher.subscribe(id, late.listener()).unwrap();
        assert_eq!(late.events(), vec![RecordedEvent::Data(value.clone()), RecordedEvent::Complete(value.len())]);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(value.len()));
    }

    #[test_log::test]
    fn test_remote_async_empty_reply() {
        let peer = peer(&[], Duration::ZERO);
        let fetcher = fetcher(StaticTopology::remote("a", peer.addr()), None, false, None);
        let (recording, policy) = policy();
        let id = fetcher.create(b"missing", true);
        let log = ListenerLog::default();
        fetcher.subscribe(id, log.listener()).unwrap();

        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Pending);
        assert_eq!(log.wait_terminal(1, WAIT), vec![RecordedEvent::NotFound]);
        assert_eq!(wait_policy(&recording), vec![PolicyEvent::Remove(b"missing".to_vec())]);
    }

    #[test_log::test]
    fn test_remote_async_forged_reply() {
        let forged = FakePeer::spawn(
            Codec::new(AuthKey::new("intruder"), PeerConfig::default()),
            [(b"key".to_vec(), b"forged".to_vec())].into_iter().collect(),
            Duration::ZERO,
        );
        let fetcher = fetcher(StaticTopology::remote("a", forged.addr()), None, false, None);
        let (recording, policy) = policy();
        let id = fetcher.create(b"key", true);
        let log = ListenerLog::default();
        fetcher.subscribe(id, log.listener()).unwrap();

        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Pending);
        // The intruder rejects our request, so the connection closes without a reply.
        let events = log.wait_terminal(1, WAIT);
        assert!(matches!(events.last(), Some(RecordedEvent::Error(_))));
        assert_eq!(wait_policy(&recording), vec![PolicyEvent::Remove(b"key".to_vec())]);

        let object = fetcher.object(id).unwrap();
        assert!(object.lock().data().is_none());
        assert_eq!(object.lock().phase(), Phase::Created);
        assert_eq!(fetcher.metrics().snapshot().peer_errors, 1);
    }

    #[test_log::test]
    fn test_remote_async_start_failure() {
        let fetcher = fetcher(StaticTopology::remote("a", &dead_addr()), None, false, None);
        let (recording, policy) = policy();
        let id = fetcher.create(b"key", true);
        let log = ListenerLog::default();
        fetcher.subscribe(id, log.listener()).unwrap();

        let err = fetcher.fetch(id, &policy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(log.events(), vec![RecordedEvent::Error(ErrorKind::Transport)]);
        assert_eq!(recording.events(), vec![PolicyEvent::Remove(b"key".to_vec())]);
    }

    #[test_log::test]
    fn test_fallback_to_local() {
        let storage = Arc::new(MapStorage::default().with(b"key", b"local-value"));
        let topology = StaticTopology::remote("a", &dead_addr()).with_migration(MigrationOwner::Local);
        let fetcher = fetcher(topology, Some(storage), false, None);
        let (_, policy) = policy();

        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(11));
        let counters = fetcher.metrics().snapshot();
        assert_eq!(counters.peer_errors, 1);
        assert_eq!(counters.fallbacks, 1);
        assert_eq!(counters.local_fetches, 1);
    }

    #[test_log::test]
    fn test_fallback_when_ambiguous() {
        let storage = Arc::new(MapStorage::default().with(b"key", b"local-value"));
        let topology = StaticTopology::remote("a", &dead_addr()).with_migration(MigrationOwner::Ambiguous);
        let fetcher = fetcher(topology, Some(storage), false, None);
        let (_, policy) = policy();

        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(11));
    }

    #[test_log::test]
    fn test_ambiguous_owner_served_locally() {
        let storage = Arc::new(MapStorage::default().with(b"key", b"local-value"));
        let fetcher = fetcher(StaticTopology::ambiguous(), Some(storage.clone()), false, None);
        let (_, policy) = policy();

        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(11));
        assert_eq!(storage.fetches(), 1);

        let counters = fetcher.metrics().snapshot();
        assert_eq!(counters.local_fetches, 1);
        assert_eq!(counters.peer_fetches, 0);
        assert_eq!(counters.peer_errors, 0);
        assert_eq!(counters.fallbacks, 0);
    }

    #[test_log::test]
    fn test_fallback_to_migration_owner() {
        let peer = peer(&[(&b"key"[..], &b"migrated"[..])], Duration::ZERO);
        let topology = StaticTopology::remote("a", &dead_addr())
            .with_node("b", peer.addr())
            .with_migration(MigrationOwner::Remote("b".to_string()));
        let fetcher = fetcher(topology, None, false, None);
        let (_, policy) = policy();

        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(8));
        assert_eq!(peer.requests(), 1);
    }

    #[test_log::test]
    fn test_no_fallback_without_permission() {
        let storage = Arc::new(MapStorage::default().with(b"key", b"local-value"));
        let topology = StaticTopology::remote("a", &dead_addr());

        let fetcher = fetcher_with(topology, storage.clone(), false);
        let (_, policy) = policy();
        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(storage.fetches(), 0);
        assert_eq!(fetcher.object(id).unwrap().lock().phase(), Phase::Created);

        // Shared storage can serve any key.
        let topology = StaticTopology::remote("a", &dead_addr());
        let fetcher = fetcher_with(topology, storage.clone(), true);
        let id = fetcher.create(b"key", false);
        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(11));
        assert_eq!(storage.fetches(), 1);
    }

    fn fetcher_with(topology: StaticTopology, storage: Arc<MapStorage>, shared: bool) -> PeerFetcher {
        fetcher(topology, Some(storage), shared, None)
    }

    #[test_log::test]
    fn test_unknown_node() {
        let topology =
            StaticTopology::remote("a", &dead_addr()).with_migration(MigrationOwner::Remote("ghost".to_string()));
        let fetcher = fetcher(topology, None, false, None);
        let (_, policy) = policy();
        let id = fetcher.create(b"key", false);

        let err = fetcher.fetch(id, &policy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.context().iter().any(|(k, v)| *k == "node" && v == "ghost"));
        assert_eq!(fetcher.metrics().snapshot().peer_errors, 2);
    }

    #[test_log::test]
    fn test_deferred_eviction() {
        let peer = peer(&[(&b"key"[..], &b"value"[..])], Duration::from_millis(200));
        let fetcher = fetcher(StaticTopology::remote("a", peer.addr()), None, false, None);
        let (recording, policy) = policy();
        let id = fetcher.create(b"key", true);
        let log = ListenerLog::default();
        fetcher.subscribe(id, log.listener()).unwrap();

        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Pending);
        fetcher.evict(id);
        let object = fetcher.object(id).unwrap();
        assert!(object.lock().is_eviction_pending());
        assert_eq!(fetcher.metrics().snapshot().evicts, 0);

        assert_eq!(log.wait_terminal(1, WAIT).last(), Some(&RecordedEvent::Complete(5)));
        // Listeners saw the full value before the deferred eviction released it.
        assert_eq!(log.data(), b"value");
        assert_eq!(wait_policy(&recording), vec![PolicyEvent::UpdateSize(b"key".to_vec(), 5)]);
        let state = object.lock();
        assert_eq!(state.phase(), Phase::Evicted);
        assert!(state.data().is_none());
        assert!(!state.is_complete());
        assert!(!state.is_async());
        assert!(!state.is_eviction_pending());
        drop(state);
        assert_eq!(fetcher.metrics().snapshot().evicts, 1);
    }

    #[test_log::test]
    fn test_evict_and_destroy() {
        let storage = Arc::new(MapStorage::default().with(b"key", b"value"));
        let fetcher = fetcher(StaticTopology::local(), Some(storage), false, None);
        let (_, policy) = policy();

        let id = fetcher.create(b"key", false);
        // Nothing to release yet.
        fetcher.evict(id);
        assert_eq!(fetcher.metrics().snapshot().evicts, 0);

        assert_eq!(fetcher.fetch(id, &policy).unwrap(), Fetched::Ready(5));
        fetcher.evict(id);
        assert_eq!(fetcher.metrics().snapshot().evicts, 1);
        assert!(fetcher.object(id).unwrap().value().is_none());

        fetcher.destroy(id);
        assert!(fetcher.object(id).is_none());
        assert!(fetcher.arena().is_empty());
        assert_eq!(fetcher.fetch(id, &policy).unwrap_err().kind(), ErrorKind::Config);
        // Unknown ids are ignored.
        fetcher.evict(id);
        fetcher.destroy(id);
    }

    #[test]
    fn test_subscribe_requires_async() {
        let fetcher = fetcher(StaticTopology::local(), None, false, None);
        let id = fetcher.create(b"key", false);
        let err = fetcher.subscribe(id, ListenerLog::default().listener()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(b"plain", 16), "plain");
        assert_eq!(escape(b"a\x00\n", 16), "a\\x00\\n");
        assert_eq!(escape(&[0x00, 0xff, b'z'], 16), "\\x00\\xffz");
        assert_eq!(escape(b"truncated", 4), "trun...");
    }
}
