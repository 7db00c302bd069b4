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

//! Utilities for testing.

use std::{
    net::TcpListener,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use shardcache_common::error::{ErrorKind, Result};
use shardcache_net::{Codec, Message, Opcode};

use crate::{
    backend::Policy,
    listener::{listener, BoxedListener, ListenerControl, ListenerEvent},
    storage::Storage,
    topology::{MigrationOwner, Owner, Topology},
};

/// A policy callback recorded by [`RecordingPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// `update_size(key, len)`.
    UpdateSize(Vec<u8>, usize),
    /// `remove(key)`.
    Remove(Vec<u8>),
}

/// A policy that records all callbacks.
#[derive(Debug, Default)]
pub struct RecordingPolicy {
    events: Mutex<Vec<PolicyEvent>>,
}

impl Policy for RecordingPolicy {
    fn update_size(&self, key: &[u8], len: usize) {
        self.events.lock().push(PolicyEvent::UpdateSize(key.to_vec(), len));
    }

    fn remove(&self, key: &[u8]) {
        self.events.lock().push(PolicyEvent::Remove(key.to_vec()));
    }
}

impl RecordingPolicy {
    /// Get all recorded callbacks.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().clone()
    }
}

/// A topology answering the same owner for every key.
#[derive(Debug)]
pub struct StaticTopology {
    owner: Owner,
    migration: MigrationOwner,
    nodes: HashMap<String, String>,
}

impl StaticTopology {
    /// Every key is owned by this node.
    pub fn local() -> Self {
        Self {
            owner: Owner::Local,
            migration: MigrationOwner::Local,
            nodes: HashMap::new(),
        }
    }

    /// The ring cannot tell who owns any key.
    pub fn ambiguous() -> Self {
        Self {
            owner: Owner::Ambiguous,
            migration: MigrationOwner::Ambiguous,
            nodes: HashMap::new(),
        }
    }

    /// Every key is owned by `node`, reachable at `addr`.
    pub fn remote(node: &str, addr: &str) -> Self {
        Self {
            owner: Owner::Remote(node.to_string()),
            migration: MigrationOwner::Remote(node.to_string()),
            nodes: HashMap::new(),
        }
        .with_node(node, addr)
    }

    /// Answer `migration` to migration-aware ownership tests.
    pub fn with_migration(mut self, migration: MigrationOwner) -> Self {
        self.migration = migration;
        self
    }

    /// Register the address of `node`.
    pub fn with_node(mut self, node: &str, addr: &str) -> Self {
        self.nodes.insert(node.to_string(), addr.to_string());
        self
    }
}

impl Topology for StaticTopology {
    fn test_ownership(&self, _: &[u8]) -> Owner {
        self.owner.clone()
    }

    fn test_migration_ownership(&self, _: &[u8]) -> MigrationOwner {
        self.migration.clone()
    }

    fn node_address(&self, node: &str) -> Option<String> {
        self.nodes.get(node).cloned()
    }
}

/// An in-memory storage counting its fetches.
#[derive(Debug, Default)]
pub struct MapStorage {
    values: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MapStorage {
    /// Store a value.
    pub fn with(self, key: &[u8], value: &[u8]) -> Self {
        self.values.lock().insert(key.to_vec(), value.to_vec());
        self
    }

    /// Number of fetches served so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl Storage for MapStorage {
    fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.values.lock().get(key).cloned())
    }
}

/// A listener event with owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    /// [`ListenerEvent::Data`].
    Data(Vec<u8>),
    /// [`ListenerEvent::Complete`].
    Complete(usize),
    /// [`ListenerEvent::NotFound`].
    NotFound,
    /// [`ListenerEvent::Error`].
    Error(ErrorKind),
}

/// Shared log of the events received by listeners built from it.
#[derive(Debug, Clone, Default)]
pub struct ListenerLog {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl ListenerLog {
    /// A listener appending to this log.
    pub fn listener(&self) -> BoxedListener {
        let events = self.events.clone();
        listener(move |_, event| {
            events.lock().push(match event {
                ListenerEvent::Data(data) => RecordedEvent::Data(data.to_vec()),
                ListenerEvent::Complete { len, .. } => RecordedEvent::Complete(len),
                ListenerEvent::NotFound => RecordedEvent::NotFound,
                ListenerEvent::Error(e) => RecordedEvent::Error(e.kind()),
            });
            ListenerControl::Continue
        })
    }

    /// All events so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Concatenated data events.
    pub fn data(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Data(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Block until `n` terminal events are logged, returning all events.
    ///
    /// # Panics
    ///
    /// Panics after `timeout`.
    pub fn wait_terminal(&self, n: usize, timeout: Duration) -> Vec<RecordedEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.events();
            let terminal = events.iter().filter(|e| !matches!(e, RecordedEvent::Data(_))).count();
            if terminal >= n {
                return events;
            }
            assert!(Instant::now() < deadline, "timed out waiting for listeners: {events:?}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// A peer node on a loopback socket serving `GET` from a fixed map.
#[derive(Debug)]
pub struct FakePeer {
    addr: String,
    requests: Arc<AtomicUsize>,
}

impl FakePeer {
    /// Start serving `values`, answering every `GET` after `delay`.
    ///
    /// Unknown keys are answered with an empty value. Other opcodes are acknowledged with `OK`.
    pub fn spawn(codec: Codec, values: HashMap<Vec<u8>, Vec<u8>>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(AtomicUsize::new(0));
        let values = Arc::new(values);
        {
            let requests = requests.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { return };
                    let codec = codec.clone();
                    let values = values.clone();
                    let requests = requests.clone();
                    std::thread::spawn(move || {
                        while let Ok(request) = codec.receive(&mut stream) {
                            requests.fetch_add(1, Ordering::SeqCst);
                            let reply = match request.opcode() {
                                Opcode::Get => {
                                    std::thread::sleep(delay);
                                    let value = values.get(&request.records()[0][..]).cloned().unwrap_or_default();
                                    Message::response(value)
                                }
                                _ => Message::response(&b"OK"[..]),
                            };
                            if codec.write_message(&mut stream, &reply).is_err() {
                                return;
                            }
                        }
                    });
                }
            });
        }
        Self { addr, requests }
    }

    /// `host:port` of the peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of requests received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// An address nothing listens on.
pub fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}
