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

use std::{collections::VecDeque, fmt::Debug, time::SystemTime};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use shardcache_common::{error::Error, strict_assert};

use crate::listener::{BoxedListener, ListenerControl, ListenerEvent};

/// Identifier of a [`CacheObject`] within an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an object is in its fetch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No fetch has populated the object.
    Created,
    /// Looking up the volatile table and the storage.
    LocalLookup,
    /// Blocked on a peer reply.
    RemoteSync,
    /// A peer reply is being streamed in by a runtime task.
    RemoteAsyncPending,
    /// The value is complete.
    Complete,
    /// The value has been released by an eviction.
    Evicted,
}

/// Mutable part of a [`CacheObject`], guarded by its lock.
pub struct ObjectState {
    pub(crate) data: Option<BytesMut>,
    pub(crate) complete: bool,
    pub(crate) async_mode: bool,
    pub(crate) listeners: Option<VecDeque<BoxedListener>>,
    pub(crate) pending_eviction: bool,
    pub(crate) timestamp: Option<SystemTime>,
    pub(crate) phase: Phase,
    /// Bumped by every asynchronous fetch so that a stale runtime task cannot touch a refetched object.
    pub(crate) epoch: u64,
}

impl Debug for ObjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectState")
            .field("len", &self.data.as_ref().map(|d| d.len()))
            .field("complete", &self.complete)
            .field("async_mode", &self.async_mode)
            .field("listeners", &self.listeners.as_ref().map(|l| l.len()))
            .field("pending_eviction", &self.pending_eviction)
            .field("timestamp", &self.timestamp)
            .field("phase", &self.phase)
            .finish()
    }
}

impl ObjectState {
    fn new(async_mode: bool) -> Self {
        Self {
            data: None,
            complete: false,
            async_mode,
            listeners: async_mode.then(VecDeque::new),
            pending_eviction: false,
            timestamp: None,
            phase: Phase::Created,
            epoch: 0,
        }
    }

    /// Value bytes received so far.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Length of the value bytes received so far.
    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or_default()
    }

    /// Whether no value bytes have been received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a fetch completed successfully.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the object uses asynchronous fetches.
    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    /// Whether an eviction waits for listeners to drain.
    pub fn is_eviction_pending(&self) -> bool {
        self.pending_eviction
    }

    /// Completion time of the last successful fetch.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.as_ref().map(|l| l.len()).unwrap_or_default()
    }

    pub(crate) fn append(&mut self, chunk: &[u8]) {
        self.data.get_or_insert_with(BytesMut::new).extend_from_slice(chunk);
    }

    /// Mark the value complete and stamp it.
    pub(crate) fn complete(&mut self) -> SystemTime {
        strict_assert!(!self.complete);
        let now = SystemTime::now();
        self.complete = true;
        self.timestamp = Some(now);
        self.phase = Phase::Complete;
        now
    }

    /// Deliver a chunk to every listener, dropping those that answer [`ListenerControl::Stop`].
    pub(crate) fn notify_data(&mut self, key: &[u8], chunk: &[u8]) {
        if let Some(listeners) = self.listeners.as_mut() {
            listeners.retain_mut(|l| l.on_event(key, ListenerEvent::Data(chunk)) == ListenerControl::Continue);
        }
    }

    /// Deliver a terminal event to every listener and unregister them all.
    pub(crate) fn notify_terminal(&mut self, key: &[u8], event: ListenerEvent<'_>) {
        strict_assert!(event.is_terminal());
        if let Some(listeners) = self.listeners.as_mut() {
            for mut listener in listeners.drain(..) {
                listener.on_event(key, event);
            }
        }
    }

    pub(crate) fn notify_error(&mut self, key: &[u8], error: &Error) {
        self.notify_terminal(key, ListenerEvent::Error(error));
    }

    /// Register a listener, replaying what the object already holds.
    ///
    /// Returns `false` if the object is not in async mode.
    pub(crate) fn subscribe(&mut self, key: &[u8], mut listener: BoxedListener) -> bool {
        if self.listeners.is_none() {
            return false;
        }
        if let Some(data) = self.data.as_deref() {
            if !data.is_empty() && listener.on_event(key, ListenerEvent::Data(data)) == ListenerControl::Stop {
                return true;
            }
        }
        if self.complete {
            let timestamp = self.timestamp.unwrap_or_else(SystemTime::now);
            listener.on_event(
                key,
                ListenerEvent::Complete {
                    len: self.len(),
                    timestamp,
                },
            );
            return true;
        }
        if let Some(listeners) = self.listeners.as_mut() {
            listeners.push_back(listener);
        }
        true
    }

    /// Evict now, or defer until listeners drain.
    ///
    /// Returns whether value bytes were released.
    pub(crate) fn request_eviction(&mut self) -> bool {
        if self.listener_count() > 0 {
            self.pending_eviction = true;
            return false;
        }
        self.evict()
    }

    /// Apply an eviction deferred by [`ObjectState::request_eviction`] once listeners are drained.
    pub(crate) fn apply_deferred_eviction(&mut self) -> bool {
        if self.pending_eviction && self.listener_count() == 0 {
            return self.evict();
        }
        false
    }

    fn evict(&mut self) -> bool {
        let released = self.data.take().is_some();
        self.complete = false;
        self.async_mode = false;
        self.pending_eviction = false;
        self.listeners = None;
        self.phase = Phase::Evicted;
        released
    }
}

/// One cached key and its value.
#[derive(Debug)]
pub struct CacheObject {
    id: ObjectId,
    key: Bytes,
    state: Mutex<ObjectState>,
}

impl CacheObject {
    pub(crate) fn new(id: ObjectId, key: Bytes, async_mode: bool) -> Self {
        Self {
            id,
            key,
            state: Mutex::new(ObjectState::new(async_mode)),
        }
    }

    /// Identifier of the object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Key of the object.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Lock the object state.
    pub fn lock(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    /// Copy of the value, if complete.
    pub fn value(&self) -> Option<Bytes> {
        let state = self.state.lock();
        match (&state.data, state.complete) {
            (Some(data), true) => Some(Bytes::copy_from_slice(data)),
            _ => None,
        }
    }
}
