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

use std::time::SystemTime;

use shardcache_common::error::Error;

/// What happened to an object a listener waits on.
#[derive(Debug, Clone, Copy)]
pub enum ListenerEvent<'a> {
    /// A slice of the value, in order.
    Data(&'a [u8]),
    /// The value is complete.
    Complete {
        /// Total value length.
        len: usize,
        /// Completion time.
        timestamp: SystemTime,
    },
    /// No source had a value for the key.
    NotFound,
    /// The fetch failed.
    Error(&'a Error),
}

impl ListenerEvent<'_> {
    /// Whether the event is the last one a listener receives.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ListenerEvent::Data(_))
    }
}

/// Answer of a listener to a [`ListenerEvent::Data`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    /// Keep delivering events.
    Continue,
    /// Unregister the listener.
    Stop,
}

/// Consumer of the result of an asynchronous fetch.
///
/// Every listener receives zero or more [`ListenerEvent::Data`] events followed by exactly one terminal event,
/// unless it answers [`ListenerControl::Stop`] earlier. Listeners are notified in registration order.
///
/// # Notes
///
/// Listeners run with the object lock held. They must not fetch, evict or subscribe to the object they listen on.
pub trait FetchListener: Send + 'static {
    /// Handle one event for `key`.
    fn on_event(&mut self, key: &[u8], event: ListenerEvent<'_>) -> ListenerControl;
}

impl<F> FetchListener for F
where
    F: FnMut(&[u8], ListenerEvent<'_>) -> ListenerControl + Send + 'static,
{
    fn on_event(&mut self, key: &[u8], event: ListenerEvent<'_>) -> ListenerControl {
        self(key, event)
    }
}

/// Boxed [`FetchListener`].
pub type BoxedListener = Box<dyn FetchListener>;

/// Box a closure as a listener.
pub fn listener<F>(f: F) -> BoxedListener
where
    F: FnMut(&[u8], ListenerEvent<'_>) -> ListenerControl + Send + 'static,
{
    Box::new(f)
}
