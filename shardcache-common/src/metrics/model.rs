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
    borrow::Cow,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::metrics::{registry::noop::NoopMetricsRegistry, BoxedCounter, BoxedHistogram, RegistryOps};

/// A counter exported to the registry that also keeps a local tally for [`Metrics::snapshot`].
#[derive(Debug)]
pub struct Counter {
    local: AtomicU64,
    exported: BoxedCounter,
}

impl Counter {
    fn new(exported: BoxedCounter) -> Self {
        Self {
            local: AtomicU64::new(0),
            exported,
        }
    }

    /// Increase the counter by `val`.
    pub fn increase(&self, val: u64) {
        self.local.fetch_add(val, Ordering::Relaxed);
        self.exported.increase(val);
    }

    /// Current local value.
    pub fn get(&self) -> u64 {
        self.local.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of the fetch core counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Fetches that populated an object, locally or from a peer.
    pub cache_misses: u64,
    /// Fetches for which no source had a value.
    pub not_found: u64,
    /// Objects whose data was released by an eviction.
    pub evicts: u64,
    /// Lookups served by the local volatile table or storage.
    pub local_fetches: u64,
    /// Requests issued to a peer.
    pub peer_fetches: u64,
    /// Peer requests that failed.
    pub peer_errors: u64,
    /// Failed peer fetches rescued by local retrieval.
    pub fallbacks: u64,
}

/// Metrics of a shardcache node.
#[derive(Debug)]
pub struct Metrics {
    /// ... ...
    pub fetch_miss: Counter,
    /// ... ...
    pub fetch_not_found: Counter,
    /// ... ...
    pub evict: Counter,
    /// ... ...
    pub local_fetch: Counter,
    /// ... ...
    pub peer_fetch: Counter,
    /// ... ...
    pub peer_fetch_error: Counter,
    /// ... ...
    pub fallback: Counter,

    /// ... ...
    pub local_fetch_duration: BoxedHistogram,
    /// ... ...
    pub peer_fetch_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &dyn RegistryOps) -> Self {
        let name = name.into();

        let shardcache_fetch_op_total = registry.register_counter_vec(
            "shardcache_fetch_op_total".into(),
            "shardcache fetch core operations".into(),
            &["name", "op"],
        );
        let shardcache_fetch_op_duration = registry.register_histogram_vec(
            "shardcache_fetch_op_duration".into(),
            "shardcache fetch durations".into(),
            &["name", "source"],
        );

        let counter = |op: &'static str| Counter::new(shardcache_fetch_op_total.counter(&[name.clone(), op.into()]));

        let fetch_miss = counter("miss");
        let fetch_not_found = counter("not_found");
        let evict = counter("evict");
        let local_fetch = counter("local_fetch");
        let peer_fetch = counter("peer_fetch");
        let peer_fetch_error = counter("peer_fetch_error");
        let fallback = counter("fallback");

        let local_fetch_duration = shardcache_fetch_op_duration.histogram(&[name.clone(), "local".into()]);
        let peer_fetch_duration = shardcache_fetch_op_duration.histogram(&[name.clone(), "peer".into()]);

        Self {
            fetch_miss,
            fetch_not_found,
            evict,
            local_fetch,
            peer_fetch,
            peer_fetch_error,
            fallback,
            local_fetch_duration,
            peer_fetch_duration,
        }
    }

    /// Build noop metrics.
    ///
    /// Local tallies are still kept, only exporting is disabled.
    pub fn noop() -> Self {
        Self::new("test", &NoopMetricsRegistry)
    }

    /// Record a fetch duration.
    pub fn record_duration(histogram: &BoxedHistogram, duration: Duration) {
        histogram.record(duration.as_secs_f64());
    }

    /// Copy the local tallies of all counters.
    pub fn snapshot(&self) -> Counters {
        Counters {
            cache_misses: self.fetch_miss.get(),
            not_found: self.fetch_not_found.get(),
            evicts: self.evict.get(),
            local_fetches: self.local_fetch.get(),
            peer_fetches: self.peer_fetch.get(),
            peer_errors: self.peer_fetch_error.get(),
            fallbacks: self.fallback.get(),
        }
    }
}
