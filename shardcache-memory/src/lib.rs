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

//! Cache object lifecycle and peer fetch coordinator of shardcache.
//!
//! The eviction policy drives objects through the [`Backend`](crate::backend::Backend) trait. [`PeerFetcher`]
//! implements it: on a miss it asks the [`Topology`](crate::topology::Topology) who owns the key, fetches from a
//! peer or from the local volatile table and storage, and fans the result out to every listener of the object.

mod arena;
mod backend;
mod fetch;
mod listener;
mod object;
mod storage;
mod topology;
mod volatile;

mod prelude;
pub use prelude::*;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
