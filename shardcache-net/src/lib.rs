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

//! Peer wire protocol and client of shardcache.
//!
//! Messages are an opcode byte, chunked length-prefixed records and a trailing SipHash-2-4 digest keyed with the
//! node's shared secret. [`codec`] frames and verifies them, [`io`] drives the framing over blocking and async
//! sockets, and [`client`] performs the peer operations on top.

/// Peer addresses in `host[:port]` form.
pub mod addr;
/// Peer operations over pooled connections.
pub mod client;
/// Message framing, signing and the push-based decoder.
pub mod codec;
/// Network configuration shared by the codec and the connection pool.
pub mod config;
pub mod io;
/// Connection pool seam and the RAII connection guard.
pub mod pool;
pub mod protocol;

pub use addr::PeerAddr;
pub use client::PeerClient;
pub use codec::{Codec, Frame, Message, MessageDecoder};
pub use config::PeerConfig;
pub use pool::{ConnectionPool, PooledConnection, TcpConnector};
pub use protocol::{AuthKey, Opcode};
