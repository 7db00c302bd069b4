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
    fmt::Debug,
    net::{Shutdown, TcpStream},
    sync::Arc,
    time::Duration,
};

use shardcache_common::error::{Error, ErrorKind, Result};

use crate::{addr::PeerAddr, config::PeerConfig};

/// Source of connections to peers.
///
/// Connections are plain blocking sockets; callers that need async I/O convert them on their runtime and convert
/// them back before [`ConnectionPool::release`].
pub trait ConnectionPool: Send + Sync + Debug + 'static {
    /// Check out a connection to `peer`.
    fn acquire(&self, peer: &PeerAddr) -> Result<TcpStream>;

    /// Return a healthy connection after a successful exchange.
    ///
    /// Connections that saw an error are never released; they are closed instead.
    fn release(&self, peer: &PeerAddr, conn: TcpStream);
}

/// A [`ConnectionPool`] that opens a fresh connection per checkout and closes it on release.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the timeouts of `config`.
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
        }
    }
}

impl ConnectionPool for TcpConnector {
    fn acquire(&self, peer: &PeerAddr) -> Result<TcpStream> {
        let mut last = None;
        for addr in peer.resolve()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    tracing::trace!("[peer client]: connected to {peer} via {addr}");
                    return Ok(stream);
                }
                Err(e) => last = Some(e),
            }
        }
        let err = Error::new(ErrorKind::Transport, "cannot connect to peer").with_context("peer", peer);
        Err(match last {
            Some(e) => err.with_source(e),
            None => err,
        })
    }

    fn release(&self, peer: &PeerAddr, conn: TcpStream) {
        tracing::trace!("[peer client]: close connection to {peer}");
        let _ = conn.shutdown(Shutdown::Both);
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// [`PooledConnection::release`] hands it back after a successful exchange. Dropping the guard without releasing
/// closes the connection, so every error path discards it.
#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<dyn ConnectionPool>,
    peer: PeerAddr,
    stream: Option<TcpStream>,
}

impl PooledConnection {
    /// Check out a connection to `peer` from `pool`.
    pub fn checkout(pool: Arc<dyn ConnectionPool>, peer: PeerAddr) -> Result<Self> {
        let stream = pool.acquire(&peer)?;
        Ok(Self {
            pool,
            peer,
            stream: Some(stream),
        })
    }

    /// Peer the connection points to.
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Underlying socket.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        // Only taken by `release`, `into_parts` and `drop`, which all consume the guard.
        self.stream.as_mut().unwrap_or_else(|| unreachable!())
    }

    /// Hand the connection back to its pool.
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release(&self.peer, stream);
        }
    }

    /// Split the guard, leaving the caller responsible for releasing or closing the socket.
    pub fn into_parts(mut self) -> (Arc<dyn ConnectionPool>, PeerAddr, TcpStream) {
        let stream = self.stream.take().unwrap_or_else(|| unreachable!());
        (self.pool.clone(), self.peer.clone(), stream)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::debug!("[peer client]: discard connection to {}", self.peer);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        net::TcpListener,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Debug)]
    struct CountingPool {
        inner: TcpConnector,
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl ConnectionPool for CountingPool {
        fn acquire(&self, peer: &PeerAddr) -> Result<TcpStream> {
            self.acquired.fetch_add(1, Ordering::Relaxed);
            self.inner.acquire(peer)
        }

        fn release(&self, peer: &PeerAddr, conn: TcpStream) {
            self.released.fetch_add(1, Ordering::Relaxed);
            self.inner.release(peer, conn)
        }
    }

    fn pool() -> Arc<CountingPool> {
        Arc::new(CountingPool {
            inner: TcpConnector::new(&PeerConfig::default().with_connect_timeout(Duration::from_secs(1))),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    #[test_log::test]
    fn test_release_and_discard() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = PeerAddr::from(listener.local_addr().unwrap());
        let pool = pool();

        let conn = PooledConnection::checkout(pool.clone(), peer.clone()).unwrap();
        assert_eq!(conn.peer(), &peer);
        conn.release();

        let conn = PooledConnection::checkout(pool.clone(), peer.clone()).unwrap();
        drop(conn);

        assert_eq!(pool.acquired.load(Ordering::Relaxed), 2);
        assert_eq!(pool.released.load(Ordering::Relaxed), 1);

        // Both server sides observe the close.
        for _ in 0..2 {
            let (mut accepted, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(accepted.read(&mut buf).unwrap(), 0);
        }
    }

    #[test_log::test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = PeerAddr::from(listener.local_addr().unwrap());
        drop(listener);

        let err = PooledConnection::checkout(pool(), peer.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.context().iter().any(|(k, v)| *k == "peer" && *v == peer.to_string()));
    }

    #[test]
    fn test_into_parts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = PeerAddr::from(listener.local_addr().unwrap());
        let pool = pool();
        let conn = PooledConnection::checkout(pool.clone(), peer.clone()).unwrap();
        let (_, parts_peer, stream) = conn.into_parts();
        assert_eq!(parts_peer, peer);
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
        assert_eq!(pool.released.load(Ordering::Relaxed), 0);
    }
}
