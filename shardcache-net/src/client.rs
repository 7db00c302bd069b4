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
    io::{Read, Write},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use shardcache_common::error::{Error, ErrorKind, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    addr::PeerAddr,
    codec::{Codec, Message},
    pool::{ConnectionPool, PooledConnection},
    protocol::Opcode,
};

/// Client side of the peer protocol.
///
/// Every operation checks out one connection, performs one exchange, and hands the connection back on success. A
/// connection that saw any error is closed.
#[derive(Debug, Clone)]
pub struct PeerClient {
    codec: Codec,
    pool: Arc<dyn ConnectionPool>,
}

impl PeerClient {
    /// Create a client over `pool`.
    pub fn new(codec: Codec, pool: Arc<dyn ConnectionPool>) -> Self {
        Self { codec, pool }
    }

    /// Wire codec of the client.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Parse a `host[:port]` peer string with the configured default port.
    pub fn peer_addr(&self, peer: &str) -> Result<PeerAddr> {
        PeerAddr::parse(peer, self.codec.config().default_port)
    }

    /// Check out a connection to `peer`.
    pub fn connect(&self, peer: &PeerAddr) -> Result<PooledConnection> {
        PooledConnection::checkout(self.pool.clone(), peer.clone())
    }

    /// Fetch the value of `key` from `peer`.
    ///
    /// An empty value means the peer has nothing for the key.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "shardcache::net::client::get"))]
    pub fn get(&self, peer: &str, key: &[u8]) -> Result<Bytes> {
        self.call(peer, Message::get(Bytes::copy_from_slice(key)))
    }

    /// Store `value` for `key` on `peer`.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "shardcache::net::client::set"))]
    pub fn set(&self, peer: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.call(
            peer,
            Message::set(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)),
        )
        .map(|_| ())
    }

    /// Remove `key` from `peer`: `DEL` if the peer owns the key, `EVI` otherwise.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "shardcache::net::client::delete"))]
    pub fn delete(&self, peer: &str, key: &[u8], owner: bool) -> Result<()> {
        let key = Bytes::copy_from_slice(key);
        let message = if owner { Message::delete(key) } else { Message::evict(key) };
        self.call(peer, message).map(|_| ())
    }

    fn call(&self, peer: &str, message: Message) -> Result<Bytes> {
        let addr = self.peer_addr(peer)?;
        let mut conn = self.connect(&addr)?;
        match self.exchange(conn.stream_mut(), &message) {
            Ok(value) => {
                conn.release();
                Ok(value)
            }
            Err(e) => {
                tracing::warn!("[peer client]: {} to {addr} failed: {e}", message.opcode());
                Err(e.with_context("peer", &addr))
            }
        }
    }

    /// Fetch the value of `key` over an already checked-out connection.
    ///
    /// The caller keeps ownership of the connection and decides whether to release it.
    pub fn fetch_on<S: Read + Write>(&self, stream: &mut S, key: &[u8]) -> Result<Bytes> {
        self.exchange(stream, &Message::get(Bytes::copy_from_slice(key)))
    }

    fn exchange<S: Read + Write>(&self, stream: &mut S, message: &Message) -> Result<Bytes> {
        self.codec.write_message(stream, message)?;
        let mut out = BytesMut::new();
        let opcode = self.codec.read_message(stream, &mut out)?;
        check_response(opcode, message.opcode())?;
        Ok(out.freeze())
    }

    /// Fetch the value of `key` over an async stream, handing value slices to `on_chunk` as they arrive.
    ///
    /// Returns the total value length.
    pub async fn fetch_streaming<S, F>(&self, stream: &mut S, key: Bytes, mut on_chunk: F) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: FnMut(Bytes),
    {
        let request = Message::get(key);
        self.codec.write_message_async(stream, &request).await?;
        let mut len = 0;
        let opcode = self
            .codec
            .read_message_streaming(stream, |data| {
                len += data.len();
                on_chunk(data);
            })
            .await?;
        check_response(opcode, request.opcode())?;
        Ok(len)
    }

    /// Run [`PeerClient::fetch_streaming`] over a pooled connection on the current runtime.
    ///
    /// The blocking socket is registered with the runtime for the exchange and converted back afterwards. The
    /// connection is released on success and closed on any failure.
    pub async fn fetch_pooled<F>(&self, conn: PooledConnection, key: Bytes, on_chunk: F) -> Result<usize>
    where
        F: FnMut(Bytes),
    {
        let (pool, peer, stream) = conn.into_parts();
        let res = async {
            stream.set_nonblocking(true)?;
            let mut stream = tokio::net::TcpStream::from_std(stream)?;
            let len = self.fetch_streaming(&mut stream, key, on_chunk).await?;
            let stream = stream.into_std()?;
            stream.set_nonblocking(false)?;
            Ok::<_, Error>((len, stream))
        }
        .await;
        match res {
            Ok((len, stream)) => {
                pool.release(&peer, stream);
                Ok(len)
            }
            Err(e) => Err(e.with_context("peer", &peer)),
        }
    }
}

fn check_response(opcode: Opcode, request: Opcode) -> Result<()> {
    if opcode == Opcode::Response {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Protocol, "unexpected reply opcode")
        .with_context("request", request)
        .with_context("opcode", opcode))
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        thread::JoinHandle,
        time::Duration,
    };

    use super::*;
    use crate::{config::PeerConfig, pool::TcpConnector, protocol::AuthKey};

    fn codec() -> Codec {
        Codec::new(AuthKey::new("client-secret"), PeerConfig::default())
    }

    fn client() -> PeerClient {
        let config = PeerConfig::default().with_io_timeout(Duration::from_secs(5));
        PeerClient::new(
            Codec::new(AuthKey::new("client-secret"), config.clone()),
            Arc::new(TcpConnector::new(&config)),
        )
    }

    /// Serve `n` connections, answering each request through `reply`.
    fn serve(n: usize, reply: impl Fn(Message) -> Message + Send + 'static) -> (String, JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let codec = codec();
            let mut seen = vec![];
            for _ in 0..n {
                let (mut stream, _) = listener.accept().unwrap();
                let request = codec.receive(&mut stream).unwrap();
                codec.write_message(&mut stream, &reply(request.clone())).unwrap();
                seen.push(request);
            }
            seen
        });
        (addr, handle)
    }

    #[test_log::test]
    fn test_get_set_delete() {
        let (addr, server) = serve(4, |request| match request.opcode() {
            Opcode::Get => Message::response(&b"value"[..]),
            _ => Message::response(&b"OK"[..]),
        });
        let client = client();

        assert_eq!(client.get(&addr, b"key").unwrap(), &b"value"[..]);
        client.set(&addr, b"key", b"value").unwrap();
        client.delete(&addr, b"key", true).unwrap();
        client.delete(&addr, b"key", false).unwrap();

        let opcodes: Vec<_> = server.join().unwrap().iter().map(|m| m.opcode()).collect();
        assert_eq!(opcodes, vec![Opcode::Get, Opcode::Set, Opcode::Delete, Opcode::Evict]);
    }

    #[test_log::test]
    fn test_unexpected_opcode() {
        let (addr, server) = serve(1, |request| request);
        let err = client().get(&addr, b"key").unwrap_err();
        server.join().unwrap();

        assert_eq!(err.kind(), ErrorKind::Protocol);
        let context = err.context();
        assert!(context.iter().any(|(k, v)| *k == "opcode" && v.contains("0x01")));
        assert!(context.iter().any(|(k, v)| *k == "peer" && *v == addr));
    }

    #[test_log::test]
    fn test_wrong_key_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let intruder = Codec::new(AuthKey::new("intruder"), PeerConfig::default());
            let (mut stream, _) = listener.accept().unwrap();
            // Requests signed with another key are rejected by the receiver as well.
            assert!(intruder.receive(&mut stream).is_err());
            intruder
                .write_message(&mut stream, &Message::response(&b"forged"[..]))
                .unwrap();
        });
        let err = client().get(&addr, b"key").unwrap_err();
        server.join().unwrap();
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
    }

    #[test_log::test]
    fn test_fetch_on() {
        let (addr, server) = serve(1, |_| Message::response(vec![9u8; 100_000]));
        let mut stream = TcpStream::connect(&addr).unwrap();
        let value = client().fetch_on(&mut stream, b"big").unwrap();
        assert_eq!(value.len(), 100_000);
        server.join().unwrap();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_fetch_pooled() {
        let (addr, server) = serve(1, |_| Message::response(vec![5u8; 200_000]));
        let client = client();
        let conn = client.connect(&client.peer_addr(&addr).unwrap()).unwrap();

        let mut received = 0;
        let mut chunks = 0;
        let len = client
            .fetch_pooled(conn, Bytes::from_static(b"key"), |data| {
                chunks += 1;
                received += data.len();
            })
            .await
            .unwrap();

        assert_eq!(len, 200_000);
        assert_eq!(received, 200_000);
        assert!(chunks >= 4);
        let requests = tokio::task::spawn_blocking(move || server.join().unwrap()).await.unwrap();
        assert_eq!(requests[0].records()[0], &b"key"[..]);
    }
}
