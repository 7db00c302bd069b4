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
    fmt::Display,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use shardcache_common::error::{Error, ErrorKind, Result};

use crate::protocol::DEFAULT_PORT;

/// Reasons a peer address string is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrParseError {
    /// Nothing before the port separator.
    #[error("empty host")]
    EmptyHost,
    /// Port is not a number in `1..=65535`.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
    /// Opening bracket of an IPv6 literal is never closed.
    #[error("unclosed bracket")]
    UnclosedBracket,
}

/// Network address of a peer node, as `host[:port]`.
///
/// IPv6 literals are written in brackets: `[::1]:4444`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    host: String,
    port: u16,
}

impl PeerAddr {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parse `host[:port]`, using `default_port` when the port is omitted.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        Self::parse_inner(s.trim(), default_port).map_err(|e| {
            Error::new(ErrorKind::Config, "invalid peer address")
                .with_context("peer", s)
                .with_source(e)
        })
    }

    fn parse_inner(s: &str, default_port: u16) -> std::result::Result<Self, AddrParseError> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or(AddrParseError::UnclosedBracket)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(AddrParseError::InvalidPort(tail.to_string())),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };
        if host.is_empty() {
            return Err(AddrParseError::EmptyHost);
        }
        let port = match port {
            None => default_port,
            Some(port) => match port.parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => return Err(AddrParseError::InvalidPort(port.to_string())),
            },
        };
        Ok(Self::new(host, port))
    }

    /// Host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to socket addresses.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::new(ErrorKind::Transport, "cannot resolve peer address")
                    .with_context("peer", self)
                    .with_source(e)
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::new(ErrorKind::Transport, "peer address resolves to nothing").with_context("peer", self));
        }
        Ok(addrs)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, DEFAULT_PORT)
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
