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

//! Constants and primitives of the peer wire protocol.
//!
//! ```text
//! MESSAGE    := OPCODE [RECORD]* DIGEST
//! RECORD     := CHUNK* TERMINATOR
//! CHUNK      := LEN(2 bytes BE, > 0) DATA(LEN bytes)
//! TERMINATOR := LEN(2 bytes, == 0)
//! DIGEST     := 8 bytes SipHash-2-4 over OPCODE..last TERMINATOR
//! ```

use std::{fmt::Debug, hash::Hasher};

use shardcache_common::error::{Error, ErrorKind, Result};
use siphasher::sip::SipHasher24;

/// Size of the length prefix of a chunk.
pub const CHUNK_HEADER_LEN: usize = 2;
/// Maximum payload size of a single chunk.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;
/// Size of the trailing digest.
pub const SIGNATURE_LEN: usize = 8;
/// Size of the authentication key.
pub const AUTH_KEY_LEN: usize = 16;
/// Default upper bound of the accumulated size of one record.
pub const DEFAULT_MAX_RECORD_LEN: usize = 256 << 20;
/// Default peer port.
pub const DEFAULT_PORT: u16 = 4444;

/// Operation of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch the value of a key.
    Get = 0x01,
    /// Store a value for a key.
    Set = 0x02,
    /// Delete a key on its owner.
    Delete = 0x03,
    /// Evict a key from a non-owner replica.
    Evict = 0x04,
    /// Reply to any of the above.
    Response = 0x11,
}

impl Opcode {
    /// Number of records a message with this opcode carries.
    pub fn records(self) -> usize {
        match self {
            Opcode::Get | Opcode::Delete | Opcode::Evict | Opcode::Response => 1,
            Opcode::Set => 2,
        }
    }

    /// Raw wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Opcode::Get),
            0x02 => Ok(Opcode::Set),
            0x03 => Ok(Opcode::Delete),
            0x04 => Ok(Opcode::Evict),
            0x11 => Ok(Opcode::Response),
            v => Err(Error::new(ErrorKind::Protocol, "unknown opcode").with_context("opcode", format!("{v:#04x}"))),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::Get => "GET",
            Opcode::Set => "SET",
            Opcode::Delete => "DEL",
            Opcode::Evict => "EVI",
            Opcode::Response => "RESPONSE",
        };
        write!(f, "{name}({:#04x})", self.as_u8())
    }
}

/// Key of the keyed hash that authenticates every message.
///
/// Derived from the shared node secret: truncated to, or zero-padded up to, 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthKey([u8; AUTH_KEY_LEN]);

impl Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

impl AuthKey {
    /// Derive the key from a shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        let mut key = [0; AUTH_KEY_LEN];
        let len = secret.len().min(AUTH_KEY_LEN);
        key[..len].copy_from_slice(&secret[..len]);
        Self(key)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.0
    }

    /// Start a running digest keyed with this key.
    pub fn signer(&self) -> Signer {
        Signer {
            hasher: SipHasher24::new_with_key(&self.0),
        }
    }
}

impl Default for AuthKey {
    fn default() -> Self {
        Self([0; AUTH_KEY_LEN])
    }
}

/// Running SipHash-2-4 digest over the bytes of a message.
#[derive(Debug, Clone)]
pub struct Signer {
    hasher: SipHasher24,
}

impl Signer {
    /// Feed bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.write(bytes);
    }

    /// Digest of everything fed so far, in wire order.
    ///
    /// The signer can keep being updated afterwards.
    pub fn signature(&self) -> [u8; SIGNATURE_LEN] {
        self.hasher.finish().to_le_bytes()
    }

    /// Check a received signature against the local digest.
    pub fn verify(&self, signature: &[u8]) -> Result<()> {
        if signature == self.signature() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::SignatureMismatch, "message digest does not match"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_wire_values() {
        for op in [Opcode::Get, Opcode::Set, Opcode::Delete, Opcode::Evict, Opcode::Response] {
            assert_eq!(Opcode::try_from(op.as_u8()).unwrap(), op);
        }
        assert_eq!(Opcode::Set.records(), 2);
        assert_eq!(Opcode::Response.records(), 1);

        let err = Opcode::try_from(0x42).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.context()[0], ("opcode", "0x42".to_string()));
    }

    #[test]
    fn test_auth_key_derivation() {
        let short = AuthKey::new("secret");
        assert_eq!(&short.as_bytes()[..6], b"secret");
        assert!(short.as_bytes()[6..].iter().all(|b| *b == 0));

        let long = AuthKey::new("0123456789abcdefOVERFLOW");
        assert_eq!(long.as_bytes(), b"0123456789abcdef");
        assert_eq!(long, AuthKey::new("0123456789abcdef"));

        assert_eq!(format!("{long:?}"), "AuthKey(..)");
    }

    #[test]
    fn test_signer_is_keyed() {
        let mut a = AuthKey::new("alpha").signer();
        let mut b = AuthKey::new("bravo").signer();
        a.update(b"\x01\x00\x03foo\x00\x00");
        b.update(b"\x01\x00\x03foo\x00\x00");
        assert_ne!(a.signature(), b.signature());
        assert!(a.verify(&a.signature()).is_ok());
        assert_eq!(a.verify(&b.signature()).unwrap_err().kind(), ErrorKind::SignatureMismatch);
    }

    #[test]
    fn test_signer_incremental() {
        let key = AuthKey::new("incremental");
        let mut whole = key.signer();
        whole.update(b"hello world");
        let mut parts = key.signer();
        parts.update(b"hello");
        parts.update(b" world");
        assert_eq!(whole.signature(), parts.signature());
    }
}
