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

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shardcache_common::{
    error::{Error, ErrorKind, Result},
    strict_assert,
};

use crate::{
    config::PeerConfig,
    protocol::{AuthKey, Opcode, Signer, CHUNK_HEADER_LEN, MAX_CHUNK_LEN, SIGNATURE_LEN},
};

/// One protocol exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: Opcode,
    records: Vec<Bytes>,
}

impl Message {
    /// Build a message from an opcode and its records.
    ///
    /// Fails with [`ErrorKind::Protocol`] if the record count does not match the opcode.
    pub fn new(opcode: Opcode, records: Vec<Bytes>) -> Result<Self> {
        if records.len() != opcode.records() {
            return Err(Error::new(ErrorKind::Protocol, "record count does not match opcode")
                .with_context("opcode", opcode)
                .with_context("records", records.len()));
        }
        Ok(Self { opcode, records })
    }

    /// `GET key`.
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Get,
            records: vec![key.into()],
        }
    }

    /// `SET key value`.
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Set,
            records: vec![key.into(), value.into()],
        }
    }

    /// `DEL key`.
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Delete,
            records: vec![key.into()],
        }
    }

    /// `EVI key`.
    pub fn evict(key: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Evict,
            records: vec![key.into()],
        }
    }

    /// `RESPONSE value`.
    pub fn response(value: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Response,
            records: vec![value.into()],
        }
    }

    /// Opcode of the message.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// All records in wire order.
    pub fn records(&self) -> &[Bytes] {
        &self.records
    }

    /// Consume the message and take its records.
    pub fn into_records(self) -> Vec<Bytes> {
        self.records
    }

    /// Exact encoded size of the message.
    pub fn encoded_len(&self) -> usize {
        1 + self.records.iter().map(|r| record_encoded_len(r.len())).sum::<usize>() + SIGNATURE_LEN
    }

    /// Encode and sign the message.
    pub fn encode(&self, auth: &AuthKey) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(auth, &mut buf);
        buf
    }

    /// Encode and sign the message, appending to `buf`.
    pub fn encode_into(&self, auth: &AuthKey, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(self.opcode.as_u8());
        for record in self.records.iter() {
            put_record(buf, record);
        }
        let mut signer = auth.signer();
        signer.update(&buf[start..]);
        buf.put_slice(&signer.signature());
        strict_assert!(buf.len() - start == self.encoded_len());
    }

    /// Decode and verify one complete message from `buf`.
    ///
    /// Trailing bytes after the digest are rejected.
    pub fn decode(buf: &[u8], auth: &AuthKey, max_record_len: usize) -> Result<Self> {
        let mut decoder = MessageDecoder::new(auth, max_record_len);
        let mut src = BytesMut::from(buf);
        let mut records: Vec<BytesMut> = vec![];
        loop {
            match decoder.decode(&mut src)? {
                Some(Frame::Opcode(opcode)) => records = vec![BytesMut::new(); opcode.records()],
                Some(Frame::Chunk { record, data }) => records[record].extend_from_slice(&data),
                Some(Frame::RecordEnd { .. }) => {}
                Some(Frame::Verified) => break,
                None => return Err(Error::new(ErrorKind::Protocol, "truncated message")),
            }
        }
        if !src.is_empty() {
            return Err(Error::new(ErrorKind::Protocol, "trailing bytes after message").with_context("len", src.len()));
        }
        let opcode = decoder.opcode().ok_or_else(|| Error::new(ErrorKind::Protocol, "missing opcode"))?;
        Ok(Self {
            opcode,
            records: records.into_iter().map(BytesMut::freeze).collect(),
        })
    }
}

fn record_encoded_len(len: usize) -> usize {
    len.div_ceil(MAX_CHUNK_LEN) * CHUNK_HEADER_LEN + len + CHUNK_HEADER_LEN
}

/// Write a record as a sequence of chunks followed by the terminator.
fn put_record(buf: &mut BytesMut, data: &[u8]) {
    for chunk in data.chunks(MAX_CHUNK_LEN) {
        buf.put_u16(chunk.len() as u16);
        buf.put_slice(chunk);
    }
    buf.put_u16(0);
}

/// Decoding event emitted by [`MessageDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The opcode has been read.
    Opcode(Opcode),
    /// A slice of the payload of record `record`.
    ///
    /// A wire chunk may be split across several frames if its bytes arrive in pieces.
    Chunk {
        /// Index of the record.
        record: usize,
        /// Payload bytes.
        data: Bytes,
    },
    /// The terminator of record `record` has been read.
    RecordEnd {
        /// Index of the record.
        record: usize,
    },
    /// The digest has been read and matches. The message is complete.
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Opcode,
    Length,
    Data { remaining: usize },
    Signature,
    Done,
}

/// Push-based decoder of one message.
///
/// Feed it bytes through [`MessageDecoder::decode`]; it consumes what it can and emits one [`Frame`] at a time.
/// [`MessageDecoder::wanted`] tells how many bytes may be read from the wire without reading past the end of the
/// message.
#[derive(Debug)]
pub struct MessageDecoder {
    signer: Signer,
    max_record_len: usize,
    state: State,
    opcode: Option<Opcode>,
    records: usize,
    record: usize,
    record_len: usize,
}

impl MessageDecoder {
    /// Create a decoder verifying with `auth` and bounding each record by `max_record_len`.
    pub fn new(auth: &AuthKey, max_record_len: usize) -> Self {
        Self {
            signer: auth.signer(),
            max_record_len,
            state: State::Opcode,
            opcode: None,
            records: 0,
            record: 0,
            record_len: 0,
        }
    }

    /// Opcode of the message, once read.
    pub fn opcode(&self) -> Option<Opcode> {
        self.opcode
    }

    /// Whether the message has been fully read and verified.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Number of bytes that can be read from the wire without crossing the message boundary.
    pub fn wanted(&self) -> usize {
        match self.state {
            State::Opcode => 1,
            State::Length => CHUNK_HEADER_LEN,
            State::Data { remaining } => remaining,
            State::Signature => SIGNATURE_LEN,
            State::Done => 0,
        }
    }

    /// Consume bytes from `src` and emit the next frame, or `None` if more bytes are needed.
    ///
    /// After an error the decoder must be discarded.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::Opcode => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let raw = src[0];
                    let opcode = Opcode::try_from(raw)?;
                    src.advance(1);
                    self.signer.update(&[raw]);
                    self.opcode = Some(opcode);
                    self.records = opcode.records();
                    self.state = self.next_record_state();
                    return Ok(Some(Frame::Opcode(opcode)));
                }
                State::Length => {
                    if src.len() < CHUNK_HEADER_LEN {
                        return Ok(None);
                    }
                    let raw = src.split_to(CHUNK_HEADER_LEN);
                    self.signer.update(&raw);
                    let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                    if len > 0 {
                        self.state = State::Data { remaining: len };
                        continue;
                    }
                    let record = self.record;
                    self.record += 1;
                    self.record_len = 0;
                    self.state = self.next_record_state();
                    return Ok(Some(Frame::RecordEnd { record }));
                }
                State::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(src.len());
                    if self.record_len + n > self.max_record_len {
                        tracing::debug!(
                            "[codec]: record {} exceeds {} bytes",
                            self.record,
                            self.max_record_len
                        );
                        return Err(Error::record_too_large(self.max_record_len, self.record_len + n)
                            .with_context("record", self.record));
                    }
                    let data = src.split_to(n).freeze();
                    self.signer.update(&data);
                    self.record_len += n;
                    self.state = match remaining - n {
                        0 => State::Length,
                        remaining => State::Data { remaining },
                    };
                    return Ok(Some(Frame::Chunk {
                        record: self.record,
                        data,
                    }));
                }
                State::Signature => {
                    if src.len() < SIGNATURE_LEN {
                        return Ok(None);
                    }
                    let signature = src.split_to(SIGNATURE_LEN);
                    if let Err(e) = self.signer.verify(&signature) {
                        tracing::warn!("[codec]: signature mismatch on {:?} message", self.opcode);
                        return Err(e);
                    }
                    self.state = State::Done;
                    return Ok(Some(Frame::Verified));
                }
                State::Done => return Ok(None),
            }
        }
    }

    fn next_record_state(&self) -> State {
        if self.record < self.records {
            State::Length
        } else {
            State::Signature
        }
    }
}

/// Wire codec bound to a node's authentication key and peer settings.
#[derive(Debug, Clone)]
pub struct Codec {
    pub(crate) auth: AuthKey,
    pub(crate) config: PeerConfig,
}

impl Codec {
    /// Create a codec.
    pub fn new(auth: AuthKey, config: PeerConfig) -> Self {
        Self { auth, config }
    }

    /// Authentication key.
    pub fn auth(&self) -> &AuthKey {
        &self.auth
    }

    /// Peer settings.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Encode and sign a message.
    pub fn encode(&self, message: &Message) -> BytesMut {
        message.encode(&self.auth)
    }

    /// Decode and verify one complete message.
    pub fn decode(&self, buf: &[u8]) -> Result<Message> {
        Message::decode(buf, &self.auth, self.config.max_record_len)
    }

    /// A fresh decoder for one incoming message.
    pub fn decoder(&self) -> MessageDecoder {
        MessageDecoder::new(&self.auth, self.config.max_record_len)
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::protocol::DEFAULT_MAX_RECORD_LEN;

    fn auth() -> AuthKey {
        AuthKey::new("codec-secret")
    }

    #[test]
    fn test_get_layout() {
        let buf = Message::get(&b"foo"[..]).encode(&auth());
        assert_eq!(&buf[..8], &[0x01, 0x00, 0x03, b'f', b'o', b'o', 0x00, 0x00]);
        assert_eq!(buf.len(), 8 + SIGNATURE_LEN);

        let mut signer = auth().signer();
        signer.update(&buf[..8]);
        assert_eq!(&buf[8..], &signer.signature());
    }

    #[test]
    fn test_round_trip() {
        let messages = [
            Message::get(&b"key"[..]),
            Message::set(&b"key"[..], &b"value"[..]),
            Message::delete(&b"key"[..]),
            Message::evict(&b"key"[..]),
            Message::response(Bytes::new()),
        ];
        for message in messages {
            let buf = message.encode(&auth());
            assert_eq!(buf.len(), message.encoded_len());
            assert_eq!(Message::decode(&buf, &auth(), DEFAULT_MAX_RECORD_LEN).unwrap(), message);
        }
    }

    #[test]
    fn test_chunking() {
        let mut value = vec![0u8; MAX_CHUNK_LEN * 2 + 17];
        rand::rng().fill_bytes(&mut value);
        let message = Message::response(value.clone());
        let buf = message.encode(&auth());

        // Two full chunks, one tail chunk, then the terminator.
        assert_eq!(&buf[1..3], &(MAX_CHUNK_LEN as u16).to_be_bytes());
        let second = 3 + MAX_CHUNK_LEN;
        assert_eq!(&buf[second..second + 2], &(MAX_CHUNK_LEN as u16).to_be_bytes());
        let tail = second + 2 + MAX_CHUNK_LEN;
        assert_eq!(&buf[tail..tail + 2], &17u16.to_be_bytes());
        assert_eq!(&buf[tail + 2 + 17..tail + 4 + 17], &[0, 0]);

        let decoded = Message::decode(&buf, &auth(), DEFAULT_MAX_RECORD_LEN).unwrap();
        assert_eq!(decoded.records()[0], value);
    }

    #[test]
    fn test_tamper_detection() {
        let buf = Message::set(&b"key"[..], &b"value"[..]).encode(&auth());
        // Flip one bit in every byte position except the opcode, which would fail earlier.
        for i in 1..buf.len() {
            let mut tampered = buf.clone();
            tampered[i] ^= 0x01;
            let err = Message::decode(&tampered, &auth(), DEFAULT_MAX_RECORD_LEN).unwrap_err();
            assert!(err.kind().is_protocol(), "byte {i}: {err}");
        }
        let err = Message::decode(&buf, &AuthKey::new("other"), DEFAULT_MAX_RECORD_LEN).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut buf = Message::get(&b"key"[..]).encode(&auth());
        buf[0] = 0x7f;
        let err = Message::decode(&buf, &auth(), DEFAULT_MAX_RECORD_LEN).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_record_limit() {
        let buf = Message::response(vec![7u8; 100]).encode(&auth());
        assert!(Message::decode(&buf, &auth(), 100).is_ok());
        let err = Message::decode(&buf, &auth(), 99).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecordTooLarge);

        // The limit applies per record.
        let buf = Message::set(vec![1u8; 80], vec![2u8; 80]).encode(&auth());
        assert!(Message::decode(&buf, &auth(), 100).is_ok());
    }

    #[test]
    fn test_truncated_and_trailing() {
        let buf = Message::get(&b"key"[..]).encode(&auth());
        let err = Message::decode(&buf[..buf.len() - 1], &auth(), DEFAULT_MAX_RECORD_LEN).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let mut extended = buf.clone();
        extended.put_u8(0);
        let err = Message::decode(&extended, &auth(), DEFAULT_MAX_RECORD_LEN).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_decoder_byte_by_byte() {
        let message = Message::set(&b"k"[..], &b"split me"[..]);
        let buf = message.encode(&auth());
        let mut decoder = MessageDecoder::new(&auth(), DEFAULT_MAX_RECORD_LEN);
        let mut src = BytesMut::new();
        let mut frames = vec![];
        for byte in buf.iter() {
            assert!(decoder.wanted() > 0);
            src.put_u8(*byte);
            while let Some(frame) = decoder.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }
        assert!(decoder.is_done());
        assert_eq!(decoder.wanted(), 0);
        assert_eq!(frames.first(), Some(&Frame::Opcode(Opcode::Set)));
        assert_eq!(frames.last(), Some(&Frame::Verified));
        let value: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Chunk { record: 1, data } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(value, b"split me");
    }

    #[test]
    fn test_record_count() {
        assert!(Message::new(Opcode::Set, vec![Bytes::from_static(b"k")]).is_err());
        assert!(Message::new(Opcode::Get, vec![Bytes::from_static(b"k")]).is_ok());
    }
}
