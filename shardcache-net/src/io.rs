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

//! Blocking and async drivers moving messages between sockets and a [`MessageDecoder`].

use std::{
    io::{Read, Write},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use shardcache_common::error::{Error, ErrorKind, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    codec::{Codec, Frame, Message, MessageDecoder},
    protocol::Opcode,
};

const READ_BUFFER_LEN: usize = 64 * 1024;

fn is_retryable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}

impl Codec {
    /// Send a message over a blocking writer.
    pub fn write_message<W: Write>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let buf = self.encode(message);
        let deadline = Instant::now() + self.config.io_timeout;
        let mut written = 0;
        while written < buf.len() {
            match writer.write(&buf[written..]) {
                Ok(0) => return Err(Error::closed().with_context("opcode", message.opcode())),
                Ok(n) => written += n,
                Err(e) if is_retryable(&e) && Instant::now() < deadline => std::thread::yield_now(),
                Err(e) => return Err(Error::from(e).with_context("opcode", message.opcode())),
            }
        }
        loop {
            match writer.flush() {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable(&e) && Instant::now() < deadline => std::thread::yield_now(),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read one message from a blocking reader, appending the payload of every record to `out`.
    ///
    /// Returns the opcode of the message. On any failure `out` is truncated back to its length at entry.
    pub fn read_message<R: Read>(&self, reader: &mut R, out: &mut BytesMut) -> Result<Opcode> {
        let start = out.len();
        let res = self.drive(reader, |frame| {
            if let Frame::Chunk { data, .. } = frame {
                out.extend_from_slice(&data);
            }
        });
        if res.is_err() {
            out.truncate(start);
        }
        res
    }

    /// Read one message from a blocking reader, keeping records apart.
    pub fn receive<R: Read>(&self, reader: &mut R) -> Result<Message> {
        let mut records: Vec<BytesMut> = vec![];
        let opcode = self.drive(reader, |frame| match frame {
            Frame::Opcode(opcode) => records = vec![BytesMut::new(); opcode.records()],
            Frame::Chunk { record, data } => records[record].extend_from_slice(&data),
            _ => {}
        })?;
        Message::new(opcode, records.into_iter().map(BytesMut::freeze).collect())
    }

    fn drive<R: Read>(&self, reader: &mut R, mut on_frame: impl FnMut(Frame)) -> Result<Opcode> {
        let mut decoder = self.decoder();
        let mut src = BytesMut::new();
        let mut scratch = vec![0; READ_BUFFER_LEN];
        loop {
            while let Some(frame) = decoder.decode(&mut src)? {
                if frame == Frame::Verified {
                    return finished(&decoder);
                }
                on_frame(frame);
            }
            let want = decoder.wanted().min(scratch.len());
            let n = self.read_some(reader, &mut scratch[..want])?;
            src.extend_from_slice(&scratch[..n]);
        }
    }

    fn read_some<R: Read>(&self, reader: &mut R, dst: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.config.io_timeout;
        loop {
            match reader.read(dst) {
                Ok(0) => return Err(Error::closed()),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::new(ErrorKind::Transport, "i/o timed out").with_source(e));
                    }
                    std::thread::yield_now();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a message over an async writer.
    pub async fn write_message_async<W: AsyncWrite + Unpin>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let buf = self.encode(message);
        let io = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.config.io_timeout, io).await {
            Ok(res) => res.map_err(|e| Error::from(e).with_context("opcode", message.opcode())),
            Err(_) => Err(Error::new(ErrorKind::Transport, "write timed out").with_context("opcode", message.opcode())),
        }
    }

    /// Read one message from an async reader, handing every payload slice to `on_chunk` as it arrives.
    ///
    /// Slices are delivered before the digest is verified; a failed verification is reported after the fact.
    pub async fn read_message_streaming<R, F>(&self, reader: &mut R, mut on_chunk: F) -> Result<Opcode>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes),
    {
        let mut decoder = self.decoder();
        let mut src = BytesMut::new();
        let mut scratch = vec![0; READ_BUFFER_LEN];
        loop {
            while let Some(frame) = decoder.decode(&mut src)? {
                match frame {
                    Frame::Verified => return finished(&decoder),
                    Frame::Chunk { data, .. } => on_chunk(data),
                    Frame::Opcode(_) | Frame::RecordEnd { .. } => {}
                }
            }
            let want = decoder.wanted().min(scratch.len());
            let n = self.read_some_async(reader, &mut scratch[..want]).await?;
            src.extend_from_slice(&scratch[..n]);
        }
    }

    /// Read one message from an async reader, appending the payload of every record to `out`.
    ///
    /// On any failure `out` is truncated back to its length at entry.
    pub async fn read_message_async<R: AsyncRead + Unpin>(&self, reader: &mut R, out: &mut BytesMut) -> Result<Opcode> {
        let start = out.len();
        let res = self
            .read_message_streaming(reader, |data| out.extend_from_slice(&data))
            .await;
        if res.is_err() {
            out.truncate(start);
        }
        res
    }

    async fn read_some_async<R: AsyncRead + Unpin>(&self, reader: &mut R, dst: &mut [u8]) -> Result<usize> {
        loop {
            match tokio::time::timeout(self.config.io_timeout, reader.read(dst)).await {
                Err(_) => return Err(Error::new(ErrorKind::Transport, "read timed out")),
                Ok(Ok(0)) => return Err(Error::closed()),
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if is_retryable(&e) => continue,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn finished(decoder: &MessageDecoder) -> Result<Opcode> {
    decoder
        .opcode()
        .ok_or_else(|| Error::new(ErrorKind::Protocol, "message without opcode"))
}
