// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bidirectional RPC transport.
//!
//! After the synchronous `subscribe` handshake, all further traffic on the
//! accepted socket is one-way: the engine never sends a reply to an
//! asynchronous procedure, and the peer never expects one. A single
//! dispatcher task owns both the read half (driving [`crate::dispatch`])
//! and the write half (used for the handshake reply and for every
//! subsequent `deliver_*`/`no_such_product` send), so no synchronization
//! is needed between the two directions.

use crate::protocol::SessionMessage;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Reads length-prefixed JSON frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
    buf: Vec<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Reads and deserializes one frame. `Ok(None)` means the peer closed
    /// the connection gracefully (clean EOF on the length prefix).
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(TransportError::Protocol("empty frame".into()));
        }
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge(len, self.max_frame_size));
        }

        self.buf.clear();
        self.buf.resize(len, 0);
        self.inner
            .read_exact(&mut self.buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let value = serde_json::from_slice(&self.buf)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON: {}", e)))?;
        Ok(Some(value))
    }
}

/// Writes length-prefixed JSON frames to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_size: usize,
}

impl<W: tokio::io::AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<(), TransportError> {
        let json = serde_json::to_vec(value)
            .map_err(|e| TransportError::Protocol(format!("serialize error: {}", e)))?;

        if json.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge(json.len(), self.max_frame_size));
        }

        let len = json.len() as u32;
        self.inner
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.inner
            .write_all(&json)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Transport errors. Every variant here is fatal to the session when it
/// surfaces past the handshake: a native async transport has no analogue
/// of a synchronous RPC stack's "expected timeout" success signal for a
/// one-way call, so any I/O error on an asynchronous send is uniformly
/// treated as a hard failure.
#[derive(Debug)]
pub enum TransportError {
    Io(String),
    Protocol(String),
    FrameTooLarge(usize, usize),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
            Self::FrameTooLarge(got, max) => {
                write!(f, "frame too large: {} > {}", got, max)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// The session's half of the socket: a reader for peer-initiated RPCs and
/// a writer for engine-initiated ones. Owned exclusively by the
/// [`crate::session::Session`]; dropping it closes the socket.
///
/// Generic over the underlying read/write halves so tests can drive the
/// same framing logic over an in-memory `tokio::io::duplex` pair instead
/// of a real socket; production code always instantiates this via
/// [`SessionTransport::from_stream`].
pub struct SessionTransport<R = OwnedReadHalf, W = OwnedWriteHalf> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl SessionTransport<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_stream(stream: TcpStream, max_frame_size: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half, max_frame_size),
            writer: FrameWriter::new(write_half, max_frame_size),
        }
    }
}

impl<R, W> SessionTransport<R, W>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    /// Test-only constructor over an arbitrary split read/write pair,
    /// e.g. the two halves of a `tokio::io::duplex`.
    #[cfg(test)]
    pub fn from_split(read_half: R, write_half: W, max_frame_size: usize) -> Self {
        Self {
            reader: FrameReader::new(read_half, max_frame_size),
            writer: FrameWriter::new(write_half, max_frame_size),
        }
    }

    /// Reads the next peer-initiated message. Used both for the initial
    /// synchronous `subscribe` request and for every later asynchronous
    /// request once the session is `SERVING`.
    pub async fn recv_request<T: DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, TransportError> {
        self.reader.read_frame().await
    }

    /// Sends the one synchronous handshake reply.
    pub async fn send_handshake_reply<T: Serialize>(
        &mut self,
        reply: &T,
    ) -> Result<(), TransportError> {
        self.writer.write_frame(reply).await
    }

    /// Sends a one-way, asynchronous message to the peer. A successful
    /// write is success; any I/O error is fatal (see [`TransportError`]).
    pub async fn send_one_way(&mut self, msg: &SessionMessage) -> Result<(), TransportError> {
        self.writer.write_frame(msg).await
    }
}
