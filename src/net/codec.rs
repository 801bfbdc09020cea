//! Transfer protocol codec.
//!
//! Every unit on the wire is a frame: a big-endian `u32` length followed by
//! exactly that many bytes. A transfer is one header frame carrying a JSON
//! [`TransferDescriptor`], then body frames of raw file bytes until the
//! declared size has been delivered. There is no end marker.
//!
//! ```text
//! message      := header_frame body_frame*
//! header_frame := len:u32be | json(TransferDescriptor)
//! body_frame   := len:u32be | raw bytes   (1 ..= max_frame_len)
//! ```
//!
//! [`FrameCodec`] is a synchronous state machine: it knows whether it is
//! waiting for a header or for body bytes, and how many body bytes remain.
//! Anything that does not fit that expectation is a [`FrameError`].

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{DEFAULT_MAX_FRAME_LEN, MAX_WIRE_FRAME_LEN};

/// Size of the length prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest header or handshake payload accepted (64 KiB).
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Errors produced while framing or parsing wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("stream error: {0}")]
    Io(Arc<str>),

    #[error("header of {len} bytes exceeds limit of {max}")]
    HeaderTooLarge { len: usize, max: usize },

    #[error("body frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("empty header frame")]
    EmptyHeader,

    #[error("empty body frame")]
    EmptyBody,

    #[error("body frame of {len} bytes overruns the {remaining} bytes still expected")]
    Overrun { len: usize, remaining: u64 },

    #[error("malformed message: {0}")]
    Malformed(Arc<str>),

    #[error("stream ended in the middle of a transfer")]
    Truncated,
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::from(err.to_string()))
    }
}

/// Metadata sent once at the start of every transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    pub file_name: String,
    pub file_size: u64,
}

impl TransferDescriptor {
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Header(TransferDescriptor),
    Body(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Header,
    Body { remaining: u64 },
}

/// Length-prefixed frame codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    expect: Expect,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// `max_frame_len` is clamped to what a u32 prefix can describe, and
    /// to at least one byte.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.clamp(1, MAX_WIRE_FRAME_LEN),
            expect: Expect::Header,
        }
    }

    #[inline]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// True between transfers, when the next frame must be a header.
    #[inline]
    pub fn is_awaiting_header(&self) -> bool {
        self.expect == Expect::Header
    }

    /// Body bytes still owed by the current transfer.
    #[inline]
    pub fn remaining(&self) -> u64 {
        match self.expect {
            Expect::Header => 0,
            Expect::Body { remaining } => remaining,
        }
    }

    /// Appends a header frame to `dst`.
    pub fn encode_header(
        &self,
        descriptor: &TransferDescriptor,
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let json = serde_json::to_vec(descriptor)
            .map_err(|e| FrameError::Malformed(Arc::from(e.to_string())))?;
        if json.len() > MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLarge {
                len: json.len(),
                max: MAX_HEADER_LEN,
            });
        }
        put_frame(&json, dst);
        Ok(())
    }

    /// Appends a body frame carrying `payload` to `dst`.
    pub fn encode_body(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyBody);
        }
        if payload.len() > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        put_frame(payload, dst);
        Ok(())
    }

    fn check_length(&self, len: usize) -> Result<(), FrameError> {
        match self.expect {
            Expect::Header if len == 0 => Err(FrameError::EmptyHeader),
            Expect::Header if len > MAX_HEADER_LEN => Err(FrameError::HeaderTooLarge {
                len,
                max: MAX_HEADER_LEN,
            }),
            Expect::Header => Ok(()),
            Expect::Body { .. } if len == 0 => Err(FrameError::EmptyBody),
            Expect::Body { .. } if len > self.max_frame_len => Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            }),
            Expect::Body { remaining } if len as u64 > remaining => {
                Err(FrameError::Overrun { len, remaining })
            }
            Expect::Body { .. } => Ok(()),
        }
    }
}

fn put_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(FRAME_PREFIX_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(payload);
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        prefix.copy_from_slice(&src[..FRAME_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        self.check_length(len)?;

        let frame_len = FRAME_PREFIX_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_PREFIX_LEN);
        let payload = src.split_to(len).freeze();

        match self.expect {
            Expect::Header => {
                let descriptor: TransferDescriptor = serde_json::from_slice(&payload)
                    .map_err(|e| FrameError::Malformed(Arc::from(e.to_string())))?;
                if descriptor.file_size > 0 {
                    self.expect = Expect::Body {
                        remaining: descriptor.file_size,
                    };
                }
                Ok(Some(Frame::Header(descriptor)))
            }
            Expect::Body { remaining } => {
                let remaining = remaining - len as u64;
                self.expect = if remaining == 0 {
                    Expect::Header
                } else {
                    Expect::Body { remaining }
                };
                Ok(Some(Frame::Body(payload)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.is_awaiting_header() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        match item {
            Frame::Header(descriptor) => self.encode_header(&descriptor, dst),
            Frame::Body(payload) => self.encode_body(&payload, dst),
        }
    }
}

/// Writes one length-prefixed JSON message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json =
        serde_json::to_vec(message).map_err(|e| FrameError::Malformed(Arc::from(e.to_string())))?;
    if json.len() > MAX_HEADER_LEN {
        return Err(FrameError::HeaderTooLarge {
            len: json.len(),
            max: MAX_HEADER_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + json.len());
    put_frame(&json, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON message of at most `max_len` bytes.
pub async fn read_message<R, T>(reader: &mut R, max_len: usize) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Err(FrameError::EmptyHeader);
    }
    if len > max_len {
        return Err(FrameError::HeaderTooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| FrameError::Malformed(Arc::from(e.to_string())))
}
