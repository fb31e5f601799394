//! Frame codec
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of an
//! encoded [`Message`] envelope. [`CellaservFrameCodec`] only deals with the
//! length prefix; [`Frame`] pairs the raw envelope bytes with their decoded
//! form so routed traffic can be forwarded without re-encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::messages::*;

/// Largest frame accepted from a peer unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame too big: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Length-prefixed framing for broker connections.
#[derive(Debug, Clone)]
pub struct CellaservFrameCodec {
    max_frame_size: usize,
}

impl CellaservFrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for CellaservFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CellaservFrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek at the length without consuming it
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        let total_len = LENGTH_PREFIX + frame_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total_len);
        frame.advance(LENGTH_PREFIX);
        Ok(Some(frame.freeze()))
    }
}

impl Encoder<Bytes> for CellaservFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(item.len()).map_err(|_| FrameError::FrameTooLarge {
            size: item.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// A received envelope together with the exact bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub raw: Bytes,
    pub message: Message,
}

impl Frame {
    /// Decode the outer envelope. Failure here means the stream is corrupt.
    pub fn decode(raw: Bytes) -> Result<Self, prost::DecodeError> {
        let message = Message::decode(raw.clone())?;
        Ok(Self { raw, message })
    }

    /// `None` when the peer sent a type this broker does not know.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.message.r#type).ok()
    }
}

/// Wrap an already encoded body into an envelope.
pub fn encode_envelope(kind: MessageType, content: Bytes) -> Bytes {
    let message = Message {
        r#type: kind as i32,
        content,
    };
    Bytes::from(message.encode_to_vec())
}

pub fn encode_body<M: prost::Message>(kind: MessageType, body: &M) -> Bytes {
    encode_envelope(kind, Bytes::from(body.encode_to_vec()))
}

pub fn encode_reply(id: u64, data: Option<Bytes>) -> Bytes {
    encode_body(
        MessageType::Reply,
        &Reply {
            error: None,
            id,
            data,
        },
    )
}

pub fn encode_error_reply(id: u64, kind: ErrorType) -> Bytes {
    encode_body(
        MessageType::Reply,
        &Reply {
            error: Some(ReplyError {
                r#type: kind as i32,
                what: None,
            }),
            id,
            data: None,
        },
    )
}

pub fn encode_publish(event: &str, data: Option<Bytes>) -> Bytes {
    encode_body(
        MessageType::Publish,
        &Publish {
            event: event.to_string(),
            data,
        },
    )
}
