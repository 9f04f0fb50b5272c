//! Length-prefixed wire framing.
//!
//! Every frame on the wire is a big-endian 24-byte header followed by the
//! payload:
//!
//! ```text
//! [0..8)    length   = 16 + payload length
//! [8..16)   message id
//! [16..18)  message type
//! [18..24)  reserved, zero on write and ignored on read
//! [24..)    payload
//! ```

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Largest body a peer may declare before the stream is considered broken.
pub const MAX_FRAME_SIZE: u64 = 1024 * 1024 * 1024;

pub const LENGTH_PREFIX_SIZE: usize = 8;
/// id + type + reserved block.
pub const MIN_BODY_SIZE: usize = 16;
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + MIN_BODY_SIZE;
const RESERVED_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub kind: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u64, kind: impl Into<u16>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Splits a body (everything after the length prefix) into its fields.
    /// Returns `None` when the body cannot hold the id, type and reserved block.
    pub fn from_body(mut body: Bytes) -> Option<Self> {
        if body.len() < MIN_BODY_SIZE {
            return None;
        }
        let id = body.get_u64();
        let kind = body.get_u16();
        body.advance(RESERVED_SIZE);
        Some(Self {
            id,
            kind,
            payload: body,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame length {0} exceeds the limit of {MAX_FRAME_SIZE} bytes")]
    Oversized(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingLength,
    ReadingBody(usize),
    Broken(u64),
}

/// Turns an arbitrarily chunked byte stream back into frames.
///
/// Chunks are buffered and the reassembler alternates between reading an
/// 8-byte length and reading that many body bytes. Bodies too short to
/// carry a header are dropped with a warning and the stream carries on. A
/// declared length above [`MAX_FRAME_SIZE`] breaks the reassembler for good.
#[derive(Debug)]
pub struct MessageReassembler {
    buffer: BytesMut,
    state: State,
    messages: VecDeque<Frame>,
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReassembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::ReadingLength,
            messages: VecDeque::new(),
        }
    }

    /// Feeds the next chunk of the stream.
    ///
    /// # Panics
    ///
    /// Panics if the reassembler is already broken. Callers must stop feeding
    /// it as soon as [`is_broken`](Self::is_broken) reports true.
    pub fn process_chunk(&mut self, chunk: &[u8]) {
        assert!(
            !self.is_broken(),
            "chunk fed to a reassembler after the stream broke"
        );
        self.buffer.extend_from_slice(chunk);
        while self.advance() {}
    }

    pub fn has_message(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn pop_message(&mut self) -> Option<Frame> {
        self.messages.pop_front()
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.state, State::Broken(_))
    }

    // Returns true when the state machine made progress.
    fn advance(&mut self) -> bool {
        match self.state {
            State::ReadingLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return false;
                }
                let declared = self.buffer.get_u64();
                if declared > MAX_FRAME_SIZE {
                    self.state = State::Broken(declared);
                    self.buffer.clear();
                    return false;
                }
                self.state = State::ReadingBody(declared as usize);
                true
            }
            State::ReadingBody(len) => {
                if self.buffer.len() < len {
                    return false;
                }
                let body = self.buffer.split_to(len).freeze();
                self.state = State::ReadingLength;
                match Frame::from_body(body) {
                    Some(frame) => self.messages.push_back(frame),
                    None => warn!(len, "Skipping frame shorter than the message header"),
                }
                true
            }
            State::Broken(_) => false,
        }
    }
}

impl Decoder for MessageReassembler {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if let State::Broken(declared) = self.state {
            return Err(FrameError::Oversized(declared));
        }
        if !src.is_empty() {
            let chunk = src.split();
            self.process_chunk(&chunk);
        }
        if let State::Broken(declared) = self.state {
            return Err(FrameError::Oversized(declared));
        }
        Ok(self.pop_message())
    }
}

/// Writes frames with the 24-byte header.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u64((MIN_BODY_SIZE + frame.payload.len()) as u64);
        dst.put_u64(frame.id);
        dst.put_u16(frame.kind);
        dst.put_bytes(0, RESERVED_SIZE);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
