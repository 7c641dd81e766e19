//! Peer frame encoding and decoding.
//!
//! A frame is a run of back-to-back records, big-endian:
//!
//! ```text
//! u8     marker (always 1)
//! u32    tenant id
//! bytes  topic, one ASCII byte per character
//! u8     0x00 topic terminator
//! u32    payload length
//! bytes  payload
//! ```

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::pool::Recycle;

/// Record marker; the only value currently produced.
pub const MARKER: u8 = 1;

/// Fixed bytes per record besides topic and payload.
pub const RECORD_OVERHEAD: usize = 1 + 4 + 1 + 4;

/// Default frame capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 64 * 1024;

/// Default longest topic a decoder accepts.
pub const DEFAULT_MAX_TOPIC_LEN: usize = 1024;

/// Encoded size of one record.
pub fn encoded_len(topic: &str, payload: &[u8]) -> usize {
    RECORD_OVERHEAD + topic.len() + payload.len()
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Fixed-capacity batch of encoded records.
#[derive(Debug)]
pub struct Frame {
    buf: BytesMut,
    capacity: usize,
    messages: usize,
}

impl Frame {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            messages: 0,
        }
    }

    /// Append one record. Returns false, leaving the frame unchanged, when the
    /// record does not fit in the remaining capacity.
    pub fn try_append(&mut self, tenant: u32, topic: &str, payload: &[u8]) -> bool {
        debug_assert!(topic.bytes().all(|b| b != 0 && b.is_ascii()));
        if self.buf.len() + encoded_len(topic, payload) > self.capacity {
            return false;
        }
        self.buf.put_u8(MARKER);
        self.buf.put_u32(tenant);
        self.buf.put_slice(topic.as_bytes());
        self.buf.put_u8(0);
        self.buf.put_u32(payload.len() as u32);
        self.buf.put_slice(payload);
        self.messages += 1;
        true
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.messages = 0;
    }

    pub fn message_count(&self) -> usize {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }
}

impl Recycle for Frame {
    fn recycle(&mut self) {
        self.reset();
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unexpected record marker {marker} at offset {offset}")]
    BadMarker { marker: u8, offset: usize },
    #[error("non-ASCII topic byte at offset {0}")]
    NonAsciiTopic(usize),
    #[error("topic exceeds {max} bytes at offset {offset}")]
    TopicTooLong { max: usize, offset: usize },
    #[error("frame ends inside a record ({state:?})")]
    Truncated { state: DecodeState },
    #[error("record of {len} bytes cannot fit a frame of {capacity} bytes")]
    Oversized { len: usize, capacity: usize },
}

/// Position of the decoder inside a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeState {
    #[default]
    Header,
    Tenant,
    Topic,
    TopicContent,
    PayloadLength,
    Payload,
}

/// Streaming frame decoder.
///
/// Holds reusable parse state, so each worker owns its own decoder and
/// finishes one buffer before starting the next.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    scratch: [u8; 4],
    filled: usize,
    tenant: u32,
    topic: String,
    payload_len: usize,
    max_topic_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOPIC_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_topic_len: usize) -> Self {
        Self {
            state: DecodeState::Header,
            scratch: [0; 4],
            filled: 0,
            tenant: 0,
            topic: String::with_capacity(128),
            payload_len: 0,
            max_topic_len,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::Header;
        self.filled = 0;
        self.tenant = 0;
        self.topic.clear();
        self.payload_len = 0;
    }

    /// Feed one byte of a big-endian u32; returns the value once complete.
    fn push_u32(&mut self, byte: u8) -> Option<u32> {
        self.scratch[self.filled] = byte;
        self.filled += 1;
        if self.filled < 4 {
            return None;
        }
        self.filled = 0;
        Some(u32::from_be_bytes(self.scratch))
    }

    fn fail(&mut self, err: FrameError) -> Result<usize, FrameError> {
        self.reset();
        Err(err)
    }

    /// Decode every record in `buf`, calling `sink(tenant, topic, payload)` as
    /// each one completes. Returns the number of records delivered.
    ///
    /// Records before a malformed one have already been delivered when an
    /// error is returned; the decoder is reset either way.
    pub fn decode<F>(&mut self, buf: &[u8], mut sink: F) -> Result<usize, FrameError>
    where
        F: FnMut(u32, &str, &[u8]),
    {
        self.reset();
        let mut pos: usize = 0;
        let mut delivered = 0;
        loop {
            match self.state {
                DecodeState::Topic => {
                    self.topic.clear();
                    self.state = DecodeState::TopicContent;
                }
                DecodeState::Payload => {
                    let end = match pos.checked_add(self.payload_len) {
                        Some(end) if end <= buf.len() => end,
                        _ => {
                            let state = self.state;
                            return self.fail(FrameError::Truncated { state });
                        }
                    };
                    sink(self.tenant, &self.topic, &buf[pos..end]);
                    delivered += 1;
                    pos = end;
                    self.state = DecodeState::Header;
                }
                _ if pos == buf.len() => break,
                DecodeState::Header => {
                    let marker = buf[pos];
                    if marker != MARKER {
                        return self.fail(FrameError::BadMarker {
                            marker,
                            offset: pos,
                        });
                    }
                    pos += 1;
                    self.state = DecodeState::Tenant;
                }
                DecodeState::Tenant => {
                    if let Some(tenant) = self.push_u32(buf[pos]) {
                        self.tenant = tenant;
                        self.state = DecodeState::Topic;
                    }
                    pos += 1;
                }
                DecodeState::TopicContent => {
                    let byte = buf[pos];
                    if byte == 0 {
                        self.state = DecodeState::PayloadLength;
                    } else if !byte.is_ascii() {
                        return self.fail(FrameError::NonAsciiTopic(pos));
                    } else if self.topic.len() >= self.max_topic_len {
                        let max = self.max_topic_len;
                        return self.fail(FrameError::TopicTooLong { max, offset: pos });
                    } else {
                        self.topic.push(char::from(byte));
                    }
                    pos += 1;
                }
                DecodeState::PayloadLength => {
                    if let Some(len) = self.push_u32(buf[pos]) {
                        self.payload_len = len as usize;
                        self.state = DecodeState::Payload;
                    }
                    pos += 1;
                }
            }
        }
        if self.state != DecodeState::Header {
            let state = self.state;
            return self.fail(FrameError::Truncated { state });
        }
        Ok(delivered)
    }
}
