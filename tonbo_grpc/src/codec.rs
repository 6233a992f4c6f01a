//! Length-prefixed message deframing.
//!
//! A framed gRPC message is one compression-flag byte, a four-byte
//! big-endian length, and that many payload bytes. HTTP/2 DATA frames carve
//! this up arbitrarily; the decoder buffers partial headers and payloads
//! across chunk boundaries and liberates complete messages as they land.

use bytes::{Bytes, BytesMut};

use crate::status::{Code, Status};

/// Compression flag plus big-endian length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// One complete length-prefixed message as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub compressed: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NoData,
    ReadingSize,
    ReadingMessage,
}

/// Incremental deframer for one inbound stream.
///
/// No size limit is enforced here; callers compare each frame's length
/// against `max_receive_message_length` before accepting the payload.
pub struct StreamDecoder {
    state: DecodeState,
    compressed: bool,
    size: [u8; 4],
    size_filled: usize,
    message: BytesMut,
    message_length: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::NoData,
            compressed: false,
            size: [0; 4],
            size_filled: 0,
            message: BytesMut::new(),
            message_length: 0,
        }
    }

    /// Consumes one chunk and returns every complete message it liberates,
    /// in wire order.
    pub fn write(&mut self, chunk: &[u8]) -> Result<Vec<MessageFrame>, Status> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < chunk.len() {
            match self.state {
                DecodeState::NoData => {
                    self.compressed = match chunk[offset] {
                        0 => false,
                        1 => true,
                        flag => {
                            return Err(Status::internal(format!(
                                "Invalid compression flag: {} (valid flags are 0 and 1)",
                                flag
                            )))
                        }
                    };
                    offset += 1;
                    self.size_filled = 0;
                    self.state = DecodeState::ReadingSize;
                }
                DecodeState::ReadingSize => {
                    let take = (4 - self.size_filled).min(chunk.len() - offset);
                    self.size[self.size_filled..self.size_filled + take]
                        .copy_from_slice(&chunk[offset..offset + take]);
                    self.size_filled += take;
                    offset += take;

                    if self.size_filled == 4 {
                        self.message_length = u32::from_be_bytes(self.size) as usize;
                        if self.message_length == 0 {
                            frames.push(MessageFrame {
                                compressed: self.compressed,
                                payload: Bytes::new(),
                            });
                            self.state = DecodeState::NoData;
                        } else {
                            self.message = BytesMut::with_capacity(self.message_length);
                            self.state = DecodeState::ReadingMessage;
                        }
                    }
                }
                DecodeState::ReadingMessage => {
                    let take = (self.message_length - self.message.len()).min(chunk.len() - offset);
                    self.message.extend_from_slice(&chunk[offset..offset + take]);
                    offset += take;

                    if self.message.len() == self.message_length {
                        frames.push(MessageFrame {
                            compressed: self.compressed,
                            payload: std::mem::take(&mut self.message).freeze(),
                        });
                        self.state = DecodeState::NoData;
                    }
                }
            }
        }

        Ok(frames)
    }

    /// The declared length of the message currently being read.
    pub fn pending_length(&self) -> Option<usize> {
        match self.state {
            DecodeState::ReadingMessage => Some(self.message_length),
            _ => None,
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames an already-encoded payload for the wire.
pub fn frame_message(payload: &[u8], compressed: bool) -> Bytes {
    let mut framed = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&[compressed as u8]);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed.freeze()
}

// ============================================================================
// Tests
// ============================================================================
