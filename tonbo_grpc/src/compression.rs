//! Per-direction message compression.
//!
//! Each call carries one filter holding the outbound encoder, the inbound
//! decoder and the accept list advertised to the peer. Frames flow through
//! [`CompressionFilter::write_message`] on the way out and
//! [`CompressionFilter::read_message`] on the way in.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::codec::{frame_message, MessageFrame};
use crate::metadata::Metadata;
use crate::status::{Code, Status};

const IDENTITY_NO_COMPRESSION: &str = "Identity encoding does not support compression";

// ============================================================================
// Encodings
// ============================================================================

/// A supported message encoding. `deflate` is the zlib-wrapped stream the
/// gRPC protocol names by that token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

/// Every encoding this server accepts, in advertisement order.
pub const SUPPORTED_ENCODINGS: [Encoding; 3] = [Encoding::Identity, Encoding::Deflate, Encoding::Gzip];

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Unknown encoding names fail with `UNIMPLEMENTED`.
    pub fn from_name(name: &str) -> Result<Encoding, Status> {
        match name {
            "identity" => Ok(Encoding::Identity),
            "gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            other => Err(Status::unimplemented(format!(
                "Compression method not supported: {}",
                other
            ))),
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>, Status> {
        match self {
            Encoding::Identity => Err(Status::internal(IDENTITY_NO_COMPRESSION)),
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Status::internal(format!("Compression failed: {}", e)))
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Status::internal(format!("Compression failed: {}", e)))
            }
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut output = Vec::new();
        match self {
            Encoding::Identity => return Err(Status::internal(IDENTITY_NO_COMPRESSION)),
            Encoding::Gzip => GzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(|e| Status::internal(format!("Decompression failed: {}", e)))?,
            Encoding::Deflate => ZlibDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(|e| Status::internal(format!("Decompression failed: {}", e)))?,
        };
        Ok(output)
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Outbound encoder, inbound decoder and the peer's accept list for one call.
pub struct CompressionFilter {
    send: Encoding,
    receive: Encoding,
    peer_accepts: Vec<Encoding>,
}

impl CompressionFilter {
    pub fn new() -> Self {
        Self {
            send: Encoding::Identity,
            receive: Encoding::Identity,
            peer_accepts: vec![Encoding::Identity],
        }
    }

    pub fn send_encoding(&self) -> Encoding {
        self.send
    }

    pub fn receive_encoding(&self) -> Encoding {
        self.receive
    }

    /// The comma list advertised in `grpc-accept-encoding`.
    pub fn accept_encoding_value() -> String {
        SUPPORTED_ENCODINGS
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Applies the compression request headers and strips them from the
    /// metadata handed to user code.
    ///
    /// The send encoding is aligned to the inbound one when the peer accepts
    /// it, so responses reuse the request's encoding; otherwise sends fall
    /// back to identity.
    pub fn receive_metadata(&mut self, metadata: &mut Metadata) -> Result<(), Status> {
        if let Some(name) = metadata.get_text("grpc-encoding") {
            if name != self.receive.name() {
                self.receive = Encoding::from_name(name)?;
            }
        }

        if let Some(accept) = metadata.get_text("grpc-accept-encoding") {
            self.peer_accepts = accept
                .split(',')
                .filter_map(|name| Encoding::from_name(name.trim()).ok())
                .collect();
        }

        if self.peer_accepts.contains(&self.receive) {
            self.send = self.receive;
        } else {
            self.send = Encoding::Identity;
        }

        metadata.remove("grpc-encoding");
        metadata.remove("grpc-accept-encoding");
        Ok(())
    }

    /// Encodes (when requested and possible) and frames one outbound message.
    ///
    /// Identity never compresses and always writes flag 0, regardless of the
    /// `compress` argument.
    pub fn write_message(&self, payload: &[u8], compress: bool) -> Result<Bytes, Status> {
        let compress = compress && self.send != Encoding::Identity;
        if compress {
            let encoded = self.send.compress(payload)?;
            Ok(frame_message(&encoded, true))
        } else {
            Ok(frame_message(payload, false))
        }
    }

    /// Recovers the raw bytes of one inbound frame, decompressing when the
    /// flag is set. Identity with the flag set is an error.
    pub fn read_message(&self, frame: &MessageFrame) -> Result<Bytes, Status> {
        if frame.compressed {
            Ok(Bytes::from(self.receive.decompress(&frame.payload)?))
        } else {
            Ok(frame.payload.clone())
        }
    }
}

impl Default for CompressionFilter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
