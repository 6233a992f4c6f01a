//! gRPC status codes and the terminal status carried in trailers.

use std::fmt;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::metadata::Metadata;

/// Bytes outside 0x20-0x7E plus `%` itself are escaped in `grpc-message`.
/// Non-ASCII bytes are always escaped by the encoder.
const GRPC_MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

// ============================================================================
// Codes
// ============================================================================

/// The closed set of gRPC status codes. The integer values are stable wire
/// values and must be preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_i32(value: i32) -> Option<Code> {
        use Code::*;
        Some(match value {
            0 => Ok,
            1 => Cancelled,
            2 => Unknown,
            3 => InvalidArgument,
            4 => DeadlineExceeded,
            5 => NotFound,
            6 => AlreadyExists,
            7 => PermissionDenied,
            8 => ResourceExhausted,
            9 => FailedPrecondition,
            10 => Aborted,
            11 => OutOfRange,
            12 => Unimplemented,
            13 => Internal,
            14 => Unavailable,
            15 => DataLoss,
            16 => Unauthenticated,
            _ => return None,
        })
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Status
// ============================================================================

/// The terminal result of a call: a code, human-readable details, and
/// optional trailing metadata.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: Code,
    pub details: String,
    pub metadata: Option<Metadata>,
}

impl Status {
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            metadata: None,
        }
    }

    /// The initial status of every call.
    pub fn ok() -> Self {
        Self::new(Code::Ok, "OK")
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(Code::Internal, details)
    }

    pub fn unimplemented(details: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, details)
    }

    pub fn resource_exhausted(details: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, details)
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(Code::DeadlineExceeded, "Deadline exceeded")
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Derives a status from an arbitrary error, as user-raised errors are
    /// propagated: the message when there is one, otherwise "Unknown Error".
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let message = err.to_string();
        if message.is_empty() {
            Self::new(Code::Unknown, "Unknown Error")
        } else {
            Self::new(Code::Unknown, message)
        }
    }

    /// The trailer block for this status: `grpc-status`, a percent-encoded
    /// `grpc-message`, and any attached metadata.
    pub fn to_trailers(&self) -> HeaderMap {
        let mut trailers = self
            .metadata
            .as_ref()
            .map(Metadata::to_http2_headers)
            .unwrap_or_default();
        trailers.insert(
            HeaderName::from_static("grpc-status"),
            HeaderValue::from_str(&(self.code as i32).to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("2")),
        );
        if let Ok(message) = HeaderValue::from_str(&encode_message(&self.details)) {
            trailers.insert(HeaderName::from_static("grpc-message"), message);
        }
        trailers
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.details)
    }
}

impl std::error::Error for Status {}

// ============================================================================
// grpc-message encoding
// ============================================================================

/// Percent-encodes status details for the `grpc-message` trailer.
pub fn encode_message(details: &str) -> String {
    utf8_percent_encode(details, GRPC_MESSAGE_ESCAPES).to_string()
}

/// Decodes a `grpc-message` trailer value. Decoding is lenient; malformed
/// escapes pass through untouched.
pub fn decode_message(raw: &[u8]) -> String {
    percent_decode(raw).decode_utf8_lossy().into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    #[test]
    fn wire_values_are_stable() {
        let table = [
            (Code::Ok, 0),
            (Code::Cancelled, 1),
            (Code::Unknown, 2),
            (Code::InvalidArgument, 3),
            (Code::DeadlineExceeded, 4),
            (Code::NotFound, 5),
            (Code::AlreadyExists, 6),
            (Code::PermissionDenied, 7),
            (Code::ResourceExhausted, 8),
            (Code::FailedPrecondition, 9),
            (Code::Aborted, 10),
            (Code::OutOfRange, 11),
            (Code::Unimplemented, 12),
            (Code::Internal, 13),
            (Code::Unavailable, 14),
            (Code::DataLoss, 15),
            (Code::Unauthenticated, 16),
        ];
        for (code, value) in table {
            assert_eq!(code as i32, value);
            assert_eq!(Code::from_i32(value), Some(code));
        }
        assert_eq!(Code::from_i32(17), None);
        assert_eq!(Code::from_i32(-1), None);
    }

    #[test]
    fn ascii_details_pass_through_unescaped() {
        assert_eq!(encode_message("plain message"), "plain message");
    }

    #[test]
    fn non_ascii_details_round_trip() {
        let original = "\u{6e2c}\u{8a66}\u{5b57}\u{7b26}\u{4e32}";
        let encoded = encode_message(original);
        assert!(encoded.chars().all(|c| c.is_ascii()));
        assert_eq!(decode_message(encoded.as_bytes()), original);
    }

    #[test]
    fn percent_sign_is_escaped() {
        assert_eq!(encode_message("50% done"), "50%25 done");
        assert_eq!(decode_message(b"50%25 done"), "50% done");
    }

    #[test]
    fn lenient_decode_keeps_malformed_escapes() {
        assert_eq!(decode_message(b"broken %zz escape"), "broken %zz escape");
    }

    #[test]
    fn trailers_carry_status_and_metadata() {
        let mut md = Metadata::new();
        md.set("trailer-present", "yes").unwrap();
        let status = Status::new(Code::NotFound, "missing thing").with_metadata(md);

        let trailers = status.to_trailers();
        assert_eq!(trailers.get("grpc-status").unwrap(), "5");
        assert_eq!(trailers.get("grpc-message").unwrap(), "missing thing");
        assert_eq!(trailers.get("trailer-present").unwrap(), "yes");
    }
}
