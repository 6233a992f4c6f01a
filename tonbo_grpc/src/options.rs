//! Server configuration.
//!
//! The typed struct is the native surface; [`ServerOptions::from_wire`]
//! accepts the `grpc.`-prefixed channel-argument names for callers holding
//! the process-visible key/value form, where `-1` denotes "no limit".

use crate::error::ServerError;

pub const DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;
pub const DEFAULT_KEEPALIVE_TIME_MS: u64 = 7_200_000;
pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// HTTP/2 concurrent stream cap; `None` leaves the transport default.
    pub max_concurrent_streams: Option<u32>,
    /// HTTP/2 frame size; `None` leaves the transport default.
    pub max_frame_size: Option<u32>,
    pub keepalive_time_ms: u64,
    pub keepalive_timeout_ms: u64,
    /// `None` means unlimited.
    pub max_send_message_length: Option<usize>,
    /// `None` means unlimited.
    pub max_receive_message_length: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_streams: None,
            max_frame_size: None,
            keepalive_time_ms: DEFAULT_KEEPALIVE_TIME_MS,
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            max_send_message_length: None,
            max_receive_message_length: Some(DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH),
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent_streams(mut self, value: u32) -> Self {
        self.max_concurrent_streams = Some(value);
        self
    }

    pub fn max_frame_size(mut self, value: u32) -> Self {
        self.max_frame_size = Some(value);
        self
    }

    pub fn keepalive_time_ms(mut self, value: u64) -> Self {
        self.keepalive_time_ms = value;
        self
    }

    pub fn keepalive_timeout_ms(mut self, value: u64) -> Self {
        self.keepalive_timeout_ms = value;
        self
    }

    /// `None` lifts the limit.
    pub fn max_send_message_length(mut self, value: Option<usize>) -> Self {
        self.max_send_message_length = value;
        self
    }

    /// `None` lifts the limit.
    pub fn max_receive_message_length(mut self, value: Option<usize>) -> Self {
        self.max_receive_message_length = value;
        self
    }

    /// Builds options from `grpc.`-prefixed channel-argument pairs.
    /// Unknown keys are a construction error.
    pub fn from_wire<'a, I>(pairs: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            match key {
                "grpc.max_concurrent_streams" => {
                    options.max_concurrent_streams = Some(positive(key, value)? as u32);
                }
                "grpc.http2.max_frame_size" => {
                    let size = positive(key, value)?;
                    // the legal HTTP/2 SETTINGS_MAX_FRAME_SIZE range
                    if !(16_384..=16_777_215).contains(&size) {
                        return Err(ServerError::InvalidOption(format!(
                            "{} must be between 16384 and 16777215, got {}",
                            key, size
                        )));
                    }
                    options.max_frame_size = Some(size as u32);
                }
                "grpc.keepalive_time_ms" => {
                    options.keepalive_time_ms = positive(key, value)?;
                }
                "grpc.keepalive_timeout_ms" => {
                    options.keepalive_timeout_ms = positive(key, value)?;
                }
                "grpc.max_send_message_length" => {
                    options.max_send_message_length = length_limit(key, value)?;
                }
                "grpc.max_receive_message_length" => {
                    options.max_receive_message_length = length_limit(key, value)?;
                }
                unknown => {
                    return Err(ServerError::InvalidOption(format!(
                        "unrecognized key {}",
                        unknown
                    )))
                }
            }
        }
        Ok(options)
    }
}

fn positive(key: &str, value: i64) -> Result<u64, ServerError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ServerError::InvalidOption(format!("{} must be positive, got {}", key, value)))
}

/// `-1` lifts the limit; other negatives are rejected.
fn length_limit(key: &str, value: i64) -> Result<Option<usize>, ServerError> {
    match value {
        -1 => Ok(None),
        v if v >= 0 => Ok(Some(v as usize)),
        v => Err(ServerError::InvalidOption(format!(
            "{} must be -1 or non-negative, got {}",
            key, v
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let options = ServerOptions::default();
        assert_eq!(options.keepalive_time_ms, 7_200_000);
        assert_eq!(options.keepalive_timeout_ms, 20_000);
        assert_eq!(options.max_send_message_length, None);
        assert_eq!(options.max_receive_message_length, Some(4 * 1024 * 1024));
        assert_eq!(options.max_frame_size, None);
    }

    #[test]
    fn wire_keys_are_applied() {
        let options = ServerOptions::from_wire([
            ("grpc.max_concurrent_streams", 64),
            ("grpc.keepalive_time_ms", 30_000),
            ("grpc.max_receive_message_length", 1024),
        ])
        .unwrap();
        assert_eq!(options.max_concurrent_streams, Some(64));
        assert_eq!(options.keepalive_time_ms, 30_000);
        assert_eq!(options.max_receive_message_length, Some(1024));
    }

    #[test]
    fn minus_one_lifts_length_limits() {
        let options = ServerOptions::from_wire([
            ("grpc.max_send_message_length", -1),
            ("grpc.max_receive_message_length", -1),
        ])
        .unwrap();
        assert_eq!(options.max_send_message_length, None);
        assert_eq!(options.max_receive_message_length, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ServerOptions::from_wire([("grpc.nonsense", 1)]).unwrap_err();
        assert!(matches!(err, ServerError::InvalidOption(_)));
    }

    #[test]
    fn negative_keepalive_is_rejected() {
        assert!(ServerOptions::from_wire([("grpc.keepalive_time_ms", -5)]).is_err());
    }

    #[test]
    fn frame_size_must_be_in_http2_range() {
        assert!(ServerOptions::from_wire([("grpc.http2.max_frame_size", 100)]).is_err());
        assert!(ServerOptions::from_wire([("grpc.http2.max_frame_size", 16_384)]).is_ok());
    }
}
