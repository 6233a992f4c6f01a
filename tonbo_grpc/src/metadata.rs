//! Ordered multi-map of gRPC metadata keys and values.
//!
//! Keys are lowercase ASCII (`[0-9a-z_.-]+`). A key ending in `-bin` carries
//! raw byte values which travel base64-encoded on the wire; every other key
//! carries printable-ASCII text. Insertion order of distinct keys is
//! preserved for HTTP/2 emission.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::grpc_error;

const BINARY_SUFFIX: &str = "-bin";

// ============================================================================
// Values
// ============================================================================

/// A single metadata value: text for ordinary keys, bytes for `-bin` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Text(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        MetadataValue::Binary(value)
    }
}

impl From<&[u8]> for MetadataValue {
    fn from(value: &[u8]) -> Self {
        MetadataValue::Binary(value.to_vec())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum MetadataError {
    InvalidKey(String),
    InvalidValue(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(key) => write!(f, "Metadata key \"{}\" contains illegal characters", key),
            Self::InvalidValue(key) => write!(f, "Metadata value for key \"{}\" has the wrong kind", key),
        }
    }
}

impl std::error::Error for MetadataError {}

// ============================================================================
// Metadata
// ============================================================================

/// Ordered multi-map of gRPC header keys to values.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, Vec<MetadataValue>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the value sequence stored under `key`.
    pub fn set(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = normalize_key(key.as_ref())?;
        let value = check_value(&key, value.into())?;
        match self.entry_mut(&key) {
            Some(values) => *values = vec![value],
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Appends `value` to the sequence stored under `key`.
    pub fn add(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = normalize_key(key.as_ref())?;
        let value = check_value(&key, value.into())?;
        match self.entry_mut(&key) {
            Some(values) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Drops every value stored under `key`.
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    /// The value sequence for `key`, possibly empty.
    pub fn get(&self, key: &str) -> &[MetadataValue] {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// The first text value for `key`, if any.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).iter().find_map(MetadataValue::as_text)
    }

    /// Appends every value of `other`, key by key.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            match self.entry_mut(key) {
                Some(existing) => existing.extend(values.iter().cloned()),
                None => self.entries.push((key.clone(), values.clone())),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.as_str(), v)))
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut Vec<MetadataValue>> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values)
    }

    // ------------------------------------------------------------------------
    // HTTP/2 round trip
    // ------------------------------------------------------------------------

    /// Converts to an HTTP/2 header block. Binary values are base64-encoded;
    /// each stored value becomes its own header entry.
    pub fn to_http2_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, values) in &self.entries {
            let name = match HeaderName::from_bytes(key.as_bytes()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            for value in values {
                let encoded = match value {
                    MetadataValue::Text(text) => HeaderValue::from_str(text),
                    MetadataValue::Binary(bytes) => HeaderValue::from_str(&STANDARD.encode(bytes)),
                };
                if let Ok(encoded) = encoded {
                    headers.append(name.clone(), encoded);
                }
            }
        }
        headers
    }

    /// Imports an HTTP/2 header block.
    ///
    /// Reserved pseudo-headers (`:`-prefixed) are skipped. `-bin` values are
    /// base64-decoded. Custom (non-`grpc-`) headers follow the comma-split
    /// convention when several values arrive concatenated on one line;
    /// `grpc-` keys are one header per value and are never split.
    pub fn from_http2_headers(headers: &HeaderMap) -> Metadata {
        let mut metadata = Metadata::new();
        for (name, value) in headers.iter() {
            let key = name.as_str();
            if key.starts_with(':') {
                continue;
            }
            if key.ends_with(BINARY_SUFFIX) {
                for piece in split_custom(key, value.as_bytes()) {
                    match decode_base64(&piece) {
                        Some(bytes) => {
                            let _ = metadata.add(key, bytes);
                        }
                        None => grpc_error!("Dropping malformed binary metadata value for {}", key),
                    }
                }
            } else {
                let Ok(text) = value.to_str() else {
                    grpc_error!("Dropping non-ASCII metadata value for {}", key);
                    continue;
                };
                for piece in split_custom(key, text.as_bytes()) {
                    let piece = String::from_utf8_lossy(&piece).into_owned();
                    if metadata.add(key, piece).is_err() {
                        grpc_error!("Dropping malformed metadata entry for {}", key);
                    }
                }
            }
        }
        metadata
    }
}

impl PartialEq for Metadata {
    /// Key order is irrelevant; value order within a key is not.
    fn eq(&self, other: &Metadata) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(key, values)| other.get(key) == values.as_slice())
    }
}

// ============================================================================
// Key and value rules
// ============================================================================

fn normalize_key(key: &str) -> Result<String, MetadataError> {
    let key = key.to_ascii_lowercase();
    let legal = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'));
    if legal {
        Ok(key)
    } else {
        Err(MetadataError::InvalidKey(key))
    }
}

fn check_value(key: &str, value: MetadataValue) -> Result<MetadataValue, MetadataError> {
    match (&value, key.ends_with(BINARY_SUFFIX)) {
        (MetadataValue::Binary(_), true) => Ok(value),
        (MetadataValue::Text(text), false) => {
            if text.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
                Ok(value)
            } else {
                Err(MetadataError::InvalidValue(key.to_string()))
            }
        }
        _ => Err(MetadataError::InvalidValue(key.to_string())),
    }
}

/// Custom keys may arrive as one comma-joined line; `grpc-` keys never do.
fn split_custom(key: &str, raw: &[u8]) -> Vec<Vec<u8>> {
    if key.starts_with("grpc-") {
        vec![raw.to_vec()]
    } else {
        raw.split(|b| *b == b',')
            .map(|piece| {
                let piece = piece.strip_prefix(b" ").unwrap_or(piece);
                piece.to_vec()
            })
            .collect()
    }
}

fn decode_base64(raw: &[u8]) -> Option<Vec<u8>> {
    STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw))
        .ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_and_add_appends() {
        let mut md = Metadata::new();
        md.set("x-count", "one").unwrap();
        md.add("x-count", "two").unwrap();
        assert_eq!(md.get("x-count").len(), 2);

        md.set("x-count", "three").unwrap();
        assert_eq!(md.get("x-count"), &[MetadataValue::Text("three".into())]);
    }

    #[test]
    fn keys_are_case_normalized() {
        let mut md = Metadata::new();
        md.set("X-Token", "abc").unwrap();
        assert_eq!(md.get_text("x-token"), Some("abc"));
        assert_eq!(md.get_text("X-TOKEN"), Some("abc"));
    }

    #[test]
    fn illegal_keys_are_rejected() {
        let mut md = Metadata::new();
        assert!(md.set("x token", "v").is_err());
        assert!(md.set("", "v").is_err());
        assert!(md.set("x\u{e9}", "v").is_err());
    }

    #[test]
    fn binary_keys_require_binary_values() {
        let mut md = Metadata::new();
        assert!(md.set("x-data-bin", "text").is_err());
        assert!(md.set("x-data", b"bytes".as_slice()).is_err());
        md.set("x-data-bin", b"bytes".as_slice()).unwrap();
        md.set("x-data", "text").unwrap();
    }

    #[test]
    fn text_values_must_be_printable_ascii() {
        let mut md = Metadata::new();
        assert!(md.set("x-msg", "caf\u{e9}").is_err());
        assert!(md.set("x-msg", "tab\there").is_err());
        md.set("x-msg", "plain ascii!").unwrap();
    }

    #[test]
    fn remove_drops_all_values() {
        let mut md = Metadata::new();
        md.add("x-a", "1").unwrap();
        md.add("x-a", "2").unwrap();
        md.remove("x-a");
        assert!(md.get("x-a").is_empty());
    }

    #[test]
    fn clone_is_deep_for_binary_values() {
        let mut md = Metadata::new();
        md.set("x-raw-bin", vec![1u8, 2, 3]).unwrap();
        let mut copy = md.clone();
        if let Some((_, values)) = copy.entries.first_mut() {
            if let MetadataValue::Binary(bytes) = &mut values[0] {
                bytes[0] = 9;
            }
        }
        assert_eq!(md.get("x-raw-bin")[0].as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn merge_appends_per_key() {
        let mut a = Metadata::new();
        a.add("x-k", "1").unwrap();
        let mut b = Metadata::new();
        b.add("x-k", "2").unwrap();
        b.add("x-other", "z").unwrap();
        a.merge(&b);
        assert_eq!(a.get("x-k").len(), 2);
        assert_eq!(a.get_text("x-other"), Some("z"));
    }

    #[test]
    fn http2_round_trip_is_identity() {
        let mut md = Metadata::new();
        md.add("x-text", "hello world").unwrap();
        md.add("x-text", "second").unwrap();
        md.set("x-data-bin", b"\x00\x01\xff".as_slice()).unwrap();
        md.set("grpc-custom", "kept whole").unwrap();

        let restored = Metadata::from_http2_headers(&md.to_http2_headers());
        assert_eq!(restored, md);
    }

    #[test]
    fn reserved_keys_are_never_representable() {
        // pseudo-header names cannot be stored, so they can never be exported
        let mut md = Metadata::new();
        assert!(md.set(":path", "/Svc/Method").is_err());
        assert!(md.set(":status", "200").is_err());
        for (key, _) in md.to_http2_headers().iter().map(|(k, v)| (k.as_str(), v)) {
            assert!(!key.starts_with(':'));
        }
    }

    #[test]
    fn custom_headers_are_comma_split_on_import() {
        let mut headers = HeaderMap::new();
        headers.insert("x-many", HeaderValue::from_static("a, b,c"));
        let md = Metadata::from_http2_headers(&headers);
        let values: Vec<_> = md.get("x-many").iter().filter_map(|v| v.as_text()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn grpc_prefixed_headers_are_never_split() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-thing", HeaderValue::from_static("a, b"));
        let md = Metadata::from_http2_headers(&headers);
        assert_eq!(md.get_text("grpc-thing"), Some("a, b"));
    }

    #[test]
    fn binary_headers_are_base64_on_the_wire() {
        let mut md = Metadata::new();
        md.set("x-data-bin", b"hello".as_slice()).unwrap();
        let headers = md.to_http2_headers();
        assert_eq!(headers.get("x-data-bin").unwrap(), "aGVsbG8=");

        // unpadded values decode as well
        let mut headers = HeaderMap::new();
        headers.insert("x-data-bin", HeaderValue::from_static("aGVsbG8"));
        let md = Metadata::from_http2_headers(&headers);
        assert_eq!(md.get("x-data-bin")[0].as_bytes(), Some(b"hello".as_slice()));
    }
}
