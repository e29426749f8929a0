//! The unit of replication and its wire encodings.
//!
//! An [`Envelope`] pairs a value with the time it was last modified. The
//! default [`JsonCodec`] produces:
//!
//! ```text
//! {"value":<T>,"modifiedAt":<epoch ms>}
//! ```
//!
//! [`PostcardCodec`] produces a compact binary form of the same pair. Both
//! peers must agree on the codec; bytes of one are a decode error for the
//! other.
//!
//! # Example
//!
//! ```
//! use pairsync::{Codec, Envelope, JsonCodec, Timestamp};
//!
//! let envelope = Envelope::new(5_u32, Timestamp::from_millis(1_000));
//! let bytes = JsonCodec.encode(&envelope).unwrap();
//! assert_eq!(bytes, br#"{"value":5,"modifiedAt":1000}"#);
//!
//! let decoded: Envelope<u32> = JsonCodec.decode(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::CodecError;

/// A value stamped with its modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    value: T,
    modified_at: Timestamp,
}

impl<T> Envelope<T> {
    /// Create an envelope.
    pub fn new(value: T, modified_at: Timestamp) -> Self {
        Self { value, modified_at }
    }

    /// The carried value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// When the value was written.
    pub fn modified_at(&self) -> Timestamp {
        self.modified_at
    }

    /// Split into value and timestamp.
    pub fn into_parts(self) -> (T, Timestamp) {
        (self.value, self.modified_at)
    }
}

/// Serialization format for envelopes.
///
/// Decoding must be pure: no I/O, no shared state.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Short name used in logs.
    const NAME: &'static str;

    /// Encode an envelope to bytes.
    fn encode<T: Serialize>(&self, envelope: &Envelope<T>) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes into an envelope.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Envelope<T>, CodecError>;
}

/// JSON encoding via `serde_json`. The default, and the one to use when the
/// peer is not written in Rust.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const NAME: &'static str = "json";

    fn encode<T: Serialize>(&self, envelope: &Envelope<T>) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Envelope<T>, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Compact binary encoding via `postcard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const NAME: &'static str = "postcard";

    fn encode<T: Serialize>(&self, envelope: &Envelope<T>) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Envelope<T>, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        volume: u8,
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refusing to serialize"))
        }
    }

    fn settings() -> Envelope<Settings> {
        Envelope::new(
            Settings {
                theme: "dark".into(),
                volume: 7,
            },
            Timestamp::from_millis(1_700_000_000_000),
        )
    }

    #[test]
    fn json_uses_camel_case_field_names() {
        let bytes = JsonCodec.encode(&settings()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["modifiedAt"], 1_700_000_000_000_u64);
        assert_eq!(json["value"]["theme"], "dark");
    }

    #[test]
    fn json_accepts_peer_produced_text() {
        let bytes = br#"{ "modifiedAt": 12, "value": { "theme": "light", "volume": 1 } }"#;
        let decoded: Envelope<Settings> = JsonCodec.decode(bytes).unwrap();

        assert_eq!(decoded.modified_at(), Timestamp::from_millis(12));
        assert_eq!(decoded.value().theme, "light");
    }

    #[test]
    fn json_rejects_missing_timestamp() {
        let err = JsonCodec.decode::<u32>(br#"{"value":1}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn json_rejects_truncated_bytes() {
        let bytes = JsonCodec.encode(&settings()).unwrap();
        let err = JsonCodec
            .decode::<Settings>(&bytes[..bytes.len() / 2])
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn json_rejects_wrong_value_type() {
        let err = JsonCodec
            .decode::<u32>(br#"{"value":"five","modifiedAt":1}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn postcard_roundtrip_is_smaller_than_json() {
        let json = JsonCodec.encode(&settings()).unwrap();
        let binary = PostcardCodec.encode(&settings()).unwrap();
        assert!(binary.len() < json.len());

        let decoded: Envelope<Settings> = PostcardCodec.decode(&binary).unwrap();
        assert_eq!(decoded, settings());
    }

    #[test]
    fn postcard_rejects_empty_input() {
        let err = PostcardCodec.decode::<Settings>(&[]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn encode_failure_is_reported() {
        let envelope = Envelope::new(Unserializable, Timestamp::EPOCH);
        assert!(matches!(
            JsonCodec.encode(&envelope),
            Err(CodecError::Encode(_))
        ));
        assert!(matches!(
            PostcardCodec.encode(&envelope),
            Err(CodecError::Encode(_))
        ));
    }
}
