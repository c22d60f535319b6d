//! Compressed sub-payload decoding.
//!
//! Streams whose names end in `.z` carry a payload that is a base64 string
//! wrapping a raw deflate stream (no zlib header) wrapping UTF-8 JSON.
//! [`decode`] reverses all three layers in one call.

use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::DeflateDecoder;
use serde_json::Value;

use crate::error::{FeedError, Result};

/// Decodes a `.z` stream payload: base64, then raw deflate, then JSON.
///
/// Input padding is normalized before base64 decoding; upstream sometimes
/// ships unpadded strings.
pub fn decode(encoded: &str) -> Result<Value> {
    let trimmed = encoded.trim();
    let mut padded = trimmed.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let compressed = BASE64
        .decode(padded.as_bytes())
        .map_err(|e| FeedError::decode_error("base64", e.to_string()))?;

    let mut inflated = String::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_string(&mut inflated)
        .map_err(|e| FeedError::decode_error("deflate", e.to_string()))?;

    serde_json::from_str(&inflated)
        .map_err(|e| FeedError::decode_error("json", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use proptest::prelude::*;
    use serde_json::json;
    use std::io::Write as _;

    /// Inverse of `decode`, producing the unpadded form seen on the wire.
    fn encode(value: &Value) -> String {
        let json = serde_json::to_string(value).unwrap();
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        BASE64.encode(&compressed).trim_end_matches('=').to_string()
    }

    #[test]
    fn decodes_round_trip() {
        let payload = json!({
            "Entries": {
                "1": {"Channels": {"0": 11365, "2": 292, "3": 8}},
                "44": {"Channels": {"0": 11102, "2": 287, "3": 8}},
            }
        });
        let encoded = encode(&payload);
        assert_eq!(decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn accepts_padded_and_unpadded_input() {
        let payload = json!({"Status": "AllClear"});
        let unpadded = encode(&payload);
        let mut padded = unpadded.clone();
        while padded.len() % 4 != 0 {
            padded.push('=');
        }
        assert_eq!(decode(&unpadded).unwrap(), payload);
        assert_eq!(decode(&padded).unwrap(), payload);
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = decode("!!!not base64!!!").unwrap_err();
        assert!(matches!(err, FeedError::Decode { ref context, .. } if context == "base64"));
    }

    #[test]
    fn rejects_valid_base64_invalid_deflate() {
        let garbage = BASE64.encode(b"this is not a deflate stream");
        let err = decode(&garbage).unwrap_err();
        assert!(matches!(err, FeedError::Decode { ref context, .. } if context == "deflate"));
    }

    #[test]
    fn rejects_deflated_non_json() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain text, not json").unwrap();
        let encoded = BASE64.encode(encoder.finish().unwrap());
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, FeedError::Decode { ref context, .. } if context == "json"));
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_objects(
            keys in proptest::collection::vec("[A-Za-z0-9]{1,8}", 0..8),
            values in proptest::collection::vec(-1e9f64..1e9f64, 0..8),
        ) {
            let mut map = serde_json::Map::new();
            for (k, v) in keys.iter().zip(values.iter()) {
                map.insert(k.clone(), json!(v));
            }
            let payload = Value::Object(map);
            let decoded = decode(&encode(&payload)).unwrap();
            prop_assert_eq!(decoded, payload);
        }
    }
}
