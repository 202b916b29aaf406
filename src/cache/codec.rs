//! Value encoding for cache entries: JSON, optionally gzip-compressed.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::CacheError;

/// Serialized value ready to be stored.
pub(crate) struct Encoded {
    pub payload: Vec<u8>,
    pub compressed: bool,
}

/// Serialize `value`; gzip it when asked and larger than `threshold` bytes.
pub(crate) fn encode<T: Serialize + ?Sized>(
    value: &T,
    compress: bool,
    threshold: usize,
) -> Result<Encoded, CacheError> {
    let raw = serde_json::to_vec(value).map_err(CacheError::Encode)?;
    if !compress || raw.len() <= threshold {
        return Ok(Encoded {
            payload: raw,
            compressed: false,
        });
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(&raw)?;
    Ok(Encoded {
        payload: encoder.finish()?,
        compressed: true,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(payload: &[u8], compressed: bool) -> Result<T, CacheError> {
    if !compressed {
        return serde_json::from_slice(payload).map_err(CacheError::Decode);
    }

    let mut raw = Vec::with_capacity(payload.len() * 2);
    GzDecoder::new(payload).read_to_end(&mut raw)?;
    serde_json::from_slice(&raw).map_err(CacheError::Decode)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn large_value() -> Value {
        let rows: Vec<Value> = (0..200)
            .map(|i| json!({ "vendor": "acme", "amount": i, "currency": "USD" }))
            .collect();
        json!({ "rows": rows })
    }

    #[test]
    fn small_values_stay_uncompressed() {
        let encoded = encode(&json!({"total": 1}), true, 1024).expect("encode");
        assert!(!encoded.compressed);
        let decoded: Value = decode(&encoded.payload, encoded.compressed).expect("decode");
        assert_eq!(decoded, json!({"total": 1}));
    }

    #[test]
    fn large_values_compress_transparently() {
        let value = large_value();
        let plain = serde_json::to_vec(&value).expect("serialize");
        let encoded = encode(&value, true, 1024).expect("encode");

        assert!(encoded.compressed);
        assert!(encoded.payload.len() < plain.len());
        let decoded: Value = decode(&encoded.payload, true).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn compression_is_opt_in() {
        let encoded = encode(&large_value(), false, 16).expect("encode");
        assert!(!encoded.compressed);
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        let result: Result<Value, _> = decode(b"not gzip", true);
        assert!(matches!(result, Err(CacheError::Compression(_))));
    }
}
