//! Byte encoding of snapshots for stores that hold opaque values.
//!
//! The format is JSON: `{"status":200,"headers":[["name","value"],...],"body":"<base64>"}`.
//! Header order and repeated names are preserved.

use bytes::Bytes;

use super::{ResponseSnapshot, StoreError};

/// Encodes a snapshot for storage.
///
/// # Errors
///
/// Returns [`StoreError::Codec`] if serialization fails.
pub fn encode(snapshot: &ResponseSnapshot) -> Result<Bytes, StoreError> {
    Ok(Bytes::from(serde_json::to_vec(snapshot)?))
}

/// Decodes a stored snapshot.
///
/// # Errors
///
/// Returns [`StoreError::Codec`] for malformed payloads, including status
/// codes outside `100..=599`.
pub fn decode(payload: &[u8]) -> Result<ResponseSnapshot, StoreError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, StatusCode};

    #[test]
    fn repeated_headers_and_binary_body_survive() {
        let mut headers = Headers::new();
        headers.insert("Set-Cookie", "a=1");
        headers.insert("X-Trace", "t");
        headers.insert("set-cookie", "b=2");
        let body = vec![0_u8, 159, 146, 150, 255];
        let snapshot = ResponseSnapshot::new(StatusCode::CREATED, headers, body);

        let decoded = decode(&encode(&snapshot).unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        let pairs: Vec<_> = decoded.headers().iter().collect();
        assert_eq!(pairs[2], ("set-cookie", "b=2"));
    }

    #[test]
    fn out_of_range_status_is_rejected() {
        let payload = br#"{"status":700,"headers":[],"body":""}"#;
        assert!(matches!(decode(payload), Err(StoreError::Codec(_))));
    }

    #[test]
    fn garbage_is_a_codec_error_not_a_miss() {
        let err = decode(b"not json").unwrap_err();
        assert!(!err.is_miss());
    }
}
