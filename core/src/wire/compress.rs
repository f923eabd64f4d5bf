//! LZ4 payload compression for packet bodies.
//!
//! Applied before armor, signaled by the compressed bit in the verb byte.
//! Compression is only kept when it actually wins; a payload that inflates
//! (already-compressed or high-entropy data) is sent as-is.

use super::{WireError, COMPRESS_MIN_LEN};

/// Compress a payload if it is long enough and compression shrinks it.
/// Returns None when the original bytes should be sent unchanged.
pub fn maybe_compress(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < COMPRESS_MIN_LEN {
        return None;
    }
    let compressed = lz4_flex::compress_prepend_size(payload);
    if compressed.len() < payload.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress a payload flagged as compressed.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| WireError::Decompression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let payload = vec![0x55u8; 1200];
        let compressed = maybe_compress(&payload).expect("repetitive data must compress");
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_short_payloads_skipped() {
        assert!(maybe_compress(b"tiny").is_none());
    }

    #[test]
    fn test_incompressible_skipped() {
        use rand::RngCore;
        let mut payload = vec![0u8; 512];
        rand::rngs::OsRng.fill_bytes(&mut payload);
        assert!(maybe_compress(&payload).is_none());
    }

    #[test]
    fn test_truncated_input_errors() {
        let payload = vec![0x55u8; 1200];
        let compressed = maybe_compress(&payload).unwrap();
        assert!(decompress(&compressed[..compressed.len() / 2]).is_err());
    }
}
