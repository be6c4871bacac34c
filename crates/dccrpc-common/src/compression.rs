//! zlib compression of frame bodies and transfer payloads.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::protocol::error::{Result, RpcError};

/// Default size above which payloads get compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates a zlib stream of at most `limit` bytes.
///
/// Corrupt input, and output that would grow past `limit`, are reported as
/// [`RpcError::Integrity`].
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| RpcError::Integrity(format!("Failed to decompress data: {}", e)))?;
    if out.len() > limit {
        return Err(RpcError::Integrity(format!(
            "Decompressed data exceeds {} bytes",
            limit
        )));
    }
    Ok(out)
}

/// Payloads strictly larger than the threshold are compressed.
pub fn should_compress(len: usize, threshold: usize) -> bool {
    len > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_shrinks_repetitive_data() {
        let data = b"maya-1 ".repeat(1000);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_decompress_garbage_is_integrity_error() {
        let err = decompress(b"definitely not zlib", 1024).unwrap_err();
        assert!(matches!(err, RpcError::Integrity(_)));
    }

    #[test]
    fn test_decompress_stops_at_limit() {
        let packed = compress(&vec![0u8; 64 * 1024]).unwrap();
        assert!(packed.len() < 1024);
        assert_eq!(decompress(&packed, 64 * 1024).unwrap().len(), 64 * 1024);

        let err = decompress(&packed, 64 * 1024 - 1).unwrap_err();
        assert!(matches!(err, RpcError::Integrity(_)));
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert!(!should_compress(1024, 1024));
        assert!(should_compress(1025, 1024));
    }
}
