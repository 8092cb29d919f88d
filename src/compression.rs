//! Size-thresholded payload compression for the communication layer.
//!
//! Uses zstd with magic-bytes detection, so a stored payload says for itself
//! whether it needs decoding. Payloads below the threshold are kept as-is:
//! for small responses the frame overhead outweighs the savings.
//!
//! # Feature Flag
//!
//! zstd is behind the `compression` feature (on by default). Without it the
//! compressor stores everything uncompressed and refuses zstd input.
//!
//! # Example
//!
//! ```rust,ignore
//! use sync_optimizer::compression::DataCompressor;
//!
//! let compressor = DataCompressor::new(true, 1024, 3);
//! let payload = compressor.compress(&big_json_bytes)?;
//! let restored = compressor.decompress(&payload.bytes)?;
//! ```

use serde::{de::DeserializeOwned, Serialize};

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default size below which payloads are not compressed
pub const DEFAULT_THRESHOLD_BYTES: usize = 1024;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Failed to (de)serialize JSON
    #[error("JSON parse failed: {0}")]
    JsonParseFailed(#[from] serde_json::Error),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Result of [`DataCompressor::compress`]
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub original_len: usize,
}

impl CompressedPayload {
    /// Stored size / original size (1.0 when stored uncompressed or empty).
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.original_len == 0 {
            return 1.0;
        }
        self.bytes.len() as f64 / self.original_len as f64
    }

    /// Bytes saved (0 if compression expanded the data)
    #[must_use]
    pub fn savings(&self) -> usize {
        self.original_len.saturating_sub(self.bytes.len())
    }
}

#[derive(Debug, Clone)]
pub struct DataCompressor {
    enabled: bool,
    threshold_bytes: usize,
    level: i32,
}

impl Default for DataCompressor {
    fn default() -> Self {
        Self::new(true, DEFAULT_THRESHOLD_BYTES, DEFAULT_COMPRESSION_LEVEL)
    }
}

impl DataCompressor {
    #[must_use]
    pub fn new(enabled: bool, threshold_bytes: usize, level: i32) -> Self {
        Self {
            enabled,
            threshold_bytes,
            level,
        }
    }

    #[must_use]
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Whether compression can actually happen in this build.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && cfg!(feature = "compression")
    }

    /// Compress when enabled and `data.len() >= threshold_bytes`.
    pub fn compress(&self, data: &[u8]) -> Result<CompressedPayload, CompressionError> {
        let original_len = data.len();
        if !self.is_active() || original_len < self.threshold_bytes {
            return Ok(CompressedPayload {
                bytes: data.to_vec(),
                compressed: false,
                original_len,
            });
        }

        let bytes = self.encode(data)?;
        crate::metrics::record_compression(original_len, bytes.len());
        Ok(CompressedPayload {
            bytes,
            compressed: true,
            original_len,
        })
    }

    /// Decode stored bytes; uncompressed input is returned unchanged.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if is_compressed(data) {
            decode(data)
        } else {
            Ok(data.to_vec())
        }
    }

    /// Serialize to JSON, then [`compress`](Self::compress).
    pub fn compress_json<T: Serialize>(&self, value: &T) -> Result<CompressedPayload, CompressionError> {
        let bytes = serde_json::to_vec(value)?;
        self.compress(&bytes)
    }

    /// [`decompress`](Self::decompress), then parse JSON.
    pub fn decompress_json<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CompressionError> {
        let bytes = self.decompress(data)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[cfg(feature = "compression")]
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
    }

    #[cfg(not(feature = "compression"))]
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }
}

#[cfg(feature = "compression")]
fn decode(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

#[cfg(not(feature = "compression"))]
fn decode(_data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Err(CompressionError::DecompressFailed(
        "zstd payload but compression feature is disabled".into(),
    ))
}
