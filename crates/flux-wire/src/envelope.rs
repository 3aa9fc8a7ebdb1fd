//! Versioned, optionally compressed envelope for reliable-channel payloads.
//!
//! Action batches travel over the reliable channel as one envelope each:
//!
//! ```text
//! +-------------+----------------+------------------------------+
//! | version: u8 | compression: u8 | postcard body (maybe LZ4)   |
//! +-------------+----------------+------------------------------+
//! ```
//!
//! Bodies smaller than [`EnvelopeConfig::compression_threshold`] skip
//! compression to avoid overhead.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Compression flag: body is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: body is LZ4-compressed with a prepended size.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when bodies are compressed.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Minimum body size (bytes) before compression is applied. Default: 256.
    pub compression_threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub compression_enabled: bool,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 256,
            compression_enabled: true,
        }
    }
}

/// Errors that can occur while opening or sealing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The payload is shorter than the two header bytes.
    #[error("envelope too short: {0} bytes")]
    Truncated(usize),

    /// The version byte does not match [`ENVELOPE_VERSION`].
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),

    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Serialize `value` and wrap it in an envelope.
pub fn seal<T: Serialize>(value: &T, config: &EnvelopeConfig) -> Result<Vec<u8>, EnvelopeError> {
    let body = postcard::to_allocvec(value)?;

    let compress = config.compression_enabled && body.len() >= config.compression_threshold;
    let (flag, body) = if compress {
        (COMPRESSION_FLAG_LZ4, compress_prepend_size(&body))
    } else {
        (COMPRESSION_FLAG_NONE, body)
    };

    let mut out = Vec::with_capacity(2 + body.len());
    out.push(ENVELOPE_VERSION);
    out.push(flag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Unwrap an envelope and deserialize its body.
pub fn open<T: DeserializeOwned>(data: &[u8]) -> Result<T, EnvelopeError> {
    let [version, flag, body @ ..] = data else {
        return Err(EnvelopeError::Truncated(data.len()));
    };
    if *version != ENVELOPE_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(*version));
    }

    match *flag {
        COMPRESSION_FLAG_NONE => Ok(postcard::from_bytes(body)?),
        COMPRESSION_FLAG_LZ4 => {
            let decompressed = decompress_size_prepended(body)
                .map_err(|e| EnvelopeError::DecompressFailed(e.to_string()))?;
            Ok(postcard::from_bytes(&decompressed)?)
        }
        other => Err(EnvelopeError::UnknownFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    fn sample(len: usize) -> Sample {
        Sample {
            name: "batch".to_string(),
            values: vec![7; len],
        }
    }

    #[test]
    fn test_small_body_is_not_compressed() {
        let bytes = seal(&sample(2), &EnvelopeConfig::default()).unwrap();
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        assert_eq!(bytes[1], COMPRESSION_FLAG_NONE);
        assert_eq!(open::<Sample>(&bytes).unwrap(), sample(2));
    }

    #[test]
    fn test_large_body_is_compressed() {
        let value = sample(4096);
        let raw_len = postcard::to_allocvec(&value).unwrap().len();
        let bytes = seal(&value, &EnvelopeConfig::default()).unwrap();
        assert_eq!(bytes[1], COMPRESSION_FLAG_LZ4);
        assert!(bytes.len() < raw_len);
        assert_eq!(open::<Sample>(&bytes).unwrap(), value);
    }

    #[test]
    fn test_compression_disabled() {
        let config = EnvelopeConfig {
            compression_enabled: false,
            ..EnvelopeConfig::default()
        };
        let bytes = seal(&sample(4096), &config).unwrap();
        assert_eq!(bytes[1], COMPRESSION_FLAG_NONE);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        assert!(matches!(open::<Sample>(&[]), Err(EnvelopeError::Truncated(0))));
        assert!(matches!(
            open::<Sample>(&[ENVELOPE_VERSION]),
            Err(EnvelopeError::Truncated(1))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = seal(&sample(1), &EnvelopeConfig::default()).unwrap();
        bytes[0] = 255;
        assert!(matches!(
            open::<Sample>(&bytes),
            Err(EnvelopeError::UnsupportedVersion(255))
        ));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut bytes = seal(&sample(1), &EnvelopeConfig::default()).unwrap();
        bytes[1] = 0xFF;
        assert!(matches!(
            open::<Sample>(&bytes),
            Err(EnvelopeError::UnknownFlag(0xFF))
        ));
    }

    #[test]
    fn test_corrupted_body_rejected() {
        let result = open::<Sample>(&[ENVELOPE_VERSION, COMPRESSION_FLAG_NONE, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
