//! zlib compression for payloads carrying the COMPRESSED flag.

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Maximum output size for decompression (align with MAX_MESSAGE_SIZE to prevent DoS)
pub const MAX_DECOMPRESSION_SIZE: usize = MAX_MESSAGE_SIZE;

/// Compresses data with zlib at the default level
///
/// # Errors
/// Returns `ProtocolError::Io` if the encoder fails
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates zlib data
///
/// Enforces a maximum output size limit to prevent decompression bombs.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - The stream is not valid zlib
/// - Output size exceeds `limit`
pub fn decompress_with_limit(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // one byte past the limit tells an exact fit from an overflow
    let mut reader = ZlibDecoder::new(data).take(limit as u64 + 1);
    reader
        .read_to_end(&mut out)
        .map_err(|_| ProtocolError::DecompressionFailure)?;
    if out.len() > limit {
        return Err(ProtocolError::DecompressionFailure);
    }
    Ok(out)
}

/// Inflates zlib data, bounded by [`MAX_DECOMPRESSION_SIZE`]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_with_limit(data, MAX_DECOMPRESSION_SIZE)
}

/// Compress data if it meets the configured threshold and actually shrinks.
/// Returns the output bytes and a flag indicating whether compression was applied.
pub fn maybe_compress(data: &[u8], threshold_bytes: usize) -> Result<(Vec<u8>, bool)> {
    if data.len() < threshold_bytes {
        return Ok((data.to_vec(), false));
    }
    let compressed = compress(data)?;
    if compressed.len() < data.len() {
        Ok((compressed, true))
    } else {
        Ok((data.to_vec(), false))
    }
}
