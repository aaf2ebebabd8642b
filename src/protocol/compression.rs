//! Batch compression.
//!
//! An outgoing batch is the framed sub-packet concatenation, optionally
//! deflated. While the link is unencrypted the batch carries a one-byte
//! method prefix (`0x00` zlib, `0x01` snappy, `0xFF` none); once encryption
//! is enabled the prefix disappears from the wire and the negotiated method
//! is applied unconditionally so the receiver can mirror without sniffing.

use crate::error::CompressionError;
use flate2::Compression;
use std::io::{Read, Write};

/// Limit on an inflated batch, to avoid out-of-memory DOS.
const BATCH_LIMIT: usize = 8 * 1024 * 1024; // 8 MiB

/// Zlib is raw deflate at level 7 on this protocol.
const DEFLATE_LEVEL: Compression = Compression::new(7);

/// Wire ids for the method prefix byte.
const METHOD_ZLIB: u8 = 0x00;
const METHOD_SNAPPY: u8 = 0x01;
const METHOD_NONE: u8 = 0xFF;

/// Negotiated compression method, carried in NetworkSettings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    Zlib,
    Snappy,
    None,
}

impl CompressionMethod {
    /// Maps the NetworkSettings algorithm field.
    pub fn from_settings(raw: u16) -> Result<Self, CompressionError> {
        match raw {
            0 => Ok(Self::Zlib),
            1 => Ok(Self::Snappy),
            0xFFFF => Ok(Self::None),
            other => Err(CompressionError::UnsupportedCompression(other as u8)),
        }
    }

    pub fn to_settings(self) -> u16 {
        match self {
            Self::Zlib => 0,
            Self::Snappy => 1,
            Self::None => 0xFFFF,
        }
    }
}

/// Per-session batch compressor. Holds the negotiated method and the
/// size threshold below which batches are carried verbatim.
#[derive(Debug, Copy, Clone)]
pub struct Compressor {
    method: CompressionMethod,
    threshold: u16,
}

impl Compressor {
    pub fn new(method: CompressionMethod, threshold: u16) -> Self {
        Self { method, threshold }
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    /// Compresses a framed batch for an unencrypted link: method prefix
    /// byte followed by the (possibly deflated) frame. Below the threshold
    /// the prefix is "none" and the frame is carried verbatim.
    pub fn compress_prefixed(&self, framed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.method == CompressionMethod::None || framed.len() <= self.threshold as usize {
            let mut batch = Vec::with_capacity(framed.len() + 1);
            batch.push(METHOD_NONE);
            batch.extend_from_slice(framed);
            return Ok(batch);
        }

        let mut batch = vec![match self.method {
            CompressionMethod::Zlib => METHOD_ZLIB,
            CompressionMethod::Snappy => METHOD_SNAPPY,
            CompressionMethod::None => unreachable!(),
        }];
        batch.extend(self.deflate(framed)?);
        Ok(batch)
    }

    /// Mirror of [`Self::compress_prefixed`].
    pub fn decompress_prefixed(&self, batch: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let (&method, payload) = batch
            .split_first()
            .ok_or(CompressionError::MissingMethodByte)?;
        match method {
            METHOD_NONE => Ok(payload.to_vec()),
            METHOD_ZLIB => inflate_zlib(payload),
            METHOD_SNAPPY => inflate_snappy(payload),
            other => Err(CompressionError::UnsupportedCompression(other)),
        }
    }

    /// Compresses a framed batch for an encrypted link: no prefix byte,
    /// the negotiated method applied unconditionally.
    pub fn compress_bare(&self, framed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self.method {
            CompressionMethod::None => Ok(framed.to_vec()),
            _ => self.deflate(framed),
        }
    }

    /// Mirror of [`Self::compress_bare`].
    pub fn decompress_bare(&self, payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self.method {
            CompressionMethod::None => Ok(payload.to_vec()),
            CompressionMethod::Zlib => inflate_zlib(payload),
            CompressionMethod::Snappy => inflate_snappy(payload),
        }
    }

    fn deflate(&self, framed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self.method {
            CompressionMethod::Zlib => {
                let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), DEFLATE_LEVEL);
                encoder
                    .write_all(framed)
                    .map_err(CompressionError::Deflate)?;
                encoder.finish().map_err(CompressionError::Deflate)
            }
            CompressionMethod::Snappy => {
                Ok(snap::raw::Encoder::new().compress_vec(framed)?)
            }
            CompressionMethod::None => Ok(framed.to_vec()),
        }
    }
}

fn inflate_zlib(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut framed = Vec::new();
    flate2::read::DeflateDecoder::new(payload)
        .take(BATCH_LIMIT as u64 + 1)
        .read_to_end(&mut framed)
        .map_err(CompressionError::Inflate)?;
    if framed.len() > BATCH_LIMIT {
        return Err(CompressionError::BatchTooLarge(BATCH_LIMIT));
    }
    Ok(framed)
}

fn inflate_snappy(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if snap::raw::decompress_len(payload)? > BATCH_LIMIT {
        return Err(CompressionError::BatchTooLarge(BATCH_LIMIT));
    }
    Ok(snap::raw::Decoder::new().decompress_vec(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_is_carried_verbatim() {
        let compressor = Compressor::new(CompressionMethod::Zlib, 512);
        let framed = vec![0x42u8; 400];
        let batch = compressor.compress_prefixed(&framed).unwrap();
        assert_eq!(batch[0], METHOD_NONE);
        assert_eq!(&batch[1..], &framed[..]);
        assert_eq!(compressor.decompress_prefixed(&batch).unwrap(), framed);
    }

    #[test]
    fn above_threshold_deflates() {
        let compressor = Compressor::new(CompressionMethod::Zlib, 512);
        let framed = vec![0x42u8; 2048];
        let batch = compressor.compress_prefixed(&framed).unwrap();
        assert_eq!(batch[0], METHOD_ZLIB);
        assert!(batch.len() < framed.len());
        assert_eq!(compressor.decompress_prefixed(&batch).unwrap(), framed);
    }

    #[test]
    fn snappy_roundtrip() {
        let compressor = Compressor::new(CompressionMethod::Snappy, 0);
        let framed = b"snappy snappy snappy snappy snappy".repeat(8);
        let batch = compressor.compress_prefixed(&framed).unwrap();
        assert_eq!(batch[0], METHOD_SNAPPY);
        assert_eq!(compressor.decompress_prefixed(&batch).unwrap(), framed);
    }

    #[test]
    fn bare_roundtrip_ignores_threshold() {
        let compressor = Compressor::new(CompressionMethod::Zlib, 512);
        let framed = vec![7u8; 16]; // far below threshold
        let bare = compressor.compress_bare(&framed).unwrap();
        assert_ne!(bare, framed); // always deflated on encrypted links
        assert_eq!(compressor.decompress_bare(&bare).unwrap(), framed);
    }

    #[test]
    fn unknown_method_byte_is_rejected() {
        let compressor = Compressor::new(CompressionMethod::Zlib, 512);
        assert!(matches!(
            compressor.decompress_prefixed(&[0x7E, 1, 2, 3]),
            Err(CompressionError::UnsupportedCompression(0x7E))
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let compressor = Compressor::new(CompressionMethod::Zlib, 512);
        assert!(matches!(
            compressor.decompress_prefixed(&[]),
            Err(CompressionError::MissingMethodByte)
        ));
    }
}
