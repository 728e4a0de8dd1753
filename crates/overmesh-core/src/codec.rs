//! Document codec: JSON bodies, optionally gzip-compressed.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::wire::Encoding;

/// Largest document we are willing to inflate. Guards against gzip bombs.
pub const MAX_INFLATED: usize = 4 * 1024 * 1024;

/// The two magic bytes every gzip stream starts with.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(value)?;
    match encoding {
        Encoding::Json => Ok(Bytes::from(json)),
        Encoding::Gzip => gzip(&json).map(Bytes::from),
    }
}

pub fn decode<T: DeserializeOwned>(body: &[u8], encoding: Encoding) -> Result<T, CodecError> {
    match encoding {
        Encoding::Json => Ok(serde_json::from_slice(body)?),
        Encoding::Gzip => {
            let json = gunzip(body)?;
            Ok(serde_json::from_slice(&json)?)
        }
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    // Read one byte past the limit so an oversized stream is detectable.
    GzDecoder::new(data)
        .take(MAX_INFLATED as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > MAX_INFLATED {
        return Err(CodecError::TooLarge(MAX_INFLATED));
    }
    Ok(out)
}

/// Does `data` look like a gzip stream?
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("inflated document exceeds {0} bytes")]
    TooLarge(usize),
}
