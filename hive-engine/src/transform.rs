//! # Payload Transforms
//!
//! Purpose: Interpose an optional byte transform between callers and stored
//! payloads. Compression is a transform, not a cache subtype, so one engine
//! serves both storage providers.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use hive_common::config::StorageProvider;
use hive_common::error::{CacheError, CacheResult};

/// Byte transform applied to payloads on the way in and out of the store.
pub trait PayloadTransform: Send + Sync {
    /// Transforms a caller payload into its stored representation.
    fn encode(&self, raw: &[u8]) -> CacheResult<Vec<u8>>;
    /// Transforms a stored representation back into the caller payload.
    fn decode(&self, stored: &[u8]) -> CacheResult<Vec<u8>>;
}

/// Stores payload bytes exactly as received.
pub struct PlainTransform;

impl PayloadTransform for PlainTransform {
    fn encode(&self, raw: &[u8]) -> CacheResult<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> CacheResult<Vec<u8>> {
        Ok(stored.to_vec())
    }
}

/// Gzip-compresses payloads before storing them.
pub struct GzipTransform;

impl PayloadTransform for GzipTransform {
    fn encode(&self, raw: &[u8]) -> CacheResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2 + 16), Compression::default());
        encoder.write_all(raw)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, stored: &[u8]) -> CacheResult<Vec<u8>> {
        let mut out = Vec::with_capacity(stored.len() * 2);
        GzDecoder::new(stored)
            .read_to_end(&mut out)
            .map_err(|_| CacheError::protocol("stored payload is not valid gzip"))?;
        Ok(out)
    }
}

/// Returns the transform for a configured storage provider.
pub fn transform_for(provider: StorageProvider) -> Box<dyn PayloadTransform> {
    match provider {
        StorageProvider::Plain => Box::new(PlainTransform),
        StorageProvider::Gzip => Box::new(GzipTransform),
    }
}
