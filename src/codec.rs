// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload serialization port.
//!
//! Queues and sorted views never look inside a payload. They hand values to a
//! [`Codec`] and store the resulting bytes plus a content hash. The hash is
//! what `contains`/`contains_value` compare, so it must be stable for equal
//! values. [`JsonCodec`] serializes through [`serde_json::Value`], whose
//! object keys are sorted, so maps with per-instance iteration order (such
//! as `HashMap`) still produce one canonical byte string.
//!
//! # Compression
//!
//! [`JsonCodec`] can zstd-compress payloads above a size threshold. The hash
//! is always taken over the *uncompressed* JSON so compressed and plain
//! writes of the same value still compare equal. Decoding sniffs the zstd
//! magic bytes, so a collection may hold a mix of both.

use crate::error::{CoordinationError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::marker::PhantomData;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd level used for payload compression.
const ZSTD_LEVEL: i32 = 3;

/// An encoded payload and its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Bytes as stored (possibly compressed).
    pub bytes: Vec<u8>,
    /// SHA256 hex of the uncompressed serialized form.
    pub hash: String,
}

/// Converts values of `T` to stored bytes and back.
pub trait Codec<T>: Send + Sync {
    /// Serialize `value` and compute its content hash.
    fn encode(&self, value: &T) -> Result<Encoded>;

    /// Deserialize stored bytes.
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec backed by `serde_json`.
pub struct JsonCodec<T> {
    compress_above: Option<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Plain JSON, never compressed.
    pub fn new() -> Self {
        Self {
            compress_above: None,
            _marker: PhantomData,
        }
    }

    /// Compress serialized payloads longer than `threshold` bytes.
    pub fn with_compression(threshold: usize) -> Self {
        Self {
            compress_above: Some(threshold),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self {
            compress_above: self.compress_above,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec")
            .field("compress_above", &self.compress_above)
            .finish()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Encoded> {
        let canonical = serde_json::to_value(value)?;
        let json = serde_json::to_vec(&canonical)?;
        let hash = compute_content_hash(&json);

        let bytes = match self.compress_above {
            Some(threshold) if json.len() > threshold => zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
                .map_err(|e| CoordinationError::Codec(format!("zstd encode: {}", e)))?,
            _ => json,
        };

        Ok(Encoded { bytes, hash })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let json = maybe_decompress(bytes)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| CoordinationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CoordinationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(data);
    hex::encode(hash)
}
