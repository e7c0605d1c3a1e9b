//! Codec registry: maps an encoding tag to a stateless compression backend.
//!
//! Backends are pluggable. The process-wide table starts with the built-in
//! set (JPEG via the `image` crate, the lossless Iris/LZ block codecs, and a
//! raw passthrough); [`register_codec`] swaps or extends entries at runtime,
//! which is how an AVIF or GPU-assisted implementation is installed.

mod jpeg;
mod lz;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::types::{CacheEncoding, Encoding, Format, Quality, Subsampling};

pub use jpeg::JpegCodec;
pub use lz::{LzCodec, RawCodec};

// =============================================================================
// Backend contract
// =============================================================================

/// A stateless tile compression backend.
///
/// Contract: `decompress(compress(tile))` yields one 256x256 tile whose
/// bytes are in the format requested at decompression.
pub trait CodecBackend: Send + Sync {
    /// Compress one decoded tile.
    fn compress(
        &self,
        src: &Buffer,
        src_fmt: Format,
        quality: Quality,
        subsampling: Subsampling,
    ) -> Result<Buffer, CodecError>;

    /// Decompress a tile byte-stream into `dst_fmt` pixels.
    fn decompress(&self, src: &Buffer, dst_fmt: Format) -> Result<Buffer, CodecError>;

    /// MIME type of the compressed stream.
    fn mime(&self) -> &'static str;
}

// =============================================================================
// Registry
// =============================================================================

type Registry = HashMap<CacheEncoding, Arc<dyn CodecBackend>>;

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    let mut table: Registry = HashMap::new();
    table.insert(CacheEncoding::Iris, Arc::new(LzCodec));
    table.insert(CacheEncoding::Jpeg, Arc::new(JpegCodec));
    table.insert(CacheEncoding::Lz, Arc::new(LzCodec));
    table.insert(CacheEncoding::NoCompression, Arc::new(RawCodec));
    // AVIF ships without a default backend; install one via register_codec.
    RwLock::new(table)
});

/// Look up the backend for an encoding.
pub fn codec_for(encoding: CacheEncoding) -> Result<Arc<dyn CodecBackend>, CodecError> {
    REGISTRY
        .read()
        .get(&encoding)
        .cloned()
        .ok_or(CodecError::NoBackend(encoding))
}

/// Look up the backend for a slide encoding.
pub fn codec_for_encoding(encoding: Encoding) -> Result<Arc<dyn CodecBackend>, CodecError> {
    codec_for(encoding.into())
}

/// Install or replace the backend for an encoding.
pub fn register_codec(encoding: CacheEncoding, backend: Arc<dyn CodecBackend>) {
    REGISTRY.write().insert(encoding, backend);
}

// =============================================================================
// Tests
// =============================================================================
