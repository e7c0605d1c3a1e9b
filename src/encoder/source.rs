//! Tile sources the encoder can ingest.
//!
//! The encoder reads base-layer pixel tiles through [`TileSource`]; vendor
//! slide readers plug in by implementing it. Built-in sources wrap an Iris
//! slide (re-encode) and a [`Cache`] (encode a staged scan).

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::cache::{Cache, CacheReadAccess};
use crate::error::{EncoderError, IrisError, Result};
use crate::slide::{Slide, SlideTileReadInfo};
use crate::types::{Extent, Format, TILE_PIX_AREA};

/// A supplier of decoded base-layer tiles.
///
/// `extent()` describes the pyramid the source exposes; the encoder reads
/// tiles of its highest-resolution (last) layer. `read_tile` returns one
/// full 256x256 tile of `format()` pixels, zero-padded where the image ends
/// inside the tile.
pub trait TileSource: Send + Sync {
    fn extent(&self) -> Extent;

    fn format(&self) -> Format;

    fn read_tile(&self, layer: u32, index: u32) -> Result<Buffer>;
}

// =============================================================================
// Slide source
// =============================================================================

/// Re-encode source: reads tiles out of an existing slide file.
pub struct SlideSource {
    slide: Slide,
    extent: Extent,
    format: Format,
}

impl SlideSource {
    pub fn new(slide: Slide) -> Self {
        let info = slide.info();
        SlideSource {
            slide,
            extent: info.extent,
            format: info.format,
        }
    }
}

impl TileSource for SlideSource {
    fn extent(&self) -> Extent {
        self.extent.clone()
    }

    fn format(&self) -> Format {
        self.format
    }

    fn read_tile(&self, layer: u32, index: u32) -> Result<Buffer> {
        self.slide.read_tile(
            SlideTileReadInfo::new(layer, index).with_format(self.format),
        )
    }
}

// =============================================================================
// Cache source
// =============================================================================

/// Scanner-dump source: reads staged tiles out of a cache.
pub struct CacheSource {
    cache: Cache,
    extent: Extent,
    format: Format,
}

impl CacheSource {
    /// Wrap a cache. The cache must have been created with an extent and a
    /// defined pixel format.
    pub fn new(cache: Cache) -> Result<Self> {
        let extent = cache
            .extent()
            .cloned()
            .ok_or_else(|| IrisError::Failure("cache source declares no extent".into()))?;
        let format = cache.format();
        if format == Format::Undefined {
            return Err(EncoderError::UndefinedSourceFormat.into());
        }
        Ok(CacheSource {
            cache,
            extent,
            format,
        })
    }
}

impl TileSource for CacheSource {
    fn extent(&self) -> Extent {
        self.extent.clone()
    }

    fn format(&self) -> Format {
        self.format
    }

    fn read_tile(&self, layer: u32, index: u32) -> Result<Buffer> {
        if !self.cache.contains(layer, index) {
            // A slot the scanner never filled is background.
            let bpp = self.format.bytes_per_pixel().unwrap_or(3);
            let mut tile = Buffer::with_capacity(TILE_PIX_AREA * bpp);
            tile.set_size(TILE_PIX_AREA * bpp)?;
            return Ok(tile);
        }
        self.cache.read_entry(
            layer,
            index,
            self.format,
            CacheReadAccess::DecompressTile,
            None,
        )
    }
}

/// Convenience: wrap any source in the shared pointer the encoder holds.
pub fn shared(source: impl TileSource + 'static) -> Arc<dyn TileSource> {
    Arc::new(source)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheCreateInfo, CacheStoreAccess};
    use crate::types::{CacheEncoding, LayerExtent, TILE_PIX_BYTES_RGB};

    fn one_tile_extent() -> Extent {
        Extent {
            width: 256,
            height: 256,
            layers: vec![LayerExtent {
                x_tiles: 1,
                y_tiles: 1,
                scale: 1.0,
                downsample: 1.0,
            }],
        }
    }

    #[test]
    fn test_cache_source_requires_extent() {
        let cache = Cache::create(CacheCreateInfo {
            encoding: CacheEncoding::Lz,
            format: Format::R8G8B8,
            ..Default::default()
        })
        .unwrap();
        assert!(CacheSource::new(cache).is_err());
    }

    #[test]
    fn test_cache_source_requires_format() {
        let cache = Cache::create(CacheCreateInfo {
            encoding: CacheEncoding::Lz,
            extent: Some(one_tile_extent()),
            ..Default::default()
        })
        .unwrap();
        assert!(CacheSource::new(cache).is_err());
    }

    #[test]
    fn test_cache_source_reads_stored_tile() {
        let cache = Cache::create(CacheCreateInfo {
            encoding: CacheEncoding::Lz,
            format: Format::R8G8B8,
            extent: Some(one_tile_extent()),
            ..Default::default()
        })
        .unwrap();
        let tile = Buffer::from(vec![11u8; TILE_PIX_BYTES_RGB]);
        cache
            .store_entry(0, 0, &tile, CacheStoreAccess::CompressTile)
            .unwrap();

        let source = CacheSource::new(cache).unwrap();
        assert_eq!(source.format(), Format::R8G8B8);
        let read = source.read_tile(0, 0).unwrap();
        assert_eq!(read.data(), tile.data());
    }

    #[test]
    fn test_cache_source_missing_tile_is_background() {
        let cache = Cache::create(CacheCreateInfo {
            encoding: CacheEncoding::Lz,
            format: Format::R8G8B8,
            extent: Some(one_tile_extent()),
            ..Default::default()
        })
        .unwrap();
        let source = CacheSource::new(cache).unwrap();
        let tile = source.read_tile(0, 0).unwrap();
        assert_eq!(tile.size(), TILE_PIX_BYTES_RGB);
        assert!(tile.data().iter().all(|&byte| byte == 0));
    }
}
