//! Iris File Engine - codec and container engine for Whole Slide Images
//!
//! This library encodes, decodes, randomly accesses, and caches very large
//! tiled microscopy images stored in the Iris File Extension (`.iris`)
//! container: a pyramid of downsampled layers, each split into 256x256
//! tiles compressed per-tile by a pluggable codec.
//!
//! The major pieces:
//!
//! - [`buffer::Buffer`] - the dual-strength byte container every codec
//!   stage exchanges.
//! - [`pixel`] - SIMD-accelerated tile format conversion and 2x/4x
//!   downsampling.
//! - [`codec`] - the encoding-tag -> backend registry.
//! - [`container`] - the binary file format: header, root directory,
//!   validation.
//! - [`slide::Slide`] - memory-mapped random access to a published file.
//! - [`cache::Cache`] - a slide-shaped scratch file for staged tile data.
//! - [`encoder::Encoder`] - the multithreaded pipeline that derives the
//!   pyramid and writes a complete file, with progress and interruption.
//! - [`context::Context`] - CPU/GPU codec-path selection.

pub mod buffer;
pub mod cache;
pub mod codec;
pub mod container;
pub mod context;
pub mod encoder;
pub mod error;
pub mod pixel;
pub mod slide;
pub mod types;

// Re-export commonly used types
pub use buffer::{Buffer, Strength};
pub use cache::{Cache, CacheCreateInfo, CacheReadAccess, CacheStoreAccess};
pub use codec::{codec_for, codec_for_encoding, register_codec, CodecBackend};
pub use container::{
    is_iris_codec_file, validate_slide, ByteRange, FileHeader, RootDirectory, ValidationReport,
};
pub use context::{Context, GpuDevice};
pub use encoder::{
    CacheSource, DerivationLayers, DownsampleMethod, EncodeSlideInfo, Encoder, EncoderDerivation,
    EncoderProgress, EncoderStatus, SlideSource, TileSource,
};
pub use error::{IrisError, Result, ResultFlag};
pub use pixel::{
    convert_tile_format, downsample_into_tile_2x_avg, downsample_into_tile_2x_sharp,
    downsample_into_tile_4x_avg, downsample_into_tile_4x_sharp,
};
pub use slide::{Slide, SlideInfo, SlideOpenInfo, SlideTileReadInfo};
pub use types::{
    Annotation, AnnotationGroup, AnnotationKind, Annotations, AssociatedImage, Attributes,
    CacheEncoding, Encoding, Extent, Format, ImageEncoding, ImageOrientation, LayerExtent,
    Metadata, MetadataSchema, Quality, Subsampling, Version, CODEC_VERSION, QUALITY_DEFAULT,
    TILE_PIX_AREA, TILE_PIX_BYTES_RGB, TILE_PIX_BYTES_RGBA, TILE_PIX_LENGTH,
};
