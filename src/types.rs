//! Core data model shared by every subsystem.
//!
//! A whole-slide image is a pyramid of downsampled layers, each decomposed
//! into fixed 256x256 pixel tiles. The types here describe that geometry
//! (`Extent`, `LayerExtent`), the pixel layout of decoded tiles (`Format`),
//! the compression applied to stored tiles (`Encoding`), and the ancillary
//! records a slide carries (metadata attributes, annotations, associated
//! images).

use std::collections::{BTreeMap, BTreeSet};

use crate::buffer::Buffer;

// =============================================================================
// Tile constants
// =============================================================================

/// Side length of a tile in pixels.
pub const TILE_PIX_LENGTH: usize = 256;

/// Pixel count of a tile (256 * 256).
pub const TILE_PIX_AREA: usize = 65_536;

/// Byte size of a decoded 3-channel tile.
pub const TILE_PIX_BYTES_RGB: usize = 196_608;

/// Byte size of a decoded 4-channel tile.
pub const TILE_PIX_BYTES_RGBA: usize = 262_144;

// =============================================================================
// Version
// =============================================================================

/// A `(major, minor, build)` version triple, persisted in the file header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Version {
            major,
            minor,
            build,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Version of this codec implementation, written into every file it encodes.
pub const CODEC_VERSION: Version = Version::new(2025, 1, 0);

// =============================================================================
// Pixel format
// =============================================================================

/// Channel order and channel count of decoded tile pixels.
///
/// All formats are 8 bits per channel, little-endian byte order in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Format {
    /// No format selected.
    #[default]
    Undefined = 0,
    /// Blue, green, red; no alpha.
    B8G8R8 = 1,
    /// Red, green, blue; no alpha.
    R8G8B8 = 2,
    /// Blue, green, red, alpha.
    B8G8R8A8 = 3,
    /// Red, green, blue, alpha.
    R8G8B8A8 = 4,
}

impl Format {
    /// Bytes per pixel, or `None` for [`Format::Undefined`].
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Format::Undefined => None,
            Format::B8G8R8 | Format::R8G8B8 => Some(3),
            Format::B8G8R8A8 | Format::R8G8B8A8 => Some(4),
        }
    }

    /// Byte size of one decoded tile in this format.
    pub fn tile_bytes(self) -> Option<usize> {
        self.bytes_per_pixel().map(|bpp| TILE_PIX_AREA * bpp)
    }

    /// Whether byte 0 holds the blue channel.
    pub fn is_blue_first(self) -> bool {
        matches!(self, Format::B8G8R8 | Format::B8G8R8A8)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Format::Undefined),
            1 => Some(Format::B8G8R8),
            2 => Some(Format::R8G8B8),
            3 => Some(Format::B8G8R8A8),
            4 => Some(Format::R8G8B8A8),
            _ => None,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Compression applied to tile byte-streams stored in a slide file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    #[default]
    Undefined = 0,
    /// Iris lossless tile codec.
    Iris = 1,
    /// Baseline JPEG.
    Jpeg = 2,
    /// AV1 image format.
    Avif = 3,
}

impl Encoding {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Encoding::Undefined),
            1 => Some(Encoding::Iris),
            2 => Some(Encoding::Jpeg),
            3 => Some(Encoding::Avif),
            _ => None,
        }
    }
}

/// Compression applied to cache entries. A cache additionally permits raw
/// LZ blocks and uncompressed pixel dumps that a published slide does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheEncoding {
    #[default]
    Undefined = 0,
    Iris = 1,
    Jpeg = 2,
    Avif = 3,
    Lz = 4,
    NoCompression = 5,
}

impl CacheEncoding {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CacheEncoding::Undefined),
            1 => Some(CacheEncoding::Iris),
            2 => Some(CacheEncoding::Jpeg),
            3 => Some(CacheEncoding::Avif),
            4 => Some(CacheEncoding::Lz),
            5 => Some(CacheEncoding::NoCompression),
            _ => None,
        }
    }
}

impl From<Encoding> for CacheEncoding {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Undefined => CacheEncoding::Undefined,
            Encoding::Iris => CacheEncoding::Iris,
            Encoding::Jpeg => CacheEncoding::Jpeg,
            Encoding::Avif => CacheEncoding::Avif,
        }
    }
}

// =============================================================================
// Extent
// =============================================================================

/// Geometry of one pyramid layer, in tiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerExtent {
    /// Number of horizontal 256-pixel tiles.
    pub x_tiles: u32,

    /// Number of vertical 256-pixel tiles.
    pub y_tiles: u32,

    /// Magnification of this layer relative to the unmagnified tissue.
    pub scale: f32,

    /// Reciprocal of `scale`, relative to the highest-resolution layer.
    pub downsample: f32,
}

impl LayerExtent {
    /// Total tile count of this layer.
    pub fn tile_count(&self) -> usize {
        self.x_tiles as usize * self.y_tiles as usize
    }
}

/// Pixel extent of a slide plus its ordered layer list.
///
/// `layers[0]` is the lowest-resolution layer; the last element is the
/// highest-resolution layer whose pixel size is `(width, height)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extent {
    /// Highest-resolution layer width in pixels.
    pub width: u32,

    /// Highest-resolution layer height in pixels.
    pub height: u32,

    /// Layer list, lowest resolution first.
    pub layers: Vec<LayerExtent>,
}

impl Extent {
    /// Total tile count across all layers.
    pub fn total_tiles(&self) -> usize {
        self.layers.iter().map(LayerExtent::tile_count).sum()
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Schema governing the interpretation of metadata attribute keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataSchema {
    #[default]
    Undefined = 0,
    I2S = 1,
    Dicom = 2,
    FreeText = 3,
}

impl MetadataSchema {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MetadataSchema::Undefined),
            1 => Some(MetadataSchema::I2S),
            2 => Some(MetadataSchema::Dicom),
            3 => Some(MetadataSchema::FreeText),
            _ => None,
        }
    }
}

/// Key/value metadata attributes plus the schema that scopes them.
///
/// Keys are UTF-8 strings; values are UTF-8 byte strings kept opaque because
/// DICOM payloads may carry text in transfer syntaxes the engine does not
/// interpret.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub schema: MetadataSchema,
    pub schema_version: u16,
    pub entries: BTreeMap<String, Vec<u8>>,
}

/// Slide-level metadata stored in the root directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Codec version that wrote the file; zero triple if another encoder did.
    pub codec: Version,

    /// Metadata attributes.
    pub attributes: Attributes,

    /// Labels of the associated (non-tiled) images in the file.
    pub associated_images: BTreeSet<String>,

    /// ICC color profile bytes, empty if the file carries none.
    pub icc_profile: Vec<u8>,

    /// Identifiers of the annotations in the file.
    pub annotations: BTreeSet<u32>,

    /// Labels of the annotation groups in the file.
    pub annotation_groups: BTreeSet<String>,

    /// Microns per pixel at the highest-resolution layer; 0 = unknown.
    pub microns_per_pixel: f32,

    /// Objective magnification; 0 = unknown.
    pub magnification: f32,
}

// =============================================================================
// Annotations
// =============================================================================

/// Payload encoding of a slide annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnotationKind {
    #[default]
    Undefined = 0,
    Png = 1,
    Jpeg = 2,
    Svg = 3,
    Text = 4,
}

impl AnnotationKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AnnotationKind::Undefined),
            1 => Some(AnnotationKind::Png),
            2 => Some(AnnotationKind::Jpeg),
            3 => Some(AnnotationKind::Svg),
            4 => Some(AnnotationKind::Text),
            _ => None,
        }
    }
}

/// One slide annotation.
///
/// Locations and sizes are fractions of the slide view space; width and
/// height are the pixel dimensions of the payload when it is an image.
#[derive(Debug, Clone, Default)]
pub struct Annotation {
    pub id: u32,
    pub kind: AnnotationKind,
    pub data: Buffer,
    pub x_location: f32,
    pub y_location: f32,
    pub x_size: f32,
    pub y_size: f32,
    pub width: u32,
    pub height: u32,
}

/// Annotations of a slide, keyed by identifier.
pub type Annotations = BTreeMap<u32, Annotation>;

/// A named set of annotation identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationGroup {
    pub label: String,
    pub members: BTreeSet<u32>,
}

// =============================================================================
// Associated images
// =============================================================================

/// Payload encoding of an associated (non-tiled) image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageEncoding {
    #[default]
    Undefined = 0,
    Png = 1,
    Jpeg = 2,
    Avif = 3,
}

impl ImageEncoding {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ImageEncoding::Undefined),
            1 => Some(ImageEncoding::Png),
            2 => Some(ImageEncoding::Jpeg),
            3 => Some(ImageEncoding::Avif),
            _ => None,
        }
    }
}

/// Rotation of an associated image, persisted as the exact half-precision
/// float bit pattern of the angle in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum ImageOrientation {
    /// Half-precision 0.0
    #[default]
    Rotate0 = 0x0000,
    /// Half-precision 90.0
    Rotate90 = 0x55A0,
    /// Half-precision 180.0
    Rotate180 = 0x59A0,
    /// Half-precision 270.0
    Rotate270 = 0x5C38,
}

impl ImageOrientation {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(ImageOrientation::Rotate0),
            0x55A0 => Some(ImageOrientation::Rotate90),
            0x59A0 => Some(ImageOrientation::Rotate180),
            0x5C38 => Some(ImageOrientation::Rotate270),
            _ => None,
        }
    }

    /// The persisted bit pattern.
    pub fn bits(self) -> u16 {
        self as u16
    }
}

/// An ancillary non-tiled image (label photo, thumbnail, macro view).
#[derive(Debug, Clone, Default)]
pub struct AssociatedImage {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    pub source_format: Format,
    pub orientation: ImageOrientation,
    pub bytes: Buffer,
}

// =============================================================================
// Quality and subsampling
// =============================================================================

/// Image encoding quality in `[0, 100]`, mapped onto the JPEG and AVIF
/// quality standards.
pub type Quality = u16;

/// Default encoding quality.
pub const QUALITY_DEFAULT: Quality = 90;

/// Chroma subsampling options for lossy codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsampling {
    /// Full chroma resolution.
    S444,
    /// Half horizontal chroma resolution.
    S422,
    /// Half chroma resolution in both axes.
    S420,
}

impl Default for Subsampling {
    fn default() -> Self {
        Subsampling::S422
    }
}

// =============================================================================
// Tests
// =============================================================================
