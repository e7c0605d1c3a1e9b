//! Root-directory model, serializer, and parser.
//!
//! The root directory is the last structure written to a slide file and the
//! first parsed when one is opened. It is serialized as a single contiguous
//! block in this order:
//!
//! ```text
//! Codec version         3 x u32
//! Extent                width u32, height u32, layer count u32,
//!                       then per layer: x_tiles u32, y_tiles u32,
//!                       scale f32, downsample f32
//! Tile format           u8
//! Tile encoding         u8
//! Metadata              schema u8, schema version u16,
//!                       microns-per-pixel f32, magnification f32,
//!                       attribute count u32,
//!                       then per attribute: key string, value bytes
//! Tile directory        per layer, per row-major index:
//!                       offset u64, size u32 (12 bytes; 0,0 = empty tile)
//! Associated images     count u32, then per image: label string,
//!                       offset u64, size u32, width u32, height u32,
//!                       encoding u8, source format u8, orientation u16
//! Annotations           count u32, then per annotation: id u32,
//!                       offset u64, size u32, kind u8,
//!                       x/y location f32, x/y size f32,
//!                       width u32, height u32
//! Annotation groups     count u32, then per group: label string,
//!                       member count u32, member ids u32 each
//! ICC profile           offset u64, size u32 (0,0 = absent)
//! ```
//!
//! Strings are a u32 byte count followed by UTF-8 bytes, no terminator. All
//! integers little-endian.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ContainerError;
use crate::types::{
    AnnotationKind, Encoding, Extent, Format, ImageEncoding, ImageOrientation, LayerExtent,
    MetadataSchema, Version,
};

// =============================================================================
// Byte ranges and directory entries
// =============================================================================

/// A region of the file: absolute offset plus byte count.
///
/// The zero range (`offset == 0 && size == 0`) is the reserved "absent"
/// marker: an empty tile, or a missing ICC profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u32,
}

impl ByteRange {
    pub const EMPTY: ByteRange = ByteRange { offset: 0, size: 0 };

    pub fn new(offset: u64, size: u32) -> Self {
        ByteRange { offset, size }
    }

    /// Whether this is the reserved absent marker.
    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    /// Exclusive end offset, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size as u64)
    }
}

/// Directory record of one associated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociatedImageEntry {
    pub range: ByteRange,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    pub source_format: Format,
    pub orientation: ImageOrientation,
}

/// Directory record of one annotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnotationEntry {
    pub range: ByteRange,
    pub kind: AnnotationKind,
    pub x_location: f32,
    pub y_location: f32,
    pub x_size: f32,
    pub y_size: f32,
    pub width: u32,
    pub height: u32,
}

// =============================================================================
// RootDirectory
// =============================================================================

/// The complete in-memory directory of a slide file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RootDirectory {
    /// Codec version that wrote the file.
    pub codec: Version,

    /// Pyramid geometry, lowest-resolution layer first.
    pub extent: Extent,

    /// Pixel format of decoded tiles.
    pub format: Format,

    /// Compression of stored tiles.
    pub encoding: Encoding,

    /// Metadata attribute schema.
    pub schema: MetadataSchema,

    /// Version of the attribute schema.
    pub schema_version: u16,

    /// Microns per pixel at the highest-resolution layer; 0 = unknown.
    pub microns_per_pixel: f32,

    /// Objective magnification; 0 = unknown.
    pub magnification: f32,

    /// Metadata attributes (UTF-8 keys, opaque UTF-8 byte-string values).
    pub attributes: BTreeMap<String, Vec<u8>>,

    /// Tile directory: `tiles[layer][index]`, row-major within a layer.
    pub tiles: Vec<Vec<ByteRange>>,

    /// Associated images by label.
    pub associated_images: BTreeMap<String, AssociatedImageEntry>,

    /// Annotations by identifier.
    pub annotations: BTreeMap<u32, AnnotationEntry>,

    /// Annotation groups by label.
    pub annotation_groups: BTreeMap<String, BTreeSet<u32>>,

    /// ICC color profile bytes, absent when the empty range.
    pub icc_profile: ByteRange,
}

impl RootDirectory {
    /// Directory for a new slide: one empty tile slot per tile of `extent`.
    pub fn with_extent(extent: Extent, format: Format, encoding: Encoding) -> Self {
        let tiles = extent
            .layers
            .iter()
            .map(|layer| vec![ByteRange::EMPTY; layer.tile_count()])
            .collect();
        RootDirectory {
            codec: crate::types::CODEC_VERSION,
            extent,
            format,
            encoding,
            tiles,
            ..Default::default()
        }
    }

    /// Tile-directory lookup. `None` when layer or index is out of range.
    pub fn tile_bytes(&self, layer: u32, index: u32) -> Option<ByteRange> {
        self.tiles
            .get(layer as usize)
            .and_then(|layer| layer.get(index as usize))
            .copied()
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    /// Serialize the directory into its on-disk block.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.serialized_size_hint());

        out.put_u32_le(self.codec.major);
        out.put_u32_le(self.codec.minor);
        out.put_u32_le(self.codec.build);

        out.put_u32_le(self.extent.width);
        out.put_u32_le(self.extent.height);
        out.put_u32_le(self.extent.layers.len() as u32);
        for layer in &self.extent.layers {
            out.put_u32_le(layer.x_tiles);
            out.put_u32_le(layer.y_tiles);
            out.put_f32_le(layer.scale);
            out.put_f32_le(layer.downsample);
        }

        out.put_u8(self.format as u8);
        out.put_u8(self.encoding as u8);

        out.put_u8(self.schema as u8);
        out.put_u16_le(self.schema_version);
        out.put_f32_le(self.microns_per_pixel);
        out.put_f32_le(self.magnification);
        out.put_u32_le(self.attributes.len() as u32);
        for (key, value) in &self.attributes {
            put_string(&mut out, key);
            put_blob(&mut out, value);
        }

        for layer in &self.tiles {
            for entry in layer {
                out.put_u64_le(entry.offset);
                out.put_u32_le(entry.size);
            }
        }

        out.put_u32_le(self.associated_images.len() as u32);
        for (label, image) in &self.associated_images {
            put_string(&mut out, label);
            out.put_u64_le(image.range.offset);
            out.put_u32_le(image.range.size);
            out.put_u32_le(image.width);
            out.put_u32_le(image.height);
            out.put_u8(image.encoding as u8);
            out.put_u8(image.source_format as u8);
            out.put_u16_le(image.orientation.bits());
        }

        out.put_u32_le(self.annotations.len() as u32);
        for (id, annotation) in &self.annotations {
            out.put_u32_le(*id);
            out.put_u64_le(annotation.range.offset);
            out.put_u32_le(annotation.range.size);
            out.put_u8(annotation.kind as u8);
            out.put_f32_le(annotation.x_location);
            out.put_f32_le(annotation.y_location);
            out.put_f32_le(annotation.x_size);
            out.put_f32_le(annotation.y_size);
            out.put_u32_le(annotation.width);
            out.put_u32_le(annotation.height);
        }

        out.put_u32_le(self.annotation_groups.len() as u32);
        for (label, members) in &self.annotation_groups {
            put_string(&mut out, label);
            out.put_u32_le(members.len() as u32);
            for id in members {
                out.put_u32_le(*id);
            }
        }

        out.put_u64_le(self.icc_profile.offset);
        out.put_u32_le(self.icc_profile.size);

        out.freeze()
    }

    fn serialized_size_hint(&self) -> usize {
        let tile_entries: usize = self.tiles.iter().map(Vec::len).sum();
        256 + self.extent.layers.len() * 16
            + tile_entries * 12
            + self.attributes.len() * 32
            + self.associated_images.len() * 48
            + self.annotations.len() * 41
            + self.annotation_groups.len() * 32
    }

    // -------------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------------

    /// Parse a directory block.
    ///
    /// Structural only: field tags must be valid and the block must hold
    /// every advertised record, but byte ranges are not checked against the
    /// file length (see [`super::validation`]).
    pub fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut reader = Reader::new(bytes);

        let codec = Version {
            major: reader.get_u32()?,
            minor: reader.get_u32()?,
            build: reader.get_u32()?,
        };

        let width = reader.get_u32()?;
        let height = reader.get_u32()?;
        let layer_count = reader.get_u32()?;
        let mut layers = Vec::with_capacity(layer_count as usize);
        for _ in 0..layer_count {
            layers.push(LayerExtent {
                x_tiles: reader.get_u32()?,
                y_tiles: reader.get_u32()?,
                scale: reader.get_f32()?,
                downsample: reader.get_f32()?,
            });
        }
        let extent = Extent {
            width,
            height,
            layers,
        };

        let format_tag = reader.get_u8()?;
        let format = Format::from_u8(format_tag).ok_or(ContainerError::InvalidField {
            field: "tile format",
            value: format_tag as u32,
        })?;
        let encoding_tag = reader.get_u8()?;
        let encoding = Encoding::from_u8(encoding_tag).ok_or(ContainerError::InvalidField {
            field: "tile encoding",
            value: encoding_tag as u32,
        })?;

        let schema_tag = reader.get_u8()?;
        let schema = MetadataSchema::from_u8(schema_tag).ok_or(ContainerError::InvalidField {
            field: "metadata schema",
            value: schema_tag as u32,
        })?;
        let schema_version = reader.get_u16()?;
        let microns_per_pixel = reader.get_f32()?;
        let magnification = reader.get_f32()?;

        let attribute_count = reader.get_u32()?;
        let mut attributes = BTreeMap::new();
        for _ in 0..attribute_count {
            let key = reader.get_string("attribute key")?;
            let value = reader.get_blob()?.to_vec();
            attributes.insert(key, value);
        }

        let mut tiles = Vec::with_capacity(extent.layers.len());
        for layer in &extent.layers {
            let count = layer
                .x_tiles
                .checked_mul(layer.y_tiles)
                .ok_or(ContainerError::SizeOverflow {
                    what: "layer tile count",
                })? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(ByteRange {
                    offset: reader.get_u64()?,
                    size: reader.get_u32()?,
                });
            }
            tiles.push(entries);
        }

        let image_count = reader.get_u32()?;
        let mut associated_images = BTreeMap::new();
        for _ in 0..image_count {
            let label = reader.get_string("image label")?;
            let range = ByteRange {
                offset: reader.get_u64()?,
                size: reader.get_u32()?,
            };
            let width = reader.get_u32()?;
            let height = reader.get_u32()?;
            let encoding_tag = reader.get_u8()?;
            let encoding =
                ImageEncoding::from_u8(encoding_tag).ok_or(ContainerError::InvalidField {
                    field: "image encoding",
                    value: encoding_tag as u32,
                })?;
            let format_tag = reader.get_u8()?;
            let source_format =
                Format::from_u8(format_tag).ok_or(ContainerError::InvalidField {
                    field: "image source format",
                    value: format_tag as u32,
                })?;
            let orientation_bits = reader.get_u16()?;
            let orientation = ImageOrientation::from_u16(orientation_bits).ok_or(
                ContainerError::InvalidField {
                    field: "image orientation",
                    value: orientation_bits as u32,
                },
            )?;
            associated_images.insert(
                label,
                AssociatedImageEntry {
                    range,
                    width,
                    height,
                    encoding,
                    source_format,
                    orientation,
                },
            );
        }

        let annotation_count = reader.get_u32()?;
        let mut annotations = BTreeMap::new();
        for _ in 0..annotation_count {
            let id = reader.get_u32()?;
            let range = ByteRange {
                offset: reader.get_u64()?,
                size: reader.get_u32()?,
            };
            // Unknown kinds load as Undefined; readers skip them with a
            // warning rather than rejecting the file.
            let kind_tag = reader.get_u8()?;
            let kind = AnnotationKind::from_u8(kind_tag).unwrap_or(AnnotationKind::Undefined);
            annotations.insert(
                id,
                AnnotationEntry {
                    range,
                    kind,
                    x_location: reader.get_f32()?,
                    y_location: reader.get_f32()?,
                    x_size: reader.get_f32()?,
                    y_size: reader.get_f32()?,
                    width: reader.get_u32()?,
                    height: reader.get_u32()?,
                },
            );
        }

        let group_count = reader.get_u32()?;
        let mut annotation_groups = BTreeMap::new();
        for _ in 0..group_count {
            let label = reader.get_string("group label")?;
            let member_count = reader.get_u32()?;
            let mut members = BTreeSet::new();
            for _ in 0..member_count {
                members.insert(reader.get_u32()?);
            }
            annotation_groups.insert(label, members);
        }

        let icc_profile = ByteRange {
            offset: reader.get_u64()?,
            size: reader.get_u32()?,
        };

        Ok(RootDirectory {
            codec,
            extent,
            format,
            encoding,
            schema,
            schema_version,
            microns_per_pixel,
            magnification,
            attributes,
            tiles,
            associated_images,
            annotations,
            annotation_groups,
            icc_profile,
        })
    }
}

// =============================================================================
// Serialization helpers
// =============================================================================

fn put_string(out: &mut BytesMut, value: &str) {
    out.put_u32_le(value.len() as u32);
    out.put_slice(value.as_bytes());
}

fn put_blob(out: &mut BytesMut, value: &[u8]) {
    out.put_u32_le(value.len() as u32);
    out.put_slice(value);
}

/// Bounds-checked little-endian reader over a directory block.
struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ContainerError> {
        let end = self
            .position
            .checked_add(count)
            .ok_or(ContainerError::SizeOverflow {
                what: "directory cursor",
            })?;
        if end > self.bytes.len() {
            return Err(ContainerError::Truncated {
                offset: self.position as u64,
                required: count as u64,
                actual: (self.bytes.len() - self.position) as u64,
            });
        }
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8, ContainerError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, ContainerError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32, ContainerError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64, ContainerError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_f32(&mut self) -> Result<f32, ContainerError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_blob(&mut self) -> Result<&'a [u8], ContainerError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    fn get_string(&mut self, field: &'static str) -> Result<String, ContainerError> {
        let bytes = self.get_blob()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ContainerError::InvalidUtf8 { field })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CODEC_VERSION;

    fn two_layer_extent() -> Extent {
        Extent {
            width: 1024,
            height: 512,
            layers: vec![
                LayerExtent {
                    x_tiles: 2,
                    y_tiles: 1,
                    scale: 0.5,
                    downsample: 2.0,
                },
                LayerExtent {
                    x_tiles: 4,
                    y_tiles: 2,
                    scale: 1.0,
                    downsample: 1.0,
                },
            ],
        }
    }

    fn populated_directory() -> RootDirectory {
        let mut directory =
            RootDirectory::with_extent(two_layer_extent(), Format::R8G8B8, Encoding::Jpeg);
        directory.schema = MetadataSchema::FreeText;
        directory.schema_version = 3;
        directory.microns_per_pixel = 0.25;
        directory.magnification = 40.0;
        directory
            .attributes
            .insert("scanner".into(), b"Iris Reference".to_vec());
        directory
            .attributes
            .insert("stain".into(), "H&E".as_bytes().to_vec());
        directory.tiles[0][0] = ByteRange::new(32, 1000);
        directory.tiles[1][7] = ByteRange::new(1032, 2000);
        directory.associated_images.insert(
            "thumbnail".into(),
            AssociatedImageEntry {
                range: ByteRange::new(4096, 555),
                width: 120,
                height: 80,
                encoding: ImageEncoding::Jpeg,
                source_format: Format::R8G8B8,
                orientation: ImageOrientation::Rotate90,
            },
        );
        directory.annotations.insert(
            7,
            AnnotationEntry {
                range: ByteRange::new(8192, 64),
                kind: AnnotationKind::Svg,
                x_location: 0.25,
                y_location: 0.5,
                x_size: 0.1,
                y_size: 0.1,
                width: 200,
                height: 100,
            },
        );
        directory
            .annotation_groups
            .insert("nuclei".into(), BTreeSet::from([7]));
        directory.icc_profile = ByteRange::new(9000, 128);
        directory
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let directory = populated_directory();
        let bytes = directory.serialize();
        let parsed = RootDirectory::parse(&bytes).unwrap();
        assert_eq!(parsed, directory);
    }

    #[test]
    fn test_empty_directory_round_trip() {
        let directory =
            RootDirectory::with_extent(two_layer_extent(), Format::R8G8B8A8, Encoding::Iris);
        let parsed = RootDirectory::parse(&directory.serialize()).unwrap();
        assert_eq!(parsed, directory);
        assert!(parsed.tiles[0].iter().all(ByteRange::is_empty));
        assert!(parsed.icc_profile.is_empty());
    }

    #[test]
    fn test_with_extent_allocates_tile_slots() {
        let directory =
            RootDirectory::with_extent(two_layer_extent(), Format::R8G8B8, Encoding::Jpeg);
        assert_eq!(directory.tiles.len(), 2);
        assert_eq!(directory.tiles[0].len(), 2);
        assert_eq!(directory.tiles[1].len(), 8);
        assert_eq!(directory.codec, CODEC_VERSION);
    }

    #[test]
    fn test_tile_bytes_lookup() {
        let directory = populated_directory();
        assert_eq!(directory.tile_bytes(0, 0), Some(ByteRange::new(32, 1000)));
        assert_eq!(directory.tile_bytes(1, 7), Some(ByteRange::new(1032, 2000)));
        assert_eq!(directory.tile_bytes(0, 1), Some(ByteRange::EMPTY));
        assert_eq!(directory.tile_bytes(2, 0), None);
        assert_eq!(directory.tile_bytes(1, 8), None);
    }

    #[test]
    fn test_tile_entry_is_twelve_bytes() {
        let mut a = RootDirectory::with_extent(two_layer_extent(), Format::R8G8B8, Encoding::Jpeg);
        let b = a.clone();
        // Adding one tile entry to a layer grows the block by exactly 12.
        a.extent.layers[1].x_tiles = 5;
        a.tiles[1] = vec![ByteRange::EMPTY; 10];
        assert_eq!(a.serialize().len(), b.serialize().len() + 2 * 12);
    }

    #[test]
    fn test_strings_are_length_prefixed_utf8() {
        let mut directory =
            RootDirectory::with_extent(two_layer_extent(), Format::R8G8B8, Encoding::Jpeg);
        directory.attributes.insert("k".into(), b"v".to_vec());
        let bytes = directory.serialize();
        // Attribute section: ... count(=1) key-len key value-len value.
        let needle = [1u8, 0, 0, 0, b'k', 1, 0, 0, 0, b'v'];
        assert!(bytes
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[test]
    fn test_orientation_persists_exact_bits() {
        let directory = populated_directory();
        let bytes = directory.serialize();
        let pattern = 0x55A0u16.to_le_bytes();
        assert!(bytes.windows(2).any(|window| window == pattern));
        let parsed = RootDirectory::parse(&bytes).unwrap();
        assert_eq!(
            parsed.associated_images["thumbnail"].orientation,
            ImageOrientation::Rotate90
        );
    }

    #[test]
    fn test_truncated_block_rejected() {
        let directory = populated_directory();
        let bytes = directory.serialize();
        for cut in [0, 4, 11, bytes.len() / 2, bytes.len() - 1] {
            let result = RootDirectory::parse(&bytes[..cut]);
            assert!(
                matches!(result, Err(ContainerError::Truncated { .. })),
                "cut at {cut} parsed"
            );
        }
    }

    #[test]
    fn test_invalid_format_tag_rejected() {
        let directory = populated_directory();
        let mut bytes = directory.serialize().to_vec();
        // Tile format byte sits right after version + extent.
        let format_position = 12 + 12 + directory.extent.layers.len() * 16;
        bytes[format_position] = 0x99;
        assert!(matches!(
            RootDirectory::parse(&bytes),
            Err(ContainerError::InvalidField {
                field: "tile format",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_utf8_key_rejected() {
        let mut directory = populated_directory();
        directory.attributes.clear();
        directory.attributes.insert("ok".into(), vec![1]);
        let mut bytes = directory.serialize().to_vec();
        // Corrupt the key bytes in place.
        let needle = [2u8, 0, 0, 0, b'o', b'k'];
        let position = bytes
            .windows(needle.len())
            .position(|window| window == needle)
            .unwrap();
        bytes[position + 4] = 0xFF;
        bytes[position + 5] = 0xFE;
        assert!(matches!(
            RootDirectory::parse(&bytes),
            Err(ContainerError::InvalidUtf8 {
                field: "attribute key"
            })
        ));
    }
}
