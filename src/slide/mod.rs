//! Slide handle: memory-mapped random access to a published slide file.
//!
//! A [`Slide`] owns a memory map of the file and its parsed root directory.
//! Tile reads resolve `(layer, index)` through the directory, slice the
//! compressed stream out of the map without copying, decode it through the
//! registered codec, and convert to the caller's desired pixel format.
//!
//! Handles are cheap to clone and safe to share across reader threads.
//! Mutation (annotation and associated-image append) is single-writer and
//! requires the slide to be opened with write access.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::codec::codec_for_encoding;
use crate::container::{
    align_up, read_container, validate_directory, AnnotationEntry, AssociatedImageEntry,
    ByteRange, FileHeader, RootDirectory, ROOT_OFFSET_FIELD,
};
use crate::context::Context;
use crate::error::{PixelError, Result, SlideError};
use crate::pixel::convert_tile_format;
use crate::types::{
    Annotation, AnnotationKind, Annotations, AssociatedImage, Attributes, Encoding, Extent,
    Format, Metadata, TILE_PIX_AREA,
};

/// Fill value of synthesized background tiles.
const BACKGROUND_BYTE: u8 = 0xFF;

// =============================================================================
// Open / read parameter structs
// =============================================================================

/// Parameters for [`Slide::open`].
#[derive(Debug, Clone, Default)]
pub struct SlideOpenInfo {
    pub path: PathBuf,
    pub context: Option<Context>,
    pub write_access: bool,
}

impl SlideOpenInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SlideOpenInfo {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_write_access(mut self) -> Self {
        self.write_access = true;
        self
    }
}

/// Summary of a slide file.
#[derive(Debug, Clone)]
pub struct SlideInfo {
    pub format: Format,
    pub encoding: Encoding,
    pub extent: Extent,
    pub metadata: Metadata,
}

/// Parameters for [`Slide::read_tile`].
#[derive(Debug, Default)]
pub struct SlideTileReadInfo {
    pub layer: u32,
    pub tile_index: u32,
    /// Optional destination; used when its capacity holds one tile in the
    /// desired format.
    pub dst: Option<Buffer>,
    pub desired_format: Format,
}

impl SlideTileReadInfo {
    pub fn new(layer: u32, tile_index: u32) -> Self {
        SlideTileReadInfo {
            layer,
            tile_index,
            dst: None,
            desired_format: Format::R8G8B8A8,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.desired_format = format;
        self
    }

    pub fn with_destination(mut self, dst: Buffer) -> Self {
        self.dst = Some(dst);
        self
    }
}

// =============================================================================
// Slide
// =============================================================================

struct SlideShared {
    path: PathBuf,
    /// Immutable map of the file as it was at open.
    map: Mmap,
    /// Handle for reads beyond the map and for appends.
    file: Mutex<File>,
    header: RwLock<FileHeader>,
    directory: RwLock<RootDirectory>,
    write_access: bool,
    #[allow(dead_code)]
    context: Option<Context>,
}

/// Handle to an open slide file.
#[derive(Clone)]
pub struct Slide {
    inner: Arc<SlideShared>,
}

impl Slide {
    /// Open and validate a slide file.
    ///
    /// Validation failures are fatal: no handle is returned for a file that
    /// does not conform to the container format.
    pub fn open(info: SlideOpenInfo) -> Result<Self> {
        let (header, directory, file_len) = read_container(&info.path)?;
        validate_directory(&directory, file_len).into_result()?;

        let file = OpenOptions::new()
            .read(true)
            .write(info.write_access)
            .open(&info.path)?;
        // SAFETY: the mapping is kept immutable; appends only ever grow the
        // file past the mapped region.
        let map = unsafe { Mmap::map(&file)? };

        debug!(
            path = %info.path.display(),
            layers = directory.extent.layers.len(),
            encoding = ?directory.encoding,
            "opened slide"
        );

        Ok(Slide {
            inner: Arc::new(SlideShared {
                path: info.path,
                map,
                file: Mutex::new(file),
                header: RwLock::new(header),
                directory: RwLock::new(directory),
                write_access: info.write_access,
                context: info.context,
            }),
        })
    }

    /// Path the slide was opened from.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Slide summary: format, encoding, extent, and metadata.
    pub fn info(&self) -> SlideInfo {
        let directory = self.inner.directory.read();
        let icc_profile = if directory.icc_profile.is_empty() {
            Vec::new()
        } else {
            self.read_range(directory.icc_profile).unwrap_or_default()
        };
        SlideInfo {
            format: directory.format,
            encoding: directory.encoding,
            extent: directory.extent.clone(),
            metadata: Metadata {
                codec: directory.codec,
                attributes: Attributes {
                    schema: directory.schema,
                    schema_version: directory.schema_version,
                    entries: directory.attributes.clone(),
                },
                associated_images: directory.associated_images.keys().cloned().collect(),
                icc_profile,
                annotations: directory.annotations.keys().copied().collect(),
                annotation_groups: directory.annotation_groups.keys().cloned().collect(),
                microns_per_pixel: directory.microns_per_pixel,
                magnification: directory.magnification,
            },
        }
    }

    /// Decode one tile into the desired pixel format.
    ///
    /// An empty directory entry synthesizes an all-background tile rather
    /// than failing: the encoder records nothing for tiles that carry no
    /// tissue.
    pub fn read_tile(&self, info: SlideTileReadInfo) -> Result<Buffer> {
        let (range, native, encoding) = {
            let directory = self.inner.directory.read();
            let layers = directory.extent.layers.len() as u32;
            if info.layer >= layers {
                return Err(SlideError::LayerOutOfRange {
                    layer: info.layer,
                    layers,
                }
                .into());
            }
            let tiles = directory.tiles[info.layer as usize].len() as u32;
            if info.tile_index >= tiles {
                return Err(SlideError::TileOutOfRange {
                    layer: info.layer,
                    index: info.tile_index,
                    tiles,
                }
                .into());
            }
            (
                directory.tiles[info.layer as usize][info.tile_index as usize],
                directory.format,
                directory.encoding,
            )
        };

        let bpp = info
            .desired_format
            .bytes_per_pixel()
            .ok_or(PixelError::UndefinedFormat {
                side: "destination",
            })?;
        let tile_bytes = TILE_PIX_AREA * bpp;

        if range.is_empty() {
            let mut out = match info.dst {
                Some(buffer) if buffer.capacity() >= tile_bytes => buffer,
                _ => Buffer::with_capacity(tile_bytes),
            };
            out.set_size(tile_bytes)?;
            out.data_mut().fill(BACKGROUND_BYTE);
            return Ok(out);
        }

        let start = range.offset as usize;
        let end = start + range.size as usize;
        let codec = codec_for_encoding(encoding)?;
        let decoded = if end <= self.inner.map.len() {
            // Zero-copy: hand the codec a weak view of the mapped stream.
            let slice = &self.inner.map[start..end];
            let compressed =
                unsafe { Buffer::wrap_weak(slice.as_ptr() as *mut u8, slice.len()) };
            codec.decompress(&compressed, native)?
        } else {
            let compressed = Buffer::from(self.read_range(range)?);
            codec.decompress(&compressed, native)?
        };

        Ok(convert_tile_format(
            &decoded,
            native,
            info.desired_format,
            info.dst,
        )?)
    }

    /// Parse every annotation payload in the file.
    ///
    /// Annotations of an unrecognized kind are skipped with a warning; the
    /// rest load.
    pub fn annotations(&self) -> Result<Annotations> {
        let entries: Vec<(u32, AnnotationEntry)> = {
            let directory = self.inner.directory.read();
            directory
                .annotations
                .iter()
                .map(|(id, entry)| (*id, *entry))
                .collect()
        };

        let mut annotations = Annotations::new();
        for (id, entry) in entries {
            if entry.kind == AnnotationKind::Undefined {
                warn!(id, "skipping annotation of unrecognized kind");
                continue;
            }
            let data = Buffer::from(self.read_range(entry.range)?);
            annotations.insert(
                id,
                Annotation {
                    id,
                    kind: entry.kind,
                    data,
                    x_location: entry.x_location,
                    y_location: entry.y_location,
                    x_size: entry.x_size,
                    y_size: entry.y_size,
                    width: entry.width,
                    height: entry.height,
                },
            );
        }
        Ok(annotations)
    }

    /// Append an annotation to the file and republish the root directory.
    pub fn annotate(&self, annotation: &Annotation) -> Result<()> {
        if !self.inner.write_access {
            return Err(SlideError::ReadOnly.into());
        }
        if self
            .inner
            .directory
            .read()
            .annotations
            .contains_key(&annotation.id)
        {
            return Err(SlideError::DuplicateAnnotation(annotation.id).into());
        }

        let range = self.append_section(annotation.data.data())?;
        let mut directory = self.inner.directory.read().clone();
        directory.annotations.insert(
            annotation.id,
            AnnotationEntry {
                range,
                kind: annotation.kind,
                x_location: annotation.x_location,
                y_location: annotation.y_location,
                x_size: annotation.x_size,
                y_size: annotation.y_size,
                width: annotation.width,
                height: annotation.height,
            },
        );
        self.publish_directory(directory)
    }

    /// Read an associated image's compressed payload and record.
    pub fn associated_image(&self, label: &str) -> Result<AssociatedImage> {
        let entry = {
            let directory = self.inner.directory.read();
            *directory
                .associated_images
                .get(label)
                .ok_or_else(|| SlideError::NoSuchImage(label.to_owned()))?
        };
        Ok(AssociatedImage {
            label: label.to_owned(),
            width: entry.width,
            height: entry.height,
            encoding: entry.encoding,
            source_format: entry.source_format,
            orientation: entry.orientation,
            bytes: Buffer::from(self.read_range(entry.range)?),
        })
    }

    /// Append an associated image to the file and republish the directory.
    pub fn append_associated_image(&self, image: &AssociatedImage) -> Result<()> {
        if !self.inner.write_access {
            return Err(SlideError::ReadOnly.into());
        }
        let range = self.append_section(image.bytes.data())?;
        let mut directory = self.inner.directory.read().clone();
        directory.associated_images.insert(
            image.label.clone(),
            AssociatedImageEntry {
                range,
                width: image.width,
                height: image.height,
                encoding: image.encoding,
                source_format: image.source_format,
                orientation: image.orientation,
            },
        );
        self.publish_directory(directory)
    }

    // -------------------------------------------------------------------------
    // File plumbing
    // -------------------------------------------------------------------------

    /// Read a byte range, from the map when covered, else from the file
    /// (regions appended after open lie past the map).
    fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        let start = range.offset as usize;
        let end = start + range.size as usize;
        if end <= self.inner.map.len() {
            return Ok(self.inner.map[start..end].to_vec());
        }
        let mut file = self.inner.file.lock();
        file.seek(SeekFrom::Start(range.offset))?;
        let mut out = vec![0u8; range.size as usize];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    /// Append a payload past the current end of file, aligned.
    fn append_section(&self, payload: &[u8]) -> Result<ByteRange> {
        let mut file = self.inner.file.lock();
        let end = file.seek(SeekFrom::End(0))?;
        let offset = align_up(end);
        if offset != end {
            file.write_all(&vec![0u8; (offset - end) as usize])?;
        }
        file.write_all(payload)?;
        Ok(ByteRange::new(offset, payload.len() as u32))
    }

    /// Write a new root directory past the end of file, then patch the
    /// header's root offset. The patch is last so a torn write leaves the
    /// previous directory reachable.
    fn publish_directory(&self, directory: RootDirectory) -> Result<()> {
        let block = directory.serialize();
        let root_offset = {
            let mut file = self.inner.file.lock();
            let end = file.seek(SeekFrom::End(0))?;
            let root_offset = align_up(end);
            if root_offset != end {
                file.write_all(&vec![0u8; (root_offset - end) as usize])?;
            }
            file.write_all(&block)?;
            file.sync_all()?;

            file.seek(SeekFrom::Start(ROOT_OFFSET_FIELD))?;
            file.write_all(&root_offset.to_le_bytes())?;
            file.sync_all()?;
            root_offset
        };

        self.inner.header.write().root_offset = root_offset;
        *self.inner.directory.write() = directory;
        Ok(())
    }
}

impl Slide {
    /// Version of the codec that wrote the file header.
    pub fn file_version(&self) -> crate::types::Version {
        self.inner.header.read().version
    }
}

impl std::fmt::Debug for Slide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let directory = self.inner.directory.read();
        f.debug_struct("Slide")
            .field("path", &self.inner.path)
            .field("version", &self.file_version())
            .field("extent", &directory.extent)
            .field("encoding", &directory.encoding)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
