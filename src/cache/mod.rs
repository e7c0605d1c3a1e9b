//! Temporary slide-shaped scratch file.
//!
//! A [`Cache`] stages tile data on disk during scanning or transcoding. It
//! mirrors the container's tile addressing (`layer`, row-major index) but
//! keeps its directory in memory and, by default, creates the backing file
//! unlinked so the OS reclaims the space even after a crash.
//!
//! Unlike a published slide, a cache permits mixed storage per entry: pixel
//! tiles run through the cache's codec (`CacheStoreAccess::CompressTile`)
//! while already-compressed streams land verbatim
//! (`CacheStoreAccess::DirectNoCodec`). The store and read access tags are
//! distinct enums; a historical revision used one numeric tag for both
//! directions, which collapsed two different actions into one value.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::buffer::Buffer;
use crate::codec::codec_for;
use crate::container::{align_up, ByteRange, FileHeader, HEADER_SIZE};
use crate::context::Context;
use crate::error::{CacheError, Result};
use crate::pixel::convert_tile_format;
use crate::types::{CacheEncoding, Extent, Format, Quality, Subsampling, QUALITY_DEFAULT};

// =============================================================================
// Access tags and creation info
// =============================================================================

/// How bytes enter the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoreAccess {
    /// Run the cache's codec over decoded pixel data.
    CompressTile,
    /// Write the bytes verbatim; the caller attests the stream already
    /// matches the cache's encoding.
    DirectNoCodec,
}

/// How bytes leave the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheReadAccess {
    /// Decode the stored stream into pixels of the desired format.
    DecompressTile,
    /// Return the stored bytes verbatim.
    DirectNoCodec,
}

/// Parameters for [`Cache::create`].
#[derive(Debug, Clone)]
pub struct CacheCreateInfo {
    /// Unlink the backing file immediately so a crash cannot leak it.
    pub unlinked: bool,

    pub context: Option<Context>,

    /// Codec applied by `CompressTile` stores.
    pub encoding: CacheEncoding,

    /// Pixel format of tiles passed to `CompressTile`. Required (with
    /// `extent`) when the cache seeds an encoder.
    pub format: Format,

    /// Pyramid geometry of the staged slide, when known.
    pub extent: Option<Extent>,

    /// Quality forwarded to lossy codecs on store.
    pub quality: Quality,

    /// Chroma subsampling forwarded to lossy codecs on store.
    pub subsampling: Subsampling,
}

impl Default for CacheCreateInfo {
    fn default() -> Self {
        CacheCreateInfo {
            unlinked: true,
            context: None,
            encoding: CacheEncoding::Undefined,
            format: Format::Undefined,
            extent: None,
            quality: QUALITY_DEFAULT,
            subsampling: Subsampling::default(),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CacheSlot {
    range: ByteRange,
    encoding: CacheEncoding,
}

struct AppendFile {
    file: File,
    cursor: u64,
}

struct CacheShared {
    file: Mutex<AppendFile>,
    directory: RwLock<HashMap<(u32, u32), CacheSlot>>,
    encoding: CacheEncoding,
    format: Format,
    extent: Option<Extent>,
    quality: Quality,
    subsampling: Subsampling,
    /// Keeps a linked (named) scratch file alive until the cache drops.
    _named: Option<tempfile::NamedTempFile>,
    #[allow(dead_code)]
    context: Option<Context>,
}

/// Handle to a scratch cache file. Cheap to clone; readers are concurrent,
/// writers serialize on the append lock.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheShared>,
}

impl Cache {
    /// Create a scratch cache file.
    pub fn create(info: CacheCreateInfo) -> Result<Self> {
        let (mut file, named) = if info.unlinked {
            (tempfile::tempfile()?, None)
        } else {
            let named = tempfile::NamedTempFile::new()?;
            (named.reopen()?, Some(named))
        };

        // Slide-shaped: a header opens the file even though the in-memory
        // directory is never published.
        file.write_all(&FileHeader::unpublished().encode())?;
        debug!(encoding = ?info.encoding, unlinked = info.unlinked, "created cache");

        Ok(Cache {
            inner: Arc::new(CacheShared {
                file: Mutex::new(AppendFile {
                    file,
                    cursor: HEADER_SIZE as u64,
                }),
                directory: RwLock::new(HashMap::new()),
                encoding: info.encoding,
                format: info.format,
                extent: info.extent,
                quality: info.quality,
                subsampling: info.subsampling,
                _named: named,
                context: info.context,
            }),
        })
    }

    /// Codec applied by `CompressTile` stores.
    pub fn encoding(&self) -> CacheEncoding {
        self.inner.encoding
    }

    /// Pixel format of tiles stored with `CompressTile`.
    pub fn format(&self) -> Format {
        self.inner.format
    }

    /// Staged pyramid geometry, when declared at creation.
    pub fn extent(&self) -> Option<&Extent> {
        self.inner.extent.as_ref()
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.inner.directory.read().len()
    }

    /// Whether an entry exists for `(layer, index)`.
    pub fn contains(&self, layer: u32, index: u32) -> bool {
        self.inner.directory.read().contains_key(&(layer, index))
    }

    /// Store one entry. A later store to the same slot wins; the earlier
    /// bytes are abandoned in the scratch file.
    pub fn store_entry(
        &self,
        layer: u32,
        index: u32,
        source: &Buffer,
        access: CacheStoreAccess,
    ) -> Result<()> {
        let stream = match access {
            CacheStoreAccess::CompressTile => {
                if self.inner.encoding == CacheEncoding::Undefined {
                    return Err(CacheError::UndefinedEncoding.into());
                }
                let codec = codec_for(self.inner.encoding)?;
                codec.compress(
                    source,
                    self.inner.format,
                    self.inner.quality,
                    self.inner.subsampling,
                )?
            }
            CacheStoreAccess::DirectNoCodec => source.clone(),
        };

        let range = {
            let mut append = self.inner.file.lock();
            let offset = align_up(append.cursor);
            if offset != append.cursor {
                let cursor = append.cursor;
                append.file.seek(SeekFrom::Start(cursor))?;
                append
                    .file
                    .write_all(&vec![0u8; (offset - cursor) as usize])?;
            }
            append.file.seek(SeekFrom::Start(offset))?;
            append.file.write_all(stream.data())?;
            append.cursor = offset + stream.size() as u64;
            ByteRange::new(offset, stream.size() as u32)
        };

        self.inner.directory.write().insert(
            (layer, index),
            CacheSlot {
                range,
                encoding: self.inner.encoding,
            },
        );
        Ok(())
    }

    /// Read one entry back, decoding it or returning the raw stream.
    ///
    /// With `DecompressTile`, `dst` receives the pixels when its capacity
    /// holds one tile in `desired_format`.
    pub fn read_entry(
        &self,
        layer: u32,
        index: u32,
        desired_format: Format,
        access: CacheReadAccess,
        dst: Option<Buffer>,
    ) -> Result<Buffer> {
        let slot = self
            .inner
            .directory
            .read()
            .get(&(layer, index))
            .copied()
            .ok_or(CacheError::MissingEntry { layer, index })?;

        let stream = {
            let mut append = self.inner.file.lock();
            append.file.seek(SeekFrom::Start(slot.range.offset))?;
            let mut bytes = vec![0u8; slot.range.size as usize];
            append.file.read_exact(&mut bytes)?;
            Buffer::from(bytes)
        };

        match access {
            CacheReadAccess::DirectNoCodec => Ok(stream),
            CacheReadAccess::DecompressTile => {
                let codec = codec_for(slot.encoding)?;
                let decoded = codec.decompress(&stream, desired_format)?;
                match dst {
                    Some(dst) => Ok(convert_tile_format(
                        &decoded,
                        desired_format,
                        desired_format,
                        Some(dst),
                    )?),
                    None => Ok(decoded),
                }
            }
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("encoding", &self.inner.encoding)
            .field("entries", &self.entry_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
