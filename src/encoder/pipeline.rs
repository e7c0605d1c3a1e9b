//! The multithreaded encode pipeline.
//!
//! Work unit: one base-layer destination tile. Workers pull coordinates
//! from a shared FIFO, read and format-convert the source tile, compress
//! and append it, then fold the pixels into the parent tile's accumulation
//! buffer with the layer-specific downsampler. The worker that contributes
//! a parent's last child takes the finished buffer and emits the parent the
//! same way, so the whole pyramid drains upward without barriers.
//!
//! Byte appends claim space from an atomic cursor and write outside any
//! lock; only the O(1) directory record runs under a mutex. The root
//! directory is written last and the header's root offset is patched after
//! it is durable, so an interrupted run never produces a file that
//! validates.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::codec::{codec_for_encoding, CodecBackend};
use crate::container::{align_up, ByteRange, FileHeader, RootDirectory, ROOT_OFFSET_FIELD};
use crate::error::{EncoderError, IrisError, Result};
use crate::pixel::{
    convert_tile_format, downsample_into_tile_2x_avg, downsample_into_tile_2x_sharp,
    downsample_into_tile_4x_avg, downsample_into_tile_4x_sharp,
};
use crate::types::{Extent, LayerExtent, TILE_PIX_AREA};

use super::source::TileSource;
use super::{DownsampleMethod, EncodeSettings};

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Interrupted,
}

// =============================================================================
// Derived-tile accumulation
// =============================================================================

/// Accumulation slot for one tile of a layer above the base.
///
/// Children write their downsampled pixels into `buf` under the lock;
/// `remaining` counts children yet to contribute. The contributor that
/// drops it to zero owns the finished tile.
struct DerivedTile {
    buf: Mutex<Option<Buffer>>,
    remaining: AtomicU32,
}

// =============================================================================
// Pipeline state
// =============================================================================

struct Pipeline {
    source: Arc<dyn TileSource>,
    settings: EncodeSettings,
    codec: Arc<dyn CodecBackend>,
    /// Destination pyramid, lowest-resolution layer first.
    layers: Vec<LayerExtent>,
    /// Source layer the base tiles are read from.
    src_base_layer: u32,
    factor: u32,
    channels: u8,
    tile_bytes: usize,
    /// Accumulators for every layer above the base.
    derived: Vec<Vec<DerivedTile>>,
    file: std::fs::File,
    cursor: AtomicU64,
    directory: Mutex<Vec<Vec<ByteRange>>>,
    cancel: Arc<AtomicBool>,
    failed: AtomicBool,
    error: Mutex<Option<String>>,
    completed: Arc<AtomicU64>,
}

impl Pipeline {
    fn stopped(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || self.failed.load(Ordering::Relaxed)
    }

    fn latch_error(&self, error: IrisError) {
        warn!(%error, "encoder worker failed");
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Claim `len` bytes of the tile data region, aligned.
    fn claim(&self, len: u64) -> u64 {
        loop {
            let current = self.cursor.load(Ordering::Acquire);
            let offset = align_up(current);
            if self
                .cursor
                .compare_exchange(current, offset + len, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return offset;
            }
        }
    }

    fn zero_tile(&self) -> Result<Buffer> {
        let mut tile = Buffer::with_capacity(self.tile_bytes);
        tile.set_size(self.tile_bytes)?;
        Ok(tile)
    }

    /// Read, convert, and emit one base-layer tile.
    fn process_base_tile(&self, x: u32, y: u32) -> Result<()> {
        let base = (self.layers.len() - 1) as u32;
        let index = y * self.layers[base as usize].x_tiles + x;
        let tile = self.source.read_tile(self.src_base_layer, index)?;
        let tile = if self.source.format() != self.settings.format {
            convert_tile_format(
                &tile,
                self.source.format(),
                self.settings.format,
                None,
            )?
        } else {
            tile
        };
        self.emit_tile(base, x, y, tile)
    }

    /// Compress and append a finished tile, then fold it into its parent.
    fn emit_tile(&self, layer: u32, x: u32, y: u32, tile: Buffer) -> Result<()> {
        if self.stopped() {
            return Ok(());
        }

        let stream = self.codec.compress(
            &tile,
            self.settings.format,
            self.settings.quality,
            self.settings.subsampling,
        )?;
        let offset = self.claim(stream.size() as u64);
        self.file.write_all_at(stream.data(), offset)?;
        {
            let index = (y * self.layers[layer as usize].x_tiles + x) as usize;
            let mut directory = self.directory.lock();
            directory[layer as usize][index] = ByteRange::new(offset, stream.size() as u32);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);

        if layer == 0 {
            return Ok(());
        }

        // Fold into the parent's accumulation buffer.
        let parent_layer = layer - 1;
        let (px, py) = (x / self.factor, y / self.factor);
        let (sub_x, sub_y) = ((x % self.factor) as u16, (y % self.factor) as u16);
        let parent_index =
            (py * self.layers[parent_layer as usize].x_tiles + px) as usize;
        let parent = &self.derived[parent_layer as usize][parent_index];

        {
            let mut slot = parent.buf.lock();
            if slot.is_none() {
                *slot = Some(self.zero_tile()?);
            }
            let buf = slot.as_mut().ok_or_else(|| {
                IrisError::Failure("derived tile lost its accumulation buffer".into())
            })?;
            match (self.factor, self.settings.derivation.method) {
                (2, DownsampleMethod::Average) => {
                    downsample_into_tile_2x_avg(&tile, buf, sub_y, sub_x, self.channels)?
                }
                (2, DownsampleMethod::Sharpen) => {
                    downsample_into_tile_2x_sharp(&tile, buf, sub_y, sub_x, self.channels)?
                }
                (4, DownsampleMethod::Average) => {
                    downsample_into_tile_4x_avg(&tile, buf, sub_y, sub_x, self.channels)?
                }
                _ => downsample_into_tile_4x_sharp(&tile, buf, sub_y, sub_x, self.channels)?,
            }
        }

        if parent.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let finished = parent.buf.lock().take().ok_or_else(|| {
                IrisError::Failure("derived tile completed without a buffer".into())
            })?;
            self.emit_tile(parent_layer, px, py, finished)?;
        }
        Ok(())
    }
}

// =============================================================================
// Pyramid derivation
// =============================================================================

/// Destination pyramid for a base tile grid: divide by the factor until
/// both axes reach one tile.
pub(crate) fn derive_layers(base_x: u32, base_y: u32, factor: u32) -> Vec<LayerExtent> {
    let mut dims = vec![(base_x.max(1), base_y.max(1))];
    let (mut x, mut y) = (base_x.max(1), base_y.max(1));
    while x > 1 || y > 1 {
        x = x.div_ceil(factor);
        y = y.div_ceil(factor);
        dims.push((x, y));
    }

    let mut layers = Vec::with_capacity(dims.len());
    let mut downsample = 1.0f32;
    for (x, y) in dims {
        layers.push(LayerExtent {
            x_tiles: x,
            y_tiles: y,
            scale: 1.0 / downsample,
            downsample,
        });
        downsample *= factor as f32;
    }
    layers.reverse();
    layers
}

/// Count of children in `child` layer feeding parent tile `(px, py)`.
fn child_count(parent: (u32, u32), child: &LayerExtent, factor: u32) -> u32 {
    let (px, py) = parent;
    let x_children = (child.x_tiles - px * factor).min(factor);
    let y_children = (child.y_tiles - py * factor).min(factor);
    x_children * y_children
}

// =============================================================================
// Run
// =============================================================================

/// Execute one encode: derive the pyramid, run the worker pool, publish the
/// directory. Returns how the run ended; the caller owns state transitions
/// and partial-file cleanup.
pub(crate) fn run(
    source: Arc<dyn TileSource>,
    settings: EncodeSettings,
    cancel: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
) -> Result<RunOutcome> {
    let src_extent = source.extent();
    let src_base = src_extent
        .layers
        .last()
        .ok_or_else(|| IrisError::Failure("source declares no layers".into()))?;

    let factor = settings.derivation.layers.factor();
    let layers = derive_layers(src_base.x_tiles, src_base.y_tiles, factor);
    let width = if src_extent.width > 0 {
        src_extent.width
    } else {
        src_base.x_tiles * 256
    };
    let height = if src_extent.height > 0 {
        src_extent.height
    } else {
        src_base.y_tiles * 256
    };

    let tile_total: u64 = layers.iter().map(|l| l.tile_count() as u64).sum();
    completed.store(0, Ordering::Relaxed);
    total.store(tile_total, Ordering::Relaxed);

    let channels = settings
        .format
        .bytes_per_pixel()
        .ok_or(EncoderError::UndefinedSourceFormat)? as u8;
    let tile_bytes = TILE_PIX_AREA * channels as usize;
    let codec = codec_for_encoding(settings.encoding)?;

    // Accumulators for every layer above the base.
    let base_layer = layers.len() - 1;
    let mut derived = Vec::with_capacity(base_layer);
    for (index, layer) in layers[..base_layer].iter().enumerate() {
        let child = &layers[index + 1];
        let mut tiles = Vec::with_capacity(layer.tile_count());
        for py in 0..layer.y_tiles {
            for px in 0..layer.x_tiles {
                tiles.push(DerivedTile {
                    buf: Mutex::new(None),
                    remaining: AtomicU32::new(child_count((px, py), child, factor)),
                });
            }
        }
        derived.push(tiles);
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&settings.dst_path)?;
    file.write_all_at(&FileHeader::unpublished().encode(), 0)?;

    let directory_tiles: Vec<Vec<ByteRange>> = layers
        .iter()
        .map(|layer| vec![ByteRange::EMPTY; layer.tile_count()])
        .collect();

    let pipeline = Arc::new(Pipeline {
        source,
        codec,
        src_base_layer: (src_extent.layers.len() - 1) as u32,
        factor,
        channels,
        tile_bytes,
        derived,
        file,
        cursor: AtomicU64::new(crate::container::HEADER_SIZE as u64),
        directory: Mutex::new(directory_tiles),
        cancel,
        failed: AtomicBool::new(false),
        error: Mutex::new(None),
        completed,
        layers,
        settings,
    });

    // Seed the FIFO with every base-layer coordinate and race the workers
    // over it.
    let (sender, receiver) = unbounded::<(u32, u32)>();
    let base = &pipeline.layers[base_layer];
    for y in 0..base.y_tiles {
        for x in 0..base.x_tiles {
            sender
                .send((x, y))
                .map_err(|_| IrisError::Failure("work queue closed before dispatch".into()))?;
        }
    }
    drop(sender);

    let worker_count = pipeline.settings.threads.max(1);
    debug!(
        workers = worker_count,
        tiles = tile_total,
        factor,
        "dispatching encode pipeline"
    );
    let workers: Vec<_> = (0..worker_count)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let receiver = receiver.clone();
            std::thread::spawn(move || {
                while let Ok((x, y)) = receiver.recv() {
                    if pipeline.stopped() {
                        break;
                    }
                    if let Err(error) = pipeline.process_base_tile(x, y) {
                        pipeline.latch_error(error);
                        break;
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        if worker.join().is_err() {
            pipeline.latch_error(IrisError::Failure("encoder worker panicked".into()));
        }
    }

    if let Some(message) = pipeline.error.lock().take() {
        return Err(EncoderError::WorkerFailed(message).into());
    }
    if pipeline.cancel.load(Ordering::Relaxed) {
        return Ok(RunOutcome::Interrupted);
    }

    publish(&pipeline, width, height)?;
    Ok(RunOutcome::Completed)
}

/// Write the ancillary regions and the root directory, then patch the
/// header. Runs single-threaded after the workers drain.
fn publish(pipeline: &Pipeline, width: u32, height: u32) -> Result<()> {
    let settings = &pipeline.settings;
    let mut directory = RootDirectory::with_extent(
        Extent {
            width,
            height,
            layers: pipeline.layers.clone(),
        },
        settings.format,
        settings.encoding,
    );
    directory.tiles = pipeline.directory.lock().clone();
    directory.schema = settings.attributes.schema;
    directory.schema_version = settings.attributes.schema_version;
    directory.attributes = settings.attributes.entries.clone();
    directory.microns_per_pixel = settings.microns_per_pixel;
    directory.magnification = settings.magnification;

    for image in &settings.associated_images {
        let offset = pipeline.claim(image.bytes.size() as u64);
        pipeline.file.write_all_at(image.bytes.data(), offset)?;
        directory.associated_images.insert(
            image.label.clone(),
            crate::container::AssociatedImageEntry {
                range: ByteRange::new(offset, image.bytes.size() as u32),
                width: image.width,
                height: image.height,
                encoding: image.encoding,
                source_format: image.source_format,
                orientation: image.orientation,
            },
        );
    }

    for annotation in &settings.annotations {
        let offset = pipeline.claim(annotation.data.size() as u64);
        pipeline
            .file
            .write_all_at(annotation.data.data(), offset)?;
        directory.annotations.insert(
            annotation.id,
            crate::container::AnnotationEntry {
                range: ByteRange::new(offset, annotation.data.size() as u32),
                kind: annotation.kind,
                x_location: annotation.x_location,
                y_location: annotation.y_location,
                x_size: annotation.x_size,
                y_size: annotation.y_size,
                width: annotation.width,
                height: annotation.height,
            },
        );
    }
    for (label, members) in &settings.annotation_groups {
        directory
            .annotation_groups
            .insert(label.clone(), members.clone());
    }

    if !settings.icc_profile.is_empty() {
        let offset = pipeline.claim(settings.icc_profile.len() as u64);
        pipeline.file.write_all_at(&settings.icc_profile, offset)?;
        directory.icc_profile = ByteRange::new(offset, settings.icc_profile.len() as u32);
    }

    // Directory block, then the header patch once it is durable.
    let block = directory.serialize();
    let root_offset = pipeline.claim(block.len() as u64);
    pipeline.file.write_all_at(&block, root_offset)?;
    pipeline.file.sync_all()?;
    pipeline
        .file
        .write_all_at(&root_offset.to_le_bytes(), ROOT_OFFSET_FIELD)?;
    pipeline.file.sync_all()?;

    debug!(
        path = %settings.dst_path.display(),
        tiles = directory.extent.total_tiles(),
        "encode complete"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
