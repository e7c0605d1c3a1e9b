//! Tile pixel-format conversion.
//!
//! Conversion between the supported formats decomposes into at most two
//! independent tasks derived from the source/destination pair:
//!
//! 1. Channel-count adjustment: expand 3 -> 4 channels (append `0xFF`
//!    alpha) or strip 4 -> 3.
//! 2. Channel-order swap: exchange bytes 0 and 2 of every pixel
//!    (RGB <-> BGR).
//!
//! The count adjustment runs first, the swap second, in place on the
//! destination. Alpha expansion walks pixels in reverse and stripping walks
//! forward, the orders under which a buffer can be converted over its own
//! bytes.

use wide::u8x16;

use crate::buffer::Buffer;
use crate::error::PixelError;
use crate::types::{Format, TILE_PIX_AREA};

// =============================================================================
// Task selection
// =============================================================================

/// Bitmask of the conversion tasks a format pair requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionTasks(u32);

impl ConversionTasks {
    pub const EXPAND_ALPHA: u32 = 0x01;
    pub const STRIP_ALPHA: u32 = 0x02;
    pub const SWAP_0_2: u32 = 0x10;

    /// Derive the task set for converting `src` to `dst`.
    ///
    /// Both formats must be defined; identical formats yield the empty set.
    pub fn derive(src: Format, dst: Format) -> Result<Self, PixelError> {
        let src_bpp = src
            .bytes_per_pixel()
            .ok_or(PixelError::UndefinedFormat { side: "source" })?;
        let dst_bpp = dst
            .bytes_per_pixel()
            .ok_or(PixelError::UndefinedFormat {
                side: "destination",
            })?;

        let mut tasks = 0;
        if src_bpp == 3 && dst_bpp == 4 {
            tasks |= Self::EXPAND_ALPHA;
        }
        if src_bpp == 4 && dst_bpp == 3 {
            tasks |= Self::STRIP_ALPHA;
        }
        if src.is_blue_first() != dst.is_blue_first() {
            tasks |= Self::SWAP_0_2;
        }
        Ok(ConversionTasks(tasks))
    }

    pub fn contains(self, task: u32) -> bool {
        self.0 & task != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// Public conversion entry point
// =============================================================================

/// Convert one 256x256 tile between pixel formats.
///
/// When `dst` is provided and holds at least one destination-format tile of
/// capacity it receives the result; otherwise a fresh strong buffer is
/// allocated. The returned buffer's size is exactly one tile in `dst_fmt`.
pub fn convert_tile_format(
    src: &Buffer,
    src_fmt: Format,
    dst_fmt: Format,
    dst: Option<Buffer>,
) -> Result<Buffer, PixelError> {
    let tasks = ConversionTasks::derive(src_fmt, dst_fmt)?;
    let src_bytes = TILE_PIX_AREA
        * src_fmt
            .bytes_per_pixel()
            .ok_or(PixelError::UndefinedFormat { side: "source" })?;
    let dst_bytes = TILE_PIX_AREA
        * dst_fmt
            .bytes_per_pixel()
            .ok_or(PixelError::UndefinedFormat {
                side: "destination",
            })?;

    if src.size() < src_bytes {
        return Err(PixelError::ShortTileBuffer {
            side: "source",
            required: src_bytes,
            actual: src.size(),
        });
    }

    let mut out = match dst {
        Some(buffer) if buffer.capacity() >= dst_bytes => buffer,
        _ => Buffer::with_capacity(dst_bytes),
    };
    out.set_size(dst_bytes)
        .map_err(|_| PixelError::ShortTileBuffer {
            side: "destination",
            required: dst_bytes,
            actual: out.capacity(),
        })?;

    // Channel-count adjustment first.
    if tasks.contains(ConversionTasks::EXPAND_ALPHA) {
        expand_tile_alpha(src.data(), out.data_mut());
    } else if tasks.contains(ConversionTasks::STRIP_ALPHA) {
        strip_tile_alpha(src.data(), out.data_mut());
    } else {
        out.data_mut().copy_from_slice(&src.data()[..dst_bytes]);
    }

    // Channel-order swap second, in place on the destination.
    if tasks.contains(ConversionTasks::SWAP_0_2) {
        match dst_fmt.bytes_per_pixel() {
            Some(3) => swap_channels_0_2_3ch(out.data_mut()),
            Some(4) => swap_channels_0_2_4ch(out.data_mut()),
            _ => unreachable!("bytes-per-pixel validated above"),
        }
    }

    Ok(out)
}

// =============================================================================
// Kernels
// =============================================================================

/// Expand a 3-channel tile to 4 channels, appending `0xFF` alpha.
///
/// Pixels are written in reverse so the copy also holds when the
/// destination overlays the source region.
fn expand_tile_alpha(src: &[u8], dst: &mut [u8]) {
    for i in (0..TILE_PIX_AREA).rev() {
        let s = i * 3;
        let d = i * 4;
        dst[d + 3] = 0xFF;
        dst[d + 2] = src[s + 2];
        dst[d + 1] = src[s + 1];
        dst[d] = src[s];
    }
}

/// Strip the alpha channel from a 4-channel tile.
///
/// Pixels are written forward so the copy also holds when the destination
/// overlays the source region.
fn strip_tile_alpha(src: &[u8], dst: &mut [u8]) {
    for i in 0..TILE_PIX_AREA {
        let s = i * 4;
        let d = i * 3;
        dst[d] = src[s];
        dst[d + 1] = src[s + 1];
        dst[d + 2] = src[s + 2];
    }
}

/// Swap bytes 0 and 2 of every 3-byte pixel, in place.
///
/// A three-byte interleave has no portable lane shuffle, so this stays a
/// scalar byte rotation.
fn swap_channels_0_2_3ch(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
}

/// Lane mask: `0xFF` where the lane index is 0 mod 4 (the byte that
/// receives the old blue/red from two lanes ahead).
const SWAP4_TAKE_AHEAD: u8x16 = u8x16::new([
    0xFF, 0, 0, 0, 0xFF, 0, 0, 0, 0xFF, 0, 0, 0, 0xFF, 0, 0, 0,
]);
/// Lane mask: `0xFF` where the lane index is 2 mod 4.
const SWAP4_TAKE_BEHIND: u8x16 = u8x16::new([
    0, 0, 0xFF, 0, 0, 0, 0xFF, 0, 0, 0, 0xFF, 0, 0, 0, 0xFF, 0,
]);
/// Lane mask: `0xFF` on the untouched green and alpha lanes.
const SWAP4_KEEP: u8x16 = u8x16::new([
    0, 0xFF, 0, 0xFF, 0, 0xFF, 0, 0xFF, 0, 0xFF, 0, 0xFF, 0, 0xFF, 0, 0xFF,
]);

/// Swap bytes 0 and 2 of every 4-byte pixel, in place.
///
/// Four pixels per vector: lane `i` takes the byte two lanes ahead when
/// `i % 4 == 0`, two lanes behind when `i % 4 == 2`, and stays put
/// otherwise. Offsets never cross a 16-byte chunk because they stay inside
/// one pixel, so a 20-byte staging window covers both shifted loads.
fn swap_channels_0_2_4ch(data: &mut [u8]) {
    let mut chunks = data.chunks_exact_mut(16);
    for chunk in &mut chunks {
        let mut window = [0u8; 20];
        window[2..18].copy_from_slice(chunk);
        let center = u8x16::new(window[2..18].try_into().unwrap());
        let ahead = u8x16::new(window[4..20].try_into().unwrap());
        let behind = u8x16::new(window[0..16].try_into().unwrap());
        let swapped =
            (ahead & SWAP4_TAKE_AHEAD) | (behind & SWAP4_TAKE_BEHIND) | (center & SWAP4_KEEP);
        chunk.copy_from_slice(&swapped.to_array());
    }
    for pixel in chunks.into_remainder().chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}

/// Scalar reference for the 4-channel swap; the tests hold the vector path
/// to this output.
#[cfg(test)]
fn swap_channels_0_2_4ch_scalar(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}

// =============================================================================
// Tests
// =============================================================================
