//! Baseline JPEG tile codec backed by the `image` crate.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader, RgbImage};

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::pixel::convert_tile_format;
use crate::types::{Format, Quality, Subsampling, TILE_PIX_LENGTH};

use super::lz::deliver_pixels;
use super::CodecBackend;

/// Lossy JPEG tile codec.
///
/// Alpha does not survive JPEG; four-channel input is stripped to three
/// before encoding and decoded tiles synthesize opaque alpha on request.
/// The baseline encoder chooses its own chroma subsampling; the requested
/// value is accepted for interface compatibility.
pub struct JpegCodec;

impl CodecBackend for JpegCodec {
    fn compress(
        &self,
        src: &Buffer,
        src_fmt: Format,
        quality: Quality,
        _subsampling: Subsampling,
    ) -> Result<Buffer, CodecError> {
        if src_fmt == Format::Undefined {
            return Err(CodecError::UnsupportedFormat(src_fmt));
        }
        // Normalize to tightly packed RGB for the encoder.
        let rgb = convert_tile_format(src, src_fmt, Format::R8G8B8, None)
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        let side = TILE_PIX_LENGTH as u32;
        let img = RgbImage::from_raw(side, side, rgb.into_vec())
            .ok_or_else(|| CodecError::CompressFailed("tile bytes did not fill 256x256".into()))?;

        let quality = quality.min(100) as u8;
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&DynamicImage::ImageRgb8(img))
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        Ok(Buffer::from(out))
    }

    fn decompress(&self, src: &Buffer, dst_fmt: Format) -> Result<Buffer, CodecError> {
        let reader = ImageReader::with_format(Cursor::new(src.data()), image::ImageFormat::Jpeg);
        let img = reader
            .decode()
            .map_err(|e| CodecError::DecompressFailed(e.to_string()))?;

        let side = TILE_PIX_LENGTH as u32;
        if img.width() != side || img.height() != side {
            return Err(CodecError::WrongTileDimensions {
                width: img.width(),
                height: img.height(),
            });
        }

        deliver_pixels(img.to_rgb8().into_raw(), Format::R8G8B8, dst_fmt)
    }

    fn mime(&self) -> &'static str {
        "image/jpeg"
    }
}

// =============================================================================
// Tests
// =============================================================================
