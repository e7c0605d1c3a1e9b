//! Lossless block codecs: the Iris/LZ tile codec and the raw passthrough.
//!
//! Both wrap the decoded pixel bytes with a one-byte pixel-format tag so the
//! decoder can honor any requested destination format. The LZ stream body is
//! an `lz4_flex` size-prepended block.

use lz4_flex::block::{compress_prepend_size, decompress_size_prepended};

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::pixel::convert_tile_format;
use crate::types::{Format, Quality, Subsampling, TILE_PIX_AREA};

use super::CodecBackend;

/// Re-shape decoded native-format pixels into the requested format.
pub(crate) fn deliver_pixels(
    pixels: Vec<u8>,
    native: Format,
    dst_fmt: Format,
) -> Result<Buffer, CodecError> {
    let buffer = Buffer::from(pixels);
    if native == dst_fmt {
        return Ok(buffer);
    }
    convert_tile_format(&buffer, native, dst_fmt, None)
        .map_err(|e| CodecError::DecompressFailed(e.to_string()))
}

fn check_tile_input(src: &Buffer, src_fmt: Format) -> Result<usize, CodecError> {
    let bpp = src_fmt
        .bytes_per_pixel()
        .ok_or(CodecError::UnsupportedFormat(src_fmt))?;
    let tile_bytes = TILE_PIX_AREA * bpp;
    if src.size() < tile_bytes {
        return Err(CodecError::CompressFailed(format!(
            "tile input holds {} bytes, format requires {}",
            src.size(),
            tile_bytes
        )));
    }
    Ok(tile_bytes)
}

fn split_format_tag(src: &Buffer) -> Result<(Format, &[u8]), CodecError> {
    let data = src.data();
    let (&tag, body) = data
        .split_first()
        .ok_or_else(|| CodecError::DecompressFailed("empty tile stream".into()))?;
    let native = Format::from_u8(tag)
        .filter(|f| *f != Format::Undefined)
        .ok_or_else(|| CodecError::DecompressFailed(format!("bad format tag {tag}")))?;
    Ok((native, body))
}

// =============================================================================
// LZ codec
// =============================================================================

/// Lossless LZ4 block codec; also the default Iris tile codec.
pub struct LzCodec;

impl CodecBackend for LzCodec {
    fn compress(
        &self,
        src: &Buffer,
        src_fmt: Format,
        _quality: Quality,
        _subsampling: Subsampling,
    ) -> Result<Buffer, CodecError> {
        let tile_bytes = check_tile_input(src, src_fmt)?;
        let block = compress_prepend_size(&src.data()[..tile_bytes]);
        let mut out = Buffer::with_capacity(block.len() + 1);
        out.append_bytes(&[src_fmt as u8])
            .and_then(|_| out.append_bytes(&block))
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        Ok(out)
    }

    fn decompress(&self, src: &Buffer, dst_fmt: Format) -> Result<Buffer, CodecError> {
        let (native, body) = split_format_tag(src)?;
        let pixels = decompress_size_prepended(body)
            .map_err(|e| CodecError::DecompressFailed(e.to_string()))?;
        let expected = TILE_PIX_AREA
            * native
                .bytes_per_pixel()
                .ok_or(CodecError::UnsupportedFormat(native))?;
        if pixels.len() != expected {
            return Err(CodecError::DecompressFailed(format!(
                "tile stream decoded to {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        deliver_pixels(pixels, native, dst_fmt)
    }

    fn mime(&self) -> &'static str {
        "application/x-iris-tile"
    }
}

// =============================================================================
// Raw passthrough
// =============================================================================

/// Uncompressed tile storage: the pixel bytes plus the format tag.
pub struct RawCodec;

impl CodecBackend for RawCodec {
    fn compress(
        &self,
        src: &Buffer,
        src_fmt: Format,
        _quality: Quality,
        _subsampling: Subsampling,
    ) -> Result<Buffer, CodecError> {
        let tile_bytes = check_tile_input(src, src_fmt)?;
        let mut out = Buffer::with_capacity(tile_bytes + 1);
        out.append_bytes(&[src_fmt as u8])
            .and_then(|_| out.append_bytes(&src.data()[..tile_bytes]))
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        Ok(out)
    }

    fn decompress(&self, src: &Buffer, dst_fmt: Format) -> Result<Buffer, CodecError> {
        let (native, body) = split_format_tag(src)?;
        let expected = TILE_PIX_AREA
            * native
                .bytes_per_pixel()
                .ok_or(CodecError::UnsupportedFormat(native))?;
        if body.len() != expected {
            return Err(CodecError::DecompressFailed(format!(
                "raw tile stream holds {} bytes, expected {}",
                body.len(),
                expected
            )));
        }
        deliver_pixels(body.to_vec(), native, dst_fmt)
    }

    fn mime(&self) -> &'static str {
        "application/octet-stream"
    }
}

// =============================================================================
// Tests
// =============================================================================
