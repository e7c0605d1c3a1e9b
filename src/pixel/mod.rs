//! Pixel kernels: tile format conversion and pyramid downsampling.
//!
//! Both kernel families operate on whole 256x256 tiles. Conversion rewrites
//! channel count and channel order between the supported 8-bit formats;
//! downsampling reduces a full tile into a sub-region of a destination tile
//! at 2x or 4x, averaging or sharpening.
//!
//! Vector paths use fixed-width `wide` lanes with scalar references that are
//! bit-identical; the unit tests assert the equivalence.

mod convert;
mod downsample;

pub use convert::{convert_tile_format, ConversionTasks};
pub use downsample::{
    downsample_into_tile_2x_avg, downsample_into_tile_2x_sharp, downsample_into_tile_4x_avg,
    downsample_into_tile_4x_sharp,
};
