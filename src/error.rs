//! Error types for every subsystem.
//!
//! Each domain carries its own `thiserror` enum; [`IrisError`] unifies them
//! at the public API boundary. Every error maps onto a [`ResultFlag`] so
//! callers that only care about the coarse taxonomy (success / failure /
//! validation failure / warning) can branch on [`IrisError::flag`].

use thiserror::Error;

use crate::types::{CacheEncoding, Format};

// =============================================================================
// Result flag taxonomy
// =============================================================================

/// Coarse classification of an operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFlag {
    /// Operation completed.
    Success,
    /// Generic recoverable failure.
    Failure,
    /// Operation on an object that has not been prepared (e.g. an encoder
    /// with no source or destination assigned).
    Uninitialized,
    /// The file does not conform to the Iris File Extension format.
    ValidationFailure,
    /// Non-fatal finding; the object remains usable.
    Warning,
    /// Non-fatal format finding; the object remains usable.
    WarningValidation,
}

// =============================================================================
// Buffer errors
// =============================================================================

/// Errors raised by [`crate::buffer::Buffer`] operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// A write would exceed the fixed capacity of a weak buffer.
    #[error(
        "attempted to write {requested} bytes into a weak buffer with {available} bytes available; \
         wrap a larger region or copy into a strong buffer"
    )]
    WeakCapacityExceeded { requested: usize, available: usize },

    /// The allocator refused to grow a strong buffer.
    #[error("failed to allocate {requested} bytes")]
    AllocationFailed { requested: usize },

    /// `set_size` beyond the current capacity.
    #[error("size {size} exceeds buffer capacity {capacity}")]
    SizeExceedsCapacity { size: usize, capacity: usize },
}

// =============================================================================
// Pixel kernel errors
// =============================================================================

/// Errors raised by tile format conversion and downsampling.
#[derive(Debug, Error)]
pub enum PixelError {
    /// Source or destination format was [`Format::Undefined`].
    #[error("cannot convert {side} with undefined pixel format")]
    UndefinedFormat { side: &'static str },

    /// A buffer was smaller than one tile in the stated format.
    #[error("{side} buffer holds {actual} bytes, tile requires {required}")]
    ShortTileBuffer {
        side: &'static str,
        required: usize,
        actual: usize,
    },

    /// Downsampler invoked with a channel count other than 3 or 4.
    #[error("unsupported channel count {0} (expected 3 or 4)")]
    UnsupportedChannels(u8),

    /// Downsampler invoked with a sub-tile coordinate outside its grid.
    #[error("sub-tile coordinate ({sub_y}, {sub_x}) outside {limit}x{limit} grid")]
    SubTileOutOfRange { sub_y: u16, sub_x: u16, limit: u16 },
}

// =============================================================================
// Codec errors
// =============================================================================

/// Errors raised by compression backends and the codec registry.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No backend registered for the requested encoding.
    #[error("no codec backend registered for {0:?}")]
    NoBackend(CacheEncoding),

    /// The backend rejected or failed to compress the input.
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// The backend failed to decode the byte stream.
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// A decoded tile did not have 256x256 dimensions.
    #[error("decoded tile is {width}x{height}, expected 256x256")]
    WrongTileDimensions { width: u32, height: u32 },

    /// The backend cannot produce or consume the requested pixel format.
    #[error("codec does not support pixel format {0:?}")]
    UnsupportedFormat(Format),
}

// =============================================================================
// Container errors
// =============================================================================

/// Errors raised while parsing or emitting the binary container.
///
/// These all classify as validation failures: the byte stream does not
/// conform to the Iris File Extension format.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The first eight bytes were not the IFE magic tag.
    #[error("bad magic tag (not an Iris Codec file)")]
    BadMagic,

    /// The file's version postdates this codec.
    #[error("file version {file} exceeds codec version {codec}")]
    VersionAhead { file: String, codec: String },

    /// Fewer bytes than a structure requires.
    #[error("truncated file: needed {required} bytes at offset {offset}, file has {actual}")]
    Truncated {
        offset: u64,
        required: u64,
        actual: u64,
    },

    /// An offset or offset+size falls outside the file.
    #[error("{what} at offset {offset} with size {size} exceeds file length {file_len}")]
    OutOfRange {
        what: &'static str,
        offset: u64,
        size: u64,
        file_len: u64,
    },

    /// A tagged field held a value outside its enumeration.
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u32 },

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    /// The layer list is empty or not monotone in scale.
    #[error("invalid layer geometry: {0}")]
    BadLayerGeometry(String),

    /// Arithmetic on a directory entry overflowed.
    #[error("size overflow in {what}")]
    SizeOverflow { what: &'static str },
}

// =============================================================================
// Slide, cache, and encoder errors
// =============================================================================

/// Errors raised by the slide read path.
#[derive(Debug, Error)]
pub enum SlideError {
    #[error("layer {layer} out of range (slide has {layers} layers)")]
    LayerOutOfRange { layer: u32, layers: u32 },

    #[error("tile index {index} out of range (layer {layer} has {tiles} tiles)")]
    TileOutOfRange { layer: u32, index: u32, tiles: u32 },

    #[error("annotation id {0} already present in slide")]
    DuplicateAnnotation(u32),

    #[error("slide was opened without write access")]
    ReadOnly,

    #[error("associated image label {0:?} not present in slide")]
    NoSuchImage(String),
}

/// Errors raised by the scratch cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry ({layer}, {index}) has not been stored")]
    MissingEntry { layer: u32, index: u32 },

    #[error("cache created with undefined encoding cannot compress tiles")]
    UndefinedEncoding,
}

/// Errors raised by the encoder state machine and pipeline.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder active: {0} is only permitted while inactive")]
    Active(&'static str),

    #[error("encoder has no source assigned")]
    NoSource,

    #[error("encoder has no destination path assigned")]
    NoDestination,

    #[error("encoder source reports undefined pixel format")]
    UndefinedSourceFormat,

    #[error("encoder worker failed: {0}")]
    WorkerFailed(String),
}

// =============================================================================
// Unified error
// =============================================================================

/// Unified error for the public API surface.
#[derive(Debug, Error)]
pub enum IrisError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Pixel(#[from] PixelError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Slide(#[from] SlideError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failure(String),
}

impl IrisError {
    /// Classify this error within the coarse result taxonomy.
    pub fn flag(&self) -> ResultFlag {
        match self {
            IrisError::Container(_) => ResultFlag::ValidationFailure,
            IrisError::Encoder(EncoderError::NoSource)
            | IrisError::Encoder(EncoderError::NoDestination)
            | IrisError::Encoder(EncoderError::UndefinedSourceFormat) => ResultFlag::Uninitialized,
            _ => ResultFlag::Failure,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T, E = IrisError> = std::result::Result<T, E>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_errors_are_validation_failures() {
        let error = IrisError::from(ContainerError::BadMagic);
        assert_eq!(error.flag(), ResultFlag::ValidationFailure);
    }

    #[test]
    fn test_unprepared_encoder_is_uninitialized() {
        let error = IrisError::from(EncoderError::NoSource);
        assert_eq!(error.flag(), ResultFlag::Uninitialized);
        let error = IrisError::from(EncoderError::NoDestination);
        assert_eq!(error.flag(), ResultFlag::Uninitialized);
    }

    #[test]
    fn test_generic_errors_are_failures() {
        let error = IrisError::from(BufferError::AllocationFailed { requested: 16 });
        assert_eq!(error.flag(), ResultFlag::Failure);
        let error = IrisError::Failure("boom".into());
        assert_eq!(error.flag(), ResultFlag::Failure);
    }

    #[test]
    fn test_weak_capacity_message_names_both_sizes() {
        let error = BufferError::WeakCapacityExceeded {
            requested: 64,
            available: 16,
        };
        let message = error.to_string();
        assert!(message.contains("64"));
        assert!(message.contains("16"));
    }
}
