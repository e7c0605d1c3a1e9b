//! Structural validation of slide files.
//!
//! Parsing (see [`super::directory`]) accepts any block whose fields decode;
//! validation checks the decoded structure against the file it came from:
//! every referenced byte range inside the file, tile counts consistent with
//! the layer geometry, layers monotone in scale with a uniform pyramid
//! factor. Fatal findings become errors; oddities a reader can tolerate
//! (an unusual tile alignment, a width that disagrees with the tile grid by
//! less than a tile) are warnings.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{ContainerError, Result};

use super::directory::{ByteRange, RootDirectory};
use super::header::{FileHeader, HEADER_SIZE};

// =============================================================================
// Validation report
// =============================================================================

/// Outcome of validating a slide file.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Fatal findings; non-empty means the file must be rejected.
    pub errors: Vec<ContainerError>,

    /// Non-fatal findings; the file remains usable.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ContainerError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Convert to a result, surfacing the first error.
    pub fn into_result(mut self) -> Result<(), ContainerError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.remove(0))
        }
    }
}

// =============================================================================
// Directory validation
// =============================================================================

fn check_range(
    report: &mut ValidationReport,
    what: &'static str,
    range: ByteRange,
    file_len: u64,
) {
    if range.is_empty() {
        return;
    }
    match range.end() {
        Some(end) if range.offset >= HEADER_SIZE as u64 && end <= file_len => {}
        Some(_) | None => report.add_error(ContainerError::OutOfRange {
            what,
            offset: range.offset,
            size: range.size as u64,
            file_len,
        }),
    }
}

/// Validate a parsed directory against the length of its file.
pub fn validate_directory(directory: &RootDirectory, file_len: u64) -> ValidationReport {
    let mut report = ValidationReport::default();

    // Layer geometry: present, monotone, uniform pyramid factor.
    let layers = &directory.extent.layers;
    if layers.is_empty() {
        report.add_error(ContainerError::BadLayerGeometry(
            "file declares no layers".into(),
        ));
        return report;
    }
    for window in layers.windows(2) {
        let (low, high) = (&window[0], &window[1]);
        if high.scale <= low.scale {
            report.add_error(ContainerError::BadLayerGeometry(format!(
                "layer scales not increasing ({} then {})",
                low.scale, high.scale
            )));
        }
        if high.x_tiles < low.x_tiles || high.y_tiles < low.y_tiles {
            report.add_error(ContainerError::BadLayerGeometry(format!(
                "tile grid shrinks from {}x{} to {}x{}",
                low.x_tiles, low.y_tiles, high.x_tiles, high.y_tiles
            )));
        }
    }
    if layers.len() > 1 {
        let factor = pyramid_factor(&layers[0], &layers[1]);
        match factor {
            Some(factor) => {
                for (index, window) in layers.windows(2).enumerate() {
                    if pyramid_factor(&window[0], &window[1]) != Some(factor) {
                        report.add_error(ContainerError::BadLayerGeometry(format!(
                            "pyramid factor changes at layer {}",
                            index + 1
                        )));
                    }
                }
            }
            None => report.add_error(ContainerError::BadLayerGeometry(
                "adjacent layer tile counts are neither a 2x nor a 4x pyramid".into(),
            )),
        }
    }

    // The declared pixel extent should fill the top layer's tile grid.
    if let Some(top) = layers.last() {
        let expected_x = directory.extent.width.div_ceil(256);
        let expected_y = directory.extent.height.div_ceil(256);
        if expected_x != top.x_tiles || expected_y != top.y_tiles {
            report.add_warning(format!(
                "extent {}x{} px implies a {}x{} tile grid, directory says {}x{}",
                directory.extent.width,
                directory.extent.height,
                expected_x,
                expected_y,
                top.x_tiles,
                top.y_tiles
            ));
        }
    }

    // Tile directory shape and ranges.
    if directory.tiles.len() != layers.len() {
        report.add_error(ContainerError::BadLayerGeometry(format!(
            "tile directory covers {} layers, extent declares {}",
            directory.tiles.len(),
            layers.len()
        )));
    }
    for (layer, (entries, extent)) in directory.tiles.iter().zip(layers).enumerate() {
        if entries.len() != extent.tile_count() {
            report.add_error(ContainerError::BadLayerGeometry(format!(
                "layer {} holds {} tile entries, geometry requires {}",
                layer,
                entries.len(),
                extent.tile_count()
            )));
        }
        for entry in entries {
            check_range(&mut report, "tile", *entry, file_len);
            if !entry.is_empty() && entry.offset % 4 != 0 {
                report.add_warning(format!(
                    "layer {layer} tile at offset {} is not 4-byte aligned",
                    entry.offset
                ));
            }
        }
    }

    // Ancillary regions.
    for image in directory.associated_images.values() {
        check_range(&mut report, "associated image", image.range, file_len);
    }
    for annotation in directory.annotations.values() {
        check_range(&mut report, "annotation", annotation.range, file_len);
    }
    for (label, members) in &directory.annotation_groups {
        for id in members {
            if !directory.annotations.contains_key(id) {
                report.add_warning(format!(
                    "annotation group {label:?} references unknown annotation {id}"
                ));
            }
        }
    }
    check_range(&mut report, "ICC profile", directory.icc_profile, file_len);

    report
}

fn pyramid_factor(low: &crate::types::LayerExtent, high: &crate::types::LayerExtent) -> Option<u32> {
    for factor in [2u32, 4] {
        if high.x_tiles.div_ceil(factor) == low.x_tiles
            && high.y_tiles.div_ceil(factor) == low.y_tiles
        {
            return Some(factor);
        }
    }
    None
}

// =============================================================================
// File validation
// =============================================================================

/// Read and parse the header and root directory of a slide file.
pub fn read_container(path: impl AsRef<Path>) -> Result<(FileHeader, RootDirectory, u64)> {
    let mut file = File::open(path.as_ref())?;
    let file_len = file.metadata()?.len();

    let mut header_bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_bytes).map_err(|_| {
        ContainerError::Truncated {
            offset: 0,
            required: HEADER_SIZE as u64,
            actual: file_len,
        }
    })?;
    let header = FileHeader::parse(&header_bytes)?;

    if header.root_offset < HEADER_SIZE as u64 || header.root_offset >= file_len {
        return Err(ContainerError::OutOfRange {
            what: "root directory",
            offset: header.root_offset,
            size: 0,
            file_len,
        }
        .into());
    }

    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(header.root_offset))?;
    let mut block = Vec::with_capacity((file_len - header.root_offset) as usize);
    file.read_to_end(&mut block)?;
    let directory = RootDirectory::parse(&block)?;

    Ok((header, directory, file_len))
}

/// Fully validate a slide file: header, directory parse, and structural
/// sanity of every referenced range.
pub fn validate_slide(path: impl AsRef<Path>) -> Result<ValidationReport> {
    let (_, directory, file_len) = read_container(path)?;
    Ok(validate_directory(&directory, file_len))
}

// =============================================================================
// Tests
// =============================================================================
