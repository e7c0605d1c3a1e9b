//! Container-level scenarios: file signatures, the empty-slide open, and
//! mid-write visibility.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use iris_file_engine::{
    is_iris_codec_file, validate_slide, Encoding, Extent, FileHeader, Format, LayerExtent,
    RootDirectory, Slide, SlideOpenInfo, SlideTileReadInfo, Version, TILE_PIX_BYTES_RGBA,
};

/// Write a minimal published slide file: header, no tile bytes, directory.
fn write_empty_slide(path: &std::path::Path, encoding: Encoding) {
    let extent = Extent {
        width: 256,
        height: 256,
        layers: vec![LayerExtent {
            x_tiles: 1,
            y_tiles: 1,
            scale: 1.0,
            downsample: 1.0,
        }],
    };
    let directory = RootDirectory::with_extent(extent, Format::R8G8B8, encoding);

    let mut file = File::create(path).unwrap();
    let mut header = FileHeader::unpublished();
    header.version = Version::new(2025, 1, 0);
    file.write_all(&header.encode()).unwrap();
    let root_offset = file.stream_position().unwrap();
    file.write_all(&directory.serialize()).unwrap();
    file.seek(SeekFrom::Start(20)).unwrap();
    file.write_all(&root_offset.to_le_bytes()).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn empty_slide_synthesizes_background_tile() {
    // A 256x256 slide, JPEG encoding, single layer, every directory entry
    // (0,0), empty metadata: reading its one tile yields a full background
    // tile in the requested format.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.iris");
    write_empty_slide(&path, Encoding::Jpeg);

    assert!(is_iris_codec_file(&path).unwrap());
    assert!(validate_slide(&path).unwrap().is_valid());

    let slide = Slide::open(SlideOpenInfo::new(&path)).unwrap();
    let tile = slide
        .read_tile(SlideTileReadInfo::new(0, 0).with_format(Format::R8G8B8A8))
        .unwrap();
    assert_eq!(tile.size(), TILE_PIX_BYTES_RGBA);
    assert!(tile.data().iter().all(|&byte| byte == 0xFF));
}

#[test]
fn signature_check_does_not_require_directory() {
    // A file with a valid header but an unpublished (zero) root offset is
    // recognized by the signature check yet refused by open/validate.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unpublished.iris");
    File::create(&path)
        .unwrap()
        .write_all(&FileHeader::unpublished().encode())
        .unwrap();

    assert!(is_iris_codec_file(&path).unwrap());
    assert!(validate_slide(&path).is_err());
    assert!(Slide::open(SlideOpenInfo::new(&path)).is_err());
}

#[test]
fn signature_check_rejects_other_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notiris.tiff");
    File::create(&path)
        .unwrap()
        .write_all(b"II*\0plain old tiff bytes")
        .unwrap();
    assert!(!is_iris_codec_file(&path).unwrap());
}

#[test]
fn future_version_is_not_ours() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.iris");
    let mut header = FileHeader::unpublished();
    header.version = Version::new(9999, 0, 0);
    File::create(&path)
        .unwrap()
        .write_all(&header.encode())
        .unwrap();
    assert!(!is_iris_codec_file(&path).unwrap());
}

#[test]
fn truncated_directory_refused() {
    // Corrupting the root offset to point into the directory's middle makes
    // the parse fail rather than yield a half-read slide.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.iris");
    write_empty_slide(&path, Encoding::Jpeg);

    let file_len = std::fs::metadata(&path).unwrap().len();
    let mut file = File::options().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(20)).unwrap();
    file.write_all(&(file_len - 8).to_le_bytes()).unwrap();
    file.sync_all().unwrap();

    assert!(validate_slide(&path).is_err());
    assert!(Slide::open(SlideOpenInfo::new(&path)).is_err());
}

#[test]
fn iris_encoded_empty_slide_also_synthesizes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty-iris.iris");
    write_empty_slide(&path, Encoding::Iris);

    let slide = Slide::open(SlideOpenInfo::new(&path)).unwrap();
    let tile = slide
        .read_tile(SlideTileReadInfo::new(0, 0).with_format(Format::B8G8R8))
        .unwrap();
    assert_eq!(tile.size(), 256 * 256 * 3);
    assert!(tile.data().iter().all(|&byte| byte == 0xFF));
}
