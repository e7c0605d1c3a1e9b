//! Encode -> decode round trips and mutation-then-reopen scenarios.

use std::time::Duration;

use iris_file_engine::{
    validate_slide, Annotation, AnnotationKind, Buffer, CacheEncoding, CacheReadAccess,
    CacheStoreAccess, EncodeSlideInfo, Encoder, EncoderStatus, Encoding, Format, Slide,
    SlideOpenInfo, SlideTileReadInfo, TILE_PIX_BYTES_RGB,
};

use super::test_utils::{patterned_tile, seeded_cache, wait_for_settled};

/// Encode the seeded cache to a slide file and return the opened result.
fn encode_cache_to_slide(
    x_tiles: u32,
    y_tiles: u32,
    encoding: Encoding,
    dst: &std::path::Path,
) -> Slide {
    let encoder = Encoder::create(EncodeSlideInfo {
        desired_encoding: encoding,
        ..Default::default()
    })
    .unwrap();
    encoder
        .set_src_cache(seeded_cache(x_tiles, y_tiles, CacheEncoding::Lz))
        .unwrap();
    encoder.set_dst_path(dst).unwrap();
    encoder.dispatch().unwrap();

    let progress = wait_for_settled(&encoder, Duration::from_secs(120));
    assert_eq!(
        progress.status,
        EncoderStatus::Inactive,
        "encode failed: {}",
        progress.error_msg
    );
    assert_eq!(progress.progress, 1.0);

    let report = validate_slide(dst).unwrap();
    assert!(report.is_valid(), "errors: {:?}", report.errors);
    Slide::open(SlideOpenInfo::new(dst)).unwrap()
}

#[test]
fn lossless_encode_decode_is_pixel_exact() {
    let dir = tempfile::tempdir().unwrap();
    let slide = encode_cache_to_slide(4, 4, Encoding::Iris, &dir.path().join("exact.iris"));

    let info = slide.info();
    let base_layer = (info.extent.layers.len() - 1) as u32;
    for index in 0..16 {
        let tile = slide
            .read_tile(SlideTileReadInfo::new(base_layer, index).with_format(Format::R8G8B8))
            .unwrap();
        assert_eq!(
            tile.data(),
            patterned_tile(index).data(),
            "tile {index} not reconstructed exactly"
        );
    }
}

#[test]
fn derived_pyramid_has_expected_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let slide = encode_cache_to_slide(4, 4, Encoding::Iris, &dir.path().join("pyramid.iris"));

    let info = slide.info();
    // 4x4 -> 2x2 -> 1x1 under the default 2x derivation.
    let dims: Vec<(u32, u32)> = info
        .extent
        .layers
        .iter()
        .map(|layer| (layer.x_tiles, layer.y_tiles))
        .collect();
    assert_eq!(dims, vec![(1, 1), (2, 2), (4, 4)]);
    for layer in &info.extent.layers {
        assert!((layer.scale * layer.downsample - 1.0).abs() < 1e-6);
    }

    // Every layer's tiles decode at full size.
    for (layer_index, layer) in info.extent.layers.iter().enumerate() {
        for index in 0..layer.x_tiles * layer.y_tiles {
            let tile = slide
                .read_tile(
                    SlideTileReadInfo::new(layer_index as u32, index)
                        .with_format(Format::R8G8B8),
                )
                .unwrap();
            assert_eq!(tile.size(), TILE_PIX_BYTES_RGB);
        }
    }
}

#[test]
fn uniform_source_derives_uniform_pyramid() {
    // Averaging is neutral on uniform data, so every derived layer of a
    // uniform slide holds the same value.
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("uniform.iris");

    let cache = iris_file_engine::Cache::create(iris_file_engine::CacheCreateInfo {
        encoding: CacheEncoding::NoCompression,
        format: Format::R8G8B8,
        extent: Some(super::test_utils::grid_extent(2, 2)),
        ..Default::default()
    })
    .unwrap();
    let uniform = Buffer::from(vec![123u8; TILE_PIX_BYTES_RGB]);
    for index in 0..4 {
        cache
            .store_entry(0, index, &uniform, CacheStoreAccess::CompressTile)
            .unwrap();
    }

    let encoder = Encoder::create(EncodeSlideInfo {
        desired_encoding: Encoding::Iris,
        ..Default::default()
    })
    .unwrap();
    encoder.set_src_cache(cache).unwrap();
    encoder.set_dst_path(&dst).unwrap();
    encoder.dispatch().unwrap();
    let progress = wait_for_settled(&encoder, Duration::from_secs(60));
    assert_eq!(progress.status, EncoderStatus::Inactive, "{}", progress.error_msg);

    let slide = Slide::open(SlideOpenInfo::new(&dst)).unwrap();
    // The 1x1 tip is the 2x average of four uniform tiles.
    let tip = slide
        .read_tile(SlideTileReadInfo::new(0, 0).with_format(Format::R8G8B8))
        .unwrap();
    assert!(tip.data().iter().all(|&byte| byte == 123));
}

#[test]
fn single_tile_slide_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let slide = encode_cache_to_slide(1, 1, Encoding::Iris, &dir.path().join("single.iris"));

    let info = slide.info();
    assert_eq!(info.extent.layers.len(), 1);
    let tile = slide
        .read_tile(SlideTileReadInfo::new(0, 0).with_format(Format::R8G8B8))
        .unwrap();
    assert_eq!(tile.data(), patterned_tile(0).data());
}

#[test]
fn ragged_extent_zero_pads_boundary_tiles() {
    // A 2x2-tile cache whose declared extent stops mid-tile: the encoder
    // writes full tiles, and the declared extent survives the round trip.
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("ragged.iris");

    let mut extent = super::test_utils::grid_extent(2, 2);
    extent.width = 400; // 256 + 144
    extent.height = 300;
    let cache = iris_file_engine::Cache::create(iris_file_engine::CacheCreateInfo {
        encoding: CacheEncoding::Lz,
        format: Format::R8G8B8,
        extent: Some(extent),
        ..Default::default()
    })
    .unwrap();
    // Only the top-left tile carries pixels; the boundary slots stay
    // unstored and read back as zero padding.
    cache
        .store_entry(0, 0, &patterned_tile(0), CacheStoreAccess::CompressTile)
        .unwrap();

    let encoder = Encoder::create(EncodeSlideInfo {
        desired_encoding: Encoding::Iris,
        ..Default::default()
    })
    .unwrap();
    encoder.set_src_cache(cache).unwrap();
    encoder.set_dst_path(&dst).unwrap();
    encoder.dispatch().unwrap();
    let progress = wait_for_settled(&encoder, Duration::from_secs(60));
    assert_eq!(progress.status, EncoderStatus::Inactive, "{}", progress.error_msg);

    let slide = Slide::open(SlideOpenInfo::new(&dst)).unwrap();
    let info = slide.info();
    assert_eq!(info.extent.width, 400);
    assert_eq!(info.extent.height, 300);

    let base_layer = (info.extent.layers.len() - 1) as u32;
    let boundary = slide
        .read_tile(SlideTileReadInfo::new(base_layer, 3).with_format(Format::R8G8B8))
        .unwrap();
    assert_eq!(boundary.size(), TILE_PIX_BYTES_RGB);
    assert!(boundary.data().iter().all(|&byte| byte == 0));
}

#[test]
fn annotation_append_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("annotated.iris");
    encode_cache_to_slide(2, 2, Encoding::Iris, &dst);

    {
        let slide = Slide::open(SlideOpenInfo::new(&dst).with_write_access()).unwrap();
        for id in [3u32, 11, 42] {
            slide
                .annotate(&Annotation {
                    id,
                    kind: AnnotationKind::Text,
                    data: Buffer::copy_from(format!("note-{id}").as_bytes()),
                    x_location: id as f32 / 100.0,
                    y_location: 0.5,
                    x_size: 0.05,
                    y_size: 0.05,
                    width: 0,
                    height: 0,
                })
                .unwrap();
        }
    }

    // The annotated file still validates, and a fresh open sees the same
    // annotation set.
    assert!(validate_slide(&dst).unwrap().is_valid());
    let reopened = Slide::open(SlideOpenInfo::new(&dst)).unwrap();
    let annotations = reopened.annotations().unwrap();
    assert_eq!(annotations.len(), 3);
    for id in [3u32, 11, 42] {
        assert_eq!(
            annotations[&id].data.data(),
            format!("note-{id}").as_bytes()
        );
    }

    // Tiles are untouched by the appended region.
    let info = reopened.info();
    let base_layer = (info.extent.layers.len() - 1) as u32;
    let tile = reopened
        .read_tile(SlideTileReadInfo::new(base_layer, 0).with_format(Format::R8G8B8))
        .unwrap();
    assert_eq!(tile.data(), patterned_tile(0).data());
}

#[test]
fn cache_no_compression_path_is_pixel_exact() {
    let cache = iris_file_engine::Cache::create(iris_file_engine::CacheCreateInfo {
        encoding: CacheEncoding::NoCompression,
        format: Format::R8G8B8,
        ..Default::default()
    })
    .unwrap();

    for index in 0..6 {
        cache
            .store_entry(0, index, &patterned_tile(index), CacheStoreAccess::CompressTile)
            .unwrap();
    }
    for index in 0..6 {
        let tile = cache
            .read_entry(0, index, Format::R8G8B8, CacheReadAccess::DecompressTile, None)
            .unwrap();
        assert_eq!(tile.data(), patterned_tile(index).data());
    }
}

#[test]
fn jpeg_encode_produces_valid_openable_slide() {
    let dir = tempfile::tempdir().unwrap();
    let slide = encode_cache_to_slide(2, 2, Encoding::Jpeg, &dir.path().join("jpeg.iris"));

    let info = slide.info();
    assert_eq!(info.encoding, Encoding::Jpeg);
    let base_layer = (info.extent.layers.len() - 1) as u32;
    let tile = slide
        .read_tile(SlideTileReadInfo::new(base_layer, 0).with_format(Format::R8G8B8))
        .unwrap();
    // Lossy: only the shape is guaranteed.
    assert_eq!(tile.size(), TILE_PIX_BYTES_RGB);
}
