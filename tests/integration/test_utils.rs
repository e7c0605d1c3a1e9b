//! Test utilities for integration tests.
//!
//! Helpers for building deterministic pixel tiles, seeded caches, and
//! synthetic tile sources with controllable pacing and failure injection.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iris_file_engine::{
    Buffer, Cache, CacheCreateInfo, CacheEncoding, CacheStoreAccess, Encoder, EncoderProgress,
    EncoderStatus, Extent, Format, IrisError, LayerExtent, TileSource, TILE_PIX_BYTES_RGB,
};

// =============================================================================
// Logging
// =============================================================================

static INIT_LOGGING: Once = Once::new();

/// Initialize the tracing/logging subsystem for tests.
///
/// Installed once per test binary; honors `RUST_LOG` and defaults to the
/// crate's info-level events so encoder runs are observable when a test
/// fails.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "iris_file_engine=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

// =============================================================================
// Deterministic pixel data
// =============================================================================

/// A full RGB tile with a pattern derived from `seed`; two tiles with the
/// same seed are byte-identical.
pub fn patterned_tile(seed: u32) -> Buffer {
    let bytes: Vec<u8> = (0..TILE_PIX_BYTES_RGB)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seed * 97) % 251) as u8)
        .collect();
    Buffer::from(bytes)
}

/// A single-layer extent of `x_tiles` x `y_tiles` full tiles.
pub fn grid_extent(x_tiles: u32, y_tiles: u32) -> Extent {
    Extent {
        width: x_tiles * 256,
        height: y_tiles * 256,
        layers: vec![LayerExtent {
            x_tiles,
            y_tiles,
            scale: 1.0,
            downsample: 1.0,
        }],
    }
}

/// A cache seeded with one patterned tile per slot.
pub fn seeded_cache(x_tiles: u32, y_tiles: u32, encoding: CacheEncoding) -> Cache {
    init_test_logging();
    let cache = Cache::create(CacheCreateInfo {
        encoding,
        format: Format::R8G8B8,
        extent: Some(grid_extent(x_tiles, y_tiles)),
        ..Default::default()
    })
    .expect("cache creation");
    for index in 0..x_tiles * y_tiles {
        cache
            .store_entry(
                0,
                index,
                &patterned_tile(index),
                CacheStoreAccess::CompressTile,
            )
            .expect("store entry");
    }
    cache
}

// =============================================================================
// Synthetic tile sources
// =============================================================================

/// A tile source that sleeps per read (to keep an encode observable) and can
/// inject a failure at a chosen tile index.
pub struct ThrottledSource {
    extent: Extent,
    delay: Duration,
    fail_at: Option<u32>,
}

impl ThrottledSource {
    pub fn new(x_tiles: u32, y_tiles: u32, delay: Duration) -> Self {
        init_test_logging();
        ThrottledSource {
            extent: grid_extent(x_tiles, y_tiles),
            delay,
            fail_at: None,
        }
    }

    pub fn failing_at(mut self, index: u32) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn shared(self) -> Arc<dyn TileSource> {
        Arc::new(self)
    }
}

impl TileSource for ThrottledSource {
    fn extent(&self) -> Extent {
        self.extent.clone()
    }

    fn format(&self) -> Format {
        Format::R8G8B8
    }

    fn read_tile(&self, _layer: u32, index: u32) -> Result<Buffer, IrisError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_at == Some(index) {
            return Err(IrisError::Failure(format!(
                "synthetic read failure at tile {index}"
            )));
        }
        Ok(patterned_tile(index))
    }
}

// =============================================================================
// Encoder polling
// =============================================================================

/// Poll until the encoder leaves `Active` (or the deadline passes) and
/// return the final snapshot.
pub fn wait_for_settled(encoder: &Encoder, deadline: Duration) -> EncoderProgress {
    let end = Instant::now() + deadline;
    loop {
        let progress = encoder.progress();
        if progress.status != EncoderStatus::Active || Instant::now() > end {
            return progress;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Poll until `predicate` holds for a snapshot (or the deadline passes).
pub fn wait_until(
    encoder: &Encoder,
    deadline: Duration,
    predicate: impl Fn(&EncoderProgress) -> bool,
) -> EncoderProgress {
    let end = Instant::now() + deadline;
    loop {
        let progress = encoder.progress();
        if predicate(&progress) || Instant::now() > end {
            return progress;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
