//! Multithreaded slide encoder.
//!
//! An [`Encoder`] is a shared-state object with an explicit lifecycle:
//!
//! ```text
//! Inactive --dispatch--> Active --+--> Inactive   (run completed)
//!    ^                           +--> Error      (worker fault latched)
//!    |                           +--> Shutdown   (interrupted)
//!    +------- reset -------------+
//! ```
//!
//! Sources and the destination path may only change while inactive.
//! Dispatch resolves the source, derives the destination pyramid, and hands
//! off to the worker pipeline on a supervisor thread; progress, interruption
//! and errors are observed through [`Encoder::progress`].

mod pipeline;
mod source;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::context::Context;
use crate::error::{EncoderError, Result};
use crate::slide::{Slide, SlideOpenInfo};
use crate::types::{
    Annotation, AssociatedImage, Attributes, Encoding, Format, Quality, Subsampling,
    QUALITY_DEFAULT,
};

pub use source::{CacheSource, SlideSource, TileSource};

// =============================================================================
// Derivation options
// =============================================================================

/// How many pyramid layers to derive between the base and the tip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DerivationLayers {
    /// Halve the tile grid per layer (a 256-tile side yields ~8 layers).
    #[default]
    TwoX,
    /// Quarter the tile grid per layer (a 256-tile side yields ~4 layers).
    FourX,
}

impl DerivationLayers {
    pub fn factor(self) -> u32 {
        match self {
            DerivationLayers::TwoX => 2,
            DerivationLayers::FourX => 4,
        }
    }
}

/// Downsampling filter used between layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownsampleMethod {
    /// Box average.
    #[default]
    Average,
    /// Box average followed by an integer unsharp pass.
    Sharpen,
}

/// Pyramid derivation configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderDerivation {
    pub layers: DerivationLayers,
    pub method: DownsampleMethod,
}

// =============================================================================
// Creation info and progress
// =============================================================================

/// Parameters for [`Encoder::create`].
#[derive(Debug, Clone)]
pub struct EncodeSlideInfo {
    /// Source slide file, when encoding from an existing slide.
    pub src_path: Option<PathBuf>,

    /// Destination file path.
    pub dst_path: Option<PathBuf>,

    /// Tile compression of the output; `Undefined` selects JPEG.
    pub desired_encoding: Encoding,

    /// Working pixel format; `Undefined` adopts the source format.
    pub desired_format: Format,

    pub quality: Quality,
    pub subsampling: Subsampling,
    pub derivation: EncoderDerivation,
    pub context: Option<Context>,

    /// Metadata attributes written into the output directory.
    pub attributes: Attributes,
    pub microns_per_pixel: f32,
    pub magnification: f32,
    pub icc_profile: Vec<u8>,

    /// Ancillary records staged for the output file.
    pub associated_images: Vec<AssociatedImage>,
    pub annotations: Vec<Annotation>,
    pub annotation_groups: BTreeMap<String, BTreeSet<u32>>,
}

impl Default for EncodeSlideInfo {
    fn default() -> Self {
        EncodeSlideInfo {
            src_path: None,
            dst_path: None,
            desired_encoding: Encoding::Undefined,
            desired_format: Format::Undefined,
            quality: QUALITY_DEFAULT,
            subsampling: Subsampling::default(),
            derivation: EncoderDerivation::default(),
            context: None,
            attributes: Attributes::default(),
            microns_per_pixel: 0.0,
            magnification: 0.0,
            icc_profile: Vec::new(),
            associated_images: Vec::new(),
            annotations: Vec::new(),
            annotation_groups: BTreeMap::new(),
        }
    }
}

/// Lifecycle state of an encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncoderStatus {
    #[default]
    Inactive,
    Active,
    Error,
    Shutdown,
}

/// Snapshot returned by [`Encoder::progress`].
#[derive(Debug, Clone)]
pub struct EncoderProgress {
    pub status: EncoderStatus,
    /// Completed fraction in `[0, 1]`, across every layer of the output.
    pub progress: f32,
    pub dst_path: Option<PathBuf>,
    pub error_msg: String,
}

/// Settings resolved at dispatch and handed to the pipeline.
#[derive(Clone)]
pub(crate) struct EncodeSettings {
    pub dst_path: PathBuf,
    pub encoding: Encoding,
    pub format: Format,
    pub quality: Quality,
    pub subsampling: Subsampling,
    pub derivation: EncoderDerivation,
    pub threads: usize,
    pub attributes: Attributes,
    pub microns_per_pixel: f32,
    pub magnification: f32,
    pub icc_profile: Vec<u8>,
    pub associated_images: Vec<AssociatedImage>,
    pub annotations: Vec<Annotation>,
    pub annotation_groups: BTreeMap<String, BTreeSet<u32>>,
}

// =============================================================================
// Encoder
// =============================================================================

enum EncoderSource {
    None,
    Path(PathBuf),
    Cache(Cache),
    Reader(Arc<dyn TileSource>),
}

struct EncoderState {
    status: EncoderStatus,
    src: EncoderSource,
    dst_path: Option<PathBuf>,
    error_msg: String,
    supervisor: Option<JoinHandle<()>>,
    info: EncodeSlideInfo,
}

struct EncoderShared {
    state: Mutex<EncoderState>,
    cancel: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

/// Handle to a slide encoder. Cheap to clone; all clones observe the same
/// state machine.
#[derive(Clone)]
pub struct Encoder {
    inner: Arc<EncoderShared>,
}

impl Encoder {
    /// Create an encoder in the `Inactive` state.
    ///
    /// A provided source path must name an existing file; a provided
    /// destination must sit in an existing directory.
    pub fn create(info: EncodeSlideInfo) -> Result<Self> {
        if let Some(src) = &info.src_path {
            if !src.is_file() {
                return Err(crate::error::IrisError::Failure(format!(
                    "encoder source {} does not exist",
                    src.display()
                )));
            }
        }
        if let Some(dst) = &info.dst_path {
            check_destination(dst)?;
        }

        let src = match &info.src_path {
            Some(path) => EncoderSource::Path(path.clone()),
            None => EncoderSource::None,
        };
        let dst_path = info.dst_path.clone();
        Ok(Encoder {
            inner: Arc::new(EncoderShared {
                state: Mutex::new(EncoderState {
                    status: EncoderStatus::Inactive,
                    src,
                    dst_path,
                    error_msg: String::new(),
                    supervisor: None,
                    info,
                }),
                cancel: Arc::new(AtomicBool::new(false)),
                completed: Arc::new(AtomicU64::new(0)),
                total: Arc::new(AtomicU64::new(0)),
            }),
        })
    }

    /// Source slide path, when one is assigned.
    pub fn src(&self) -> Option<PathBuf> {
        match &self.inner.state.lock().src {
            EncoderSource::Path(path) => Some(path.clone()),
            _ => None,
        }
    }

    /// Destination path, when one is assigned.
    pub fn dst_path(&self) -> Option<PathBuf> {
        self.inner.state.lock().dst_path.clone()
    }

    /// Assign a source slide file. Permitted only while inactive.
    pub fn set_src(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if !path.is_file() {
            return Err(crate::error::IrisError::Failure(format!(
                "encoder source {} does not exist",
                path.display()
            )));
        }
        let mut state = self.lock_inactive("set_src")?;
        state.src = EncoderSource::Path(path);
        Ok(())
    }

    /// Assign a cache as the source. Permitted only while inactive.
    pub fn set_src_cache(&self, cache: Cache) -> Result<()> {
        let mut state = self.lock_inactive("set_src_cache")?;
        state.src = EncoderSource::Cache(cache);
        Ok(())
    }

    /// Assign an arbitrary tile source (e.g. a vendor slide reader).
    /// Permitted only while inactive.
    pub fn set_src_reader(&self, reader: Arc<dyn TileSource>) -> Result<()> {
        let mut state = self.lock_inactive("set_src_reader")?;
        state.src = EncoderSource::Reader(reader);
        Ok(())
    }

    /// Assign the destination path. Permitted only while inactive.
    pub fn set_dst_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        check_destination(&path)?;
        let mut state = self.lock_inactive("set_dst_path")?;
        state.dst_path = Some(path);
        Ok(())
    }

    /// Launch the encode. Transitions `Inactive -> Active` and returns
    /// immediately; observe completion through [`Encoder::progress`].
    pub fn dispatch(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.status != EncoderStatus::Inactive {
            return Err(EncoderError::Active("dispatch").into());
        }

        let source: Arc<dyn TileSource> = match &state.src {
            EncoderSource::None => return Err(EncoderError::NoSource.into()),
            EncoderSource::Path(path) => {
                let slide = Slide::open(SlideOpenInfo::new(path))?;
                Arc::new(SlideSource::new(slide))
            }
            EncoderSource::Cache(cache) => Arc::new(CacheSource::new(cache.clone())?),
            EncoderSource::Reader(reader) => Arc::clone(reader),
        };
        let dst_path = state
            .dst_path
            .clone()
            .ok_or(EncoderError::NoDestination)?;

        let format = match state.info.desired_format {
            Format::Undefined => source.format(),
            format => format,
        };
        if format == Format::Undefined {
            return Err(EncoderError::UndefinedSourceFormat.into());
        }
        let encoding = match state.info.desired_encoding {
            Encoding::Undefined => Encoding::Jpeg,
            encoding => encoding,
        };

        let settings = EncodeSettings {
            dst_path: dst_path.clone(),
            encoding,
            format,
            quality: state.info.quality,
            subsampling: state.info.subsampling,
            derivation: state.info.derivation,
            threads: num_cpus::get(),
            attributes: state.info.attributes.clone(),
            microns_per_pixel: state.info.microns_per_pixel,
            magnification: state.info.magnification,
            icc_profile: state.info.icc_profile.clone(),
            associated_images: state.info.associated_images.clone(),
            annotations: state.info.annotations.clone(),
            annotation_groups: state.info.annotation_groups.clone(),
        };

        self.inner.cancel.store(false, Ordering::Relaxed);
        self.inner.completed.store(0, Ordering::Relaxed);
        self.inner.total.store(0, Ordering::Relaxed);
        state.error_msg.clear();
        state.status = EncoderStatus::Active;
        info!(dst = %dst_path.display(), encoding = ?encoding, "encoder dispatched");

        let shared = Arc::clone(&self.inner);
        let cancel = Arc::clone(&self.inner.cancel);
        let completed = Arc::clone(&self.inner.completed);
        let total = Arc::clone(&self.inner.total);
        state.supervisor = Some(std::thread::spawn(move || {
            let outcome = pipeline::run(source, settings, cancel, completed, total);
            let mut state = shared.state.lock();
            match outcome {
                Ok(pipeline::RunOutcome::Completed) => {
                    state.status = EncoderStatus::Inactive;
                }
                Ok(pipeline::RunOutcome::Interrupted) => {
                    remove_partial(&dst_path);
                    state.status = EncoderStatus::Shutdown;
                    info!(dst = %dst_path.display(), "encoder interrupted; partial output removed");
                }
                Err(error) => {
                    remove_partial(&dst_path);
                    state.error_msg = error.to_string();
                    state.status = EncoderStatus::Error;
                    warn!(%error, "encode failed");
                }
            }
        }));
        Ok(())
    }

    /// Request a cooperative stop. Workers observe the flag at tile
    /// boundaries; the state becomes `Shutdown` once they drain and the
    /// partial output file is deleted.
    pub fn interrupt(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if state.status == EncoderStatus::Active {
            self.inner.cancel.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Return to `Inactive` with source and destination cleared. Fails while
    /// a run is active.
    pub fn reset(&self) -> Result<()> {
        let supervisor = {
            let mut state = self.inner.state.lock();
            if state.status == EncoderStatus::Active {
                return Err(EncoderError::Active("reset").into());
            }
            state.supervisor.take()
        };
        if let Some(handle) = supervisor {
            let _ = handle.join();
        }

        let mut state = self.inner.state.lock();
        state.status = EncoderStatus::Inactive;
        state.src = EncoderSource::None;
        state.dst_path = None;
        state.error_msg.clear();
        self.inner.cancel.store(false, Ordering::Relaxed);
        self.inner.completed.store(0, Ordering::Relaxed);
        self.inner.total.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of the encoder's status and completion fraction.
    pub fn progress(&self) -> EncoderProgress {
        let state = self.inner.state.lock();
        let total = self.inner.total.load(Ordering::Relaxed);
        let completed = self.inner.completed.load(Ordering::Relaxed);
        let progress = if total == 0 {
            0.0
        } else {
            (completed as f32 / total as f32).min(1.0)
        };
        EncoderProgress {
            status: state.status,
            progress,
            dst_path: state.dst_path.clone(),
            error_msg: state.error_msg.clone(),
        }
    }

    fn lock_inactive(
        &self,
        operation: &'static str,
    ) -> Result<parking_lot::MutexGuard<'_, EncoderState>> {
        let state = self.inner.state.lock();
        if state.status != EncoderStatus::Inactive {
            return Err(EncoderError::Active(operation).into());
        }
        Ok(state)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.progress();
        f.debug_struct("Encoder")
            .field("status", &progress.status)
            .field("progress", &progress.progress)
            .field("dst_path", &progress.dst_path)
            .finish()
    }
}

fn check_destination(path: &Path) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        if !parent.is_dir() {
            return Err(crate::error::IrisError::Failure(format!(
                "destination directory {} does not exist",
                parent.display()
            )));
        }
    }
    Ok(())
}

fn remove_partial(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %error, "failed to remove partial output");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
