//! Compression context: selects where codec work is performed.
//!
//! The context is a capability record shared by clone. It holds no file
//! state; it only tags whether a GPU device is available for codecs that
//! carry a hardware path. The built-in backends are CPU-only, so a device
//! currently records intent for backends installed via
//! [`crate::codec::register_codec`].

use std::sync::Arc;

/// Opaque handle to a GPU device capable of hardware decode.
///
/// Constructed by the rendering integration that owns the device; the codec
/// engine treats it as an identity token.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    name: Arc<str>,
}

impl GpuDevice {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        GpuDevice { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Codec-path selection record.
#[derive(Debug, Clone, Default)]
pub struct Context {
    device: Option<GpuDevice>,
}

impl Context {
    /// A CPU-only context.
    pub fn new() -> Self {
        Context { device: None }
    }

    /// A context that routes capable codecs through `device`.
    pub fn with_device(device: GpuDevice) -> Self {
        Context {
            device: Some(device),
        }
    }

    /// The attached device, if any.
    pub fn device(&self) -> Option<&GpuDevice> {
        self.device.as_ref()
    }

    /// Whether codec work may route through a GPU.
    pub fn gpu_capable(&self) -> bool {
        self.device.is_some()
    }
}
