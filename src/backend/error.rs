//! Failure kinds for the rendering backend
//!
//! Every construction and per-frame step returns a [`GpuResult`]. Nothing in
//! the backend terminates the process; the binary decides that.

use ash::prelude::VkResult;
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(String),

    #[error("Validation layer {0} requested but not available")]
    ValidationLayerMissing(String),

    #[error("The window has no native surface to render to")]
    WindowUnavailable,

    #[error("None of the {0} physical devices can draw and present to this surface")]
    NoSuitableDevice(usize),

    #[error("Surface reports no supported formats")]
    NoSurfaceFormat,

    #[error("No depth format usable as an optimal-tiling attachment")]
    NoDepthFormat,

    #[error("No memory type with {0:?} in type mask {1:#b}")]
    NoMemoryType(vk::MemoryPropertyFlags, u32),

    #[error("Failed to read shader {path:?}: {source}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid SPIR-V bytecode: {0}")]
    InvalidBytecode(#[source] std::io::Error),

    #[error("A vertex buffer needs room for at least one vertex")]
    EmptyBuffer,

    #[error("{len} vertices exceed the buffer capacity of {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },

    #[error("Push constant block of {len} bytes exceeds the {max}-byte range")]
    PushConstantOverflow { len: usize, max: u32 },

    #[error("Failed to {op}: {result}")]
    Vulkan {
        op: &'static str,
        #[source]
        result: vk::Result,
    },
}

/// Convenience type alias for Results with [`GpuError`]
pub type GpuResult<T> = std::result::Result<T, GpuError>;

/// Attach the failing operation to a raw Vulkan result.
pub trait VkResultExt<T> {
    fn during(self, op: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn during(self, op: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::Vulkan { op, result })
    }
}
