// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII owners over a three-level API seam (loader, instance,
// device). `vulkan` implements the seam with ash; the unit tests run the
// same code against `mock`.
//
// Ownership: DeviceContext outlives every ShaderModule, GpuBuffer and
// RenderPipeline made from it; the borrow checker enforces this.

pub mod api;
pub mod buffer;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

#[cfg(test)]
pub(crate) mod mock;

pub use api::{DeviceOf, GpuDevice, GpuInstance, GpuLoader};
pub use buffer::{GpuBuffer, Vertex, VertexLayout};
pub use device::{DeviceContext, DeviceOptions, QueueFamilies};
pub use error::{GpuError, GpuResult};
pub use frame::{FrameInfo, FrameRecorder, FrameState};
pub use pipeline::{PipelineDesc, RenderPipeline};
pub use shader::{decode_embedded, encode_embedded, ShaderModule};
pub use surface::SurfaceProvider;
pub use vulkan::{VulkanDevice, VulkanLoader};
