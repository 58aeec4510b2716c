// Synchronization primitives
//
// One frame in flight: a fence for GPU-CPU and two semaphores for GPU-GPU
// ordering between acquire, render and present.

use super::api::GpuDevice;
use super::error::{GpuResult, VkResultExt};
use ash::vk;

#[derive(Default)]
pub struct FrameSync {
    /// Signalled by acquire, waited on by the submit
    pub image_available: vk::Semaphore,
    /// Signalled by the submit, waited on by present
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new<D: GpuDevice>(device: &D) -> GpuResult<Self> {
        let image_available = device
            .create_semaphore()
            .during("create the image-available semaphore")?;

        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(result) => {
                device.destroy_semaphore(image_available);
                return Err(result).during("create the render-finished semaphore");
            }
        };

        // Start signaled so the first frame does not wait forever
        let in_flight_fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(result) => {
                device.destroy_semaphore(render_finished);
                device.destroy_semaphore(image_available);
                return Err(result).during("create the in-flight fence");
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_fence(self.in_flight_fence);
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
    }
}
