// Graphics API seam
//
// Three traits mirror Vulkan's dispatch levels (loader -> instance -> device).
// Handles are plain `vk::*` values; the implementation owns the dispatch
// tables. `vulkan.rs` forwards to ash, the test backend simulates a driver.
//
// Every handle passed in must have been produced by the same instance/device.

use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};

/// Device type reachable from a loader.
pub type DeviceOf<L> = <<L as GpuLoader>::Instance as GpuInstance>::Device;

/// What an instance is created with.
pub struct InstanceDesc<'a> {
    pub app_name: &'a CStr,
    pub extensions: &'a [CString],
    pub layers: &'a [CString],
}

pub trait GpuLoader {
    type Instance: GpuInstance;

    /// Names of the instance layers installed on this machine.
    fn instance_layers(&self) -> VkResult<Vec<CString>>;

    fn create_instance(&self, desc: &InstanceDesc<'_>) -> VkResult<Self::Instance>;
}

pub trait GpuInstance {
    type Device: GpuDevice;

    fn handle(&self) -> vk::Instance;

    /// Route validation output to the `log` facade.
    fn create_debug_messenger(&self) -> VkResult<vk::DebugUtilsMessengerEXT>;
    fn destroy_debug_messenger(&self, messenger: vk::DebugUtilsMessengerEXT);

    fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> VkResult<vk::SurfaceKHR>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>>;
    fn physical_device_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties;
    fn queue_family_properties(&self, pd: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;
    fn device_extensions(&self, pd: vk::PhysicalDevice) -> VkResult<Vec<CString>>;
    fn memory_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties;
    fn format_properties(&self, pd: vk::PhysicalDevice, format: vk::Format) -> vk::FormatProperties;

    fn surface_support(
        &self,
        pd: vk::PhysicalDevice,
        queue_family: u32,
        surface: vk::SurfaceKHR,
    ) -> VkResult<bool>;
    fn surface_capabilities(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>>;

    fn create_device(
        &self,
        pd: vk::PhysicalDevice,
        info: &vk::DeviceCreateInfo,
    ) -> VkResult<Self::Device>;

    /// Destroys the instance itself. Everything created from it must be gone.
    fn destroy_instance(&self);
}

pub trait GpuDevice {
    fn handle(&self) -> vk::Device;
    fn queue(&self, family: u32, index: u32) -> vk::Queue;
    fn wait_idle(&self) -> VkResult<()>;
    /// Destroys the device itself. Everything created from it must be gone.
    fn destroy_device(&self);

    // Presentation chain
    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    fn queue_present(&self, queue: vk::Queue, info: &vk::PresentInfoKHR) -> VkResult<bool>;

    // Images and memory
    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Maps `size` bytes starting at `offset` into host address space.
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    // Pipeline objects
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Commands
    fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo);
    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, buffer: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: &[u8],
    );
    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );
    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    // Synchronization
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn queue_submit(&self, queue: vk::Queue, info: &vk::SubmitInfo, fence: vk::Fence) -> VkResult<()>;
}
