// Vulkan backend - ash implementation of the API seam
//
// Responsibilities:
// - Loading the Vulkan library and creating the instance
// - Debug messenger for validation layers
// - Forwarding every device-level call to ash

use super::api::{GpuDevice, GpuInstance, GpuLoader, InstanceDesc};
use super::error::{GpuError, GpuResult};
use ash::extensions::{ext::DebugUtils, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};

/// Loaded Vulkan library
pub struct VulkanLoader {
    entry: Entry,
}

impl VulkanLoader {
    pub fn new() -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::Loading(format!("{}. Is Vulkan installed?", e)))?;
        Ok(Self { entry })
    }
}

impl GpuLoader for VulkanLoader {
    type Instance = VulkanInstance;

    fn instance_layers(&self) -> VkResult<Vec<CString>> {
        let layers = self.entry.enumerate_instance_layer_properties()?;
        Ok(layers
            .iter()
            .map(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_owned())
            .collect())
    }

    fn create_instance(&self, desc: &InstanceDesc<'_>) -> VkResult<VulkanInstance> {
        let engine_name = c"Still Water";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(desc.app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let extensions: Vec<_> = desc.extensions.iter().map(|e| e.as_ptr()).collect();
        let layers: Vec<_> = desc.layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { self.entry.create_instance(&create_info, None) }?;

        Ok(VulkanInstance {
            surface_loader: khr::Surface::new(&self.entry, &instance),
            debug_utils: DebugUtils::new(&self.entry, &instance),
            entry: self.entry.clone(),
            instance,
        })
    }
}

/// Vulkan instance with its extension loaders
pub struct VulkanInstance {
    entry: Entry,
    instance: ash::Instance,
    surface_loader: khr::Surface,
    debug_utils: DebugUtils,
}

impl GpuInstance for VulkanInstance {
    type Device = VulkanDevice;

    fn handle(&self) -> vk::Instance {
        self.instance.handle()
    }

    fn create_debug_messenger(&self) -> VkResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { self.debug_utils.create_debug_utils_messenger(&create_info, None) }
    }

    fn destroy_debug_messenger(&self, messenger: vk::DebugUtilsMessengerEXT) {
        unsafe { self.debug_utils.destroy_debug_utils_messenger(messenger, None) }
    }

    fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> VkResult<vk::SurfaceKHR> {
        unsafe { ash_window::create_surface(&self.entry, &self.instance, display, window, None) }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) }
    }

    fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.enumerate_physical_devices() }
    }

    fn physical_device_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
        unsafe { self.instance.get_physical_device_properties(pd) }
    }

    fn queue_family_properties(&self, pd: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe { self.instance.get_physical_device_queue_family_properties(pd) }
    }

    fn device_extensions(&self, pd: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
        let extensions = unsafe { self.instance.enumerate_device_extension_properties(pd) }?;
        Ok(extensions
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
            .collect())
    }

    fn memory_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties {
        unsafe { self.instance.get_physical_device_memory_properties(pd) }
    }

    fn format_properties(&self, pd: vk::PhysicalDevice, format: vk::Format) -> vk::FormatProperties {
        unsafe { self.instance.get_physical_device_format_properties(pd, format) }
    }

    fn surface_support(
        &self,
        pd: vk::PhysicalDevice,
        queue_family: u32,
        surface: vk::SurfaceKHR,
    ) -> VkResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(pd, queue_family, surface)
        }
    }

    fn surface_capabilities(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(pd, surface)
        }
    }

    fn surface_formats(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe { self.surface_loader.get_physical_device_surface_formats(pd, surface) }
    }

    fn surface_present_modes(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(pd, surface)
        }
    }

    fn create_device(
        &self,
        pd: vk::PhysicalDevice,
        info: &vk::DeviceCreateInfo,
    ) -> VkResult<VulkanDevice> {
        let device = unsafe { self.instance.create_device(pd, info, None) }?;
        Ok(VulkanDevice {
            swapchain_loader: khr::Swapchain::new(&self.instance, &device),
            device,
        })
    }

    fn destroy_instance(&self) {
        unsafe { self.instance.destroy_instance(None) }
    }
}

/// Logical device with the swapchain extension loaded
pub struct VulkanDevice {
    device: ash::Device,
    swapchain_loader: khr::Swapchain,
}

impl GpuDevice for VulkanDevice {
    fn handle(&self) -> vk::Device {
        self.device.handle()
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn destroy_device(&self) {
        unsafe { self.device.destroy_device(None) }
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        unsafe { self.swapchain_loader.create_swapchain(info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, signal, vk::Fence::null())
        }
    }

    fn queue_present(&self, queue: vk::Queue, info: &vk::PresentInfoKHR) -> VkResult<bool> {
        unsafe { self.swapchain_loader.queue_present(queue, info) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        unsafe { self.device.allocate_memory(info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }?;
        Ok(ptr.cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        unsafe { self.device.create_render_pass(info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> VkResult<vk::PipelineLayout> {
        unsafe { self.device.create_pipeline_layout(info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|(_, e)| e)?;

        pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        unsafe { self.device.create_framebuffer(info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo) -> VkResult<vk::CommandPool> {
        unsafe { self.device.create_command_pool(info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe { self.device.begin_command_buffer(buffer, &begin_info) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        unsafe {
            self.device
                .cmd_begin_render_pass(buffer, info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(buffer) }
    }

    fn cmd_bind_pipeline(&self, buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(buffer, 0, &[viewport]) }
    }

    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(buffer, 0, &[scissor]) }
    }

    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(buffer, layout, stages, offset, bytes)
        }
    }

    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(buffer, binding, &[vertex_buffer], &[offset])
        }
    }

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&semaphore_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&fence_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn queue_submit(&self, queue: vk::Queue, info: &vk::SubmitInfo, fence: vk::Fence) -> VkResult<()> {
        unsafe {
            self.device
                .queue_submit(queue, std::slice::from_ref(info), fence)
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
