// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// plus the single depth image every framebuffer shares.

use super::api::{GpuDevice, GpuInstance};
use super::buffer::find_memory_type;
use super::device::QueueFamilies;
use super::error::{GpuError, GpuResult, VkResultExt};
use ash::vk;

/// Depth formats in order of preference
const DEPTH_FORMATS: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Everything the chain needs to know about the surface it presents to
pub struct ChainRequest {
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilies,
    pub drawable_size: (u32, u32),
    pub preferred_present_mode: vk::PresentModeKHR,
}

#[derive(Default)]
pub struct PresentationChain {
    pub swapchain: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Owned by the swapchain, never destroyed directly
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

impl PresentationChain {
    pub fn new<I: GpuInstance>(
        instance: &I,
        device: &I::Device,
        request: &ChainRequest,
    ) -> GpuResult<Self> {
        let pd = request.physical_device;
        let surface = request.surface;

        let caps = instance
            .surface_capabilities(pd, surface)
            .during("query surface capabilities")?;
        let formats = instance
            .surface_formats(pd, surface)
            .during("query surface formats")?;
        let present_modes = instance
            .surface_present_modes(pd, surface)
            .during("query surface present modes")?;

        let surface_format = choose_surface_format(&formats).ok_or(GpuError::NoSurfaceFormat)?;
        let present_mode = choose_present_mode(&present_modes, request.preferred_present_mode);
        let extent = choose_extent(&caps, request.drawable_size);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}/{:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        // Images are touched by both queues when presentation lives elsewhere
        let family_indices = [request.queue_families.graphics, request.queue_families.present];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let create_info = if request.queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let swapchain = device
            .create_swapchain(&create_info)
            .during("create the swapchain")?;

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(result) => {
                device.destroy_swapchain(swapchain);
                return Err(GpuError::Vulkan { op: "get swapchain images", result });
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        let image_views = match create_image_views(device, &images, surface_format.format) {
            Ok(views) => views,
            Err(e) => {
                device.destroy_swapchain(swapchain);
                return Err(e);
            }
        };

        Ok(Self {
            swapchain,
            surface_format,
            present_mode,
            extent,
            images,
            image_views,
        })
    }

    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        for &view in self.image_views.iter().rev() {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(self.swapchain);
    }
}

/// Prefer 8-bit sRGB, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// FIFO is always supported, everything else is a preference.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    modes
        .iter()
        .copied()
        .find(|&mode| mode == preferred)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable_size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let (width, height) = drawable_size;
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum so the driver never blocks us; 0 means no max.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

fn create_image_views<D: GpuDevice>(
    device: &D,
    images: &[vk::Image],
    format: vk::Format,
) -> GpuResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR));

        match device.create_image_view(&create_info) {
            Ok(view) => views.push(view),
            Err(result) => {
                for &view in views.iter().rev() {
                    device.destroy_image_view(view);
                }
                return Err(GpuError::Vulkan { op: "create a swapchain image view", result });
            }
        }
    }
    Ok(views)
}

fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Depth image, memory and view shared by every framebuffer
#[derive(Default)]
pub struct DepthTarget {
    pub format: vk::Format,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

impl DepthTarget {
    pub fn new<D: GpuDevice>(
        device: &D,
        format: vk::Format,
        extent: vk::Extent2D,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> GpuResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = device
            .create_image(&image_info)
            .during("create the depth image")?;

        let memory = match Self::allocate_and_bind(device, image, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_image(image);
                return Err(e);
            }
        };

        let aspect = if format == vk::Format::D32_SFLOAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect));

        let view = match device.create_image_view(&view_info) {
            Ok(view) => view,
            Err(result) => {
                device.destroy_image(image);
                device.free_memory(memory);
                return Err(GpuError::Vulkan { op: "create the depth image view", result });
            }
        };

        Ok(Self { format, image, memory, view })
    }

    fn allocate_and_bind<D: GpuDevice>(
        device: &D,
        image: vk::Image,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> GpuResult<vk::DeviceMemory> {
        let requirements = device.image_memory_requirements(image);
        let memory_type_index = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = device
            .allocate_memory(&alloc_info)
            .during("allocate depth image memory")?;

        if let Err(result) = device.bind_image_memory(image, memory) {
            device.free_memory(memory);
            return Err(GpuError::Vulkan { op: "bind depth image memory", result });
        }
        Ok(memory)
    }

    /// The image is bound to the memory, so it goes before the allocation.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_image_view(self.view);
        device.destroy_image(self.image);
        device.free_memory(self.memory);
    }
}

/// First preferred depth format usable as an optimal-tiling attachment.
pub fn choose_depth_format<I: GpuInstance>(
    instance: &I,
    physical_device: vk::PhysicalDevice,
) -> GpuResult<vk::Format> {
    DEPTH_FORMATS
        .iter()
        .copied()
        .find(|&format| {
            instance
                .format_properties(physical_device, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(GpuError::NoDepthFormat)
}
