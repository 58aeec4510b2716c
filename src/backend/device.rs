// Device context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface
// - Physical device + queue family selection (first match)
// - Logical device + queue creation
// - Presentation chain, depth target and command pool
//
// Teardown is the exact reverse of creation. Instance-level objects and the
// logical device are owned by RAII scopes whose fields drop after the
// explicit device-level teardown in `Drop for DeviceContext`.

use super::api::{DeviceOf, GpuDevice, GpuInstance, GpuLoader, InstanceDesc};
use super::buffer::find_memory_type;
use super::error::{GpuError, GpuResult, VkResultExt};
use super::surface::SurfaceProvider;
use super::swapchain::{choose_depth_format, ChainRequest, DepthTarget, PresentationChain};
use ash::extensions::{ext::DebugUtils, khr};
use ash::vk;
use std::ffi::{CStr, CString};
use std::ops::Deref;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Knobs for building a device context
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    /// Enable the Khronos validation layer; construction fails if it is missing
    pub enable_validation: bool,
    /// Used when the surface offers it, FIFO otherwise
    pub preferred_present_mode: vk::PresentModeKHR,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            app_name: "Still Water".to_string(),
            enable_validation: false,
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

/// Queue families used for drawing and presenting. May be the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// The physical device picked for rendering
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilies,
    pub name: String,
}

/// Instance, debug messenger and surface; destroyed in reverse on drop.
struct InstanceScope<I: GpuInstance> {
    instance: I,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface: vk::SurfaceKHR,
}

impl<I: GpuInstance> InstanceScope<I> {
    fn new<L, W>(loader: &L, window: &W, options: &DeviceOptions) -> GpuResult<Self>
    where
        L: GpuLoader<Instance = I>,
        W: SurfaceProvider + ?Sized,
    {
        let mut extensions = window.required_extensions()?;
        let mut layers = Vec::new();

        if options.enable_validation {
            let available = loader
                .instance_layers()
                .during("enumerate instance layers")?;
            if !available.iter().any(|layer| layer.as_c_str() == VALIDATION_LAYER) {
                return Err(GpuError::ValidationLayerMissing(
                    VALIDATION_LAYER.to_string_lossy().into_owned(),
                ));
            }
            layers.push(VALIDATION_LAYER.to_owned());
            extensions.push(DebugUtils::name().to_owned());
        }

        let app_name = CString::new(options.app_name.as_str())
            .unwrap_or_else(|_| c"Still Water".to_owned());

        log::debug!("Instance extensions: {:?}", extensions);
        let instance = loader
            .create_instance(&InstanceDesc {
                app_name: &app_name,
                extensions: &extensions,
                layers: &layers,
            })
            .during("create the Vulkan instance")?;

        let mut scope = Self {
            instance,
            debug_messenger: None,
            surface: vk::SurfaceKHR::null(),
        };

        if options.enable_validation {
            scope.debug_messenger = Some(
                scope
                    .instance
                    .create_debug_messenger()
                    .during("create the debug messenger")?,
            );
        }

        let display = window.display_handle()?;
        let native_window = window.window_handle()?;
        scope.surface = scope
            .instance
            .create_surface(display, native_window)
            .during("create the window surface")?;

        Ok(scope)
    }
}

impl<I: GpuInstance> Drop for InstanceScope<I> {
    fn drop(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            self.instance.destroy_surface(self.surface);
        }
        if let Some(messenger) = self.debug_messenger.take() {
            self.instance.destroy_debug_messenger(messenger);
        }
        self.instance.destroy_instance();
    }
}

/// Logical device, destroyed on drop
struct LogicalDevice<D: GpuDevice>(D);

impl<D: GpuDevice> Deref for LogicalDevice<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.0
    }
}

impl<D: GpuDevice> Drop for LogicalDevice<D> {
    fn drop(&mut self) {
        self.0.destroy_device();
    }
}

/// Everything needed to draw into and present to one window
pub struct DeviceContext<L: GpuLoader> {
    selection: DeviceSelection,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    chain: PresentationChain,
    depth: DepthTarget,
    command_pool: vk::CommandPool,

    // Drop order matters: device, then instance scope, then the library
    device: LogicalDevice<DeviceOf<L>>,
    instance: InstanceScope<L::Instance>,
    _loader: L,
}

impl<L: GpuLoader> DeviceContext<L> {
    /// Create the device context
    ///
    /// # Arguments
    /// * `loader` - Vulkan library (or a stand-in)
    /// * `window` - Surface provider to render into
    /// * `options` - Validation and presentation preferences
    pub fn new<W>(loader: L, window: &W, options: &DeviceOptions) -> GpuResult<Self>
    where
        W: SurfaceProvider + ?Sized,
    {
        log::info!("Creating device context: {}", options.app_name);

        let instance = InstanceScope::new(&loader, window, options)?;
        let selection = select_physical_device(&instance.instance, instance.surface)?;

        log::info!("Selected GPU: {}", selection.name);
        log::info!(
            "Queue families: graphics {}, present {}",
            selection.queue_families.graphics,
            selection.queue_families.present
        );

        let device = LogicalDevice(create_logical_device(&instance.instance, &selection)?);
        let families = selection.queue_families;
        let graphics_queue = device.queue(families.graphics, 0);
        let present_queue = device.queue(families.present, 0);
        let memory_properties = instance
            .instance
            .memory_properties(selection.physical_device);

        let mut ctx = Self {
            selection,
            memory_properties,
            graphics_queue,
            present_queue,
            chain: PresentationChain::default(),
            depth: DepthTarget::default(),
            command_pool: vk::CommandPool::null(),
            device,
            instance,
            _loader: loader,
        };

        let request = ChainRequest {
            surface: ctx.instance.surface,
            physical_device: ctx.selection.physical_device,
            queue_families: families,
            drawable_size: window.drawable_size(),
            preferred_present_mode: options.preferred_present_mode,
        };
        ctx.chain = PresentationChain::new(&ctx.instance.instance, &*ctx.device, &request)?;

        let depth_format = choose_depth_format(&ctx.instance.instance, ctx.selection.physical_device)?;
        ctx.depth = DepthTarget::new(
            &*ctx.device,
            depth_format,
            ctx.chain.extent,
            &ctx.memory_properties,
        )?;
        log::debug!("Depth format: {:?}", depth_format);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(families.graphics)
            // RESET: the single command buffer is re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        ctx.command_pool = ctx
            .device
            .create_command_pool(&pool_info)
            .during("create the command pool")?;

        log::info!("Device context ready");
        Ok(ctx)
    }

    pub fn instance(&self) -> &L::Instance {
        &self.instance.instance
    }

    pub fn device(&self) -> &DeviceOf<L> {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.selection.name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.selection.physical_device
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.selection.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.instance.surface
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.chain.swapchain
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.chain.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.chain.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.chain.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.chain.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.chain.image_views
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth.format
    }

    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.view
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> GpuResult<u32> {
        find_memory_type(&self.memory_properties, type_filter, properties)
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> GpuResult<()> {
        self.device.wait_idle().during("wait for the device to go idle")
    }
}

impl<L: GpuLoader> Drop for DeviceContext<L> {
    fn drop(&mut self) {
        log::info!("Destroying device context...");

        if let Err(e) = self.wait_idle() {
            log::error!("{}", e);
        }

        // Reverse order of creation; the device, surface and instance
        // follow when their fields drop.
        if self.command_pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.command_pool);
        }
        self.depth.destroy(&*self.device);
        self.chain.destroy(&*self.device);
    }
}

/// First physical device with the swapchain extension and queues that can
/// draw and present to `surface`.
pub fn select_physical_device<I: GpuInstance>(
    instance: &I,
    surface: vk::SurfaceKHR,
) -> GpuResult<DeviceSelection> {
    let devices = instance
        .enumerate_physical_devices()
        .during("enumerate physical devices")?;

    for &physical_device in &devices {
        let name = device_name(&instance.physical_device_properties(physical_device));

        let extensions = instance
            .device_extensions(physical_device)
            .during("enumerate device extensions")?;
        if !extensions.iter().any(|e| e.as_c_str() == khr::Swapchain::name()) {
            log::debug!("Skipping {}: no swapchain support", name);
            continue;
        }

        match find_queue_families(instance, physical_device, surface)? {
            Some(queue_families) => {
                return Ok(DeviceSelection {
                    physical_device,
                    queue_families,
                    name,
                })
            }
            None => log::debug!("Skipping {}: cannot both draw and present", name),
        }
    }

    Err(GpuError::NoSuitableDevice(devices.len()))
}

/// A family doing both jobs wins; otherwise the first of each.
pub fn find_queue_families<I: GpuInstance>(
    instance: &I,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> GpuResult<Option<QueueFamilies>> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in instance
        .queue_family_properties(physical_device)
        .iter()
        .enumerate()
    {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }
        let can_draw = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = instance
            .surface_support(physical_device, index, surface)
            .during("query surface support")?;

        if can_draw && can_present {
            return Ok(Some(QueueFamilies {
                graphics: index,
                present: index,
            }));
        }
        if can_draw && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    Ok(graphics
        .zip(present)
        .map(|(graphics, present)| QueueFamilies { graphics, present }))
}

fn create_logical_device<I: GpuInstance>(
    instance: &I,
    selection: &DeviceSelection,
) -> GpuResult<I::Device> {
    let queue_priorities = [1.0];
    let queue_create_infos: Vec<_> = selection
        .queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let extensions = [khr::Swapchain::name().as_ptr()];
    let features = vk::PhysicalDeviceFeatures::default();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    instance
        .create_device(selection.physical_device, &create_info)
        .during("create the logical device")
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    let bytes: Vec<u8> = properties
        .device_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
