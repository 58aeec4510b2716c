// Mock driver - in-process stand-in for Vulkan used by the unit tests
//
// Handles come from a generation counter and are never reused. Every live
// object remembers the objects it depends on; destroying something while a
// dependent is still alive, waiting on a fence nothing will signal or
// submitting with a fence that is still in use is recorded as a violation
// instead of crashing. Tests read the shared `Journal` for events,
// violations and device memory contents.

use super::api::{GpuDevice, GpuInstance, GpuLoader, InstanceDesc};
use super::device::{DeviceContext, DeviceOptions};
use super::error::GpuResult;
use super::shader::ShaderModule;
use super::surface::SurfaceProvider;
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle, XlibDisplayHandle, XlibWindowHandle};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::sync::Arc;

pub type SharedJournal = Arc<Mutex<Journal>>;

const PHYSICAL_DEVICE_BASE: u64 = 0xF000_0000;
const QUEUE_BASE: u64 = 0xE000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Instance,
    DebugMessenger,
    Surface,
    Device,
    Swapchain,
    Image,
    ImageView,
    Memory,
    Buffer,
    ShaderModule,
    RenderPass,
    PipelineLayout,
    Pipeline,
    Framebuffer,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Fence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Created(Kind, u64),
    Destroyed(Kind, u64),
    SurfaceQuery,
    WaitIdle,
    WaitFence,
    ResetFence,
    Acquire(u32),
    ResetCommandBuffer,
    BeginCommandBuffer,
    EndCommandBuffer,
    BeginRenderPass {
        framebuffer: u64,
        clear_color: [f32; 4],
        clear_depth: f32,
    },
    EndRenderPass,
    BindPipeline(u64),
    SetViewport(f32, f32),
    SetScissor(u32, u32),
    PushConstants(Vec<u8>),
    BindVertexBuffer(u64),
    Draw(u32),
    Submit,
    Present(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    /// Submitted, not yet waited on
    Pending,
}

/// Swapchain parameters as the driver saw them
#[derive(Debug, Clone)]
pub struct SwapchainRecord {
    pub min_image_count: u32,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
}

/// Graphics pipeline parameters as the driver saw them
#[derive(Debug, Clone)]
pub struct PipelineRecord {
    pub stages: Vec<vk::ShaderStageFlags>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub cull_mode: vk::CullModeFlags,
    pub depth_compare_op: vk::CompareOp,
}

#[derive(Debug, Clone)]
pub struct MockPhysicalDevice {
    /// Queue flags and whether the family can present to the surface
    pub families: Vec<(vk::QueueFlags, bool)>,
    pub extensions: Vec<CString>,
}

impl MockPhysicalDevice {
    pub fn with_families(families: Vec<(vk::QueueFlags, bool)>) -> Self {
        Self {
            families,
            ..Self::default()
        }
    }
}

impl Default for MockPhysicalDevice {
    fn default() -> Self {
        Self {
            families: vec![(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true)],
            extensions: vec![khr::Swapchain::name().to_owned()],
        }
    }
}

/// What the simulated machine offers
#[derive(Debug, Clone)]
pub struct MockGpu {
    pub instance_layers: Vec<CString>,
    pub physical_devices: Vec<MockPhysicalDevice>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Operations that always fail
    pub failing: Vec<&'static str>,
    /// Operations that fail once they have succeeded `n` times
    pub failing_after: Vec<(&'static str, usize)>,
    /// Operations that fail only on their `n`th call, counting from zero
    pub failing_once: Vec<(&'static str, usize)>,
    /// Acquire and present report a suboptimal swapchain
    pub suboptimal: bool,
}

impl Default for MockGpu {
    fn default() -> Self {
        Self {
            instance_layers: Vec::new(),
            physical_devices: vec![MockPhysicalDevice::default()],
            surface_formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                max_image_array_layers: 1,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            failing: Vec::new(),
            failing_after: Vec::new(),
            failing_once: Vec::new(),
            suboptimal: false,
        }
    }
}

struct Live {
    kind: Kind,
    deps: Vec<u64>,
}

#[derive(Default)]
struct Swapchain {
    images: Vec<u64>,
    next_image: u32,
}

/// Everything the mock driver observed
pub struct Journal {
    gpu: MockGpu,
    next_id: u64,
    events: Vec<Event>,
    violations: Vec<String>,
    live: HashMap<u64, Live>,
    calls: HashMap<&'static str, usize>,
    fences: HashMap<u64, FenceState>,
    /// (fence, command buffer) pairs submitted and not yet waited on
    in_flight: Vec<(u64, u64)>,
    /// Binary semaphores with a signal nobody has waited on yet
    signaled: HashSet<u64>,
    memory: HashMap<u64, Vec<u8>>,
    mapped: HashMap<u64, bool>,
    map_sizes: HashMap<u64, Vec<u64>>,
    buffer_sizes: HashMap<u64, u64>,
    image_sizes: HashMap<u64, u64>,
    swapchains: HashMap<u64, Swapchain>,
    shader_code: HashMap<u64, Vec<u32>>,
    push_constant_sizes: HashMap<u64, Vec<u32>>,
    render_pass_formats: HashMap<u64, Vec<vk::Format>>,
    last_swapchain: Option<SwapchainRecord>,
    last_pipeline: Option<PipelineRecord>,
    device_queue_families: Vec<u32>,
    instance_extensions: Vec<CString>,
    instance_layers: Vec<CString>,
}

impl Journal {
    fn new(gpu: MockGpu) -> Self {
        Self {
            gpu,
            next_id: 1,
            events: Vec::new(),
            violations: Vec::new(),
            live: HashMap::new(),
            calls: HashMap::new(),
            fences: HashMap::new(),
            in_flight: Vec::new(),
            signaled: HashSet::new(),
            memory: HashMap::new(),
            mapped: HashMap::new(),
            map_sizes: HashMap::new(),
            buffer_sizes: HashMap::new(),
            image_sizes: HashMap::new(),
            swapchains: HashMap::new(),
            shader_code: HashMap::new(),
            push_constant_sizes: HashMap::new(),
            render_pass_formats: HashMap::new(),
            last_swapchain: None,
            last_pipeline: None,
            device_queue_families: Vec::new(),
            instance_extensions: Vec::new(),
            instance_layers: Vec::new(),
        }
    }

    // ── Inspection ──────────────────────────────────────────────────────

    pub fn events(&self) -> Vec<Event> {
        self.events.clone()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.clone()
    }

    pub fn created(&self) -> Vec<(Kind, u64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Created(kind, id) => Some((*kind, *id)),
                _ => None,
            })
            .collect()
    }

    pub fn destroyed(&self) -> Vec<(Kind, u64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Destroyed(kind, id) => Some((*kind, *id)),
                _ => None,
            })
            .collect()
    }

    /// Objects alive right now, swapchain-owned images excluded
    pub fn live_count(&self) -> usize {
        let owned: usize = self.swapchains.values().map(|s| s.images.len()).sum();
        self.live.len() - owned
    }

    pub fn last_swapchain(&self) -> Option<SwapchainRecord> {
        self.last_swapchain.clone()
    }

    pub fn last_pipeline(&self) -> Option<PipelineRecord> {
        self.last_pipeline.clone()
    }

    pub fn device_queue_families(&self) -> Vec<u32> {
        self.device_queue_families.clone()
    }

    pub fn instance_extensions(&self) -> Vec<CString> {
        self.instance_extensions.clone()
    }

    pub fn instance_layers(&self) -> Vec<CString> {
        self.instance_layers.clone()
    }

    pub fn shader_code(&self, module: vk::ShaderModule) -> Vec<u32> {
        self.shader_code.get(&raw(module)).cloned().unwrap_or_default()
    }

    pub fn push_constant_sizes(&self, layout: vk::PipelineLayout) -> Vec<u32> {
        self.push_constant_sizes
            .get(&raw(layout))
            .cloned()
            .unwrap_or_default()
    }

    pub fn render_pass_formats(&self, render_pass: vk::RenderPass) -> Vec<vk::Format> {
        self.render_pass_formats
            .get(&raw(render_pass))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.fences.get(&raw(fence)) == Some(&FenceState::Signaled)
    }

    pub fn semaphore_is_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.signaled.contains(&raw(semaphore))
    }

    pub fn fill_memory(&mut self, memory: vk::DeviceMemory, byte: u8) {
        if let Some(bytes) = self.memory.get_mut(&raw(memory)) {
            bytes.fill(byte);
        }
    }

    pub fn memory_bytes(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.memory.get(&raw(memory)).cloned().unwrap_or_default()
    }

    /// Size of every mapping of `memory`, in order
    pub fn mapped_sizes(&self, memory: vk::DeviceMemory) -> Vec<u64> {
        self.map_sizes.get(&raw(memory)).cloned().unwrap_or_default()
    }

    // ── Bookkeeping ─────────────────────────────────────────────────────

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    /// Count a call to `op` and decide whether it fails.
    fn call(&mut self, op: &'static str) -> VkResult<()> {
        let count = self.calls.entry(op).or_insert(0);
        let previous = *count;
        *count += 1;

        let fails = self.gpu.failing.contains(&op)
            || self
                .gpu
                .failing_after
                .iter()
                .any(|&(name, n)| name == op && previous >= n)
            || self
                .gpu
                .failing_once
                .iter()
                .any(|&(name, n)| name == op && previous == n);
        if fails {
            Err(vk::Result::ERROR_INITIALIZATION_FAILED)
        } else {
            Ok(())
        }
    }

    fn create(&mut self, kind: Kind, deps: Vec<u64>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        for &dep in &deps {
            if !self.live.contains_key(&dep) {
                self.violation(format!("{:?} {} created from dead object {}", kind, id, dep));
            }
        }
        self.live.insert(id, Live { kind, deps });
        self.events.push(Event::Created(kind, id));
        id
    }

    fn destroy(&mut self, kind: Kind, id: u64) {
        // Destroying a null handle is a no-op
        if id == 0 {
            return;
        }
        match self.live.get(&id).map(|live| live.kind) {
            None => {
                self.violation(format!("{:?} {} destroyed twice or never created", kind, id));
                return;
            }
            Some(actual) if actual != kind => {
                self.violation(format!("{} is a {:?}, not a {:?}", id, actual, kind));
                return;
            }
            Some(_) => {}
        }

        let dependents: Vec<String> = self
            .live
            .iter()
            .filter(|(_, live)| live.deps.contains(&id))
            .map(|(other, live)| format!("{:?} {}", live.kind, other))
            .collect();
        for dependent in dependents {
            self.violation(format!("{:?} {} destroyed while {} uses it", kind, id, dependent));
        }

        self.live.remove(&id);
        self.events.push(Event::Destroyed(kind, id));
    }

    fn depend(&mut self, id: u64, on: u64) {
        if let Some(live) = self.live.get_mut(&id) {
            live.deps.push(on);
        }
    }

    fn command_buffer_in_flight(&self, command_buffer: u64) -> bool {
        self.in_flight.iter().any(|&(_, cb)| cb == command_buffer)
    }

    fn retire(&mut self, fence: u64) {
        self.in_flight.retain(|&(f, _)| f != fence);
        self.fences.insert(fence, FenceState::Signaled);
    }

    fn signal(&mut self, semaphore: u64) {
        if !self.signaled.insert(semaphore) {
            self.violation(format!("Semaphore {} signalled twice without a wait", semaphore));
        }
    }

    fn consume(&mut self, semaphore: u64) {
        if !self.signaled.remove(&semaphore) {
            self.violation(format!("Waited on semaphore {} that nothing signalled", semaphore));
        }
    }
}

/// Raw value of any handle
pub fn raw<H: Handle>(handle: H) -> u64 {
    handle.as_raw()
}

fn handle<H: Handle>(id: u64) -> H {
    H::from_raw(id)
}

/// View a driver-facing array; null or empty reads as empty.
///
/// # Safety
/// `ptr` must point to `len` valid elements when non-null.
unsafe fn slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

// ── Loader ──────────────────────────────────────────────────────────────

pub struct MockLoader {
    journal: SharedJournal,
}

impl MockLoader {
    pub fn new(gpu: MockGpu) -> Self {
        Self {
            journal: Arc::new(Mutex::new(Journal::new(gpu))),
        }
    }

    pub fn journal(&self) -> SharedJournal {
        Arc::clone(&self.journal)
    }
}

impl GpuLoader for MockLoader {
    type Instance = MockInstance;

    fn instance_layers(&self) -> VkResult<Vec<CString>> {
        Ok(self.journal.lock().gpu.instance_layers.clone())
    }

    fn create_instance(&self, desc: &InstanceDesc<'_>) -> VkResult<MockInstance> {
        let mut journal = self.journal.lock();
        journal.call("create_instance")?;
        if desc
            .layers
            .iter()
            .any(|layer| !journal.gpu.instance_layers.contains(layer))
        {
            return Err(vk::Result::ERROR_LAYER_NOT_PRESENT);
        }
        journal.instance_extensions = desc.extensions.to_vec();
        journal.instance_layers = desc.layers.to_vec();
        let id = journal.create(Kind::Instance, Vec::new());
        Ok(MockInstance {
            journal: Arc::clone(&self.journal),
            id,
        })
    }
}

// ── Instance ────────────────────────────────────────────────────────────

pub struct MockInstance {
    journal: SharedJournal,
    id: u64,
}

impl MockInstance {
    fn physical_device(&self, pd: vk::PhysicalDevice) -> Option<MockPhysicalDevice> {
        let index = raw(pd).checked_sub(PHYSICAL_DEVICE_BASE)? as usize;
        self.journal.lock().gpu.physical_devices.get(index).cloned()
    }
}

impl GpuInstance for MockInstance {
    type Device = MockDevice;

    fn handle(&self) -> vk::Instance {
        handle(self.id)
    }

    fn create_debug_messenger(&self) -> VkResult<vk::DebugUtilsMessengerEXT> {
        let mut journal = self.journal.lock();
        journal.call("create_debug_messenger")?;
        Ok(handle(journal.create(Kind::DebugMessenger, vec![self.id])))
    }

    fn destroy_debug_messenger(&self, messenger: vk::DebugUtilsMessengerEXT) {
        self.journal.lock().destroy(Kind::DebugMessenger, raw(messenger));
    }

    fn create_surface(
        &self,
        _display: RawDisplayHandle,
        _window: RawWindowHandle,
    ) -> VkResult<vk::SurfaceKHR> {
        let mut journal = self.journal.lock();
        journal.call("create_surface")?;
        Ok(handle(journal.create(Kind::Surface, vec![self.id])))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.journal.lock().destroy(Kind::Surface, raw(surface));
    }

    fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        let count = self.journal.lock().gpu.physical_devices.len() as u64;
        Ok((0..count).map(|i| handle(PHYSICAL_DEVICE_BASE + i)).collect())
    }

    fn physical_device_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
        let mut properties = vk::PhysicalDeviceProperties::default();
        let name = format!("Mock GPU {}", raw(pd) - PHYSICAL_DEVICE_BASE);
        for (dst, src) in properties.device_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::ffi::c_char;
        }
        properties
    }

    fn queue_family_properties(&self, pd: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        self.physical_device(pd)
            .map(|device| {
                device
                    .families
                    .iter()
                    .map(|&(queue_flags, _)| vk::QueueFamilyProperties {
                        queue_flags,
                        queue_count: 1,
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn device_extensions(&self, pd: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
        Ok(self
            .physical_device(pd)
            .map(|device| device.extensions)
            .unwrap_or_default())
    }

    fn memory_properties(&self, _pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 1,
            memory_heap_count: 1,
            ..Default::default()
        };
        properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        properties
    }

    fn format_properties(&self, _pd: vk::PhysicalDevice, _format: vk::Format) -> vk::FormatProperties {
        vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::FormatFeatureFlags::COLOR_ATTACHMENT,
            ..Default::default()
        }
    }

    fn surface_support(
        &self,
        pd: vk::PhysicalDevice,
        queue_family: u32,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<bool> {
        Ok(self
            .physical_device(pd)
            .and_then(|device| device.families.get(queue_family as usize).map(|f| f.1))
            .unwrap_or(false))
    }

    fn surface_capabilities(
        &self,
        _pd: vk::PhysicalDevice,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let mut journal = self.journal.lock();
        journal.events.push(Event::SurfaceQuery);
        Ok(journal.gpu.capabilities)
    }

    fn surface_formats(
        &self,
        _pd: vk::PhysicalDevice,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        let mut journal = self.journal.lock();
        journal.events.push(Event::SurfaceQuery);
        Ok(journal.gpu.surface_formats.clone())
    }

    fn surface_present_modes(
        &self,
        _pd: vk::PhysicalDevice,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        let mut journal = self.journal.lock();
        journal.events.push(Event::SurfaceQuery);
        Ok(journal.gpu.present_modes.clone())
    }

    fn create_device(
        &self,
        _pd: vk::PhysicalDevice,
        info: &vk::DeviceCreateInfo,
    ) -> VkResult<MockDevice> {
        let mut journal = self.journal.lock();
        journal.call("create_device")?;
        // SAFETY: the create info's arrays outlive this call
        let queues = unsafe { slice(info.p_queue_create_infos, info.queue_create_info_count) };
        journal.device_queue_families = queues.iter().map(|q| q.queue_family_index).collect();
        let id = journal.create(Kind::Device, vec![self.id]);
        Ok(MockDevice {
            journal: Arc::clone(&self.journal),
            id,
        })
    }

    fn destroy_instance(&self) {
        self.journal.lock().destroy(Kind::Instance, self.id);
    }
}

// ── Device ──────────────────────────────────────────────────────────────

pub struct MockDevice {
    journal: SharedJournal,
    id: u64,
}

impl MockDevice {
    fn create(&self, op: &'static str, kind: Kind, mut deps: Vec<u64>) -> VkResult<u64> {
        let mut journal = self.journal.lock();
        journal.call(op)?;
        deps.push(self.id);
        Ok(journal.create(kind, deps))
    }

    fn destroy(&self, kind: Kind, id: u64) {
        self.journal.lock().destroy(kind, id);
    }

    fn record(&self, event: Event) {
        self.journal.lock().events.push(event);
    }
}

impl GpuDevice for MockDevice {
    fn handle(&self) -> vk::Device {
        handle(self.id)
    }

    fn queue(&self, family: u32, _index: u32) -> vk::Queue {
        handle(QUEUE_BASE + family as u64)
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut journal = self.journal.lock();
        journal.events.push(Event::WaitIdle);
        for state in journal.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
        journal.in_flight.clear();
        Ok(())
    }

    fn destroy_device(&self) {
        self.destroy(Kind::Device, self.id);
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        let id = self.create("create_swapchain", Kind::Swapchain, vec![raw(info.surface)])?;
        let mut journal = self.journal.lock();

        // SAFETY: the create info's arrays outlive this call
        let families = unsafe { slice(info.p_queue_family_indices, info.queue_family_index_count) };
        journal.last_swapchain = Some(SwapchainRecord {
            min_image_count: info.min_image_count,
            sharing_mode: info.image_sharing_mode,
            queue_family_indices: families.to_vec(),
            format: info.image_format,
            present_mode: info.present_mode,
        });

        // Owned images are alive without being created by the caller
        let mut images = Vec::new();
        for _ in 0..info.min_image_count {
            let image = journal.next_id;
            journal.next_id += 1;
            journal.live.insert(image, Live { kind: Kind::Image, deps: vec![id] });
            images.push(image);
        }
        journal.swapchains.insert(id, Swapchain { images, next_image: 0 });
        Ok(handle(id))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let journal = self.journal.lock();
        let chain = journal
            .swapchains
            .get(&raw(swapchain))
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        Ok(chain.images.iter().map(|&id| handle(id)).collect())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let id = raw(swapchain);
        let mut journal = self.journal.lock();
        if let Some(chain) = journal.swapchains.remove(&id) {
            for image in chain.images {
                let users = journal
                    .live
                    .values()
                    .filter(|live| live.deps.contains(&image))
                    .count();
                if users > 0 {
                    journal.violation(format!(
                        "Swapchain {} destroyed while {} views of image {} are alive",
                        id, users, image
                    ));
                }
                journal.live.remove(&image);
            }
        }
        journal.destroy(Kind::Swapchain, id);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut journal = self.journal.lock();
        journal.call("acquire_next_image")?;
        journal.signal(raw(signal));
        let suboptimal = journal.gpu.suboptimal;
        let chain = journal
            .swapchains
            .get_mut(&raw(swapchain))
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let index = chain.next_image;
        chain.next_image = (index + 1) % chain.images.len().max(1) as u32;
        journal.events.push(Event::Acquire(index));
        Ok((index, suboptimal))
    }

    fn queue_present(&self, _queue: vk::Queue, info: &vk::PresentInfoKHR) -> VkResult<bool> {
        let mut journal = self.journal.lock();
        // Out-of-date presents still consume their wait semaphores
        // SAFETY: the present info's arrays outlive this call
        let waits = unsafe { slice(info.p_wait_semaphores, info.wait_semaphore_count) };
        for &semaphore in waits {
            journal.consume(raw(semaphore));
        }
        journal.call("queue_present")?;
        // SAFETY: the present info's arrays outlive this call
        let indices = unsafe { slice(info.p_image_indices, info.swapchain_count) };
        for &index in indices {
            journal.events.push(Event::Present(index));
        }
        Ok(journal.gpu.suboptimal)
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        let id = self.create("create_image", Kind::Image, Vec::new())?;
        let size = info.extent.width as u64 * info.extent.height as u64 * 4;
        self.journal.lock().image_sizes.insert(id, size);
        Ok(handle(id))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.destroy(Kind::Image, raw(image));
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.journal.lock().image_sizes.get(&raw(image)).copied().unwrap_or(0),
            alignment: 256,
            memory_type_bits: 0b1,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut journal = self.journal.lock();
        journal.call("bind_image_memory")?;
        journal.depend(raw(image), raw(memory));
        Ok(())
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        self.create("create_image_view", Kind::ImageView, vec![raw(info.image)])
            .map(handle)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy(Kind::ImageView, raw(view));
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        let id = self.create("create_buffer", Kind::Buffer, Vec::new())?;
        self.journal.lock().buffer_sizes.insert(id, info.size);
        Ok(handle(id))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.destroy(Kind::Buffer, raw(buffer));
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.journal.lock().buffer_sizes.get(&raw(buffer)).copied().unwrap_or(0),
            alignment: 4,
            memory_type_bits: 0b1,
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut journal = self.journal.lock();
        journal.call("bind_buffer_memory")?;
        journal.depend(raw(buffer), raw(memory));
        Ok(())
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        let id = self.create("allocate_memory", Kind::Memory, Vec::new())?;
        self.journal
            .lock()
            .memory
            .insert(id, vec![0; info.allocation_size as usize]);
        Ok(handle(id))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut journal = self.journal.lock();
        if journal.mapped.get(&raw(memory)) == Some(&true) {
            journal.violation(format!("Memory {} freed while mapped", raw(memory)));
        }
        journal.destroy(Kind::Memory, raw(memory));
        journal.memory.remove(&raw(memory));
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        let id = raw(memory);
        let mut journal = self.journal.lock();
        journal.call("map_memory")?;
        if journal.mapped.insert(id, true) == Some(true) {
            journal.violation(format!("Memory {} mapped twice", id));
        }
        journal.map_sizes.entry(id).or_default().push(size);

        let bytes = journal
            .memory
            .get_mut(&id)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset + size > bytes.len() as u64 {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        // The heap allocation does not move while the memory object lives
        Ok(bytes[offset as usize..].as_mut_ptr())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let id = raw(memory);
        let mut journal = self.journal.lock();
        if journal.mapped.insert(id, false) != Some(true) {
            journal.violation(format!("Memory {} unmapped while not mapped", id));
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let id = self.create("create_shader_module", Kind::ShaderModule, Vec::new())?;
        self.journal.lock().shader_code.insert(id, code.to_vec());
        Ok(handle(id))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroy(Kind::ShaderModule, raw(module));
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        let id = self.create("create_render_pass", Kind::RenderPass, Vec::new())?;
        // SAFETY: the create info's arrays outlive this call
        let attachments = unsafe { slice(info.p_attachments, info.attachment_count) };
        self.journal
            .lock()
            .render_pass_formats
            .insert(id, attachments.iter().map(|a| a.format).collect());
        Ok(handle(id))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroy(Kind::RenderPass, raw(render_pass));
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> VkResult<vk::PipelineLayout> {
        let id = self.create("create_pipeline_layout", Kind::PipelineLayout, Vec::new())?;
        // SAFETY: the create info's arrays outlive this call
        let ranges = unsafe { slice(info.p_push_constant_ranges, info.push_constant_range_count) };
        self.journal
            .lock()
            .push_constant_sizes
            .insert(id, ranges.iter().map(|r| r.size).collect());
        Ok(handle(id))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy(Kind::PipelineLayout, raw(layout));
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        let id = self.create(
            "create_graphics_pipeline",
            Kind::Pipeline,
            vec![raw(info.layout), raw(info.render_pass)],
        )?;

        // SAFETY: every pointer in the create info is valid for this call
        let record = unsafe {
            let stages = slice(info.p_stages, info.stage_count);
            let dynamic_states = info
                .p_dynamic_state
                .as_ref()
                .map(|d| slice(d.p_dynamic_states, d.dynamic_state_count).to_vec())
                .unwrap_or_default();
            PipelineRecord {
                stages: stages.iter().map(|s| s.stage).collect(),
                dynamic_states,
                cull_mode: info
                    .p_rasterization_state
                    .as_ref()
                    .map(|r| r.cull_mode)
                    .unwrap_or_default(),
                depth_compare_op: info
                    .p_depth_stencil_state
                    .as_ref()
                    .map(|d| d.depth_compare_op)
                    .unwrap_or_default(),
            }
        };
        self.journal.lock().last_pipeline = Some(record);
        Ok(handle(id))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroy(Kind::Pipeline, raw(pipeline));
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        // SAFETY: the create info's arrays outlive this call
        let attachments = unsafe { slice(info.p_attachments, info.attachment_count) };
        let mut deps: Vec<u64> = attachments.iter().map(|&view| raw(view)).collect();
        deps.push(raw(info.render_pass));
        self.create("create_framebuffer", Kind::Framebuffer, deps)
            .map(handle)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroy(Kind::Framebuffer, raw(framebuffer));
    }

    fn create_command_pool(&self, _info: &vk::CommandPoolCreateInfo) -> VkResult<vk::CommandPool> {
        self.create("create_command_pool", Kind::CommandPool, Vec::new())
            .map(handle)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy(Kind::CommandPool, raw(pool));
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.create("allocate_command_buffer", Kind::CommandBuffer, vec![raw(pool)])
            .map(handle)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        let mut journal = self.journal.lock();
        if journal.command_buffer_in_flight(raw(buffer)) {
            journal.violation(format!("Command buffer {} freed while in flight", raw(buffer)));
        }
        journal.destroy(Kind::CommandBuffer, raw(buffer));
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut journal = self.journal.lock();
        journal.call("reset_command_buffer")?;
        if journal.command_buffer_in_flight(raw(buffer)) {
            journal.violation(format!("Command buffer {} reset while in flight", raw(buffer)));
        }
        journal.events.push(Event::ResetCommandBuffer);
        Ok(())
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut journal = self.journal.lock();
        journal.call("begin_command_buffer")?;
        if journal.command_buffer_in_flight(raw(buffer)) {
            journal.violation(format!("Command buffer {} re-recorded while in flight", raw(buffer)));
        }
        journal.events.push(Event::BeginCommandBuffer);
        Ok(())
    }

    fn end_command_buffer(&self, _buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut journal = self.journal.lock();
        journal.call("end_command_buffer")?;
        journal.events.push(Event::EndCommandBuffer);
        Ok(())
    }

    fn cmd_begin_render_pass(&self, _buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        // SAFETY: the clear values outlive this call; colour then depth
        let clears = unsafe { slice(info.p_clear_values, info.clear_value_count) };
        let (clear_color, clear_depth) = unsafe {
            (
                clears.first().map(|c| c.color.float32).unwrap_or_default(),
                clears.get(1).map(|c| c.depth_stencil.depth).unwrap_or_default(),
            )
        };
        self.record(Event::BeginRenderPass {
            framebuffer: raw(info.framebuffer),
            clear_color,
            clear_depth,
        });
    }

    fn cmd_end_render_pass(&self, _buffer: vk::CommandBuffer) {
        self.record(Event::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(Event::BindPipeline(raw(pipeline)));
    }

    fn cmd_set_viewport(&self, _buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.record(Event::SetViewport(viewport.width, viewport.height));
    }

    fn cmd_set_scissor(&self, _buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.record(Event::SetScissor(scissor.extent.width, scissor.extent.height));
    }

    fn cmd_push_constants(
        &self,
        _buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        bytes: &[u8],
    ) {
        self.record(Event::PushConstants(bytes.to_vec()));
    }

    fn cmd_bind_vertex_buffer(
        &self,
        _buffer: vk::CommandBuffer,
        _binding: u32,
        vertex_buffer: vk::Buffer,
        _offset: vk::DeviceSize,
    ) {
        self.record(Event::BindVertexBuffer(raw(vertex_buffer)));
    }

    fn cmd_draw(
        &self,
        _buffer: vk::CommandBuffer,
        vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(Event::Draw(vertex_count));
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.create("create_semaphore", Kind::Semaphore, Vec::new())
            .map(handle)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.journal.lock().signaled.remove(&raw(semaphore));
        self.destroy(Kind::Semaphore, raw(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let id = self.create("create_fence", Kind::Fence, Vec::new())?;
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        self.journal.lock().fences.insert(id, state);
        Ok(handle(id))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let id = raw(fence);
        let mut journal = self.journal.lock();
        if journal.fences.remove(&id) == Some(FenceState::Pending) {
            journal.violation(format!("Fence {} destroyed while in use", id));
        }
        journal.destroy(Kind::Fence, id);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let id = raw(fence);
        let mut journal = self.journal.lock();
        journal.events.push(Event::WaitFence);
        match journal.fences.get(&id).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                journal.retire(id);
                Ok(())
            }
            _ => {
                journal.violation(format!("Waited on fence {} that nothing will signal", id));
                Err(vk::Result::TIMEOUT)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let id = raw(fence);
        let mut journal = self.journal.lock();
        journal.events.push(Event::ResetFence);
        if journal.fences.get(&id) == Some(&FenceState::Pending) {
            journal.violation(format!("Fence {} reset while in use", id));
        }
        journal.fences.insert(id, FenceState::Unsignaled);
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        info: &vk::SubmitInfo,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let id = raw(fence);
        let mut journal = self.journal.lock();
        journal.call("queue_submit")?;
        match journal.fences.get(&id).copied() {
            Some(FenceState::Unsignaled) => {}
            state => {
                journal.violation(format!("Submitted with fence {} in state {:?}", id, state));
            }
        }
        journal.fences.insert(id, FenceState::Pending);

        // SAFETY: the submit info's arrays outlive this call
        let (buffers, waits, signals) = unsafe {
            (
                slice(info.p_command_buffers, info.command_buffer_count),
                slice(info.p_wait_semaphores, info.wait_semaphore_count),
                slice(info.p_signal_semaphores, info.signal_semaphore_count),
            )
        };
        for &buffer in buffers {
            journal.in_flight.push((id, raw(buffer)));
        }
        for &semaphore in waits {
            journal.consume(raw(semaphore));
        }
        for &semaphore in signals {
            journal.signal(raw(semaphore));
        }
        journal.events.push(Event::Submit);
        Ok(())
    }
}

// ── Window and helpers ──────────────────────────────────────────────────

/// Headless surface provider
pub struct MockWindow {
    size: (u32, u32),
}

impl MockWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
        }
    }
}

impl SurfaceProvider for MockWindow {
    fn display_handle(&self) -> GpuResult<RawDisplayHandle> {
        Ok(RawDisplayHandle::Xlib(XlibDisplayHandle::empty()))
    }

    fn window_handle(&self) -> GpuResult<RawWindowHandle> {
        Ok(RawWindowHandle::Xlib(XlibWindowHandle::empty()))
    }

    fn required_extensions(&self) -> GpuResult<Vec<CString>> {
        Ok(vec![
            khr::Surface::name().to_owned(),
            khr::XlibSurface::name().to_owned(),
        ])
    }

    fn drawable_size(&self) -> (u32, u32) {
        self.size
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// A device context on the default mock machine
pub fn context() -> (DeviceContext<MockLoader>, SharedJournal) {
    context_with(MockGpu::default())
}

pub fn context_with(gpu: MockGpu) -> (DeviceContext<MockLoader>, SharedJournal) {
    let loader = MockLoader::new(gpu);
    let journal = loader.journal();
    let ctx = DeviceContext::new(loader, &MockWindow::new(1280, 720), &DeviceOptions::default())
        .expect("mock device context");
    (ctx, journal)
}

/// Smallest word stream the mock accepts as SPIR-V
pub fn spirv_stub() -> Vec<u8> {
    [0x0723_0203u32, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

/// Vertex then fragment module
pub fn shader_pair(ctx: &DeviceContext<MockLoader>) -> Vec<ShaderModule<'_, MockDevice>> {
    let bytes = spirv_stub();
    [vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT]
        .into_iter()
        .map(|stage| ShaderModule::from_bytes(ctx, stage, &bytes).expect("mock shader"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_order_teardown_is_detected() {
        let loader = MockLoader::new(MockGpu::default());
        let journal = loader.journal();
        let instance = loader
            .create_instance(&InstanceDesc {
                app_name: c"forward",
                extensions: &[],
                layers: &[],
            })
            .unwrap();
        let surface = instance
            .create_surface(
                RawDisplayHandle::Xlib(XlibDisplayHandle::empty()),
                RawWindowHandle::Xlib(XlibWindowHandle::empty()),
            )
            .unwrap();

        instance.destroy_instance();
        instance.destroy_surface(surface);

        let violations = journal.lock().violations();
        assert_eq!(violations.len(), 1, "{:?}", violations);
        assert!(violations[0].contains("Instance"));
    }

    #[test]
    fn handles_are_never_reused() {
        let (ctx, journal) = context();
        let first = ctx.device().create_semaphore().unwrap();
        ctx.device().destroy_semaphore(first);
        let second = ctx.device().create_semaphore().unwrap();
        ctx.device().destroy_semaphore(second);

        assert_ne!(raw(first), raw(second));
        ctx.device().destroy_semaphore(first);
        assert_eq!(journal.lock().violations().len(), 1);
    }

    #[test]
    fn submitting_with_a_busy_fence_is_a_violation() {
        let (ctx, journal) = context();
        let device = ctx.device();
        let fence = device.create_fence(true).unwrap();
        let submit = vk::SubmitInfo::default();

        device.queue_submit(vk::Queue::null(), &submit, fence).unwrap();
        assert_eq!(journal.lock().violations().len(), 1);

        device.wait_for_fence(fence, u64::MAX).unwrap();
        device.reset_fence(fence).unwrap();
        device.queue_submit(vk::Queue::null(), &submit, fence).unwrap();
        assert_eq!(journal.lock().violations().len(), 1);

        // Submits without command buffers are retired by the idle wait too
        device.wait_idle().unwrap();
        assert!(journal.lock().fence_is_signaled(fence));
        device.destroy_fence(fence);
        assert_eq!(journal.lock().violations().len(), 1);
    }

    #[test]
    fn semaphores_must_be_waited_between_signals() {
        let (ctx, journal) = context();
        let device = ctx.device();
        let semaphore = device.create_semaphore().unwrap();
        let fence = device.create_fence(false).unwrap();
        let waits = [semaphore];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages);

        device.acquire_next_image(ctx.swapchain(), u64::MAX, semaphore).unwrap();
        assert!(journal.lock().semaphore_is_signaled(semaphore));
        device.queue_submit(vk::Queue::null(), &submit, fence).unwrap();
        assert!(!journal.lock().semaphore_is_signaled(semaphore));
        assert!(journal.lock().violations().is_empty());

        device.acquire_next_image(ctx.swapchain(), u64::MAX, semaphore).unwrap();
        device.acquire_next_image(ctx.swapchain(), u64::MAX, semaphore).unwrap();
        assert_eq!(journal.lock().violations().len(), 1);

        device.wait_idle().unwrap();
        device.destroy_fence(fence);
        device.destroy_semaphore(semaphore);
    }
}
