// Vertex buffers mirrored into host-visible GPU memory
//
// The CPU keeps the authoritative vertex list; `sync_with_gpu_memory` copies
// exactly the live part of it into the mapped allocation.

use super::api::{GpuDevice, GpuInstance, GpuLoader};
use super::device::DeviceContext;
use super::error::{GpuError, GpuResult, VkResultExt};
use ash::vk;
use std::mem::size_of;

/// A plain-old-data vertex the pipeline can consume from one binding.
pub trait Vertex: bytemuck::Pod {
    /// Attribute descriptions for this vertex at the given binding.
    fn attributes(binding: u32) -> Vec<vk::VertexInputAttributeDescription>;

    fn binding(binding: u32) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }
}

/// Vertex input state for a pipeline: one binding per vertex type, in order.
#[derive(Clone, Default)]
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    pub fn of<V: Vertex>() -> Self {
        Self::default().with::<V>()
    }

    /// Append `V` at the next binding slot.
    pub fn with<V: Vertex>(mut self) -> Self {
        let binding = self.bindings.len() as u32;
        self.bindings.push(V::binding(binding));
        self.attributes.extend(V::attributes(binding));
        self
    }
}

/// Find a memory type index allowed by `type_filter` with all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
        .ok_or(GpuError::NoMemoryType(properties, type_filter))
}

/// CPU vertex list twinned with a host-coherent vertex buffer of fixed capacity
pub struct GpuBuffer<'ctx, D: GpuDevice, V: Vertex> {
    device: &'ctx D,
    vertices: Vec<V>,
    capacity: usize,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl<'ctx, D: GpuDevice, V: Vertex> GpuBuffer<'ctx, D, V> {
    pub fn new<L>(ctx: &'ctx DeviceContext<L>, capacity: usize) -> GpuResult<Self>
    where
        L: GpuLoader,
        L::Instance: GpuInstance<Device = D>,
    {
        if capacity == 0 {
            return Err(GpuError::EmptyBuffer);
        }
        // Draw calls count vertices in u32
        if u32::try_from(capacity).is_err() {
            return Err(GpuError::CapacityExceeded {
                len: capacity,
                capacity: u32::MAX as usize,
            });
        }
        let device: &'ctx D = ctx.device();
        let size = (size_of::<V>() * capacity) as vk::DeviceSize;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = device
            .create_buffer(&buffer_info)
            .during("create the vertex buffer")?;

        let memory = match Self::allocate_and_bind(ctx, device, buffer) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        log::debug!(
            "Vertex buffer: {} x {} bytes ({} bytes)",
            capacity,
            size_of::<V>(),
            size
        );

        Ok(Self {
            device,
            vertices: Vec::with_capacity(capacity),
            capacity,
            buffer,
            memory,
        })
    }

    fn allocate_and_bind<L: GpuLoader>(
        ctx: &DeviceContext<L>,
        device: &D,
        buffer: vk::Buffer,
    ) -> GpuResult<vk::DeviceMemory> {
        let requirements = device.buffer_memory_requirements(buffer);
        let memory_type_index = ctx.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = device
            .allocate_memory(&alloc_info)
            .during("allocate vertex buffer memory")?;

        if let Err(result) = device.bind_buffer_memory(buffer, memory) {
            device.free_memory(memory);
            return Err(GpuError::Vulkan { op: "bind vertex buffer memory", result });
        }
        Ok(memory)
    }

    /// Replace the whole CPU-side list.
    pub fn set_vertices(&mut self, vertices: &[V]) -> GpuResult<()> {
        if vertices.len() > self.capacity {
            return Err(GpuError::CapacityExceeded {
                len: vertices.len(),
                capacity: self.capacity,
            });
        }
        self.vertices.clear();
        self.vertices.extend_from_slice(vertices);
        Ok(())
    }

    /// Copy the live vertices into GPU memory.
    ///
    /// Not synchronized against GPU reads: call only once the fence for the
    /// frame that last read this buffer has been waited on.
    pub fn sync_with_gpu_memory(&self) -> GpuResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        if bytes.is_empty() {
            return Ok(());
        }

        let ptr = self
            .device
            .map_memory(self.memory, 0, bytes.len() as vk::DeviceSize)
            .during("map vertex buffer memory")?;

        // SAFETY: the mapping covers `bytes.len()` bytes, which never exceeds
        // the allocation because the list is capped at `capacity`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }

        self.device.unmap_memory(self.memory);
        Ok(())
    }

    pub fn vertices(&self) -> &[V] {
        &self.vertices
    }

    pub fn vertex_count(&self) -> u32 {
        // Never truncates: `new` caps the capacity at u32::MAX
        self.vertices.len() as u32
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes the next sync will copy.
    pub fn byte_len(&self) -> usize {
        size_of::<V>() * self.vertices.len()
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }
}

impl<D: GpuDevice, V: Vertex> Drop for GpuBuffer<'_, D, V> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        self.device.free_memory(self.memory);
    }
}
