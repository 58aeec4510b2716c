// =============================================================================
// WATER - animated heightfield and the camera looking at it
// =============================================================================
//
// The surface is a square grid on the XZ plane emitted as a plain triangle
// list (no index buffer), rebuilt every frame from two travelling sine waves.
// Triangles wind clockwise as seen from above, matching the pipeline's
// front face.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::offset_of;
use still_water::backend::Vertex;
use still_water::config::MeshConfig;

const DEEP: Vec3 = Vec3::new(0.02, 0.10, 0.22);
const CREST: Vec3 = Vec3::new(0.45, 0.70, 0.85);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct WaterVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex for WaterVertex {
    fn attributes(binding: u32) -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                binding,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(WaterVertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(WaterVertex, color) as u32,
            },
        ]
    }
}

pub struct WaterSurface {
    grid_size: usize,
    extent: f32,
    amplitude: f32,
    frequency: f32,
    speed: f32,
    vertices: Vec<WaterVertex>,
}

impl WaterSurface {
    pub fn new(config: &MeshConfig) -> Self {
        let grid_size = config.grid_size.max(2) as usize;
        let cells = (grid_size - 1) * (grid_size - 1);
        let mut surface = Self {
            grid_size,
            extent: config.extent,
            amplitude: config.amplitude,
            frequency: config.frequency,
            speed: config.speed,
            vertices: Vec::with_capacity(cells * 6),
        };
        surface.update(0.0);
        surface
    }

    /// Vertices the mesh always has, whatever the time
    pub fn vertex_count(&self) -> usize {
        (self.grid_size - 1) * (self.grid_size - 1) * 6
    }

    pub fn vertices(&self) -> &[WaterVertex] {
        &self.vertices
    }

    pub fn height(&self, x: f32, z: f32, time: f32) -> f32 {
        let k = self.frequency;
        let w = self.speed * time;
        self.amplitude
            * (0.6 * (k * x + w).sin() + 0.4 * (1.7 * k * z - 0.8 * w).sin())
    }

    /// Rebuild the mesh for `time` seconds
    pub fn update(&mut self, time: f32) {
        let n = self.grid_size;
        let step = self.extent / (n - 1) as f32;
        let origin = -self.extent / 2.0;
        let mut vertices = std::mem::take(&mut self.vertices);
        vertices.clear();

        let point = |i: usize, j: usize| {
            let x = origin + i as f32 * step;
            let z = origin + j as f32 * step;
            let y = self.height(x, z, time);
            let t = if self.amplitude > 0.0 {
                (y / self.amplitude * 0.5 + 0.5).clamp(0.0, 1.0)
            } else {
                0.5
            };
            WaterVertex {
                position: [x, y, z],
                color: DEEP.lerp(CREST, t).to_array(),
            }
        };

        for j in 0..n - 1 {
            for i in 0..n - 1 {
                let (a, b) = (point(i, j), point(i + 1, j));
                let (c, d) = (point(i, j + 1), point(i + 1, j + 1));
                vertices.extend_from_slice(&[a, b, c, b, d, c]);
            }
        }
        self.vertices = vertices;
    }
}

/// Fixed camera above and in front of the water
pub struct Camera {
    eye: Vec3,
    target: Vec3,
    aspect: f32,
}

impl Camera {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            eye: Vec3::new(0.0, 6.0, 14.0),
            target: Vec3::ZERO,
            aspect: extent.width as f32 / extent.height.max(1) as f32,
        }
    }

    /// Model-view-projection for Vulkan clip space (Y down, depth 0..1)
    pub fn view_projection(&self) -> Mat4 {
        let view = Mat4::look_at_rh(self.eye, self.target, Vec3::Y);
        let mut projection = Mat4::perspective_rh(45f32.to_radians(), self.aspect, 0.1, 100.0);
        projection.y_axis.y *= -1.0;
        projection * view
    }
}
