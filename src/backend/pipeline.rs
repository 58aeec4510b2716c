// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// `RenderPipeline` also owns everything needed to drive one frame in flight;
// the per-frame protocol lives in `frame.rs`.

use super::api::{DeviceOf, GpuDevice, GpuLoader};
use super::buffer::VertexLayout;
use super::device::DeviceContext;
use super::error::{GpuError, GpuResult, VkResultExt};
use super::frame::FrameState;
use super::shader::{stage_infos, ShaderModule};
use super::sync::FrameSync;
use ash::vk;

/// Fixed-function choices and the push-constant contract of a pipeline
#[derive(Clone)]
pub struct PipelineDesc {
    pub vertex_layout: VertexLayout,
    /// Bytes of push constants the shaders read; 0 declares no range
    pub push_constant_size: u32,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub clear_color: [f32; 4],
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            vertex_layout: VertexLayout::default(),
            push_constant_size: 0,
            push_constant_stages: vk::ShaderStageFlags::VERTEX,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Render pass, pipeline and per-frame resources for one window
pub struct RenderPipeline<'ctx, L: GpuLoader> {
    pub(super) ctx: &'ctx DeviceContext<L>,
    pub(super) desc: PipelineDesc,
    pub(super) render_pass: vk::RenderPass,
    pub(super) layout: vk::PipelineLayout,
    pub(super) pipeline: vk::Pipeline,
    pub(super) framebuffers: Vec<vk::Framebuffer>,
    pub(super) sync: FrameSync,
    pub(super) command_buffer: vk::CommandBuffer,
    pub(super) state: FrameState,
    pub(super) frames_rendered: u64,
    shaders: Vec<ShaderModule<'ctx, DeviceOf<L>>>,
}

impl<'ctx, L: GpuLoader> RenderPipeline<'ctx, L> {
    /// Build the pipeline from `shaders`, which it takes ownership of.
    ///
    /// Anything created before a failing step is destroyed again.
    pub fn new(
        ctx: &'ctx DeviceContext<L>,
        shaders: Vec<ShaderModule<'ctx, DeviceOf<L>>>,
        desc: PipelineDesc,
    ) -> GpuResult<Self> {
        let device = ctx.device();

        // Null handles are skipped on drop, so every step below can bail.
        let mut this = Self {
            ctx,
            desc,
            render_pass: vk::RenderPass::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            sync: FrameSync::default(),
            command_buffer: vk::CommandBuffer::null(),
            state: FrameState::Idle,
            frames_rendered: 0,
            shaders,
        };

        this.render_pass =
            create_render_pass(device, ctx.surface_format().format, ctx.depth_format())?;
        this.layout = create_pipeline_layout(device, &this.desc)?;
        this.pipeline = create_graphics_pipeline(
            device,
            &stage_infos(&this.shaders),
            this.layout,
            this.render_pass,
            &this.desc,
        )?;
        this.framebuffers = create_framebuffers(
            device,
            ctx.image_views(),
            ctx.depth_view(),
            this.render_pass,
            ctx.extent(),
        )?;
        this.sync = FrameSync::new(device)?;
        this.command_buffer = device
            .allocate_command_buffer(ctx.command_pool())
            .during("allocate the frame command buffer")?;

        log::info!(
            "Render pipeline ready: {} shader stages, {} framebuffers, {} push constant bytes",
            this.shaders.len(),
            this.framebuffers.len(),
            this.desc.push_constant_size
        );
        Ok(this)
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn sync(&self) -> &FrameSync {
        &self.sync
    }
}

impl<L: GpuLoader> Drop for RenderPipeline<'_, L> {
    fn drop(&mut self) {
        let device = self.ctx.device();

        // The last submit may still be reading the command buffer
        let fence = self.sync.in_flight_fence;
        if fence != vk::Fence::null() {
            if let Err(result) = device.wait_for_fence(fence, u64::MAX) {
                log::error!("Failed to wait for the last frame: {}", result);
            }
        }

        if self.command_buffer != vk::CommandBuffer::null() {
            device.free_command_buffer(self.ctx.command_pool(), self.command_buffer);
        }
        self.sync.destroy(device);
        for &framebuffer in self.framebuffers.iter().rev() {
            device.destroy_framebuffer(framebuffer);
        }
        device.destroy_pipeline(self.pipeline);
        device.destroy_pipeline_layout(self.layout);
        device.destroy_render_pass(self.render_pass);

        // Last loaded, first destroyed
        while let Some(shader) = self.shaders.pop() {
            drop(shader);
        }
    }
}

/// Create a render pass for color rendering with depth
///
/// The color attachment ends up ready to present; depth is cleared each
/// frame and never stored.
pub fn create_render_pass<D: GpuDevice>(
    device: &D,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> GpuResult<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_attachment_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // Wait for the previous user of the attachments before writing them
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    device
        .create_render_pass(&render_pass_info)
        .during("create the render pass")
}

/// One framebuffer per swapchain view, all sharing the depth view
pub fn create_framebuffers<D: GpuDevice>(
    device: &D,
    image_views: &[vk::ImageView],
    depth_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> GpuResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &image_view in image_views {
        let attachments = [image_view, depth_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match device.create_framebuffer(&framebuffer_info) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(result) => {
                for &framebuffer in framebuffers.iter().rev() {
                    device.destroy_framebuffer(framebuffer);
                }
                return Err(GpuError::Vulkan { op: "create a framebuffer", result });
            }
        }
    }
    Ok(framebuffers)
}

pub fn create_pipeline_layout<D: GpuDevice>(
    device: &D,
    desc: &PipelineDesc,
) -> GpuResult<vk::PipelineLayout> {
    let push_constant_ranges: Vec<_> = if desc.push_constant_size > 0 {
        vec![vk::PushConstantRange {
            stage_flags: desc.push_constant_stages,
            offset: 0,
            size: desc.push_constant_size,
        }]
    } else {
        Vec::new()
    };

    let layout_info =
        vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_constant_ranges);

    device
        .create_pipeline_layout(&layout_info)
        .during("create the pipeline layout")
}

/// Create the graphics pipeline. Viewport and scissor are dynamic and set
/// while recording.
pub fn create_graphics_pipeline<D: GpuDevice>(
    device: &D,
    shader_stages: &[vk::PipelineShaderStageCreateInfo],
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    desc: &PipelineDesc,
) -> GpuResult<vk::Pipeline> {
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex_layout.bindings)
        .vertex_attribute_descriptions(&desc.vertex_layout.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS) // Closer fragments win
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Opaque
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    device
        .create_graphics_pipeline(&pipeline_info)
        .during("create the graphics pipeline")
}
