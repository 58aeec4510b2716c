// Frame scheduling - one frame in flight
//
// Per frame: wait for the previous submit's fence, reset it, acquire an
// image, record, submit, present. The fence is reset exactly once between
// its wait and the submit that signals it again, so a submit never sees a
// fence that is already in use.

use super::api::{DeviceOf, GpuDevice, GpuLoader};
use super::buffer::{GpuBuffer, Vertex};
use super::error::{GpuError, GpuResult, VkResultExt};
use super::pipeline::RenderPipeline;
use ash::vk;

/// Where the scheduler is in the per-frame protocol. After a failed call it
/// stays at the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Waiting,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// What a rendered frame ended up as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub image_index: u32,
    /// The swapchain no longer matches the surface exactly
    pub suboptimal: bool,
}

/// Recording handle handed to the frame callback.
///
/// Only exists while the render pass is open, so push constants and draws
/// can only be recorded during recording.
pub struct FrameRecorder<'a, D: GpuDevice> {
    device: &'a D,
    command_buffer: vk::CommandBuffer,
    layout: vk::PipelineLayout,
    push_constant_size: u32,
    push_constant_stages: vk::ShaderStageFlags,
    extent: vk::Extent2D,
    image_index: u32,
}

impl<D: GpuDevice> FrameRecorder<'_, D> {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Cover the whole swapchain image; depth range [0, 1]
    pub fn set_viewport_and_scissor(&mut self) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        self.device.cmd_set_viewport(self.command_buffer, viewport);
        self.device.cmd_set_scissor(self.command_buffer, scissor);
    }

    /// Record `bytes` at offset 0 of the declared push constant range.
    pub fn push_constants(&mut self, bytes: &[u8]) -> GpuResult<()> {
        if bytes.len() > self.push_constant_size as usize {
            return Err(GpuError::PushConstantOverflow {
                len: bytes.len(),
                max: self.push_constant_size,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.device.cmd_push_constants(
            self.command_buffer,
            self.layout,
            self.push_constant_stages,
            0,
            bytes,
        );
        Ok(())
    }

    pub fn push_constant_block<T: bytemuck::Pod>(&mut self, block: &T) -> GpuResult<()> {
        self.push_constants(bytemuck::bytes_of(block))
    }

    pub fn bind_vertex_buffer<V: Vertex>(&mut self, buffer: &GpuBuffer<'_, D, V>) {
        self.device
            .cmd_bind_vertex_buffer(self.command_buffer, 0, buffer.handle(), 0);
    }

    pub fn draw(&mut self, vertex_count: u32) {
        self.device.cmd_draw(self.command_buffer, vertex_count, 1, 0, 0);
    }

    /// Bind `buffer` and draw every vertex it currently holds
    pub fn draw_buffer<V: Vertex>(&mut self, buffer: &GpuBuffer<'_, D, V>) {
        self.bind_vertex_buffer(buffer);
        self.draw(buffer.vertex_count());
    }
}

impl<L: GpuLoader> RenderPipeline<'_, L> {
    /// Render and present one frame.
    ///
    /// `record` runs inside the render pass after the pipeline is bound.
    /// Present failures and suboptimal results are logged, not returned.
    ///
    /// Once the fence has been reset every path submits something that
    /// signals it again, so a failed frame never stalls the next one. An
    /// error from `record` still submits and presents what was recorded
    /// before it, then returns that error.
    pub fn render<F>(&mut self, record: F) -> GpuResult<FrameInfo>
    where
        F: FnOnce(&mut FrameRecorder<'_, DeviceOf<L>>) -> GpuResult<()>,
    {
        let ctx = self.ctx;
        let device = ctx.device();
        let fence = self.sync.in_flight_fence;

        self.transition(FrameState::Waiting);
        device
            .wait_for_fence(fence, u64::MAX)
            .during("wait for the in-flight fence")?;
        device
            .reset_fence(fence)
            .during("reset the in-flight fence")?;

        self.transition(FrameState::Acquiring);
        let acquired = device
            .acquire_next_image(ctx.swapchain(), u64::MAX, self.sync.image_available)
            .during("acquire the next swapchain image");
        let (image_index, acquire_suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                self.release_fence(false);
                return Err(e);
            }
        };

        self.transition(FrameState::Recording);
        let recorded = match self.record(image_index, record) {
            Ok(recorded) => recorded,
            Err(e) => {
                self.release_fence(true);
                return Err(e);
            }
        };

        let wait_semaphores = [self.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.render_finished];
        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        if let Err(e) = device
            .queue_submit(ctx.graphics_queue(), &submit_info, fence)
            .during("submit the frame")
        {
            self.release_fence(true);
            return Err(e);
        }
        self.transition(FrameState::Submitted);

        self.transition(FrameState::Presenting);
        let swapchains = [ctx.swapchain()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = match device.queue_present(ctx.present_queue(), &present_info) {
            Ok(present_suboptimal) => acquire_suboptimal || present_suboptimal,
            Err(result) => {
                log::warn!("Present failed for image {}: {}", image_index, result);
                acquire_suboptimal
            }
        };
        if suboptimal {
            log::debug!("Swapchain is suboptimal for the surface");
        }

        self.transition(FrameState::Idle);
        recorded?;
        self.frames_rendered += 1;
        Ok(FrameInfo {
            image_index,
            suboptimal,
        })
    }

    /// Submit an empty batch that signals the in-flight fence, waiting on
    /// the image-available semaphore when an image was acquired.
    fn release_fence(&self, acquired: bool) {
        let ctx = self.ctx;
        let wait_semaphores = [self.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let mut submit_info = vk::SubmitInfo::builder();
        if acquired {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }
        if let Err(result) =
            ctx.device()
                .queue_submit(ctx.graphics_queue(), &submit_info, self.sync.in_flight_fence)
        {
            log::error!("Failed to release the in-flight fence: {}", result);
        }
    }

    /// Record the frame. The outer error means the command buffer is
    /// unusable; the inner one is whatever `record` returned.
    fn record<F>(&self, image_index: u32, record: F) -> GpuResult<GpuResult<()>>
    where
        F: FnOnce(&mut FrameRecorder<'_, DeviceOf<L>>) -> GpuResult<()>,
    {
        let ctx = self.ctx;
        let device = ctx.device();
        let command_buffer = self.command_buffer;

        device
            .reset_command_buffer(command_buffer)
            .during("reset the command buffer")?;
        device
            .begin_command_buffer(command_buffer)
            .during("begin the command buffer")?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.desc.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let extent = ctx.extent();
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(command_buffer, &render_pass_info);
        device.cmd_bind_pipeline(command_buffer, self.pipeline);

        let mut recorder = FrameRecorder {
            device,
            command_buffer,
            layout: self.layout,
            push_constant_size: self.desc.push_constant_size,
            push_constant_stages: self.desc.push_constant_stages,
            extent,
            image_index,
        };
        let recorded = record(&mut recorder);

        device.cmd_end_render_pass(command_buffer);
        device
            .end_command_buffer(command_buffer)
            .during("end the command buffer")?;
        Ok(recorded)
    }

    fn transition(&mut self, next: FrameState) {
        log::trace!("Frame {}: {:?} -> {:?}", self.frames_rendered, self.state, next);
        self.state = next;
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Wait for the device to finish; call before tearing anything down.
    pub fn wait_idle(&self) -> GpuResult<()> {
        self.ctx.wait_idle()
    }
}
