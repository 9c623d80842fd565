// Command recording
//
// One primary command buffer per framebuffer, recorded once. The scene is
// static, so the same buffers are resubmitted every frame.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::pipeline::full_scissor;
use super::VulkanDevice;

/// Vertices synthesized by the vertex shader
const TRIANGLE_VERTEX_COUNT: u32 = 3;

pub struct CommandRecorder {
    pub command_pool: vk::CommandPool,
    pub command_buffers: Vec<vk::CommandBuffer>,
    device: Arc<VulkanDevice>,
}

impl CommandRecorder {
    pub fn new(
        device: Arc<VulkanDevice>,
        framebuffers: &[vk::Framebuffer],
        render_pass: vk::RenderPass,
        pipeline: vk::Pipeline,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_families.graphics);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        // From here on the pool is owned by `recorder` and freed on any error
        let mut recorder = Self {
            command_pool,
            command_buffers: Vec::new(),
            device,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(framebuffers.len() as u32);

        recorder.command_buffers =
            unsafe { recorder.device.device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate command buffers")?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        }];

        for (&cmd, &framebuffer) in recorder.command_buffers.iter().zip(framebuffers) {
            recorder.record(cmd, framebuffer, render_pass, pipeline, extent, &clear_values)?;
        }

        log::info!("Recorded {} command buffers", recorder.command_buffers.len());

        Ok(recorder)
    }

    fn record(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        render_pass: vk::RenderPass,
        pipeline: vk::Pipeline,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::default();

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(full_scissor(extent))
            .clear_values(clear_values);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_draw(cmd, TRIANGLE_VERTEX_COUNT, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }

        Ok(())
    }

    /// The pre-recorded buffer targeting swapchain image `image_index`
    pub fn buffer_for(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(image_index as usize).copied()
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        // Destroying the pool frees its buffers
        unsafe {
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
