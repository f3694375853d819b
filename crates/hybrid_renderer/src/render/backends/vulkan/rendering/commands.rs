//! Command buffer management
//!
//! RAII command pool, a recorder for the per-frame buffers and the one-shot
//! helper used for uploads and acceleration structure builds. One-shot
//! submission waits for queue idle, so all one-off work is serialized.

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, command_pool })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Return command buffers to the pool
    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe {
            self.device.free_command_buffers(self.command_pool, command_buffers);
        }
    }

    /// Get the command pool handle
    pub const fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Begin single-time command buffer
    fn begin_single_time(&self) -> VulkanResult<CommandRecorder> {
        let command_buffer = self
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Command buffer allocation returned nothing".to_string(),
            })?;

        let mut recorder = CommandRecorder::new(command_buffer, self.device.clone());
        if let Err(e) = recorder.begin() {
            self.free_command_buffers(&[command_buffer]);
            return Err(e);
        }
        Ok(recorder)
    }

    /// Close, submit and wait for a single-time command buffer, then free it
    fn end_single_time(&self, recorder: CommandRecorder, queue: vk::Queue) -> VulkanResult<()> {
        let command_buffer = recorder.end()?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();

        let result = unsafe {
            self.device
                .queue_submit(queue, &[submit_info], vk::Fence::null())
                .and_then(|()| self.device.queue_wait_idle(queue))
        };
        self.free_command_buffers(&command_buffers);
        result.map_err(VulkanError::Api)
    }

    /// Record `record` into a one-shot buffer and run it to completion
    pub fn run_single_time<R>(
        &self,
        queue: vk::Queue,
        record: impl FnOnce(vk::CommandBuffer) -> VulkanResult<R>,
    ) -> VulkanResult<R> {
        let recorder = self.begin_single_time()?;
        let command_buffer = recorder.handle();
        let recorded = record(command_buffer);
        settle_single_time(
            recorded,
            || self.end_single_time(recorder, queue),
            || self.free_command_buffers(&[command_buffer]),
        )
    }
}

// Submit a recorded one-shot buffer, or free it unsubmitted when recording failed
fn settle_single_time<R>(
    recorded: VulkanResult<R>,
    submit: impl FnOnce() -> VulkanResult<()>,
    discard: impl FnOnce(),
) -> VulkanResult<R> {
    match recorded {
        Ok(value) => submit().map(|()| value),
        Err(e) => {
            discard();
            Err(e)
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Command buffer recorder
pub struct CommandRecorder {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
}

impl CommandRecorder {
    /// Create a new command recorder
    pub const fn new(command_buffer: vk::CommandBuffer, device: Device) -> Self {
        Self {
            command_buffer,
            device,
            recording: false,
        }
    }

    /// Raw command buffer
    pub const fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Begin one-time-submit recording
    pub fn begin(&mut self) -> VulkanResult<&mut Self> {
        if self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer already recording".to_string(),
            });
        }

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        self.recording = true;
        Ok(self)
    }

    /// Begin a render pass; it ends when the returned guard drops
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) -> VulkanResult<ActiveRenderPass<'_>> {
        if !self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer not recording".to_string(),
            });
        }

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, &render_pass_begin, vk::SubpassContents::INLINE);
        }

        Ok(ActiveRenderPass { recorder: self })
    }

    /// End command recording
    pub fn end(mut self) -> VulkanResult<vk::CommandBuffer> {
        if !self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer not recording".to_string(),
            });
        }

        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }

        self.recording = false;
        Ok(self.command_buffer)
    }

    /// Bind a pipeline
    pub fn cmd_bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(self.command_buffer, bind_point, pipeline);
        }
    }

    /// Bind descriptor sets with dynamic offsets
    pub fn cmd_bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.command_buffer, bind_point, layout, 0, sets, dynamic_offsets);
        }
    }

    /// Push constants to shaders
    pub fn cmd_push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.command_buffer, layout, stage_flags, 0, data);
        }
    }
}

/// Active render pass; ends the pass on drop
pub struct ActiveRenderPass<'a> {
    recorder: &'a mut CommandRecorder,
}

impl ActiveRenderPass<'_> {
    /// Raw command buffer, for collaborators recording inside the pass
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.recorder.command_buffer
    }

    /// Bind a graphics pipeline
    pub fn cmd_bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.recorder
            .cmd_bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
    }

    /// Bind graphics descriptor sets
    pub fn cmd_bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.recorder
            .cmd_bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, layout, sets, dynamic_offsets);
    }

    /// Bind vertex buffers
    pub fn cmd_bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe {
            self.recorder
                .device
                .cmd_bind_vertex_buffers(self.recorder.command_buffer, first_binding, buffers, offsets);
        }
    }

    /// Bind index buffer
    pub fn cmd_bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe {
            self.recorder
                .device
                .cmd_bind_index_buffer(self.recorder.command_buffer, buffer, offset, index_type);
        }
    }

    /// Draw indexed
    pub fn cmd_draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        unsafe {
            self.recorder
                .device
                .cmd_draw_indexed(self.recorder.command_buffer, index_count, instance_count, 0, 0, 0);
        }
    }

    /// Non-indexed draw
    pub fn cmd_draw(&mut self, vertex_count: u32) {
        unsafe {
            self.recorder
                .device
                .cmd_draw(self.recorder.command_buffer, vertex_count, 1, 0, 0);
        }
    }

    /// Push constants to shaders
    pub fn cmd_push_constants(&mut self, layout: vk::PipelineLayout, stage_flags: vk::ShaderStageFlags, data: &[u8]) {
        self.recorder.cmd_push_constants(layout, stage_flags, data);
    }
}

impl Drop for ActiveRenderPass<'_> {
    fn drop(&mut self) {
        unsafe {
            self.recorder
                .device
                .cmd_end_render_pass(self.recorder.command_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_failed_recording_frees_without_submitting() {
        let submitted = Cell::new(false);
        let freed = Cell::new(false);

        let result: VulkanResult<()> = settle_single_time(
            Err(VulkanError::NoSuitableMemoryType),
            || {
                submitted.set(true);
                Ok(())
            },
            || freed.set(true),
        );

        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
        assert!(freed.get());
        assert!(!submitted.get());
    }

    #[test]
    fn test_successful_recording_is_submitted() {
        let freed = Cell::new(false);
        let result = settle_single_time(Ok(7), || Ok(()), || freed.set(true));
        assert_eq!(result.unwrap(), 7);
        assert!(!freed.get());

        let failed_submit: VulkanResult<u32> =
            settle_single_time(Ok(7), || Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST)), || freed.set(true));
        assert!(matches!(failed_submit, Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))));
    }
}
