//! Graphics pipeline creation
//!
//! Both graphics pipelines (offscreen raster and the full-screen post pass)
//! share one fixed-function shape: triangle list, viewport and scissor baked
//! from the extent, LESS depth compare with writes, and a single unblended
//! color attachment. Pipelines are rebuilt when the swapchain changes size.

use ash::{vk, Device};

use super::shader::ShaderModule;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Pipeline layout wrapper with RAII cleanup
pub struct PipelineLayout {
    device: Device,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Layout over `set_layouts` in set order plus `push_constants`
    pub fn new(
        device: &Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VulkanResult<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self {
            device: device.clone(),
            layout,
        })
    }

    /// Layout handle
    pub const fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Sample count flag for a power-of-two count; other values map to one sample
pub const fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        64 => vk::SampleCountFlags::TYPE_64,
        32 => vk::SampleCountFlags::TYPE_32,
        16 => vk::SampleCountFlags::TYPE_16,
        8 => vk::SampleCountFlags::TYPE_8,
        4 => vk::SampleCountFlags::TYPE_4,
        2 => vk::SampleCountFlags::TYPE_2,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

/// Highest sample count not above `requested` that `supported` contains
pub fn clamp_samples(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [64, 32, 16, 8, 4, 2]
        .into_iter()
        .filter(|&count| count <= requested)
        .map(sample_count_flags)
        .find(|&flag| supported.contains(flag))
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Viewport and scissor covering `extent`
#[allow(clippy::cast_precision_loss)]
pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// Depth state: LESS with writes when enabled, fully off otherwise
pub fn depth_stencil_state(depth_test: bool) -> vk::PipelineDepthStencilStateCreateInfo {
    vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_test)
        .depth_write_enable(depth_test)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .build()
}

/// Configures and creates a [`GraphicsPipeline`]
pub struct GraphicsPipelineBuilder<'a> {
    vertex_shader: &'a ShaderModule,
    fragment_shader: &'a ShaderModule,
    extent: vk::Extent2D,
    cull_mode: vk::CullModeFlags,
    samples: vk::SampleCountFlags,
    depth_test: bool,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl<'a> GraphicsPipelineBuilder<'a> {
    /// Start from back-face culling, one sample, depth test on, no vertex input
    pub fn new(vertex_shader: &'a ShaderModule, fragment_shader: &'a ShaderModule, extent: vk::Extent2D) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            extent,
            cull_mode: vk::CullModeFlags::BACK,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: true,
            bindings: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Face culling
    #[must_use]
    pub fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    /// Rasterization samples; must match the render pass attachments
    #[must_use]
    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Toggle the depth test and depth writes together
    #[must_use]
    pub fn depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self
    }

    /// Vertex buffer layout; leave unset for generated full-screen geometry
    #[must_use]
    pub fn vertex_input(
        mut self,
        bindings: &[vk::VertexInputBindingDescription],
        attributes: &[vk::VertexInputAttributeDescription],
    ) -> Self {
        self.bindings = bindings.to_vec();
        self.attributes = attributes.to_vec();
        self
    }

    /// Create the pipeline for subpass 0 of `render_pass`
    pub fn build(
        self,
        device: &Device,
        render_pass: vk::RenderPass,
        layout: PipelineLayout,
    ) -> VulkanResult<GraphicsPipeline> {
        let shader_stages = [
            self.vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX),
            self.fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&self.bindings)
            .vertex_attribute_descriptions(&self.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let (viewport, scissor) = full_viewport(self.extent);
        let viewports = [viewport];
        let scissors = [scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(self.samples);

        let depth_stencil = depth_stencil_state(self.depth_test);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout.handle())
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
                .map_err(|(_, err)| {
                    log::error!("[PIPELINE] Graphics pipeline creation failed: {:?}", err);
                    VulkanError::Api(err)
                })?
        };
        let pipeline = pipelines.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Driver returned no graphics pipeline".to_string(),
        })?;

        log::debug!(
            "[PIPELINE] Graphics pipeline {}x{}, {:?} samples, depth test {}",
            self.extent.width,
            self.extent.height,
            self.samples,
            self.depth_test
        );

        Ok(GraphicsPipeline {
            device: device.clone(),
            pipeline,
            layout,
        })
    }
}

/// Graphics pipeline wrapper with RAII cleanup; owns its layout
pub struct GraphicsPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: PipelineLayout,
}

impl GraphicsPipeline {
    /// Get pipeline handle
    pub const fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        log::debug!("[PIPELINE] Dropping GraphicsPipeline {:?}", self.pipeline);
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sample_count_flags() {
        assert_eq!(sample_count_flags(8), vk::SampleCountFlags::TYPE_8);
        assert_eq!(sample_count_flags(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(3), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn test_clamp_samples_picks_highest_supported() {
        let supported = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(clamp_samples(8, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_samples(2, supported), vk::SampleCountFlags::TYPE_2);
        assert_eq!(clamp_samples(1, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(clamp_samples(8, vk::SampleCountFlags::TYPE_1), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn test_full_viewport_matches_extent() {
        let (viewport, scissor) = full_viewport(vk::Extent2D { width: 1280, height: 720 });
        assert_relative_eq!(viewport.width, 1280.0);
        assert_relative_eq!(viewport.height, 720.0);
        assert_relative_eq!(viewport.max_depth, 1.0);
        assert_eq!(scissor.extent.width, 1280);
        assert_eq!(scissor.offset.x, 0);
    }

    #[test]
    fn test_depth_state_toggles_test_and_write_together() {
        let on = depth_stencil_state(true);
        assert_eq!(on.depth_test_enable, vk::TRUE);
        assert_eq!(on.depth_write_enable, vk::TRUE);
        assert_eq!(on.depth_compare_op, vk::CompareOp::LESS);

        let off = depth_stencil_state(false);
        assert_eq!(off.depth_test_enable, vk::FALSE);
        assert_eq!(off.depth_write_enable, vk::FALSE);
    }
}
