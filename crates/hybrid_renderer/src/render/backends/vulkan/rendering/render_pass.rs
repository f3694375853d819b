//! Render passes and framebuffers
//!
//! Every pass has one subpass and one external dependency gating color
//! attachment reads and writes. A [`RenderPassDesc`] holds the attachment
//! choices so the three pass shapes the renderer uses can be checked
//! without a device:
//!
//! | Pass      | Attachments                                 | Color layouts                      |
//! |-----------|---------------------------------------------|------------------------------------|
//! | offscreen | MSAA RGBA32F, MSAA depth, resolved RGBA32F  | GENERAL -> GENERAL                 |
//! | post      | swapchain color, depth                      | UNDEFINED -> COLOR_ATTACHMENT      |
//! | ui        | swapchain color, loaded                     | COLOR_ATTACHMENT -> PRESENT_SRC    |

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Format of the HDR offscreen target shared by raster and ray tracing
pub const OFFSCREEN_COLOR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// One attachment of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentSpec {
    /// Pixel format
    pub format: vk::Format,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// What happens to existing contents on entry
    pub load_op: vk::AttachmentLoadOp,
    /// Whether contents survive the pass
    pub store_op: vk::AttachmentStoreOp,
    /// Layout on entry
    pub initial_layout: vk::ImageLayout,
    /// Layout on exit
    pub final_layout: vk::ImageLayout,
}

impl AttachmentSpec {
    fn describe(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }
}

/// Color attachment, then optional depth, then optional single-sample resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Attachment 0
    pub color: AttachmentSpec,
    /// Attachment 1 when present
    pub depth: Option<AttachmentSpec>,
    /// Last attachment when present; resolves `color`
    pub resolve: Option<AttachmentSpec>,
}

impl RenderPassDesc {
    /// General builder: color and depth share `samples`; a resolve target
    /// copies the color format and layouts at one sample
    pub fn new(
        color_format: vk::Format,
        samples: vk::SampleCountFlags,
        clear_color: bool,
        color_layouts: (vk::ImageLayout, vk::ImageLayout),
        depth: Option<(vk::Format, bool, vk::ImageLayout, vk::ImageLayout)>,
        resolve: bool,
    ) -> Self {
        let color = AttachmentSpec {
            format: color_format,
            samples,
            load_op: if clear_color {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            },
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: color_layouts.0,
            final_layout: color_layouts.1,
        };

        let depth = depth.map(|(format, clear, initial_layout, final_layout)| AttachmentSpec {
            format,
            samples,
            load_op: if clear {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            },
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout,
            final_layout,
        });

        let resolve = resolve.then_some(AttachmentSpec {
            samples: vk::SampleCountFlags::TYPE_1,
            ..color
        });

        Self { color, depth, resolve }
    }

    /// HDR target written by raster or ray tracing and sampled by the post pass
    ///
    /// At one sample the color attachment is the sampled image and there is
    /// no resolve target.
    pub fn offscreen(samples: vk::SampleCountFlags, depth_format: vk::Format) -> Self {
        let depth_layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        Self::new(
            OFFSCREEN_COLOR_FORMAT,
            samples,
            true,
            (vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL),
            Some((depth_format, true, depth_layout, depth_layout)),
            samples != vk::SampleCountFlags::TYPE_1,
        )
    }

    /// Tone-map pass onto the swapchain image
    pub fn post(swapchain_format: vk::Format, depth_format: vk::Format) -> Self {
        Self::new(
            swapchain_format,
            vk::SampleCountFlags::TYPE_1,
            true,
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            Some((
                depth_format,
                true,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )),
            false,
        )
    }

    /// Overlay pass drawn over the post result, ending ready to present
    pub fn ui(swapchain_format: vk::Format) -> Self {
        Self::new(
            swapchain_format,
            vk::SampleCountFlags::TYPE_1,
            false,
            (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
            None,
            false,
        )
    }

    /// Attachment descriptions in framebuffer order
    pub fn attachments(&self) -> Vec<vk::AttachmentDescription> {
        std::iter::once(&self.color)
            .chain(self.depth.as_ref())
            .chain(self.resolve.as_ref())
            .map(AttachmentSpec::describe)
            .collect()
    }

    /// Number of image views a framebuffer for this pass needs
    pub fn attachment_count(&self) -> usize {
        1 + usize::from(self.depth.is_some()) + usize::from(self.resolve.is_some())
    }

    /// Clear values in attachment order
    pub fn clear_values(&self, color: [f32; 4]) -> Vec<vk::ClearValue> {
        let color = vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        };
        let depth = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        };
        std::iter::once(color)
            .chain(self.depth.map(|_| depth))
            .chain(self.resolve.map(|_| color))
            .collect()
    }

    /// Reference to attachment 0
    pub const fn color_reference() -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    /// Reference to the depth attachment
    pub fn depth_reference(&self) -> Option<vk::AttachmentReference> {
        self.depth.map(|_| vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        })
    }

    /// Reference to the resolve attachment, which follows depth
    pub fn resolve_reference(&self) -> Option<vk::AttachmentReference> {
        self.resolve.map(|_| vk::AttachmentReference {
            attachment: 1 + u32::from(self.depth.is_some()),
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
    }

    /// The single external-to-subpass-0 dependency
    pub fn dependency() -> vk::SubpassDependency {
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build()
    }
}

/// Render pass wrapper with RAII cleanup
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
    desc: RenderPassDesc,
}

impl RenderPass {
    /// Create the pass described by `desc`
    pub fn new(device: Device, desc: RenderPassDesc) -> VulkanResult<Self> {
        let attachments = desc.attachments();
        let color_refs = [RenderPassDesc::color_reference()];
        let depth_ref = desc.depth_reference();
        let resolve_refs: Vec<vk::AttachmentReference> = desc.resolve_reference().into_iter().collect();

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass.build()];
        let dependencies = [RenderPassDesc::dependency()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { device.create_render_pass(&create_info, None) }.map_err(VulkanError::Api)?;
        log::debug!(
            "[PASS] Render pass with {} attachments, color {:?}",
            attachments.len(),
            desc.color.format
        );

        Ok(Self {
            device,
            render_pass,
            desc,
        })
    }

    /// Get the render pass handle
    pub const fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Attachments the pass was built from
    pub const fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Framebuffer wrapper with RAII cleanup
pub struct Framebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
}

impl Framebuffer {
    /// Framebuffer for `render_pass`; `attachments` must follow its attachment order
    pub fn new(device: Device, render_pass: &RenderPass, attachments: &[vk::ImageView], extent: vk::Extent2D) -> VulkanResult<Self> {
        let expected = render_pass.desc().attachment_count();
        if attachments.len() != expected {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Framebuffer needs {expected} attachments, got {}", attachments.len()),
            });
        }

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe { device.create_framebuffer(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device, framebuffer })
    }

    /// Get the framebuffer handle
    pub const fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWAPCHAIN: vk::Format = vk::Format::B8G8R8A8_UNORM;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    #[test]
    fn test_offscreen_pass_resolves_msaa_hdr_color() {
        let desc = RenderPassDesc::offscreen(vk::SampleCountFlags::TYPE_8, DEPTH);
        let attachments = desc.attachments();

        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].format, OFFSCREEN_COLOR_FORMAT);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachments[0].initial_layout, vk::ImageLayout::GENERAL);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::GENERAL);

        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(attachments[1].store_op, vk::AttachmentStoreOp::DONT_CARE);

        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].format, OFFSCREEN_COLOR_FORMAT);
        assert_eq!(attachments[2].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(desc.resolve_reference().map(|r| r.attachment), Some(2));
        assert_eq!(desc.clear_values([0.0; 4]).len(), 3);
    }

    #[test]
    fn test_single_sample_offscreen_pass_has_no_resolve() {
        let desc = RenderPassDesc::offscreen(vk::SampleCountFlags::TYPE_1, DEPTH);
        assert_eq!(desc.attachment_count(), 2);
        assert!(desc.resolve_reference().is_none());
    }

    #[test]
    fn test_post_pass_clears_swapchain_and_depth() {
        let desc = RenderPassDesc::post(SWAPCHAIN, DEPTH);
        let attachments = desc.attachments();

        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].format, SWAPCHAIN);
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachments[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(attachments[1].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(desc.depth_reference().map(|r| r.attachment), Some(1));
        assert!(desc.resolve_reference().is_none());
    }

    #[test]
    fn test_ui_pass_keeps_contents_and_ends_presentable() {
        let desc = RenderPassDesc::ui(SWAPCHAIN);
        let attachments = desc.attachments();

        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(attachments[0].initial_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(desc.attachment_count(), 1);
        assert!(desc.depth_reference().is_none());
    }

    #[test]
    fn test_dependency_gates_color_attachment_access() {
        let dependency = RenderPassDesc::dependency();
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert_eq!(dependency.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(
            dependency.dst_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(dependency.dst_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }
}
