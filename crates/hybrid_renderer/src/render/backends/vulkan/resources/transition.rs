//! Image layout transitions
//!
//! Only the layout pairs the renderer actually uses are supported. Each maps
//! to fixed access masks and pipeline stages; any other pair is rejected with
//! [`VulkanError::UnsupportedLayoutTransition`].

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Access masks and stages for one supported transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    /// Source access mask
    pub src_access: vk::AccessFlags,
    /// Destination access mask
    pub dst_access: vk::AccessFlags,
    /// Source pipeline stage
    pub src_stage: vk::PipelineStageFlags,
    /// Destination pipeline stage
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier parameters for `old -> new`
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> VulkanResult<TransitionMasks> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        // Textures are sampled from fragment and hit shaders
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        },
        (L::UNDEFINED, L::GENERAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        },
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
        _ => return Err(VulkanError::UnsupportedLayoutTransition { old, new }),
    };
    Ok(masks)
}

/// Record a layout transition barrier for a single-mip, single-layer image
pub fn record_transition(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> VulkanResult<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    Ok(())
}

/// Barrier between the pass that fills the offscreen image and the post pass sampling it
pub const fn offscreen_write_to_post_read(ray_traced: bool) -> TransitionMasks {
    if ray_traced {
        TransitionMasks {
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    } else {
        TransitionMasks {
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }
}

/// Barrier keeping a frame from overwriting the offscreen image while an
/// earlier post pass still samples it
pub const fn post_read_to_offscreen_write() -> TransitionMasks {
    TransitionMasks {
        src_access: vk::AccessFlags::SHADER_READ,
        dst_access: vk::AccessFlags::from_raw(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
        ),
        src_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        dst_stage: vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw()
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR.as_raw(),
        ),
    }
}

/// Record a barrier on a color image that stays in `GENERAL`
pub fn record_general_barrier(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    masks: TransitionMasks,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::GENERAL)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_transitions_use_transfer_stages() {
        let to_dst = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read =
            transition_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert!(to_read.dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(to_read.dst_stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
    }

    #[test]
    fn test_general_and_depth_transitions() {
        let general = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL).unwrap();
        assert_eq!(general.dst_access, vk::AccessFlags::empty());
        assert_eq!(general.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);

        let depth =
            transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).unwrap();
        assert_eq!(depth.dst_access, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn test_unsupported_pairs_are_rejected() {
        let pairs = [
            (vk::ImageLayout::GENERAL, vk::ImageLayout::UNDEFINED),
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR),
        ];
        for (old, new) in pairs {
            match transition_masks(old, new) {
                Err(VulkanError::UnsupportedLayoutTransition { old: o, new: n }) => {
                    assert_eq!((o, n), (old, new));
                }
                other => panic!("expected rejection for {old:?} -> {new:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_post_waits_for_whichever_path_wrote() {
        let traced = offscreen_write_to_post_read(true);
        assert_eq!(traced.src_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(traced.src_access, vk::AccessFlags::SHADER_WRITE);

        let rastered = offscreen_write_to_post_read(false);
        assert_eq!(rastered.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(rastered.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let next = post_read_to_offscreen_write();
        assert!(next.dst_stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
        assert!(next.dst_stage.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
    }
}
