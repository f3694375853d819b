//! Overlay UI hook
//!
//! The overlay's own rendering lives outside the renderer. The renderer opens
//! the UI pass on the frame's command buffer and hands it over; the overlay
//! appends draw commands and returns.

use ash::{vk, Device};

/// Recording target handed to an overlay
pub struct OverlayTarget<'a> {
    /// Device the command buffer belongs to
    pub device: &'a Device,
    /// Command buffer inside the begun UI render pass
    pub command_buffer: vk::CommandBuffer,
    /// Swapchain extent
    pub extent: vk::Extent2D,
}

/// Appends UI draw commands on top of the composited frame
pub trait OverlayRenderer {
    /// Record draw commands. The UI pass is already begun and must not be ended.
    fn record(&mut self, target: &OverlayTarget<'_>);
}

/// Overlay that draws nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverlay;

impl OverlayRenderer for NoOverlay {
    fn record(&mut self, _target: &OverlayTarget<'_>) {}
}
