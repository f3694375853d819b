//! Swapchain rebuild sequencing
//!
//! The rebuild runs in a fixed order: wait out a zero-sized framebuffer,
//! idle the device, recreate the swapchain, recreate everything sized by it,
//! then reissue scene setup. [`SwapchainBackend`] is the seam between that
//! order and the GPU objects.

use ash::vk;
use bitflags::bitflags;

use super::frame_state::{FrameEvent, FrameState, FrameStateMachine};
use crate::render::backends::vulkan::VulkanResult;
use crate::render::window::WindowEvents;

bitflags! {
    /// Why the swapchain must be rebuilt
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RebuildReason: u8 {
        /// Acquire or present returned `ERROR_OUT_OF_DATE_KHR`
        const OUT_OF_DATE = 1 << 0;
        /// Acquire or present returned `SUBOPTIMAL_KHR`
        const SUBOPTIMAL = 1 << 1;
        /// The window reported a framebuffer resize
        const RESIZED = 1 << 2;
    }
}

impl RebuildReason {
    /// Reason carried by a present result; other errors pass through
    pub fn from_present(presented: Result<bool, vk::Result>) -> Result<Self, vk::Result> {
        match presented {
            Ok(false) => Ok(Self::empty()),
            Ok(true) => Ok(Self::SUBOPTIMAL),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Self::OUT_OF_DATE),
            Err(e) => Err(e),
        }
    }
}

/// GPU side of a rebuild, called in order by [`rebuild_swapchain`]
pub trait SwapchainBackend {
    /// Block until the device has finished all submitted work
    fn wait_idle(&mut self) -> VulkanResult<()>;
    /// Replace the swapchain; returns the extent actually chosen
    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> VulkanResult<vk::Extent2D>;
    /// Recreate views, offscreen images, render passes, pipelines,
    /// framebuffers and command buffers for the new swapchain
    fn recreate_targets(&mut self) -> VulkanResult<()>;
    /// Reissue scene setup against the new targets
    fn reload_scene(&mut self) -> VulkanResult<()>;
}

/// How a rebuild attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// Swapchain recreated at this extent
    Rebuilt(vk::Extent2D),
    /// Window closed while minimized; nothing was recreated
    Closed,
}

/// Pump events until the framebuffer has a non-zero size
///
/// Returns `None` when the window is closed first.
pub fn wait_for_nonzero_size<W: WindowEvents + ?Sized>(window: &mut W) -> Option<vk::Extent2D> {
    loop {
        if window.should_close() {
            return None;
        }
        let (width, height) = window.framebuffer_size();
        if width > 0 && height > 0 {
            return Some(vk::Extent2D { width, height });
        }
        window.wait_events();
    }
}

/// Rebuild from [`FrameState::SwapchainStale`] back to [`FrameState::Idle`]
pub fn rebuild_swapchain<B, W>(
    backend: &mut B,
    window: &mut W,
    machine: &mut FrameStateMachine,
    reason: RebuildReason,
) -> VulkanResult<RebuildOutcome>
where
    B: SwapchainBackend + ?Sized,
    W: WindowEvents + ?Sized,
{
    machine.expect(FrameState::SwapchainStale)?;
    machine.apply(FrameEvent::RebuildStarted)?;
    log::info!("[SWAPCHAIN] Rebuilding: {:?}", reason);

    let Some(requested) = wait_for_nonzero_size(window) else {
        machine.apply(FrameEvent::RebuildAborted)?;
        log::info!("[SWAPCHAIN] Window closed while minimized; rebuild skipped");
        return Ok(RebuildOutcome::Closed);
    };

    backend.wait_idle()?;
    let extent = backend.recreate_swapchain(requested)?;
    backend.recreate_targets()?;
    backend.reload_scene()?;
    // Resize events seen during the wait are covered by this rebuild
    window.take_resized();

    machine.apply(FrameEvent::RebuildComplete)?;
    log::info!("[SWAPCHAIN] Rebuilt at {}x{}", extent.width, extent.height);
    Ok(RebuildOutcome::Rebuilt(extent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::vulkan::state::targets::SwapchainTargets;
    use crate::render::backends::vulkan::VulkanError;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Window whose size steps through a script on each event wait
    struct ScriptedWindow {
        sizes: VecDeque<(u32, u32)>,
        current: (u32, u32),
        close_when_exhausted: bool,
        closed: bool,
        resized: bool,
        waits: usize,
    }

    impl ScriptedWindow {
        fn new(sizes: &[(u32, u32)]) -> Self {
            let mut sizes: VecDeque<_> = sizes.iter().copied().collect();
            let current = sizes.pop_front().unwrap_or((0, 0));
            Self {
                sizes,
                current,
                close_when_exhausted: false,
                closed: false,
                resized: true,
                waits: 0,
            }
        }
    }

    impl WindowEvents for ScriptedWindow {
        fn framebuffer_size(&self) -> (u32, u32) {
            self.current
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            match self.sizes.pop_front() {
                Some(size) => {
                    self.current = size;
                    self.resized = true;
                }
                None if self.close_when_exhausted => self.closed = true,
                None => {}
            }
        }

        fn should_close(&self) -> bool {
            self.closed
        }

        fn take_resized(&mut self) -> bool {
            std::mem::take(&mut self.resized)
        }
    }

    struct Framebuffer {
        live: Rc<Cell<usize>>,
    }

    impl Drop for Framebuffer {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    #[derive(Default)]
    struct MockBackend {
        calls: Vec<&'static str>,
        extent: Option<vk::Extent2D>,
        image_count: usize,
        swapchains_created: usize,
        live_framebuffers: Rc<Cell<usize>>,
        targets: SwapchainTargets<Framebuffer>,
        scene_loads: usize,
        fail_swapchain: bool,
    }

    impl SwapchainBackend for MockBackend {
        fn wait_idle(&mut self) -> VulkanResult<()> {
            self.calls.push("wait_idle");
            Ok(())
        }

        fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> VulkanResult<vk::Extent2D> {
            self.calls.push("swapchain");
            if self.fail_swapchain {
                return Err(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR));
            }
            self.swapchains_created += 1;
            self.extent = Some(extent);
            self.image_count = 3;
            Ok(extent)
        }

        fn recreate_targets(&mut self) -> VulkanResult<()> {
            self.calls.push("targets");
            let live = Rc::clone(&self.live_framebuffers);
            self.targets.rebuild(self.image_count, &mut |_: usize| -> VulkanResult<Framebuffer> {
                live.set(live.get() + 1);
                Ok(Framebuffer { live: Rc::clone(&live) })
            })
        }

        fn reload_scene(&mut self) -> VulkanResult<()> {
            self.calls.push("scene");
            self.scene_loads += 1;
            Ok(())
        }
    }

    fn stale_machine() -> FrameStateMachine {
        let mut machine = FrameStateMachine::new();
        machine.apply(FrameEvent::BeginFrame).unwrap();
        machine.apply(FrameEvent::SwapchainStale).unwrap();
        machine
    }

    #[test]
    fn test_reason_from_present_result() {
        assert_eq!(
            RebuildReason::from_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(RebuildReason::OUT_OF_DATE)
        );
        assert_eq!(RebuildReason::from_present(Ok(true)), Ok(RebuildReason::SUBOPTIMAL));
        assert_eq!(RebuildReason::from_present(Ok(false)), Ok(RebuildReason::empty()));
        assert_eq!(
            RebuildReason::from_present(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
    }

    #[test]
    fn test_resize_through_zero_ends_idle_at_new_extent() {
        let mut window = ScriptedWindow::new(&[(0, 0), (1280, 720)]);
        let mut backend = MockBackend::default();
        let mut machine = stale_machine();

        let outcome = rebuild_swapchain(&mut backend, &mut window, &mut machine, RebuildReason::RESIZED).unwrap();

        let expected = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        assert_eq!(outcome, RebuildOutcome::Rebuilt(expected));
        assert_eq!(machine.state(), FrameState::Idle);
        assert_eq!(backend.extent, Some(expected));
        assert_eq!(window.waits, 1);
        assert_eq!(backend.swapchains_created, 1);
        assert_eq!(backend.live_framebuffers.get(), 3);
        assert!(!window.take_resized());
    }

    #[test]
    fn test_rebuild_runs_steps_in_order() {
        let mut window = ScriptedWindow::new(&[(800, 600)]);
        let mut backend = MockBackend::default();
        let mut machine = stale_machine();
        rebuild_swapchain(&mut backend, &mut window, &mut machine, RebuildReason::OUT_OF_DATE).unwrap();
        assert_eq!(backend.calls, vec!["wait_idle", "swapchain", "targets", "scene"]);
    }

    #[test]
    fn test_repeated_rebuilds_do_not_accumulate() {
        let mut window = ScriptedWindow::new(&[(800, 600)]);
        let mut backend = MockBackend::default();
        let mut machine = FrameStateMachine::new();

        for _ in 0..4 {
            machine.apply(FrameEvent::BeginFrame).unwrap();
            machine.apply(FrameEvent::SwapchainStale).unwrap();
            rebuild_swapchain(&mut backend, &mut window, &mut machine, RebuildReason::SUBOPTIMAL).unwrap();
        }
        assert_eq!(backend.live_framebuffers.get(), 3);
        assert_eq!(backend.targets.len(), 3);
        assert_eq!(backend.targets.generation(), 4);
        assert_eq!(backend.scene_loads, 4);
    }

    #[test]
    fn test_close_while_minimized_skips_rebuild() {
        let mut window = ScriptedWindow::new(&[(0, 0)]);
        window.close_when_exhausted = true;
        let mut backend = MockBackend::default();
        let mut machine = stale_machine();

        let outcome = rebuild_swapchain(&mut backend, &mut window, &mut machine, RebuildReason::RESIZED).unwrap();
        assert_eq!(outcome, RebuildOutcome::Closed);
        assert_eq!(machine.state(), FrameState::SwapchainStale);
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn test_rebuild_requires_stale_state() {
        let mut window = ScriptedWindow::new(&[(800, 600)]);
        let mut backend = MockBackend::default();
        let mut machine = FrameStateMachine::new();
        assert!(rebuild_swapchain(&mut backend, &mut window, &mut machine, RebuildReason::RESIZED).is_err());
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn test_swapchain_failure_propagates() {
        let mut window = ScriptedWindow::new(&[(800, 600)]);
        let mut backend = MockBackend {
            fail_swapchain: true,
            ..MockBackend::default()
        };
        let mut machine = stale_machine();
        assert!(rebuild_swapchain(&mut backend, &mut window, &mut machine, RebuildReason::RESIZED).is_err());
        assert_eq!(machine.state(), FrameState::Rebuilding);
    }
}
