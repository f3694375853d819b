//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! Each frame slot owns a semaphore pair and a fence. Swapchain images are
//! tracked separately: an image acquired again while an older frame still
//! renders into it must wait on the fence of the slot that last used it.

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.create_semaphore(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub const fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { device.create_fence(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device, fence })
    }

    /// Block until the fence signals; expiry of `timeout_ns` is an error
    pub fn wait(&self, timeout_ns: u64) -> VulkanResult<()> {
        let result = unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) };
        fence_wait_result(result, timeout_ns)
    }

    /// Reset to unsignaled
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }.map_err(VulkanError::Api)
    }

    /// Get the fence handle
    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Map a raw fence wait result, turning `TIMEOUT` into [`VulkanError::FenceTimeout`]
pub fn fence_wait_result(result: Result<(), vk::Result>, timeout_ns: u64) -> VulkanResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => {
            log::error!("[FRAME] Fence wait exceeded {} ns", timeout_ns);
            Err(VulkanError::FenceTimeout { timeout_ns })
        }
        Err(e) => Err(VulkanError::Api(e)),
    }
}

/// Synchronization objects of one frame slot
pub struct FrameSlot {
    /// Signaled when the acquired swapchain image is ready
    pub image_available: Semaphore,
    /// Signaled when the frame's commands finish
    pub render_finished: Semaphore,
    /// Signaled when the slot's submission completes; created signaled
    pub in_flight: Fence,
}

impl FrameSlot {
    /// Create the slot's semaphores and a signaled fence
    pub fn new(device: &Device) -> VulkanResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device.clone(), true)?,
        })
    }
}

/// Which frame slot each swapchain image was last submitted under
///
/// Pure bookkeeping; the fences themselves live in [`FrameSync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlots {
    slot_count: usize,
    current: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FrameSlots {
    /// `slot_count` slots, at least one, over `image_count` swapchain images
    pub fn new(slot_count: usize, image_count: usize) -> Self {
        Self {
            slot_count: slot_count.max(1),
            current: 0,
            images_in_flight: vec![None; image_count],
        }
    }

    /// Number of frame slots
    pub const fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Slot recording the current frame
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Move to the next slot after a present
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slot_count;
    }

    /// Forget every image after the swapchain was recreated
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
    }

    /// Mark `image` as in flight under the current slot
    ///
    /// Returns the slot whose fence guarded the image before, if any.
    pub fn claim_image(&mut self, image: usize) -> VulkanResult<Option<usize>> {
        let count = self.images_in_flight.len();
        let entry = self
            .images_in_flight
            .get_mut(image)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("Swapchain image {image} out of range ({count} images)"),
            })?;
        Ok(entry.replace(self.current))
    }
}

/// Frame slots plus their image bookkeeping
pub struct FrameSync {
    slots: Vec<FrameSlot>,
    tracker: FrameSlots,
}

impl FrameSync {
    /// Create `slot_count` frame slots for a swapchain of `image_count` images
    pub fn new(device: &Device, slot_count: usize, image_count: usize) -> VulkanResult<Self> {
        let tracker = FrameSlots::new(slot_count, image_count);
        let slots = (0..tracker.slot_count())
            .map(|_| FrameSlot::new(device))
            .collect::<VulkanResult<Vec<_>>>()?;
        log::debug!("[FRAME] {} frame slots over {} images", slots.len(), image_count);
        Ok(Self { slots, tracker })
    }

    /// Synchronization objects of the current slot
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.tracker.current()]
    }

    /// Index of the current slot
    pub const fn current_index(&self) -> usize {
        self.tracker.current()
    }

    /// Wait for the current slot's previous submission
    pub fn wait_current(&self, timeout_ns: u64) -> VulkanResult<()> {
        self.current().in_flight.wait(timeout_ns)
    }

    /// Wait for whichever slot last rendered into `image`, then claim it
    pub fn claim_image(&mut self, image: usize, timeout_ns: u64) -> VulkanResult<()> {
        if let Some(previous) = self.tracker.claim_image(image)? {
            self.slots[previous].in_flight.wait(timeout_ns)?;
        }
        Ok(())
    }

    /// Advance to the next slot
    pub fn advance(&mut self) {
        self.tracker.advance();
    }

    /// Forget image ownership after a swapchain rebuild
    pub fn reset_images(&mut self, image_count: usize) {
        self.tracker.reset_images(image_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_becomes_fence_timeout() {
        assert!(fence_wait_result(Ok(()), 10).is_ok());
        assert!(matches!(
            fence_wait_result(Err(vk::Result::TIMEOUT), 10),
            Err(VulkanError::FenceTimeout { timeout_ns: 10 })
        ));
        assert!(matches!(
            fence_wait_result(Err(vk::Result::ERROR_DEVICE_LOST), 10),
            Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn test_slots_wrap_around() {
        let mut slots = FrameSlots::new(2, 3);
        assert_eq!(slots.current(), 0);
        slots.advance();
        assert_eq!(slots.current(), 1);
        slots.advance();
        assert_eq!(slots.current(), 0);
    }

    #[test]
    fn test_single_slot_never_moves() {
        let mut slots = FrameSlots::new(0, 2);
        assert_eq!(slots.slot_count(), 1);
        slots.advance();
        assert_eq!(slots.current(), 0);
    }

    #[test]
    fn test_claim_reports_previous_owner() {
        let mut slots = FrameSlots::new(2, 3);
        assert_eq!(slots.claim_image(1).unwrap(), None);
        slots.advance();
        assert_eq!(slots.claim_image(1).unwrap(), Some(0));
        assert_eq!(slots.claim_image(1).unwrap(), Some(1));
        assert_eq!(slots.claim_image(0).unwrap(), None);
    }

    #[test]
    fn test_claim_out_of_range_image_fails() {
        let mut slots = FrameSlots::new(1, 2);
        assert!(slots.claim_image(2).is_err());
    }

    #[test]
    fn test_reset_images_forgets_owners() {
        let mut slots = FrameSlots::new(1, 2);
        slots.claim_image(0).unwrap();
        slots.reset_images(3);
        assert_eq!(slots.claim_image(0).unwrap(), None);
        assert_eq!(slots.claim_image(2).unwrap(), None);
    }
}
